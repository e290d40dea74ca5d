use mac_address::MacAddress;
use serde_derive::Deserialize;

use crate::scanner::ScanMode;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub devices: Option<Vec<BleDevice>>,
    pub scan: Option<ScanConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
pub enum Manufacturer {
    Apple,
    Google,
}

impl Manufacturer {
    /// https://bitbucket.org/bluetooth-SIG/public/src/main/assigned_numbers/company_identifiers/company_identifiers.yaml
    pub fn company_ids(&self) -> Vec<u16> {
        match self {
            Manufacturer::Apple => vec![0x004C],
            Manufacturer::Google => vec![0x018E, 0x00E0],
        }
    }
}

/// A known device; gives a friendly name to an address we expect to see.
#[derive(Deserialize, Debug, Clone)]
pub struct BleDevice {
    pub address: MacAddress,
    pub name: String,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ScanConfig {
    /// Initial scan mode; adjustable at runtime over MQTT.
    pub mode: Option<ScanMode>,
    /// Only advertisements from these manufacturers are decoded into
    /// devices. Unset means everything is accepted.
    pub manufacturers: Option<Vec<Manufacturer>>,
}
