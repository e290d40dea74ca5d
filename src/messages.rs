use serde_derive::Serialize;

use crate::device::DecodedDevice;
use crate::scanner::ScanMode;

/// Settings changes received over MQTT.
#[derive(Clone, Debug)]
pub enum SettingsCommand {
    SetMode(ScanMode),
}

/// Wire form of one present device.
#[derive(Debug, Serialize)]
pub struct DeviceReport {
    pub id: String,
    pub name: Option<String>,
    pub address: String,
    pub rssi: i16,
    /// Milliseconds since this device was last seen.
    pub last_seen_ms: u64,
}

impl DeviceReport {
    pub fn new(device: &DecodedDevice) -> Self {
        DeviceReport {
            id: device.id.to_string(),
            name: device.name.clone(),
            address: device.address.clone(),
            rssi: device.rssi,
            last_seen_ms: device.last_seen.elapsed().as_millis() as u64,
        }
    }
}

/// Wire form of one presence snapshot.
#[derive(Debug, Serialize)]
pub struct PresenceReport {
    pub count: usize,
    pub devices: Vec<DeviceReport>,
}

impl PresenceReport {
    pub fn new(devices: &[DecodedDevice]) -> Self {
        PresenceReport {
            count: devices.len(),
            devices: devices.iter().map(DeviceReport::new).collect(),
        }
    }
}
