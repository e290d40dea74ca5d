use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use crate::config::AppConfig;

/// One group of raw discovery events delivered together by the scanner.
pub type RawBatch = Vec<RawDiscoveryEvent>;

/// A single advertisement as reported by the scanner, before decoding.
#[derive(Debug, Clone)]
pub struct RawDiscoveryEvent {
    /// Physical address, stable per device for the session.
    pub address: String,
    pub rssi: i16,
    /// Monotonic arrival time in nanoseconds since the scanner started.
    pub timestamp_nanos: u64,
    pub local_name: Option<String>,
    /// Opaque advertisement payload, keyed by company identifier.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

/// Logical device identity used to deduplicate across time. Derived by the
/// decoder; may differ from the raw physical address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }

    pub fn from_address(address: &str) -> Self {
        DeviceId(address.to_lowercase())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A successfully decoded device. `last_seen` is assigned at decode time,
/// not from the raw arrival timestamp.
#[derive(Debug, Clone)]
pub struct DecodedDevice {
    pub id: DeviceId,
    pub name: Option<String>,
    pub address: String,
    pub rssi: i16,
    pub last_seen: Instant,
}

/// Turns a raw discovery event into a typed device record. Decoding is
/// lossy: unrecognized advertisements yield `None` and are dropped.
pub trait DeviceDecoder: Send + Sync {
    fn decode(&self, event: &RawDiscoveryEvent) -> Option<DecodedDevice>;
}

/// Reference decoder: recognizes advertisements carrying manufacturer data
/// from a configured set of company identifiers and attaches friendly names
/// for known addresses. Payload contents are never interpreted.
pub struct ManufacturerDecoder {
    company_ids: Vec<u16>,
    names: HashMap<String, String>,
}

impl ManufacturerDecoder {
    pub fn new(company_ids: Vec<u16>, names: HashMap<String, String>) -> Self {
        ManufacturerDecoder { company_ids, names }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let company_ids = config
            .scan
            .as_ref()
            .and_then(|scan| scan.manufacturers.as_ref())
            .map(|manufacturers| {
                manufacturers
                    .iter()
                    .flat_map(|m| m.company_ids())
                    .collect()
            })
            .unwrap_or_default();

        let names = config
            .devices
            .iter()
            .flatten()
            .map(|device| (device.address.to_string().to_lowercase(), device.name.clone()))
            .collect();

        ManufacturerDecoder { company_ids, names }
    }
}

impl DeviceDecoder for ManufacturerDecoder {
    fn decode(&self, event: &RawDiscoveryEvent) -> Option<DecodedDevice> {
        // An empty filter recognizes everything.
        let recognized = self.company_ids.is_empty()
            || event
                .manufacturer_data
                .keys()
                .any(|company_id| self.company_ids.contains(company_id));
        if !recognized {
            return None;
        }

        let key = event.address.to_lowercase();
        let name = self.names.get(&key).cloned().or_else(|| event.local_name.clone());

        Some(DecodedDevice {
            id: DeviceId::from_address(&event.address),
            name,
            address: event.address.clone(),
            rssi: event.rssi,
            last_seen: Instant::now(),
        })
    }
}
