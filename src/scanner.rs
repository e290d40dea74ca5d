use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use btleplug::api::{Central as _, CentralEvent, CentralState, Peripheral as _, ScanFilter};
use btleplug::platform::Adapter;
use futures::SinkExt as _;
use futures::StreamExt as _;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use log::{debug, info};
use serde_derive::Deserialize;

use crate::device::{RawBatch, RawDiscoveryEvent};
use crate::settings::Settings;

/// Scan intensity requested from the underlying scanner.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    LowPower,
    #[default]
    Balanced,
    LowLatency,
}

impl ScanMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "low_power" => Some(ScanMode::LowPower),
            "balanced" => Some(ScanMode::Balanced),
            "low_latency" => Some(ScanMode::LowLatency),
            _ => None,
        }
    }

    /// How long discoveries are collected before a batch is delivered.
    fn delivery_window(self) -> Duration {
        match self {
            ScanMode::LowPower => Duration::from_secs(5),
            ScanMode::Balanced => Duration::from_secs(1),
            ScanMode::LowLatency => Duration::ZERO,
        }
    }
}

/// Source of raw discovery batches. Subscriptions are lazy and cancelled by
/// dropping the returned stream; an `Err` item is a terminal failure of that
/// subscription.
pub trait Scanner: Send + Sync {
    fn subscribe(&self, mode: ScanMode) -> BoxStream<'static, Result<RawBatch>>;
}

/// btleplug-backed scanner. Adapter advertisement events are collected over
/// a mode-dependent delivery window and emitted as one batch per cycle.
pub struct BleScanner {
    adapter: Adapter,
    epoch: Instant,
}

impl BleScanner {
    pub fn new(adapter: Adapter) -> Self {
        BleScanner {
            adapter,
            epoch: Instant::now(),
        }
    }
}

impl Scanner for BleScanner {
    fn subscribe(&self, mode: ScanMode) -> BoxStream<'static, Result<RawBatch>> {
        let adapter = self.adapter.clone();
        let epoch = self.epoch;
        let (mut tx, rx) = mpsc::channel(8);

        tokio::spawn(async move {
            debug!("Starting scan subscription in {mode:?} mode");
            if let Err(err) = scan_loop(&adapter, epoch, mode, &mut tx).await {
                // Terminal scanner failure; the receiver may already be gone.
                let _ = tx.send(Err(err)).await;
            }
            // On cancellation a replacement subscription may already be
            // scanning; leave the adapter alone in that case.
            if !tx.is_closed() {
                if let Err(err) = adapter.stop_scan().await {
                    debug!("Error stopping scan: {err:?}");
                }
            }
            debug!("Scan subscription ended");
        });

        rx.boxed()
    }
}

async fn scan_loop(
    adapter: &Adapter,
    epoch: Instant,
    mode: ScanMode,
    tx: &mut mpsc::Sender<Result<RawBatch>>,
) -> Result<()> {
    let mut events = adapter.events().await?;
    adapter.start_scan(ScanFilter::default()).await?;

    let window = mode.delivery_window();
    let mut stream_open = true;

    while stream_open {
        let Some(event) = events.next().await else {
            break;
        };
        let Some(first) = raw_event(adapter, epoch, event).await else {
            continue;
        };

        let mut batch = vec![first];
        if !window.is_zero() {
            let cycle_end = tokio::time::Instant::now() + window;
            loop {
                match tokio::time::timeout_at(cycle_end, events.next()).await {
                    Ok(Some(event)) => {
                        if let Some(raw) = raw_event(adapter, epoch, event).await {
                            batch.push(raw);
                        }
                    }
                    Ok(None) => {
                        stream_open = false;
                        break;
                    }
                    // Delivery window elapsed
                    Err(_) => break,
                }
            }
        }

        if tx.send(Ok(batch)).await.is_err() {
            // Receiver dropped: subscription was cancelled.
            return Ok(());
        }
    }

    Ok(())
}

async fn raw_event(
    adapter: &Adapter,
    epoch: Instant,
    event: CentralEvent,
) -> Option<RawDiscoveryEvent> {
    let id = match event {
        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
        CentralEvent::ManufacturerDataAdvertisement { id, .. } => id,
        _ => return None,
    };

    let peripheral = match adapter.peripheral(&id).await {
        Ok(peripheral) => peripheral,
        Err(err) => {
            debug!("Peripheral {id:?} vanished before lookup: {err:?}");
            return None;
        }
    };
    let properties = match peripheral.properties().await {
        Ok(Some(properties)) => properties,
        Ok(None) => return None,
        Err(err) => {
            debug!("Error reading properties for {id:?}: {err:?}");
            return None;
        }
    };
    let rssi = properties.rssi?;

    Some(RawDiscoveryEvent {
        address: properties.address.to_string(),
        rssi,
        timestamp_nanos: epoch.elapsed().as_nanos() as u64,
        local_name: properties.local_name,
        manufacturer_data: properties.manufacturer_data,
    })
}

/// Forwards adapter power-state changes into the settings radio flag.
pub async fn watch_radio(adapter: Adapter, settings: Arc<Settings>) -> Result<()> {
    let mut events = adapter.events().await?;
    while let Some(event) = events.next().await {
        if let CentralEvent::StateUpdate(state) = event {
            let enabled = matches!(state, CentralState::PoweredOn);
            info!("Adapter state update: {state:?}");
            settings.set_radio(enabled);
        }
    }
    Ok(())
}
