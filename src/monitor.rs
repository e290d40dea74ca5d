use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use futures::StreamExt as _;
use futures::stream::{self, BoxStream};
use log::{debug, info, trace, warn};
use tokio::sync::watch;

use crate::device::{DecodedDevice, DeviceDecoder, DeviceId, RawBatch, RawDiscoveryEvent};
use crate::scanner::{ScanMode, Scanner};

/// How long a device stays in the presence set without being seen again.
pub const STALE_AFTER: Duration = Duration::from_secs(10);

/// Devices at or below this signal strength are never the main device.
pub const SIGNAL_FLOOR_DBM: i16 = -85;

/// Collapses a batch to one event per physical address, keeping the most
/// recently timestamped event. The first maximal element wins ties.
pub fn dedupe_batch(batch: RawBatch) -> RawBatch {
    let mut newest: HashMap<String, RawDiscoveryEvent> = HashMap::new();
    for event in batch {
        let keep_existing = newest
            .get(&event.address)
            .is_some_and(|kept| kept.timestamp_nanos >= event.timestamp_nanos);
        if keep_existing {
            trace!(
                "Discarding stale result for {} (ts {})",
                event.address, event.timestamp_nanos
            );
        } else {
            newest.insert(event.address.clone(), event);
        }
    }
    newest.into_values().collect()
}

/// Picks the strongest device above the signal floor, if any.
pub fn main_device(devices: &[DecodedDevice]) -> Option<&DecodedDevice> {
    devices
        .iter()
        .max_by_key(|device| device.rssi)
        .filter(|device| device.rssi > SIGNAL_FLOOR_DBM)
}

/// Folds raw scan batches into a live presence set.
///
/// Owns the device cache exclusively; downstream only ever sees immutable
/// snapshots through the watch channels, starting with an empty one.
pub struct Monitor<S, D> {
    scanner: S,
    decoder: D,
    mode_rx: watch::Receiver<ScanMode>,
    radio_rx: watch::Receiver<bool>,
    radio_was_enabled: bool,
    cache: HashMap<DeviceId, DecodedDevice>,
    devices_tx: watch::Sender<Vec<DecodedDevice>>,
    main_tx: watch::Sender<Option<DecodedDevice>>,
}

impl<S: Scanner, D: DeviceDecoder> Monitor<S, D> {
    pub fn new(
        scanner: S,
        decoder: D,
        mode_rx: watch::Receiver<ScanMode>,
        radio_rx: watch::Receiver<bool>,
    ) -> Self {
        let (devices_tx, _) = watch::channel(Vec::new());
        let (main_tx, _) = watch::channel(None);
        Monitor {
            scanner,
            decoder,
            mode_rx,
            radio_rx,
            radio_was_enabled: true,
            cache: HashMap::new(),
            devices_tx,
            main_tx,
        }
    }

    /// Current presence snapshot, one emission per processed batch.
    pub fn devices(&self) -> watch::Receiver<Vec<DecodedDevice>> {
        self.devices_tx.subscribe()
    }

    /// The selected main device, derived 1:1 from `devices`.
    pub fn main_device(&self) -> watch::Receiver<Option<DecodedDevice>> {
        self.main_tx.subscribe()
    }

    /// Drives the pipeline until the settings channels close or the scanner
    /// fails. Mode and radio changes tear down the active subscription
    /// before a new one is established; stale in-flight batches from the
    /// old subscription are never merged.
    pub async fn run(mut self) -> Result<()> {
        let mut scan = self.resubscribe();
        loop {
            tokio::select! {
                changed = self.mode_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    drop(scan);
                    scan = self.resubscribe();
                }
                changed = self.radio_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    drop(scan);
                    scan = self.resubscribe();
                }
                item = scan.next() => match item {
                    Some(Ok(batch)) => self.process_batch(batch),
                    Some(Err(err)) => {
                        return Err(err).context("scanner subscription failed");
                    }
                    None => {
                        info!("Scan stream ended");
                        break;
                    }
                },
            }
        }
        Ok(())
    }

    fn resubscribe(&mut self) -> BoxStream<'static, Result<RawBatch>> {
        let mode = *self.mode_rx.borrow_and_update();
        let enabled = *self.radio_rx.borrow_and_update();
        if enabled {
            info!("Subscribing to scanner in {mode:?} mode");
            self.radio_was_enabled = true;
            self.scanner.subscribe(mode)
        } else {
            if self.radio_was_enabled {
                warn!("Radio is currently disabled");
            }
            self.radio_was_enabled = false;
            stream::pending().boxed()
        }
    }

    /// One fold step: dedupe, decode strongest-first, merge by identity,
    /// evict stale entries, emit the surviving set.
    fn process_batch(&mut self, batch: RawBatch) {
        let mut incoming = dedupe_batch(batch);
        incoming.sort_by(|a, b| b.rssi.cmp(&a.rssi));

        for event in &incoming {
            match self.decoder.decode(event) {
                Some(device) => {
                    self.cache.insert(device.id.clone(), device);
                }
                None => trace!("Ignoring unrecognized advertisement from {}", event.address),
            }
        }

        self.emit(Instant::now());
    }

    fn emit(&mut self, now: Instant) {
        self.cache.retain(|id, device| {
            let fresh = now.duration_since(device.last_seen) < STALE_AFTER;
            if !fresh {
                debug!("Removing stale device from cache: {id}");
            }
            fresh
        });

        let mut snapshot: Vec<DecodedDevice> = self.cache.values().cloned().collect();
        snapshot.sort_by(|a, b| b.rssi.cmp(&a.rssi));

        self.main_tx.send_replace(main_device(&snapshot).cloned());
        self.devices_tx.send_replace(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::device::ManufacturerDecoder;

    fn raw(address: &str, rssi: i16, timestamp_nanos: u64) -> RawDiscoveryEvent {
        RawDiscoveryEvent {
            address: address.to_string(),
            rssi,
            timestamp_nanos,
            local_name: None,
            manufacturer_data: HashMap::new(),
        }
    }

    fn device_seen_at(address: &str, rssi: i16, last_seen: Instant) -> DecodedDevice {
        DecodedDevice {
            id: DeviceId::from_address(address),
            name: None,
            address: address.to_string(),
            rssi,
            last_seen,
        }
    }

    /// Replays its canned batches once per subscription, then stays silent.
    struct StubScanner {
        calls: Arc<AtomicUsize>,
        batches: Vec<RawBatch>,
        fail: bool,
    }

    impl StubScanner {
        fn silent() -> Self {
            StubScanner {
                calls: Arc::new(AtomicUsize::new(0)),
                batches: Vec::new(),
                fail: false,
            }
        }
    }

    impl Scanner for StubScanner {
        fn subscribe(&self, _mode: ScanMode) -> BoxStream<'static, Result<RawBatch>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return stream::iter(vec![Err(anyhow::anyhow!("adapter gone"))])
                    .chain(stream::pending())
                    .boxed();
            }
            stream::iter(self.batches.clone().into_iter().map(Ok))
                .chain(stream::pending())
                .boxed()
        }
    }

    fn accept_all() -> ManufacturerDecoder {
        ManufacturerDecoder::new(Vec::new(), HashMap::new())
    }

    fn stub_monitor() -> Monitor<StubScanner, ManufacturerDecoder> {
        let (_mode_tx, mode_rx) = watch::channel(ScanMode::Balanced);
        let (_radio_tx, radio_rx) = watch::channel(true);
        Monitor::new(StubScanner::silent(), accept_all(), mode_rx, radio_rx)
    }

    #[test]
    fn test_dedupe_keeps_newest_per_address() {
        let out = dedupe_batch(vec![raw("A", -70, 100), raw("A", -60, 150), raw("B", -50, 120)]);
        assert_eq!(out.len(), 2);
        let a = out.iter().find(|e| e.address == "A").unwrap();
        assert_eq!(a.timestamp_nanos, 150);
        assert_eq!(a.rssi, -60);
    }

    #[test]
    fn test_dedupe_ties_keep_first_maximal() {
        let out = dedupe_batch(vec![raw("A", -70, 100), raw("A", -60, 100)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].rssi, -70);
    }

    #[test]
    fn test_main_device_threshold_is_strict() {
        let now = Instant::now();
        let at_floor = vec![device_seen_at("a", SIGNAL_FLOOR_DBM, now)];
        assert!(main_device(&at_floor).is_none());

        let above_floor = vec![device_seen_at("a", SIGNAL_FLOOR_DBM + 1, now)];
        assert_eq!(main_device(&above_floor).unwrap().rssi, -84);
    }

    #[test]
    fn test_main_device_picks_strongest() {
        let now = Instant::now();
        let devices = vec![
            device_seen_at("a", -70, now),
            device_seen_at("b", -50, now),
            device_seen_at("c", -60, now),
        ];
        assert_eq!(main_device(&devices).unwrap().address, "b");
        assert!(main_device(&[]).is_none());
    }

    #[test]
    fn test_initial_snapshot_is_empty() {
        let monitor = stub_monitor();
        assert!(monitor.devices().borrow().is_empty());
        assert!(monitor.main_device().borrow().is_none());
    }

    #[test]
    fn test_duplicate_batches_keep_single_entry() {
        let mut monitor = stub_monitor();
        monitor.process_batch(vec![raw("AA", -70, 100)]);
        monitor.process_batch(vec![raw("AA", -70, 100), raw("AA", -60, 150)]);

        assert_eq!(monitor.cache.len(), 1);
        assert_eq!(monitor.cache[&DeviceId::new("aa")].rssi, -60);
        assert_eq!(monitor.devices().borrow().len(), 1);
    }

    #[test]
    fn test_last_seen_never_decreases() {
        let mut monitor = stub_monitor();
        monitor.process_batch(vec![raw("AA", -70, 100)]);
        let first = monitor.cache[&DeviceId::new("aa")].last_seen;
        monitor.process_batch(vec![raw("AA", -65, 200)]);
        let second = monitor.cache[&DeviceId::new("aa")].last_seen;
        assert!(second >= first);
    }

    #[test]
    fn test_eviction_at_staleness_window() {
        let mut monitor = stub_monitor();
        let now = Instant::now();
        monitor
            .cache
            .insert(DeviceId::new("a"), device_seen_at("a", -60, now));

        monitor.emit(now + Duration::from_millis(9_900));
        assert_eq!(monitor.devices_tx.borrow().len(), 1);

        monitor.emit(now + STALE_AFTER);
        assert!(monitor.devices_tx.borrow().is_empty());
        assert!(monitor.cache.is_empty());
    }

    #[test]
    fn test_empty_batch_still_evicts() {
        let mut monitor = stub_monitor();
        let stale = Instant::now().checked_sub(Duration::from_secs(11)).unwrap();
        monitor
            .cache
            .insert(DeviceId::new("a"), device_seen_at("a", -60, stale));

        monitor.process_batch(Vec::new());
        assert!(monitor.devices_tx.borrow().is_empty());
        assert!(monitor.cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_radio_off_suppresses_batches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scanner = StubScanner {
            calls: calls.clone(),
            batches: vec![vec![raw("AA:BB:CC:DD:EE:FF", -60, 1)]],
            fail: false,
        };
        let (mode_tx, mode_rx) = watch::channel(ScanMode::Balanced);
        let (radio_tx, radio_rx) = watch::channel(false);
        let monitor = Monitor::new(scanner, accept_all(), mode_rx, radio_rx);
        let mut devices_rx = monitor.devices();
        tokio::spawn(monitor.run());

        // A mode change while the radio is off must not start a scan either.
        mode_tx.send_replace(ScanMode::LowLatency);
        let waited =
            tokio::time::timeout(Duration::from_millis(100), devices_rx.changed()).await;
        assert!(waited.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Re-enabling the radio establishes a subscription and batches flow.
        radio_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), devices_rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(devices_rx.borrow_and_update().len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_change_restarts_subscription() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scanner = StubScanner {
            calls: calls.clone(),
            batches: vec![vec![raw("AA:BB:CC:DD:EE:FF", -60, 1)]],
            fail: false,
        };
        let (mode_tx, mode_rx) = watch::channel(ScanMode::Balanced);
        let (_radio_tx, radio_rx) = watch::channel(true);
        let monitor = Monitor::new(scanner, accept_all(), mode_rx, radio_rx);
        let mut devices_rx = monitor.devices();
        tokio::spawn(monitor.run());

        tokio::time::timeout(Duration::from_secs(5), devices_rx.changed())
            .await
            .unwrap()
            .unwrap();
        devices_rx.borrow_and_update();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        mode_tx.send_replace(ScanMode::LowPower);
        tokio::time::timeout(Duration::from_secs(5), devices_rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_scanner_failure_is_terminal() {
        let scanner = StubScanner {
            calls: Arc::new(AtomicUsize::new(0)),
            batches: Vec::new(),
            fail: true,
        };
        let (_mode_tx, mode_rx) = watch::channel(ScanMode::Balanced);
        let (_radio_tx, radio_rx) = watch::channel(true);
        let monitor = Monitor::new(scanner, accept_all(), mode_rx, radio_rx);

        let result = tokio::spawn(monitor.run()).await.unwrap();
        assert!(result.is_err());
    }
}
