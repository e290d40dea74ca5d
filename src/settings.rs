use log::{debug, info};
use tokio::sync::{broadcast, watch};

use crate::messages::SettingsCommand;
use crate::scanner::ScanMode;

/// Runtime-adjustable monitor settings. Each setting is exposed as a watch
/// channel, so new observers immediately see the current value.
pub struct Settings {
    mode_tx: watch::Sender<ScanMode>,
    radio_tx: watch::Sender<bool>,
}

impl Settings {
    pub fn new(mode: ScanMode, radio_enabled: bool) -> Self {
        let (mode_tx, _) = watch::channel(mode);
        let (radio_tx, _) = watch::channel(radio_enabled);
        Settings { mode_tx, radio_tx }
    }

    pub fn mode(&self) -> watch::Receiver<ScanMode> {
        self.mode_tx.subscribe()
    }

    pub fn radio(&self) -> watch::Receiver<bool> {
        self.radio_tx.subscribe()
    }

    pub fn set_mode(&self, mode: ScanMode) {
        let previous = self.mode_tx.send_replace(mode);
        if previous != mode {
            info!("Scan mode changed: {previous:?} -> {mode:?}");
        }
    }

    pub fn set_radio(&self, enabled: bool) {
        self.radio_tx.send_replace(enabled);
    }

    /// Applies incoming settings commands until the sender closes.
    pub async fn run_commands(&self, mut rx: broadcast::Receiver<SettingsCommand>) {
        loop {
            match rx.recv().await {
                Ok(SettingsCommand::SetMode(mode)) => self.set_mode(mode),
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Settings command channel closed");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Settings command receiver lagged, skipped {skipped}");
                }
            }
        }
    }
}
