use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use btleplug::api::{Central as _, CentralState, Manager as _};
use btleplug::platform::Manager;
use clap::Parser;
use log::error;
use tokio::sync::broadcast;

mod config;
mod device;
mod messages;
mod monitor;
mod mqtt;
mod scanner;
mod settings;

#[derive(Parser, Debug)]
#[command(version, about = "BLE presence monitor")]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();

    let config_contents = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading config file {}", args.config.display()))?;
    let config: config::AppConfig = toml::de::from_str(&config_contents)?;

    let (mqtt_client, mut eventloop) = mqtt::MqttClient::new(&config.mqtt);
    mqtt_client.subscribe().await?;

    let bt_manager = Manager::new().await?;

    // get the first bluetooth adapter
    let adapters = bt_manager.adapters().await?;
    let central = adapters
        .into_iter()
        .next()
        .context("no Bluetooth adapter found")?;

    let scan_config = config.scan.clone().unwrap_or_default();
    let radio_on = matches!(central.adapter_state().await?, CentralState::PoweredOn);
    let settings = Arc::new(settings::Settings::new(
        scan_config.mode.unwrap_or_default(),
        radio_on,
    ));

    // Adapter power-state updates feed the radio flag
    {
        let settings = settings.clone();
        let central = central.clone();
        tokio::spawn(async move {
            if let Err(err) = scanner::watch_radio(central, settings).await {
                error!("Error watching adapter state: {err:?}");
            }
        });
    }

    // Handle incoming MQTT messages (e.g. scan mode changes)
    let (cmd_tx, cmd_rx) = broadcast::channel(10);
    {
        let mqtt_client = mqtt_client.clone();
        tokio::spawn(async move {
            mqtt_client.event_loop(&mut eventloop, cmd_tx).await;
        });
    }
    {
        let settings = settings.clone();
        tokio::spawn(async move {
            settings.run_commands(cmd_rx).await;
        });
    }

    let decoder = device::ManufacturerDecoder::from_config(&config);
    let ble = scanner::BleScanner::new(central);
    let monitor = monitor::Monitor::new(ble, decoder, settings.mode(), settings.radio());
    let mut devices_rx = monitor.devices();
    let main_rx = monitor.main_device();
    let monitor_handle = tokio::spawn(monitor.run());

    // Publish every presence snapshot as it is emitted
    {
        let mqtt_client = mqtt_client.clone();
        tokio::spawn(async move {
            while devices_rx.changed().await.is_ok() {
                let devices = devices_rx.borrow_and_update().clone();
                let main = main_rx.borrow().clone();
                if let Err(err) = mqtt_client.publish_presence(&devices, main.as_ref()).await {
                    error!("Error publishing presence over MQTT: {err:?}");
                }
            }
        });
    }

    monitor_handle.await??;
    mqtt_client.disconnect().await?;

    Ok(())
}
