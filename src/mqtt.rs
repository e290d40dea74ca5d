use std::time::Duration;

use anyhow::Result;
use log::{debug, error, info};
use rumqttc::{MqttOptions, QoS, SubscribeFilter};
use tokio::sync::broadcast;

use crate::device::DecodedDevice;
use crate::messages::{DeviceReport, PresenceReport, SettingsCommand};
use crate::config;
use crate::scanner::ScanMode;

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .as_ref()
            .unwrap_or(&"presence-rs".to_string())
            .to_string();

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path: config.topic_path.clone().unwrap_or("presence".to_string()),
            },
            eventloop,
        )
    }

    pub async fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        self.client
            .subscribe_many(vec![SubscribeFilter::new(
                format!("{}/mode/set", self.topic_path),
                QoS::AtMostOnce,
            )])
            .await?;

        Ok(())
    }

    pub async fn event_loop(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        tx: broadcast::Sender<SettingsCommand>,
    ) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        debug!("Received MQTT message on topic {}: {:?}", p.topic, p.payload);

                        if !p.topic.ends_with("/mode/set") {
                            continue;
                        }
                        let payload = String::from_utf8_lossy(&p.payload);
                        let Some(mode) = ScanMode::parse(&payload) else {
                            error!("Unknown scan mode requested: {payload:?}");
                            continue;
                        };
                        if let Err(err) = tx.send(SettingsCommand::SetMode(mode)) {
                            error!("Error announcing mode change: {:?}", err);
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        debug!("Connection acknowledged");
                        if let Err(err) = self.subscribe().await {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                }
            }
        }
    }

    /// Publishes the current presence snapshot and the selected main device.
    pub async fn publish_presence(
        &self,
        devices: &[DecodedDevice],
        main: Option<&DecodedDevice>,
    ) -> Result<()> {
        info!(
            "Publishing presence: {} device(s), main: {:?}",
            devices.len(),
            main.map(|d| d.id.to_string())
        );

        let snapshot = PresenceReport::new(devices);
        self.client
            .publish(
                format!("{}/{}/devices", self.topic_path, self.publisher_id),
                QoS::AtMostOnce,
                false,
                serde_json::to_string(&snapshot)?,
            )
            .await?;

        let main_report = main.map(DeviceReport::new);
        self.client
            .publish(
                format!("{}/{}/main", self.topic_path, self.publisher_id),
                QoS::AtMostOnce,
                false,
                serde_json::to_string(&main_report)?,
            )
            .await?;

        for device in devices {
            let channel_name = sanitize_name(device.name.as_deref().unwrap_or(&device.address));
            self.client
                .publish(
                    format!("{}/{}/device/{}", self.topic_path, self.publisher_id, channel_name),
                    QoS::AtMostOnce,
                    false,
                    serde_json::to_string(&DeviceReport::new(device))?,
                )
                .await?;
        }

        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}
