use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use chrono::Utc;
use tokio::time::Duration;
use tracing::{error, info, warn};

use crate::config::MqttConfig;
use crate::errors::{FleetError, Result};
use crate::protocol::{TriggerEvent, TriggerEventKind};

#[derive(Debug, Clone, Serialize)]
struct ClientStateEvent {
    client_id: String,
    device_type: String,
    online: bool,
    timestamp: String,
}

/// Telemetry publisher for fleet events. Constructed from the optional
/// `[mqtt]` config section; without one, every publish is a no-op so callers
/// never need to branch.
#[derive(Clone)]
pub struct MqttHandle {
    inner: Option<MqttInner>,
}

#[derive(Clone)]
struct MqttInner {
    client: AsyncClient,
    base_topic: String,
    qos: QoS,
    retain: bool,
}

impl MqttHandle {
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub async fn connect(config: &MqttConfig) -> Result<Self> {
        let url = url::Url::parse(&config.broker_url)
            .map_err(|e| FleetError::config(format!("Invalid MQTT broker URL '{}': {}", config.broker_url, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| FleetError::config(format!("No host in MQTT broker URL: {}", config.broker_url)))?;
        let port = url.port().unwrap_or(1883);

        info!("Connecting to MQTT broker at {}:{}", host, port);

        let mut options = MqttOptions::new(&config.client_id, host, port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 100);

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker");
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("Disconnected from MQTT broker");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT connection error: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        let qos = match config.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        };

        Ok(Self {
            inner: Some(MqttInner {
                client,
                base_topic: config.base_topic.clone(),
                qos,
                retain: config.retain,
            }),
        })
    }

    pub async fn publish_client_state(&self, client_id: &str, device_type: &str, online: bool) {
        let Some(inner) = &self.inner else { return };

        let suffix = if online { "online" } else { "offline" };
        let topic = format!("{}/clients/{}/{}", inner.base_topic, client_id, suffix);
        let event = ClientStateEvent {
            client_id: client_id.to_string(),
            device_type: device_type.to_string(),
            online,
            timestamp: Utc::now().to_rfc3339(),
        };
        if let Ok(payload) = serde_json::to_string(&event) {
            if let Err(e) = inner
                .client
                .publish(topic, inner.qos, inner.retain, payload.as_bytes())
                .await
            {
                error!("Failed to publish client state for '{}': {}", client_id, e);
            }
        }
    }

    pub async fn publish_trigger_event(&self, event: &TriggerEvent) {
        let Some(inner) = &self.inner else { return };

        let suffix = match event.event {
            TriggerEventKind::Start => "start",
            TriggerEventKind::Stop => "stop",
        };
        let topic = format!("{}/triggers/{}/{}", inner.base_topic, event.key, suffix);
        if let Ok(payload) = serde_json::to_string(event) {
            // Trigger events are moments, not state; never retain them
            if let Err(e) = inner.client.publish(topic, inner.qos, false, payload.as_bytes()).await {
                error!("Failed to publish trigger event for '{}': {}", event.key, e);
            }
        }
    }
}
