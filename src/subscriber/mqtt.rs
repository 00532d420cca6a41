use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::time::Duration;
use tracing::{info, warn};

use super::{BrokerConnector, BrokerError, BrokerSession};
use crate::config::FrigateConfig;

/// rumqttc-backed connector. Each `connect` builds a new client and event
/// loop, so a reconnect always starts from a clean session and resubscribes.
pub struct MqttConnector {
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
    client_id: Option<String>,
    topic: String,
    max_packet_bytes: usize,
}

impl MqttConnector {
    pub fn from_config(cfg: &FrigateConfig) -> Self {
        let credentials = cfg
            .mqtt_auth
            .then(|| (cfg.mqtt_username.clone(), cfg.mqtt_password.clone()));
        Self {
            host: cfg.mqtt_server.clone(),
            port: cfg.mqtt_port,
            credentials,
            client_id: cfg.mqtt_client_id.clone().filter(|id| !id.is_empty()),
            topic: cfg.events_topic(),
            max_packet_bytes: cfg.mqtt_max_packet_bytes,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn options(&self) -> MqttOptions {
        let client_id = self
            .client_id
            .clone()
            .unwrap_or_else(|| format!("yardbird-{}", chrono::Utc::now().timestamp_millis()));

        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_max_packet_size(self.max_packet_bytes, self.max_packet_bytes);
        if let Some((username, password)) = &self.credentials {
            options.set_credentials(username.clone(), password.clone());
        }
        options
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    async fn connect(&mut self) -> Result<Box<dyn BrokerSession>, BrokerError> {
        info!(host = %self.host, port = self.port, topic = %self.topic, "Connecting to MQTT broker");

        let (client, mut eventloop) = AsyncClient::new(self.options(), 10);
        client.subscribe(self.topic.clone(), QoS::AtMostOnce).await?;

        // Drive the loop until the broker accepts us so auth and socket
        // failures surface from connect.
        loop {
            if let Event::Incoming(Incoming::ConnAck(_)) = eventloop.poll().await? {
                break;
            }
        }
        info!(topic = %self.topic, "Connected to MQTT");

        Ok(Box::new(MqttSession { client, eventloop }))
    }
}

struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn next_payload(&mut self) -> Result<Vec<u8>, BrokerError> {
        loop {
            match self.eventloop.poll().await? {
                Event::Incoming(Incoming::Publish(publish)) => return Ok(publish.payload.to_vec()),
                Event::Incoming(Incoming::SubAck(_)) => info!("MQTT subscription acknowledged"),
                Event::Incoming(Incoming::Disconnect) => return Err(BrokerError::Disconnected),
                _ => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.client.disconnect().await {
            warn!(error = %err, "MQTT disconnect failed");
            return;
        }
        // Flush the DISCONNECT packet; the broker may close first.
        let _ = tokio::time::timeout(Duration::from_secs(1), self.eventloop.poll()).await;
    }
}
