//! MQTT ingest/egress. Subscribes the per-sensor status wildcard, feeds
//! each publish through the normalizer into the engine, and republishes
//! committed transitions to the notifications topic. Rejects go to the
//! offending sensor's own reject topic, never to the broadcast topics.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, Publish, QoS};
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::engine::Engine;
use crate::model::Outcome;
use crate::normalize;
use crate::observability;

/// Wildcard subscription matching every sensor's status topic.
pub const SENSOR_TOPIC: &str = "parking/sensors/+/status";
pub const NOTIFICATIONS_TOPIC: &str = "parking/notifications";

fn reject_topic(sensor_id: &str) -> String {
    format!("parking/sensors/{sensor_id}/reject")
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl MqttConfig {
    /// Broker parameters from the environment; None disables MQTT ingest.
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("PARKD_MQTT_HOST").ok()?;
        let port = std::env::var("PARKD_MQTT_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1883);
        Some(Self {
            host,
            port,
            username: std::env::var("PARKD_MQTT_USERNAME").ok(),
            password: std::env::var("PARKD_MQTT_PASSWORD").ok(),
        })
    }
}

/// Long-lived ingest task. Runs until the process stops; broker drops are
/// ridden out by the client's reconnect on the next poll.
pub async fn run(engine: Arc<Engine>, config: MqttConfig) {
    let client_id = format!("parkd-{}", Ulid::new());
    let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(30));
    if let (Some(username), Some(password)) = (config.username, config.password) {
        options.set_credentials(username, password);
    }

    let (client, mut eventloop) = AsyncClient::new(options, 64);
    info!("mqtt ingest connecting to {}:{}", config.host, config.port);

    // Forward committed transitions to the notifications topic.
    let forward_client = client.clone();
    let mut rx = engine.hub().subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(transition) => {
                    if let Err(e) = forward_client
                        .publish(
                            NOTIFICATIONS_TOPIC,
                            QoS::AtLeastOnce,
                            false,
                            transition.payload().to_string(),
                        )
                        .await
                    {
                        warn!("notification publish failed: {e}");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("mqtt forwarder lagging, {missed} notifications dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("connected to mqtt broker, subscribing {SENSOR_TOPIC}");
                if let Err(e) = client.subscribe(SENSOR_TOPIC, QoS::AtLeastOnce).await {
                    error!("subscribe failed: {e}");
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                handle_publish(&engine, &client, publish).await;
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt connection error: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn handle_publish(engine: &Engine, client: &AsyncClient, publish: Publish) {
    let event = match normalize::from_mqtt(&publish.topic, &publish.payload) {
        Ok(event) => event,
        Err(e) => {
            warn!("dropping mqtt message on {}: {e}", publish.topic);
            metrics::counter!(observability::DROPPED_EVENTS_TOTAL).increment(1);
            return;
        }
    };

    match engine.apply(event).await {
        Ok(Outcome::Rejected(reject)) => {
            if let Err(e) = client
                .publish(
                    reject_topic(&reject.sensor_id),
                    QoS::AtLeastOnce,
                    false,
                    reject.payload().to_string(),
                )
                .await
            {
                warn!("reject publish failed: {e}");
            }
        }
        Ok(_) => {}
        Err(e) => error!("apply failed for mqtt event: {e}"),
    }
}
