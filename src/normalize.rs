//! Event Normalizer: one canonical event type out of whatever the
//! transports deliver. Failures here are terminal for the single event —
//! the caller logs and drops, nothing reaches the engine.

use serde::Deserialize;

use crate::model::{CanonicalEvent, EventSource, now_ms};

/// Prefix of the per-sensor MQTT status topics (`parking/sensors/{id}/status`).
pub const SENSOR_TOPIC_PREFIX: &str = "parking/sensors/";
pub const SENSOR_TOPIC_SUFFIX: &str = "/status";

#[derive(Debug, PartialEq, Eq)]
pub enum NormalizeError {
    MalformedPayload(String),
    MissingField(&'static str),
    UnknownSource(String),
}

impl std::fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NormalizeError::MalformedPayload(detail) => write!(f, "malformed payload: {detail}"),
            NormalizeError::MissingField(field) => write!(f, "missing field: {field}"),
            NormalizeError::UnknownSource(source) => write!(f, "unknown source: {source}"),
        }
    }
}

impl std::error::Error for NormalizeError {}

#[derive(Deserialize)]
struct SensorPayload {
    #[serde(rename = "sensorId")]
    sensor_id: Option<String>,
    occupied: Option<bool>,
}

/// Entry point for a raw message from a named transport.
pub fn normalize(transport: &str, topic: &str, payload: &[u8]) -> Result<CanonicalEvent, NormalizeError> {
    match transport {
        "mqtt" => from_mqtt(topic, payload),
        "websocket" => {
            let text = std::str::from_utf8(payload)
                .map_err(|e| NormalizeError::MalformedPayload(e.to_string()))?;
            from_frame(text)
        }
        other => Err(NormalizeError::UnknownSource(other.to_string())),
    }
}

/// An MQTT publish: sensor id comes from the topic, occupancy from the payload.
pub fn from_mqtt(topic: &str, payload: &[u8]) -> Result<CanonicalEvent, NormalizeError> {
    let sensor_id = topic
        .strip_prefix(SENSOR_TOPIC_PREFIX)
        .and_then(|rest| rest.strip_suffix(SENSOR_TOPIC_SUFFIX))
        .ok_or_else(|| NormalizeError::UnknownSource(topic.to_string()))?;
    if sensor_id.is_empty() || sensor_id.contains('/') {
        return Err(NormalizeError::MissingField("sensorId"));
    }

    let parsed: SensorPayload = serde_json::from_slice(payload)
        .map_err(|e| NormalizeError::MalformedPayload(e.to_string()))?;
    let occupied = parsed.occupied.ok_or(NormalizeError::MissingField("occupied"))?;

    Ok(CanonicalEvent {
        sensor_id: sensor_id.to_string(),
        occupied,
        source: EventSource::Mqtt,
        received_at: now_ms(),
    })
}

/// A raw WebSocket text frame: both fields come from the payload.
pub fn from_frame(text: &str) -> Result<CanonicalEvent, NormalizeError> {
    let parsed: SensorPayload = serde_json::from_str(text)
        .map_err(|e| NormalizeError::MalformedPayload(e.to_string()))?;
    let sensor_id = parsed.sensor_id.ok_or(NormalizeError::MissingField("sensorId"))?;
    let occupied = parsed.occupied.ok_or(NormalizeError::MissingField("occupied"))?;

    Ok(CanonicalEvent {
        sensor_id,
        occupied,
        source: EventSource::Websocket,
        received_at: now_ms(),
    })
}
