use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub type UserId = Ulid;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as Ms
}

/// Occupancy state of a slot.
///
/// `Occupied` means booked but not yet physically confirmed; `Parked` means
/// the sensor has confirmed the booked vehicle is in the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Available,
    Occupied,
    Parked,
}

impl std::fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotStatus::Available => write!(f, "available"),
            SlotStatus::Occupied => write!(f, "occupied"),
            SlotStatus::Parked => write!(f, "parked"),
        }
    }
}

/// Booking window `[start, end]`, nullable together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: Ms,
    pub end: Ms,
}

/// One physical parking slot. Provisioned out-of-band; `number` and
/// `sensor_id` never change after provisioning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub number: u32,
    pub sensor_id: String,
    pub status: SlotStatus,
    pub window: Option<Window>,
    pub booked_by: Option<UserId>,
    pub vehicle_number: Option<String>,
    /// Mirror of `status == Parked`, kept for fast external reads.
    pub is_parked: bool,
    pub last_updated: Ms,
}

impl Slot {
    pub fn new(number: u32, sensor_id: impl Into<String>) -> Self {
        Self {
            number,
            sensor_id: sensor_id.into(),
            status: SlotStatus::Available,
            window: None,
            booked_by: None,
            vehicle_number: None,
            is_parked: false,
            last_updated: now_ms(),
        }
    }

    pub fn has_booking(&self) -> bool {
        self.booked_by.is_some()
    }

    /// Drop every booking-related field. Caller sets status.
    pub fn clear_booking(&mut self) {
        self.window = None;
        self.booked_by = None;
        self.vehicle_number = None;
        self.is_parked = false;
    }
}

/// The user fields the engine touches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub vehicle_number: String,
    pub active: bool,
    pub currently_parked: bool,
    pub current_parking_slot: Option<u32>,
    pub last_booked_from: Option<Ms>,
    pub last_booked_to: Option<Ms>,
}

impl User {
    pub fn new(id: UserId, username: impl Into<String>, vehicle_number: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            vehicle_number: vehicle_number.into(),
            active: true,
            currently_parked: false,
            current_parking_slot: None,
            last_booked_from: None,
            last_booked_to: None,
        }
    }
}

/// Which transport produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Mqtt,
    Websocket,
    Booking,
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventSource::Mqtt => write!(f, "mqtt"),
            EventSource::Websocket => write!(f, "websocket"),
            EventSource::Booking => write!(f, "booking"),
        }
    }
}

/// One occupancy reading, normalized from whichever transport carried it.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalEvent {
    pub sensor_id: String,
    pub occupied: bool,
    pub source: EventSource,
    pub received_at: Ms,
}

/// A status change the engine actually committed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub slot_number: u32,
    pub previous: SlotStatus,
    pub current: SlotStatus,
    pub timestamp: Ms,
}

impl Transition {
    /// Wire payload for the notifications topic and dashboard subscribers.
    pub fn payload(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "status_change",
            "slotNumber": self.slot_number,
            "previousStatus": self.previous,
            "currentStatus": self.current,
            "timestamp": self.timestamp,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectKind {
    UnknownSensor,
    NotBooked,
}

/// Direct reject to the originating sender only. Never broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct Reject {
    pub kind: RejectKind,
    pub sensor_id: String,
    pub message: String,
}

impl Reject {
    pub fn unknown_sensor(sensor_id: &str) -> Self {
        Self {
            kind: RejectKind::UnknownSensor,
            sensor_id: sensor_id.to_string(),
            message: format!("no slot found for sensor {sensor_id}"),
        }
    }

    pub fn not_booked(sensor_id: &str, slot_number: u32) -> Self {
        Self {
            kind: RejectKind::NotBooked,
            sensor_id: sensor_id.to_string(),
            message: format!("slot {slot_number} reported occupied but has no booking"),
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "PARKING_ERROR",
            "message": self.message,
        })
    }
}

/// What `Engine::apply` did with an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Status changed; the transition was written and broadcast.
    Changed(Transition),
    /// Event computed to the current status. No write, no broadcast.
    Unchanged,
    /// Illegal event. No write, no broadcast; reject goes to the sender only.
    Rejected(Reject),
}

/// Read-optimized mirror entry served to new observers. Not authoritative.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotSnapshot {
    pub number: u32,
    pub occupied: bool,
    pub status: SlotStatus,
    pub booked_by: Option<UserId>,
    pub vehicle_number: Option<String>,
    pub last_updated: Ms,
}

impl From<&Slot> for SlotSnapshot {
    fn from(slot: &Slot) -> Self {
        Self {
            number: slot.number,
            occupied: slot.is_parked,
            status: slot.status,
            booked_by: slot.booked_by,
            vehicle_number: slot.vehicle_number.clone(),
            last_updated: slot.last_updated,
        }
    }
}
