//! Record Store boundary. The store is the single source of truth for
//! slot and user records; the engine only reads and writes single records
//! through this trait, always inside the per-slot critical section.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::model::{Slot, SlotStatus, User, UserId};

#[derive(Debug)]
pub enum StoreError {
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(detail) => write!(f, "store unavailable: {detail}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn slot_by_sensor(&self, sensor_id: &str) -> Result<Option<Slot>, StoreError>;
    async fn slot_by_number(&self, number: u32) -> Result<Option<Slot>, StoreError>;
    /// The slot currently booked by this user, if any. At most one exists.
    async fn slot_booked_by(&self, user: UserId) -> Result<Option<Slot>, StoreError>;
    async fn list_slots(&self) -> Result<Vec<Slot>, StoreError>;
    async fn put_slot(&self, slot: &Slot) -> Result<(), StoreError>;
    async fn user(&self, id: UserId) -> Result<Option<User>, StoreError>;
    async fn put_user(&self, user: &User) -> Result<(), StoreError>;
}

/// In-process store. Slots are keyed by number with a sensor-id index.
pub struct MemoryStore {
    slots: DashMap<u32, Slot>,
    sensor_index: DashMap<String, u32>,
    users: DashMap<UserId, User>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            sensor_index: DashMap::new(),
            users: DashMap::new(),
        }
    }

    /// Provisioning entry point; not part of the engine's write path.
    pub fn provision_slot(&self, slot: Slot) {
        self.sensor_index.insert(slot.sensor_id.clone(), slot.number);
        self.slots.insert(slot.number, slot);
    }

    pub fn provision_user(&self, user: User) {
        self.users.insert(user.id, user);
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn slot_by_sensor(&self, sensor_id: &str) -> Result<Option<Slot>, StoreError> {
        let Some(number) = self.sensor_index.get(sensor_id).map(|e| *e.value()) else {
            return Ok(None);
        };
        Ok(self.slots.get(&number).map(|e| e.value().clone()))
    }

    async fn slot_by_number(&self, number: u32) -> Result<Option<Slot>, StoreError> {
        Ok(self.slots.get(&number).map(|e| e.value().clone()))
    }

    async fn slot_booked_by(&self, user: UserId) -> Result<Option<Slot>, StoreError> {
        Ok(self
            .slots
            .iter()
            .find(|e| e.value().booked_by == Some(user))
            .map(|e| e.value().clone()))
    }

    async fn list_slots(&self) -> Result<Vec<Slot>, StoreError> {
        let mut slots: Vec<Slot> = self.slots.iter().map(|e| e.value().clone()).collect();
        slots.sort_by_key(|s| s.number);
        Ok(slots)
    }

    async fn put_slot(&self, slot: &Slot) -> Result<(), StoreError> {
        self.slots.insert(slot.number, slot.clone());
        Ok(())
    }

    async fn user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        Ok(self.users.get(&id).map(|e| e.value().clone()))
    }

    async fn put_user(&self, user: &User) -> Result<(), StoreError> {
        self.users.insert(user.id, user.clone());
        Ok(())
    }
}

/// Slots open for booking: `available` with every booking field clear.
pub fn is_bookable(slot: &Slot) -> bool {
    slot.status == SlotStatus::Available
        && slot.booked_by.is_none()
        && slot.window.is_none()
        && !slot.is_parked
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[tokio::test]
    async fn sensor_index_resolves_slot() {
        let store = MemoryStore::new();
        store.provision_slot(Slot::new(1, "s-1"));
        store.provision_slot(Slot::new(2, "s-2"));

        let slot = store.slot_by_sensor("s-2").await.unwrap().unwrap();
        assert_eq!(slot.number, 2);
        assert!(store.slot_by_sensor("s-99").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_slot_overwrites() {
        let store = MemoryStore::new();
        store.provision_slot(Slot::new(1, "s-1"));

        let mut slot = store.slot_by_number(1).await.unwrap().unwrap();
        slot.status = SlotStatus::Occupied;
        store.put_slot(&slot).await.unwrap();

        let read_back = store.slot_by_number(1).await.unwrap().unwrap();
        assert_eq!(read_back.status, SlotStatus::Occupied);
    }

    #[tokio::test]
    async fn slot_booked_by_finds_the_one_slot() {
        let store = MemoryStore::new();
        let uid = Ulid::new();
        store.provision_slot(Slot::new(1, "s-1"));
        let mut booked = Slot::new(2, "s-2");
        booked.status = SlotStatus::Occupied;
        booked.booked_by = Some(uid);
        store.provision_slot(booked);

        let found = store.slot_booked_by(uid).await.unwrap().unwrap();
        assert_eq!(found.number, 2);
        assert!(store.slot_booked_by(Ulid::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_slots_is_ordered_by_number() {
        let store = MemoryStore::new();
        store.provision_slot(Slot::new(3, "s-3"));
        store.provision_slot(Slot::new(1, "s-1"));
        store.provision_slot(Slot::new(2, "s-2"));

        let numbers: Vec<u32> = store
            .list_slots()
            .await
            .unwrap()
            .iter()
            .map(|s| s.number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn bookable_requires_all_fields_clear() {
        let mut slot = Slot::new(1, "s-1");
        assert!(is_bookable(&slot));

        slot.booked_by = Some(Ulid::new());
        assert!(!is_bookable(&slot));

        slot.booked_by = None;
        slot.status = SlotStatus::Occupied;
        assert!(!is_bookable(&slot));
    }
}
