mod error;

pub use error::EngineError;

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::model::*;
use crate::notify::BroadcastHub;
use crate::observability;
use crate::store::{RecordStore, is_bookable};

/// What the transition table says to do with one sensor reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Step {
    To(SlotStatus),
    RejectNotBooked,
    Noop,
}

/// The state machine, keyed by `(current, occupied, has_booking)`.
///
/// An occupancy report on a slot with no booking is illegal: the sender
/// gets a direct reject and nothing is written. Repeated readings that
/// compute to the current status are no-ops, so a chatty sensor produces
/// one write and one broadcast per actual change.
pub(super) fn next_status(current: SlotStatus, occupied: bool, has_booking: bool) -> Step {
    match (occupied, has_booking) {
        (true, false) => Step::RejectNotBooked,
        (true, true) => {
            if current == SlotStatus::Parked {
                Step::Noop
            } else {
                Step::To(SlotStatus::Parked)
            }
        }
        (false, _) => {
            if current == SlotStatus::Available {
                Step::Noop
            } else {
                Step::To(SlotStatus::Available)
            }
        }
    }
}

/// The Slot State Reconciliation Engine.
///
/// Owns the occupancy/booking state machine per slot. All three producers
/// (MQTT sensors, WebSocket sensors, the booking API) funnel into the same
/// per-slot serialized critical section; events for different slots never
/// block each other. The Record Store is authoritative — every decision
/// reads fresh state inside the critical section, never the mirror.
pub struct Engine {
    store: Arc<dyn RecordStore>,
    hub: Arc<BroadcastHub>,
    locks: DashMap<u32, Arc<Mutex<()>>>,
}

impl Engine {
    pub fn new(store: Arc<dyn RecordStore>, hub: Arc<BroadcastHub>) -> Self {
        Self {
            store,
            hub,
            locks: DashMap::new(),
        }
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    /// Rebuild the mirrored-state cache from the store at process start.
    pub async fn bootstrap(&self) -> Result<(), EngineError> {
        let slots = self.store.list_slots().await?;
        info!("mirror rebuilt from store: {} slots", slots.len());
        self.hub.rebuild(&slots);
        Ok(())
    }

    fn slot_lock(&self, number: u32) -> Arc<Mutex<()>> {
        self.locks.entry(number).or_default().clone()
    }

    /// Apply one canonical sensor event.
    ///
    /// Exactly-once state application: the same reading applied again
    /// computes to `Unchanged` and touches nothing. Rejections are part of
    /// the return value; the originating adapter alone delivers them.
    pub async fn apply(&self, event: CanonicalEvent) -> Result<Outcome, EngineError> {
        metrics::counter!(observability::EVENTS_TOTAL).increment(1);
        let started = Instant::now();

        // Resolve outside the lock: an unknown sensor never contends.
        let Some(slot) = self.store.slot_by_sensor(&event.sensor_id).await? else {
            warn!("no slot found for sensor {}", event.sensor_id);
            metrics::counter!(observability::REJECTS_TOTAL).increment(1);
            return Ok(Outcome::Rejected(Reject::unknown_sensor(&event.sensor_id)));
        };

        let lock = self.slot_lock(slot.number);
        let _guard = lock.lock().await;

        // Re-read inside the critical section; the pre-lock copy may be stale.
        let mut slot = self
            .store
            .slot_by_sensor(&event.sensor_id)
            .await?
            .ok_or(EngineError::SlotNotFound(slot.number))?;

        let outcome = match next_status(slot.status, event.occupied, slot.has_booking()) {
            Step::Noop => Ok(Outcome::Unchanged),
            Step::RejectNotBooked => {
                warn!(
                    "sensor {} reported occupied on unbooked slot {}",
                    event.sensor_id, slot.number
                );
                metrics::counter!(observability::REJECTS_TOTAL).increment(1);
                Ok(Outcome::Rejected(Reject::not_booked(
                    &event.sensor_id,
                    slot.number,
                )))
            }
            Step::To(next) => {
                let previous = slot.status;
                let vacated_user = match next {
                    SlotStatus::Parked => {
                        slot.status = SlotStatus::Parked;
                        slot.is_parked = true;
                        None
                    }
                    SlotStatus::Available => {
                        let booker = slot.booked_by;
                        slot.clear_booking();
                        slot.status = SlotStatus::Available;
                        booker
                    }
                    // Occupied is only ever entered through book()
                    SlotStatus::Occupied => unreachable!("sensor events never produce occupied"),
                };
                slot.last_updated = now_ms();
                self.store.put_slot(&slot).await?;

                match next {
                    SlotStatus::Parked => {
                        if let Some(uid) = slot.booked_by {
                            self.update_user_best_effort(uid, slot.number, |user| {
                                user.currently_parked = true;
                                user.current_parking_slot = Some(slot.number);
                            })
                            .await;
                        }
                    }
                    _ => {
                        if let Some(uid) = vacated_user {
                            self.update_user_best_effort(uid, slot.number, |user| {
                                user.currently_parked = false;
                                user.current_parking_slot = None;
                            })
                            .await;
                        }
                    }
                }

                info!(
                    "slot {} {previous} -> {next} ({})",
                    slot.number, event.source
                );
                Ok(Outcome::Changed(self.finish(&slot, previous)))
            }
        };

        metrics::histogram!(observability::APPLY_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        outcome
    }

    /// Guarded entry into the state machine: `available -> occupied` with
    /// an attached user. Legal only from `available`, and only for an
    /// active user with no other live booking.
    pub async fn book(
        &self,
        user_id: UserId,
        slot_number: u32,
        window: Window,
    ) -> Result<Slot, EngineError> {
        if window.start >= window.end {
            return Err(EngineError::InvalidWindow);
        }
        let user = self
            .store
            .user(user_id)
            .await?
            .ok_or(EngineError::UserNotFound(user_id))?;
        if !user.active {
            return Err(EngineError::UserInactive(user_id));
        }
        if self
            .store
            .slot_by_number(slot_number)
            .await?
            .is_none()
        {
            return Err(EngineError::SlotNotFound(slot_number));
        }

        let lock = self.slot_lock(slot_number);
        let _guard = lock.lock().await;

        if let Some(existing) = self.store.slot_booked_by(user_id).await? {
            return Err(EngineError::AlreadyBooked(existing.number));
        }
        let mut slot = self
            .store
            .slot_by_number(slot_number)
            .await?
            .ok_or(EngineError::SlotNotFound(slot_number))?;
        if slot.status != SlotStatus::Available {
            return Err(EngineError::SlotUnavailable(slot_number));
        }

        let previous = slot.status;
        slot.status = SlotStatus::Occupied;
        slot.window = Some(window);
        slot.booked_by = Some(user_id);
        slot.vehicle_number = Some(user.vehicle_number.clone());
        slot.last_updated = now_ms();
        self.store.put_slot(&slot).await?;

        self.update_user_best_effort(user_id, slot_number, |user| {
            user.last_booked_from = Some(window.start);
            user.last_booked_to = Some(window.end);
        })
        .await;

        info!("slot {slot_number} booked by {user_id}");
        self.finish(&slot, previous);
        Ok(slot)
    }

    /// Guarded exit: `occupied|parked -> available`, caller must be the
    /// current booker. Clears the booking fields and the user's parking
    /// flags together.
    pub async fn release(&self, user_id: UserId, slot_number: u32) -> Result<Slot, EngineError> {
        if self
            .store
            .slot_by_number(slot_number)
            .await?
            .is_none()
        {
            return Err(EngineError::SlotNotFound(slot_number));
        }

        let lock = self.slot_lock(slot_number);
        let _guard = lock.lock().await;

        let mut slot = self
            .store
            .slot_by_number(slot_number)
            .await?
            .ok_or(EngineError::SlotNotFound(slot_number))?;
        if slot.status != SlotStatus::Occupied && slot.status != SlotStatus::Parked {
            return Err(EngineError::SlotNotOccupiedOrParked(slot_number));
        }
        if slot.booked_by != Some(user_id) {
            return Err(EngineError::Unauthorized(slot_number));
        }

        let previous = slot.status;
        slot.clear_booking();
        slot.status = SlotStatus::Available;
        slot.last_updated = now_ms();
        self.store.put_slot(&slot).await?;

        self.update_user_best_effort(user_id, slot_number, |user| {
            user.currently_parked = false;
            user.current_parking_slot = None;
            user.last_booked_from = None;
            user.last_booked_to = None;
        })
        .await;

        info!("slot {slot_number} released by {user_id}");
        self.finish(&slot, previous);
        Ok(slot)
    }

    pub async fn list_slots(&self) -> Result<Vec<Slot>, EngineError> {
        Ok(self.store.list_slots().await?)
    }

    pub async fn available_slots(&self) -> Result<Vec<Slot>, EngineError> {
        let mut slots = self.store.list_slots().await?;
        slots.retain(is_bookable);
        Ok(slots)
    }

    /// Post-commit projection: refresh the mirror and broadcast the
    /// transition. The slot write has already committed by now.
    fn finish(&self, slot: &Slot, previous: SlotStatus) -> Transition {
        self.hub.refresh(slot);
        let transition = Transition {
            slot_number: slot.number,
            previous,
            current: slot.status,
            timestamp: slot.last_updated,
        };
        self.hub.publish(&transition);
        metrics::counter!(observability::TRANSITIONS_TOTAL).increment(1);
        transition
    }

    /// Linked-user write. The slot write already stands; a failure here is
    /// the PartialReconciliation condition — logged at error level, never
    /// rolled back. The flags self-heal on the slot's next transition.
    async fn update_user_best_effort(
        &self,
        id: UserId,
        slot_number: u32,
        mutate: impl FnOnce(&mut User) + Send,
    ) {
        let result: Result<(), EngineError> = async {
            let mut user = self
                .store
                .user(id)
                .await?
                .ok_or(EngineError::UserNotFound(id))?;
            mutate(&mut user);
            self.store.put_user(&user).await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            metrics::counter!(observability::PARTIAL_RECONCILIATIONS_TOTAL).increment(1);
            tracing::error!(
                "partial reconciliation on slot {slot_number}: slot written, user {id} not: {e}"
            );
        }
    }
}
