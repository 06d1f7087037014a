use std::collections::HashMap;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Slot, SlotSnapshot, Transition};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast fan-out for committed transitions, plus the mirrored-state
/// cache that answers snapshot requests without a store round-trip.
///
/// Delivery is best-effort: a send with no subscribers (or a lagged
/// subscriber) is not an error. The mirror is written only as a post-commit
/// projection and is never consulted for state-machine legality.
pub struct BroadcastHub {
    tx: broadcast::Sender<Transition>,
    mirror: DashMap<String, SlotSnapshot>,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self {
            tx: broadcast::channel(CHANNEL_CAPACITY).0,
            mirror: DashMap::new(),
        }
    }

    /// Subscribe to status-changed notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.tx.subscribe()
    }

    /// Push a committed transition to every subscriber. No-op if nobody
    /// is listening.
    pub fn publish(&self, transition: &Transition) {
        let _ = self.tx.send(transition.clone());
    }

    /// Refresh the mirror entry for a slot after its store write committed.
    /// Last-writer-wins; the only writer is the engine's own output.
    pub fn refresh(&self, slot: &Slot) {
        self.mirror
            .insert(slot.sensor_id.clone(), SlotSnapshot::from(slot));
    }

    /// Rebuild the whole mirror from store contents at process start.
    pub fn rebuild(&self, slots: &[Slot]) {
        self.mirror.clear();
        for slot in slots {
            self.refresh(slot);
        }
    }

    /// Full mirror, served once per new observer connection.
    pub fn snapshot(&self) -> HashMap<String, SlotSnapshot> {
        self.mirror
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}
