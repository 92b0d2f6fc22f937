//! Pub/sub fan-out of region status and progress events.
//!
//! Observers subscribe with a callback object and get back a small
//! integer [`SlotId`]. Discrete status transitions and continuous
//! progress updates are delivered through separate methods so observers
//! can throttle redraws on progress without ever missing a transition.
//!
//! Delivery is synchronous on the thread that observed the change. The
//! subscriber list is snapshotted before iterating, so a callback may
//! subscribe or unsubscribe reentrantly without corrupting the fan-out
//! in progress.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::region::RegionStatus;

/// Handle returned by [`SubscriptionBus::subscribe`].
///
/// Slot ids are reused only after an explicit unsubscribe, never while
/// the slot is still live, so a stale id can at worst hit an empty slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

/// Observer of region state.
pub trait StorageObserver: Send + Sync {
    /// A region moved to a new status (a discrete state-machine edge).
    fn on_status_changed(&self, region_id: &str, status: RegionStatus);

    /// Byte progress for a region mid-download.
    fn on_progress(&self, region_id: &str, local_bytes: u64, remote_bytes: u64);
}

/// Slot-based subscriber registry.
#[derive(Default)]
pub struct SubscriptionBus {
    slots: Mutex<Vec<Option<Arc<dyn StorageObserver>>>>,
}

impl SubscriptionBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer and returns its slot id. The lowest free
    /// slot is reused; the vector only grows when all slots are live.
    pub fn subscribe(&self, observer: Arc<dyn StorageObserver>) -> SlotId {
        let mut slots = self.slots.lock();
        let index = match slots.iter().position(Option::is_none) {
            Some(free) => {
                slots[free] = Some(observer);
                free
            }
            None => {
                slots.push(Some(observer));
                slots.len() - 1
            }
        };
        debug!(slot = index, "observer subscribed");
        SlotId(index)
    }

    /// Releases a slot. Unknown or already-released ids are ignored.
    pub fn unsubscribe(&self, slot: SlotId) {
        let mut slots = self.slots.lock();
        if let Some(entry) = slots.get_mut(slot.0) {
            if entry.take().is_some() {
                debug!(slot = slot.0, "observer unsubscribed");
            }
        }
    }

    /// Number of live subscribers.
    pub fn len(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fans out a status transition to all current subscribers, in
    /// subscription (slot) order.
    pub fn notify_status(&self, region_id: &str, status: RegionStatus) {
        for observer in self.snapshot() {
            observer.on_status_changed(region_id, status);
        }
    }

    /// Fans out a progress update to all current subscribers.
    pub fn notify_progress(&self, region_id: &str, local_bytes: u64, remote_bytes: u64) {
        for observer in self.snapshot() {
            observer.on_progress(region_id, local_bytes, remote_bytes);
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn StorageObserver>> {
        self.slots.lock().iter().flatten().cloned().collect()
    }
}
