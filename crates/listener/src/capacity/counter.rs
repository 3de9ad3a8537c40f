//! Pending-task accounting with edge-triggered working/idle notifications

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Capacity transition observed by external reporters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityEvent {
    /// Pending went from 0 to 1
    Working,
    /// Pending went back to 0
    Idle,
}

/// In-flight task counter
///
/// The counter never goes negative. A `Working` event fires exactly on the
/// 0→1 transition and an `Idle` event exactly on the 1→0 transition; events
/// are sent while the count lock is held so subscribers see them in order.
pub struct PendingCounter {
    capacity: usize,
    pending: Mutex<usize>,
    events: broadcast::Sender<CapacityEvent>,
}

impl PendingCounter {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            capacity,
            pending: Mutex::new(0),
            events,
        }
    }

    /// Maximum concurrent tasks
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pending(&self) -> usize {
        *self.pending.lock()
    }

    /// Slots left before reaching capacity
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(*self.pending.lock())
    }

    pub fn is_idle(&self) -> bool {
        *self.pending.lock() == 0
    }

    /// Count one more in-flight task, returning the new count
    pub fn increment(&self) -> usize {
        let mut pending = self.pending.lock();
        *pending += 1;
        if *pending == 1 {
            debug!("Worker is working");
            let _ = self.events.send(CapacityEvent::Working);
        }
        *pending
    }

    /// Count one task as finished, returning the new count
    pub fn decrement(&self) -> usize {
        let mut pending = self.pending.lock();
        match *pending {
            0 => warn!("Pending count decremented below zero, ignoring"),
            1 => {
                *pending = 0;
                debug!("Worker is idle");
                let _ = self.events.send(CapacityEvent::Idle);
            }
            _ => *pending -= 1,
        }
        *pending
    }

    /// Receive every subsequent transition
    pub fn subscribe(&self) -> broadcast::Receiver<CapacityEvent> {
        self.events.subscribe()
    }
}
