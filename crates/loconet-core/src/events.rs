//! Listener fan-out and manager events.
//!
//! Slot changes are broadcast to every registered [`SlotListener`].
//! Programming results go only to the [`ProgListener`] that owns the
//! session. [`ManagerEvent`]s let a UI or log follow the engine without
//! coupling to it.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::programmer::{ProgState, ProgrammingMode, ProgrammingResult};
use crate::slot::Slot;

/// Receives every slot change.
pub trait SlotListener: Send + Sync {
    fn notify_changed_slot(&self, slot: &Slot);
}

impl<F> SlotListener for F
where
    F: Fn(&Slot) + Send + Sync,
{
    fn notify_changed_slot(&self, slot: &Slot) {
        self(slot)
    }
}

/// Receives the outcome of one programming session.
pub trait ProgListener: Send + Sync {
    fn programming_op_reply(&self, result: &ProgrammingResult);
}

impl<F> ProgListener for F
where
    F: Fn(&ProgrammingResult) + Send + Sync,
{
    fn programming_op_reply(&self, result: &ProgrammingResult) {
        self(result)
    }
}

fn same_listener<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Shared set of slot listeners.
///
/// Cloning yields a handle to the same set, so a listener can hold one and
/// unregister itself from inside its own callback. Notification iterates a
/// snapshot taken under the lock; the lock is not held while listeners run.
#[derive(Clone, Default)]
pub struct SlotListeners {
    inner: Arc<Mutex<Vec<Arc<dyn SlotListener>>>>,
}

impl SlotListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener`; returns false if it was already registered.
    pub fn add(&self, listener: Arc<dyn SlotListener>) -> bool {
        let mut list = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if list.iter().any(|l| same_listener(l, &listener)) {
            return false;
        }
        list.push(listener);
        true
    }

    /// Unregister `listener`; returns false if it was not registered.
    pub fn remove(&self, listener: &Arc<dyn SlotListener>) -> bool {
        let mut list = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let before = list.len();
        list.retain(|l| !same_listener(l, listener));
        list.len() != before
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify(&self, slot: &Slot) {
        let snapshot: Vec<Arc<dyn SlotListener>> = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        tracing::trace!(
            listeners = snapshot.len(),
            slot = slot.index(),
            "Notifying slot listeners"
        );
        for listener in snapshot {
            listener.notify_changed_slot(slot);
        }
    }
}

impl fmt::Debug for SlotListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotListeners")
            .field("len", &self.len())
            .finish()
    }
}

/// Slot listener that logs every change using tracing.
pub struct TracingSlotListener;

impl SlotListener for TracingSlotListener {
    fn notify_changed_slot(&self, slot: &Slot) {
        tracing::debug!(
            slot = slot.index(),
            status = %slot.status(),
            address = slot.loco_address(),
            speed = slot.speed(),
            "Slot changed"
        );
    }
}

/// Events emitted by the slot manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    /// Programmer state machine moved.
    ProgStateChanged { from: ProgState, to: ProgState },
    /// Programming mode changed.
    ModeChanged {
        from: ProgrammingMode,
        to: ProgrammingMode,
    },
    /// Stale sweep re-requested a slot.
    StaleSlotRefresh { slot: u8 },
    /// A slot lookup by address was answered.
    LookupResolved { address: u16, slot: u8 },
    /// Track power restored after service-mode programming.
    PowerRestored,
    /// A frame was dropped as malformed.
    FrameDropped { reason: String },
}

/// Observer for [`ManagerEvent`]s.
pub trait ManagerObserver: Send + Sync {
    fn on_event(&self, event: &ManagerEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl ManagerObserver for NullObserver {
    fn on_event(&self, _event: &ManagerEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl ManagerObserver for TracingObserver {
    fn on_event(&self, event: &ManagerEvent) {
        match event {
            ManagerEvent::ProgStateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "Programmer state");
            }
            ManagerEvent::ModeChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Programming mode changed");
            }
            ManagerEvent::StaleSlotRefresh { slot } => {
                tracing::debug!(slot = slot, "Stale slot, re-reading");
            }
            ManagerEvent::LookupResolved { address, slot } => {
                tracing::debug!(address = address, slot = slot, "Slot lookup resolved");
            }
            ManagerEvent::PowerRestored => {
                tracing::info!("Track power restored after programming");
            }
            ManagerEvent::FrameDropped { reason } => {
                tracing::debug!(reason = %reason, "Frame dropped event");
            }
        }
    }
}
