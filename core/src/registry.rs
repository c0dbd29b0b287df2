// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

//! Process-wide single-slot bookkeeping for the active stream.
//!
//! The dispatcher consults this to refuse mutating actions while a turn is
//! in flight, and the cancel path resolves asynchronously relative to the
//! turn task: cancel flips the canceled flag and fires the stored
//! cancellation token; the turn observes it at its next suspension point.

use std::sync::Mutex;

use bb7_protocol::RequestId;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Slot {
    active: Option<RequestId>,
    cancel: Option<CancellationToken>,
    canceled: bool,
}

#[derive(Default)]
pub struct StreamRegistry {
    slot: Mutex<Slot>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for `id`. Fails when another stream is active.
    pub fn reserve(&self, id: &RequestId) -> bool {
        let mut slot = self.slot.lock().unwrap();
        if slot.active.is_some() {
            return false;
        }
        slot.active = Some(id.clone());
        slot.cancel = None;
        slot.canceled = false;
        true
    }

    /// Attach the cancellation token for the reserved stream. Fails when the
    /// slot no longer belongs to `id`.
    pub fn set_cancel(&self, id: &RequestId, token: CancellationToken) -> bool {
        let mut slot = self.slot.lock().unwrap();
        if slot.active.as_ref() != Some(id) {
            return false;
        }
        slot.cancel = Some(token);
        true
    }

    /// Cancel the active stream. With a target id the slot must match; with
    /// no target any active stream is canceled. Returns whether a stream was
    /// actually canceled, so a cancel for an already-finished turn can be
    /// answered with an error.
    pub fn cancel(&self, target: Option<&RequestId>) -> bool {
        let mut slot = self.slot.lock().unwrap();
        let matches = match (&slot.active, target) {
            (Some(active), Some(target)) => active == target,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return false;
        }
        slot.canceled = true;
        if let Some(token) = &slot.cancel {
            token.cancel();
        }
        true
    }

    pub fn was_canceled(&self, id: &RequestId) -> bool {
        let slot = self.slot.lock().unwrap();
        slot.active.as_ref() == Some(id) && slot.canceled
    }

    /// Release the slot. No-op when the slot belongs to someone else.
    pub fn clear(&self, id: &RequestId) {
        let mut slot = self.slot.lock().unwrap();
        if slot.active.as_ref() == Some(id) {
            *slot = Slot::default();
        }
    }

    pub fn has_active(&self) -> bool {
        self.slot.lock().unwrap().active.is_some()
    }
}
