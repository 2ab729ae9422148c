//! Deferred root unregistration.
//!
//! A `Shared` handle may reach zero on a thread that is `Native` or not
//! attached at all, where calling into the collector is forbidden. Its target
//! is parked here and unregistered by the next `Runnable` table operation, by
//! the next safepoint, or at shutdown.

use crossbeam_queue::SegQueue;

use crate::object::ManagedObject;

#[derive(Debug, Default)]
pub(crate) struct ReleaseQueue {
    pending: SegQueue<ManagedObject>,
}

impl ReleaseQueue {
    pub(crate) fn push(&self, obj: ManagedObject) {
        self.pending.push(obj);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Pops every queued object into `f`. Returns how many were drained.
    pub(crate) fn drain(&self, mut f: impl FnMut(ManagedObject)) -> usize {
        let mut drained = 0;
        while let Some(obj) = self.pending.pop() {
            f(obj);
            drained += 1;
        }
        drained
    }
}
