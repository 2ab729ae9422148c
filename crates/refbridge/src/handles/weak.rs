//! Weak references to external handles.

use super::{ExternalRef, ExternalRefTable};
use crate::error::BridgeError;
use crate::object::ManagedObject;

/// A non-owning reference to a handle.
///
/// A `WeakRef` remembers the handle's identity but holds no count. Once the
/// strong side releases the handle, loads report the object as gone; a
/// recycled slot is never mistaken for the original because the generation
/// no longer matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WeakRef {
    handle: ExternalRef,
}

impl WeakRef {
    /// Weak reference that never loads.
    pub const EMPTY: Self = Self {
        handle: ExternalRef::NULL,
    };

    /// The handle identity this weak reference observes.
    #[must_use]
    pub const fn handle(self) -> ExternalRef {
        self.handle
    }
}

impl ExternalRefTable {
    /// Creates a weak reference to `handle` without touching its count.
    #[must_use]
    pub const fn downgrade(&self, handle: ExternalRef) -> WeakRef {
        WeakRef { handle }
    }

    /// Returns the target if the strong side still holds the handle, `None`
    /// if it is gone.
    ///
    /// # Panics
    ///
    /// Ends in the fatal handler if the calling thread is not `Runnable`.
    #[must_use]
    pub fn load_weak(&self, weak: WeakRef) -> Option<ManagedObject> {
        self.threads().require_runnable();
        match self.resolve(weak.handle) {
            Ok(obj) => Some(obj),
            Err(BridgeError::Disposed(_) | BridgeError::StaleHandle(_)) => None,
            Err(err) => unreachable!("resolve only reports lifecycle errors, got {err}"),
        }
    }

    /// Adds a strong reference if the handle is still live.
    ///
    /// On success the returned handle is the original one with its count
    /// incremented; the caller must release it.
    ///
    /// # Panics
    ///
    /// Ends in the fatal handler if a live `LocalOnly` handle is upgraded off
    /// its creating thread.
    #[must_use]
    pub fn upgrade(&self, weak: WeakRef) -> Option<ExternalRef> {
        self.try_retain(weak.handle).then_some(weak.handle)
    }
}
