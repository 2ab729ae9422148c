//! External reference handles.
//!
//! An [`ExternalRef`] is the stable identity foreign code holds instead of a
//! raw heap pointer. It names a slot in the [`ExternalRefTable`] by index and
//! generation; while the slot's reference count is positive its target is a
//! collector root.
//!
//! # Handle Modes
//!
//! | Mode        | retain / release       | dereference            |
//! |-------------|------------------------|------------------------|
//! | `Shared`    | any thread             | any `Runnable` thread  |
//! | `LocalOnly` | creating thread only   | creating thread only   |
//!
//! Using a `LocalOnly` handle from another thread is fatal.

mod release_queue;
mod table;
mod weak;

pub use table::ExternalRefTable;
pub use weak::WeakRef;

/// Stable identity of an external reference.
///
/// `index` names a table slot and `generation` the slot's incarnation, so a
/// handle kept past its release can never alias a newer handle that reuses
/// the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct ExternalRef {
    index: u32,
    generation: u32,
}

impl ExternalRef {
    /// The null reference. Releasing it is a no-op.
    pub const NULL: Self = Self {
        index: 0,
        generation: 0,
    };

    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Returns `true` for [`ExternalRef::NULL`].
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.index == 0
    }

    /// Slot index.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Slot generation.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Packs the handle into one word for storage in foreign memory.
    #[must_use]
    pub const fn to_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Unpacks a word produced by [`ExternalRef::to_raw`].
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

impl Default for ExternalRef {
    fn default() -> Self {
        Self::NULL
    }
}

/// Sharing mode of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefMode {
    /// May be retained and released from any thread.
    Shared,
    /// Bound to its creating thread; skips cross-thread bookkeeping.
    LocalOnly,
}
