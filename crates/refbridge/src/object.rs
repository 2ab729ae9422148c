//! Managed object identity and the tracing collector seam.

use std::fmt;
use std::num::NonZeroUsize;

/// Address of an object on the traced heap.
///
/// The collector must not relocate an object while any external handle or
/// atomic root refers to it, so the address doubles as a stable identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ManagedObject(NonZeroUsize);

impl ManagedObject {
    /// Creates an object reference from a raw address, `None` for null.
    #[must_use]
    pub const fn from_addr(addr: usize) -> Option<Self> {
        match NonZeroUsize::new(addr) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// Returns the object's address.
    #[must_use]
    pub const fn addr(self) -> usize {
        self.0.get()
    }
}

impl fmt::Debug for ManagedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ManagedObject({:#x})", self.addr())
    }
}

/// The tracing collector, as seen from the bridge.
///
/// The bridge never marks or sweeps on its own. It tells the collector which
/// objects are externally rooted, asks it to free memory when the allocator
/// backend runs dry, and hands it whole dead cycles found among atomic
/// roots.
pub trait TracingGc: Send + Sync {
    /// Adds one root reference to `obj`. Called when a handle's reference
    /// count goes from 0 to 1.
    fn register_root(&self, obj: ManagedObject);

    /// Drops one root reference to `obj`. Called when a handle's reference
    /// count returns to 0.
    fn unregister_root(&self, obj: ManagedObject);

    /// Gives the collector a chance to free memory before an allocation of
    /// `size` bytes is retried.
    fn on_out_of_memory(&self, size: usize);

    /// Every registered root with the number of times it is registered.
    ///
    /// This includes the registrations made through this trait, so a full
    /// cyclic pass subtracts its own atomic-root pins and treats whatever
    /// remains as an ordinary root.
    fn roots(&self) -> Vec<(ManagedObject, usize)>;

    /// Returns the objects directly referenced by `obj`.
    fn references(&self, obj: ManagedObject) -> Vec<ManagedObject>;

    /// Frees a set of objects proven unreachable. The set is released as a
    /// unit; members may reference each other.
    fn reclaim(&self, objects: &[ManagedObject]);
}
