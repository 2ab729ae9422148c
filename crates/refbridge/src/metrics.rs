//! Bridge metrics and statistics.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Snapshot of the runtime's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeMetrics {
    /// Handles created since start (shared and local).
    pub handles_created: usize,
    /// Handles whose reference count reached zero.
    pub handles_released: usize,
    /// Handles currently retained.
    pub handles_live: usize,
    /// Root unregistrations that were deferred to a `Runnable` thread.
    pub deferred_releases: usize,
    /// Times the allocator ran the out-of-memory hook.
    pub oom_hook_calls: usize,
    /// Global safepoints completed.
    pub safepoints: usize,
    /// Full cyclic passes completed.
    pub cyclic_passes: usize,
    /// Objects reclaimed by the cyclic collector.
    pub cyclic_reclaimed: usize,
    /// Canonical foreign wrappers created.
    pub wrappers_created: usize,
    /// Foreign wrappers deallocated.
    pub wrappers_deallocated: usize,
}

/// Live counters shared by the runtime's components.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub handles_created: AtomicUsize,
    pub handles_released: AtomicUsize,
    pub deferred_releases: AtomicUsize,
    pub safepoints: AtomicUsize,
    pub cyclic_passes: AtomicUsize,
    pub cyclic_reclaimed: AtomicUsize,
    pub wrappers_created: AtomicUsize,
    pub wrappers_deallocated: AtomicUsize,
}

impl Counters {
    #[inline]
    pub fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self, oom_hook_calls: usize) -> BridgeMetrics {
        let created = self.handles_created.load(Ordering::Relaxed);
        let released = self.handles_released.load(Ordering::Relaxed);
        BridgeMetrics {
            handles_created: created,
            handles_released: released,
            handles_live: created.saturating_sub(released),
            deferred_releases: self.deferred_releases.load(Ordering::Relaxed),
            oom_hook_calls,
            safepoints: self.safepoints.load(Ordering::Relaxed),
            cyclic_passes: self.cyclic_passes.load(Ordering::Relaxed),
            cyclic_reclaimed: self.cyclic_reclaimed.load(Ordering::Relaxed),
            wrappers_created: self.wrappers_created.load(Ordering::Relaxed),
            wrappers_deallocated: self.wrappers_deallocated.load(Ordering::Relaxed),
        }
    }
}
