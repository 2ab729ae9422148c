//! Allocation front-end.
//!
//! Every bridge-owned record (handle slots, wrapper records) is carved out
//! of memory obtained here. A failed backend allocation gives the collector
//! exactly one chance to free memory before the request is retried; a
//! second failure is reported as [`BridgeError::OutOfMemory`].

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{BridgeError, Result};

/// Raw allocator backend.
///
/// Implementations return `None` on exhaustion instead of aborting.
/// Returned blocks must be aligned to at least [`sys_alloc::MIN_ALIGN`].
pub trait RawAllocator: Send + Sync {
    /// Allocates `size` bytes, or returns `None` if the backend is exhausted.
    fn raw_allocate(&self, size: usize) -> Option<NonNull<u8>>;

    /// Returns a block to the backend.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `raw_allocate` on the same backend with the same
    /// `size`, and must not be used afterwards.
    unsafe fn raw_free(&self, ptr: NonNull<u8>, size: usize);
}

/// Backend over the platform heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBackend;

impl RawAllocator for SystemBackend {
    fn raw_allocate(&self, size: usize) -> Option<NonNull<u8>> {
        sys_alloc::raw_allocate(size)
    }

    unsafe fn raw_free(&self, ptr: NonNull<u8>, _size: usize) {
        // SAFETY: forwarded caller contract.
        unsafe { sys_alloc::raw_free(ptr) }
    }
}

type OomHook = Arc<dyn Fn(usize) + Send + Sync>;

/// Allocation front-end with a collector-assisted retry.
pub struct Allocator {
    backend: Arc<dyn RawAllocator>,
    oom_hook: RwLock<Option<OomHook>>,
    oom_hook_calls: AtomicUsize,
    bytes_live: AtomicUsize,
}

impl Allocator {
    /// Creates a front-end over `backend` with no out-of-memory hook.
    #[must_use]
    pub fn new(backend: Arc<dyn RawAllocator>) -> Self {
        Self {
            backend,
            oom_hook: RwLock::new(None),
            oom_hook_calls: AtomicUsize::new(0),
            bytes_live: AtomicUsize::new(0),
        }
    }

    /// Installs the hook run between a failed allocation and its retry.
    pub fn set_oom_hook(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.oom_hook.write() = Some(Arc::new(hook));
    }

    /// Allocates `size` bytes.
    ///
    /// On backend failure the out-of-memory hook runs once and the request is
    /// retried once. No further attempts are made.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::OutOfMemory`] if the retry fails as well.
    ///
    /// # Example
    ///
    /// ```
    /// use std::sync::Arc;
    /// use refbridge::{Allocator, SystemBackend};
    ///
    /// let allocator = Allocator::new(Arc::new(SystemBackend));
    /// let ptr = allocator.allocate(32).unwrap();
    /// unsafe { allocator.free(ptr, 32) };
    /// ```
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        if let Some(ptr) = self.backend.raw_allocate(size) {
            self.bytes_live.fetch_add(size, Ordering::Relaxed);
            return Ok(ptr);
        }

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_oom_retry(size);

        // Clone the hook out so it may allocate without holding the lock.
        let hook = self.oom_hook.read().clone();
        if let Some(hook) = hook {
            self.oom_hook_calls.fetch_add(1, Ordering::Relaxed);
            hook(size);
        }

        match self.backend.raw_allocate(size) {
            Some(ptr) => {
                self.bytes_live.fetch_add(size, Ordering::Relaxed);
                Ok(ptr)
            }
            None => Err(BridgeError::OutOfMemory { size }),
        }
    }

    /// Returns a block to the backend.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`Allocator::allocate`] on this allocator with the
    /// same `size`, and must not be used afterwards.
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        self.bytes_live.fetch_sub(size, Ordering::Relaxed);
        // SAFETY: forwarded caller contract.
        unsafe { self.backend.raw_free(ptr, size) };
    }

    /// Number of times the out-of-memory hook has run.
    #[must_use]
    pub fn oom_hook_calls(&self) -> usize {
        self.oom_hook_calls.load(Ordering::Relaxed)
    }

    /// Bytes currently allocated through this front-end.
    #[must_use]
    pub fn bytes_live(&self) -> usize {
        self.bytes_live.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("oom_hook_calls", &self.oom_hook_calls())
            .field("bytes_live", &self.bytes_live())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::ScriptedBackend;

    #[test]
    fn succeeds_without_hook_on_first_try() {
        let backend = Arc::new(ScriptedBackend::default());
        let allocator = Allocator::new(backend.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let hook_calls = Arc::clone(&calls);
        allocator.set_oom_hook(move |_| {
            hook_calls.fetch_add(1, Ordering::SeqCst);
        });

        let ptr = allocator.allocate(24).unwrap();
        assert_eq!(backend.attempts(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(allocator.bytes_live(), 24);
        unsafe { allocator.free(ptr, 24) };
        assert_eq!(allocator.bytes_live(), 0);
    }

    #[test]
    fn retries_once_after_hook() {
        let backend = Arc::new(ScriptedBackend::new([false]));
        let allocator = Allocator::new(backend.clone());
        let sizes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = Arc::clone(&sizes);
        allocator.set_oom_hook(move |size| seen.lock().push(size));

        let ptr = allocator.allocate(48).unwrap();
        assert_eq!(backend.attempts(), 2);
        assert_eq!(*sizes.lock(), vec![48]);
        assert_eq!(allocator.oom_hook_calls(), 1);
        unsafe { allocator.free(ptr, 48) };
    }

    #[test]
    fn second_failure_is_out_of_memory() {
        let backend = Arc::new(ScriptedBackend::new([false, false]));
        let allocator = Allocator::new(backend.clone());
        allocator.set_oom_hook(|_| {});

        let err = allocator.allocate(4096).unwrap_err();
        assert_eq!(err, BridgeError::OutOfMemory { size: 4096 });
        assert_eq!(backend.attempts(), 2);
        assert_eq!(allocator.oom_hook_calls(), 1);
    }

    #[test]
    fn missing_hook_still_retries() {
        let backend = Arc::new(ScriptedBackend::new([false]));
        let allocator = Allocator::new(backend.clone());
        let ptr = allocator.allocate(8).unwrap();
        assert_eq!(backend.attempts(), 2);
        assert_eq!(allocator.oom_hook_calls(), 0);
        unsafe { allocator.free(ptr, 8) };
    }
}
