//! The foreign-bridge protocol.
//!
//! A [`ForeignBridge`] presents managed objects to a manually
//! reference-counted object system as [`ForeignWrapper`]s. Each wrapper owns
//! exactly one `Shared` external handle, so the object stays rooted while
//! the foreign side holds the wrapper. An identity table keyed by object
//! address keeps at most one canonical wrapper per object.
//!
//! # Lifecycle
//!
//! ```text
//! wrap(obj) ──► wrapper count 1, handle count 1
//!   retain / release (foreign side, any thread)
//!   release to 0 ──► identity entry dropped
//!                ──► ForeignObjectSystem::wrapper_deallocated
//!                ──► handle released
//!                ──► wrapper record freed
//! ```
//!
//! Exceptions never unwind through a boundary crossing: see
//! [`ForeignBridge::call_from_foreign`] and [`ForeignBridge::call_foreign`].

mod exception;
mod retain_release;

pub use exception::ManagedException;
pub use retain_release::{ForeignErrorObject, RetainReleaseSystem};

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::arena::ChunkedArena;
use crate::error::{BridgeError, Result};
use crate::handles::{ExternalRef, WeakRef};
use crate::metrics::Counters;
use crate::object::ManagedObject;
use crate::runtime::Runtime;

/// One foreign object system's side of the protocol.
///
/// Implemented once per supported system; [`RetainReleaseSystem`] is the
/// built-in retain/release variant.
pub trait ForeignObjectSystem: Send + Sync {
    /// The system's error representation.
    type Error: Send + 'static;

    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Called when a wrapper's foreign count reaches zero, before its handle
    /// is released and its record freed.
    fn wrapper_deallocated(&self, wrapper: ForeignWrapper) {
        let _ = wrapper;
    }

    /// Translates a managed exception, or `None` if it cannot be expressed
    /// in this system.
    fn exception_to_error(&self, exception: &ManagedException) -> Option<Self::Error>;

    /// Translates a foreign error raised into managed code.
    fn error_to_exception(&self, error: Self::Error) -> ManagedException;
}

/// Identity of a foreign wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForeignWrapper {
    index: u32,
    generation: u32,
}

impl ForeignWrapper {
    /// Packs the wrapper identity into one word.
    #[must_use]
    pub const fn to_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }
}

#[derive(Default)]
struct WrapperRecord {
    /// Generation in the high half, foreign reference count in the low half.
    word: AtomicU64,
    handle: AtomicU64,
    object: AtomicUsize,
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn generation_of(word: u64) -> u32 {
    (word >> 32) as u32
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn count_of(word: u64) -> u32 {
    word as u32
}

/// Bridge between the runtime and one foreign object system.
pub struct ForeignBridge<S: ForeignObjectSystem> {
    runtime: Arc<Runtime>,
    system: S,
    records: ChunkedArena<WrapperRecord>,
    identity: Mutex<HashMap<ManagedObject, ForeignWrapper>>,
    terminating: AtomicBool,
}

impl<S: ForeignObjectSystem> ForeignBridge<S> {
    /// Creates a bridge for `system` over `runtime`.
    pub fn new(runtime: Arc<Runtime>, system: S) -> Self {
        let records = ChunkedArena::new(
            runtime.shared_allocator(),
            runtime.config().arena_chunk_len,
        );
        Self {
            runtime,
            system,
            records,
            identity: Mutex::new(HashMap::new()),
            terminating: AtomicBool::new(false),
        }
    }

    /// The foreign object system.
    pub const fn system(&self) -> &S {
        &self.system
    }

    /// The runtime this bridge is attached to.
    pub const fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Returns the canonical wrapper for `obj`, retained once for the caller.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::OutOfMemory`] if a new wrapper or its handle
    /// cannot be allocated.
    ///
    /// # Panics
    ///
    /// Ends in the fatal handler if the calling thread is not `Runnable`.
    pub fn wrap(&self, obj: ManagedObject) -> Result<ForeignWrapper> {
        self.runtime.threads().require_runnable();
        if let Some(existing) = self.retain_canonical(obj) {
            return Ok(existing);
        }

        // Allocate without the identity lock: growth may run the collector's
        // out-of-memory hook, which may release wrappers.
        let refs = self.runtime.refs();
        let handle = refs.create_shared(obj)?;
        let index = match self.records.alloc_slot() {
            Ok(index) => index,
            Err(err) => {
                refs.release(handle)?;
                return Err(err);
            }
        };

        let mut identity = self.identity.lock();
        if let Some(&existing) = identity.get(&obj) {
            if self.try_retain(existing) {
                drop(identity);
                self.records.free_slot(index);
                refs.release(handle)?;
                return Ok(existing);
            }
        }

        let record = self.record_unchecked(index);
        let generation = match generation_of(record.word.load(Ordering::Relaxed)).wrapping_add(1) {
            0 => 1,
            next => next,
        };
        record.handle.store(handle.to_raw(), Ordering::Relaxed);
        record.object.store(obj.addr(), Ordering::Relaxed);
        record
            .word
            .store((u64::from(generation) << 32) | 1, Ordering::Release);

        let wrapper = ForeignWrapper { index, generation };
        // A dying wrapper removes nothing once the entry points elsewhere.
        identity.insert(obj, wrapper);
        drop(identity);
        Counters::bump(&self.runtime.counters().wrappers_created);
        Ok(wrapper)
    }

    fn retain_canonical(&self, obj: ManagedObject) -> Option<ForeignWrapper> {
        let existing = self.identity.lock().get(&obj).copied()?;
        self.try_retain(existing).then_some(existing)
    }

    /// Foreign-side retain.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Stale`] if the wrapper was already deallocated.
    pub fn retain(&self, wrapper: ForeignWrapper) -> Result<()> {
        if self.try_retain(wrapper) {
            Ok(())
        } else {
            Err(BridgeError::Stale(wrapper))
        }
    }

    fn try_retain(&self, wrapper: ForeignWrapper) -> bool {
        let Some(record) = self.records.get(wrapper.index) else {
            return false;
        };
        let mut word = record.word.load(Ordering::Acquire);
        loop {
            if generation_of(word) != wrapper.generation || count_of(word) == 0 {
                return false;
            }
            match record.word.compare_exchange_weak(
                word,
                word + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => word = current,
            }
        }
    }

    /// Foreign-side release. The last release deallocates the wrapper:
    /// the identity entry is dropped, the system is notified, and the held
    /// handle is released before the wrapper record is freed.
    ///
    /// Callable from any thread in any state.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Stale`] if the wrapper was already deallocated.
    pub fn release(&self, wrapper: ForeignWrapper) -> Result<()> {
        let Some(record) = self.records.get(wrapper.index) else {
            return Err(BridgeError::Stale(wrapper));
        };
        let mut word = record.word.load(Ordering::Acquire);
        loop {
            if generation_of(word) != wrapper.generation || count_of(word) == 0 {
                return Err(BridgeError::Stale(wrapper));
            }
            match record.word.compare_exchange_weak(
                word,
                word - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => word = current,
            }
        }

        if count_of(word) == 1 {
            self.dealloc(wrapper, record)?;
        }
        Ok(())
    }

    fn dealloc(&self, wrapper: ForeignWrapper, record: &WrapperRecord) -> Result<()> {
        if let Some(obj) = ManagedObject::from_addr(record.object.swap(0, Ordering::AcqRel)) {
            let mut identity = self.identity.lock();
            if identity.get(&obj) == Some(&wrapper) {
                identity.remove(&obj);
            }
        }

        self.system.wrapper_deallocated(wrapper);

        let handle = ExternalRef::from_raw(record.handle.swap(0, Ordering::AcqRel));
        let released = self.runtime.refs().release(handle);
        self.records.free_slot(wrapper.index);
        Counters::bump(&self.runtime.counters().wrappers_deallocated);
        released
    }

    /// Returns the managed object behind `wrapper`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Stale`] if the wrapper or its handle is gone.
    ///
    /// # Panics
    ///
    /// Ends in the fatal handler if the calling thread is not `Runnable`.
    pub fn unwrap(&self, wrapper: ForeignWrapper) -> Result<ManagedObject> {
        self.runtime.threads().require_runnable();
        let handle = self.handle_of(wrapper).ok_or(BridgeError::Stale(wrapper))?;
        match self.runtime.refs().resolve(handle) {
            Ok(obj) => Ok(obj),
            Err(BridgeError::Disposed(_) | BridgeError::StaleHandle(_)) => {
                Err(BridgeError::Stale(wrapper))
            }
            Err(err) => Err(err),
        }
    }

    /// The handle a live wrapper holds.
    #[must_use]
    pub fn handle_of(&self, wrapper: ForeignWrapper) -> Option<ExternalRef> {
        let record = self.records.get(wrapper.index)?;
        let word = record.word.load(Ordering::Acquire);
        if generation_of(word) != wrapper.generation || count_of(word) == 0 {
            return None;
        }
        let handle = ExternalRef::from_raw(record.handle.load(Ordering::Acquire));
        (!handle.is_null()).then_some(handle)
    }

    /// Foreign reference count of a live wrapper.
    #[must_use]
    pub fn refcount(&self, wrapper: ForeignWrapper) -> Option<u32> {
        let record = self.records.get(wrapper.index)?;
        let word = record.word.load(Ordering::Acquire);
        (generation_of(word) == wrapper.generation && count_of(word) > 0).then(|| count_of(word))
    }

    /// The canonical wrapper currently registered for `obj`, without
    /// retaining it.
    #[must_use]
    pub fn wrapper_for(&self, obj: ManagedObject) -> Option<ForeignWrapper> {
        self.identity.lock().get(&obj).copied()
    }

    /// Number of objects with a canonical wrapper.
    #[must_use]
    pub fn wrapper_count(&self) -> usize {
        self.identity.lock().len()
    }

    /// Weak reference to the object behind `wrapper`, for the foreign
    /// system's weak storage.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Stale`] if the wrapper is gone.
    pub fn weak(&self, wrapper: ForeignWrapper) -> Result<WeakRef> {
        let handle = self.handle_of(wrapper).ok_or(BridgeError::Stale(wrapper))?;
        Ok(self.runtime.refs().downgrade(handle))
    }

    /// Loads a weak reference: the canonical wrapper, retained for the
    /// caller, or `None` if the strong side already released the object.
    ///
    /// # Panics
    ///
    /// Ends in the fatal handler if the calling thread is not `Runnable`.
    pub fn load_weak(&self, weak: WeakRef) -> Option<ForeignWrapper> {
        self.runtime.threads().require_runnable();
        let refs = self.runtime.refs();
        // Hold a count across the wrap so a concurrent last release cannot
        // unroot the object in between.
        let handle = refs.upgrade(weak)?;
        let wrapper = refs.dereference(handle).and_then(|obj| self.wrap(obj));
        refs.release(handle).ok()?;
        wrapper.ok()
    }

    /// Runs managed code on behalf of a foreign caller.
    ///
    /// Unknown threads are attached as daemons and park in `Native` between
    /// callbacks. The thread is `Runnable` while `f` runs. A managed
    /// exception, returned or thrown, is translated into the system's error
    /// type.
    ///
    /// # Errors
    ///
    /// Returns the translated foreign error.
    ///
    /// # Panics
    ///
    /// Ends in the fatal handler with
    /// [`BridgeError::UnhandledForeignException`] if the exception cannot be
    /// translated, the unwinding payload is not a managed exception, or a
    /// previous translation failure is already terminating the process.
    pub fn call_from_foreign<R>(
        &self,
        f: impl FnOnce() -> std::result::Result<R, ManagedException>,
    ) -> std::result::Result<R, S::Error> {
        let threads = self.runtime.threads();
        if self.runtime.ensure_attached() {
            threads.switch_to_native();
        }

        let outcome = {
            let _runnable = threads.enter_runnable();
            catch_unwind(AssertUnwindSafe(f))
        };

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(exception)) => Err(self.translate(&exception)),
            Err(payload) => match payload.downcast::<ManagedException>() {
                Ok(exception) => Err(self.translate(&exception)),
                Err(payload) => self.terminate(exception::describe_payload(&*payload)),
            },
        }
    }

    /// Calls into foreign code from managed code.
    ///
    /// The thread is `Native` while `f` runs. A foreign error, returned or
    /// thrown as a panic payload, becomes a [`ManagedException`].
    ///
    /// # Errors
    ///
    /// Returns the translated managed exception.
    ///
    /// # Panics
    ///
    /// Ends in the fatal handler if the calling thread is not `Runnable`, or
    /// with [`BridgeError::UnhandledForeignException`] if `f` unwinds with a
    /// payload that is not the system's error type.
    pub fn call_foreign<R>(
        &self,
        f: impl FnOnce() -> std::result::Result<R, S::Error>,
    ) -> std::result::Result<R, ManagedException> {
        let threads = self.runtime.threads();
        threads.require_runnable();

        let outcome = {
            let _native = threads.enter_native();
            catch_unwind(AssertUnwindSafe(f))
        };

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(self.system.error_to_exception(error)),
            Err(payload) => match payload.downcast::<S::Error>() {
                Ok(error) => Err(self.system.error_to_exception(*error)),
                Err(payload) => self.terminate(exception::describe_payload(&*payload)),
            },
        }
    }

    fn translate(&self, exception: &ManagedException) -> S::Error {
        if self.terminating.load(Ordering::Acquire) {
            self.terminate(exception.to_string());
        }
        match self.system.exception_to_error(exception) {
            Some(error) => error,
            None => self.terminate(exception.to_string()),
        }
    }

    #[cold]
    fn terminate(&self, description: String) -> ! {
        self.terminating.store(true, Ordering::Release);
        self.runtime.fatal(&BridgeError::UnhandledForeignException(format!(
            "{} ({})",
            description,
            self.system.name()
        )))
    }

    fn record_unchecked(&self, index: u32) -> &WrapperRecord {
        self.records
            .get(index)
            .unwrap_or_else(|| unreachable!("arena returned an unbacked slot"))
    }
}

impl<S: ForeignObjectSystem + std::fmt::Debug> std::fmt::Debug for ForeignBridge<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForeignBridge")
            .field("system", &self.system)
            .field("wrappers", &self.wrapper_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_runtime;
    use crate::{ThreadKind, ThreadState};

    fn bridge() -> (Arc<crate::heap::Heap>, ForeignBridge<RetainReleaseSystem>) {
        let (heap, runtime) = test_runtime();
        (heap, ForeignBridge::new(runtime, RetainReleaseSystem::new("Test")))
    }

    #[test]
    fn wrap_is_canonical_until_dealloc() {
        let (heap, bridge) = bridge();
        let runtime = Arc::clone(bridge.runtime());
        let _attached = runtime.attach_current_thread(ThreadKind::Mutator);

        let obj = heap.allocate(0);
        let first = bridge.wrap(obj).unwrap();
        let second = bridge.wrap(obj).unwrap();
        assert_eq!(first, second);
        assert_eq!(bridge.refcount(first), Some(2));
        assert_eq!(runtime.refs().live_count(), 1);

        bridge.release(first).unwrap();
        bridge.release(second).unwrap();
        assert_eq!(bridge.system().deallocated(), vec![first]);
        assert_eq!(bridge.wrapper_for(obj), None);
        assert_eq!(runtime.refs().live_count(), 0);

        let third = bridge.wrap(obj).unwrap();
        assert_ne!(third, first);
        bridge.release(third).unwrap();
    }

    #[test]
    fn unwrap_after_dealloc_is_stale() {
        let (heap, bridge) = bridge();
        let runtime = Arc::clone(bridge.runtime());
        let _attached = runtime.attach_current_thread(ThreadKind::Mutator);

        let obj = heap.allocate(0);
        let wrapper = bridge.wrap(obj).unwrap();
        assert_eq!(bridge.unwrap(wrapper), Ok(obj));
        bridge.release(wrapper).unwrap();
        assert_eq!(bridge.unwrap(wrapper), Err(BridgeError::Stale(wrapper)));
        assert_eq!(bridge.release(wrapper), Err(BridgeError::Stale(wrapper)));
        assert_eq!(bridge.retain(wrapper), Err(BridgeError::Stale(wrapper)));
    }

    #[test]
    fn wrapper_keeps_object_rooted() {
        let (heap, bridge) = bridge();
        let runtime = Arc::clone(bridge.runtime());
        let _attached = runtime.attach_current_thread(ThreadKind::Mutator);

        let obj = heap.allocate(0);
        let wrapper = bridge.wrap(obj).unwrap();
        heap.collect(&[]);
        assert!(heap.is_live(obj));

        bridge.release(wrapper).unwrap();
        heap.collect(&[]);
        assert!(!heap.is_live(obj));
    }

    #[test]
    fn weak_load_returns_wrapper_until_released() {
        let (heap, bridge) = bridge();
        let runtime = Arc::clone(bridge.runtime());
        let _attached = runtime.attach_current_thread(ThreadKind::Mutator);

        let obj = heap.allocate(0);
        let wrapper = bridge.wrap(obj).unwrap();
        let weak = bridge.weak(wrapper).unwrap();

        let loaded = bridge.load_weak(weak).unwrap();
        assert_eq!(loaded, wrapper);
        assert_eq!(bridge.refcount(wrapper), Some(2));
        // The temporary count taken while loading is gone again.
        let handle = bridge.handle_of(wrapper).unwrap();
        assert_eq!(runtime.refs().refcount(handle), Some(1));
        assert_eq!(heap.root_count(obj), 1);
        bridge.release(loaded).unwrap();

        bridge.release(wrapper).unwrap();
        assert_eq!(bridge.load_weak(weak), None);
    }

    #[test]
    fn foreign_release_from_unattached_thread() {
        let (heap, bridge) = bridge();
        let bridge = Arc::new(bridge);
        let runtime = Arc::clone(bridge.runtime());
        let _attached = runtime.attach_current_thread(ThreadKind::Mutator);

        let obj = heap.allocate(0);
        let wrapper = bridge.wrap(obj).unwrap();
        let remote = Arc::clone(&bridge);
        std::thread::spawn(move || remote.release(wrapper))
            .join()
            .unwrap()
            .unwrap();

        assert_eq!(bridge.wrapper_count(), 0);
        assert_eq!(runtime.refs().pending_deferred(), 1);
        assert_eq!(runtime.metrics().wrappers_deallocated, 1);
    }

    #[test]
    fn call_from_foreign_attaches_daemon_and_translates() {
        let (_heap, bridge) = bridge();
        let bridge = Arc::new(bridge);
        let remote = Arc::clone(&bridge);

        let (result, state) = std::thread::spawn(move || {
            let result: std::result::Result<(), _> = remote.call_from_foreign(|| {
                assert!(remote.runtime().threads().is_runnable());
                ManagedException::new("IllegalStateException", "bad").throw()
            });
            (result, remote.runtime().threads().current_state())
        })
        .join()
        .unwrap();

        let error = result.unwrap_err();
        assert_eq!(error.domain, "Test");
        assert_eq!(error.description, "IllegalStateException: bad");
        assert_eq!(state, Some(ThreadState::Native));
    }

    #[test]
    fn call_foreign_switches_to_native() {
        let (_heap, bridge) = bridge();
        let runtime = Arc::clone(bridge.runtime());
        let _attached = runtime.attach_current_thread(ThreadKind::Mutator);

        let value = bridge
            .call_foreign(|| Ok::<_, ForeignErrorObject>(runtime.threads().current_state()))
            .unwrap();
        assert_eq!(value, Some(ThreadState::Native));
        assert_eq!(runtime.threads().current_state(), Some(ThreadState::Runnable));
    }
}
