//! Thread execution states and global safepoints.
//!
//! Every thread that touches the managed heap or the external reference
//! table is attached to a [`ThreadRegistry`] and is either `Runnable`
//! (allowed to touch managed memory) or `Native` (running foreign code,
//! ignored by safepoints). A global safepoint is reached once every attached
//! thread other than the requester is `Native` or parked in
//! [`ThreadRegistry::safepoint_poll`].
//!
//! # Protocol
//!
//! | Operation              | Blocks while a safepoint is requested? |
//! |------------------------|----------------------------------------|
//! | `switch_to_native`     | No (notifies the requester)            |
//! | `switch_to_runnable`   | Yes, until the safepoint ends          |
//! | `safepoint_poll`       | Yes, parked until the safepoint ends   |
//! | `attach_current`       | Yes, the thread joins as `Runnable`    |
//!
//! All state changes that the requester inspects happen under the registry
//! mutex, so the requester never observes a thread mid-transition.

use std::cell::RefCell;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::config::FatalHandler;
use crate::error::BridgeError;
use crate::metrics::Counters;

/// Execution state of an attached thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ThreadState {
    /// Running foreign code; must not touch managed memory.
    Native = 0,
    /// Allowed to touch managed memory; must poll safepoints.
    Runnable = 1,
}

impl ThreadState {
    const fn from_u8(value: u8) -> Self {
        if value == Self::Runnable as u8 {
            Self::Runnable
        } else {
            Self::Native
        }
    }
}

/// How a thread came to be attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    /// Explicitly attached by the embedder.
    Mutator,
    /// Implicitly attached when foreign code called into the runtime.
    Daemon,
}

/// Process-unique identity of an attached thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadKey(NonZeroU64);

impl ThreadKey {
    fn next() -> Self {
        static NEXT_THREAD_KEY: AtomicU64 = AtomicU64::new(1);
        let raw = NEXT_THREAD_KEY.fetch_add(1, Ordering::Relaxed);
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    /// Returns the raw key.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

/// Per-thread record shared between the thread and the registry.
#[derive(Debug)]
pub(crate) struct ThreadRecord {
    key: ThreadKey,
    kind: ThreadKind,
    state: CachePadded<AtomicU8>,
    parked: AtomicBool,
}

impl ThreadRecord {
    pub(crate) const fn key(&self) -> ThreadKey {
        self.key
    }

    pub(crate) fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn is_safe(&self) -> bool {
        self.state() == ThreadState::Native || self.parked.load(Ordering::Acquire)
    }
}

struct RegistryInner {
    threads: Vec<Arc<ThreadRecord>>,
    /// `Some(requester)` while a safepoint is requested. The requester may
    /// itself be unattached (e.g. the background cyclic collector).
    requester: Option<Option<ThreadKey>>,
    epoch: u64,
}

impl RegistryInner {
    fn requested_by_other(&self, key: ThreadKey) -> bool {
        matches!(self.requester, Some(requester) if requester != Some(key))
    }

    fn all_safe(&self, requester: Option<ThreadKey>) -> bool {
        self.threads
            .iter()
            .all(|t| Some(t.key) == requester || t.is_safe())
    }
}

struct Shared {
    id: u64,
    requested: AtomicBool,
    inner: Mutex<RegistryInner>,
    changed: Condvar,
    fatal: FatalHandler,
    counters: Arc<Counters>,
}

impl Shared {
    fn remove(&self, record: &Arc<ThreadRecord>) {
        let mut inner = self.inner.lock();
        inner.threads.retain(|t| !Arc::ptr_eq(t, record));
        drop(inner);
        self.changed.notify_all();
    }
}

struct CurrentThreads(Vec<(u64, Weak<Shared>, Arc<ThreadRecord>)>);

impl Drop for CurrentThreads {
    /// Threads exiting while attached leave their registries, so a safepoint
    /// never waits on a dead thread.
    fn drop(&mut self) {
        for (_, shared, record) in self.0.drain(..) {
            if let Some(shared) = shared.upgrade() {
                shared.remove(&record);
            }
        }
    }
}

thread_local! {
    static CURRENT: RefCell<CurrentThreads> = const { RefCell::new(CurrentThreads(Vec::new())) };
}

/// Registry of attached threads and coordinator of global safepoints.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct ThreadRegistry {
    shared: Arc<Shared>,
}

impl ThreadRegistry {
    pub(crate) fn new(fatal: FatalHandler, counters: Arc<Counters>) -> Self {
        static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            shared: Arc::new(Shared {
                id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
                requested: AtomicBool::new(false),
                inner: Mutex::new(RegistryInner {
                    threads: Vec::new(),
                    requester: None,
                    epoch: 0,
                }),
                changed: Condvar::new(),
                fatal,
                counters,
            }),
        }
    }

    pub(crate) fn current_record(&self) -> Option<Arc<ThreadRecord>> {
        let id = self.shared.id;
        CURRENT
            .try_with(|current| {
                current
                    .borrow()
                    .0
                    .iter()
                    .find(|(rid, _, _)| *rid == id)
                    .map(|(_, _, record)| Arc::clone(record))
            })
            .ok()
            .flatten()
    }

    /// Attaches the calling thread as `Runnable`.
    ///
    /// Returns `None` if the thread was already attached. Blocks while a
    /// safepoint is in progress.
    pub fn attach_current(&self, kind: ThreadKind) -> Option<ThreadKey> {
        if self.current_record().is_some() {
            return None;
        }

        let record = Arc::new(ThreadRecord {
            key: ThreadKey::next(),
            kind,
            state: CachePadded::new(AtomicU8::new(ThreadState::Runnable as u8)),
            parked: AtomicBool::new(false),
        });

        let mut inner = self.shared.inner.lock();
        while inner.requester.is_some() {
            self.shared.changed.wait(&mut inner);
        }
        inner.threads.push(Arc::clone(&record));
        drop(inner);

        let key = record.key;
        let entry = (self.shared.id, Arc::downgrade(&self.shared), record);
        CURRENT.with(|current| current.borrow_mut().0.push(entry));

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_thread_attached(key, kind);

        Some(key)
    }

    /// Detaches the calling thread. Returns `false` if it was not attached.
    pub fn detach_current(&self) -> bool {
        let id = self.shared.id;
        let record = CURRENT
            .try_with(|current| {
                let mut current = current.borrow_mut();
                let pos = current.0.iter().position(|(rid, _, _)| *rid == id)?;
                Some(current.0.swap_remove(pos).2)
            })
            .ok()
            .flatten();

        match record {
            Some(record) => {
                record
                    .state
                    .store(ThreadState::Native as u8, Ordering::Release);
                self.shared.remove(&record);
                true
            }
            None => false,
        }
    }

    /// Key of the calling thread, if attached.
    #[must_use]
    pub fn current_key(&self) -> Option<ThreadKey> {
        self.current_record().map(|r| r.key)
    }

    /// Attachment kind of the calling thread, if attached.
    #[must_use]
    pub fn current_kind(&self) -> Option<ThreadKind> {
        self.current_record().map(|r| r.kind)
    }

    /// State of the calling thread, if attached.
    #[must_use]
    pub fn current_state(&self) -> Option<ThreadState> {
        self.current_record().map(|r| r.state())
    }

    /// Returns `true` if the calling thread is attached and `Runnable`.
    #[must_use]
    pub fn is_runnable(&self) -> bool {
        self.current_state() == Some(ThreadState::Runnable)
    }

    /// Number of attached threads.
    #[must_use]
    pub fn attached_count(&self) -> usize {
        self.shared.inner.lock().threads.len()
    }

    /// Number of global safepoints completed so far.
    #[must_use]
    pub fn safepoint_epoch(&self) -> u64 {
        self.shared.inner.lock().epoch
    }

    /// Returns `true` while a global safepoint is requested.
    #[must_use]
    pub fn safepoint_requested(&self) -> bool {
        self.shared.requested.load(Ordering::Acquire)
    }

    /// Routes a fatal condition to the configured handler.
    pub(crate) fn fatal(&self, err: &BridgeError) -> ! {
        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_fatal(err);
        (self.shared.fatal)(err)
    }

    /// Returns the calling thread's record, or ends in the fatal handler if
    /// the thread is not attached or not `Runnable`.
    pub(crate) fn require_runnable(&self) -> Arc<ThreadRecord> {
        let Some(record) = self.current_record() else {
            self.fatal(&BridgeError::NotAttached);
        };
        let actual = record.state();
        if actual != ThreadState::Runnable {
            self.fatal(&BridgeError::WrongThreadState {
                expected: ThreadState::Runnable,
                actual,
            });
        }
        record
    }

    fn require_attached(&self) -> Arc<ThreadRecord> {
        self.current_record()
            .unwrap_or_else(|| self.fatal(&BridgeError::NotAttached))
    }

    fn check_prior(&self, record: &ThreadRecord, expected: ThreadState) {
        let actual = record.state();
        if cfg!(debug_assertions) && actual != expected {
            self.fatal(&BridgeError::WrongThreadState { expected, actual });
        }
    }

    /// Switches the calling thread from `Runnable` to `Native`.
    ///
    /// Must precede any foreign call that may block, run for unbounded time
    /// or re-enter code unaware of the runtime.
    pub fn switch_to_native(&self) {
        let record = self.require_attached();
        self.check_prior(&record, ThreadState::Runnable);

        let inner = self.shared.inner.lock();
        record
            .state
            .store(ThreadState::Native as u8, Ordering::Release);
        let notify = inner.requester.is_some();
        drop(inner);
        if notify {
            self.shared.changed.notify_all();
        }

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_state_switch(record.key, ThreadState::Native);
    }

    /// Switches the calling thread from `Native` to `Runnable`, waiting for
    /// an in-progress safepoint to finish first.
    pub fn switch_to_runnable(&self) {
        let record = self.require_attached();
        self.check_prior(&record, ThreadState::Native);

        let mut inner = self.shared.inner.lock();
        while inner.requested_by_other(record.key) {
            self.shared.changed.wait(&mut inner);
        }
        record
            .state
            .store(ThreadState::Runnable as u8, Ordering::Release);
        drop(inner);

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_state_switch(record.key, ThreadState::Runnable);
    }

    /// Switches to `Native` for the lifetime of the returned scope.
    pub fn enter_native(&self) -> NativeScope<'_> {
        self.switch_to_native();
        NativeScope { registry: self }
    }

    /// Switches to `Runnable` if the thread is `Native`; the previous state is
    /// restored when the scope ends.
    pub(crate) fn enter_runnable(&self) -> RunnableScope<'_> {
        let record = self.require_attached();
        let switched = record.state() == ThreadState::Native;
        if switched {
            self.switch_to_runnable();
        }
        RunnableScope {
            registry: self,
            switched,
        }
    }

    /// Cooperative safepoint poll.
    ///
    /// A no-op unless a safepoint is requested by another thread, in which
    /// case the calling thread parks until the safepoint ends. Generated code
    /// calls this at loop back-edges and function prologues.
    pub fn safepoint_poll(&self) {
        if !self.shared.requested.load(Ordering::Acquire) {
            return;
        }
        self.park_for_safepoint();
    }

    #[cold]
    fn park_for_safepoint(&self) {
        let Some(record) = self.current_record() else {
            return;
        };
        if record.state() != ThreadState::Runnable {
            return;
        }

        let mut inner = self.shared.inner.lock();
        if !inner.requested_by_other(record.key) {
            return;
        }
        record.parked.store(true, Ordering::Release);
        self.shared.changed.notify_all();
        while inner.requested_by_other(record.key) {
            self.shared.changed.wait(&mut inner);
        }
        record.parked.store(false, Ordering::Release);
    }

    /// Brings every other attached thread to a safepoint, runs `f`, and
    /// releases them.
    ///
    /// The caller may be `Runnable`, `Native` or unattached. If another
    /// safepoint is already in progress the caller parks behind it first.
    /// Returning from this function establishes a happens-before edge with
    /// every thread's arrival at the safepoint.
    pub fn run_at_safepoint<R>(&self, f: impl FnOnce() -> R) -> R {
        let me = self.current_record();
        let my_key = me.as_ref().map(|r| r.key);

        let mut inner = self.shared.inner.lock();
        while inner.requester.is_some() {
            if let Some(record) = &me {
                record.parked.store(true, Ordering::Release);
                self.shared.changed.notify_all();
            }
            self.shared.changed.wait(&mut inner);
        }
        if let Some(record) = &me {
            record.parked.store(false, Ordering::Release);
        }

        inner.requester = Some(my_key);
        self.shared.requested.store(true, Ordering::SeqCst);
        while !inner.all_safe(my_key) {
            self.shared.changed.wait(&mut inner);
        }
        drop(inner);

        struct EndSafepoint<'a>(&'a Shared);

        impl Drop for EndSafepoint<'_> {
            fn drop(&mut self) {
                let mut inner = self.0.inner.lock();
                inner.requester = None;
                inner.epoch += 1;
                #[cfg(feature = "tracing")]
                crate::tracing::internal::log_safepoint(inner.epoch, inner.threads.len());
                self.0.requested.store(false, Ordering::SeqCst);
                drop(inner);
                Counters::bump(&self.0.counters.safepoints);
                self.0.changed.notify_all();
            }
        }

        let _end = EndSafepoint(&self.shared);
        f()
    }
}

impl std::fmt::Debug for ThreadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRegistry")
            .field("id", &self.shared.id)
            .field("attached", &self.attached_count())
            .field("safepoint_requested", &self.safepoint_requested())
            .finish_non_exhaustive()
    }
}

/// Keeps the calling thread `Native`; switches back to `Runnable` on drop.
#[must_use = "the thread switches back to Runnable as soon as the scope is dropped"]
pub struct NativeScope<'a> {
    registry: &'a ThreadRegistry,
}

impl Drop for NativeScope<'_> {
    fn drop(&mut self) {
        self.registry.switch_to_runnable();
    }
}

/// Keeps the calling thread `Runnable`; restores `Native` on drop if the
/// scope performed the switch.
pub(crate) struct RunnableScope<'a> {
    registry: &'a ThreadRegistry,
    switched: bool,
}

impl Drop for RunnableScope<'_> {
    fn drop(&mut self) {
        if self.switched {
            self.registry.switch_to_native();
        }
    }
}
