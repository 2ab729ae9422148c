//! The external reference table.

use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use super::release_queue::ReleaseQueue;
use super::{ExternalRef, RefMode};
use crate::alloc::Allocator;
use crate::arena::ChunkedArena;
use crate::config::{RuntimeConfig, UsageErrorPolicy};
use crate::error::{BridgeError, Result};
use crate::metrics::Counters;
use crate::object::{ManagedObject, TracingGc};
use crate::thread_state::ThreadRegistry;

const FREE: u8 = 0;
/// Allocated by `reserve`, not yet bound to an object.
const RESERVED: u8 = 1;
const LIVE: u8 = 2;

const COUNT_MASK: u64 = 0xFFFF_FFFF;

#[inline]
const fn pack(generation: u32, count: u32) -> u64 {
    ((generation as u64) << 32) | count as u64
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn generation_of(word: u64) -> u32 {
    (word >> 32) as u32
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn count_of(word: u64) -> u32 {
    (word & COUNT_MASK) as u32
}

const fn next_generation(generation: u32) -> u32 {
    match generation.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}

/// One table slot.
///
/// `word` packs the generation with the reference count so every count
/// update also re-validates the handle's generation in the same CAS.
#[derive(Default)]
pub(super) struct Slot {
    word: AtomicU64,
    state: AtomicU8,
    local: AtomicU8,
    target: AtomicUsize,
    owner: AtomicU64,
}

impl Slot {
    fn mode(&self) -> RefMode {
        if self.local.load(Ordering::Relaxed) == 0 {
            RefMode::Shared
        } else {
            RefMode::LocalOnly
        }
    }
}

/// Arena of reference-counted handles that root their targets.
///
/// Mutating operations that touch the collector (`create_*`, `initialize`,
/// `dereference`, `adopt`) require the calling thread to be `Runnable`.
/// `retain` and `release` on `Shared` handles work from any thread.
pub struct ExternalRefTable {
    threads: ThreadRegistry,
    gc: Arc<dyn TracingGc>,
    slots: ChunkedArena<Slot>,
    deferred: ReleaseQueue,
    policy: UsageErrorPolicy,
    counters: Arc<Counters>,
}

impl ExternalRefTable {
    pub(crate) fn new(
        threads: ThreadRegistry,
        gc: Arc<dyn TracingGc>,
        allocator: Arc<Allocator>,
        config: &RuntimeConfig,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            threads,
            gc,
            slots: ChunkedArena::new(allocator, config.arena_chunk_len),
            deferred: ReleaseQueue::default(),
            policy: config.usage_errors,
            counters,
        }
    }

    pub(crate) fn prime(&self) -> Result<()> {
        self.slots.prime()
    }

    /// Creates a `Shared` handle with a reference count of one and registers
    /// `obj` as a collector root.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::OutOfMemory`] if no slot can be allocated.
    ///
    /// # Panics
    ///
    /// Ends in the fatal handler if the calling thread is not `Runnable`.
    pub fn create_shared(&self, obj: ManagedObject) -> Result<ExternalRef> {
        self.create(obj, RefMode::Shared)
    }

    /// Creates a `LocalOnly` handle bound to the calling thread.
    ///
    /// Cheaper than [`create_shared`](Self::create_shared): it leaves the
    /// deferred release queue alone, and later retains and releases need no
    /// cross-thread bookkeeping because they must happen on this thread.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::OutOfMemory`] if no slot can be allocated.
    pub fn create_local(&self, obj: ManagedObject) -> Result<ExternalRef> {
        self.create(obj, RefMode::LocalOnly)
    }

    fn create(&self, obj: ManagedObject, mode: RefMode) -> Result<ExternalRef> {
        let handle = self.reserve(mode)?;
        let slot = self.slot_unchecked(handle);
        slot.target.store(obj.addr(), Ordering::Release);
        slot.state.store(LIVE, Ordering::Release);
        self.gc.register_root(obj);
        Ok(handle)
    }

    /// Allocates a handle that is not yet bound to an object.
    ///
    /// The handle holds one reference. Releasing it before
    /// [`initialize`](Self::initialize) frees the slot without touching the
    /// collector, which covers constructors that fail halfway.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::OutOfMemory`] if no slot can be allocated.
    pub fn reserve(&self, mode: RefMode) -> Result<ExternalRef> {
        let record = self.threads.require_runnable();
        if mode == RefMode::Shared {
            self.drain_if_pending();
        }

        let index = self.slots.alloc_slot()?;
        let slot = self
            .slots
            .get(index)
            .unwrap_or_else(|| unreachable!("arena returned an unbacked slot"));
        let generation = next_generation(generation_of(slot.word.load(Ordering::Relaxed)));

        slot.local
            .store(u8::from(mode == RefMode::LocalOnly), Ordering::Relaxed);
        slot.owner.store(record.key().get(), Ordering::Relaxed);
        slot.target.store(0, Ordering::Relaxed);
        slot.state.store(RESERVED, Ordering::Relaxed);
        slot.word.store(pack(generation, 1), Ordering::Release);

        Counters::bump(&self.counters.handles_created);
        let handle = ExternalRef::new(index, generation);

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_handle_created(handle, mode);

        Ok(handle)
    }

    /// Binds a reserved handle to `obj` and registers the root.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Disposed`] if the handle was released before
    /// initialization, or [`BridgeError::StaleHandle`] under the `Report`
    /// policy if it is not a reserved handle of this table.
    pub fn initialize(&self, handle: ExternalRef, obj: ManagedObject) -> Result<()> {
        self.threads.require_runnable();
        let slot = self.validate(handle)?;
        self.check_owner(slot, handle);
        if slot
            .state
            .compare_exchange(RESERVED, LIVE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return self.usage_error(BridgeError::StaleHandle(handle));
        }
        slot.target.store(obj.addr(), Ordering::Release);
        self.gc.register_root(obj);
        Ok(())
    }

    /// Adds one reference.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Disposed`] if the count already reached zero,
    /// or [`BridgeError::StaleHandle`] under the `Report` policy if the slot
    /// was reused.
    pub fn retain(&self, handle: ExternalRef) -> Result<()> {
        if handle.is_null() {
            return Ok(());
        }
        let Some(slot) = self.slots.get(handle.index()) else {
            return self.usage_error(BridgeError::StaleHandle(handle));
        };

        let mut word = slot.word.load(Ordering::Acquire);
        let mut checked_owner = false;
        loop {
            if generation_of(word) != handle.generation() {
                return self.usage_error(BridgeError::StaleHandle(handle));
            }
            let count = count_of(word);
            if count == 0 {
                return Err(BridgeError::Disposed(handle));
            }
            if !checked_owner {
                self.check_owner(slot, handle);
                checked_owner = true;
            }
            assert!(count < u32::MAX, "reference count overflow on {handle:?}");
            match slot.word.compare_exchange_weak(
                word,
                word + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(current) => word = current,
            }
        }
    }

    /// Retains only if the handle is still live. Used by weak upgrades and
    /// wrapper lookups, where a disposed handle is an expected outcome.
    ///
    /// A live `LocalOnly` handle used off its creating thread is still fatal.
    pub(crate) fn try_retain(&self, handle: ExternalRef) -> bool {
        if handle.is_null() {
            return false;
        }
        let Some(slot) = self.slots.get(handle.index()) else {
            return false;
        };
        let mut word = slot.word.load(Ordering::Acquire);
        let mut checked_owner = false;
        loop {
            if generation_of(word) != handle.generation() || count_of(word) == 0 {
                return false;
            }
            if !checked_owner {
                self.check_owner(slot, handle);
                checked_owner = true;
            }
            match slot.word.compare_exchange_weak(
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

    /// Drops one reference. At zero the root is unregistered and the slot is
    /// recycled under a new generation.
    ///
    /// Releasing [`ExternalRef::NULL`] is a no-op. If the count reaches zero
    /// on a thread that is not `Runnable`, root unregistration is deferred.
    ///
    /// # Errors
    ///
    /// Under the `Report` policy, returns [`BridgeError::DoubleRelease`] for
    /// a handle whose count is already zero and [`BridgeError::StaleHandle`]
    /// for a handle whose slot was reused. Neither touches the table.
    ///
    /// # Panics
    ///
    /// Under the `Panic` policy the same conditions panic.
    pub fn release(&self, handle: ExternalRef) -> Result<()> {
        if handle.is_null() {
            return Ok(());
        }
        let Some(slot) = self.slots.get(handle.index()) else {
            return self.usage_error(BridgeError::StaleHandle(handle));
        };

        let mut word = slot.word.load(Ordering::Acquire);
        let mut checked_owner = false;
        loop {
            if generation_of(word) != handle.generation() {
                return self.usage_error(BridgeError::StaleHandle(handle));
            }
            if count_of(word) == 0 {
                return self.usage_error(BridgeError::DoubleRelease(handle));
            }
            if !checked_owner {
                self.check_owner(slot, handle);
                checked_owner = true;
            }
            match slot.word.compare_exchange_weak(
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
            self.dispose(handle, slot);
        }
        Ok(())
    }

    fn dispose(&self, handle: ExternalRef, slot: &Slot) {
        let state = slot.state.swap(FREE, Ordering::AcqRel);
        let target = ManagedObject::from_addr(slot.target.swap(0, Ordering::AcqRel));
        self.slots.free_slot(handle.index());
        Counters::bump(&self.counters.handles_released);

        let deferred = match (state, target) {
            (LIVE, Some(obj)) if self.threads.is_runnable() => {
                self.gc.unregister_root(obj);
                false
            }
            (LIVE, Some(obj)) => {
                self.deferred.push(obj);
                Counters::bump(&self.counters.deferred_releases);
                true
            }
            _ => false,
        };

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_handle_released(handle, deferred);
        #[cfg(not(feature = "tracing"))]
        let _ = deferred;
    }

    /// Returns the handle's target.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Disposed`] if the count reached zero, the handle
    /// is null or was never initialized, and [`BridgeError::StaleHandle`]
    /// under the `Report` policy if the slot was reused.
    ///
    /// # Panics
    ///
    /// Ends in the fatal handler if the calling thread is not `Runnable`, or
    /// if a `LocalOnly` handle is used off its creating thread.
    pub fn dereference(&self, handle: ExternalRef) -> Result<ManagedObject> {
        self.threads.require_runnable();
        self.drain_if_pending();
        match self.resolve(handle) {
            Err(err @ BridgeError::StaleHandle(_)) => self.usage_error(err),
            other => other,
        }
    }

    /// Resolves without thread-state checks or usage-error policy.
    pub(crate) fn resolve(&self, handle: ExternalRef) -> Result<ManagedObject> {
        if handle.is_null() {
            return Err(BridgeError::Disposed(handle));
        }
        let slot = self.validate(handle)?;
        self.check_owner(slot, handle);
        let target = slot.target.load(Ordering::Acquire);

        // The slot may have been released and recycled while we read it.
        let word = slot.word.load(Ordering::Acquire);
        if generation_of(word) != handle.generation() {
            return Err(BridgeError::StaleHandle(handle));
        }
        if count_of(word) == 0 {
            return Err(BridgeError::Disposed(handle));
        }
        ManagedObject::from_addr(target).ok_or(BridgeError::Disposed(handle))
    }

    /// Dereferences and releases in one step, handing the object back to
    /// managed code.
    ///
    /// # Errors
    ///
    /// Same as [`dereference`](Self::dereference).
    pub fn adopt(&self, handle: ExternalRef) -> Result<ManagedObject> {
        let obj = self.dereference(handle)?;
        self.release(handle)?;
        Ok(obj)
    }

    /// Current reference count, or `None` if the slot was reused.
    #[must_use]
    pub fn refcount(&self, handle: ExternalRef) -> Option<u32> {
        let slot = self.slots.get(handle.index())?;
        let word = slot.word.load(Ordering::Acquire);
        (generation_of(word) == handle.generation()).then(|| count_of(word))
    }

    /// Mode of a live handle.
    #[must_use]
    pub fn mode(&self, handle: ExternalRef) -> Option<RefMode> {
        let slot = self.validate(handle).ok()?;
        Some(slot.mode())
    }

    /// Returns `true` while the handle's count is positive.
    #[must_use]
    pub fn is_live(&self, handle: ExternalRef) -> bool {
        self.refcount(handle).is_some_and(|count| count > 0)
    }

    /// Number of handles currently retained, reserved ones included.
    #[must_use]
    pub fn live_count(&self) -> usize {
        let mut live = 0;
        self.slots.for_each(|_, slot| {
            if count_of(slot.word.load(Ordering::Acquire)) > 0 {
                live += 1;
            }
        });
        live
    }

    /// Targets of every initialized handle with a positive count, in all
    /// modes. Only meaningful at a safepoint.
    pub(crate) fn live_targets(&self) -> Vec<ManagedObject> {
        let mut targets = Vec::new();
        self.slots.for_each(|_, slot| {
            if count_of(slot.word.load(Ordering::Acquire)) > 0
                && slot.state.load(Ordering::Acquire) == LIVE
            {
                targets.extend(ManagedObject::from_addr(
                    slot.target.load(Ordering::Acquire),
                ));
            }
        });
        targets
    }

    pub(super) const fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    /// Root unregistrations waiting for a `Runnable` thread.
    #[must_use]
    pub fn pending_deferred(&self) -> usize {
        self.deferred.len()
    }

    /// Unregisters every deferred root. The caller must be `Runnable` or hold
    /// a safepoint.
    pub(crate) fn drain_deferred(&self) -> usize {
        self.deferred.drain(|obj| self.gc.unregister_root(obj))
    }

    #[inline]
    fn drain_if_pending(&self) {
        if !self.deferred.is_empty() {
            self.drain_deferred();
        }
    }

    /// Slot for a handle whose generation matches and whose count is
    /// positive.
    fn validate(&self, handle: ExternalRef) -> Result<&Slot> {
        let Some(slot) = self.slots.get(handle.index()) else {
            return Err(BridgeError::StaleHandle(handle));
        };
        let word = slot.word.load(Ordering::Acquire);
        if generation_of(word) != handle.generation() {
            return Err(BridgeError::StaleHandle(handle));
        }
        if count_of(word) == 0 {
            return Err(BridgeError::Disposed(handle));
        }
        Ok(slot)
    }

    fn slot_unchecked(&self, handle: ExternalRef) -> &Slot {
        self.slots
            .get(handle.index())
            .unwrap_or_else(|| unreachable!("handle {handle:?} has no slot"))
    }

    fn check_owner(&self, slot: &Slot, handle: ExternalRef) {
        if slot.mode() == RefMode::Shared {
            return;
        }
        let owner = slot.owner.load(Ordering::Relaxed);
        if self.threads.current_key().map(crate::ThreadKey::get) != Some(owner) {
            self.threads.fatal(&BridgeError::WrongThread(handle));
        }
    }

    fn usage_error<T>(&self, err: BridgeError) -> Result<T> {
        match self.policy {
            UsageErrorPolicy::Panic => panic!("refbridge usage error: {err}"),
            UsageErrorPolicy::Report => {
                #[cfg(feature = "tracing")]
                crate::tracing::internal::log_usage_error(&err);
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for ExternalRefTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalRefTable")
            .field("live", &self.live_count())
            .field("pending_deferred", &self.pending_deferred())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
