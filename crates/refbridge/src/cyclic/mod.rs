//! Cyclic collector for atomic roots.
//!
//! Objects shared across workers ("atomic roots") stay pinned with the
//! tracing collector, because no single worker's local pass can tell whether
//! another worker still reaches them. This module decides that globally:
//! a full pass stops every worker at a safepoint, snapshots the graph
//! reachable from the atomic roots, and reclaims every strongly connected
//! component that no live handle, worker-local reference or ordinary
//! collector root can reach.
//!
//! # Bookkeeping
//!
//! Root additions, removals and writes through atomic roots are appended to
//! a lock-free log owned by the calling worker (or a shared log for threads
//! that are not workers). Logs are merged into the root set when a worker
//! calls [`CyclicCollector::collector_callback`] or
//! [`CyclicCollector::local_gc`], and unconditionally at the start of every
//! full pass.
//!
//! # Passes
//!
//! With `cyclic_background` set, [`CyclicCollector::schedule_garbage_collect`]
//! hands the pass to the `refbridge-cyclic` thread and returns a
//! [`PassTicket`]; otherwise the pass runs on the scheduling thread.

mod graph;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex, RwLock};

use self::graph::ObjectGraph;
use crate::config::RuntimeConfig;
use crate::handles::ExternalRefTable;
use crate::metrics::Counters;
use crate::object::{ManagedObject, TracingGc};
use crate::thread_state::{ThreadKey, ThreadRegistry};

/// Identity of a worker registered with the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    /// Returns the raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Receipt for a scheduled full pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PassTicket(u64);

/// Outcome of one full cyclic pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CyclicPassReport {
    /// Sequence number of the pass, starting at 1. Zero for a skipped pass.
    pub pass: u64,
    /// Atomic roots at the start of the pass.
    pub roots: usize,
    /// Objects reachable from the atomic roots.
    pub nodes: usize,
    /// Dead strongly connected components reclaimed.
    pub dead_components: usize,
    /// Every reclaimed object, grouped by component in processing order.
    pub reclaimed: Vec<ManagedObject>,
}

#[derive(Debug, Clone, Copy)]
enum RootEvent {
    Added(ManagedObject),
    Removed(ManagedObject),
    Mutated(ManagedObject),
}

type RootProvider = Box<dyn Fn() -> Vec<ManagedObject> + Send + Sync>;

#[derive(Default)]
struct WorkerLog {
    events: SegQueue<RootEvent>,
    local_refs: Mutex<Vec<ManagedObject>>,
    provider: RwLock<Option<RootProvider>>,
}

impl WorkerLog {
    /// The worker's local references as of now. Only called at a safepoint,
    /// while the worker is parked or `Native`.
    fn snapshot(&self, into: &mut Vec<ManagedObject>) {
        into.extend(self.local_refs.lock().iter().copied());
        if let Some(provider) = self.provider.read().as_ref() {
            into.extend(provider());
        }
    }
}

#[derive(Default)]
struct RootSet {
    /// Multiset: an object may be added as an atomic root more than once.
    roots: HashMap<ManagedObject, usize>,
    /// Values written through atomic roots since the last pass.
    dirty: HashSet<ManagedObject>,
    changed: bool,
}

impl RootSet {
    fn merge(&mut self, events: &SegQueue<RootEvent>) {
        while let Some(event) = events.pop() {
            self.changed = true;
            match event {
                RootEvent::Added(obj) => *self.roots.entry(obj).or_default() += 1,
                RootEvent::Removed(obj) => {
                    if let Some(count) = self.roots.get_mut(&obj) {
                        *count -= 1;
                        if *count == 0 {
                            self.roots.remove(&obj);
                        }
                    }
                }
                RootEvent::Mutated(obj) => {
                    self.dirty.insert(obj);
                }
            }
        }
    }

    fn needs_pass(&self) -> bool {
        self.changed || !self.dirty.is_empty()
    }
}

struct Schedule {
    requested: u64,
    completed: u64,
    shutdown: bool,
}

struct Inner {
    threads: ThreadRegistry,
    refs: Arc<ExternalRefTable>,
    gc: Arc<dyn TracingGc>,
    counters: Arc<Counters>,
    enabled: AtomicBool,
    unbound: SegQueue<RootEvent>,
    workers: RwLock<HashMap<WorkerId, Arc<WorkerLog>>>,
    bindings: RwLock<HashMap<ThreadKey, WorkerId>>,
    next_worker: AtomicU64,
    roots: Mutex<RootSet>,
    schedule: Mutex<Schedule>,
    schedule_changed: Condvar,
}

impl Inner {
    fn worker(&self, worker: WorkerId) -> Option<Arc<WorkerLog>> {
        self.workers.read().get(&worker).cloned()
    }

    fn record(&self, key: ThreadKey, event: RootEvent) {
        let bound = self.bindings.read().get(&key).copied();
        match bound.and_then(|worker| self.worker(worker)) {
            Some(log) => log.events.push(event),
            None => self.unbound.push(event),
        }
    }

    fn merge_all(&self, roots: &mut RootSet) {
        roots.merge(&self.unbound);
        for log in self.workers.read().values() {
            roots.merge(&log.events);
        }
    }

    /// Runs a full pass at a safepoint and settles every ticket issued
    /// before it started.
    fn collect(&self) -> CyclicPassReport {
        let satisfies = self.schedule.lock().requested;
        let report = if self.enabled.load(Ordering::Acquire) {
            self.threads.run_at_safepoint(|| self.full_pass())
        } else {
            CyclicPassReport::default()
        };

        let mut schedule = self.schedule.lock();
        schedule.completed = schedule.completed.max(satisfies);
        drop(schedule);
        self.schedule_changed.notify_all();
        report
    }

    fn full_pass(&self) -> CyclicPassReport {
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::trace_cyclic_pass(
            "full",
            crate::tracing::internal::next_pass_id(),
        );

        self.refs.drain_deferred();
        let mut roots = self.roots.lock();
        self.merge_all(&mut roots);

        let mut external = self.refs.live_targets();
        for log in self.workers.read().values() {
            log.snapshot(&mut external);
        }
        // A value just written through an atomic root is assumed reachable
        // from its writer until the next pass.
        external.extend(roots.dirty.drain());
        // Registrations beyond our own pins belong to ordinary roots.
        external.extend(
            self.gc
                .roots()
                .into_iter()
                .filter(|(obj, count)| *count > roots.roots.get(obj).copied().unwrap_or(0))
                .map(|(obj, _)| obj),
        );

        let root_count = roots.roots.len();
        let graph = ObjectGraph::discover(roots.roots.keys().copied(), |obj| {
            self.gc.references(obj)
        });
        let live = graph.reachable_from(external, |obj| self.gc.references(obj));

        // Reachability is closed over a component, so a component is either
        // entirely live or entirely dead.
        let mut dead_components = 0;
        let mut reclaimed = Vec::new();
        for component in graph.strongly_connected_components() {
            if component.iter().any(|&id| live[id]) {
                continue;
            }
            let members: Vec<ManagedObject> = component.iter().map(|&id| graph.node(id)).collect();
            for obj in &members {
                if let Some(pins) = roots.roots.remove(obj) {
                    for _ in 0..pins {
                        self.gc.unregister_root(*obj);
                    }
                }
            }
            self.gc.reclaim(&members);
            dead_components += 1;
            reclaimed.extend(members);
        }
        roots.changed = false;
        drop(roots);

        let pass = self.counters.cyclic_passes.fetch_add(1, Ordering::Relaxed) as u64 + 1;
        Counters::add(&self.counters.cyclic_reclaimed, reclaimed.len());

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_cyclic_pass(graph.len(), dead_components, reclaimed.len());

        CyclicPassReport {
            pass,
            roots: root_count,
            nodes: graph.len(),
            dead_components,
            reclaimed,
        }
    }

    fn background_loop(&self) {
        loop {
            let mut schedule = self.schedule.lock();
            while schedule.completed >= schedule.requested && !schedule.shutdown {
                self.schedule_changed.wait(&mut schedule);
            }
            if schedule.shutdown {
                return;
            }
            drop(schedule);
            self.collect();
        }
    }
}

/// Collector for cycles among atomic roots.
pub struct CyclicCollector {
    inner: Arc<Inner>,
    background: Mutex<Option<JoinHandle<()>>>,
}

impl CyclicCollector {
    pub(crate) fn new(
        threads: ThreadRegistry,
        refs: Arc<ExternalRefTable>,
        gc: Arc<dyn TracingGc>,
        counters: Arc<Counters>,
        config: &RuntimeConfig,
    ) -> Self {
        let inner = Arc::new(Inner {
            threads,
            refs,
            gc,
            counters,
            enabled: AtomicBool::new(config.cyclic_collector),
            unbound: SegQueue::new(),
            workers: RwLock::new(HashMap::new()),
            bindings: RwLock::new(HashMap::new()),
            next_worker: AtomicU64::new(1),
            roots: Mutex::new(RootSet::default()),
            schedule: Mutex::new(Schedule {
                requested: 0,
                completed: 0,
                shutdown: false,
            }),
            schedule_changed: Condvar::new(),
        });

        // Without a thread, passes simply run inline.
        let background = if config.cyclic_background {
            let worker = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("refbridge-cyclic".into())
                .spawn(move || worker.background_loop())
                .ok()
        } else {
            None
        };

        Self {
            inner,
            background: Mutex::new(background),
        }
    }

    /// Registers the calling thread as a worker. Root events recorded on this
    /// thread go to the worker's own log.
    ///
    /// # Panics
    ///
    /// Ends in the fatal handler if the calling thread is not `Runnable`.
    pub fn add_worker(&self) -> WorkerId {
        let record = self.inner.threads.require_runnable();
        let id = WorkerId(self.inner.next_worker.fetch_add(1, Ordering::Relaxed));
        self.inner.workers.write().insert(id, Arc::default());
        self.inner.bindings.write().insert(record.key(), id);
        id
    }

    /// Deregisters a worker, merging its pending log. Removing the last
    /// worker while the collector is enabled runs a final full pass.
    pub fn remove_worker(&self, worker: WorkerId) {
        let Some(log) = self.inner.workers.write().remove(&worker) else {
            return;
        };
        self.inner.bindings.write().retain(|_, bound| *bound != worker);
        self.inner.roots.lock().merge(&log.events);

        if self.inner.workers.read().is_empty() && self.is_enabled() {
            self.inner.collect();
        }
    }

    /// Number of registered workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.inner.workers.read().len()
    }

    /// Marks `obj` as visible to more than one worker and pins it with the
    /// tracing collector.
    ///
    /// # Panics
    ///
    /// Ends in the fatal handler if the calling thread is not `Runnable`.
    pub fn add_atomic_root(&self, obj: ManagedObject) {
        let record = self.inner.threads.require_runnable();
        self.inner.gc.register_root(obj);
        self.inner.record(record.key(), RootEvent::Added(obj));
    }

    /// Undoes one [`add_atomic_root`](Self::add_atomic_root).
    ///
    /// # Panics
    ///
    /// Ends in the fatal handler if the calling thread is not `Runnable`.
    pub fn remove_atomic_root(&self, obj: ManagedObject) {
        let record = self.inner.threads.require_runnable();
        self.inner.record(record.key(), RootEvent::Removed(obj));
        self.inner.gc.unregister_root(obj);
    }

    /// Records that `new_value` was written through an atomic root.
    ///
    /// # Panics
    ///
    /// Ends in the fatal handler if the calling thread is not `Runnable`.
    pub fn mutate_atomic_root(&self, new_value: ManagedObject) {
        let record = self.inner.threads.require_runnable();
        self.inner.record(record.key(), RootEvent::Mutated(new_value));
    }

    /// Called by a worker at a safe point. Merges the worker's log and
    /// replaces its set of local references into the atomic graph.
    ///
    /// The reported set is a snapshot: it stays in force until the next
    /// callback. A worker whose local references change between callbacks
    /// installs a [`set_root_provider`](Self::set_root_provider) instead.
    pub fn collector_callback(&self, worker: WorkerId, local_refs: &[ManagedObject]) {
        let Some(log) = self.inner.worker(worker) else {
            return;
        };
        *log.local_refs.lock() = local_refs.to_vec();
        self.inner.roots.lock().merge(&log.events);
    }

    /// Installs a callback that reports the worker's local references.
    ///
    /// Every full pass calls it after all workers reached the safepoint, so
    /// it sees the worker's roots as of its arrival. It runs on the thread
    /// performing the pass and must not call back into the collector.
    pub fn set_root_provider(
        &self,
        worker: WorkerId,
        provider: impl Fn() -> Vec<ManagedObject> + Send + Sync + 'static,
    ) {
        if let Some(log) = self.inner.worker(worker) {
            *log.provider.write() = Some(Box::new(provider));
        }
    }

    /// Fast, worker-scoped step: merges the worker's log and schedules a
    /// full pass if the atomic graph changed since the last one.
    ///
    /// Reclamation itself always needs every worker stopped, so this never
    /// frees objects on its own.
    pub fn local_gc(&self, worker: WorkerId) -> Option<PassTicket> {
        let log = self.inner.worker(worker)?;
        let needs_pass = {
            let mut roots = self.inner.roots.lock();
            roots.merge(&log.events);
            roots.merge(&self.inner.unbound);
            roots.needs_pass()
        };
        (needs_pass && self.is_enabled()).then(|| self.schedule_garbage_collect())
    }

    /// Requests a full cross-worker pass.
    ///
    /// With a background thread this returns immediately; pass the ticket to
    /// [`wait_for_pass`](Self::wait_for_pass) to block until it is done.
    /// Otherwise the pass has already run when this returns. A disabled
    /// collector returns an already-settled ticket.
    pub fn schedule_garbage_collect(&self) -> PassTicket {
        let mut schedule = self.inner.schedule.lock();
        if !self.is_enabled() {
            return PassTicket(schedule.completed);
        }
        schedule.requested += 1;
        let ticket = PassTicket(schedule.requested);
        drop(schedule);

        if self.background.lock().is_some() {
            self.inner.schedule_changed.notify_all();
        } else {
            self.inner.collect();
        }
        ticket
    }

    /// Blocks until the pass behind `ticket` completed or the collector shut
    /// down. The calling thread is `Native` while it waits.
    pub fn wait_for_pass(&self, ticket: PassTicket) {
        let _native = self
            .inner
            .threads
            .is_runnable()
            .then(|| self.inner.threads.enter_native());

        let mut schedule = self.inner.schedule.lock();
        while schedule.completed < ticket.0 && !schedule.shutdown {
            self.inner.schedule_changed.wait(&mut schedule);
        }
    }

    /// Runs a full pass on the calling thread.
    pub fn collect_now(&self) -> CyclicPassReport {
        self.inner.collect()
    }

    /// Enables or disables cycle reclamation. Root bookkeeping continues
    /// while disabled.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    /// Returns `true` if passes reclaim cycles.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Number of distinct atomic roots after merging every pending log.
    #[must_use]
    pub fn atomic_root_count(&self) -> usize {
        let mut roots = self.inner.roots.lock();
        self.inner.merge_all(&mut roots);
        roots.roots.len()
    }

    /// Atomic roots that lie on a reference cycle, sorted by address.
    ///
    /// Diagnostic only; nothing is reclaimed. Runs at a safepoint.
    pub fn detect_cycles(&self) -> Vec<ManagedObject> {
        self.inner.threads.run_at_safepoint(|| {
            let mut roots = self.inner.roots.lock();
            self.inner.merge_all(&mut roots);
            let graph = ObjectGraph::discover(roots.roots.keys().copied(), |obj| {
                self.inner.gc.references(obj)
            });
            let cyclic = graph.cyclic_nodes();
            let mut found: Vec<ManagedObject> = roots
                .roots
                .keys()
                .copied()
                .filter(|&obj| graph.id(obj).is_some_and(|id| cyclic[id]))
                .collect();
            found.sort_unstable();
            found
        })
    }

    fn stop_background(&self) {
        let handle = {
            let mut schedule = self.inner.schedule.lock();
            schedule.shutdown = true;
            drop(schedule);
            self.inner.schedule_changed.notify_all();
            self.background.lock().take()
        };
        if let Some(handle) = handle {
            // The collector thread may be waiting for this thread to reach a
            // safepoint.
            let _native = self
                .inner
                .threads
                .is_runnable()
                .then(|| self.inner.threads.enter_native());
            let _ = handle.join();
        }
    }

    /// Stops the background thread and runs a final pass if enabled.
    pub(crate) fn shutdown(&self) -> Option<CyclicPassReport> {
        self.stop_background();
        self.is_enabled().then(|| self.inner.collect())
    }
}

impl Drop for CyclicCollector {
    fn drop(&mut self) {
        self.stop_background();
    }
}

impl std::fmt::Debug for CyclicCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CyclicCollector")
            .field("enabled", &self.is_enabled())
            .field("workers", &self.worker_count())
            .field("background", &self.background.lock().is_some())
            .finish_non_exhaustive()
    }
}
