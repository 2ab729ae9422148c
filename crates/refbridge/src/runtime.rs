//! The runtime context.
//!
//! A [`Runtime`] owns one of each bridge component and is the single place
//! their lifecycle is defined: created explicitly, reached through an
//! `Arc`, and torn down with [`Runtime::shutdown`].

use std::sync::Arc;

use crate::alloc::{Allocator, RawAllocator, SystemBackend};
use crate::config::RuntimeConfig;
use crate::cyclic::{CyclicCollector, CyclicPassReport};
use crate::error::{BridgeError, Result};
use crate::handles::ExternalRefTable;
use crate::metrics::{BridgeMetrics, Counters};
use crate::object::TracingGc;
use crate::thread_state::{NativeScope, ThreadKind, ThreadRegistry};

/// What [`Runtime::shutdown`] found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Deferred root unregistrations processed during shutdown.
    pub deferred_drained: usize,
    /// Handles still retained.
    pub live_handles: usize,
    /// The final cyclic pass, if the collector was enabled.
    pub final_pass: Option<CyclicPassReport>,
}

/// Explicitly initialized bridge context.
pub struct Runtime {
    config: RuntimeConfig,
    gc: Arc<dyn TracingGc>,
    allocator: Arc<Allocator>,
    threads: ThreadRegistry,
    refs: Arc<ExternalRefTable>,
    cyclic: CyclicCollector,
    counters: Arc<Counters>,
}

impl Runtime {
    /// Creates a runtime over the platform allocator.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::OutOfMemory`] if the initial handle arena
    /// cannot be allocated.
    pub fn new(config: RuntimeConfig, gc: Arc<dyn TracingGc>) -> Result<Arc<Self>> {
        Self::with_backend(config, gc, Arc::new(SystemBackend))
    }

    /// Creates a runtime over a custom allocator backend.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::OutOfMemory`] if the initial handle arena
    /// cannot be allocated, even after the collector's out-of-memory hook.
    pub fn with_backend(
        config: RuntimeConfig,
        gc: Arc<dyn TracingGc>,
        backend: Arc<dyn RawAllocator>,
    ) -> Result<Arc<Self>> {
        let counters = Arc::new(Counters::default());

        let allocator = Arc::new(Allocator::new(backend));
        let hook_gc = Arc::clone(&gc);
        allocator.set_oom_hook(move |size| hook_gc.on_out_of_memory(size));

        let threads = ThreadRegistry::new(config.fatal_handler, Arc::clone(&counters));
        let refs = Arc::new(ExternalRefTable::new(
            threads.clone(),
            Arc::clone(&gc),
            Arc::clone(&allocator),
            &config,
            Arc::clone(&counters),
        ));
        refs.prime()?;

        let cyclic = CyclicCollector::new(
            threads.clone(),
            Arc::clone(&refs),
            Arc::clone(&gc),
            Arc::clone(&counters),
            &config,
        );

        Ok(Arc::new(Self {
            config,
            gc,
            allocator,
            threads,
            refs,
            cyclic,
            counters,
        }))
    }

    /// The external reference table.
    #[must_use]
    pub fn refs(&self) -> &ExternalRefTable {
        &self.refs
    }

    /// The thread registry.
    #[must_use]
    pub const fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    /// The cyclic collector.
    #[must_use]
    pub const fn cyclic(&self) -> &CyclicCollector {
        &self.cyclic
    }

    /// The allocation front-end.
    #[must_use]
    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub(crate) fn shared_allocator(&self) -> Arc<Allocator> {
        Arc::clone(&self.allocator)
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.counters
    }

    /// The tracing collector this runtime reports roots to.
    #[must_use]
    pub const fn gc(&self) -> &Arc<dyn TracingGc> {
        &self.gc
    }

    /// The configuration the runtime was created with.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Snapshot of the runtime's counters.
    #[must_use]
    pub fn metrics(&self) -> BridgeMetrics {
        self.counters.snapshot(self.allocator.oom_hook_calls())
    }

    /// Attaches the calling thread as `Runnable` until the guard drops.
    ///
    /// If the thread is already attached the guard is inert and the thread
    /// stays attached when it drops.
    pub fn attach_current_thread(&self, kind: ThreadKind) -> AttachGuard<'_> {
        let attached = self.threads.attach_current(kind).is_some();
        AttachGuard {
            runtime: self,
            attached,
        }
    }

    /// Attaches the calling thread as a daemon if it is unknown. Daemon
    /// threads stay attached until they exit. Returns `true` if this call
    /// attached the thread.
    pub fn ensure_attached(&self) -> bool {
        if self.threads.current_key().is_some() {
            return false;
        }
        self.threads.attach_current(ThreadKind::Daemon).is_some()
    }

    /// Switches the calling thread to `Native` until the scope drops.
    pub fn enter_native(&self) -> NativeScope<'_> {
        self.threads.enter_native()
    }

    /// Cooperative safepoint poll for generated code.
    #[inline]
    pub fn safepoint_poll(&self) {
        self.threads.safepoint_poll();
    }

    /// Entry point for a collector that reached a safepoint on the calling
    /// thread: parks the thread if another thread requested a safepoint.
    pub fn on_safepoint_reached(&self) {
        self.threads.safepoint_poll();
    }

    /// Reports a fatal condition through the configured handler.
    pub fn fatal(&self, err: &BridgeError) -> ! {
        self.threads.fatal(err)
    }

    /// Tears the runtime down.
    ///
    /// Stops the cyclic collector thread, runs a final pass if the collector
    /// is enabled, and processes deferred releases.
    ///
    /// # Errors
    ///
    /// With `leak_check` set, returns [`BridgeError::LeakedHandles`] if any
    /// handle is still retained.
    pub fn shutdown(&self) -> Result<ShutdownReport> {
        let final_pass = self.cyclic.shutdown();
        let deferred_drained = self.threads.run_at_safepoint(|| self.refs.drain_deferred());
        let live_handles = self.refs.live_count();

        if self.config.leak_check && live_handles > 0 {
            return Err(BridgeError::LeakedHandles {
                count: live_handles,
            });
        }
        Ok(ShutdownReport {
            deferred_drained,
            live_handles,
            final_pass,
        })
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("threads", &self.threads)
            .field("refs", &self.refs)
            .field("cyclic", &self.cyclic)
            .field("allocator", &self.allocator)
            .finish_non_exhaustive()
    }
}

/// Keeps the calling thread attached; detaches it on drop.
#[must_use = "the thread is detached as soon as the guard is dropped"]
pub struct AttachGuard<'a> {
    runtime: &'a Runtime,
    attached: bool,
}

impl AttachGuard<'_> {
    /// Returns `true` if this guard attached the thread (and will detach it).
    #[must_use]
    pub const fn is_owner(&self) -> bool {
        self.attached
    }
}

impl Drop for AttachGuard<'_> {
    fn drop(&mut self) {
        if self.attached {
            self.runtime.threads.detach_current();
        }
    }
}
