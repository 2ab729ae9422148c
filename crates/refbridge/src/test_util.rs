//! Test utilities.
//!
//! Available to unit tests and, behind the `test-util` feature, to
//! downstream crates testing their own embedding.

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::alloc::RawAllocator;
use crate::config::{panic_on_fatal, RuntimeConfig, UsageErrorPolicy};
use crate::heap::Heap;
use crate::runtime::Runtime;

/// Allocator backend that fails on demand.
///
/// Each attempt pops the next scripted outcome: `false` fails the attempt,
/// `true` (or an exhausted script) forwards to the platform allocator.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    script: Mutex<VecDeque<bool>>,
    attempts: AtomicUsize,
}

impl ScriptedBackend {
    /// Creates a backend following `script`.
    pub fn new(script: impl IntoIterator<Item = bool>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Appends outcomes to the script.
    pub fn push(&self, outcomes: impl IntoIterator<Item = bool>) {
        self.script.lock().extend(outcomes);
    }

    /// Number of allocation attempts seen so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl RawAllocator for ScriptedBackend {
    fn raw_allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().pop_front() {
            Some(false) => None,
            _ => sys_alloc::raw_allocate(size),
        }
    }

    unsafe fn raw_free(&self, ptr: NonNull<u8>, _size: usize) {
        // SAFETY: forwarded caller contract; blocks come from sys_alloc.
        unsafe { sys_alloc::raw_free(ptr) }
    }
}

/// Configuration for deterministic tests: panicking fatal handler, reported
/// usage errors, inline cyclic passes and no leak check.
pub fn test_config() -> RuntimeConfig {
    RuntimeConfig::default()
        .with_fatal_handler(panic_on_fatal)
        .with_usage_errors(UsageErrorPolicy::Report)
        .with_cyclic_background(false)
        .with_leak_check(false)
        .with_arena_chunk_len(16)
}

/// A fresh heap and a runtime over it with [`test_config`].
///
/// # Panics
///
/// Panics if the runtime cannot be created.
pub fn test_runtime() -> (Arc<Heap>, Arc<Runtime>) {
    test_runtime_with(test_config())
}

/// A fresh heap and a runtime over it with `config`.
///
/// # Panics
///
/// Panics if the runtime cannot be created.
pub fn test_runtime_with(config: RuntimeConfig) -> (Arc<Heap>, Arc<Runtime>) {
    let heap = Arc::new(Heap::new());
    let runtime = Runtime::new(config, heap.clone()).expect("test runtime");
    (heap, runtime)
}
