//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use refbridge::heap::Heap;
use refbridge::{
    panic_on_fatal, RawAllocator, Runtime, RuntimeConfig, SystemBackend, UsageErrorPolicy,
};

/// Backend that fails the attempts scripted as `false`.
#[derive(Default)]
pub struct FlakyBackend {
    script: Mutex<VecDeque<bool>>,
    attempts: AtomicUsize,
}

impl FlakyBackend {
    pub fn new(script: impl IntoIterator<Item = bool>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn fail_next(&self, times: usize) {
        self.script.lock().extend(std::iter::repeat(false).take(times));
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl RawAllocator for FlakyBackend {
    fn raw_allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().pop_front() {
            Some(false) => None,
            _ => SystemBackend.raw_allocate(size),
        }
    }

    unsafe fn raw_free(&self, ptr: NonNull<u8>, size: usize) {
        unsafe { SystemBackend.raw_free(ptr, size) }
    }
}

/// Deterministic configuration: fatal conditions panic, usage errors are
/// returned, cyclic passes run inline.
pub fn config() -> RuntimeConfig {
    RuntimeConfig::default()
        .with_fatal_handler(panic_on_fatal)
        .with_usage_errors(UsageErrorPolicy::Report)
        .with_cyclic_background(false)
        .with_leak_check(true)
        .with_arena_chunk_len(8)
}

pub fn runtime() -> (Arc<Heap>, Arc<Runtime>) {
    runtime_with(config())
}

pub fn runtime_with(config: RuntimeConfig) -> (Arc<Heap>, Arc<Runtime>) {
    let heap = Arc::new(Heap::new());
    let runtime = Runtime::new(config, heap.clone()).unwrap();
    (heap, runtime)
}

/// Small deterministic generator for fuzz-style tests.
pub struct Lcg(u64);

impl Lcg {
    pub const fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn next_below(&mut self, bound: usize) -> usize {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        ((self.0 >> 33) as usize) % bound
    }
}
