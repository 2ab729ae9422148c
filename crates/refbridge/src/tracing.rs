//! Bridge tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! spans and events for handle lifecycle, safepoints, out-of-memory retries
//! and cyclic collection.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    use crate::error::BridgeError;
    use crate::handles::{ExternalRef, RefMode};
    use crate::thread_state::{ThreadKey, ThreadKind, ThreadState};

    /// Stable identifier for a cyclic collection pass.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PassId(pub u64);

    static NEXT_PASS_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique pass ID.
    pub fn next_pass_id() -> PassId {
        PassId(NEXT_PASS_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a span for a cyclic collection pass.
    pub fn trace_cyclic_pass(scope: &str, pass_id: PassId) -> span::EnteredSpan {
        span!(Level::DEBUG, "cyclic_pass", scope = scope, pass_id = pass_id.0).entered()
    }

    /// Log the outcome of a cyclic pass.
    pub fn log_cyclic_pass(nodes: usize, components: usize, reclaimed: usize) {
        tracing::debug!(nodes, components, reclaimed, "cyclic_pass_end");
    }

    /// Log a handle creation.
    pub fn log_handle_created(handle: ExternalRef, mode: RefMode) {
        tracing::trace!(handle = ?handle, mode = ?mode, "handle_created");
    }

    /// Log a handle whose count reached zero.
    pub fn log_handle_released(handle: ExternalRef, deferred: bool) {
        tracing::trace!(handle = ?handle, deferred, "handle_released");
    }

    /// Log a thread attach.
    pub fn log_thread_attached(key: ThreadKey, kind: ThreadKind) {
        tracing::debug!(thread = ?key, kind = ?kind, "thread_attached");
    }

    /// Log a thread-state transition.
    pub fn log_state_switch(key: ThreadKey, to: ThreadState) {
        tracing::trace!(thread = ?key, to = ?to, "state_switch");
    }

    /// Log a completed global safepoint.
    pub fn log_safepoint(epoch: u64, threads: usize) {
        tracing::debug!(epoch, threads, "safepoint");
    }

    /// Log a collector-assisted allocation retry.
    pub fn log_oom_retry(size: usize) {
        tracing::warn!(size, "allocation failed, retrying after collection");
    }

    /// Log a reported usage error.
    pub fn log_usage_error(err: &BridgeError) {
        tracing::warn!(error = %err, "usage_error");
    }

    /// Log a fatal condition before the fatal handler runs.
    pub fn log_fatal(err: &BridgeError) {
        tracing::error!(error = %err, "fatal");
    }
}
