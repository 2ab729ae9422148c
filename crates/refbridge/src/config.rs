//! Runtime configuration.

use crate::error::BridgeError;

/// Handler invoked for fatal conditions. Must not return.
pub type FatalHandler = fn(&BridgeError) -> !;

/// How handle misuse (`DoubleRelease`, `StaleHandle`) is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageErrorPolicy {
    /// Panic at the offending call, like a debug assertion.
    Panic,
    /// Leave the table untouched and return the error to the caller.
    Report,
}

impl Default for UsageErrorPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Panic
        } else {
            Self::Report
        }
    }
}

/// Default fatal handler: prints a diagnostic and aborts the process.
pub fn abort_on_fatal(err: &BridgeError) -> ! {
    eprintln!("refbridge: fatal error: {err}");
    eprintln!("{}", std::backtrace::Backtrace::force_capture());
    std::process::abort()
}

/// Fatal handler for test harnesses: panics with the error message.
pub fn panic_on_fatal(err: &BridgeError) -> ! {
    panic!("refbridge fatal error: {err}")
}

/// Configuration for a [`Runtime`](crate::Runtime).
///
/// # Example
///
/// ```
/// use refbridge::{panic_on_fatal, RuntimeConfig, UsageErrorPolicy};
///
/// let config = RuntimeConfig::default()
///     .with_usage_errors(UsageErrorPolicy::Report)
///     .with_fatal_handler(panic_on_fatal)
///     .with_cyclic_background(false);
/// assert!(config.cyclic_collector);
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Treatment of double releases and stale handles.
    pub usage_errors: UsageErrorPolicy,
    /// Called for `WrongThreadState`, `NotAttached`, `WrongThread` and
    /// `UnhandledForeignException`.
    pub fatal_handler: FatalHandler,
    /// Whether the cyclic collector tracks atomic roots at all.
    pub cyclic_collector: bool,
    /// Run full cyclic passes on a dedicated thread. When `false`, a pass
    /// runs on the thread that schedules it.
    pub cyclic_background: bool,
    /// Fail shutdown if handles are still retained.
    pub leak_check: bool,
    /// Number of slots per arena chunk.
    pub arena_chunk_len: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            usage_errors: UsageErrorPolicy::default(),
            fatal_handler: abort_on_fatal,
            cyclic_collector: true,
            cyclic_background: true,
            leak_check: cfg!(debug_assertions),
            arena_chunk_len: 256,
        }
    }
}

impl RuntimeConfig {
    /// Sets the usage error policy.
    #[must_use]
    pub const fn with_usage_errors(mut self, policy: UsageErrorPolicy) -> Self {
        self.usage_errors = policy;
        self
    }

    /// Sets the fatal handler.
    #[must_use]
    pub const fn with_fatal_handler(mut self, handler: FatalHandler) -> Self {
        self.fatal_handler = handler;
        self
    }

    /// Enables or disables the cyclic collector.
    #[must_use]
    pub const fn with_cyclic_collector(mut self, enabled: bool) -> Self {
        self.cyclic_collector = enabled;
        self
    }

    /// Chooses between a background collector thread and inline passes.
    #[must_use]
    pub const fn with_cyclic_background(mut self, background: bool) -> Self {
        self.cyclic_background = background;
        self
    }

    /// Enables or disables the shutdown leak check.
    #[must_use]
    pub const fn with_leak_check(mut self, leak_check: bool) -> Self {
        self.leak_check = leak_check;
        self
    }

    /// Sets the number of slots per arena chunk. Clamped to at least 1.
    #[must_use]
    pub const fn with_arena_chunk_len(mut self, len: usize) -> Self {
        self.arena_chunk_len = if len == 0 { 1 } else { len };
        self
    }
}
