//! Error taxonomy for the bridge.

use crate::bridge::ForeignWrapper;
use crate::handles::ExternalRef;
use crate::thread_state::ThreadState;

/// Errors reported by the bridge.
///
/// Only [`BridgeError::OutOfMemory`] and the handle lifecycle results
/// (`Disposed`, `Stale`) are expected in correct programs. The remaining
/// variants describe usage errors; fatal ones are routed through the
/// runtime's fatal handler instead of being returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// The backend could not satisfy an allocation, even after the collector
    /// had a chance to free memory.
    #[error("out of memory while allocating {size} bytes")]
    OutOfMemory {
        /// Requested size in bytes.
        size: usize,
    },

    /// The calling thread is in the wrong execution state.
    #[error("thread is {actual:?} but the operation requires {expected:?}")]
    WrongThreadState {
        /// State the operation requires.
        expected: ThreadState,
        /// State the thread was found in.
        actual: ThreadState,
    },

    /// The calling thread is not attached to the runtime.
    #[error("thread is not attached to the runtime")]
    NotAttached,

    /// A local-only handle was used from a thread other than its creator.
    #[error("local-only handle {0:?} used off its creating thread")]
    WrongThread(ExternalRef),

    /// A handle was released more times than it was retained.
    #[error("handle {0:?} released more times than it was retained")]
    DoubleRelease(ExternalRef),

    /// A handle refers to a slot that has since been reused.
    #[error("handle {0:?} refers to a recycled slot")]
    StaleHandle(ExternalRef),

    /// A handle's reference count already reached zero.
    #[error("handle {0:?} is disposed")]
    Disposed(ExternalRef),

    /// A foreign wrapper no longer holds a live handle.
    #[error("foreign wrapper {0:?} no longer holds a live handle")]
    Stale(ForeignWrapper),

    /// An exception could not be translated across the foreign boundary.
    #[error("exception could not cross the foreign boundary: {0}")]
    UnhandledForeignException(String),

    /// Handles were still retained when the runtime shut down.
    #[error("{count} external handles still live at shutdown")]
    LeakedHandles {
        /// Number of live handles found.
        count: usize,
    },
}

impl BridgeError {
    /// Returns `true` for conditions that must never be returned to the
    /// caller and always end in the fatal handler.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::WrongThreadState { .. }
                | Self::NotAttached
                | Self::WrongThread(_)
                | Self::UnhandledForeignException(_)
        )
    }

    /// Returns `true` for handle misuse governed by
    /// [`UsageErrorPolicy`](crate::UsageErrorPolicy).
    #[must_use]
    pub const fn is_usage_error(&self) -> bool {
        matches!(self, Self::DoubleRelease(_) | Self::StaleHandle(_))
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
