//! Reference-lifetime and thread-state bridge between a traced heap and
//! externally reference-counted object systems.
//!
//! `refbridge` lets native or foreign code hold managed objects through
//! stable, reference-counted handles, gates every heap access on the calling
//! thread being `Runnable`, reclaims reference cycles among objects shared
//! across workers, and wraps managed objects as retain/release objects.
//!
//! # Components
//!
//! - [`Allocator`]: allocation front-end over a raw backend, with a single
//!   collector-assisted retry on exhaustion.
//! - [`ThreadRegistry`]: per-thread `Native`/`Runnable` state and safepoints.
//! - [`ExternalRefTable`]: arena of generation-checked handles that root
//!   their targets while retained.
//! - [`CyclicCollector`]: cycle reclamation over atomic (cross-worker) roots.
//! - [`ForeignBridge`]: wrapper identity, dealloc, weak references and
//!   exception translation at the foreign boundary.
//!
//! All of them hang off one explicitly created [`Runtime`].
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use refbridge::heap::Heap;
//! use refbridge::{RefMode, Runtime, RuntimeConfig, ThreadKind};
//!
//! let heap = Arc::new(Heap::new());
//! let runtime = Runtime::new(RuntimeConfig::default(), heap.clone()).unwrap();
//! let _attached = runtime.attach_current_thread(ThreadKind::Mutator);
//!
//! let obj = heap.allocate(0);
//! let handle = runtime.refs().create_shared(obj).unwrap();
//! assert_eq!(runtime.refs().mode(handle), Some(RefMode::Shared));
//!
//! heap.collect(&[]);
//! assert_eq!(runtime.refs().dereference(handle).unwrap(), obj);
//!
//! runtime.refs().release(handle).unwrap();
//! runtime.shutdown().unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod alloc;
mod arena;
pub mod bridge;
mod config;
pub mod cyclic;
mod error;
pub mod handles;
pub mod heap;
mod metrics;
mod object;
mod runtime;
mod thread_state;
mod tracing;

// Re-export public API
pub use alloc::{Allocator, RawAllocator, SystemBackend};
pub use bridge::{
    ForeignBridge, ForeignErrorObject, ForeignObjectSystem, ForeignWrapper, ManagedException,
    RetainReleaseSystem,
};
pub use config::{abort_on_fatal, panic_on_fatal, FatalHandler, RuntimeConfig, UsageErrorPolicy};
pub use cyclic::{CyclicCollector, CyclicPassReport, PassTicket, WorkerId};
pub use error::{BridgeError, Result};
pub use handles::{ExternalRef, ExternalRefTable, RefMode, WeakRef};
pub use metrics::BridgeMetrics;
pub use object::{ManagedObject, TracingGc};
pub use runtime::{AttachGuard, Runtime, ShutdownReport};
pub use thread_state::{NativeScope, ThreadKey, ThreadKind, ThreadRegistry, ThreadState};

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util;
