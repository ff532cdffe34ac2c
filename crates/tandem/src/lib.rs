//! Tandem: keeps a discrete-event kernel and foreign OS threads in step.
//!
//! This is the top-level facade crate that re-exports the public API from
//! all Tandem sub-crates. For most users, adding `tandem` as a single
//! dependency is sufficient.
//!
//! # Quick start
//!
//! ```rust
//! use tandem::prelude::*;
//!
//! let mut kernel = Kernel::new();
//! let sim = kernel.handle();
//! let config = SyncConfig::with_quantum(LogicalTime::from_ns(10));
//! let ctx = SyncContext::new(&sim, config).unwrap();
//!
//! // Jobs submitted from the kernel thread run inline.
//! let runner = ctx.job_runner("jobs");
//! assert!(runner.submit(|| {}, true));
//!
//! // A foreign engine 25 ns ahead lets the kernel run up to it.
//! let keeper = ctx.time_budget_keeper("cpu0");
//! keeper.start(None).unwrap();
//! keeper.set(LogicalTime::from_ns(25));
//!
//! let stopper = sim.create_event("stopper");
//! sim.spawn_method("stopper", &[stopper], |sim| sim.request_stop());
//! sim.notify(stopper, LogicalTime::from_ns(25));
//!
//! assert_eq!(kernel.run(), RunOutcome::Stopped);
//! assert_eq!(kernel.now(), LogicalTime::from_ns(25));
//! ```
//!
//! # Modules
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`types`] | `tandem-core` | `LogicalTime`, `SyncWindow`, IDs |
//! | [`kernel`] | `tandem-kernel` | Discrete-event kernel and its `Sim` handle |
//! | [`sync`] | `tandem-sync` | Coordinator, signals, keepers, limiter, job runner, windows |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Time, windows and identifiers (`tandem-core`).
pub use tandem_core as types;

/// The discrete-event kernel (`tandem-kernel`).
///
/// [`kernel::Kernel`] owns the event loop; [`kernel::Sim`] is the cloneable
/// handle processes and other threads use to reach it.
pub use tandem_kernel as kernel;

/// Cross-thread synchronisation (`tandem-sync`).
///
/// Start from [`sync::SyncContext`], which installs the
/// [`sync::SuspendCoordinator`] and builds every other component.
pub use tandem_sync as sync;

/// Common imports for typical Tandem usage.
///
/// ```rust
/// use tandem::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use tandem_core::{LogicalTime, SyncWindow};

    // Kernel
    pub use tandem_kernel::{Kernel, RunOutcome, Sim};

    // Configuration and errors
    pub use tandem_sync::{
        ConfigError, Horizon, KeeperPolicy, SyncConfig, SyncError, WindowPolicy,
    };

    // Components
    pub use tandem_sync::{
        AsyncSignal, ForeignJobRunner, IdleSkipControl, KeeperStatus, RealtimeLimiter,
        SuspendCoordinator, SyncContext, TimeBudgetKeeper, WindowedSynchronizer,
    };
}
