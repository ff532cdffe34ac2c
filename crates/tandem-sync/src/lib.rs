//! Time synchronisation between a cooperative kernel and foreign threads.
//!
//! A discrete-event kernel runs on one thread; foreign engines (emulated
//! processors, co-simulators, application threads) run on their own and
//! keep their own notion of elapsed time. This crate keeps the two
//! correctly ordered:
//!
//! - [`SuspendCoordinator`] decides, per kernel, whether an idle kernel may
//!   skip ahead or must block waiting for foreign input;
//! - [`AsyncSignal`] lets any thread notify a kernel event;
//! - [`TimeBudgetKeeper`] bounds a foreign engine's lead over the kernel
//!   by one quantum;
//! - [`RealtimeLimiter`] keeps the kernel from outrunning the wall clock;
//! - [`ForeignJobRunner`] marshals closures onto the kernel thread;
//! - [`WindowedSynchronizer`] lets two schedulers agree on rolling
//!   [`SyncWindow`](tandem_core::SyncWindow)s.
//!
//! Everything is created through a [`SyncContext`], one per kernel.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod context;
pub mod control;
pub mod coordinator;
pub mod error;
pub mod jobs;
pub mod keeper;
pub mod limiter;
pub mod signal;
pub mod windowed;

pub use config::{ConfigError, Horizon, KeeperPolicy, SyncConfig, WindowPolicy};
pub use context::SyncContext;
pub use control::IdleSkipControl;
pub use coordinator::{CoordinatorStats, SuspendCoordinator};
pub use error::SyncError;
pub use jobs::{ForeignJobRunner, JobState};
pub use keeper::{KeeperReport, KeeperStatus, TimeBudgetKeeper};
pub use limiter::RealtimeLimiter;
pub use signal::AsyncSignal;
pub use windowed::WindowedSynchronizer;

/// A unit of foreign work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Lock, recovering from poisoning: a panicking job must not wedge
/// synchronisation.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
