//! Cooperative single-threaded discrete-event kernel.
//!
//! A [`Kernel`] owns a time-ordered event queue and runs methods and
//! tasks on the thread that created it. Everything else talks to it
//! through a [`Sim`] handle: scheduling from the kernel thread, update
//! and stop requests from any thread.
//!
//! Besides ordinary notifications the kernel supports *observer*
//! notifications, which fire on time but neither count as pending
//! activity nor advance time by themselves, and an [`IdleWaker`] hook
//! so a component that blocks the kernel thread can be woken whenever
//! another thread posts work.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

mod kernel;
mod queue;
mod sim;
mod task;

pub use kernel::{Kernel, RunOutcome};
pub use sim::{IdleWaker, Sim};
pub use task::{EventWait, Sleep};
