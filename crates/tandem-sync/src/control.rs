//! The idle-skip capability consumed by every synchronisation component.
//!
//! A kernel with nothing to do at the current instant normally skips
//! ahead to its next scheduled event, or returns if there is none. While
//! foreign threads may still inject work that is wrong: the kernel has to
//! *block* instead. [`IdleSkipControl`] is the reentrant voting interface
//! through which components say so.

use tandem_core::{SourceId, VoterId};

/// Reentrant suspend votes over a kernel's idle-skip behaviour.
///
/// Every method is keyed by the caller's identity. A caller holds at most
/// one vote of each kind: casting it twice has no further effect, and
/// releasing a vote that is not held is a no-op. The `bool` results report
/// whether the call changed anything.
///
/// All methods may be called from any thread.
pub trait IdleSkipControl: Send + Sync {
    /// Register a suspending source. While any source is registered an idle
    /// kernel blocks rather than starving.
    fn register_source(&self, source: SourceId) -> bool;

    /// Deregister a suspending source.
    fn unregister_source(&self, source: SourceId) -> bool;

    /// Forbid skipping ahead over idle time, even while paused.
    fn vote_block_skip(&self, voter: VoterId) -> bool;

    /// Release a [`vote_block_skip`](Self::vote_block_skip) vote.
    fn vote_release(&self, voter: VoterId) -> bool;

    /// Hold the kernel at the current instant until resumed.
    fn request_pause(&self, voter: VoterId) -> bool;

    /// Release a [`request_pause`](Self::request_pause) vote.
    fn request_resume(&self, voter: VoterId) -> bool;

    /// Grant one wakeup credit to a kernel blocked while idle.
    fn async_wakeup(&self);

    /// Whether the kernel is currently blocked while idle.
    fn is_idle(&self) -> bool;
}
