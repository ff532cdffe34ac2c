//! The per-kernel suspend coordinator.
//!
//! [`SuspendCoordinator`] layers the idle-skip voting policy over a kernel.
//! It owns a *sleeper* method that re-examines the votes whenever they
//! change:
//!
//! 1. nothing registered and no pause: let the kernel idle-skip;
//! 2. paused, a must-not-skip vote active and activity pending: wait for
//!    that activity;
//! 3. not paused, sources registered and activity pending: same;
//! 4. activity pending at the current instant: run again next delta;
//! 5. otherwise block the kernel thread on a condition variable until a
//!    wakeup credit arrives, the pause set empties, a new must-not-skip
//!    vote is cast, something becomes runnable now or a stop is requested;
//! 6. after waking, consume one credit and reschedule if votes remain.
//!
//! The coordinator is the kernel's idle waker, so every cross-thread
//! request to the kernel ends a block.
//!
//! Lock order: coordinator state before kernel core. The state lock is
//! never held while posting to the kernel inbox.

use std::sync::{Arc, Condvar, Mutex, PoisonError};

use indexmap::IndexSet;
use tandem_core::{ChannelId, EventId, LogicalTime, SourceId, VoterId};
use tandem_kernel::Sim;

use crate::control::IdleSkipControl;
use crate::error::SyncError;
use crate::lock;

const SINGLETON: &str = "tandem-sync/suspend-coordinator";

#[derive(Default)]
struct PauseState {
    sources: IndexSet<SourceId>,
    block_skip: IndexSet<VoterId>,
    pause: IndexSet<VoterId>,
    wakeups: u64,
    idle: bool,
    /// Bumped on every new must-not-skip vote.
    vote_epoch: u64,
    /// Bumped whenever the pause set becomes empty.
    resume_epoch: u64,
}

/// Snapshot of the coordinator's vote counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Registered suspending sources.
    pub sources: usize,
    /// Active must-not-skip votes.
    pub block_skip_votes: usize,
    /// Active pause requests.
    pub pause_requests: usize,
    /// Unconsumed wakeup credits.
    pub wakeups: u64,
    /// Whether the kernel is blocked right now.
    pub idle: bool,
}

/// Arbitrates suspend votes for one kernel.
///
/// Install exactly one per kernel, at setup, on the kernel thread; see
/// [`SyncContext`](crate::SyncContext). Dropping it releases the claim.
pub struct SuspendCoordinator {
    sim: Sim,
    state: Mutex<PauseState>,
    changed: Condvar,
    sleeper: EventId,
    kick: ChannelId,
}

impl SuspendCoordinator {
    /// Install the coordinator on `sim`'s kernel.
    ///
    /// Returns [`SyncError::DuplicateCoordinator`] if one is already
    /// installed.
    pub fn install(sim: &Sim) -> Result<Arc<Self>, SyncError> {
        if !sim.claim_singleton(SINGLETON) {
            log::error!("suspend coordinator already installed on this kernel");
            return Err(SyncError::DuplicateCoordinator);
        }
        let sleeper = sim.create_event("suspend-coordinator.sleeper");
        let kick = sim.register_channel("suspend-coordinator.kick", move |sim, _| {
            sim.notify(sleeper, LogicalTime::ZERO);
        });
        let coordinator = Arc::new(Self {
            sim: sim.clone(),
            state: Mutex::new(PauseState::default()),
            changed: Condvar::new(),
            sleeper,
            kick,
        });

        let weak = Arc::downgrade(&coordinator);
        sim.spawn_method("suspend-coordinator.step", &[sleeper], move |sim| {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.step(sim);
            }
        });
        let weak = Arc::downgrade(&coordinator);
        sim.set_idle_waker(Arc::new(move || {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.async_wakeup();
            }
        }));
        log::debug!("suspend coordinator installed");
        Ok(coordinator)
    }

    /// Current vote counts.
    pub fn stats(&self) -> CoordinatorStats {
        let st = lock(&self.state);
        CoordinatorStats {
            sources: st.sources.len(),
            block_skip_votes: st.block_skip.len(),
            pause_requests: st.pause.len(),
            wakeups: st.wakeups,
            idle: st.idle,
        }
    }

    /// Re-run the sleeper: directly on the kernel thread, otherwise through
    /// the kick channel (which also grants a wakeup credit).
    fn kick(&self) {
        if self.sim.is_kernel_thread() {
            self.sim.notify(self.sleeper, LogicalTime::ZERO);
        } else {
            self.sim.request_update(self.kick);
        }
    }

    /// Apply a vote change; wake waiters and the sleeper if it changed
    /// anything.
    fn apply(&self, f: impl FnOnce(&mut PauseState) -> bool) -> bool {
        let changed = {
            let mut st = lock(&self.state);
            let changed = f(&mut st);
            if changed {
                self.changed.notify_all();
            }
            changed
        };
        if changed {
            self.kick();
        }
        changed
    }

    fn step(&self, sim: &Sim) {
        let mut st = lock(&self.state);
        if st.sources.is_empty() && st.pause.is_empty() {
            return;
        }
        let paused = !st.pause.is_empty();
        let horizon = sim.time_to_pending_activity();
        let may_skip = !paused || !st.block_skip.is_empty();
        if !horizon.is_max() && may_skip {
            log::trace!("sleeper: waiting {horizon} for pending activity");
            sim.notify(self.sleeper, horizon);
            return;
        }
        if horizon.is_zero() {
            sim.notify(self.sleeper, LogicalTime::ZERO);
            return;
        }

        st.idle = true;
        let vote_epoch = st.vote_epoch;
        let resume_epoch = st.resume_epoch;
        log::trace!(
            "sleeper: kernel blocked at {} (sources {}, pauses {})",
            sim.now(),
            st.sources.len(),
            st.pause.len()
        );
        let mut st = self
            .changed
            .wait_while(st, |s| {
                s.wakeups == 0
                    && s.vote_epoch == vote_epoch
                    && s.resume_epoch == resume_epoch
                    && !sim.stop_requested()
                    && !sim.pending_activity_at_current_time()
            })
            .unwrap_or_else(PoisonError::into_inner);
        st.idle = false;
        st.wakeups = st.wakeups.saturating_sub(1);
        let again = !st.pause.is_empty() || !st.sources.is_empty();
        drop(st);
        log::trace!("sleeper: kernel resumed at {}", sim.now());
        if again {
            sim.notify(self.sleeper, LogicalTime::ZERO);
        }
    }
}

impl IdleSkipControl for SuspendCoordinator {
    fn register_source(&self, source: SourceId) -> bool {
        self.apply(|s| s.sources.insert(source))
    }

    fn unregister_source(&self, source: SourceId) -> bool {
        self.apply(|s| s.sources.shift_remove(&source))
    }

    fn vote_block_skip(&self, voter: VoterId) -> bool {
        self.apply(|s| {
            let added = s.block_skip.insert(voter);
            if added {
                s.vote_epoch += 1;
            }
            added
        })
    }

    fn vote_release(&self, voter: VoterId) -> bool {
        self.apply(|s| s.block_skip.shift_remove(&voter))
    }

    fn request_pause(&self, voter: VoterId) -> bool {
        self.apply(|s| s.pause.insert(voter))
    }

    fn request_resume(&self, voter: VoterId) -> bool {
        self.apply(|s| {
            let removed = s.pause.shift_remove(&voter);
            if removed && s.pause.is_empty() {
                s.resume_epoch += 1;
            }
            removed
        })
    }

    fn async_wakeup(&self) {
        let mut st = lock(&self.state);
        st.wakeups += 1;
        self.changed.notify_all();
    }

    fn is_idle(&self) -> bool {
        lock(&self.state).idle
    }
}

impl Drop for SuspendCoordinator {
    fn drop(&mut self) {
        self.sim.clear_idle_waker();
        self.sim.release_singleton(SINGLETON);
        log::debug!("suspend coordinator removed");
    }
}

impl std::fmt::Debug for SuspendCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuspendCoordinator")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_kernel::{Kernel, RunOutcome};

    #[test]
    fn second_install_is_rejected_until_first_is_dropped() {
        let kernel = Kernel::new();
        let sim = kernel.handle();
        let first = SuspendCoordinator::install(&sim).unwrap();
        match SuspendCoordinator::install(&sim) {
            Err(SyncError::DuplicateCoordinator) => {}
            other => panic!("expected DuplicateCoordinator, got {other:?}"),
        }
        drop(first);
        assert!(SuspendCoordinator::install(&sim).is_ok());
    }

    #[test]
    fn votes_are_idempotent_per_voter() {
        let kernel = Kernel::new();
        let coordinator = SuspendCoordinator::install(&kernel.handle()).unwrap();
        let a = VoterId::next();
        let b = VoterId::next();

        assert!(coordinator.request_pause(a));
        assert!(!coordinator.request_pause(a));
        assert!(coordinator.request_pause(b));
        assert_eq!(coordinator.stats().pause_requests, 2);

        assert!(coordinator.request_resume(a));
        assert!(!coordinator.request_resume(a));
        assert_eq!(coordinator.stats().pause_requests, 1);

        // Releasing a vote never cast is a no-op.
        assert!(!coordinator.vote_release(a));
        assert_eq!(coordinator.stats().block_skip_votes, 0);
    }

    #[test]
    fn sources_are_counted_once() {
        let kernel = Kernel::new();
        let coordinator = SuspendCoordinator::install(&kernel.handle()).unwrap();
        let s = SourceId::next();
        assert!(coordinator.register_source(s));
        assert!(!coordinator.register_source(s));
        assert_eq!(coordinator.stats().sources, 1);
        assert!(coordinator.unregister_source(s));
        assert!(!coordinator.unregister_source(s));
        assert_eq!(coordinator.stats().sources, 0);
    }

    #[test]
    fn unvoted_kernel_starves_normally() {
        let mut kernel = Kernel::new();
        let sim = kernel.handle();
        let coordinator = SuspendCoordinator::install(&sim).unwrap();
        let ev = sim.create_event("work");
        sim.notify(ev, LogicalTime::new(40));
        assert_eq!(kernel.run(), RunOutcome::Starved);
        assert_eq!(kernel.now(), LogicalTime::new(40));
        assert!(!coordinator.is_idle());
    }

    #[test]
    fn sources_do_not_skip_past_pending_activity() {
        // Not paused: a registered source lets the kernel skip ahead to the
        // next event, and the sleeper follows it there.
        let mut kernel = Kernel::new();
        let sim = kernel.handle();
        let coordinator = SuspendCoordinator::install(&sim).unwrap();
        let s = SourceId::next();
        coordinator.register_source(s);
        let ev = sim.create_event("work");
        let c = Arc::clone(&coordinator);
        sim.spawn_method("release", &[ev], move |_| {
            c.unregister_source(s);
        });
        sim.notify(ev, LogicalTime::new(90));
        assert_eq!(kernel.run(), RunOutcome::Starved);
        assert_eq!(kernel.now(), LogicalTime::new(90));
        assert_eq!(coordinator.stats().sources, 0);
    }

    #[test]
    fn async_wakeup_accumulates_credits() {
        let kernel = Kernel::new();
        let coordinator = SuspendCoordinator::install(&kernel.handle()).unwrap();
        coordinator.async_wakeup();
        coordinator.async_wakeup();
        assert_eq!(coordinator.stats().wakeups, 2);
    }
}
