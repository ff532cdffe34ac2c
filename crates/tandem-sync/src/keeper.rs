//! Quantum-bounded time budget for a foreign engine.
//!
//! A [`TimeBudgetKeeper`] tracks the *local time* of one foreign engine
//! (an emulated CPU on its own OS thread, say) and keeps the kernel and
//! that engine within one quantum of each other.
//!
//! The foreign side advances local time with [`inc`](TimeBudgetKeeper::inc)
//! or [`set`](TimeBudgetKeeper::set) and calls
//! [`sync`](TimeBudgetKeeper::sync) when it must not run further ahead.
//! On the kernel side a reconciliation method, triggered by the keeper's
//! tick signal, compares local time with kernel time:
//!
//! - local ahead of kernel: let the kernel run, and look again after
//!   `min(quantum, local - kernel)`;
//! - kernel caught up: pause the kernel until the foreign side moves on,
//!   and release anyone blocked in `sync()`;
//! - keeper not running: drop all votes and detach the tick.
//!
//! How much lead the engine may take before it should sync is set by a
//! [`KeeperPolicy`]; the reconciliation above is the same for all of them.
//!
//! Votes are only ever cast or released in reconciliation, on the kernel
//! thread. [`stop`](TimeBudgetKeeper::stop) just flips the status and
//! pokes the tick, so a rapid start/stop from another thread cannot leave
//! the vote counts inconsistent.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use tandem_core::{LogicalTime, VoterId};
use tandem_kernel::{Sim, Sleep};

use crate::config::KeeperPolicy;
use crate::control::IdleSkipControl;
use crate::error::SyncError;
use crate::signal::AsyncSignal;
use crate::{lock, Job};

/// Lifecycle of a [`TimeBudgetKeeper`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeeperStatus {
    /// Created, never started.
    Idle,
    /// Enforcing the quantum.
    Running,
    /// Stopped; votes are released at the next reconciliation.
    Stopped,
}

/// Point-in-time view of a keeper, for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeeperReport {
    /// Lifecycle state.
    pub status: KeeperStatus,
    /// Foreign engine's local time.
    pub local: LogicalTime,
    /// Kernel time observed at the last reconciliation.
    pub kernel_seen: LogicalTime,
    /// The kernel is paused waiting for the foreign engine.
    pub kernel_waiting: bool,
    /// A foreign thread is blocked in `sync()`.
    pub extern_waiting: bool,
}

struct KeeperState {
    status: KeeperStatus,
    policy: KeeperPolicy,
    local: LogicalTime,
    kernel_seen: LogicalTime,
    kernel_waiting: bool,
    extern_waiting: bool,
}

struct KeeperInner {
    name: String,
    sim: Sim,
    control: Arc<dyn IdleSkipControl>,
    quantum: LogicalTime,
    sync_timeout: Duration,
    voter: VoterId,
    tick: AsyncSignal,
    state: Mutex<KeeperState>,
    changed: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_thread: Mutex<Option<ThreadId>>,
}

/// Keeps one foreign engine within a quantum of kernel time.
///
/// Create on the kernel thread. Share across threads behind an `Arc`;
/// dropping the keeper stops it.
pub struct TimeBudgetKeeper {
    inner: Arc<KeeperInner>,
}

const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<TimeBudgetKeeper>();
};

impl TimeBudgetKeeper {
    /// Create an idle keeper. Local time starts at the current kernel time.
    pub fn new(
        sim: &Sim,
        control: Arc<dyn IdleSkipControl>,
        name: &str,
        quantum: LogicalTime,
        sync_timeout: Duration,
    ) -> Self {
        let tick = AsyncSignal::new(sim, Arc::clone(&control), &format!("{name}.tick"), false);
        let inner = Arc::new(KeeperInner {
            name: name.to_owned(),
            sim: sim.clone(),
            control,
            quantum,
            sync_timeout,
            voter: VoterId::next(),
            state: Mutex::new(KeeperState {
                status: KeeperStatus::Idle,
                policy: KeeperPolicy::default(),
                local: sim.now(),
                kernel_seen: sim.now(),
                kernel_waiting: false,
                extern_waiting: false,
            }),
            changed: Condvar::new(),
            worker: Mutex::new(None),
            worker_thread: Mutex::new(None),
            tick,
        });
        let weak = Arc::downgrade(&inner);
        sim.spawn_method(format!("{name}.reconcile"), &[inner.tick.event()], move |sim| {
            if let Some(inner) = weak.upgrade() {
                inner.reconcile(sim);
            }
        });
        Self { inner }
    }

    /// Replace the budget policy. Takes effect at the next
    /// [`time_to_sync`](Self::time_to_sync) or [`sync`](Self::sync).
    pub fn set_policy(&self, policy: KeeperPolicy) {
        lock(&self.inner.state).policy = policy;
    }

    /// The active budget policy.
    pub fn policy(&self) -> KeeperPolicy {
        lock(&self.inner.state).policy
    }

    /// Start enforcing the quantum, optionally spawning a named worker
    /// thread that runs `job`.
    ///
    /// Returns [`SyncError::AlreadyRunning`] if the keeper is running.
    pub fn start(&self, job: Option<Job>) -> Result<(), SyncError> {
        let inner = &self.inner;
        {
            let mut st = lock(&inner.state);
            if st.status == KeeperStatus::Running {
                return Err(SyncError::AlreadyRunning);
            }
            st.status = KeeperStatus::Running;
        }
        log::debug!("keeper '{}' started", inner.name);
        inner.tick.attach_suspending(true);
        inner.tick.notify(LogicalTime::ZERO);

        if let Some(job) = job {
            let spawned = thread::Builder::new()
                .name(format!("tandem-{}", inner.name))
                .spawn(job);
            match spawned {
                Ok(handle) => {
                    *lock(&inner.worker_thread) = Some(handle.thread().id());
                    *lock(&inner.worker) = Some(handle);
                }
                Err(e) => {
                    self.stop();
                    return Err(SyncError::ThreadSpawnFailed {
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Stop enforcing the quantum and join the worker thread (unless
    /// called from the worker itself). Blocked `sync()` callers return.
    ///
    /// Votes and the source registration are released by the next
    /// reconciliation on the kernel thread.
    pub fn stop(&self) {
        let inner = &self.inner;
        {
            let mut st = lock(&inner.state);
            if st.status != KeeperStatus::Running {
                return;
            }
            st.status = KeeperStatus::Stopped;
            inner.changed.notify_all();
        }
        log::debug!("keeper '{}' stopping", inner.name);
        inner.tick.notify(LogicalTime::ZERO);

        let handle = lock(&inner.worker).take();
        if let Some(handle) = handle {
            let is_worker = *lock(&inner.worker_thread) == Some(thread::current().id());
            if is_worker {
                // Joining ourselves would deadlock; the thread detaches.
                return;
            }
            if handle.join().is_err() {
                log::warn!("keeper '{}' worker panicked", inner.name);
            }
        }
    }

    /// Advance local time by `delta`. Does not wake the kernel; call
    /// [`sync`](Self::sync) for that.
    pub fn inc(&self, delta: LogicalTime) {
        let mut st = lock(&self.inner.state);
        st.local += delta;
    }

    /// Set local time to `t`. Ignored if `t` is earlier than the current
    /// local time, which never decreases.
    pub fn set(&self, t: LogicalTime) {
        {
            let mut st = lock(&self.inner.state);
            if t <= st.local {
                return;
            }
            st.local = t;
        }
        self.inner.tick.notify(LogicalTime::ZERO);
    }

    /// Wait until the kernel has caught up with local time.
    ///
    /// On a foreign thread this blocks until reconciliation has observed
    /// kernel time at or past local time, or the keeper stops. Every
    /// `sync_timeout` without progress the kernel is poked again. Kernel
    /// methods cannot block, so on the kernel thread this only pokes the
    /// tick; kernel tasks should await [`sync_async`](Self::sync_async).
    /// Under [`KeeperPolicy::FreeRunning`] a foreign caller never blocks.
    pub fn sync(&self) {
        let inner = &self.inner;
        inner.tick.notify(LogicalTime::ZERO);
        if inner.sim.is_kernel_thread() {
            log::warn!(
                "keeper '{}': sync() called on the kernel thread; use sync_async() from tasks",
                inner.name
            );
            return;
        }

        let mut st = lock(&inner.state);
        if st.policy == KeeperPolicy::FreeRunning {
            return;
        }
        st.extern_waiting = true;
        while st.status == KeeperStatus::Running && st.kernel_seen < st.local {
            let (guard, timeout) = inner
                .changed
                .wait_timeout(st, inner.sync_timeout)
                .unwrap_or_else(PoisonError::into_inner);
            st = guard;
            if timeout.timed_out() && st.status == KeeperStatus::Running && st.kernel_seen < st.local {
                log::warn!(
                    "keeper '{}': sync timed out (local {}, kernel {}); re-poking",
                    inner.name,
                    st.local,
                    st.kernel_seen
                );
                drop(st);
                inner.tick.notify(LogicalTime::ZERO);
                st = lock(&inner.state);
            }
        }
        st.extern_waiting = false;
    }

    /// A future for kernel tasks that completes once kernel time reaches
    /// the current local time.
    pub fn sync_async(&self) -> Sleep {
        let inner = &self.inner;
        inner.tick.notify(LogicalTime::ZERO);
        let wait = self.local_offset();
        inner.sim.sleep(wait)
    }

    /// Remaining budget before the foreign engine should sync, as set by
    /// the [`KeeperPolicy`]. Always zero unless the keeper is running.
    ///
    /// The default policy grants up to `2 × quantum` of lead.
    pub fn time_to_sync(&self) -> LogicalTime {
        let inner = &self.inner;
        let (status, policy, local) = {
            let st = lock(&inner.state);
            (st.status, st.policy, st.local)
        };
        if status != KeeperStatus::Running {
            return LogicalTime::ZERO;
        }
        let now = inner.sim.now();
        let q = inner.quantum;
        match policy {
            KeeperPolicy::TwoQuantum | KeeperPolicy::FreeRunning => {
                (now + q.saturating_mul(2)).saturating_sub(local)
            }
            KeeperPolicy::Quantum => (now + q).saturating_sub(local),
            KeeperPolicy::Adaptive => {
                if local <= now {
                    q.saturating_mul(2)
                } else if local <= now + q {
                    q
                } else if local <= now + q.saturating_mul(2) {
                    LogicalTime::new(q.as_ps() / 2)
                } else {
                    LogicalTime::ZERO
                }
            }
            KeeperPolicy::Rolling => {
                let boundary = (now + q).saturating_sub(local);
                if inner.sim.pending_activity_at_current_time() {
                    inner.tick.notify(LogicalTime::ZERO);
                    LogicalTime::ZERO
                } else if inner.sim.pending_activity_at_future_time() {
                    inner.sim.time_to_pending_activity().min(boundary)
                } else {
                    boundary
                }
            }
        }
    }

    /// Whether the foreign engine should sync now. Never true under
    /// [`KeeperPolicy::FreeRunning`].
    pub fn need_sync(&self) -> bool {
        let policy = self.policy();
        policy != KeeperPolicy::FreeRunning && self.time_to_sync().is_zero()
    }

    /// Re-anchor local time to the current kernel time.
    pub fn reset(&self) {
        {
            let mut st = lock(&self.inner.state);
            st.local = self.inner.sim.now();
        }
        self.inner.tick.notify(LogicalTime::ZERO);
    }

    /// The foreign engine's local time.
    pub fn current_time(&self) -> LogicalTime {
        lock(&self.inner.state).local
    }

    /// How far local time is ahead of the kernel (zero if behind).
    pub fn local_offset(&self) -> LogicalTime {
        let now = self.inner.sim.now();
        lock(&self.inner.state).local.saturating_sub(now)
    }

    /// Lifecycle state.
    pub fn status(&self) -> KeeperStatus {
        lock(&self.inner.state).status
    }

    /// Diagnostic snapshot.
    pub fn report(&self) -> KeeperReport {
        let st = lock(&self.inner.state);
        KeeperReport {
            status: st.status,
            local: st.local,
            kernel_seen: st.kernel_seen,
            kernel_waiting: st.kernel_waiting,
            extern_waiting: st.extern_waiting,
        }
    }

    /// The configured quantum.
    pub fn quantum(&self) -> LogicalTime {
        self.inner.quantum
    }
}

impl KeeperInner {
    fn reconcile(&self, sim: &Sim) {
        let now = sim.now();
        let (status, local) = {
            let mut st = lock(&self.state);
            st.kernel_seen = now;
            st.kernel_waiting = st.status == KeeperStatus::Running && st.local <= now;
            (st.status, st.local)
        };
        self.changed.notify_all();

        match status {
            KeeperStatus::Running if local > now => {
                let wait = (local - now).min(self.quantum);
                log::trace!("keeper '{}': local {local} ahead of {now}, next look in {wait}", self.name);
                self.control.request_resume(self.voter);
                self.tick.notify(wait);
            }
            KeeperStatus::Running => {
                log::trace!("keeper '{}': kernel caught up at {now}, pausing", self.name);
                self.control.request_pause(self.voter);
            }
            KeeperStatus::Idle | KeeperStatus::Stopped => {
                self.control.request_resume(self.voter);
                self.tick.attach_suspending(false);
            }
        }
    }
}

impl Drop for TimeBudgetKeeper {
    fn drop(&mut self) {
        self.stop();
        // Reconciliation holds only a weak reference and will not run
        // again, so nothing else can release these.
        let inner = &self.inner;
        inner.control.request_resume(inner.voter);
        inner.tick.attach_suspending(false);
    }
}

impl std::fmt::Debug for TimeBudgetKeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeBudgetKeeper")
            .field("name", &self.inner.name)
            .field("policy", &self.policy())
            .field("report", &self.report())
            .finish()
    }
}
