//! Pacing kernel time against the wall clock.
//!
//! A [`RealtimeLimiter`] stops the kernel from running ahead of real time.
//! A named pacing thread wakes once per wall-clock period and moves the
//! limit to "kernel time at enable + wall time elapsed since". A kernel
//! method on the limiter's tick signal compares kernel time with that
//! limit:
//!
//! - below the limit: release the pause, detach, and look again half a
//!   period past the limit;
//! - at or past it: attach as a suspending source and pause, so the idle
//!   kernel blocks until the pacing thread moves the limit on;
//! - disabled: release everything.
//!
//! As with the keeper, votes only change on the kernel thread, except
//! when the limiter is dropped and its method can no longer run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender};
use tandem_core::{LogicalTime, VoterId};
use tandem_kernel::Sim;

use crate::control::IdleSkipControl;
use crate::error::SyncError;
use crate::lock;
use crate::signal::AsyncSignal;

struct Pace {
    started_wall: Instant,
    started_at: LogicalTime,
    limit: LogicalTime,
}

struct LimiterInner {
    name: String,
    control: Arc<dyn IdleSkipControl>,
    period: Duration,
    voter: VoterId,
    tick: AsyncSignal,
    running: AtomicBool,
    pace: Mutex<Pace>,
}

struct Pacer {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

/// Holds kernel time to at most wall-clock time since
/// [`enable`](Self::enable), in steps of one period.
///
/// Create on the kernel thread. Dropping the limiter disables it.
pub struct RealtimeLimiter {
    inner: Arc<LimiterInner>,
    sim: Sim,
    pacer: Mutex<Option<Pacer>>,
}

const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<RealtimeLimiter>();
};

impl RealtimeLimiter {
    /// Create a disabled limiter that paces in steps of `period`.
    pub fn new(sim: &Sim, control: Arc<dyn IdleSkipControl>, name: &str, period: Duration) -> Self {
        let tick = AsyncSignal::new(sim, Arc::clone(&control), &format!("{name}.tick"), false);
        let inner = Arc::new(LimiterInner {
            name: name.to_owned(),
            control,
            period,
            voter: VoterId::next(),
            tick,
            running: AtomicBool::new(false),
            pace: Mutex::new(Pace {
                started_wall: Instant::now(),
                started_at: sim.now(),
                limit: sim.now(),
            }),
        });
        let weak = Arc::downgrade(&inner);
        sim.spawn_method(format!("{name}.pace"), &[inner.tick.event()], move |sim| {
            if let Some(inner) = weak.upgrade() {
                inner.pace(sim);
            }
        });
        Self {
            inner,
            sim: sim.clone(),
            pacer: Mutex::new(None),
        }
    }

    /// Start pacing from the current kernel time and spawn the pacing
    /// thread.
    ///
    /// Returns [`SyncError::AlreadyRunning`] if already enabled.
    pub fn enable(&self) -> Result<(), SyncError> {
        let inner = &self.inner;
        let mut pacer = lock(&self.pacer);
        if pacer.is_some() {
            return Err(SyncError::AlreadyRunning);
        }
        {
            let now = self.sim.now();
            let mut pace = lock(&inner.pace);
            pace.started_wall = Instant::now();
            pace.started_at = now;
            pace.limit = now + LogicalTime::from_duration(inner.period);
        }
        inner.running.store(true, Ordering::Release);

        let (stop, stopped) = crossbeam_channel::bounded::<()>(0);
        let paced = Arc::clone(inner);
        let spawned = thread::Builder::new()
            .name(format!("tandem-{}", inner.name))
            .spawn(move || loop {
                match stopped.recv_timeout(paced.period) {
                    Err(RecvTimeoutError::Timeout) => paced.advance_limit(),
                    _ => break,
                }
            });
        match spawned {
            Ok(thread) => {
                *pacer = Some(Pacer { stop, thread });
            }
            Err(e) => {
                inner.running.store(false, Ordering::Release);
                return Err(SyncError::ThreadSpawnFailed {
                    reason: e.to_string(),
                });
            }
        }
        drop(pacer);
        log::debug!("realtime limiter '{}' enabled (period {:?})", inner.name, inner.period);
        inner.tick.notify(LogicalTime::ZERO);
        Ok(())
    }

    /// Stop pacing and join the pacing thread. The kernel is released at
    /// the next pacing step.
    pub fn disable(&self) {
        let inner = &self.inner;
        let pacer = lock(&self.pacer).take();
        let Some(Pacer { stop, thread }) = pacer else {
            return;
        };
        inner.running.store(false, Ordering::Release);
        drop(stop);
        if thread.join().is_err() {
            log::warn!("realtime limiter '{}' pacing thread panicked", inner.name);
        }
        log::debug!("realtime limiter '{}' disabled", inner.name);
        inner.tick.notify(LogicalTime::ZERO);
    }

    /// Whether the limiter is pacing.
    pub fn is_enabled(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// The kernel time the kernel may currently run to.
    pub fn limit(&self) -> LogicalTime {
        lock(&self.inner.pace).limit
    }

    /// The wall-clock pacing period.
    pub fn period(&self) -> Duration {
        self.inner.period
    }
}

impl LimiterInner {
    fn advance_limit(&self) {
        {
            let mut pace = lock(&self.pace);
            let elapsed = LogicalTime::from_duration(pace.started_wall.elapsed());
            pace.limit = pace.started_at + elapsed;
        }
        self.tick.notify(LogicalTime::ZERO);
    }

    fn pace(&self, sim: &Sim) {
        let now = sim.now();
        if !self.running.load(Ordering::Acquire) {
            self.control.request_resume(self.voter);
            self.tick.attach_suspending(false);
            return;
        }
        let limit = lock(&self.pace).limit;
        if now >= limit {
            log::trace!("limiter '{}': kernel at {now} reached wall-clock limit", self.name);
            self.tick.attach_suspending(true);
            self.control.request_pause(self.voter);
        } else {
            let slack = LogicalTime::from_duration(self.period / 2);
            self.tick.notify((limit + slack) - now);
            self.tick.attach_suspending(false);
            self.control.request_resume(self.voter);
        }
    }
}

impl Drop for RealtimeLimiter {
    fn drop(&mut self) {
        self.disable();
        // The pacing method holds only a weak reference and will not run
        // again.
        self.inner.control.request_resume(self.inner.voter);
        self.inner.tick.attach_suspending(false);
    }
}

impl std::fmt::Debug for RealtimeLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeLimiter")
            .field("name", &self.inner.name)
            .field("enabled", &self.is_enabled())
            .field("limit", &self.limit())
            .finish()
    }
}
