//! Running foreign-thread work on the kernel thread.
//!
//! [`ForeignJobRunner`] is the sanctioned way for arbitrary threads to
//! touch simulation state: a job is queued on a crossbeam channel, the
//! runner's signal wakes the kernel, and a kernel method drains the queue
//! in FIFO order. Each job carries a one-slot reply channel the submitter
//! may block on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};
use tandem_core::{LogicalTime, VoterId};
use tandem_kernel::Sim;

use crate::control::IdleSkipControl;
use crate::error::SyncError;
use crate::signal::AsyncSignal;
use crate::{lock, Job};

/// Lifecycle of a submitted job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    /// Waiting in the queue.
    Queued,
    /// Executing on the kernel thread.
    Running,
    /// Ran to completion.
    Completed,
    /// Cancelled before it started, or flagged while running.
    Cancelled,
}

struct JobSlot {
    state: JobState,
    task: Option<Job>,
}

/// A queued job plus the channel its submitter waits on.
struct ForeignJob {
    slot: Mutex<JobSlot>,
    reply: Sender<bool>,
}

impl ForeignJob {
    fn new(task: Job, reply: Sender<bool>) -> Self {
        Self {
            slot: Mutex::new(JobSlot {
                state: JobState::Queued,
                task: Some(task),
            }),
            reply,
        }
    }

    /// Claim the closure if the job is still queued.
    fn take_for_run(&self) -> Option<Job> {
        let mut slot = lock(&self.slot);
        if slot.state != JobState::Queued {
            return None;
        }
        slot.state = JobState::Running;
        slot.task.take()
    }

    fn complete(&self) {
        let mut slot = lock(&self.slot);
        if slot.state == JobState::Running {
            slot.state = JobState::Completed;
            // The submitter may not be waiting.
            let _ = self.reply.try_send(true);
        }
    }

    /// Cancel if queued or running; the waiter unblocks with `false`.
    fn cancel(&self) -> bool {
        let mut slot = lock(&self.slot);
        match slot.state {
            JobState::Queued | JobState::Running => {
                slot.state = JobState::Cancelled;
                slot.task = None;
                let _ = self.reply.try_send(false);
                true
            }
            JobState::Completed | JobState::Cancelled => false,
        }
    }
}

struct RunnerInner {
    name: String,
    sim: Sim,
    control: Arc<dyn IdleSkipControl>,
    voter: VoterId,
    signal: AsyncSignal,
    tx: Sender<Arc<ForeignJob>>,
    rx: Receiver<Arc<ForeignJob>>,
    closed: AtomicBool,
    running: Mutex<Option<Arc<ForeignJob>>>,
}

/// Marshals closures from any thread onto the kernel thread.
///
/// Create on the kernel thread. Cheap to clone; clones share one queue.
#[derive(Clone)]
pub struct ForeignJobRunner {
    inner: Arc<RunnerInner>,
}

const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<ForeignJobRunner>();
};

impl ForeignJobRunner {
    /// Create a runner. Its queue is cancelled at end of simulation.
    pub fn new(sim: &Sim, control: Arc<dyn IdleSkipControl>, name: &str) -> Self {
        let signal = AsyncSignal::new(sim, Arc::clone(&control), &format!("{name}.jobs"), false);
        let (tx, rx) = crossbeam_channel::unbounded();
        let inner = Arc::new(RunnerInner {
            name: name.to_owned(),
            sim: sim.clone(),
            control,
            voter: VoterId::next(),
            signal,
            tx,
            rx,
            closed: AtomicBool::new(false),
            running: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        sim.spawn_method(format!("{name}.run"), &[inner.signal.event()], move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.drain();
            }
        });
        let weak = Arc::downgrade(&inner);
        sim.on_end(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.cancel_all();
            }
        });
        Self { inner }
    }

    /// Run `job` on the kernel thread.
    ///
    /// On the kernel thread the job runs immediately. Otherwise it is
    /// queued and, if `wait`, the caller blocks until it has run or been
    /// cancelled. Returns whether the job ran (or, without `wait`, whether
    /// it was accepted). Once the runner is closed, foreign submissions
    /// return `false`; the kernel thread still runs jobs inline.
    pub fn submit<F>(&self, job: F, wait: bool) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = &self.inner;
        if inner.sim.is_kernel_thread() {
            job();
            return true;
        }
        if inner.closed.load(Ordering::Acquire) {
            return false;
        }

        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        let job = Arc::new(ForeignJob::new(Box::new(job), reply_tx));
        if inner.tx.send(job).is_err() {
            return false;
        }
        // A cancel_all racing with the send above must not strand the job.
        if inner.closed.load(Ordering::Acquire) {
            inner.cancel_pending();
        }
        inner.signal.notify(LogicalTime::ZERO);
        if !wait {
            return true;
        }
        reply_rx.recv().unwrap_or(false)
    }

    /// Queue `job` without waiting.
    pub fn fork<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(job, false)
    }

    /// Run a value-returning closure on the kernel thread and return its
    /// result, or [`SyncError::JobCancelled`].
    pub fn call<R, F>(&self, f: F) -> Result<R, SyncError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let ran = self.submit(
            move || {
                let _ = tx.send(f());
            },
            true,
        );
        if !ran {
            return Err(SyncError::JobCancelled);
        }
        rx.try_recv().map_err(|_| SyncError::JobCancelled)
    }

    /// Cancel every queued job. Their waiters return `false`. Returns how
    /// many were cancelled.
    pub fn cancel_pending(&self) -> usize {
        self.inner.cancel_pending()
    }

    /// Close the runner, cancel the queue and flag the in-flight job
    /// cancelled so its waiter returns. The job itself keeps running;
    /// only call this once the simulation has shut down.
    pub fn cancel_all(&self) {
        self.inner.cancel_all();
    }

    /// Number of queued jobs.
    pub fn pending(&self) -> usize {
        self.inner.rx.len()
    }

    /// Whether [`cancel_all`](Self::cancel_all) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl RunnerInner {
    fn drain(&self) {
        while let Ok(job) = self.rx.try_recv() {
            let Some(task) = job.take_for_run() else {
                continue;
            };
            *lock(&self.running) = Some(Arc::clone(&job));
            self.control.vote_block_skip(self.voter);
            task();
            self.control.vote_release(self.voter);
            *lock(&self.running) = None;
            job.complete();
        }
    }

    fn cancel_pending(&self) -> usize {
        let mut cancelled = 0;
        while let Ok(job) = self.rx.try_recv() {
            if job.cancel() {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            log::debug!("job runner '{}' cancelled {cancelled} queued jobs", self.name);
        }
        cancelled
    }

    fn cancel_all(&self) {
        self.closed.store(true, Ordering::Release);
        self.cancel_pending();
        let running = lock(&self.running).clone();
        if let Some(job) = running {
            if job.cancel() {
                log::debug!("job runner '{}' flagged in-flight job cancelled", self.name);
            }
        }
    }
}

impl std::fmt::Debug for ForeignJobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForeignJobRunner")
            .field("name", &self.inner.name)
            .field("pending", &self.pending())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SuspendCoordinator;
    use std::sync::atomic::AtomicU32;
    use tandem_kernel::{Kernel, RunOutcome};

    fn setup(kernel: &Kernel) -> (Arc<SuspendCoordinator>, ForeignJobRunner) {
        let sim = kernel.handle();
        let coordinator = SuspendCoordinator::install(&sim).unwrap();
        let runner = ForeignJobRunner::new(&sim, coordinator.clone(), "jobs");
        (coordinator, runner)
    }

    #[test]
    fn kernel_thread_submit_runs_inline() {
        let kernel = Kernel::new();
        let (_c, runner) = setup(&kernel);
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        assert!(runner.submit(
            move || {
                h.fetch_add(1, Ordering::Relaxed);
            },
            true
        ));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(runner.call(|| 6 * 7), Ok(42));
    }

    #[test]
    fn forked_jobs_run_in_fifo_order() {
        let mut kernel = Kernel::new();
        let (coordinator, runner) = setup(&kernel);
        let order = Arc::new(Mutex::new(Vec::new()));

        let remote = runner.clone();
        let log = Arc::clone(&order);
        std::thread::spawn(move || {
            for i in 0..5 {
                let log = Arc::clone(&log);
                assert!(remote.fork(move || log.lock().unwrap().push(i)));
            }
        })
        .join()
        .unwrap();
        assert_eq!(runner.pending(), 5);

        assert_eq!(kernel.run(), RunOutcome::Starved);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(runner.pending(), 0);
        assert_eq!(coordinator.stats().block_skip_votes, 0);
    }

    #[test]
    fn closed_runner_rejects_foreign_jobs() {
        let kernel = Kernel::new();
        let (_c, runner) = setup(&kernel);
        runner.cancel_all();
        assert!(runner.is_closed());

        let remote = runner.clone();
        let (submitted, called) = std::thread::spawn(move || {
            (remote.submit(|| {}, false), remote.call(|| 1))
        })
        .join()
        .unwrap();
        assert!(!submitted);
        assert_eq!(called, Err(SyncError::JobCancelled));
        assert_eq!(runner.pending(), 0);

        assert!(runner.submit(|| {}, false));
        assert_eq!(runner.call(|| 2), Ok(2));
    }

    #[test]
    fn cancel_marks_state() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let job = ForeignJob::new(Box::new(|| {}), tx);
        assert!(job.cancel());
        assert!(!job.cancel());
        assert!(job.take_for_run().is_none());
        assert_eq!(rx.try_recv(), Ok(false));
    }

    #[test]
    fn finish_cancels_queued_jobs() {
        let mut kernel = Kernel::new();
        let (_c, runner) = setup(&kernel);
        let remote = runner.clone();
        std::thread::spawn(move || {
            remote.fork(|| {});
            remote.fork(|| {});
        })
        .join()
        .unwrap();
        kernel.finish();
        assert_eq!(runner.pending(), 0);
        assert!(runner.is_closed());
    }
}
