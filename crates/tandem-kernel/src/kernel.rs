//! The kernel loop.
//!
//! One iteration executes a single unit of work. When the current delta
//! cycle is exhausted the loop drains the cross-thread inbox (the update
//! phase), then fires whatever is due at the current time, and only then
//! advances time to the next pending activity.

use std::future::Future;
use std::marker::PhantomData;
use std::task::{Context, Poll, Waker};

use tandem_core::LogicalTime;

use crate::sim::{Sim, Wakeup, Work};

/// Why a call to [`Kernel::run`] (or a bounded variant) returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing left to do: no runnable work, no pending activity and no
    /// queued requests.
    Starved,
    /// [`Sim::request_stop`] was honoured.
    Stopped,
    /// The time limit of [`Kernel::run_for`] or [`Kernel::run_until`]
    /// was reached.
    ReachedLimit,
}

enum Step {
    Run(Work),
    Continue,
    Done(RunOutcome),
}

/// A cooperative, single-threaded discrete-event kernel.
///
/// The kernel is pinned to the thread that created it. Other threads
/// interact with it only through a [`Sim`] handle.
pub struct Kernel {
    sim: Sim,
    finished: bool,
    _pinned: PhantomData<*const ()>,
}

impl Kernel {
    /// Create a kernel owned by the calling thread, at time zero.
    pub fn new() -> Self {
        Self {
            sim: Sim::new_for_current_thread(),
            finished: false,
            _pinned: PhantomData,
        }
    }

    /// A handle for scheduling work and for other threads.
    pub fn handle(&self) -> Sim {
        self.sim.clone()
    }

    /// Current kernel time.
    pub fn now(&self) -> LogicalTime {
        self.sim.now()
    }

    /// Run until starved or stopped.
    pub fn run(&mut self) -> RunOutcome {
        self.run_inner(None)
    }

    /// Run for at most `span` of simulated time.
    pub fn run_for(&mut self, span: LogicalTime) -> RunOutcome {
        let limit = self.sim.now() + span;
        self.run_inner(Some(limit))
    }

    /// Run until time `limit`. Activity due exactly at `limit` is executed.
    pub fn run_until(&mut self, limit: LogicalTime) -> RunOutcome {
        self.run_inner(Some(limit))
    }

    /// Run the end-of-simulation hooks. Only the first call has an effect.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let hooks = std::mem::take(&mut self.sim.shared.core().on_end);
        log::debug!("kernel finishing at {} ({} end hooks)", self.sim.now(), hooks.len());
        for hook in hooks {
            hook(&self.sim);
        }
    }

    fn run_start_hooks(&mut self) {
        let hooks = std::mem::take(&mut self.sim.shared.core().on_start);
        for hook in hooks {
            hook(&self.sim);
        }
    }

    fn run_inner(&mut self, limit: Option<LogicalTime>) -> RunOutcome {
        self.run_start_hooks();
        loop {
            if self.sim.shared.take_stop() {
                log::debug!("kernel stopped at {}", self.sim.now());
                return RunOutcome::Stopped;
            }
            match self.next_step(limit) {
                Step::Run(work) => self.execute(work),
                Step::Continue => {}
                Step::Done(outcome) => {
                    log::debug!("kernel returned {outcome:?} at {}", self.sim.now());
                    return outcome;
                }
            }
        }
    }

    fn next_step(&mut self, limit: Option<LogicalTime>) -> Step {
        let shared = &self.sim.shared;
        let mut wakers: Vec<Waker> = Vec::new();
        let step = {
            let mut core = shared.core();
            if let Some(work) = core.runnable.shift_remove_index(0) {
                Step::Run(work)
            } else {
                // Update phase.
                while let Ok(wakeup) = shared.inbox_rx.try_recv() {
                    let work = match wakeup {
                        Wakeup::Update(ch) => Work::Update(ch),
                        Wakeup::Task(id) => Work::Task(id),
                    };
                    core.runnable.insert(work);
                }
                if !core.runnable.is_empty() || core.fire_due(&mut wakers) {
                    Step::Continue
                } else {
                    // Observer entries only count once real activity exists.
                    let next = core.next_activity().map(|t| match core.next_observed() {
                        Some(o) if o < t => o,
                        _ => t,
                    });
                    let now = core.now;
                    match (next, limit) {
                        (Some(t), Some(l)) if t > l => {
                            if l > now {
                                shared.set_now(&mut core, l);
                            }
                            Step::Done(RunOutcome::ReachedLimit)
                        }
                        (Some(t), _) => {
                            log::trace!("advancing {now} -> {t}");
                            shared.set_now(&mut core, t);
                            Step::Continue
                        }
                        (None, Some(l)) => {
                            if l > now {
                                shared.set_now(&mut core, l);
                            }
                            Step::Done(RunOutcome::ReachedLimit)
                        }
                        (None, None) => Step::Done(RunOutcome::Starved),
                    }
                }
            }
        };
        for waker in wakers {
            waker.wake();
        }
        step
    }

    fn execute(&mut self, work: Work) {
        let sim = &self.sim;
        match work {
            Work::Method(pid) => {
                let taken = {
                    let mut core = sim.shared.core();
                    let slot = &mut core.methods[pid.0 as usize];
                    log::trace!("running method '{}' ({pid})", slot.name);
                    slot.callback.take()
                };
                if let Some(mut callback) = taken {
                    callback(sim);
                    sim.shared.core().methods[pid.0 as usize].callback = Some(callback);
                }
            }
            Work::Update(ch) => {
                let taken = {
                    let mut core = sim.shared.core();
                    let slot = &mut core.channels[ch.0 as usize];
                    log::trace!("updating channel '{}' ({ch})", slot.name);
                    slot.callback.take()
                };
                if let Some(mut callback) = taken {
                    callback(sim, ch);
                    sim.shared.core().channels[ch.0 as usize].callback = Some(callback);
                }
            }
            Work::Task(id) => {
                let taken = {
                    let mut core = sim.shared.core();
                    core.tasks[id.0 as usize]
                        .as_mut()
                        .and_then(|slot| Some((slot.future.take()?, slot.waker.clone())))
                };
                let Some((mut future, waker)) = taken else {
                    return;
                };
                let mut cx = Context::from_waker(&waker);
                let poll = future.as_mut().poll(&mut cx);
                let mut core = sim.shared.core();
                match poll {
                    Poll::Ready(()) => {
                        if let Some(slot) = core.tasks[id.0 as usize].take() {
                            log::trace!("task '{}' ({id}) completed", slot.name);
                        }
                    }
                    Poll::Pending => {
                        if let Some(slot) = core.tasks[id.0 as usize].as_mut() {
                            slot.future = Some(future);
                        }
                    }
                }
            }
        }
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.finish();
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("now", &self.sim.now())
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn t(ps: u64) -> LogicalTime {
        LogicalTime::new(ps)
    }

    #[test]
    fn empty_kernel_starves() {
        let mut kernel = Kernel::new();
        assert_eq!(kernel.run(), RunOutcome::Starved);
        assert_eq!(kernel.now(), LogicalTime::ZERO);
    }

    #[test]
    fn method_runs_when_event_fires() {
        let mut kernel = Kernel::new();
        let sim = kernel.handle();
        let ev = sim.create_event("ev");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        sim.spawn_method("m", &[ev], move |sim| log.lock().unwrap().push(sim.now()));
        sim.notify(ev, t(50));
        assert_eq!(kernel.run(), RunOutcome::Starved);
        assert_eq!(*seen.lock().unwrap(), vec![t(50)]);
        assert_eq!(kernel.now(), t(50));
    }

    #[test]
    fn earlier_notification_wins() {
        let mut kernel = Kernel::new();
        let sim = kernel.handle();
        let ev = sim.create_event("ev");
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        sim.spawn_method("m", &[ev], move |_| {
            h.fetch_add(1, Ordering::Relaxed);
        });
        sim.notify(ev, t(100));
        sim.notify(ev, t(30));
        sim.notify(ev, t(60));
        kernel.run();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(kernel.now(), t(30));
    }

    #[test]
    fn cancel_drops_pending_notification() {
        let mut kernel = Kernel::new();
        let sim = kernel.handle();
        let ev = sim.create_event("ev");
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        sim.spawn_method("m", &[ev], move |_| {
            h.fetch_add(1, Ordering::Relaxed);
        });
        sim.notify(ev, t(10));
        sim.cancel(ev);
        assert!(!sim.pending_activity());
        assert_eq!(kernel.run(), RunOutcome::Starved);
        assert_eq!(hits.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn observed_notification_does_not_advance_time() {
        let mut kernel = Kernel::new();
        let sim = kernel.handle();
        let ev = sim.create_event("observed");
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        sim.spawn_method("m", &[ev], move |_| {
            h.fetch_add(1, Ordering::Relaxed);
        });
        sim.notify_observed(ev, t(10));
        assert!(!sim.pending_activity());
        assert_eq!(kernel.run(), RunOutcome::Starved);
        assert_eq!(kernel.now(), LogicalTime::ZERO);
        assert_eq!(hits.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn observed_notification_fires_when_time_passes_it() {
        let mut kernel = Kernel::new();
        let sim = kernel.handle();
        let observed = sim.create_event("observed");
        let real = sim.create_event("real");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        sim.spawn_method("m", &[observed], move |sim| log.lock().unwrap().push(sim.now()));
        sim.notify_observed(observed, t(10));
        sim.notify(real, t(20));
        kernel.run();
        assert_eq!(*seen.lock().unwrap(), vec![t(10)]);
        assert_eq!(kernel.now(), t(20));
    }

    #[test]
    fn run_until_stops_at_limit() {
        let mut kernel = Kernel::new();
        let sim = kernel.handle();
        let ev = sim.create_event("ev");
        sim.notify(ev, t(500));
        assert_eq!(kernel.run_until(t(100)), RunOutcome::ReachedLimit);
        assert_eq!(kernel.now(), t(100));
        assert!(sim.pending_activity_at_future_time());
        assert_eq!(sim.time_to_pending_activity(), t(400));
        assert_eq!(kernel.run(), RunOutcome::Starved);
        assert_eq!(kernel.now(), t(500));
    }

    #[test]
    fn update_requested_from_foreign_thread_runs_on_kernel_thread() {
        let mut kernel = Kernel::new();
        let sim = kernel.handle();
        let ran_on_kernel = Arc::new(Mutex::new(None));
        let flag = Arc::clone(&ran_on_kernel);
        let ch = sim.register_channel("ch", move |sim, _| {
            *flag.lock().unwrap() = Some(sim.is_kernel_thread());
        });
        let remote = sim.clone();
        std::thread::spawn(move || remote.request_update(ch))
            .join()
            .unwrap();
        assert!(sim.pending_activity_at_current_time());
        assert_eq!(kernel.run(), RunOutcome::Starved);
        assert_eq!(*ran_on_kernel.lock().unwrap(), Some(true));
    }

    #[test]
    fn tasks_sleep_in_simulated_time() {
        let mut kernel = Kernel::new();
        let sim = kernel.handle();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let s = sim.clone();
        sim.spawn_task("sleeper", async move {
            log.lock().unwrap().push(s.now());
            s.sleep(t(25)).await;
            log.lock().unwrap().push(s.now());
            s.sleep(t(5)).await;
            log.lock().unwrap().push(s.now());
        });
        assert_eq!(kernel.run(), RunOutcome::Starved);
        assert_eq!(*seen.lock().unwrap(), vec![t(0), t(25), t(30)]);
    }

    #[test]
    fn task_waits_for_event() {
        let mut kernel = Kernel::new();
        let sim = kernel.handle();
        let ev = sim.create_event("go");
        let woke_at = Arc::new(Mutex::new(None));
        let out = Arc::clone(&woke_at);
        let s = sim.clone();
        sim.spawn_task("waiter", async move {
            s.wait_event(ev).await;
            *out.lock().unwrap() = Some(s.now());
        });
        sim.notify(ev, t(70));
        kernel.run();
        assert_eq!(*woke_at.lock().unwrap(), Some(t(70)));
    }

    #[test]
    fn stop_request_is_honoured_once() {
        let mut kernel = Kernel::new();
        let sim = kernel.handle();
        let ev = sim.create_event("ev");
        sim.notify(ev, t(10));
        sim.request_stop();
        assert_eq!(kernel.run(), RunOutcome::Stopped);
        assert!(!sim.stop_requested());
        assert_eq!(kernel.run(), RunOutcome::Starved);
    }

    #[test]
    fn hooks_run_once() {
        let mut kernel = Kernel::new();
        let sim = kernel.handle();
        let starts = Arc::new(AtomicU32::new(0));
        let ends = Arc::new(AtomicU32::new(0));
        let s = Arc::clone(&starts);
        let e = Arc::clone(&ends);
        sim.on_start(move |_| {
            s.fetch_add(1, Ordering::Relaxed);
        });
        sim.on_end(move |_| {
            e.fetch_add(1, Ordering::Relaxed);
        });
        kernel.run();
        kernel.run();
        kernel.finish();
        kernel.finish();
        assert_eq!(starts.load(Ordering::Relaxed), 1);
        assert_eq!(ends.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn singleton_claims_are_exclusive() {
        let kernel = Kernel::new();
        let sim = kernel.handle();
        assert!(sim.claim_singleton("x"));
        assert!(!sim.claim_singleton("x"));
        sim.release_singleton("x");
        assert!(sim.claim_singleton("x"));
    }
}
