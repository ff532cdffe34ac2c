//! The shareable kernel handle and the state it guards.
//!
//! [`Sim`] is a cheap, cloneable, `Send + Sync` handle onto one kernel.
//! Scheduling operations (`create_event`, `notify`, `spawn_method`, ...)
//! belong to the kernel thread; `now`, `request_update` and `request_stop`
//! may be called from anywhere. Cross-thread requests never touch the
//! scheduler state directly: they are posted to a crossbeam inbox that the
//! kernel loop drains between delta cycles.
//!
//! The core lock is never held while user code runs. Callbacks are taken
//! out of their slot, invoked, and put back.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::Waker;
use std::thread::{self, ThreadId};

use crossbeam_channel::{Receiver, Sender};
use indexmap::IndexSet;
use smallvec::SmallVec;
use tandem_core::{ChannelId, EventId, LogicalTime, ProcessId, TaskId};

use crate::queue::{Entry, Target, TimedQueue};
use crate::task::{EventWait, Sleep, TaskWaker};

pub(crate) type MethodFn = Box<dyn FnMut(&Sim) + Send>;
pub(crate) type ChannelFn = Box<dyn FnMut(&Sim, ChannelId) + Send>;
pub(crate) type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub(crate) type Hook = Box<dyn FnOnce(&Sim) + Send>;

/// Callback invoked whenever another thread posts a request to the kernel.
///
/// Installed by whatever component may block the kernel thread while it
/// is idle, so that the block ends as soon as there is something to do.
pub type IdleWaker = Arc<dyn Fn() + Send + Sync>;

// ── Inbox ──────────────────────────────────────────────────────────

/// A cross-thread request, delivered through the kernel inbox.
pub(crate) enum Wakeup {
    Update(ChannelId),
    Task(TaskId),
}

/// A unit of work the kernel executes in the current delta cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum Work {
    Method(ProcessId),
    Task(TaskId),
    Update(ChannelId),
}

/// Which queue a notification lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Lane {
    /// Ordinary activity: counts as pending and advances time.
    Activity,
    /// Observer notification: fires on time but never keeps the kernel
    /// alive or moves time by itself.
    Observed,
}

// ── Slots ──────────────────────────────────────────────────────────

pub(crate) struct EventSlot {
    name: String,
    pending: Option<(LogicalTime, Lane)>,
    generation: u64,
    sensitive: SmallVec<[ProcessId; 4]>,
    waiters: Vec<(Arc<AtomicBool>, Waker)>,
}

pub(crate) struct ProcSlot<F> {
    pub name: String,
    pub callback: Option<F>,
}

pub(crate) struct TaskSlot {
    pub name: String,
    pub future: Option<TaskFuture>,
    pub waker: Waker,
}

// ── Core ───────────────────────────────────────────────────────────

/// Scheduler state. Only the kernel thread mutates it in practice; the
/// mutex exists so the handle can be `Sync`.
pub(crate) struct Core {
    pub now: LogicalTime,
    pub events: Vec<EventSlot>,
    pub methods: Vec<ProcSlot<MethodFn>>,
    pub channels: Vec<ProcSlot<ChannelFn>>,
    pub tasks: Vec<Option<TaskSlot>>,
    activity: TimedQueue,
    observed: TimedQueue,
    pub runnable: IndexSet<Work>,
    pub on_start: Vec<Hook>,
    pub on_end: Vec<Hook>,
}

fn is_live(events: &[EventSlot], entry: &Entry) -> bool {
    match entry.target {
        Target::Event { id, generation } => {
            let slot = &events[id.0 as usize];
            slot.generation == generation && slot.pending.is_some()
        }
        Target::Wake(_) => true,
    }
}

impl Core {
    fn new() -> Self {
        Self {
            now: LogicalTime::ZERO,
            events: Vec::new(),
            methods: Vec::new(),
            channels: Vec::new(),
            tasks: Vec::new(),
            activity: TimedQueue::default(),
            observed: TimedQueue::default(),
            runnable: IndexSet::new(),
            on_start: Vec::new(),
            on_end: Vec::new(),
        }
    }

    fn queue_mut(&mut self, lane: Lane) -> &mut TimedQueue {
        match lane {
            Lane::Activity => &mut self.activity,
            Lane::Observed => &mut self.observed,
        }
    }

    /// Schedule `ev` at absolute time `at`. The earliest notification wins;
    /// at equal times an activity notification supersedes an observed one.
    pub fn notify_at(&mut self, ev: EventId, at: LogicalTime, lane: Lane) {
        let slot = &mut self.events[ev.0 as usize];
        if let Some((t, old_lane)) = slot.pending {
            if t < at || (t == at && (old_lane == lane || lane == Lane::Observed)) {
                return;
            }
        }
        slot.generation += 1;
        slot.pending = Some((at, lane));
        let target = Target::Event {
            id: ev,
            generation: slot.generation,
        };
        self.queue_mut(lane).push(at, target);
    }

    pub fn cancel(&mut self, ev: EventId) {
        let slot = &mut self.events[ev.0 as usize];
        slot.pending = None;
        slot.generation += 1;
    }

    pub fn schedule_wake(&mut self, at: LogicalTime, waker: Waker) {
        self.activity.push(at, Target::Wake(waker));
    }

    /// Drop superseded heads so `peek` reflects live work.
    fn purge(&mut self) {
        let Core {
            events,
            activity,
            observed,
            ..
        } = self;
        for queue in [activity, observed] {
            while let Some(head) = queue.peek() {
                if is_live(events, head) {
                    break;
                }
                queue.pop();
            }
        }
    }

    /// Earliest live activity entry.
    pub fn next_activity(&mut self) -> Option<LogicalTime> {
        self.purge();
        self.activity.peek_time()
    }

    /// Earliest live observed entry.
    pub fn next_observed(&mut self) -> Option<LogicalTime> {
        self.purge();
        self.observed.peek_time()
    }

    /// Whether any live activity is scheduled strictly after `now`.
    pub fn has_future_activity(&self) -> bool {
        self.activity
            .iter()
            .any(|e| e.at > self.now && is_live(&self.events, e))
    }

    /// Fire everything due at the current time. Task wakers are collected
    /// rather than invoked so the caller can wake them after unlocking.
    pub fn fire_due(&mut self, wakers: &mut Vec<Waker>) -> bool {
        let now = self.now;
        let mut fired = false;
        for lane in [Lane::Activity, Lane::Observed] {
            while let Some(entry) = self.queue_mut(lane).pop_due(now) {
                match entry.target {
                    Target::Event { id, generation } => {
                        let slot = &self.events[id.0 as usize];
                        if slot.generation == generation && slot.pending.is_some() {
                            self.trigger(id, wakers);
                            fired = true;
                        }
                    }
                    Target::Wake(waker) => {
                        wakers.push(waker);
                        fired = true;
                    }
                }
            }
        }
        fired
    }

    fn trigger(&mut self, id: EventId, wakers: &mut Vec<Waker>) {
        let now = self.now;
        let Core {
            events, runnable, ..
        } = self;
        let slot = &mut events[id.0 as usize];
        slot.pending = None;
        log::trace!("event '{}' ({id}) triggered at {now}", slot.name);
        for &pid in &slot.sensitive {
            runnable.insert(Work::Method(pid));
        }
        for (flag, waker) in slot.waiters.drain(..) {
            flag.store(true, Ordering::Release);
            wakers.push(waker);
        }
    }
}

// ── Shared ─────────────────────────────────────────────────────────

pub(crate) struct Shared {
    core: Mutex<Core>,
    kernel_thread: ThreadId,
    now: AtomicU64,
    stop: AtomicBool,
    inbox_tx: Sender<Wakeup>,
    pub inbox_rx: Receiver<Wakeup>,
    idle_waker: Mutex<Option<IdleWaker>>,
    singletons: Mutex<Vec<&'static str>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    pub fn core(&self) -> MutexGuard<'_, Core> {
        lock(&self.core)
    }

    /// Post a request and end any idle block on the kernel thread.
    pub fn post(&self, wakeup: Wakeup) {
        // The receiver lives in `self`, so the channel cannot be disconnected.
        let _ = self.inbox_tx.send(wakeup);
        self.wake_idle();
    }

    fn wake_idle(&self) {
        let waker = lock(&self.idle_waker).clone();
        if let Some(waker) = waker {
            waker();
        }
    }

    pub fn set_now(&self, core: &mut Core, t: LogicalTime) {
        core.now = t;
        self.now.store(t.as_ps(), Ordering::Release);
    }

    pub fn take_stop(&self) -> bool {
        self.stop.swap(false, Ordering::AcqRel)
    }
}

// ── Sim ────────────────────────────────────────────────────────────

/// Handle onto a kernel. Clone freely; every clone refers to the same
/// kernel.
#[derive(Clone)]
pub struct Sim {
    pub(crate) shared: Arc<Shared>,
}

const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<Sim>();
};

impl Sim {
    /// Handle for a kernel owned by the calling thread.
    pub(crate) fn new_for_current_thread() -> Self {
        let (inbox_tx, inbox_rx) = crossbeam_channel::unbounded();
        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(Core::new()),
                kernel_thread: thread::current().id(),
                now: AtomicU64::new(0),
                stop: AtomicBool::new(false),
                inbox_tx,
                inbox_rx,
                idle_waker: Mutex::new(None),
                singletons: Mutex::new(Vec::new()),
            }),
        }
    }

    fn debug_assert_kernel_thread(&self, op: &str) {
        debug_assert!(
            self.is_kernel_thread(),
            "Sim::{op} called off the kernel thread"
        );
    }

    /// Current kernel time. Callable from any thread.
    pub fn now(&self) -> LogicalTime {
        LogicalTime::new(self.shared.now.load(Ordering::Acquire))
    }

    /// Whether the caller is the thread that owns the kernel.
    pub fn is_kernel_thread(&self) -> bool {
        thread::current().id() == self.shared.kernel_thread
    }

    // ── Events ─────────────────────────────────────────────────────

    /// Create a new event with no pending notification.
    pub fn create_event(&self, name: impl Into<String>) -> EventId {
        self.debug_assert_kernel_thread("create_event");
        let mut core = self.shared.core();
        let id = EventId(core.events.len() as u32);
        core.events.push(EventSlot {
            name: name.into(),
            pending: None,
            generation: 0,
            sensitive: SmallVec::new(),
            waiters: Vec::new(),
        });
        id
    }

    /// Notify `ev` after `delay`. A zero delay fires in the next delta
    /// cycle at the current time. If the event already has an earlier or
    /// equal pending notification this call is a no-op.
    pub fn notify(&self, ev: EventId, delay: LogicalTime) {
        self.debug_assert_kernel_thread("notify");
        let mut core = self.shared.core();
        let at = core.now + delay;
        core.notify_at(ev, at, Lane::Activity);
    }

    /// Like [`notify`](Self::notify), but the notification does not count
    /// as pending activity and will not advance time on its own: it fires
    /// only if something else moves the kernel to (or past) its instant.
    pub fn notify_observed(&self, ev: EventId, delay: LogicalTime) {
        self.debug_assert_kernel_thread("notify_observed");
        let mut core = self.shared.core();
        let at = core.now + delay;
        core.notify_at(ev, at, Lane::Observed);
    }

    /// Drop any pending notification of `ev`.
    pub fn cancel(&self, ev: EventId) {
        self.debug_assert_kernel_thread("cancel");
        self.shared.core().cancel(ev);
    }

    // ── Processes ──────────────────────────────────────────────────

    /// Register a method: a callback run to completion each time one of
    /// the events in `sensitivity` fires. Methods are not run at
    /// registration.
    pub fn spawn_method<F>(&self, name: impl Into<String>, sensitivity: &[EventId], f: F) -> ProcessId
    where
        F: FnMut(&Sim) + Send + 'static,
    {
        self.debug_assert_kernel_thread("spawn_method");
        let mut core = self.shared.core();
        let pid = ProcessId(core.methods.len() as u32);
        core.methods.push(ProcSlot {
            name: name.into(),
            callback: Some(Box::new(f)),
        });
        for ev in sensitivity {
            core.events[ev.0 as usize].sensitive.push(pid);
        }
        pid
    }

    /// Spawn a task. It is first polled in the current delta cycle and
    /// re-polled whenever its waker fires.
    pub fn spawn_task<F>(&self, name: impl Into<String>, future: F) -> TaskId
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.debug_assert_kernel_thread("spawn_task");
        let mut core = self.shared.core();
        let id = TaskId(core.tasks.len() as u32);
        let waker = Waker::from(Arc::new(TaskWaker::new(id, Arc::downgrade(&self.shared))));
        core.tasks.push(Some(TaskSlot {
            name: name.into(),
            future: Some(Box::pin(future)),
            waker,
        }));
        core.runnable.insert(Work::Task(id));
        id
    }

    /// A future that completes once kernel time has advanced by `delay`
    /// from its first poll.
    pub fn sleep(&self, delay: LogicalTime) -> Sleep {
        Sleep::new(self.clone(), delay)
    }

    /// A future that completes the next time `ev` fires after its first
    /// poll.
    pub fn wait_event(&self, ev: EventId) -> EventWait {
        EventWait::new(self.clone(), ev)
    }

    pub(crate) fn schedule_wake(&self, at: LogicalTime, waker: Waker) {
        self.shared.core().schedule_wake(at, waker);
    }

    pub(crate) fn add_waiter(&self, ev: EventId, flag: Arc<AtomicBool>, waker: Waker) {
        self.shared.core().events[ev.0 as usize]
            .waiters
            .push((flag, waker));
    }

    // ── Cross-thread requests ──────────────────────────────────────

    /// Register an update channel. The callback runs on the kernel thread
    /// in the update phase following each [`request_update`]; it receives
    /// its own id so it may request itself again.
    ///
    /// [`request_update`]: Self::request_update
    pub fn register_channel<F>(&self, name: impl Into<String>, f: F) -> ChannelId
    where
        F: FnMut(&Sim, ChannelId) + Send + 'static,
    {
        self.debug_assert_kernel_thread("register_channel");
        let mut core = self.shared.core();
        let id = ChannelId(core.channels.len() as u32);
        core.channels.push(ProcSlot {
            name: name.into(),
            callback: Some(Box::new(f)),
        });
        id
    }

    /// Ask the kernel to run channel `ch` in its next update phase.
    /// Callable from any thread; never runs the callback synchronously.
    pub fn request_update(&self, ch: ChannelId) {
        self.shared.post(Wakeup::Update(ch));
    }

    /// Ask the kernel loop to return [`RunOutcome::Stopped`] at the next
    /// opportunity. Callable from any thread.
    ///
    /// [`RunOutcome::Stopped`]: crate::RunOutcome::Stopped
    pub fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake_idle();
    }

    /// Whether a stop has been requested and not yet honoured.
    pub fn stop_requested(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    // ── Pending-activity queries ───────────────────────────────────

    /// Span until the next pending activity: zero if something is runnable
    /// now (including queued cross-thread requests), [`LogicalTime::MAX`]
    /// if nothing is pending at all. Observer notifications are ignored.
    pub fn time_to_pending_activity(&self) -> LogicalTime {
        let mut core = self.shared.core();
        if !core.runnable.is_empty() || !self.shared.inbox_rx.is_empty() {
            return LogicalTime::ZERO;
        }
        match core.next_activity() {
            Some(t) => t.saturating_sub(core.now),
            None => LogicalTime::MAX,
        }
    }

    /// Whether anything at all is pending.
    pub fn pending_activity(&self) -> bool {
        !self.time_to_pending_activity().is_max()
    }

    /// Whether something is pending at the current time.
    pub fn pending_activity_at_current_time(&self) -> bool {
        self.time_to_pending_activity().is_zero()
    }

    /// Whether something is scheduled strictly in the future.
    pub fn pending_activity_at_future_time(&self) -> bool {
        self.shared.core().has_future_activity()
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Install the callback run whenever another thread posts a request.
    /// Replaces any previous waker.
    pub fn set_idle_waker(&self, waker: IdleWaker) {
        *lock(&self.shared.idle_waker) = Some(waker);
    }

    /// Remove the idle waker.
    pub fn clear_idle_waker(&self) {
        *lock(&self.shared.idle_waker) = None;
    }

    /// Claim a per-kernel singleton slot. Returns `false` if `key` is
    /// already claimed.
    pub fn claim_singleton(&self, key: &'static str) -> bool {
        let mut claims = lock(&self.shared.singletons);
        if claims.contains(&key) {
            return false;
        }
        claims.push(key);
        true
    }

    /// Release a singleton slot claimed with [`claim_singleton`](Self::claim_singleton).
    pub fn release_singleton(&self, key: &'static str) {
        lock(&self.shared.singletons).retain(|k| *k != key);
    }

    /// Run `hook` on the kernel thread when the kernel next starts running.
    pub fn on_start<F>(&self, hook: F)
    where
        F: FnOnce(&Sim) + Send + 'static,
    {
        self.shared.core().on_start.push(Box::new(hook));
    }

    /// Run `hook` on the kernel thread at end of simulation.
    pub fn on_end<F>(&self, hook: F)
    where
        F: FnOnce(&Sim) + Send + 'static,
    {
        self.shared.core().on_end.push(Box::new(hook));
    }
}

impl std::fmt::Debug for Sim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sim").field("now", &self.now()).finish()
    }
}
