//! Task wakers and the futures kernel tasks await.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake};

use tandem_core::{EventId, LogicalTime, TaskId};

use crate::sim::{Shared, Sim, Wakeup};

/// Waker for a kernel task. Waking posts the task id to the kernel inbox,
/// so it is safe from any thread and never polls synchronously.
pub(crate) struct TaskWaker {
    id: TaskId,
    shared: Weak<Shared>,
}

impl TaskWaker {
    pub fn new(id: TaskId, shared: Weak<Shared>) -> Self {
        Self { id, shared }
    }
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if let Some(shared) = self.shared.upgrade() {
            shared.post(Wakeup::Task(self.id));
        }
    }
}

/// Future returned by [`Sim::sleep`].
///
/// The deadline is fixed at the first poll.
#[must_use = "futures do nothing unless polled"]
pub struct Sleep {
    sim: Sim,
    delay: LogicalTime,
    deadline: Option<LogicalTime>,
}

impl Sleep {
    pub(crate) fn new(sim: Sim, delay: LogicalTime) -> Self {
        Self {
            sim,
            delay,
            deadline: None,
        }
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let now = self.sim.now();
        match self.deadline {
            None => {
                let at = now + self.delay;
                self.deadline = Some(at);
                self.sim.schedule_wake(at, cx.waker().clone());
                Poll::Pending
            }
            Some(at) if now >= at => Poll::Ready(()),
            Some(_) => Poll::Pending,
        }
    }
}

/// Future returned by [`Sim::wait_event`].
#[must_use = "futures do nothing unless polled"]
pub struct EventWait {
    sim: Sim,
    event: EventId,
    fired: Option<Arc<AtomicBool>>,
}

impl EventWait {
    pub(crate) fn new(sim: Sim, event: EventId) -> Self {
        Self {
            sim,
            event,
            fired: None,
        }
    }
}

impl Future for EventWait {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match &self.fired {
            Some(flag) if flag.load(Ordering::Acquire) => Poll::Ready(()),
            Some(_) => Poll::Pending,
            None => {
                let flag = Arc::new(AtomicBool::new(false));
                self.sim
                    .add_waiter(self.event, Arc::clone(&flag), cx.waker().clone());
                self.fired = Some(flag);
                Poll::Pending
            }
        }
    }
}
