//! Thread-safe kernel event notification.
//!
//! An [`AsyncSignal`] wraps one kernel event so that any thread may notify
//! it. Kernel-thread notifications go straight to the event; foreign ones
//! are queued, each with its own delay, and delivered by an update channel
//! on the kernel thread, one per update phase. The event itself holds at
//! most one pending notification, so a burst delivered before it fires
//! collapses to the earliest delay.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tandem_core::{ChannelId, EventId, LogicalTime, SourceId};
use tandem_kernel::Sim;

use crate::control::IdleSkipControl;
use crate::lock;

/// A kernel event that any thread may notify.
///
/// Optionally registered as a *suspending source*: while attached, an
/// idle kernel blocks waiting for the signal instead of starving.
pub struct AsyncSignal {
    sim: Sim,
    event: EventId,
    channel: ChannelId,
    source: SourceId,
    control: Arc<dyn IdleSkipControl>,
    outstanding: Arc<Mutex<VecDeque<LogicalTime>>>,
}

const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<AsyncSignal>();
};

impl AsyncSignal {
    /// Create a signal on the kernel thread. If `suspending`, it is
    /// attached as a suspending source immediately.
    pub fn new(
        sim: &Sim,
        control: Arc<dyn IdleSkipControl>,
        name: &str,
        suspending: bool,
    ) -> Self {
        let event = sim.create_event(format!("{name}.event"));
        let outstanding: Arc<Mutex<VecDeque<LogicalTime>>> = Arc::default();
        let queue = Arc::clone(&outstanding);
        let channel = sim.register_channel(format!("{name}.update"), move |sim, me| {
            let (delay, more) = {
                let mut q = lock(&queue);
                let delay = q.pop_front();
                (delay, !q.is_empty())
            };
            if let Some(delay) = delay {
                sim.notify(event, delay);
            }
            if more {
                sim.request_update(me);
            }
        });
        let signal = Self {
            sim: sim.clone(),
            event,
            channel,
            source: SourceId::next(),
            control,
            outstanding,
        };
        if suspending {
            signal.attach_suspending(true);
        }
        signal
    }

    /// The underlying kernel event, for method sensitivity or
    /// [`Sim::wait_event`].
    pub fn event(&self) -> EventId {
        self.event
    }

    /// Notify the event after `delay`. Callable from any thread.
    ///
    /// On the kernel thread this is an ordinary notification. Elsewhere
    /// the delay is queued and the kernel is asked to deliver it, waking
    /// it if it is blocked while idle. Every foreign notification reaches
    /// the event, but notifications still pending there are coalesced to
    /// the earliest delay: `notify(30)` then `notify(10)` fires once, at 10.
    pub fn notify(&self, delay: LogicalTime) {
        if self.sim.is_kernel_thread() {
            self.sim.notify(self.event, delay);
            return;
        }
        lock(&self.outstanding).push_back(delay);
        self.sim.request_update(self.channel);
    }

    /// Attach to (or detach from) the coordinator as a suspending source.
    pub fn attach_suspending(&self, enabled: bool) {
        if enabled {
            self.control.register_source(self.source);
        } else {
            self.control.unregister_source(self.source);
        }
    }

    /// Foreign notifications not yet delivered to the kernel.
    pub fn outstanding(&self) -> usize {
        lock(&self.outstanding).len()
    }
}

impl Drop for AsyncSignal {
    fn drop(&mut self) {
        self.control.unregister_source(self.source);
    }
}

impl std::fmt::Debug for AsyncSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSignal")
            .field("event", &self.event)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SuspendCoordinator;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tandem_kernel::{Kernel, RunOutcome};

    #[test]
    fn kernel_thread_notify_is_direct() {
        let mut kernel = Kernel::new();
        let sim = kernel.handle();
        let coordinator = SuspendCoordinator::install(&sim).unwrap();
        let signal = AsyncSignal::new(&sim, coordinator, "sig", false);
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        sim.spawn_method("m", &[signal.event()], move |_| {
            h.fetch_add(1, Ordering::Relaxed);
        });
        signal.notify(LogicalTime::new(15));
        assert_eq!(signal.outstanding(), 0);
        assert_eq!(kernel.run(), RunOutcome::Starved);
        assert_eq!(kernel.now(), LogicalTime::new(15));
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn foreign_burst_coalesces_to_earliest_delay() {
        let mut kernel = Kernel::new();
        let sim = kernel.handle();
        let coordinator = SuspendCoordinator::install(&sim).unwrap();
        let signal = Arc::new(AsyncSignal::new(&sim, coordinator, "sig", false));
        let fired_at = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&fired_at);
        sim.spawn_method("m", &[signal.event()], move |sim| {
            log.lock().unwrap().push(sim.now());
        });

        let remote = Arc::clone(&signal);
        std::thread::spawn(move || {
            remote.notify(LogicalTime::new(30));
            remote.notify(LogicalTime::new(10));
        })
        .join()
        .unwrap();
        assert_eq!(signal.outstanding(), 2);

        assert_eq!(kernel.run(), RunOutcome::Starved);
        assert_eq!(signal.outstanding(), 0);
        assert_eq!(*fired_at.lock().unwrap(), vec![LogicalTime::new(10)]);
    }

    #[test]
    fn suspending_signal_registers_and_drop_unregisters() {
        let kernel = Kernel::new();
        let sim = kernel.handle();
        let coordinator = SuspendCoordinator::install(&sim).unwrap();
        let signal = AsyncSignal::new(&sim, coordinator.clone(), "sig", true);
        assert_eq!(coordinator.stats().sources, 1);
        signal.attach_suspending(false);
        assert_eq!(coordinator.stats().sources, 0);
        signal.attach_suspending(true);
        drop(signal);
        assert_eq!(coordinator.stats().sources, 0);
    }
}
