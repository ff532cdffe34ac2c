//! Symmetric window-based synchronisation between two schedulers.
//!
//! Two [`WindowedSynchronizer`]s, usually on different kernels, keep each
//! other informed with [`SyncWindow`]s. A window `[from, to]` received from
//! the partner means "I have caught up until `from`; you need not resync
//! before `to`". Each side decides locally whether to idle or proceed.
//!
//! Windows are accepted from any thread but only acted on in the kernel's
//! update phase:
//!
//! - *sweep*: if `from` is still in the future, wake at exactly `from` and
//!   tell the partner where we are;
//! - *step*: before `to`, run freely and observe `to`; at `to`, send a
//!   fresh window and then either hold the kernel paused for the partner
//!   or, under a non-keep-alive policy with nothing pending locally,
//!   detach from the idle-skip barrier altogether.

use std::sync::{Arc, Mutex, OnceLock, Weak};

use tandem_core::{ChannelId, EventId, LogicalTime, SourceId, SyncWindow, VoterId};
use tandem_kernel::Sim;

use crate::config::{Horizon, WindowPolicy};
use crate::control::IdleSkipControl;
use crate::error::SyncError;
use crate::lock;

type Partner = Box<dyn Fn(SyncWindow) + Send + Sync>;

struct WindowInner {
    name: String,
    sim: Sim,
    control: Arc<dyn IdleSkipControl>,
    policy: WindowPolicy,
    voter: VoterId,
    source: SourceId,
    window: Mutex<SyncWindow>,
    partner: OnceLock<Partner>,
    sweep: EventId,
    step: EventId,
    channel: ChannelId,
}

/// One side of a windowed synchronisation pair.
///
/// Create on the kernel thread, then bind to exactly one partner. Handles
/// are cheap clones; when the last one is dropped the side detaches.
#[derive(Clone)]
pub struct WindowedSynchronizer {
    inner: Arc<WindowInner>,
}

const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<WindowedSynchronizer>();
};

impl WindowedSynchronizer {
    /// Create an unbound synchroniser. The first step runs when the kernel
    /// starts; [`detach`](Self::detach) runs at end of simulation.
    pub fn new(
        sim: &Sim,
        control: Arc<dyn IdleSkipControl>,
        name: &str,
        policy: WindowPolicy,
    ) -> Self {
        let sweep = sim.create_event(format!("{name}.sweep"));
        let step = sim.create_event(format!("{name}.step"));
        let inner = Arc::new_cyclic(|weak: &Weak<WindowInner>| {
            let weak = weak.clone();
            let channel = sim.register_channel(format!("{name}.update"), move |sim, _| {
                if let Some(inner) = weak.upgrade() {
                    inner.update(sim);
                }
            });
            WindowInner {
                name: name.to_owned(),
                sim: sim.clone(),
                control,
                policy,
                voter: VoterId::next(),
                source: SourceId::next(),
                window: Mutex::new(SyncWindow::ZERO),
                partner: OnceLock::new(),
                sweep,
                step,
                channel,
            }
        });

        let weak = Arc::downgrade(&inner);
        sim.spawn_method(format!("{name}.sweep"), &[sweep], move |sim| {
            if let Some(inner) = weak.upgrade() {
                inner.sweep(sim);
            }
        });
        let weak = Arc::downgrade(&inner);
        sim.spawn_method(format!("{name}.step"), &[step], move |sim| {
            if let Some(inner) = weak.upgrade() {
                inner.step(sim);
            }
        });
        sim.on_start(move |sim| sim.notify(step, LogicalTime::ZERO));
        let weak = Arc::downgrade(&inner);
        sim.on_end(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.detach();
            }
        });
        Self { inner }
    }

    /// Bind to a partner callback. Binding is once-only: a second call
    /// logs a warning and returns [`SyncError::AlreadyBound`].
    pub fn register_partner<F>(&self, partner: F) -> Result<(), SyncError>
    where
        F: Fn(SyncWindow) + Send + Sync + 'static,
    {
        self.inner.partner.set(Box::new(partner)).map_err(|_| {
            log::warn!("windowed synchronizer '{}' is already bound", self.inner.name);
            SyncError::AlreadyBound
        })
    }

    /// Bind so that windows this side sends are accepted by `other`.
    pub fn bind(&self, other: &WindowedSynchronizer) -> Result<(), SyncError> {
        let weak = Arc::downgrade(&other.inner);
        self.register_partner(move |window| {
            if let Some(other) = weak.upgrade() {
                other.accept_window(window);
            }
        })
    }

    /// Bind `a` and `b` to each other. At least one of them must use the
    /// keep-alive policy, otherwise both could detach at once and leave
    /// the pair waiting on each other forever.
    pub fn bind_pair(a: &WindowedSynchronizer, b: &WindowedSynchronizer) -> Result<(), SyncError> {
        if !a.inner.policy.keep_alive && !b.inner.policy.keep_alive {
            return Err(SyncError::NoKeepAlivePeer);
        }
        a.bind(b)?;
        b.bind(a)
    }

    /// Offer a window from the partner. Callable from any thread; acted on
    /// in the kernel's next update phase, and only if it moves either
    /// bound forward.
    pub fn accept_window(&self, window: SyncWindow) {
        self.inner.accept_window(window);
    }

    /// The window most recently accepted from the partner.
    pub fn window(&self) -> SyncWindow {
        *lock(&self.inner.window)
    }

    /// The policy this side was created with.
    pub fn policy(&self) -> WindowPolicy {
        self.inner.policy
    }

    /// Disconnect: release all votes and send the partner an open window.
    pub fn detach(&self) {
        self.inner.detach();
    }
}

impl WindowInner {
    fn accept_window(&self, window: SyncWindow) {
        let advanced = {
            let mut current = lock(&self.window);
            if window.advances(&current) {
                *current = window;
                true
            } else {
                false
            }
        };
        if advanced {
            self.sim.request_update(self.channel);
        }
    }

    fn send(&self, window: SyncWindow) {
        match self.partner.get() {
            Some(partner) => partner(window),
            None => log::trace!("'{}' unbound, dropping window {window}", self.name),
        }
    }

    fn horizon(&self, sim: &Sim) -> LogicalTime {
        match self.policy.horizon {
            Horizon::FixedQuantum(q) => q,
            Horizon::NextEvent => sim.time_to_pending_activity(),
        }
    }

    fn update(&self, sim: &Sim) {
        let window = *lock(&self.window);
        let now = sim.now();
        if window.from() > now {
            sim.notify(self.sweep, window.from() - now);
        } else {
            sim.cancel(self.sweep);
        }
        sim.notify(self.step, LogicalTime::ZERO);
    }

    fn sweep(&self, sim: &Sim) {
        let now = sim.now();
        self.send(SyncWindow::starting_at(now, self.horizon(sim)));
    }

    fn step(&self, sim: &Sim) {
        let window = *lock(&self.window);
        let now = sim.now();
        let fresh = SyncWindow::starting_at(now, self.horizon(sim));

        if now < window.to() {
            self.control.request_resume(self.voter);
            self.control.unregister_source(self.source);
            self.send(fresh);
            if !window.is_open() {
                sim.notify_observed(self.step, window.to() - now);
            }
            return;
        }

        self.send(fresh);
        if self.policy.keep_alive || sim.pending_activity() {
            log::trace!("'{}' reached {} at {now}, holding", self.name, window.to());
            self.control.register_source(self.source);
            self.control.request_pause(self.voter);
        } else {
            log::trace!("'{}' idle at {now}, detaching", self.name);
            self.control.request_resume(self.voter);
            self.control.unregister_source(self.source);
        }
    }

    fn detach(&self) {
        self.control.request_resume(self.voter);
        self.control.unregister_source(self.source);
        self.send(SyncWindow::OPEN);
    }
}

impl Drop for WindowInner {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for WindowedSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowedSynchronizer")
            .field("name", &self.inner.name)
            .field("window", &self.window())
            .field("policy", &self.inner.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SuspendCoordinator;
    use tandem_kernel::Kernel;

    fn t(ps: u64) -> LogicalTime {
        LogicalTime::new(ps)
    }

    fn policy(keep_alive: bool) -> WindowPolicy {
        WindowPolicy {
            horizon: Horizon::FixedQuantum(t(100)),
            keep_alive,
        }
    }

    #[test]
    fn rebinding_is_rejected() {
        let kernel = Kernel::new();
        let sim = kernel.handle();
        let coordinator = SuspendCoordinator::install(&sim).unwrap();
        let a = WindowedSynchronizer::new(&sim, coordinator.clone(), "a", policy(true));
        let b = WindowedSynchronizer::new(&sim, coordinator.clone(), "b", policy(true));
        a.bind(&b).unwrap();
        match a.register_partner(|_| {}) {
            Err(SyncError::AlreadyBound) => {}
            other => panic!("expected AlreadyBound, got {other:?}"),
        }
    }

    #[test]
    fn pair_without_keep_alive_is_rejected() {
        let kernel = Kernel::new();
        let sim = kernel.handle();
        let coordinator = SuspendCoordinator::install(&sim).unwrap();
        let a = WindowedSynchronizer::new(&sim, coordinator.clone(), "a", policy(false));
        let b = WindowedSynchronizer::new(&sim, coordinator.clone(), "b", policy(false));
        assert_eq!(
            WindowedSynchronizer::bind_pair(&a, &b),
            Err(SyncError::NoKeepAlivePeer)
        );
        let c = WindowedSynchronizer::new(&sim, coordinator, "c", policy(true));
        assert_eq!(WindowedSynchronizer::bind_pair(&a, &c), Ok(()));
    }

    #[test]
    fn only_advancing_windows_are_accepted() {
        let kernel = Kernel::new();
        let sim = kernel.handle();
        let coordinator = SuspendCoordinator::install(&sim).unwrap();
        let a = WindowedSynchronizer::new(&sim, coordinator, "a", policy(true));
        let w = SyncWindow::starting_at(t(0), t(100));
        a.accept_window(w);
        assert_eq!(a.window(), w);
        a.accept_window(SyncWindow::starting_at(t(0), t(50)));
        assert_eq!(a.window(), w);
        a.accept_window(SyncWindow::OPEN);
        assert!(a.window().is_open());
    }

    #[test]
    fn detach_sends_open_window() {
        let kernel = Kernel::new();
        let sim = kernel.handle();
        let coordinator = SuspendCoordinator::install(&sim).unwrap();
        let a = WindowedSynchronizer::new(&sim, coordinator, "a", policy(true));
        let sent = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&sent);
        a.register_partner(move |w| log.lock().unwrap().push(w)).unwrap();
        a.detach();
        assert_eq!(*sent.lock().unwrap(), vec![SyncWindow::OPEN]);
    }

    #[test]
    fn last_handle_drop_detaches() {
        let kernel = Kernel::new();
        let sim = kernel.handle();
        let coordinator = SuspendCoordinator::install(&sim).unwrap();
        let a = WindowedSynchronizer::new(&sim, coordinator.clone(), "a", policy(true));
        let sent = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&sent);
        a.register_partner(move |w| log.lock().unwrap().push(w)).unwrap();
        coordinator.register_source(a.inner.source);
        coordinator.request_pause(a.inner.voter);

        let clone = a.clone();
        drop(a);
        assert!(sent.lock().unwrap().is_empty());
        drop(clone);
        assert_eq!(*sent.lock().unwrap(), vec![SyncWindow::OPEN]);
        let stats = coordinator.stats();
        assert_eq!(stats.sources, 0);
        assert_eq!(stats.pause_requests, 0);
    }
}
