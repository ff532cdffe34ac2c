//! Per-kernel synchronisation context.

use std::sync::Arc;

use tandem_kernel::Sim;

use crate::config::{KeeperPolicy, SyncConfig, WindowPolicy};
use crate::control::IdleSkipControl;
use crate::coordinator::SuspendCoordinator;
use crate::error::SyncError;
use crate::jobs::ForeignJobRunner;
use crate::keeper::TimeBudgetKeeper;
use crate::limiter::RealtimeLimiter;
use crate::signal::AsyncSignal;
use crate::windowed::WindowedSynchronizer;

/// Owns the [`SuspendCoordinator`] of one kernel and builds components
/// wired to it.
///
/// Create once per kernel, on the kernel thread, during setup. Dropping
/// the context (and every component built from it) removes the
/// coordinator again.
pub struct SyncContext {
    sim: Sim,
    config: SyncConfig,
    coordinator: Arc<SuspendCoordinator>,
}

impl SyncContext {
    /// Validate `config` and install a coordinator on `sim`'s kernel.
    pub fn new(sim: &Sim, config: SyncConfig) -> Result<Self, SyncError> {
        config.validate()?;
        let coordinator = SuspendCoordinator::install(sim)?;
        log::debug!(
            "sync context ready (quantum {}, sync timeout {} ms)",
            config.quantum,
            config.sync_timeout_ms
        );
        Ok(Self {
            sim: sim.clone(),
            config,
            coordinator,
        })
    }

    /// The kernel handle.
    pub fn sim(&self) -> &Sim {
        &self.sim
    }

    /// The active configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The installed coordinator.
    pub fn coordinator(&self) -> &Arc<SuspendCoordinator> {
        &self.coordinator
    }

    /// The coordinator as an idle-skip capability.
    pub fn control(&self) -> Arc<dyn IdleSkipControl> {
        self.coordinator.clone()
    }

    /// A new [`AsyncSignal`], optionally attached as a suspending source.
    pub fn async_signal(&self, name: &str, suspending: bool) -> AsyncSignal {
        AsyncSignal::new(&self.sim, self.control(), name, suspending)
    }

    /// A new idle [`TimeBudgetKeeper`] using the configured quantum and
    /// keeper policy.
    pub fn time_budget_keeper(&self, name: &str) -> TimeBudgetKeeper {
        self.time_budget_keeper_with(name, self.config.keeper_policy)
    }

    /// A new idle [`TimeBudgetKeeper`] with an explicit policy.
    pub fn time_budget_keeper_with(&self, name: &str, policy: KeeperPolicy) -> TimeBudgetKeeper {
        let keeper = TimeBudgetKeeper::new(
            &self.sim,
            self.control(),
            name,
            self.config.quantum,
            self.config.sync_timeout(),
        );
        keeper.set_policy(policy);
        keeper
    }

    /// A new, disabled [`RealtimeLimiter`] with the configured period.
    pub fn realtime_limiter(&self, name: &str) -> RealtimeLimiter {
        RealtimeLimiter::new(&self.sim, self.control(), name, self.config.realtime_quantum())
    }

    /// A new [`ForeignJobRunner`].
    pub fn job_runner(&self, name: &str) -> ForeignJobRunner {
        ForeignJobRunner::new(&self.sim, self.control(), name)
    }

    /// A new [`WindowedSynchronizer`] with the configured policy.
    pub fn windowed_synchronizer(&self, name: &str) -> WindowedSynchronizer {
        self.windowed_synchronizer_with(name, self.config.window_policy)
    }

    /// A new [`WindowedSynchronizer`] with an explicit policy.
    pub fn windowed_synchronizer_with(&self, name: &str, policy: WindowPolicy) -> WindowedSynchronizer {
        WindowedSynchronizer::new(&self.sim, self.control(), name, policy)
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("config", &self.config)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;
    use tandem_core::LogicalTime;
    use tandem_kernel::Kernel;

    #[test]
    fn invalid_config_installs_nothing() {
        let kernel = Kernel::new();
        let sim = kernel.handle();
        let bad = SyncConfig {
            quantum: LogicalTime::ZERO,
            ..SyncConfig::default()
        };
        match SyncContext::new(&sim, bad) {
            Err(SyncError::Config(ConfigError::ZeroQuantum)) => {}
            other => panic!("expected ZeroQuantum, got {other:?}"),
        }
        assert!(SyncContext::new(&sim, SyncConfig::default()).is_ok());
    }

    #[test]
    fn one_context_per_kernel() {
        let kernel = Kernel::new();
        let sim = kernel.handle();
        let _ctx = SyncContext::new(&sim, SyncConfig::default()).unwrap();
        match SyncContext::new(&sim, SyncConfig::default()) {
            Err(SyncError::DuplicateCoordinator) => {}
            other => panic!("expected DuplicateCoordinator, got {other:?}"),
        }
    }

    #[test]
    fn components_share_the_coordinator() {
        let kernel = Kernel::new();
        let ctx = SyncContext::new(&kernel.handle(), SyncConfig::default()).unwrap();
        let _signal = ctx.async_signal("irq", true);
        let keeper = ctx.time_budget_keeper("cpu");
        assert_eq!(keeper.quantum(), ctx.config().quantum);
        assert_eq!(ctx.coordinator().stats().sources, 1);
    }

    #[test]
    fn factories_apply_configured_policies() {
        let kernel = Kernel::new();
        let config = SyncConfig {
            keeper_policy: KeeperPolicy::Adaptive,
            realtime_quantum_ms: 4,
            ..SyncConfig::default()
        };
        let ctx = SyncContext::new(&kernel.handle(), config).unwrap();
        assert_eq!(ctx.time_budget_keeper("cpu0").policy(), KeeperPolicy::Adaptive);
        assert_eq!(
            ctx.time_budget_keeper_with("cpu1", KeeperPolicy::Rolling).policy(),
            KeeperPolicy::Rolling
        );
        let limiter = ctx.realtime_limiter("rt");
        assert_eq!(limiter.period(), std::time::Duration::from_millis(4));
        assert!(!limiter.is_enabled());
    }
}
