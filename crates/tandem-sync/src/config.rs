//! Synchronisation configuration and validation.
//!
//! [`SyncConfig`] is the input to [`SyncContext::new`](crate::SyncContext::new),
//! which calls [`validate()`](SyncConfig::validate) before installing
//! anything on the kernel.

use std::error::Error;
use std::fmt;
use std::time::Duration;

use tandem_core::LogicalTime;

// ── WindowPolicy ───────────────────────────────────────────────────

/// How far ahead of `now` a windowed synchroniser lets its partner run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Horizon {
    /// Always grant a fixed span.
    FixedQuantum(LogicalTime),
    /// Grant up to this side's next locally pending event. With nothing
    /// pending the window is open-ended.
    NextEvent,
}

/// Policy for a [`WindowedSynchronizer`](crate::WindowedSynchronizer).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowPolicy {
    /// How each window's `to` is computed.
    pub horizon: Horizon,
    /// Stay paused at the end of a window even when locally idle, waiting
    /// for the partner's next window. If `false`, an idle peer detaches
    /// from the idle-skip barrier instead. At least one peer of a bound
    /// pair must keep alive.
    pub keep_alive: bool,
}

impl Default for WindowPolicy {
    fn default() -> Self {
        Self {
            horizon: Horizon::FixedQuantum(DEFAULT_QUANTUM),
            keep_alive: true,
        }
    }
}

// ── KeeperPolicy ───────────────────────────────────────────────────

/// How much lead a [`TimeBudgetKeeper`](crate::TimeBudgetKeeper) grants
/// its foreign engine before [`need_sync`](crate::TimeBudgetKeeper::need_sync)
/// says to stop and sync.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KeeperPolicy {
    /// Run until two quanta ahead of kernel time.
    #[default]
    TwoQuantum,
    /// Run until the next quantum boundary after kernel time.
    Quantum,
    /// Grant 2q, q or q/2 as the lead grows past zero, q and 2q, then
    /// nothing.
    Adaptive,
    /// Run until the kernel's next pending activity, capped at the quantum
    /// boundary. Activity due now ends the budget and pokes the kernel.
    Rolling,
    /// Never ask the engine to stop. A foreign `sync()` only pokes the
    /// kernel and returns.
    FreeRunning,
}

// ── SyncConfig ─────────────────────────────────────────────────────

const DEFAULT_QUANTUM: LogicalTime = LogicalTime::from_us(1);

/// Engine-wide synchronisation settings.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Largest lead a foreign engine may claim over kernel time before it
    /// must resynchronise. Default: 1 µs.
    pub quantum: LogicalTime,
    /// Soft timeout (wall-clock ms) after which a blocked `sync()` logs a
    /// warning and re-pokes the kernel. Default: 1000.
    pub sync_timeout_ms: u64,
    /// Default policy for windowed synchronisers. Default: fixed-quantum,
    /// keep-alive.
    pub window_policy: WindowPolicy,
    /// Default budget policy for time budget keepers. Default: two quanta.
    pub keeper_policy: KeeperPolicy,
    /// Wall-clock period (ms) at which a realtime limiter lets kernel time
    /// advance. Default: 10.
    pub realtime_quantum_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            quantum: DEFAULT_QUANTUM,
            sync_timeout_ms: 1000,
            window_policy: WindowPolicy::default(),
            keeper_policy: KeeperPolicy::default(),
            realtime_quantum_ms: 10,
        }
    }
}

impl SyncConfig {
    /// Configuration with the given quantum, also used as the window
    /// horizon.
    pub fn with_quantum(quantum: LogicalTime) -> Self {
        Self {
            quantum,
            window_policy: WindowPolicy {
                horizon: Horizon::FixedQuantum(quantum),
                ..WindowPolicy::default()
            },
            ..Self::default()
        }
    }

    /// The soft sync timeout as a [`Duration`].
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    /// The realtime limiter period as a [`Duration`].
    pub fn realtime_quantum(&self) -> Duration {
        Duration::from_millis(self.realtime_quantum_ms)
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.quantum.is_zero() {
            return Err(ConfigError::ZeroQuantum);
        }
        if self.sync_timeout_ms == 0 {
            return Err(ConfigError::ZeroSyncTimeout);
        }
        if self.window_policy.horizon == Horizon::FixedQuantum(LogicalTime::ZERO) {
            return Err(ConfigError::ZeroWindowHorizon);
        }
        if self.realtime_quantum_ms == 0 {
            return Err(ConfigError::ZeroRealtimeQuantum);
        }
        Ok(())
    }
}

// ── ConfigError ────────────────────────────────────────────────────

/// Errors detected during [`SyncConfig::validate()`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The quantum must be non-zero.
    ZeroQuantum,
    /// `sync_timeout_ms` must be at least 1.
    ZeroSyncTimeout,
    /// A fixed window horizon must be non-zero.
    ZeroWindowHorizon,
    /// `realtime_quantum_ms` must be at least 1.
    ZeroRealtimeQuantum,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroQuantum => write!(f, "quantum must be non-zero"),
            Self::ZeroSyncTimeout => write!(f, "sync_timeout_ms must be at least 1"),
            Self::ZeroWindowHorizon => write!(f, "fixed window horizon must be non-zero"),
            Self::ZeroRealtimeQuantum => write!(f, "realtime_quantum_ms must be at least 1"),
        }
    }
}

impl Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(SyncConfig::default().validate(), Ok(()));
    }

    #[test]
    fn zero_quantum_rejected() {
        let cfg = SyncConfig {
            quantum: LogicalTime::ZERO,
            ..SyncConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroQuantum));
    }

    #[test]
    fn zero_timeout_rejected() {
        let cfg = SyncConfig {
            sync_timeout_ms: 0,
            ..SyncConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroSyncTimeout));
    }

    #[test]
    fn zero_realtime_quantum_rejected() {
        let cfg = SyncConfig {
            realtime_quantum_ms: 0,
            ..SyncConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroRealtimeQuantum));
        assert_eq!(SyncConfig::default().realtime_quantum(), Duration::from_millis(10));
        assert_eq!(SyncConfig::default().keeper_policy, KeeperPolicy::TwoQuantum);
    }

    #[test]
    fn zero_fixed_horizon_rejected() {
        let mut cfg = SyncConfig::default();
        cfg.window_policy.horizon = Horizon::FixedQuantum(LogicalTime::ZERO);
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroWindowHorizon));

        cfg.window_policy.horizon = Horizon::NextEvent;
        assert_eq!(cfg.validate(), Ok(()));
    }

    #[test]
    fn with_quantum_sets_window_horizon() {
        let cfg = SyncConfig::with_quantum(LogicalTime::new(100));
        assert_eq!(
            cfg.window_policy.horizon,
            Horizon::FixedQuantum(LogicalTime::new(100))
        );
        assert!(cfg.window_policy.keep_alive);
    }
}
