//! Error types for the synchronisation engine.

use std::error::Error;
use std::fmt;

use crate::config::ConfigError;

/// Errors returned by the synchronisation components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The supplied [`SyncConfig`](crate::SyncConfig) is invalid.
    Config(ConfigError),
    /// A suspend coordinator is already installed on this kernel.
    DuplicateCoordinator,
    /// [`TimeBudgetKeeper::start`](crate::TimeBudgetKeeper::start) was
    /// called on a running keeper.
    AlreadyRunning,
    /// A windowed synchroniser already has a partner.
    AlreadyBound,
    /// Neither peer of a windowed pair uses the keep-alive policy, so the
    /// pair could deadlock with both sides detached.
    NoKeepAlivePeer,
    /// The OS refused to spawn a worker thread.
    ThreadSpawnFailed {
        /// The underlying I/O error, rendered.
        reason: String,
    },
    /// A foreign job was cancelled before it produced a result.
    JobCancelled,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "config: {e}"),
            Self::DuplicateCoordinator => {
                write!(f, "a suspend coordinator is already installed on this kernel")
            }
            Self::AlreadyRunning => write!(f, "time budget keeper is already running"),
            Self::AlreadyBound => write!(f, "windowed synchronizer is already bound"),
            Self::NoKeepAlivePeer => {
                write!(f, "at least one peer of a windowed pair must keep alive")
            }
            Self::ThreadSpawnFailed { reason } => write!(f, "thread spawn failed: {reason}"),
            Self::JobCancelled => write!(f, "foreign job was cancelled"),
        }
    }
}

impl Error for SyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for SyncError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}
