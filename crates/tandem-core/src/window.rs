//! Synchronisation windows exchanged between peer schedulers.

use std::fmt;

use crate::time::LogicalTime;

/// A time range agreed between two synchronising peers.
///
/// `from` means "the sender has caught up until here"; `to` means "no
/// resynchronisation is needed before here". Invariant: `from <= to`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SyncWindow {
    from: LogicalTime,
    to: LogicalTime,
}

impl SyncWindow {
    /// Immediate resynchronisation: nothing may run ahead.
    pub const ZERO: SyncWindow = SyncWindow {
        from: LogicalTime::ZERO,
        to: LogicalTime::ZERO,
    };

    /// Run forever: the sender will never constrain its partner again.
    pub const OPEN: SyncWindow = SyncWindow {
        from: LogicalTime::ZERO,
        to: LogicalTime::MAX,
    };

    /// Create a window, or `None` if `from > to`.
    pub fn new(from: LogicalTime, to: LogicalTime) -> Option<Self> {
        (from <= to).then_some(Self { from, to })
    }

    /// The window `[now, now + span]`, saturating at [`LogicalTime::MAX`].
    pub fn starting_at(now: LogicalTime, span: LogicalTime) -> Self {
        Self {
            from: now,
            to: now.saturating_add(span),
        }
    }

    /// Lower bound: the sender has caught up until here.
    pub fn from(&self) -> LogicalTime {
        self.from
    }

    /// Upper bound: no resync is needed before here.
    pub fn to(&self) -> LogicalTime {
        self.to
    }

    /// Whether `self` carries new information relative to `current`.
    ///
    /// Only windows that move either bound forward are accepted, so a
    /// peer never re-processes a redundant update.
    pub fn advances(&self, current: &SyncWindow) -> bool {
        self.to > current.to || self.from > current.from
    }

    /// Whether this is the run-forever window.
    pub fn is_open(&self) -> bool {
        self.to.is_max()
    }

    /// Whether `t` lies within `[from, to)`.
    pub fn contains(&self, t: LogicalTime) -> bool {
        t >= self.from && t < self.to
    }
}

impl Default for SyncWindow {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for SyncWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}
