//! Strongly-typed identifiers.
//!
//! Kernel-scoped handles ([`EventId`], [`ProcessId`], [`TaskId`],
//! [`ChannelId`]) are dense indices assigned by one kernel and are only
//! meaningful to it. Synchronisation identities ([`VoterId`],
//! [`SourceId`]) are process-unique and allocated from atomic counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies a kernel event (a notifiable trigger).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u32);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ev{}", self.0)
    }
}

/// Identifies a method process registered with a kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u32);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc{}", self.0)
    }
}

/// Identifies a task (future) spawned on a kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u32);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task{}", self.0)
    }
}

/// Identifies an update channel: a callback the kernel runs in its update
/// phase when any thread requests it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan{}", self.0)
    }
}

/// Counter for unique [`VoterId`] allocation.
static VOTER_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identity under which a component casts reentrant suspend votes.
///
/// A voter holds at most one vote of each kind at a time; voting twice
/// is idempotent and releasing an unheld vote is a no-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoterId(u64);

impl VoterId {
    /// Allocate a fresh, unique voter identity. Thread-safe.
    pub fn next() -> Self {
        Self(VOTER_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for VoterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "voter{}", self.0)
    }
}

/// Counter for unique [`SourceId`] allocation.
static SOURCE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identity of a suspending source: while registered, idle time must be
/// blocked on rather than skipped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl SourceId {
    /// Allocate a fresh, unique source identity. Thread-safe.
    pub fn next() -> Self {
        Self(SOURCE_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voter_ids_are_unique() {
        let a = VoterId::next();
        let b = VoterId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn source_ids_are_unique_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..100).map(|_| SourceId::next()).collect::<Vec<_>>()))
            .collect();
        let mut all: Vec<SourceId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let before = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), before);
    }

    #[test]
    fn display_is_prefixed() {
        assert_eq!(EventId(3).to_string(), "ev3");
        assert_eq!(ChannelId(1).to_string(), "chan1");
    }
}
