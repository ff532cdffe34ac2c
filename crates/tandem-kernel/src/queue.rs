//! Time-ordered queues of scheduled triggers.
//!
//! A [`TimedQueue`] is a min-heap keyed on `(at, seq)`: entries due at the
//! same instant come out in the order they were scheduled.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::task::Waker;

use tandem_core::{EventId, LogicalTime};

/// What fires when a queue entry comes due.
pub(crate) enum Target {
    /// Trigger an event, provided its generation still matches.
    Event { id: EventId, generation: u64 },
    /// Wake a sleeping task.
    Wake(Waker),
}

pub(crate) struct Entry {
    pub at: LogicalTime,
    seq: u64,
    pub target: Target,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed: BinaryHeap is a max-heap, we want the earliest entry on top.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A min-heap of scheduled triggers.
#[derive(Default)]
pub(crate) struct TimedQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl TimedQueue {
    pub fn push(&mut self, at: LogicalTime, target: Target) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry { at, seq, target });
    }

    pub fn peek(&self) -> Option<&Entry> {
        self.heap.peek()
    }

    pub fn peek_time(&self) -> Option<LogicalTime> {
        self.heap.peek().map(|e| e.at)
    }

    pub fn pop(&mut self) -> Option<Entry> {
        self.heap.pop()
    }

    /// Pop the head if it is due at or before `now`.
    pub fn pop_due(&mut self, now: LogicalTime) -> Option<Entry> {
        if self.peek_time()? <= now {
            self.heap.pop()
        } else {
            None
        }
    }

    /// All entries, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.heap.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: u32) -> Target {
        Target::Event {
            id: EventId(n),
            generation: 0,
        }
    }

    fn id_of(e: &Entry) -> u32 {
        match e.target {
            Target::Event { id, .. } => id.0,
            Target::Wake(_) => panic!("expected event target"),
        }
    }

    #[test]
    fn pops_in_time_order() {
        let mut q = TimedQueue::default();
        q.push(LogicalTime::new(30), event(3));
        q.push(LogicalTime::new(10), event(1));
        q.push(LogicalTime::new(20), event(2));
        let order: Vec<u32> = std::iter::from_fn(|| q.pop()).map(|e| id_of(&e)).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn same_instant_is_fifo() {
        let mut q = TimedQueue::default();
        for n in 0..5 {
            q.push(LogicalTime::new(7), event(n));
        }
        let order: Vec<u32> = std::iter::from_fn(|| q.pop()).map(|e| id_of(&e)).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn pop_due_respects_now() {
        let mut q = TimedQueue::default();
        q.push(LogicalTime::new(5), event(0));
        assert!(q.pop_due(LogicalTime::new(4)).is_none());
        assert_eq!(q.iter().count(), 1);
        assert!(q.pop_due(LogicalTime::new(5)).is_some());
        assert!(q.peek().is_none());
    }
}
