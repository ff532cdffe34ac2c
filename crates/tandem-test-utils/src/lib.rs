//! Test utilities and mock types for Tandem development.
//!
//! Provides a recording mock of [`IdleSkipControl`], a periodic workload
//! that keeps a kernel busy ([`spawn_ticker`]) and a wall-clock polling
//! helper ([`wait_until`]) for cross-thread assertions.

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod fixtures;

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tandem_core::{SourceId, VoterId};
use tandem_sync::IdleSkipControl;

pub use fixtures::{spawn_ticker, TickerLog};

/// One call observed by [`RecordingControl`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlCall {
    RegisterSource(SourceId),
    UnregisterSource(SourceId),
    VoteBlockSkip(VoterId),
    VoteRelease(VoterId),
    RequestPause(VoterId),
    RequestResume(VoterId),
    AsyncWakeup,
}

#[derive(Default)]
struct Recorded {
    calls: Vec<ControlCall>,
    sources: Vec<SourceId>,
    block_skip: Vec<VoterId>,
    pause: Vec<VoterId>,
}

/// Mock implementation of [`IdleSkipControl`].
///
/// Records every call in order and keeps the same per-caller vote sets a
/// real coordinator would, but never blocks anything. Use it to check
/// which votes a component casts without running a kernel to completion.
#[derive(Default)]
pub struct RecordingControl {
    inner: Mutex<Recorded>,
}

impl RecordingControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call so far, oldest first.
    pub fn calls(&self) -> Vec<ControlCall> {
        self.lock().calls.clone()
    }

    /// Forget recorded calls; vote sets are kept.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn sources(&self) -> usize {
        self.lock().sources.len()
    }

    pub fn block_skip_votes(&self) -> usize {
        self.lock().block_skip.len()
    }

    pub fn pause_requests(&self) -> usize {
        self.lock().pause.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn insert<T: PartialEq>(set: &mut Vec<T>, item: T) -> bool {
    if set.contains(&item) {
        return false;
    }
    set.push(item);
    true
}

fn remove<T: PartialEq>(set: &mut Vec<T>, item: &T) -> bool {
    let before = set.len();
    set.retain(|x| x != item);
    set.len() != before
}

impl IdleSkipControl for RecordingControl {
    fn register_source(&self, source: SourceId) -> bool {
        let mut r = self.lock();
        r.calls.push(ControlCall::RegisterSource(source));
        insert(&mut r.sources, source)
    }

    fn unregister_source(&self, source: SourceId) -> bool {
        let mut r = self.lock();
        r.calls.push(ControlCall::UnregisterSource(source));
        remove(&mut r.sources, &source)
    }

    fn vote_block_skip(&self, voter: VoterId) -> bool {
        let mut r = self.lock();
        r.calls.push(ControlCall::VoteBlockSkip(voter));
        insert(&mut r.block_skip, voter)
    }

    fn vote_release(&self, voter: VoterId) -> bool {
        let mut r = self.lock();
        r.calls.push(ControlCall::VoteRelease(voter));
        remove(&mut r.block_skip, &voter)
    }

    fn request_pause(&self, voter: VoterId) -> bool {
        let mut r = self.lock();
        r.calls.push(ControlCall::RequestPause(voter));
        insert(&mut r.pause, voter)
    }

    fn request_resume(&self, voter: VoterId) -> bool {
        let mut r = self.lock();
        r.calls.push(ControlCall::RequestResume(voter));
        remove(&mut r.pause, &voter)
    }

    fn async_wakeup(&self) {
        self.lock().calls.push(ControlCall::AsyncWakeup);
    }

    fn is_idle(&self) -> bool {
        false
    }
}

/// Poll `cond` every millisecond until it holds or `timeout` elapses.
/// Returns whether it held.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
