//! RealtimeLimiter pacing a real kernel against the wall clock.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tandem_core::LogicalTime;
use tandem_kernel::{Kernel, RunOutcome};
use tandem_sync::{RealtimeLimiter, SyncConfig, SyncContext};
use tandem_test_utils::{spawn_ticker, RecordingControl};

#[test]
fn kernel_never_outruns_the_wall_clock() {
    let mut kernel = Kernel::new();
    let sim = kernel.handle();
    let config = SyncConfig {
        realtime_quantum_ms: 5,
        ..SyncConfig::default()
    };
    let ctx = SyncContext::new(&sim, config).unwrap();
    // Unpaced, this load would finish in well under the run below.
    spawn_ticker(&sim, "load", LogicalTime::from_us(50), LogicalTime::from_ms(500));
    let limiter = ctx.realtime_limiter("rt");

    let started = Instant::now();
    limiter.enable().unwrap();
    let remote = sim.clone();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(60));
        remote.request_stop();
    });

    assert_eq!(kernel.run(), RunOutcome::Stopped);
    let wall = started.elapsed();
    stopper.join().unwrap();

    let now = kernel.now();
    assert!(now >= LogicalTime::from_ms(5), "kernel never reached the first limit: {now}");
    assert!(
        now <= LogicalTime::from_duration(wall + limiter.period() * 2),
        "kernel at {now} after {wall:?} of wall time"
    );
}

#[test]
fn disabling_releases_the_kernel() {
    let mut kernel = Kernel::new();
    let sim = kernel.handle();
    let control = Arc::new(RecordingControl::new());
    let limiter = RealtimeLimiter::new(&sim, control.clone(), "rt", Duration::from_secs(1));
    limiter.enable().unwrap();

    // The mock never blocks, so the kernel jumps to the first look past
    // the limit and holds there.
    assert_eq!(kernel.run(), RunOutcome::Starved);
    assert_eq!(kernel.now(), LogicalTime::from_ms(1_500));
    assert_eq!(control.pause_requests(), 1);
    assert_eq!(control.sources(), 1);

    limiter.disable();
    assert!(!limiter.is_enabled());
    assert_eq!(kernel.run(), RunOutcome::Starved);
    assert_eq!(control.pause_requests(), 0);
    assert_eq!(control.sources(), 0);
}

#[test]
fn dropping_an_enabled_limiter_releases_its_votes() {
    let mut kernel = Kernel::new();
    let sim = kernel.handle();
    let control = Arc::new(RecordingControl::new());
    let limiter = RealtimeLimiter::new(&sim, control.clone(), "rt", Duration::from_secs(1));
    limiter.enable().unwrap();
    assert_eq!(kernel.run(), RunOutcome::Starved);
    assert_eq!(control.pause_requests(), 1);

    drop(limiter);
    assert_eq!(control.pause_requests(), 0);
    assert_eq!(control.sources(), 0);
}
