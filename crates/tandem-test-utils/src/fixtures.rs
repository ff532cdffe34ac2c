//! Reusable kernel workloads.

use std::sync::{Arc, Mutex};

use tandem_core::LogicalTime;
use tandem_kernel::Sim;

/// Times at which a ticker fired, shared with the test.
pub type TickerLog = Arc<Mutex<Vec<LogicalTime>>>;

/// Spawn a method that fires every `period` until `until` (inclusive),
/// recording each firing time. Gives a kernel real pending activity so
/// time can advance.
///
/// Must be called on the kernel thread.
pub fn spawn_ticker(sim: &Sim, name: &str, period: LogicalTime, until: LogicalTime) -> TickerLog {
    assert!(!period.is_zero(), "ticker period must be non-zero");
    let ev = sim.create_event(format!("{name}.tick"));
    let log: TickerLog = Arc::default();
    let out = Arc::clone(&log);
    sim.spawn_method(name.to_owned(), &[ev], move |sim| {
        out.lock().unwrap().push(sim.now());
        if sim.now() + period <= until {
            sim.notify(ev, period);
        }
    });
    sim.notify(ev, period);
    log
}
