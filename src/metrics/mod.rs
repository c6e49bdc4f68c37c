use std::sync::atomic::{AtomicU64, Ordering};

// Global counters (low overhead). These are coarse-grained and process-wide.
static ENQUEUED: AtomicU64 = AtomicU64::new(0);
static REJECTED: AtomicU64 = AtomicU64::new(0);
static DEQUEUED: AtomicU64 = AtomicU64::new(0);
static COMMANDS_EXECUTED: AtomicU64 = AtomicU64::new(0);
static COMMAND_FAILURES: AtomicU64 = AtomicU64::new(0);
static SIGNALS_DISPATCHED: AtomicU64 = AtomicU64::new(0);
static DELAYED_EXECUTED: AtomicU64 = AtomicU64::new(0);
static WORKERS_SPAWNED: AtomicU64 = AtomicU64::new(0);
static WORKERS_RETIRED: AtomicU64 = AtomicU64::new(0);

#[inline]
pub fn inc_enqueued(n: u64) {
    ENQUEUED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_rejected(n: u64) {
    REJECTED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_dequeued(n: u64) {
    DEQUEUED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_commands_executed(n: u64) {
    COMMANDS_EXECUTED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_command_failures(n: u64) {
    COMMAND_FAILURES.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_signals_dispatched(n: u64) {
    SIGNALS_DISPATCHED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_delayed_executed(n: u64) {
    DELAYED_EXECUTED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_workers_spawned(n: u64) {
    WORKERS_SPAWNED.fetch_add(n, Ordering::Relaxed);
}
#[inline]
pub fn inc_workers_retired(n: u64) {
    WORKERS_RETIRED.fetch_add(n, Ordering::Relaxed);
}

pub fn commands_executed() -> u64 {
    COMMANDS_EXECUTED.load(Ordering::Relaxed)
}

pub fn command_failures() -> u64 {
    COMMAND_FAILURES.load(Ordering::Relaxed)
}

pub fn snapshot() -> String {
    // Simple text format (Prometheus-style without HELP/TYPE lines for brevity)
    format!(
        "sedaq_enqueued {}\nsedaq_rejected {}\nsedaq_dequeued {}\nsedaq_commands_executed {}\nsedaq_command_failures {}\nsedaq_signals_dispatched {}\nsedaq_delayed_executed {}\nsedaq_workers_spawned {}\nsedaq_workers_retired {}\n",
        ENQUEUED.load(Ordering::Relaxed),
        REJECTED.load(Ordering::Relaxed),
        DEQUEUED.load(Ordering::Relaxed),
        COMMANDS_EXECUTED.load(Ordering::Relaxed),
        COMMAND_FAILURES.load(Ordering::Relaxed),
        SIGNALS_DISPATCHED.load(Ordering::Relaxed),
        DELAYED_EXECUTED.load(Ordering::Relaxed),
        WORKERS_SPAWNED.load(Ordering::Relaxed),
        WORKERS_RETIRED.load(Ordering::Relaxed),
    )
}
