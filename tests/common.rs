#![allow(dead_code)]

use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        // a subscriber installed elsewhere wins
        let _ = sedaq::logging::try_init_logging("warn");
    });
}

/// Polls `done` every few milliseconds until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}
