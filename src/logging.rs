//! Tracing setup and a bounded log ring the host driver can drain.
//!
//! The host process of a virtual device usually has no attached terminal, so
//! lifecycle messages are also kept in memory and handed out line by line
//! through [`pop_log`]. Nothing here may be called from the real-time path.

use std::collections::VecDeque;
use std::sync::Once;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

const LOG_CAPACITY: usize = 256;

static LOG_BUFFER: Lazy<Mutex<VecDeque<String>>> =
    Lazy::new(|| Mutex::new(VecDeque::with_capacity(64)));
static TRACING_INIT: Once = Once::new();

/// Install the fmt subscriber on first call; later calls are no-ops.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}

/// Append a line, evicting the oldest once the ring is full.
pub fn push_log(line: impl Into<String>) {
    let mut guard = LOG_BUFFER.lock();
    guard.push_back(line.into());
    while guard.len() > LOG_CAPACITY {
        guard.pop_front();
    }
}

/// Take the oldest buffered line, if any.
pub fn pop_log() -> Option<String> {
    LOG_BUFFER.lock().pop_front()
}
