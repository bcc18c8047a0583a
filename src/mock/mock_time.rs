use std::sync::Mutex;
use std::time::Duration;

/// MockTime is a helper to replace the session clock for testing purposes. It
/// reports running time since the session started.
#[derive(Default)]
pub struct MockTime {
    cur_now: Mutex<Duration>,
}

impl MockTime {
    /// set_now sets the current time.
    pub fn set_now(&self, now: Duration) {
        if let Ok(mut cur_now) = self.cur_now.lock() {
            *cur_now = now;
        }
    }

    /// now returns the current time.
    pub fn now(&self) -> Duration {
        self.cur_now.lock().map(|n| *n).unwrap_or_default()
    }

    /// advance advances duration d
    pub fn advance(&self, d: Duration) {
        if let Ok(mut cur_now) = self.cur_now.lock() {
            *cur_now = cur_now.checked_add(d).unwrap_or(*cur_now);
        }
    }
}
