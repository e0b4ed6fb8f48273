use std::fmt::Display;
use std::time::Instant;

/// A simple timer for logging elapsed durations.
///
/// Each call to [`Timer::log`] emits a `debug` event with the time elapsed since the previous
/// call (or since creation). The controller uses it to time blocks and flushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timer {
    last: Instant,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    /// Logs `msg` with the elapsed time since the last log and restarts the clock.
    pub fn log<T: Display>(&mut self, msg: T) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last);
        self.last = now;
        tracing::debug!(?elapsed, "{msg}");
    }
}
