//! Fixed-window counter state.

use std::time::{Duration, Instant};

/// Result of counting one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterHit {
    /// Count for the current window, including this request
    pub count: u64,
    /// Time left until the window resets
    pub reset_after: Duration,
}

/// Count of requests for one key within the current window.
///
/// This is a fixed-window counter: the count drops back to zero at window
/// boundaries instead of sliding, so a client can burst up to twice the
/// budget across a boundary.
#[derive(Debug, Clone)]
pub struct CounterEntry {
    /// When the current window started
    window_start: Instant,
    /// Requests seen in the current window
    count: u64,
    /// Length of the window this entry was last counted under
    window: Duration,
}

impl CounterEntry {
    /// Create an empty entry whose window starts at `now`.
    pub fn new(now: Instant, window: Duration) -> Self {
        Self {
            window_start: now,
            count: 0,
            window,
        }
    }

    /// Count one request at `now`, starting a new window if the last one
    /// has elapsed.
    pub fn hit(&mut self, now: Instant, window: Duration) -> CounterHit {
        self.window = window;
        if self.is_expired(now) {
            self.window_start = now;
            self.count = 0;
        }

        self.count += 1;

        CounterHit {
            count: self.count,
            reset_after: self.reset_after(now),
        }
    }

    /// Get the current count.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Whether the window this entry belongs to has closed.
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) >= self.window
    }

    /// Get the duration until the current window resets.
    pub fn reset_after(&self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.window_start);
        self.window.saturating_sub(elapsed)
    }
}
