//! Per-connection inbound rate limiting.

use std::time::{Duration, Instant};

/// Sliding-window counter; one per connection, no shared state. A frame
/// over the limit is a protocol violation and the caller disconnects.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    count: u32,
    window_start: Instant,
}

impl RateLimiter {
    #[must_use]
    pub fn per_second(limit: u32) -> Self {
        Self {
            limit,
            window: Duration::from_secs(1),
            count: 0,
            window_start: Instant::now(),
        }
    }

    /// Record one inbound frame; `false` means over the limit.
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&mut self, now: Instant) -> bool {
        if now.duration_since(self.window_start) >= self.window {
            self.count = 0;
            self.window_start = now;
        }
        self.count += 1;
        self.count <= self.limit
    }
}
