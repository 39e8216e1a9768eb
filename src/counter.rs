//! Rolling throughput counters.
//!
//! Both peer sessions and torrents need an up-to-date "bytes per second"
//! figure: peer sessions use it to size their request queue (the
//! bandwidth-delay product), and the session manager uses the aggregate to
//! drive bandwidth allocation (`queue::bandwidth`). A plain total divided
//! by elapsed time would be dominated by history; instead we keep a short
//! window of per-second buckets and report the average over that window.

use std::time::{Duration, Instant};

/// The number of one-second buckets kept in the rolling window.
const WINDOW_SECS: usize = 5;

/// Tracks a byte count over a short rolling time window, exposing an
/// average throughput rather than a lifetime total.
#[derive(Debug, Clone)]
pub(crate) struct ThroughputCounter {
    /// Ring buffer of per-second byte counts. `buckets[cursor]` is the
    /// current (not yet fully elapsed) second.
    buckets: [u64; WINDOW_SECS],
    cursor: usize,
    /// When the current bucket started.
    bucket_start: Instant,
    /// Lifetime total, independent of the rolling window.
    total: u64,
}

impl ThroughputCounter {
    pub fn new() -> Self {
        Self {
            buckets: [0; WINDOW_SECS],
            cursor: 0,
            bucket_start: Instant::now(),
            total: 0,
        }
    }

    /// Records `n` bytes transferred at the current instant.
    pub fn update(&mut self, n: u64) {
        self.advance();
        self.buckets[self.cursor] += n;
        self.total += n;
    }

    /// Returns the average bytes/sec over the rolling window.
    pub fn rate(&mut self) -> u64 {
        self.advance();
        let sum: u64 = self.buckets.iter().sum();
        sum / WINDOW_SECS as u64
    }

    /// The lifetime total byte count, unaffected by the rolling window.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Rotates buckets for however many whole seconds have elapsed since
    /// the last update, zeroing the ones that scrolled out of the window.
    fn advance(&mut self) {
        let elapsed = self.bucket_start.elapsed();
        let elapsed_secs = elapsed.as_secs() as usize;
        if elapsed_secs == 0 {
            return;
        }
        let steps = elapsed_secs.min(WINDOW_SECS);
        for _ in 0..steps {
            self.cursor = (self.cursor + 1) % WINDOW_SECS;
            self.buckets[self.cursor] = 0;
        }
        self.bucket_start += Duration::from_secs(elapsed_secs as u64);
    }
}

impl Default for ThroughputCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_within_the_same_second() {
        let mut counter = ThroughputCounter::new();
        counter.update(100);
        counter.update(50);
        assert_eq!(counter.total(), 150);
    }

    #[test]
    fn rate_is_zero_on_a_fresh_counter() {
        let mut counter = ThroughputCounter::new();
        assert_eq!(counter.rate(), 0);
    }
}
