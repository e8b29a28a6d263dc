//! A small exponentially-weighted moving average throughput counter.
//!
//! Used by [`crate::peer`] to track per-session download/upload rates
//! (§3 "byte-rate meters (EWMA download/upload)", §4.4 "Rate metering").
//! The EWMA window isn't specified by the wire protocol (§9 open question);
//! we use [`crate::RATE_EWMA_SECS`] seconds, which keeps the estimate
//! responsive to bursts without being so jumpy that choke decisions thrash.

use crate::RATE_EWMA_SECS;

/// Tracks the number of bytes transferred in the current one-second window
/// and an EWMA of the per-second rate across windows.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ThroughputCounter {
    /// Bytes accounted for in the window that is currently being filled.
    current_window_bytes: u64,
    /// The total number of bytes ever recorded, for diagnostics.
    total_bytes: u64,
    /// The current smoothed rate estimate, in bytes/second.
    rate: f64,
}

impl ThroughputCounter {
    /// Records `bytes` transferred just now.
    pub fn update(&mut self, bytes: u64) {
        self.current_window_bytes += bytes;
        self.total_bytes += bytes;
    }

    /// Folds the current window into the running average and starts a new
    /// window. Should be called once per second (driven by the torrent's
    /// periodic tick).
    pub fn tick(&mut self) {
        let alpha = 2.0 / (RATE_EWMA_SECS + 1.0);
        let sample = self.current_window_bytes as f64;
        self.rate = alpha * sample + (1.0 - alpha) * self.rate;
        self.current_window_bytes = 0;
    }

    /// Returns the current smoothed rate, in bytes/second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Returns the total number of bytes ever recorded.
    pub fn total(&self) -> u64 {
        self.total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_converges_to_steady_input() {
        let mut counter = ThroughputCounter::default();
        // feed a steady 100 bytes/s for a while; the EWMA should approach
        // (but, being an average, not necessarily reach) 100.
        for _ in 0..100 {
            counter.update(100);
            counter.tick();
        }
        assert!(counter.rate() > 90.0);
        assert!(counter.rate() <= 100.0);
    }

    #[test]
    fn test_total_is_exact() {
        let mut counter = ThroughputCounter::default();
        counter.update(10);
        counter.update(20);
        counter.tick();
        counter.update(5);
        assert_eq!(counter.total(), 35);
    }

    #[test]
    fn test_idle_window_decays_rate() {
        let mut counter = ThroughputCounter::default();
        counter.update(1000);
        counter.tick();
        let after_burst = counter.rate();
        counter.tick();
        assert!(counter.rate() < after_burst);
    }
}
