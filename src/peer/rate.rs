use std::time::{Duration, Instant};

use crate::constants::RATE_WINDOW;

/// Exponentially weighted byte-rate estimate.
///
/// Bytes are recorded as they arrive and folded into the average on each
/// [`sample`](RateEstimator::sample) call; with the default window the
/// estimate reacts over roughly twenty seconds.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    window: Duration,
    pending: u64,
    last_sample: Instant,
    rate: f64,
}

impl RateEstimator {
    pub fn new() -> Self {
        Self::with_window(RATE_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            pending: 0,
            last_sample: Instant::now(),
            rate: 0.0,
        }
    }

    /// Counts transferred bytes toward the next sample.
    pub fn record(&mut self, bytes: usize) {
        self.pending += bytes as u64;
    }

    /// Folds pending bytes into the average and returns the current rate
    /// in bytes per second.
    pub fn sample(&mut self, now: Instant) -> f64 {
        let dt = now.duration_since(self.last_sample).as_secs_f64();
        if dt <= 0.0 {
            return self.rate;
        }
        let instantaneous = self.pending as f64 / dt;
        let alpha = (dt / self.window.as_secs_f64()).min(1.0);
        self.rate += alpha * (instantaneous - self.rate);
        self.pending = 0;
        self.last_sample = now;
        self.rate
    }

    /// Last computed rate without resampling.
    pub fn rate(&self) -> f64 {
        self.rate
    }
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_converges_toward_throughput() {
        let mut est = RateEstimator::with_window(Duration::from_secs(20));
        let start = Instant::now();
        // 16KB per second for forty simulated seconds.
        for s in 1..=40u64 {
            est.record(16384);
            est.sample(start + Duration::from_secs(s));
        }
        let rate = est.rate();
        assert!(
            (10_000.0..20_000.0).contains(&rate),
            "rate {} outside expected band",
            rate
        );
    }

    #[test]
    fn test_idle_decays() {
        let mut est = RateEstimator::with_window(Duration::from_secs(20));
        let start = Instant::now();
        est.record(1_000_000);
        est.sample(start + Duration::from_secs(1));
        let busy = est.rate();

        // A long quiet stretch pulls the average down.
        est.sample(start + Duration::from_secs(60));
        assert!(est.rate() < busy / 2.0);
    }
}
