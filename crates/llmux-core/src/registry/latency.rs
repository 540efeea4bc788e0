//! Rolling latency window bounded by sample count and sample age.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    value_ms: u64,
}

/// Time-windowed latency samples for one provider.
///
/// Both bounds are enforced on every write, so memory stays constant no
/// matter how many calls a provider serves.
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<Sample>,
    max_samples: usize,
    ttl: Duration,
}

impl LatencyWindow {
    pub fn new(max_samples: usize, ttl: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples.min(1024)),
            max_samples,
            ttl,
        }
    }

    pub fn record(&mut self, value_ms: u64) {
        self.record_at(Instant::now(), value_ms);
    }

    /// Append a sample taken at `now`, then evict from the front while the
    /// window is over capacity or its oldest sample has expired.
    pub fn record_at(&mut self, now: Instant, value_ms: u64) {
        self.samples.push_back(Sample { at: now, value_ms });
        while let Some(oldest) = self.samples.front() {
            let expired = now.saturating_duration_since(oldest.at) > self.ttl;
            if self.samples.len() > self.max_samples || expired {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn average(&self) -> Option<f64> {
        self.average_at(Instant::now())
    }

    /// Mean of the samples still inside the TTL at `now`.
    ///
    /// Read-only: expired samples are skipped, not evicted.
    pub fn average_at(&self, now: Instant) -> Option<f64> {
        let (sum, count) = self
            .samples
            .iter()
            .filter(|s| now.saturating_duration_since(s.at) <= self.ttl)
            .fold((0u128, 0usize), |(sum, count), s| {
                (sum + u128::from(s.value_ms), count + 1)
            });
        (count > 0).then(|| sum as f64 / count as f64)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Age of the oldest retained sample.
    pub fn oldest_age_at(&self, now: Instant) -> Option<Duration> {
        self.samples
            .front()
            .map(|s| now.saturating_duration_since(s.at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn average_of_survivors() {
        let mut window = LatencyWindow::new(3, Duration::from_secs(60));
        let start = Instant::now();
        window.record_at(start, 100);
        window.record_at(start, 200);
        window.record_at(start, 300);
        window.record_at(start, 400);

        assert_eq!(window.len(), 3);
        assert_eq!(window.average_at(start), Some(300.0));
    }

    #[test]
    fn expired_samples_are_evicted_on_write() {
        let mut window = LatencyWindow::new(100, Duration::from_secs(10));
        let start = Instant::now();
        window.record_at(start, 50);
        window.record_at(start + Duration::from_secs(11), 70);

        assert_eq!(window.len(), 1);
        assert_eq!(window.average_at(start + Duration::from_secs(11)), Some(70.0));
    }

    #[test]
    fn average_skips_expired_without_a_write() {
        let mut window = LatencyWindow::new(100, Duration::from_secs(10));
        let start = Instant::now();
        window.record_at(start, 50);

        assert_eq!(window.average_at(start + Duration::from_secs(30)), None);
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn empty_window_has_no_average() {
        let window = LatencyWindow::new(10, Duration::from_secs(1));
        assert!(window.is_empty());
        assert_eq!(window.average_at(Instant::now()), None);
    }

    proptest! {
        #[test]
        fn window_respects_both_bounds(
            max_samples in 1usize..20,
            ttl_ms in 1u64..5_000,
            writes in proptest::collection::vec((0u64..2_000, 0u64..10_000), 0..200),
        ) {
            let ttl = Duration::from_millis(ttl_ms);
            let mut window = LatencyWindow::new(max_samples, ttl);
            let mut now = Instant::now();

            for (advance_ms, value) in writes {
                now += Duration::from_millis(advance_ms);
                window.record_at(now, value);

                prop_assert!(window.len() <= max_samples);
                let oldest = window.oldest_age_at(now).unwrap_or_default();
                prop_assert!(oldest <= ttl);
            }
        }
    }
}
