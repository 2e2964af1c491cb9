//! Lock-free per-provider health counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Weight of the newest observation in the failure score.
const EWMA_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSample {
    Success,
    Failure,
    Violation,
}

/// Shared across every session calling the provider; updates never take a lock.
#[derive(Debug, Default)]
pub struct ProviderHealth {
    successes: AtomicU64,
    failures: AtomicU64,
    violations: AtomicU64,
    latency_total_ms: AtomicU64,
    /// f64 bits of the exponentially weighted failure score in [0, 1].
    failure_score: AtomicU64,
}

impl ProviderHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, sample: HealthSample, latency: Duration) {
        let counter = match sample {
            HealthSample::Success => &self.successes,
            HealthSample::Failure => &self.failures,
            HealthSample::Violation => &self.violations,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.latency_total_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);

        let observed = if sample == HealthSample::Success { 0.0 } else { 1.0 };
        self.failure_score
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
                let current = f64::from_bits(bits);
                let next = EWMA_ALPHA * observed + (1.0 - EWMA_ALPHA) * current;
                Some(next.to_bits())
            })
            .ok();
    }

    pub fn samples(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
            + self.failures.load(Ordering::Relaxed)
            + self.violations.load(Ordering::Relaxed)
    }

    pub fn failure_score(&self) -> f64 {
        f64::from_bits(self.failure_score.load(Ordering::Acquire))
    }

    pub fn snapshot(&self, provider: &str) -> HealthSnapshot {
        let samples = self.samples();
        let latency = self.latency_total_ms.load(Ordering::Relaxed);
        HealthSnapshot {
            provider: provider.to_string(),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            violations: self.violations.load(Ordering::Relaxed),
            mean_latency_ms: if samples == 0 { 0 } else { latency / samples },
            failure_score: self.failure_score(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub provider: String,
    pub successes: u64,
    pub failures: u64,
    pub violations: u64,
    pub mean_latency_ms: u64,
    pub failure_score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn score_rises_with_failures_and_decays_with_success() {
        let h = ProviderHealth::new();
        for _ in 0..5 {
            h.record(HealthSample::Violation, Duration::from_millis(10));
        }
        let high = h.failure_score();
        assert!(high > 0.8, "{high}");
        for _ in 0..10 {
            h.record(HealthSample::Success, Duration::from_millis(10));
        }
        assert!(h.failure_score() < 0.05);
        let snap = h.snapshot("p1");
        assert_eq!(snap.violations, 5);
        assert_eq!(snap.successes, 10);
        assert_eq!(snap.mean_latency_ms, 10);
    }

    #[tokio::test]
    async fn concurrent_updates_are_not_lost() {
        let h = Arc::new(ProviderHealth::new());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let h = h.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..250 {
                    h.record(HealthSample::Failure, Duration::ZERO);
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(h.samples(), 2_000);
        assert!(h.failure_score() <= 1.0);
    }
}
