//! Bounded retries with jittered exponential backoff, gated by the circuit breaker.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::breaker::{CircuitBreakers, Outcome};
use super::limiter::RateLimiters;
use crate::error::CallError;
use crate::idempotency::IdempotencyKey;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub attempt_timeout_ms: u64,
    /// When false an attempt timeout ends the call instead of retrying. Used for
    /// mutating integrations that cannot deduplicate on their side.
    pub retry_timeouts: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
            attempt_timeout_ms: 30_000,
            retry_timeouts: true,
        }
    }
}

impl RetryPolicy {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Backoff before retry `retry` (0-based): `min(base * 2^retry, max) * U(0.5, 1.5)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        let capped = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(capped as f64 / 1000.0 * jitter)
    }
}

/// Successful call plus the number of attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// An attempt the breaker let through. Dropped unsettled (cancelled, or the whole
/// call future dropped mid-attempt) it hands back any HalfOpen trial slot.
struct Admitted<'a> {
    breakers: &'a CircuitBreakers,
    target: &'a str,
    settled: bool,
}

impl Drop for Admitted<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breakers.abandon(self.target);
        }
    }
}

/// Runs calls against a named target under a [`RetryPolicy`].
#[derive(Clone)]
pub struct RetryExecutor {
    breakers: Arc<CircuitBreakers>,
    limits: Option<Arc<RateLimiters>>,
}

impl RetryExecutor {
    pub fn new(breakers: Arc<CircuitBreakers>) -> Self {
        Self {
            breakers,
            limits: None,
        }
    }

    /// Consults `limits` before every attempt.
    pub fn with_limits(mut self, limits: Arc<RateLimiters>) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }

    /// Executes `call` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `call` receives the 1-based attempt number and the idempotency key; the key is
    /// the same on every attempt. A breaker denial returns `BreakerOpen` and a spent
    /// rate limit returns `RateLimited`, neither spending an attempt.
    pub async fn execute<T, F, Fut>(
        &self,
        target: &str,
        key: &IdempotencyKey,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<Attempted<T>, CallError>
    where
        F: FnMut(u32, IdempotencyKey) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(CallError::Cancelled);
            }
            if !self.breakers.allow(target) {
                return Err(CallError::BreakerOpen {
                    target: target.to_string(),
                });
            }
            if let Some(limits) = &self.limits {
                if let Err(retry_after) = limits.try_acquire(target) {
                    self.breakers.abandon(target);
                    return Err(CallError::RateLimited {
                        target: target.to_string(),
                        retry_after,
                    });
                }
            }

            attempt += 1;
            let mut admitted = Admitted {
                breakers: &self.breakers,
                target,
                settled: false,
            };
            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(target: "switchyard::retry", %target, attempt, "attempt cancelled");
                    return Err(CallError::Cancelled);
                }
                r = tokio::time::timeout(policy.attempt_timeout(), call(attempt, key.clone())) => {
                    r.unwrap_or_else(|_| Err(CallError::Timeout(policy.attempt_timeout())))
                }
            };
            let latency = started.elapsed();

            let error = match result {
                Ok(value) => {
                    admitted.settled = true;
                    self.breakers.record_outcome(target, Outcome::Success, latency);
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                    });
                }
                Err(CallError::Cancelled) => return Err(CallError::Cancelled),
                Err(e) => e,
            };
            admitted.settled = true;

            if error.is_transient() {
                self.breakers
                    .record_outcome(target, Outcome::TransientFailure, latency);
            } else {
                self.breakers
                    .record_outcome(target, Outcome::PermanentFailure, latency);
                tracing::debug!(target: "switchyard::retry", %target, attempt, %error, "permanent failure");
                return Err(error);
            }

            if matches!(error, CallError::Timeout(_)) && !policy.retry_timeouts {
                tracing::warn!(target: "switchyard::retry", %target, attempt, "attempt timed out; not retrying");
                return Err(error);
            }

            if attempt >= max_attempts {
                tracing::warn!(
                    target: "switchyard::retry",
                    %target,
                    attempts = attempt,
                    %error,
                    "retries exhausted"
                );
                return Err(CallError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }

            let delay = policy.delay_for(attempt - 1);
            tracing::debug!(
                target: "switchyard::retry",
                %target,
                attempt,
                delay_ms = delay.as_millis() as u64,
                %error,
                "transient failure, backing off"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CallError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::tracing_sink;
    use crate::resilience::{BreakerConfig, CircuitState};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
            max_delay_ms: 5,
            attempt_timeout_ms: 200,
            retry_timeouts: true,
        }
    }

    fn executor() -> RetryExecutor {
        let config = BreakerConfig {
            min_calls: 100,
            ..BreakerConfig::default()
        };
        RetryExecutor::new(CircuitBreakers::shared(config, tracing_sink()))
    }

    #[tokio::test]
    async fn always_transient_call_is_attempted_exactly_max_attempts_times() {
        let exec = executor();
        let calls = AtomicU32::new(0);
        let err = exec
            .execute(
                "flaky",
                &IdempotencyKey::from_raw("k"),
                &fast_policy(3),
                &CancellationToken::new(),
                |_, _| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(CallError::transient("503")) }
                },
            )
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            CallError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert_eq!(*last, CallError::transient("503"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let exec = executor();
        let calls = AtomicU32::new(0);
        let err = exec
            .execute(
                "auth",
                &IdempotencyKey::from_raw("k"),
                &fast_policy(3),
                &CancellationToken::new(),
                |_, _| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(CallError::permanent("401")) }
                },
            )
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err, CallError::permanent("401"));
    }

    #[tokio::test]
    async fn every_attempt_sees_the_same_key_and_success_reports_attempts() {
        let exec = executor();
        let seen = Mutex::new(Vec::new());
        let out = exec
            .execute(
                "orders",
                &IdempotencyKey::from_raw("abc"),
                &fast_policy(3),
                &CancellationToken::new(),
                |attempt, key| {
                    seen.lock().unwrap().push(key);
                    async move {
                        if attempt < 3 {
                            Err(CallError::transient("reset"))
                        } else {
                            Ok("done")
                        }
                    }
                },
            )
            .await
            .unwrap();
        assert_eq!(out.value, "done");
        assert_eq!(out.attempts, 3);
        let seen = seen.into_inner().unwrap();
        assert!(seen.iter().all(|k| k.as_str() == "abc"));
    }

    #[tokio::test]
    async fn open_breaker_fails_fast_without_calling() {
        let breakers = CircuitBreakers::shared(BreakerConfig::default(), tracing_sink());
        for _ in 0..5 {
            breakers.record_outcome("down", Outcome::TransientFailure, Duration::ZERO);
        }
        assert_eq!(breakers.state("down"), CircuitState::Open);
        let exec = RetryExecutor::new(breakers);
        let calls = AtomicU32::new(0);
        let err = exec
            .execute(
                "down",
                &IdempotencyKey::from_raw("k"),
                &fast_policy(3),
                &CancellationToken::new(),
                |_, _| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, CallError>(()) }
                },
            )
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(err, CallError::BreakerOpen { .. }));
    }

    #[tokio::test]
    async fn slow_attempts_time_out() {
        let exec = executor();
        let mut policy = fast_policy(2);
        policy.attempt_timeout_ms = 20;
        let err = exec
            .execute(
                "slow",
                &IdempotencyKey::from_raw("k"),
                &policy,
                &CancellationToken::new(),
                |_, _| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, CallError>(())
                },
            )
            .await
            .unwrap_err();
        match err {
            CallError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, CallError::Timeout(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_without_retry_returns_immediately() {
        let exec = executor();
        let mut policy = fast_policy(3);
        policy.attempt_timeout_ms = 20;
        policy.retry_timeouts = false;
        let calls = AtomicU32::new(0);
        let err = exec
            .execute(
                "mutating",
                &IdempotencyKey::from_raw("k"),
                &policy,
                &CancellationToken::new(),
                |_, _| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok::<_, CallError>(())
                    }
                },
            )
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, CallError::Timeout(_)));
    }

    #[tokio::test]
    async fn cancellation_interrupts_in_flight_attempt() {
        let exec = executor();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = exec
            .execute(
                "slow",
                &IdempotencyKey::from_raw("k"),
                &RetryPolicy::default(),
                &cancel,
                |_, _| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, CallError>(())
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, CallError::Cancelled);
    }

    #[tokio::test]
    async fn spent_rate_limit_fails_fast_without_calling() {
        use crate::resilience::{RateLimit, RateLimitConfig, RateLimiters};

        let limits = RateLimiters::shared(RateLimitConfig {
            default: RateLimit {
                max_calls: 1,
                window_ms: 60_000,
                burst: None,
            },
            ..RateLimitConfig::default()
        });
        let exec = executor().with_limits(limits);
        let key = IdempotencyKey::from_raw("k");
        let policy = fast_policy(3);
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        // The first attempt takes the only token; the retry and the next call find the
        // bucket empty.
        for _ in 0..2 {
            let err = exec
                .execute("quota", &key, &policy, &cancel, |_, _| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(CallError::transient("503")) }
                })
                .await
                .unwrap_err();
            assert!(matches!(err, CallError::RateLimited { .. }), "{err:?}");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_trial_attempt_hands_back_its_slot() {
        let config = BreakerConfig {
            min_calls: 1,
            cooldown_ms: 10,
            ..BreakerConfig::default()
        };
        let breakers = CircuitBreakers::shared(config, tracing_sink());
        breakers.record_outcome("svc", Outcome::TransientFailure, Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let exec = RetryExecutor::new(breakers.clone());

        let key = IdempotencyKey::from_raw("k");
        let policy = RetryPolicy::default();
        let cancel = CancellationToken::new();
        let call = exec.execute(
            "svc",
            &key,
            &policy,
            &cancel,
            |_, _| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, CallError>(())
            },
        );
        assert!(tokio::time::timeout(Duration::from_millis(20), call).await.is_err());
        assert_eq!(breakers.state("svc"), CircuitState::HalfOpen);
        assert!(breakers.allow("svc"));
    }

    #[test]
    fn delay_is_capped_and_jittered() {
        let policy = RetryPolicy {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let d0 = policy.delay_for(0).as_millis();
            assert!((49..=150).contains(&d0), "{d0}");
            let d10 = policy.delay_for(10).as_millis();
            assert!((499..=1_500).contains(&d10), "{d10}");
        }
        assert!(policy.delay_for(80) <= Duration::from_millis(1_500));
    }
}
