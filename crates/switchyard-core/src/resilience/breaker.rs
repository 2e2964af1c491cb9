//! Per-target circuit breakers.
//!
//! ```text
//! Closed   -> Open      transient failure rate over the window reaches the threshold
//! Open     -> HalfOpen  cooldown elapsed (checked lazily by `allow`)
//! HalfOpen -> Closed    trial call succeeds
//! HalfOpen -> Open      trial call fails transiently
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::events::{CoreEvent, SharedSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Classified result of one call against a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Timeout, connection failure, 5xx-equivalent. Counts toward the threshold.
    TransientFailure,
    /// Validation or auth failure. The target answered, so it does not count.
    PermanentFailure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Fraction of transient failures in the window that opens the breaker.
    pub failure_rate_threshold: f64,
    /// Minimum number of recorded outcomes before the rate is evaluated.
    pub min_calls: u32,
    /// Sliding window length.
    pub window_ms: u64,
    /// Time spent Open before a trial call is admitted.
    pub cooldown_ms: u64,
    /// Trial calls admitted while HalfOpen.
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            min_calls: 5,
            window_ms: 60_000,
            cooldown_ms: 30_000,
            half_open_max_calls: 1,
        }
    }
}

impl BreakerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    failed: bool,
    latency: Duration,
}

#[derive(Debug)]
struct BreakerState {
    config: BreakerConfig,
    state: CircuitState,
    window: VecDeque<Sample>,
    opened_at: Option<Instant>,
    trials_in_flight: u32,
}

impl BreakerState {
    fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            window: VecDeque::new(),
            opened_at: None,
            trials_in_flight: 0,
        }
    }

    fn prune(&mut self, now: Instant) {
        let window = self.config.window();
        while let Some(front) = self.window.front() {
            if now.duration_since(front.at) > window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failed = self.window.iter().filter(|s| s.failed).count();
        failed as f64 / self.window.len() as f64
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.trials_in_flight = 0;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.trials_in_flight = 0;
        self.window.clear();
    }

    /// Returns `(allowed, transition)`.
    fn allow(&mut self, now: Instant) -> (bool, Option<(CircuitState, CircuitState)>) {
        match self.state {
            CircuitState::Closed => (true, None),
            CircuitState::Open => {
                let cooled = self
                    .opened_at
                    .map(|t| now.duration_since(t) >= self.config.cooldown())
                    .unwrap_or(true);
                if !cooled {
                    return (false, None);
                }
                self.state = CircuitState::HalfOpen;
                self.trials_in_flight = 1;
                (true, Some((CircuitState::Open, CircuitState::HalfOpen)))
            }
            CircuitState::HalfOpen => {
                if self.trials_in_flight < self.config.half_open_max_calls.max(1) {
                    self.trials_in_flight += 1;
                    (true, None)
                } else {
                    (false, None)
                }
            }
        }
    }

    fn record(
        &mut self,
        outcome: Outcome,
        latency: Duration,
        now: Instant,
    ) -> Option<(CircuitState, CircuitState)> {
        match self.state {
            CircuitState::Closed => {
                if outcome == Outcome::PermanentFailure {
                    return None;
                }
                self.window.push_back(Sample {
                    at: now,
                    failed: outcome == Outcome::TransientFailure,
                    latency,
                });
                self.prune(now);
                let enough = self.window.len() as u32 >= self.config.min_calls.max(1);
                if enough && self.failure_rate() >= self.config.failure_rate_threshold {
                    self.open(now);
                    return Some((CircuitState::Closed, CircuitState::Open));
                }
                None
            }
            CircuitState::HalfOpen => match outcome {
                Outcome::TransientFailure => {
                    self.open(now);
                    Some((CircuitState::HalfOpen, CircuitState::Open))
                }
                Outcome::Success | Outcome::PermanentFailure => {
                    self.close();
                    self.window.push_back(Sample {
                        at: now,
                        failed: false,
                        latency,
                    });
                    Some((CircuitState::HalfOpen, CircuitState::Closed))
                }
            },
            // Late results from calls admitted before the breaker opened.
            CircuitState::Open => None,
        }
    }

    fn snapshot(&self, target: &str) -> BreakerSnapshot {
        let calls = self.window.len() as u32;
        let failures = self.window.iter().filter(|s| s.failed).count() as u32;
        let mean_latency_ms = if calls == 0 {
            0
        } else {
            let total: Duration = self.window.iter().map(|s| s.latency).sum();
            (total.as_millis() / calls as u128) as u64
        };
        BreakerSnapshot {
            target: target.to_string(),
            state: self.state,
            window_calls: calls,
            window_failures: failures,
            mean_latency_ms,
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub target: String,
    pub state: CircuitState,
    pub window_calls: u32,
    pub window_failures: u32,
    pub mean_latency_ms: u64,
}

/// Registry of breakers, one per call target, shared across every session.
pub struct CircuitBreakers {
    default_config: BreakerConfig,
    overrides: DashMap<String, BreakerConfig>,
    breakers: DashMap<String, BreakerState>,
    events: SharedSink,
}

impl CircuitBreakers {
    pub fn new(default_config: BreakerConfig, events: SharedSink) -> Self {
        Self {
            default_config,
            overrides: DashMap::new(),
            breakers: DashMap::new(),
            events,
        }
    }

    pub fn shared(default_config: BreakerConfig, events: SharedSink) -> Arc<Self> {
        Arc::new(Self::new(default_config, events))
    }

    /// Uses a dedicated configuration for `target`. Resets any existing state.
    pub fn configure(&self, target: &str, config: BreakerConfig) {
        self.overrides.insert(target.to_string(), config.clone());
        self.breakers
            .insert(target.to_string(), BreakerState::new(config));
    }

    fn config_for(&self, target: &str) -> BreakerConfig {
        self.overrides
            .get(target)
            .map(|c| c.clone())
            .unwrap_or_else(|| self.default_config.clone())
    }

    /// Whether a call to `target` may be attempted now. In HalfOpen this reserves a
    /// trial slot, released by `record_outcome` or `abandon`.
    pub fn allow(&self, target: &str) -> bool {
        let now = Instant::now();
        let (allowed, transition) = {
            let mut entry = self
                .breakers
                .entry(target.to_string())
                .or_insert_with(|| BreakerState::new(self.config_for(target)));
            entry.allow(now)
        };
        if let Some((from, to)) = transition {
            self.transitioned(target, from, to);
        }
        if !allowed {
            tracing::debug!(target: "switchyard::breaker", %target, "call rejected: breaker open");
        }
        allowed
    }

    pub fn record_outcome(&self, target: &str, outcome: Outcome, latency: Duration) {
        let now = Instant::now();
        let transition = {
            let mut entry = self
                .breakers
                .entry(target.to_string())
                .or_insert_with(|| BreakerState::new(self.config_for(target)));
            entry.record(outcome, latency, now)
        };
        if let Some((from, to)) = transition {
            self.transitioned(target, from, to);
        }
    }

    /// Releases a HalfOpen trial slot whose call never completed (cancelled).
    pub fn abandon(&self, target: &str) {
        if let Some(mut entry) = self.breakers.get_mut(target) {
            if entry.state == CircuitState::HalfOpen && entry.trials_in_flight > 0 {
                entry.trials_in_flight -= 1;
            }
        }
    }

    pub fn state(&self, target: &str) -> CircuitState {
        self.breakers
            .get(target)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn reset(&self, target: &str) {
        let config = self.config_for(target);
        if let Some(previous) = self
            .breakers
            .insert(target.to_string(), BreakerState::new(config))
        {
            if previous.state != CircuitState::Closed {
                self.transitioned(target, previous.state, CircuitState::Closed);
            }
        }
    }

    pub fn open_targets(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .breakers
            .iter()
            .filter(|b| b.state == CircuitState::Open)
            .map(|b| b.key().clone())
            .collect();
        open.sort();
        open
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut out: Vec<BreakerSnapshot> = self
            .breakers
            .iter()
            .map(|b| b.snapshot(b.key()))
            .collect();
        out.sort_by(|a, b| a.target.cmp(&b.target));
        out
    }

    fn transitioned(&self, target: &str, from: CircuitState, to: CircuitState) {
        tracing::info!(
            target: "switchyard::breaker",
            %target,
            ?from,
            ?to,
            "circuit state changed"
        );
        self.events.emit(CoreEvent::CircuitTransition {
            target: target.to_string(),
            from,
            to,
        });
    }
}
