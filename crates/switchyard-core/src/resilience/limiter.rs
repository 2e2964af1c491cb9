//! Per-target token buckets that keep calls to each tool or provider under its quota.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Quota for one target: `max_calls` per `window_ms`, with bursts up to `burst`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimit {
    pub max_calls: u32,
    pub window_ms: u64,
    /// Bucket capacity. Defaults to `max_calls`.
    pub burst: Option<u32>,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            max_calls: 100,
            window_ms: 60_000,
            burst: None,
        }
    }
}

impl RateLimit {
    fn capacity(&self) -> f64 {
        self.burst.unwrap_or(self.max_calls).max(1) as f64
    }

    /// Tokens added per second.
    fn refill_rate(&self) -> f64 {
        let window = Duration::from_millis(self.window_ms.max(1)).as_secs_f64();
        self.max_calls as f64 / window
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub default: RateLimit,
    /// Overrides keyed by tool name or provider id.
    pub targets: HashMap<String, RateLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default: RateLimit::default(),
            targets: HashMap::new(),
        }
    }
}

#[derive(Debug)]
struct TokenBucket {
    limit: RateLimit,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(limit: RateLimit, now: Instant) -> Self {
        Self {
            tokens: limit.capacity(),
            limit,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.limit.refill_rate()).min(self.limit.capacity());
        self.last_refill = now;
    }

    /// Takes one token, or returns how long until one is available.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        let rate = self.limit.refill_rate();
        if rate <= 0.0 {
            return Err(Duration::from_millis(self.limit.window_ms));
        }
        Err(Duration::from_secs_f64((1.0 - self.tokens) / rate))
    }
}

/// Registry of token buckets, one per call target, shared across every session.
pub struct RateLimiters {
    config: RateLimitConfig,
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimiters {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    pub fn shared(config: RateLimitConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    fn limit_for(&self, target: &str) -> RateLimit {
        self.config
            .targets
            .get(target)
            .cloned()
            .unwrap_or_else(|| self.config.default.clone())
    }

    /// Admits one call to `target`, or returns the wait before the next token.
    pub fn try_acquire(&self, target: &str) -> Result<(), Duration> {
        if !self.config.enabled {
            return Ok(());
        }
        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry(target.to_string())
            .or_insert_with(|| TokenBucket::new(self.limit_for(target), now));
        let taken = bucket.try_take(now);
        if let Err(wait) = taken {
            tracing::debug!(target: "switchyard::limiter", %target, wait_ms = wait.as_millis() as u64, "call rate limited");
        }
        taken
    }

    /// Whole tokens left for `target`; `None` when limiting is off.
    pub fn remaining(&self, target: &str) -> Option<u32> {
        if !self.config.enabled {
            return None;
        }
        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry(target.to_string())
            .or_insert_with(|| TokenBucket::new(self.limit_for(target), now));
        bucket.refill(now);
        Some(bucket.tokens as u32)
    }
}
