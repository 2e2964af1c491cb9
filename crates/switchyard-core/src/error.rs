//! Error taxonomy shared by every layer of the core.

use std::time::Duration;

use crate::providers::ProviderFailure;

/// Failure of a single call to an external target (tool, provider, classifier).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    /// Timeouts, connection failures, 5xx-equivalents. Retryable.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Auth failures, malformed requests. Never retried.
    #[error("permanent failure: {0}")]
    Permanent(String),
    /// A single attempt exceeded its timeout. Counts as transient.
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
    /// The circuit breaker rejected the call; no attempt was made.
    #[error("circuit breaker open for {target}")]
    BreakerOpen { target: String },
    /// The target's rate limit is spent; no attempt was made.
    #[error("rate limit reached for {target}; next slot in {retry_after:?}")]
    RateLimited { target: String, retry_after: Duration },
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<CallError> },
    #[error("call cancelled")]
    Cancelled,
}

impl CallError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Whether the failure may succeed on another attempt against the same target.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Component-level error surfaced by the dispatcher, router, planner and orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Call(#[from] CallError),

    #[error("all providers exhausted for capability {capability} ({} failures)", failures.len())]
    ProvidersExhausted {
        capability: String,
        failures: Vec<ProviderFailure>,
    },

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    /// Structurally invalid plan (cycles, dangling dependencies, duplicate ids).
    #[error("invalid plan: {0}")]
    PlanValidation(String),

    /// Plan rejected by a domain rule; never executed.
    #[error("plan rejected by rule {rule}: {reason}")]
    PolicyViolation { rule: String, reason: String },

    #[error("cannot bind input for step {step}: {reason}")]
    Binding { step: String, reason: String },

    #[error("illegal session transition {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

impl From<sled::Error> for CoreError {
    fn from(e: sled::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl CoreError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Call(CallError::Cancelled))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
