//! Tool dispatch: a uniform envelope over side-effecting integrations (orders, refunds,
//! tickets, notifications), run under retry and circuit-breaker discipline.

mod ledger;

pub use ledger::{Claim, IdempotencyLedger, LedgerEntry, LedgerScope};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{CallError, CoreError, CoreResult};
use crate::idempotency::IdempotencyKey;
use crate::resilience::{RetryExecutor, RetryPolicy};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub session_id: String,
    pub step_id: String,
    pub input: Value,
}

/// Trait implemented by every external integration the planner can target.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name; also the circuit-breaker target.
    fn name(&self) -> &str;

    /// Whether a call changes external state (refund, ticket, message).
    fn mutating(&self) -> bool {
        false
    }

    /// Whether the integration deduplicates on the idempotency key itself.
    fn supports_idempotency(&self) -> bool {
        false
    }

    async fn call(&self, request: &ToolRequest, key: &IdempotencyKey) -> Result<Value, CallError>;
}

/// Registry of tools that can be dispatched by name.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub tool: String,
    pub output: Value,
    pub attempts: u32,
    /// Output came from the ledger; the integration was not called.
    pub replayed: bool,
    pub latency: Duration,
}

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    retry: RetryExecutor,
    ledger: IdempotencyLedger,
    default_policy: RetryPolicy,
    policies: HashMap<String, RetryPolicy>,
}

impl ToolDispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        retry: RetryExecutor,
        ledger: IdempotencyLedger,
        default_policy: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            retry,
            ledger,
            default_policy,
            policies: HashMap::new(),
        }
    }

    /// Overrides the retry policy for one tool.
    pub fn with_policy(mut self, tool: impl Into<String>, policy: RetryPolicy) -> Self {
        self.policies.insert(tool.into(), policy);
        self
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.registry.get(name).is_some()
    }

    pub async fn call(
        &self,
        tool_name: &str,
        request: &ToolRequest,
        key: &IdempotencyKey,
        cancel: &CancellationToken,
    ) -> CoreResult<ToolResult> {
        let tool = self
            .registry
            .get(tool_name)
            .ok_or_else(|| CoreError::UnknownTool(tool_name.to_string()))?;
        let mut policy = self
            .policies
            .get(tool_name)
            .unwrap_or(&self.default_policy)
            .clone();
        let started = Instant::now();
        let scope = LedgerScope {
            session_id: &request.session_id,
            step_id: &request.step_id,
            key,
        };

        if tool.mutating() {
            if cancel.is_cancelled() {
                return Err(CallError::Cancelled.into());
            }
            match self.ledger.claim(&scope, tool_name)? {
                Claim::Claimed => {}
                Claim::Replay(output) => {
                    tracing::info!(target: "switchyard::tools", tool = %tool_name, %key, "replaying completed mutation");
                    return Ok(ToolResult {
                        tool: tool_name.to_string(),
                        output,
                        attempts: 0,
                        replayed: true,
                        latency: started.elapsed(),
                    });
                }
                Claim::Refused(entry) => {
                    tracing::warn!(target: "switchyard::tools", tool = %tool_name, %key, ?entry, "refusing mutation with unknown outcome");
                    return Err(CallError::permanent(format!(
                        "outcome unknown for {tool_name} (key {key}); not dispatching again"
                    ))
                    .into());
                }
            }
            if !tool.supports_idempotency() {
                // Any failed attempt may already have applied the mutation.
                policy.max_attempts = 1;
                policy.retry_timeouts = false;
            }
        }

        let result = self
            .retry
            .execute(tool_name, key, &policy, cancel, |attempt, key| {
                let tool = tool.clone();
                let request = request.clone();
                async move {
                    tracing::debug!(target: "switchyard::tools", tool = %tool.name(), attempt, "dispatching");
                    tool.call(&request, &key).await
                }
            })
            .await;

        match result {
            Ok(attempted) => {
                if tool.mutating() {
                    self.ledger.complete(&scope, tool_name, &attempted.value)?;
                }
                tracing::info!(
                    target: "switchyard::tools",
                    tool = %tool_name,
                    attempts = attempted.attempts,
                    latency_ms = started.elapsed().as_millis() as u64,
                    "tool call succeeded"
                );
                Ok(ToolResult {
                    tool: tool_name.to_string(),
                    output: attempted.value,
                    attempts: attempted.attempts,
                    replayed: false,
                    latency: started.elapsed(),
                })
            }
            Err(error) => {
                if tool.mutating() {
                    if outcome_unknown(&error) && !tool.supports_idempotency() {
                        self.ledger
                            .mark_uncertain(&scope, tool_name, &error.to_string())?;
                    } else {
                        self.ledger.release(&scope)?;
                    }
                }
                tracing::warn!(target: "switchyard::tools", tool = %tool_name, %error, "tool call failed");
                Err(error.into())
            }
        }
    }
}

/// Whether the integration may have applied the call before it failed.
fn outcome_unknown(error: &CallError) -> bool {
    match error {
        CallError::Transient(_) | CallError::Timeout(_) | CallError::Cancelled => true,
        CallError::RetriesExhausted { last, .. } => outcome_unknown(last),
        CallError::Permanent(_)
        | CallError::BreakerOpen { .. }
        | CallError::RateLimited { .. } => false,
    }
}
