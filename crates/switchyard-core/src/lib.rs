//! switchyard-core: orchestration, dispatch and provider routing for a customer-support agent.
//!
//! Circuit breakers and retries guard every external call; the provider router fails over
//! between model backends behind guardrails; the tool dispatcher deduplicates mutations;
//! the planner turns intents into dependency-ordered plans that the executor runs in
//! parallel; the orchestrator owns each session's state machine.

mod error;
mod events;
mod idempotency;
mod intent;
mod knowledge;
mod orchestrator;
mod planner;
mod providers;
mod resilience;
mod shared;
mod store;
mod tools;

pub use error::{CallError, CoreError, CoreResult};
pub use events::{
    tracing_sink, BroadcastSink, CoreEvent, EventSink, FanoutSink, SharedSink, TracingSink,
};
pub use idempotency::IdempotencyKey;
pub use shared::{CoreConfig, CONFIG_ENV};
pub use store::{KvStore, MemoryStore, SledStore};

// Resilience
pub use resilience::{
    Attempted, BreakerConfig, BreakerSnapshot, CircuitBreakers, CircuitState, Outcome,
    RateLimit, RateLimitConfig, RateLimiters, RetryExecutor, RetryPolicy,
};

// Providers and knowledge
pub use knowledge::{FreshnessPolicy, KnowledgeRetriever, Passage, Retrieval};
pub use providers::{
    extract_json_object, structured_output, CapabilityRoute, Guardrail, GuardrailConfig,
    GuardrailPipeline, GuardrailViolation, HealthSample, HealthSnapshot, ModelProvider,
    ProviderFailure, ProviderHealth, ProviderRequest, ProviderResponse, ProviderRouter,
    RouterConfig, SchemaCheck, ValidatedResponse, Verdict, ViolationKind,
};

// Tools
pub use tools::{
    Claim, IdempotencyLedger, LedgerEntry, LedgerScope, Tool, ToolDispatcher, ToolRegistry,
    ToolRequest, ToolResult,
};

// Planning and execution
pub use planner::{
    Binding, Blueprint, BlueprintRegistry, CapabilityTable, ClarificationRequest, ClarifyReason,
    DomainRule, ExecutionPlan, ExecutionPlanner, FailurePolicy, MaxStepsRule, PlanBuilder,
    PlanDecision, PlanExecutor, PlanReport, PlanStatus, PlannerConfig, RefundLimitRule, Step,
    StepRecord, StepState, StepTarget, StepTemplate, TemplateBinding,
};

// Intent routing and orchestration
pub use intent::{
    Classification, ConfidenceScore, Intent, IntentConfig, IntentRouter, LanguageUnderstanding,
    RoutedIntent, Routing, CLASSIFIER_TARGET,
};
pub use orchestrator::{
    degraded_response, EscalationReason, EscalationRecord, HandoffRequest, HumanHandoff,
    Orchestrator, Reply, ReplyKind, Role, SessionConfig, SessionContext, SessionSnapshot,
    SessionState, SessionStore, Turn,
};
