//! Provider router: ordered failover across interchangeable backends for a capability,
//! with guardrail validation and health-adaptive ordering.

mod guardrails;
mod health;

pub use guardrails::{
    extract_json_object, structured_output, Guardrail, GuardrailConfig, GuardrailPipeline,
    GuardrailViolation, SchemaCheck, Verdict, ViolationKind,
};
pub use health::{HealthSample, HealthSnapshot, ProviderHealth};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{CallError, CoreError, CoreResult};
use crate::events::{CoreEvent, SharedSink};
use crate::idempotency::IdempotencyKey;
use crate::resilience::{RetryExecutor, RetryPolicy};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub capability: String,
    pub prompt: String,
    #[serde(default)]
    pub input: Value,
}

/// Raw provider output, before guardrails.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub content: String,
    #[serde(default)]
    pub structured: Option<Value>,
    /// Set by knowledge-backed providers when passages failed the freshness policy.
    #[serde(default)]
    pub stale: bool,
}

impl ProviderResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}

/// Interchangeable backend for one or more capabilities (LLM vendor, knowledge index).
#[async_trait::async_trait]
pub trait ModelProvider: Send + Sync {
    /// Stable id; also the circuit-breaker target.
    fn id(&self) -> &str;

    async fn invoke(
        &self,
        request: &ProviderRequest,
        key: &IdempotencyKey,
    ) -> Result<ProviderResponse, CallError>;
}

/// Why one provider in the preference list did not produce the answer.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderFailure {
    Violation(GuardrailViolation),
    Call { provider: String, error: CallError },
}

impl ProviderFailure {
    pub fn provider(&self) -> &str {
        match self {
            ProviderFailure::Violation(v) => &v.provider,
            ProviderFailure::Call { provider, .. } => provider,
        }
    }
}

/// A response that passed every guardrail.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedResponse {
    pub provider: String,
    pub capability: String,
    pub content: String,
    pub structured: Option<Value>,
    pub latency: Duration,
    pub attempts: u32,
    /// Providers tried and rejected before this one.
    pub failures: Vec<ProviderFailure>,
}

impl ValidatedResponse {
    /// Step output shape consumed by plan bindings.
    pub fn to_output(&self) -> Value {
        serde_json::json!({
            "provider": self.provider,
            "content": self.content,
            "structured": self.structured,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRoute {
    pub capability: String,
    /// Provider ids in preference order.
    pub providers: Vec<String>,
    #[serde(default)]
    pub schema: Option<SchemaCheck>,
    /// Per-route override of the router's retry policy.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub routes: Vec<CapabilityRoute>,
    /// Failure score at or above which a provider is tried after healthy ones.
    pub deprioritize_threshold: f64,
    /// Observations required before health affects ordering.
    pub min_samples: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            routes: Vec::new(),
            deprioritize_threshold: 0.5,
            min_samples: 5,
        }
    }
}

pub struct ProviderRouter {
    providers: HashMap<String, Arc<dyn ModelProvider>>,
    routes: HashMap<String, (CapabilityRoute, GuardrailPipeline)>,
    config: RouterConfig,
    guardrails: GuardrailConfig,
    retry: RetryExecutor,
    policy: RetryPolicy,
    health: DashMap<String, Arc<ProviderHealth>>,
    events: SharedSink,
}

impl ProviderRouter {
    pub fn new(
        config: RouterConfig,
        guardrails: GuardrailConfig,
        retry: RetryExecutor,
        policy: RetryPolicy,
        events: SharedSink,
    ) -> Self {
        let mut router = Self {
            providers: HashMap::new(),
            routes: HashMap::new(),
            config: config.clone(),
            guardrails,
            retry,
            policy,
            health: DashMap::new(),
            events,
        };
        for route in config.routes {
            router.add_route(route);
        }
        router
    }

    pub fn register(&mut self, provider: Arc<dyn ModelProvider>) {
        self.health
            .entry(provider.id().to_string())
            .or_insert_with(|| Arc::new(ProviderHealth::new()));
        self.providers.insert(provider.id().to_string(), provider);
    }

    /// Adds or replaces the route for `route.capability`.
    pub fn add_route(&mut self, route: CapabilityRoute) {
        let pipeline = GuardrailPipeline::new(&self.guardrails, route.schema.as_ref());
        self.routes
            .insert(route.capability.clone(), (route, pipeline));
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.routes.contains_key(capability)
    }

    pub fn capabilities(&self) -> Vec<String> {
        let mut caps: Vec<String> = self.routes.keys().cloned().collect();
        caps.sort();
        caps
    }

    fn health_for(&self, provider: &str) -> Arc<ProviderHealth> {
        self.health
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(ProviderHealth::new()))
            .clone()
    }

    pub fn health_snapshot(&self) -> Vec<HealthSnapshot> {
        let mut out: Vec<HealthSnapshot> = self
            .health
            .iter()
            .map(|h| h.value().snapshot(h.key()))
            .collect();
        out.sort_by(|a, b| a.provider.cmp(&b.provider));
        out
    }

    /// Configured order with unhealthy providers moved behind healthy ones. Relative
    /// order inside each group is preserved; nobody is dropped.
    pub fn ordered_providers(&self, capability: &str) -> Vec<String> {
        let Some((route, _)) = self.routes.get(capability) else {
            return Vec::new();
        };
        let (healthy, degraded): (Vec<String>, Vec<String>) =
            route.providers.iter().cloned().partition(|id| {
                let health = self.health_for(id);
                health.samples() < self.config.min_samples
                    || health.failure_score() < self.config.deprioritize_threshold
            });
        healthy.into_iter().chain(degraded).collect()
    }

    /// Tries each provider of the capability once, in health-adjusted preference order,
    /// returning the first response that passes the guardrails.
    pub async fn invoke(
        &self,
        capability: &str,
        request: &ProviderRequest,
        key: &IdempotencyKey,
        cancel: &CancellationToken,
    ) -> CoreResult<ValidatedResponse> {
        let (route, pipeline) = self
            .routes
            .get(capability)
            .ok_or_else(|| CoreError::UnknownCapability(capability.to_string()))?;
        let policy = route.retry.as_ref().unwrap_or(&self.policy);
        let mut failures = Vec::new();

        for provider_id in self.ordered_providers(capability) {
            if cancel.is_cancelled() {
                return Err(CallError::Cancelled.into());
            }
            let Some(provider) = self.providers.get(&provider_id).cloned() else {
                tracing::warn!(target: "switchyard::router", provider = %provider_id, %capability, "route names unregistered provider");
                failures.push(ProviderFailure::Call {
                    provider: provider_id.clone(),
                    error: CallError::permanent("provider not registered"),
                });
                continue;
            };
            let health = self.health_for(&provider_id);
            let started = Instant::now();
            let result = self
                .retry
                .execute(&provider_id, key, policy, cancel, |_, key| {
                    let provider = provider.clone();
                    let request = request.clone();
                    async move { provider.invoke(&request, &key).await }
                })
                .await;
            let latency = started.elapsed();

            match result {
                Ok(attempted) => {
                    let response = attempted.value;
                    match pipeline.validate(&response) {
                        Verdict::Pass => {
                            health.record(HealthSample::Success, latency);
                            tracing::debug!(
                                target: "switchyard::router",
                                provider = %provider_id,
                                %capability,
                                latency_ms = latency.as_millis() as u64,
                                "validated response"
                            );
                            let structured = response
                                .structured
                                .clone()
                                .or_else(|| structured_output(&response).map(Value::Object));
                            return Ok(ValidatedResponse {
                                provider: provider_id,
                                capability: capability.to_string(),
                                content: response.content,
                                structured,
                                latency,
                                attempts: attempted.attempts,
                                failures,
                            });
                        }
                        Verdict::Violation { kind, detail } => {
                            health.record(HealthSample::Violation, latency);
                            let violation = GuardrailViolation {
                                provider: provider_id.clone(),
                                capability: capability.to_string(),
                                kind,
                                detail,
                            };
                            tracing::warn!(
                                target: "switchyard::router",
                                provider = %provider_id,
                                %capability,
                                ?kind,
                                detail = %violation.detail,
                                "guardrail violation, failing over"
                            );
                            self.events
                                .emit(CoreEvent::GuardrailViolation(violation.clone()));
                            failures.push(ProviderFailure::Violation(violation));
                        }
                    }
                }
                Err(CallError::Cancelled) => return Err(CallError::Cancelled.into()),
                Err(error) => {
                    if !matches!(
                        error,
                        CallError::BreakerOpen { .. } | CallError::RateLimited { .. }
                    ) {
                        health.record(HealthSample::Failure, latency);
                    }
                    tracing::warn!(
                        target: "switchyard::router",
                        provider = %provider_id,
                        %capability,
                        %error,
                        "provider failed, failing over"
                    );
                    failures.push(ProviderFailure::Call {
                        provider: provider_id,
                        error,
                    });
                }
            }
        }

        tracing::error!(target: "switchyard::router", %capability, failures = failures.len(), "all providers exhausted");
        Err(CoreError::ProvidersExhausted {
            capability: capability.to_string(),
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingSink;
    use crate::resilience::{BreakerConfig, CircuitBreakers};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        id: &'static str,
        reply: Result<&'static str, CallError>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(id: &'static str, reply: Result<&'static str, CallError>) -> Arc<Self> {
            Arc::new(Self {
                id,
                reply,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl ModelProvider for Scripted {
        fn id(&self) -> &str {
            self.id
        }

        async fn invoke(
            &self,
            _request: &ProviderRequest,
            _key: &IdempotencyKey,
        ) -> Result<ProviderResponse, CallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone().map(ProviderResponse::text)
        }
    }

    fn router(sink: SharedSink, providers: &[&str]) -> ProviderRouter {
        let breakers = CircuitBreakers::shared(BreakerConfig::default(), sink.clone());
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
            attempt_timeout_ms: 500,
            retry_timeouts: true,
        };
        let config = RouterConfig {
            routes: vec![CapabilityRoute {
                capability: "support.reply".into(),
                providers: providers.iter().map(|s| s.to_string()).collect(),
                schema: None,
                retry: None,
            }],
            ..RouterConfig::default()
        };
        ProviderRouter::new(
            config,
            GuardrailConfig::default(),
            RetryExecutor::new(breakers),
            policy,
            sink,
        )
    }

    fn request() -> ProviderRequest {
        ProviderRequest {
            capability: "support.reply".into(),
            prompt: "Where is my order?".into(),
            input: Value::Null,
        }
    }

    #[tokio::test]
    async fn violating_provider_fails_over_to_next_with_one_recorded_violation() {
        let sink = Arc::new(RecordingSink::default());
        let mut r = router(sink.clone(), &["p1", "p2"]);
        let p1 = Scripted::new("p1", Ok(""));
        let p2 = Scripted::new("p2", Ok("Your order A100 shipped on Monday."));
        r.register(p1.clone());
        r.register(p2.clone());

        let out = r
            .invoke(
                "support.reply",
                &request(),
                &IdempotencyKey::from_raw("k"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out.provider, "p2");
        assert_eq!(out.content, "Your order A100 shipped on Monday.");
        assert_eq!(p1.calls.load(Ordering::SeqCst), 1, "violations are not retried");
        assert_eq!(out.failures.len(), 1);
        assert!(matches!(
            &out.failures[0],
            ProviderFailure::Violation(v) if v.provider == "p1" && v.kind == ViolationKind::DegenerateOutput
        ));
        let violations = sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, CoreEvent::GuardrailViolation(_)))
            .count();
        assert_eq!(violations, 1);
    }

    #[tokio::test]
    async fn transport_failures_and_permanent_errors_advance_to_next_provider() {
        let sink: SharedSink = Arc::new(RecordingSink::default());
        let mut r = router(sink, &["down", "denied", "ok"]);
        let down = Scripted::new("down", Err(CallError::transient("503")));
        r.register(down.clone());
        r.register(Scripted::new("denied", Err(CallError::permanent("401"))));
        r.register(Scripted::new("ok", Ok("Happy to help with that refund.")));

        let out = r
            .invoke(
                "support.reply",
                &request(),
                &IdempotencyKey::from_raw("k"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out.provider, "ok");
        assert_eq!(down.calls.load(Ordering::SeqCst), 2);
        assert_eq!(out.failures.len(), 2);
    }

    #[tokio::test]
    async fn exhaustion_carries_every_failure() {
        let sink: SharedSink = Arc::new(RecordingSink::default());
        let mut r = router(sink, &["a", "b"]);
        r.register(Scripted::new("a", Ok("my password is hunter2")));
        r.register(Scripted::new("b", Err(CallError::permanent("bad request"))));

        let err = r
            .invoke(
                "support.reply",
                &request(),
                &IdempotencyKey::from_raw("k"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            CoreError::ProvidersExhausted { capability, failures } => {
                assert_eq!(capability, "support.reply");
                let providers: Vec<&str> = failures.iter().map(|f| f.provider()).collect();
                assert_eq!(providers, vec!["a", "b"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_capability_is_rejected() {
        let r = router(Arc::new(RecordingSink::default()), &["p1"]);
        let err = r
            .invoke(
                "billing.forecast",
                &request(),
                &IdempotencyKey::from_raw("k"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::UnknownCapability(_)));
    }

    #[tokio::test]
    async fn unhealthy_provider_is_deprioritized_but_kept() {
        let sink: SharedSink = Arc::new(RecordingSink::default());
        let mut r = router(sink, &["flaky", "steady"]);
        r.register(Scripted::new("flaky", Ok("fine")));
        r.register(Scripted::new("steady", Ok("fine")));
        assert_eq!(r.ordered_providers("support.reply"), vec!["flaky", "steady"]);

        let flaky = r.health_for("flaky");
        for _ in 0..6 {
            flaky.record(HealthSample::Violation, Duration::ZERO);
        }
        assert_eq!(r.ordered_providers("support.reply"), vec!["steady", "flaky"]);

        for _ in 0..10 {
            flaky.record(HealthSample::Success, Duration::ZERO);
        }
        assert_eq!(r.ordered_providers("support.reply"), vec!["flaky", "steady"]);
    }

    #[tokio::test]
    async fn schema_route_returns_structured_payload() {
        let sink: SharedSink = Arc::new(RecordingSink::default());
        let mut r = router(sink, &["json"]);
        r.add_route(CapabilityRoute {
            capability: "intent.extract".into(),
            providers: vec!["json".into()],
            schema: Some(SchemaCheck {
                required_fields: vec!["intent".into()],
            }),
            retry: None,
        });
        r.register(Scripted::new("json", Ok("```json\n{\"intent\": \"greeting\"}\n```")));
        let out = r
            .invoke(
                "intent.extract",
                &request(),
                &IdempotencyKey::from_raw("k"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(
            out.structured,
            Some(serde_json::json!({"intent": "greeting"}))
        );
    }
}
