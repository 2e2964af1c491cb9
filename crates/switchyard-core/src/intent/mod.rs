//! Intent routing: classify the customer's message and decide whether to plan,
//! clarify or escalate.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{CallError, CoreResult};
use crate::idempotency::IdempotencyKey;
use crate::orchestrator::{EscalationReason, SessionSnapshot};
use crate::planner::ClarificationRequest;
use crate::resilience::{RetryExecutor, RetryPolicy};

/// Breaker/retry target name used for the language-understanding collaborator.
pub const CLASSIFIER_TARGET: &str = "intent.classifier";

/// A recognised goal plus the parameters extracted for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    id: String,
    #[serde(default)]
    params: BTreeMap<String, Value>,
}

impl Intent {
    pub fn new(id: impl Into<String>, params: BTreeMap<String, Value>) -> Self {
        Self {
            id: id.into(),
            params,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }
}

/// Classifier confidence in `[0, 1]` and the method that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceScore {
    value: f64,
    method: String,
}

impl ConfidenceScore {
    /// Clamps `value` into `[0, 1]`; NaN becomes 0.
    pub fn new(value: f64, method: impl Into<String>) -> Self {
        let value = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
        Self {
            value,
            method: method.into(),
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

/// Raw output of a [`LanguageUnderstanding`] implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub intent: String,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    pub confidence: f64,
    #[serde(default)]
    pub method: String,
}

#[async_trait::async_trait]
pub trait LanguageUnderstanding: Send + Sync {
    async fn classify(
        &self,
        text: &str,
        context: &SessionSnapshot,
    ) -> Result<Classification, CallError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentConfig {
    pub confidence_threshold: f64,
    /// Intents that mean "let me talk to a person".
    pub escalation_intents: Vec<String>,
    /// Clarification rounds tolerated before an ambiguous turn escalates.
    pub max_clarifications: u32,
    pub retry: RetryPolicy,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            escalation_intents: vec!["escalation".to_string()],
            max_clarifications: 2,
            retry: RetryPolicy {
                attempt_timeout_ms: 10_000,
                ..RetryPolicy::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Routing {
    Plan,
    /// Ask the customer before planning anything.
    Clarify(ClarificationRequest),
    Escalate(EscalationReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutedIntent {
    pub intent: Intent,
    pub confidence: ConfidenceScore,
    pub routing: Routing,
}

pub struct IntentRouter {
    classifier: Arc<dyn LanguageUnderstanding>,
    retry: RetryExecutor,
    config: IntentConfig,
}

impl IntentRouter {
    pub fn new(
        classifier: Arc<dyn LanguageUnderstanding>,
        retry: RetryExecutor,
        config: IntentConfig,
    ) -> Self {
        Self {
            classifier,
            retry,
            config,
        }
    }

    pub fn config(&self) -> &IntentConfig {
        &self.config
    }

    /// Classifies `text` through the retry executor under [`CLASSIFIER_TARGET`].
    pub async fn classify(
        &self,
        text: &str,
        context: &SessionSnapshot,
        cancel: &CancellationToken,
    ) -> CoreResult<(Intent, ConfidenceScore)> {
        let key = IdempotencyKey::derive(&context.session_id, "classify", &json!(text));
        let classified = self
            .retry
            .execute(CLASSIFIER_TARGET, &key, &self.config.retry, cancel, |_, _| {
                let classifier = Arc::clone(&self.classifier);
                async move { classifier.classify(text, context).await }
            })
            .await?;
        let c = classified.value;
        tracing::debug!(
            target: "switchyard::orchestrator",
            session_id = %context.session_id,
            intent = %c.intent,
            confidence = c.confidence,
            attempts = classified.attempts,
            "message classified"
        );
        Ok((
            Intent::new(c.intent, c.params),
            ConfidenceScore::new(c.confidence, c.method),
        ))
    }

    /// Pure routing decision for a classification in the given session context.
    pub fn decide(
        &self,
        intent: &Intent,
        confidence: &ConfidenceScore,
        context: &SessionSnapshot,
    ) -> Routing {
        if confidence.value() < self.config.confidence_threshold {
            if context.clarification_streak >= self.config.max_clarifications {
                return Routing::Escalate(EscalationReason::RepeatedAmbiguity);
            }
            return Routing::Clarify(ClarificationRequest::low_confidence(confidence.value()));
        }
        if self
            .config
            .escalation_intents
            .iter()
            .any(|i| i == intent.id())
        {
            return Routing::Escalate(EscalationReason::CustomerRequest);
        }
        Routing::Plan
    }

    pub async fn route(
        &self,
        text: &str,
        context: &SessionSnapshot,
        cancel: &CancellationToken,
    ) -> CoreResult<RoutedIntent> {
        let (intent, confidence) = self.classify(text, context, cancel).await?;
        let routing = self.decide(&intent, &confidence, context);
        Ok(RoutedIntent {
            intent,
            confidence,
            routing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::tracing_sink;
    use crate::planner::{
        BlueprintRegistry, CapabilityTable, ClarifyReason, ExecutionPlanner, PlanDecision,
        PlannerConfig,
    };
    use crate::resilience::{BreakerConfig, CircuitBreakers};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Fixed {
        intent: &'static str,
        confidence: f64,
        params: Value,
        transient_failures: u32,
        calls: AtomicU32,
    }

    impl Fixed {
        fn new(intent: &'static str, confidence: f64, params: Value) -> Self {
            Self {
                intent,
                confidence,
                params,
                transient_failures: 0,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl LanguageUnderstanding for Fixed {
        async fn classify(
            &self,
            _text: &str,
            _context: &SessionSnapshot,
        ) -> Result<Classification, CallError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.transient_failures {
                return Err(CallError::transient("classifier overloaded"));
            }
            Ok(Classification {
                intent: self.intent.to_string(),
                params: serde_json::from_value(self.params.clone()).unwrap_or_default(),
                confidence: self.confidence,
                method: "fixed".into(),
            })
        }
    }

    fn router(classifier: Fixed) -> IntentRouter {
        let breakers = CircuitBreakers::shared(BreakerConfig::default(), tracing_sink());
        IntentRouter::new(
            Arc::new(classifier),
            RetryExecutor::new(breakers),
            IntentConfig {
                retry: RetryPolicy {
                    base_delay_ms: 1,
                    max_delay_ms: 5,
                    ..RetryPolicy::default()
                },
                ..IntentConfig::default()
            },
        )
    }

    fn planner() -> ExecutionPlanner {
        ExecutionPlanner::new(
            PlannerConfig::default(),
            Arc::new(BlueprintRegistry::default_blueprint()),
            CapabilityTable::support_defaults(),
        )
    }

    #[tokio::test]
    async fn low_confidence_clarifies_and_planner_agrees() {
        let router = router(Fixed::new("order_status", 0.4, json!({"order_id": "A1"})));
        let ctx = SessionSnapshot::for_session("s1");
        let routed = router
            .route("uh, my thing?", &ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(
            &routed.routing,
            Routing::Clarify(ask) if matches!(ask.reason, ClarifyReason::LowConfidence { .. })
        ));
        let decision = planner()
            .plan(&routed.intent, &routed.confidence, &ctx)
            .unwrap();
        assert!(matches!(decision, PlanDecision::Clarify(_)));
    }

    #[tokio::test]
    async fn confident_intent_plans() {
        let router = router(Fixed::new("order_status", 0.9, json!({"order_id": "A1"})));
        let ctx = SessionSnapshot::for_session("s1");
        let routed = router
            .route("where is order A1", &ctx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(routed.routing, Routing::Plan);
        assert_eq!(routed.intent.param("order_id"), Some(&json!("A1")));
        let decision = planner()
            .plan(&routed.intent, &routed.confidence, &ctx)
            .unwrap();
        assert!(matches!(decision, PlanDecision::Plan(_)));
    }

    #[tokio::test]
    async fn transient_classifier_failures_are_retried() {
        let mut fixed = Fixed::new("greeting", 0.95, json!({}));
        fixed.transient_failures = 2;
        let router = router(fixed);
        let (intent, confidence) = router
            .classify("hello", &SessionSnapshot::for_session("s1"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(intent.id(), "greeting");
        assert_eq!(confidence.method(), "fixed");
    }

    #[test]
    fn escalation_intent_and_repeated_ambiguity_escalate() {
        let router = router(Fixed::new("unused", 0.0, json!({})));
        let mut ctx = SessionSnapshot::for_session("s1");
        let human = Intent::new("escalation", BTreeMap::new());
        assert_eq!(
            router.decide(&human, &ConfidenceScore::new(0.8, "t"), &ctx),
            Routing::Escalate(EscalationReason::CustomerRequest)
        );

        let vague = Intent::new("general_inquiry", BTreeMap::new());
        let low = ConfidenceScore::new(0.3, "t");
        ctx.clarification_streak = 1;
        assert!(matches!(router.decide(&vague, &low, &ctx), Routing::Clarify(_)));
        ctx.clarification_streak = 2;
        assert_eq!(
            router.decide(&vague, &low, &ctx),
            Routing::Escalate(EscalationReason::RepeatedAmbiguity)
        );
    }

    #[test]
    fn confidence_is_clamped() {
        assert_eq!(ConfidenceScore::new(1.7, "t").value(), 1.0);
        assert_eq!(ConfidenceScore::new(f64::NAN, "t").value(), 0.0);
    }
}
