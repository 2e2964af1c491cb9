//! Orchestrator: owns every session's context and drives one turn at a time through
//! classification, planning, execution and the reply.

mod handoff;
mod session;

pub use handoff::{EscalationReason, HandoffRequest, HumanHandoff};
pub use session::{
    EscalationRecord, Role, SessionConfig, SessionContext, SessionSnapshot, SessionState,
    SessionStore, Turn,
};

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, CoreResult};
use crate::events::{CoreEvent, SharedSink};
use crate::intent::{IntentRouter, Routing};
use crate::planner::{
    ExecutionPlan, ExecutionPlanner, PlanDecision, PlanExecutor, PlanReport, PlanStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    Answer,
    Clarification,
    Handoff,
    Cancelled,
}

/// What the customer sees for one turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub text: String,
    /// Session state after the turn.
    pub state: SessionState,
    pub kind: ReplyKind,
}

const ESCALATED_NOTICE: &str =
    "A member of our support team has your conversation and will reply here shortly.";
const CANCELLED_NOTICE: &str = "Okay, I've stopped working on that request.";

/// Canned per-intent reply used when a plan could not produce its response step.
pub fn degraded_response(intent: &str) -> &'static str {
    match intent {
        "greeting" => "Hello! I'm here to help. How can I assist you today?",
        "order_status" => "I'm having trouble accessing order information right now. Please try again in a moment or contact support@example.com",
        "product_info" => "I'm experiencing technical difficulties. Please visit our website or contact support for product information.",
        "ticket_creation" => "I'm unable to create a ticket right now. Please email support@example.com and we'll help you shortly.",
        "escalation" => "I apologize for the inconvenience. Please contact our support team directly at support@example.com or call 1-800-SUPPORT.",
        _ => "I'm experiencing technical difficulties. Please try again in a moment.",
    }
}

/// Text of a response step output: a bare string or an object with `content`.
fn response_text(output: &Value) -> Option<String> {
    match output {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Object(map) => map
            .get("content")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string),
        _ => None,
    }
}

enum TurnEnd {
    Reply(ReplyKind, String),
    Escalate(EscalationReason, String),
    Abandon,
}

pub struct Orchestrator {
    sessions: SessionStore,
    intents: IntentRouter,
    planner: ExecutionPlanner,
    executor: PlanExecutor,
    handoff: Arc<dyn HumanHandoff>,
    events: SharedSink,
    config: SessionConfig,
    locks: DashMap<String, Arc<Mutex<()>>>,
    inflight: DashMap<String, CancellationToken>,
}

impl Orchestrator {
    pub fn new(
        sessions: SessionStore,
        intents: IntentRouter,
        planner: ExecutionPlanner,
        executor: PlanExecutor,
        handoff: Arc<dyn HumanHandoff>,
        events: SharedSink,
        config: SessionConfig,
    ) -> Self {
        Self {
            sessions,
            intents,
            planner,
            executor,
            handoff,
            events,
            config,
            locks: DashMap::new(),
            inflight: DashMap::new(),
        }
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Drops the session's lock entry unless another turn still holds or awaits it.
    /// The caller must have dropped its own clone first.
    fn release_lock(&self, session_id: &str) {
        self.locks
            .remove_if(session_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Handles one customer message. Turns of the same session are serialised; turns
    /// of different sessions run independently.
    pub async fn handle(&self, session_id: &str, message: &str) -> CoreResult<Reply> {
        let lock = self.session_lock(session_id);
        let result = {
            let _turn = lock.lock().await;
            self.handle_locked(session_id, message).await
        };
        drop(lock);
        self.release_lock(session_id);
        result
    }

    async fn handle_locked(&self, session_id: &str, message: &str) -> CoreResult<Reply> {
        let mut ctx = self
            .sessions
            .load(session_id, self.config.ttl_secs)?
            .unwrap_or_else(|| SessionContext::new(session_id));
        ctx.push_turn(Role::User, message);

        if ctx.state == SessionState::Escalated {
            ctx.push_turn(Role::Assistant, ESCALATED_NOTICE);
            self.sessions.save(&mut ctx)?;
            return Ok(Reply {
                text: ESCALATED_NOTICE.to_string(),
                state: SessionState::Escalated,
                kind: ReplyKind::Handoff,
            });
        }
        if ctx.state != SessionState::Idle {
            // Left behind by a turn that never saved its end state.
            tracing::warn!(target: "switchyard::orchestrator", %session_id, state = %ctx.state, "resetting interrupted session");
            self.transition(&mut ctx, SessionState::Idle)?;
        }

        let cancel = CancellationToken::new();
        self.inflight.insert(session_id.to_string(), cancel.clone());
        let end = self.run_turn(&mut ctx, message, &cancel).await;
        self.inflight.remove(session_id);

        let reply = match end {
            Ok(TurnEnd::Reply(kind, text)) => {
                self.transition(&mut ctx, SessionState::Responding)?;
                ctx.push_turn(Role::Assistant, text.clone());
                self.transition(&mut ctx, SessionState::Idle)?;
                Reply {
                    text,
                    state: SessionState::Idle,
                    kind,
                }
            }
            Ok(TurnEnd::Abandon) => {
                self.transition(&mut ctx, SessionState::Idle)?;
                Reply {
                    text: CANCELLED_NOTICE.to_string(),
                    state: SessionState::Idle,
                    kind: ReplyKind::Cancelled,
                }
            }
            Ok(TurnEnd::Escalate(reason, detail)) => self.escalate(&mut ctx, reason, detail).await?,
            Err(e) => {
                tracing::error!(target: "switchyard::orchestrator", %session_id, error = %e, "turn failed");
                self.escalate(&mut ctx, EscalationReason::AiFailure, e.to_string())
                    .await?
            }
        };

        self.sessions.save(&mut ctx)?;
        Ok(reply)
    }

    async fn run_turn(
        &self,
        ctx: &mut SessionContext,
        message: &str,
        cancel: &CancellationToken,
    ) -> CoreResult<TurnEnd> {
        self.transition(ctx, SessionState::Classifying)?;
        let snapshot = ctx.snapshot(self.config.history_window);
        let routed = match self.intents.route(message, &snapshot, cancel).await {
            Ok(routed) => routed,
            Err(e) if e.is_cancelled() => return Ok(TurnEnd::Abandon),
            Err(e) => return Ok(TurnEnd::Escalate(EscalationReason::AiFailure, e.to_string())),
        };
        ctx.last_intent = Some(routed.intent.id().to_string());

        match routed.routing {
            Routing::Escalate(reason) => {
                return Ok(TurnEnd::Escalate(
                    reason,
                    format!("intent {} routed to a human", routed.intent.id()),
                ))
            }
            Routing::Clarify(ask) => {
                ctx.clarification_streak += 1;
                return Ok(TurnEnd::Reply(ReplyKind::Clarification, ask.question));
            }
            Routing::Plan => {}
        }

        self.transition(ctx, SessionState::Planning)?;
        let plan = match self
            .planner
            .plan(&routed.intent, &routed.confidence, &snapshot)
        {
            Ok(PlanDecision::Plan(plan)) => plan,
            Ok(PlanDecision::Clarify(ask)) => {
                ctx.clarification_streak += 1;
                return Ok(TurnEnd::Reply(ReplyKind::Clarification, ask.question));
            }
            Err(CoreError::PolicyViolation { rule, reason }) => {
                return Ok(TurnEnd::Escalate(
                    EscalationReason::PolicyException,
                    format!("{rule}: {reason}"),
                ))
            }
            Err(e) => return Err(e),
        };
        ctx.clarification_streak = 0;

        self.transition(ctx, SessionState::Executing)?;
        let report = self
            .executor
            .execute(&plan, &snapshot, cancel, self.planner.config().plan_budget())
            .await;
        for (step, output) in report.outputs_in_completion_order() {
            ctx.plan_outputs
                .insert(format!("{}.{}", plan.intent(), step), output.clone());
        }

        Ok(self.conclude(&plan, &report))
    }

    fn conclude(&self, plan: &ExecutionPlan, report: &PlanReport) -> TurnEnd {
        match report.status {
            PlanStatus::Cancelled => TurnEnd::Abandon,
            PlanStatus::Failed | PlanStatus::TimedOut => {
                let failures: Vec<String> = report
                    .steps
                    .iter()
                    .filter_map(|s| s.error.as_ref().map(|e| format!("{}: {e}", s.id)))
                    .collect();
                TurnEnd::Escalate(
                    EscalationReason::AiFailure,
                    format!("plan {} {:?}: {}", report.plan_id, report.status, failures.join("; ")),
                )
            }
            PlanStatus::Succeeded | PlanStatus::PartiallySucceeded => {
                let text = plan
                    .response_step()
                    .and_then(|id| report.output(id))
                    .and_then(response_text);
                match text {
                    Some(text) => TurnEnd::Reply(ReplyKind::Answer, text),
                    None => {
                        tracing::warn!(target: "switchyard::orchestrator", plan_id = %report.plan_id, intent = %plan.intent(), "response step missing, using degraded reply");
                        TurnEnd::Reply(
                            ReplyKind::Answer,
                            degraded_response(plan.intent()).to_string(),
                        )
                    }
                }
            }
        }
    }

    async fn escalate(
        &self,
        ctx: &mut SessionContext,
        reason: EscalationReason,
        detail: String,
    ) -> CoreResult<Reply> {
        self.transition(ctx, SessionState::Escalated)?;
        let request = HandoffRequest {
            session_id: ctx.session_id.clone(),
            reason,
            detail,
            last_intent: ctx.last_intent.clone(),
            recent_turns: ctx.snapshot(self.config.history_window).turns,
        };
        let reference = match self.handoff.hand_off(request).await {
            Ok(reference) => reference,
            Err(e) => {
                tracing::error!(target: "switchyard::orchestrator", session_id = %ctx.session_id, error = %e, "hand-off failed");
                String::new()
            }
        };
        tracing::info!(target: "switchyard::orchestrator", session_id = %ctx.session_id, ?reason, %reference, "session escalated");
        ctx.escalation = Some(EscalationRecord {
            reason,
            reference,
            at_ms: session::now_ms(),
        });
        let text = reason.notice().to_string();
        ctx.push_turn(Role::Assistant, text.clone());
        Ok(Reply {
            text,
            state: SessionState::Escalated,
            kind: ReplyKind::Handoff,
        })
    }

    fn transition(&self, ctx: &mut SessionContext, next: SessionState) -> CoreResult<()> {
        let from = ctx.transition(next)?;
        tracing::debug!(target: "switchyard::orchestrator", session_id = %ctx.session_id, %from, to = %next, "session transition");
        self.events.emit(CoreEvent::SessionTransition {
            session_id: ctx.session_id.clone(),
            from,
            to: next,
        });
        Ok(())
    }

    /// Cancels the session's in-flight turn, if any. Returns whether one was running.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.inflight.get(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels in-flight work, waits for the turn to unwind, and destroys the context.
    pub async fn end_session(&self, session_id: &str) -> CoreResult<()> {
        self.cancel(session_id);
        let lock = self.session_lock(session_id);
        let destroyed = {
            let _turn = lock.lock().await;
            self.sessions.destroy(session_id)
        };
        drop(lock);
        self.release_lock(session_id);
        destroyed?;
        tracing::info!(target: "switchyard::orchestrator", %session_id, "session ended");
        Ok(())
    }

    pub fn session(&self, session_id: &str) -> CoreResult<Option<SessionContext>> {
        self.sessions.load(session_id, self.config.ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallError;
    use crate::events::testing::RecordingSink;
    use crate::idempotency::IdempotencyKey;
    use crate::intent::{Classification, IntentConfig, LanguageUnderstanding};
    use crate::planner::{BlueprintRegistry, CapabilityTable, PlannerConfig};
    use crate::providers::{
        CapabilityRoute, GuardrailConfig, ModelProvider, ProviderRequest, ProviderResponse,
        ProviderRouter, RouterConfig,
    };
    use crate::resilience::{BreakerConfig, CircuitBreakers, RetryExecutor, RetryPolicy};
    use crate::store::MemoryStore;
    use crate::tools::{IdempotencyLedger, Tool, ToolDispatcher, ToolRegistry, ToolRequest};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Classifies by the first word: `<intent> [order_id] [amount] [confidence]`.
    struct WordClassifier;

    #[async_trait::async_trait]
    impl LanguageUnderstanding for WordClassifier {
        async fn classify(
            &self,
            text: &str,
            _context: &SessionSnapshot,
        ) -> Result<Classification, CallError> {
            let words: Vec<&str> = text.split_whitespace().collect();
            let mut params = BTreeMap::new();
            if let Some(order) = words.get(1) {
                params.insert("order_id".to_string(), json!(order));
            }
            if let Some(amount) = words.get(2).and_then(|a| a.parse::<f64>().ok()) {
                params.insert("amount".to_string(), json!(amount));
            }
            let confidence = words
                .get(3)
                .and_then(|c| c.parse::<f64>().ok())
                .unwrap_or(if words[0] == "mumble" { 0.2 } else { 0.9 });
            Ok(Classification {
                intent: words.first().copied().unwrap_or("unknown").to_string(),
                params,
                confidence,
                method: "word".into(),
            })
        }
    }

    struct Replier;

    #[async_trait::async_trait]
    impl ModelProvider for Replier {
        fn id(&self) -> &str {
            "replier"
        }

        async fn invoke(
            &self,
            request: &ProviderRequest,
            _key: &IdempotencyKey,
        ) -> Result<ProviderResponse, CallError> {
            if request.input.get("order").and_then(|o| o.get("status")).is_some() {
                return Ok(ProviderResponse::text(
                    "Your order is on its way and should arrive within two days.",
                ));
            }
            Ok(ProviderResponse::text(
                "Thanks for reaching out, we are happy to help with anything you need.",
            ))
        }
    }

    #[derive(Default)]
    struct Orders {
        fail: bool,
        delay_ms: u64,
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl Tool for Orders {
        fn name(&self) -> &str {
            "get_order"
        }

        async fn call(&self, request: &ToolRequest, _key: &IdempotencyKey) -> Result<Value, CallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            if self.fail {
                return Err(CallError::permanent("orders backend rejected credentials"));
            }
            Ok(json!({"order_id": request.input["order_id"], "status": "shipped"}))
        }
    }

    #[derive(Default)]
    struct Refunds {
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl Tool for Refunds {
        fn name(&self) -> &str {
            "issue_refund"
        }

        fn mutating(&self) -> bool {
            true
        }

        async fn call(&self, _request: &ToolRequest, _key: &IdempotencyKey) -> Result<Value, CallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"refund_id": "R-1"}))
        }
    }

    #[derive(Default)]
    struct Desk {
        requests: std::sync::Mutex<Vec<HandoffRequest>>,
    }

    #[async_trait::async_trait]
    impl HumanHandoff for Desk {
        async fn hand_off(&self, request: HandoffRequest) -> Result<String, CallError> {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request);
            Ok(format!("Q-{}", requests.len()))
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        orders: Arc<Orders>,
        refunds: Arc<Refunds>,
        desk: Arc<Desk>,
        sink: Arc<RecordingSink>,
    }

    fn harness(orders: Orders) -> Harness {
        let sink = Arc::new(RecordingSink::default());
        let events: SharedSink = sink.clone();
        let breakers = CircuitBreakers::shared(BreakerConfig::default(), events.clone());
        let retry = RetryExecutor::new(breakers);
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
            attempt_timeout_ms: 2_000,
            retry_timeouts: true,
        };

        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let orders = Arc::new(orders);
        let refunds = Arc::new(Refunds::default());
        let mut registry = ToolRegistry::new();
        registry.register(orders.clone());
        registry.register(refunds.clone());
        let tools = ToolDispatcher::new(
            Arc::new(registry),
            retry.clone(),
            IdempotencyLedger::new(store.clone()),
            policy.clone(),
        );

        let mut providers = ProviderRouter::new(
            RouterConfig {
                routes: ["support.reply", "knowledge.search"]
                    .iter()
                    .map(|c| CapabilityRoute {
                        capability: c.to_string(),
                        providers: vec!["replier".into()],
                        ..CapabilityRoute::default()
                    })
                    .collect(),
                ..RouterConfig::default()
            },
            GuardrailConfig::default(),
            retry.clone(),
            policy,
            events.clone(),
        );
        providers.register(Arc::new(Replier));

        let planner_config = PlannerConfig {
            refund_limit: 100.0,
            ..PlannerConfig::default()
        };
        let executor = PlanExecutor::new(
            Arc::new(providers),
            Arc::new(tools),
            events.clone(),
            planner_config.max_parallelism,
        );
        let planner = ExecutionPlanner::new(
            planner_config,
            Arc::new(BlueprintRegistry::default_blueprint()),
            CapabilityTable::support_defaults(),
        );
        let intents = IntentRouter::new(Arc::new(WordClassifier), retry, IntentConfig::default());
        let desk = Arc::new(Desk::default());
        let orchestrator = Orchestrator::new(
            SessionStore::new(store),
            intents,
            planner,
            executor,
            desk.clone(),
            events,
            SessionConfig::default(),
        );
        Harness {
            orchestrator,
            orders,
            refunds,
            desk,
            sink,
        }
    }

    #[tokio::test]
    async fn answers_order_status_and_folds_outputs() {
        let h = harness(Orders::default());
        let reply = h.orchestrator.handle("s1", "order_status A100").await.unwrap();
        assert_eq!(reply.kind, ReplyKind::Answer);
        assert_eq!(reply.state, SessionState::Idle);
        assert!(reply.text.contains("on its way"));

        let ctx = h.orchestrator.session("s1").unwrap().unwrap();
        assert_eq!(ctx.plan_outputs["order_status.lookup"]["status"], json!("shipped"));
        assert!(ctx.plan_outputs.contains_key("order_status.reply"));
        assert_eq!(ctx.turns.len(), 2);
        assert_eq!(ctx.last_intent.as_deref(), Some("order_status"));

        let transitions = h
            .sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, CoreEvent::SessionTransition { .. }))
            .count();
        assert_eq!(transitions, 5);
    }

    #[tokio::test]
    async fn ambiguity_clarifies_then_escalates() {
        let h = harness(Orders::default());
        for _ in 0..2 {
            let reply = h.orchestrator.handle("s1", "mumble").await.unwrap();
            assert_eq!(reply.kind, ReplyKind::Clarification);
        }
        assert_eq!(h.orders.calls.load(Ordering::SeqCst), 0);

        let reply = h.orchestrator.handle("s1", "mumble").await.unwrap();
        assert_eq!(reply.kind, ReplyKind::Handoff);
        assert_eq!(reply.state, SessionState::Escalated);
        let requests = h.desk.requests.lock().unwrap();
        assert_eq!(requests[0].reason, EscalationReason::RepeatedAmbiguity);
    }

    #[tokio::test]
    async fn refund_over_limit_escalates_without_mutation() {
        let h = harness(Orders::default());
        let reply = h
            .orchestrator
            .handle("s1", "returns_refunds A1 450")
            .await
            .unwrap();
        assert_eq!(reply.kind, ReplyKind::Handoff);
        assert_eq!(h.refunds.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.orders.calls.load(Ordering::SeqCst), 0);
        let requests = h.desk.requests.lock().unwrap();
        assert_eq!(requests[0].reason, EscalationReason::PolicyException);
        assert!(requests[0].detail.contains("refund_limit"));
    }

    #[tokio::test]
    async fn failed_plan_escalates_without_leaking_errors() {
        let h = harness(Orders {
            fail: true,
            ..Orders::default()
        });
        let reply = h.orchestrator.handle("s1", "order_status A1").await.unwrap();
        assert_eq!(reply.kind, ReplyKind::Handoff);
        assert!(!reply.text.contains("credentials"));
        assert_eq!(reply.text, EscalationReason::AiFailure.notice());

        let again = h.orchestrator.handle("s1", "hello there").await.unwrap();
        assert_eq!(again.state, SessionState::Escalated);
        assert_eq!(h.desk.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn explicit_request_for_a_human_escalates() {
        let h = harness(Orders::default());
        let reply = h.orchestrator.handle("s1", "escalation").await.unwrap();
        assert_eq!(reply.kind, ReplyKind::Handoff);
        let ctx = h.orchestrator.session("s1").unwrap().unwrap();
        let record = ctx.escalation.unwrap();
        assert_eq!(record.reason, EscalationReason::CustomerRequest);
        assert_eq!(record.reference, "Q-1");
    }

    #[tokio::test]
    async fn missing_parameter_is_a_clarification() {
        let h = harness(Orders::default());
        let reply = h.orchestrator.handle("s1", "order_status").await.unwrap();
        assert_eq!(reply.kind, ReplyKind::Clarification);
        assert!(reply.text.contains("order number"));
        assert_eq!(h.orders.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_stops_in_flight_turn() {
        let h = Arc::new(harness(Orders {
            delay_ms: 2_000,
            ..Orders::default()
        }));
        let turn = {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.orchestrator.handle("s1", "order_status A1").await })
        };
        let mut cancelled = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if h.orchestrator.cancel("s1") {
                cancelled = true;
                break;
            }
        }
        assert!(cancelled);
        let reply = turn.await.unwrap().unwrap();
        assert_eq!(reply.kind, ReplyKind::Cancelled);
        assert_eq!(reply.state, SessionState::Idle);
        assert!(h.desk.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn end_session_destroys_context() {
        let h = harness(Orders::default());
        h.orchestrator.handle("s1", "greeting").await.unwrap();
        assert!(h.orchestrator.session("s1").unwrap().is_some());
        h.orchestrator.end_session("s1").await.unwrap();
        assert!(h.orchestrator.session("s1").unwrap().is_none());
    }

    #[tokio::test]
    async fn lock_entries_do_not_outlive_their_turns() {
        let h = harness(Orders::default());
        h.orchestrator.handle("s1", "greeting").await.unwrap();
        h.orchestrator.handle("s2", "order_status A1").await.unwrap();
        assert!(h.orchestrator.locks.is_empty());

        h.orchestrator.end_session("s1").await.unwrap();
        assert!(h.orchestrator.locks.is_empty());
    }

    #[tokio::test]
    async fn waiting_turn_keeps_the_session_lock_alive() {
        let h = harness(Orders::default());
        let waiting = h.orchestrator.session_lock("s1");
        h.orchestrator.release_lock("s1");
        assert!(h.orchestrator.locks.contains_key("s1"));
        assert!(Arc::ptr_eq(&waiting, &h.orchestrator.session_lock("s1")));

        drop(waiting);
        h.orchestrator.release_lock("s1");
        assert!(h.orchestrator.locks.is_empty());
    }

    #[tokio::test]
    async fn expired_session_leaves_no_lock_behind() {
        let mut h = harness(Orders::default());
        h.orchestrator.config.ttl_secs = 0;
        h.orchestrator.handle("s1", "greeting").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(h.orchestrator.session("s1").unwrap().is_none());
        assert!(h.orchestrator.locks.is_empty());
    }

    #[test]
    fn degraded_replies_cover_unknown_intents() {
        assert!(degraded_response("order_status").contains("order information"));
        assert_eq!(
            degraded_response("weather"),
            "I'm experiencing technical difficulties. Please try again in a moment."
        );
    }
}
