//! Execution planner: turns a confident intent into a validated, policy-checked plan.
//! Planning is synchronous and makes no external calls.

mod blueprint;
mod executor;
mod plan;
mod policy;

pub use blueprint::{Blueprint, BlueprintRegistry, CapabilityTable, StepTemplate, TemplateBinding};
pub use executor::{PlanExecutor, PlanReport, PlanStatus, StepRecord, StepState};
pub use plan::{Binding, ExecutionPlan, FailurePolicy, PlanBuilder, Step, StepTarget};
pub use policy::{DomainRule, MaxStepsRule, RefundLimitRule};

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::intent::{ConfidenceScore, Intent};
use crate::orchestrator::SessionSnapshot;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub confidence_threshold: f64,
    /// Steps of one plan in flight at once.
    pub max_parallelism: usize,
    /// Wall-clock budget for a whole plan.
    pub plan_budget_ms: u64,
    /// Largest refund issued without a human.
    pub refund_limit: f64,
    pub max_steps: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            max_parallelism: 4,
            plan_budget_ms: 60_000,
            refund_limit: 500.0,
            max_steps: 12,
        }
    }
}

impl PlannerConfig {
    pub fn plan_budget(&self) -> Duration {
        Duration::from_millis(self.plan_budget_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ClarifyReason {
    LowConfidence { score: f64 },
    UnknownIntent { intent: String },
    MissingParameters { names: Vec<String> },
}

/// Returned instead of a plan when the request cannot be acted on yet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClarificationRequest {
    pub reason: ClarifyReason,
    pub question: String,
}

impl ClarificationRequest {
    pub fn low_confidence(score: f64) -> Self {
        Self {
            reason: ClarifyReason::LowConfidence { score },
            question: "I want to make sure I understand. Could you tell me a bit more about what you need help with?".to_string(),
        }
    }

    fn unknown_intent(intent: &str) -> Self {
        Self {
            reason: ClarifyReason::UnknownIntent {
                intent: intent.to_string(),
            },
            question: "I'm not sure I can help with that yet. Could you rephrase, or tell me if it's about an order, a return, or a product?".to_string(),
        }
    }

    fn missing(names: Vec<String>) -> Self {
        let asks: Vec<&str> = names.iter().map(|n| param_question(n)).collect();
        Self {
            question: asks.join(" "),
            reason: ClarifyReason::MissingParameters { names },
        }
    }
}

fn param_question(name: &str) -> &'static str {
    match name {
        "order_id" => "Could you share your order number?",
        "amount" => "How much should the refund be?",
        "email" => "Which email address is on the account?",
        _ => "Could you share a few more details?",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanDecision {
    Plan(ExecutionPlan),
    Clarify(ClarificationRequest),
}

pub struct ExecutionPlanner {
    config: PlannerConfig,
    blueprints: Arc<BlueprintRegistry>,
    capabilities: CapabilityTable,
    rules: Vec<Arc<dyn DomainRule>>,
}

impl ExecutionPlanner {
    /// Planner with the built-in refund-limit and step-count rules.
    pub fn new(
        config: PlannerConfig,
        blueprints: Arc<BlueprintRegistry>,
        capabilities: CapabilityTable,
    ) -> Self {
        let rules: Vec<Arc<dyn DomainRule>> = vec![
            Arc::new(MaxStepsRule::new(config.max_steps)),
            Arc::new(RefundLimitRule::new("issue_refund", config.refund_limit)),
        ];
        Self {
            config,
            blueprints,
            capabilities,
            rules,
        }
    }

    pub fn with_rule(mut self, rule: Arc<dyn DomainRule>) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    pub fn plan(
        &self,
        intent: &Intent,
        confidence: &ConfidenceScore,
        context: &SessionSnapshot,
    ) -> CoreResult<PlanDecision> {
        if confidence.value() < self.config.confidence_threshold {
            tracing::debug!(target: "switchyard::planner", intent = %intent.id(), confidence = confidence.value(), "below threshold, clarifying");
            return Ok(PlanDecision::Clarify(ClarificationRequest::low_confidence(
                confidence.value(),
            )));
        }
        let Some(blueprint) = self.blueprints.plan_for_intent(intent.id()) else {
            return Ok(PlanDecision::Clarify(ClarificationRequest::unknown_intent(
                intent.id(),
            )));
        };
        let missing: Vec<String> = blueprint
            .required_params
            .iter()
            .filter(|p| intent.param(p).map_or(true, |v| v.is_null()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Ok(PlanDecision::Clarify(ClarificationRequest::missing(missing)));
        }

        let user_message = context.latest_user_message().unwrap_or_default();
        let mut builder =
            PlanBuilder::new(intent.id()).failure_policy(blueprint.failure_policy);
        for template in &blueprint.steps {
            let target = self
                .capabilities
                .resolve(&template.capability)
                .cloned()
                .ok_or_else(|| {
                    CoreError::PlanValidation(format!(
                        "step {} uses unknown capability {}",
                        template.id, template.capability
                    ))
                })?;
            let mut step = Step::new(template.id.clone(), target);
            for (name, binding) in &template.inputs {
                step = step.input(
                    name.clone(),
                    blueprint::instantiate_binding(binding, intent.params(), user_message),
                );
            }
            for dep in &template.depends_on {
                step = step.after(dep.clone());
            }
            builder = builder.step(step);
        }
        if let Some(response) = &blueprint.response_step {
            builder = builder.response_step(response.clone());
        }
        let plan = builder.build()?;

        for rule in &self.rules {
            if let Err(reason) = rule.check(&plan, context) {
                tracing::warn!(target: "switchyard::planner", rule = %rule.name(), %reason, intent = %intent.id(), "plan rejected");
                return Err(CoreError::PolicyViolation {
                    rule: rule.name().to_string(),
                    reason,
                });
            }
        }

        tracing::info!(target: "switchyard::planner", plan_id = %plan.id(), intent = %intent.id(), steps = plan.steps().len(), "plan built");
        Ok(PlanDecision::Plan(plan))
    }
}
