//! Domain rules: pure checks every plan must pass before it may execute.

use serde_json::Value;

use super::plan::{Binding, ExecutionPlan, StepTarget};
use crate::orchestrator::SessionSnapshot;

/// Synchronous, side-effect free plan check. `Err` carries the rejection reason.
pub trait DomainRule: Send + Sync {
    fn name(&self) -> &str;

    fn check(&self, plan: &ExecutionPlan, context: &SessionSnapshot) -> Result<(), String>;
}

/// Rejects refund steps whose literal amount exceeds the automated limit.
pub struct RefundLimitRule {
    tool: String,
    limit: f64,
}

impl RefundLimitRule {
    pub fn new(tool: impl Into<String>, limit: f64) -> Self {
        Self {
            tool: tool.into(),
            limit,
        }
    }
}

fn as_amount(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_start_matches('$').parse().ok(),
        _ => None,
    }
}

impl DomainRule for RefundLimitRule {
    fn name(&self) -> &str {
        "refund_limit"
    }

    fn check(&self, plan: &ExecutionPlan, _context: &SessionSnapshot) -> Result<(), String> {
        for step in plan.steps() {
            let StepTarget::Tool { name } = &step.target else {
                continue;
            };
            if *name != self.tool {
                continue;
            }
            match step.inputs.get("amount") {
                Some(Binding::Literal(v)) => match as_amount(v) {
                    Some(amount) if amount < 0.0 => {
                        return Err(format!("refund amount {amount} is negative"))
                    }
                    Some(amount) if amount > self.limit => {
                        return Err(format!(
                            "refund amount {amount:.2} exceeds automated limit {:.2}",
                            self.limit
                        ))
                    }
                    Some(_) => {}
                    None => return Err(format!("refund amount {v} is not a number")),
                },
                Some(Binding::StepOutput { .. }) => {
                    return Err("refund amount must be known before execution".to_string())
                }
                None => return Err("refund step has no amount".to_string()),
            }
        }
        Ok(())
    }
}

pub struct MaxStepsRule {
    max: usize,
}

impl MaxStepsRule {
    pub fn new(max: usize) -> Self {
        Self { max }
    }
}

impl DomainRule for MaxStepsRule {
    fn name(&self) -> &str {
        "max_steps"
    }

    fn check(&self, plan: &ExecutionPlan, _context: &SessionSnapshot) -> Result<(), String> {
        if plan.steps().len() > self.max {
            return Err(format!(
                "plan has {} steps, limit is {}",
                plan.steps().len(),
                self.max
            ));
        }
        Ok(())
    }
}
