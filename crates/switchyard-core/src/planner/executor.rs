//! Runs a validated plan: ready steps start in declaration order, at most
//! `max_parallelism` at a time, inside one cancellable task group.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::plan::{ExecutionPlan, FailurePolicy, Step, StepTarget};
use crate::error::{CoreError, CoreResult};
use crate::events::{CoreEvent, SharedSink};
use crate::idempotency::IdempotencyKey;
use crate::orchestrator::SessionSnapshot;
use crate::providers::{ProviderRequest, ProviderRouter};
use crate::tools::{ToolDispatcher, ToolRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Succeeded,
    PartiallySucceeded,
    Failed,
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub id: String,
    pub state: StepState,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanReport {
    pub plan_id: String,
    pub intent: String,
    pub status: PlanStatus,
    /// Declaration order.
    pub steps: Vec<StepRecord>,
    /// Ids of steps that reached Succeeded or Failed, in the order they did.
    pub completion_order: Vec<String>,
    pub elapsed_ms: u64,
}

impl PlanReport {
    pub fn step(&self, id: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn output(&self, id: &str) -> Option<&Value> {
        self.step(id).and_then(|s| s.output.as_ref())
    }

    /// Succeeded outputs in completion order.
    pub fn outputs_in_completion_order(&self) -> Vec<(&str, &Value)> {
        self.completion_order
            .iter()
            .filter_map(|id| self.output(id).map(|v| (id.as_str(), v)))
            .collect()
    }
}

struct StepDone {
    id: String,
    result: CoreResult<Value>,
    latency: Duration,
}

/// Executes plan steps against the provider router and tool dispatcher.
#[derive(Clone)]
pub struct PlanExecutor {
    providers: Arc<ProviderRouter>,
    tools: Arc<ToolDispatcher>,
    events: SharedSink,
    max_parallelism: usize,
}

impl PlanExecutor {
    pub fn new(
        providers: Arc<ProviderRouter>,
        tools: Arc<ToolDispatcher>,
        events: SharedSink,
        max_parallelism: usize,
    ) -> Self {
        Self {
            providers,
            tools,
            events,
            max_parallelism: max_parallelism.max(1),
        }
    }

    fn run_step<'a>(
        &'a self,
        step: &'a Step,
        input: Value,
        session_id: &'a str,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, StepDone> {
        Box::pin(async move {
            let started = Instant::now();
            let key = IdempotencyKey::derive(session_id, &step.id, &input);
            let result = match &step.target {
                StepTarget::Tool { name } => {
                    let request = ToolRequest {
                        session_id: session_id.to_string(),
                        step_id: step.id.clone(),
                        input,
                    };
                    self.tools
                        .call(name, &request, &key, &cancel)
                        .await
                        .map(|r| r.output)
                }
                StepTarget::Provider { capability } => {
                    let prompt = input
                        .get("instruction")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let request = ProviderRequest {
                        capability: capability.clone(),
                        prompt,
                        input,
                    };
                    self.providers
                        .invoke(capability, &request, &key, &cancel)
                        .await
                        .map(|r| r.to_output())
                }
            };
            StepDone {
                id: step.id.clone(),
                result,
                latency: started.elapsed(),
            }
        })
    }

    /// Runs `plan` to a terminal status. Never returns early with in-flight work: on
    /// budget expiry or cancellation the task group is cancelled and drained first, so
    /// every step observes the cancellation and releases what it holds.
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        snapshot: &SessionSnapshot,
        cancel: &CancellationToken,
        budget: Duration,
    ) -> PlanReport {
        let started = Instant::now();
        let plan_id = plan.id().to_string();
        let group_cancel = cancel.child_token();
        let mut states: HashMap<&str, StepState> = plan
            .steps()
            .iter()
            .map(|s| (s.id.as_str(), StepState::Pending))
            .collect();
        let mut outputs: HashMap<String, Value> = HashMap::new();
        let mut errors: HashMap<String, String> = HashMap::new();
        let mut latencies: HashMap<String, u64> = HashMap::new();
        let mut completion_order = Vec::new();
        let mut halted = false;
        let mut interrupted: Option<PlanStatus> = None;

        let mut in_flight: FuturesUnordered<BoxFuture<'_, StepDone>> = FuturesUnordered::new();
        let deadline = tokio::time::sleep(budget);
        tokio::pin!(deadline);

        tracing::info!(target: "switchyard::executor", plan_id = %plan_id, intent = %plan.intent(), steps = plan.steps().len(), "executing plan");

        loop {
            if cancel.is_cancelled() {
                interrupted = Some(PlanStatus::Cancelled);
                break;
            }
            self.skip_blocked(plan, &mut states, halted);

            if !halted {
                for step in plan.steps() {
                    if in_flight.len() >= self.max_parallelism {
                        break;
                    }
                    if states.get(step.id.as_str()) != Some(&StepState::Pending) {
                        continue;
                    }
                    let ready = step
                        .depends_on
                        .iter()
                        .all(|d| states.get(d.as_str()) == Some(&StepState::Succeeded));
                    if !ready {
                        continue;
                    }
                    match step.resolve_inputs(&outputs) {
                        Ok(input) => {
                            states.insert(step.id.as_str(), StepState::Running);
                            self.events.emit(CoreEvent::StepStarted {
                                plan_id: plan_id.clone(),
                                step_id: step.id.clone(),
                            });
                            tracing::debug!(target: "switchyard::executor", plan_id = %plan_id, step = %step.id, "step started");
                            in_flight.push(self.run_step(
                                step,
                                input,
                                &snapshot.session_id,
                                group_cancel.clone(),
                            ));
                        }
                        Err(e) => {
                            self.record_failure(&plan_id, &step.id, &e, &mut states, &mut errors);
                            completion_order.push(step.id.clone());
                            if plan.failure_policy() == FailurePolicy::FailFast {
                                halted = true;
                                break;
                            }
                        }
                    }
                }
                self.skip_blocked(plan, &mut states, halted);
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    interrupted = Some(PlanStatus::Cancelled);
                    break;
                }
                _ = &mut deadline => {
                    interrupted = Some(PlanStatus::TimedOut);
                    break;
                }
                Some(done) = in_flight.next() => {
                    latencies.insert(done.id.clone(), done.latency.as_millis() as u64);
                    completion_order.push(done.id.clone());
                    let Some((step_id, _)) = states.get_key_value(done.id.as_str()).map(|(k, v)| (*k, *v)) else {
                        continue;
                    };
                    match done.result {
                        Ok(output) => {
                            states.insert(step_id, StepState::Succeeded);
                            self.events.emit(CoreEvent::StepSucceeded {
                                plan_id: plan_id.clone(),
                                step_id: done.id.clone(),
                                latency_ms: done.latency.as_millis() as u64,
                            });
                            outputs.insert(done.id, output);
                        }
                        Err(e) => {
                            self.record_failure(&plan_id, step_id, &e, &mut states, &mut errors);
                            if plan.failure_policy() == FailurePolicy::FailFast {
                                halted = true;
                            }
                        }
                    }
                }
            }
        }

        if let Some(status) = interrupted {
            group_cancel.cancel();
            while in_flight.next().await.is_some() {}
            let reason = match status {
                PlanStatus::TimedOut => "plan budget exceeded",
                _ => "cancelled",
            };
            for step in plan.steps() {
                match states.get(step.id.as_str()) {
                    Some(StepState::Running) => {
                        states.insert(step.id.as_str(), StepState::Failed);
                        errors.insert(step.id.clone(), reason.to_string());
                        self.events.emit(CoreEvent::StepFailed {
                            plan_id: plan_id.clone(),
                            step_id: step.id.clone(),
                            error: reason.to_string(),
                        });
                    }
                    Some(StepState::Pending) => {
                        states.insert(step.id.as_str(), StepState::Skipped);
                        self.emit_skipped(&plan_id, &step.id);
                    }
                    _ => {}
                }
            }
        } else {
            drop(in_flight);
        }

        let any_failed = states.values().any(|s| *s == StepState::Failed);
        let any_succeeded = states.values().any(|s| *s == StepState::Succeeded);
        let status = match interrupted {
            Some(status) => status,
            None if !any_failed => PlanStatus::Succeeded,
            None => match plan.failure_policy() {
                FailurePolicy::BestEffort if any_succeeded => PlanStatus::PartiallySucceeded,
                _ => PlanStatus::Failed,
            },
        };

        let steps = plan
            .steps()
            .iter()
            .map(|s| StepRecord {
                id: s.id.clone(),
                state: states
                    .get(s.id.as_str())
                    .copied()
                    .unwrap_or(StepState::Pending),
                output: outputs.get(&s.id).cloned(),
                error: errors.get(&s.id).cloned(),
                latency_ms: latencies.get(&s.id).copied().unwrap_or(0),
            })
            .collect();

        self.events.emit(CoreEvent::PlanFinished {
            plan_id: plan_id.clone(),
            status,
        });
        tracing::info!(
            target: "switchyard::executor",
            plan_id = %plan_id,
            ?status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "plan finished"
        );

        PlanReport {
            plan_id,
            intent: plan.intent().to_string(),
            status,
            steps,
            completion_order,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Marks Pending steps Skipped: all of them once a fail-fast plan halted, otherwise
    /// those with a Failed or Skipped dependency.
    fn skip_blocked<'p>(
        &self,
        plan: &'p ExecutionPlan,
        states: &mut HashMap<&'p str, StepState>,
        halted: bool,
    ) {
        loop {
            let mut changed = false;
            for step in plan.steps() {
                if states.get(step.id.as_str()) != Some(&StepState::Pending) {
                    continue;
                }
                let blocked = halted
                    || step.depends_on.iter().any(|d| {
                        matches!(
                            states.get(d.as_str()),
                            Some(StepState::Failed) | Some(StepState::Skipped)
                        )
                    });
                if blocked {
                    states.insert(step.id.as_str(), StepState::Skipped);
                    self.emit_skipped(plan.id(), &step.id);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn record_failure<'p>(
        &self,
        plan_id: &str,
        step_id: &'p str,
        error: &CoreError,
        states: &mut HashMap<&'p str, StepState>,
        errors: &mut HashMap<String, String>,
    ) {
        states.insert(step_id, StepState::Failed);
        errors.insert(step_id.to_string(), error.to_string());
        tracing::warn!(target: "switchyard::executor", %plan_id, step = %step_id, %error, "step failed");
        self.events.emit(CoreEvent::StepFailed {
            plan_id: plan_id.to_string(),
            step_id: step_id.to_string(),
            error: error.to_string(),
        });
    }

    fn emit_skipped(&self, plan_id: &str, step_id: &str) {
        tracing::debug!(target: "switchyard::executor", %plan_id, step = %step_id, "step skipped");
        self.events.emit(CoreEvent::StepSkipped {
            plan_id: plan_id.to_string(),
            step_id: step_id.to_string(),
        });
    }
}
