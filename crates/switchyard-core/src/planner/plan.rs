//! Execution plans: a DAG of tool and provider steps.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};

/// What a step calls. Closed set; the planner resolves template capabilities into one
/// of these through the capability table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepTarget {
    Tool { name: String },
    Provider { capability: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Binding {
    Literal(Value),
    /// Output of an earlier step, optionally narrowed with a JSON pointer.
    StepOutput {
        step: String,
        #[serde(default)]
        pointer: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub target: StepTarget,
    #[serde(default)]
    pub inputs: BTreeMap<String, Binding>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl Step {
    pub fn new(id: impl Into<String>, target: StepTarget) -> Self {
        Self {
            id: id.into(),
            target,
            inputs: BTreeMap::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn tool(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, StepTarget::Tool { name: name.into() })
    }

    pub fn provider(id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self::new(
            id,
            StepTarget::Provider {
                capability: capability.into(),
            },
        )
    }

    pub fn input(mut self, name: impl Into<String>, binding: Binding) -> Self {
        self.inputs.insert(name.into(), binding);
        self
    }

    pub fn literal(self, name: impl Into<String>, value: Value) -> Self {
        self.input(name, Binding::Literal(value))
    }

    pub fn after(mut self, step: impl Into<String>) -> Self {
        let step = step.into();
        if !self.depends_on.contains(&step) {
            self.depends_on.push(step);
        }
        self
    }

    /// Explicit dependencies plus those implied by `StepOutput` bindings.
    fn all_dependencies(&self) -> Vec<String> {
        let mut deps = self.depends_on.clone();
        for binding in self.inputs.values() {
            if let Binding::StepOutput { step, .. } = binding {
                if !deps.contains(step) {
                    deps.push(step.clone());
                }
            }
        }
        deps
    }

    /// Resolves every binding against the outputs of completed steps.
    pub fn resolve_inputs(&self, outputs: &HashMap<String, Value>) -> CoreResult<Value> {
        let mut resolved = serde_json::Map::new();
        for (name, binding) in &self.inputs {
            let value = match binding {
                Binding::Literal(v) => v.clone(),
                Binding::StepOutput { step, pointer } => {
                    let output = outputs.get(step).ok_or_else(|| CoreError::Binding {
                        step: self.id.clone(),
                        reason: format!("no output from step {step}"),
                    })?;
                    match pointer {
                        None => output.clone(),
                        Some(p) => output.pointer(p).cloned().ok_or_else(|| CoreError::Binding {
                            step: self.id.clone(),
                            reason: format!("{p} not found in output of {step}"),
                        })?,
                    }
                }
            };
            resolved.insert(name.clone(), value);
        }
        Ok(Value::Object(resolved))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Any failure skips every step not yet started and fails the plan.
    #[default]
    FailFast,
    /// A failure skips only its dependents; independent branches continue.
    BestEffort,
}

/// Validated DAG. Only obtainable through [`PlanBuilder::build`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionPlan {
    id: String,
    intent: String,
    steps: Vec<Step>,
    failure_policy: FailurePolicy,
    response_step: Option<String>,
}

impl ExecutionPlan {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn intent(&self) -> &str {
        &self.intent
    }

    /// Steps in declaration order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    pub fn response_step(&self) -> Option<&str> {
        self.response_step.as_deref()
    }

    /// Every step `id` transitively depends on.
    pub fn dependency_closure(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            if let Some(step) = self.step(current) {
                for dep in &step.depends_on {
                    if seen.insert(dep.clone()) {
                        queue.push_back(dep.as_str());
                    }
                }
            }
        }
        seen
    }

    /// Every step that transitively depends on `id`.
    pub fn dependents_closure(&self, id: &str) -> HashSet<String> {
        self.steps
            .iter()
            .filter(|s| self.dependency_closure(&s.id).contains(id))
            .map(|s| s.id.clone())
            .collect()
    }

    /// Two steps may overlap only if neither is in the other's dependency closure.
    pub fn may_run_concurrently(&self, a: &str, b: &str) -> bool {
        a != b && !self.dependency_closure(a).contains(b) && !self.dependency_closure(b).contains(a)
    }
}

pub struct PlanBuilder {
    intent: String,
    steps: Vec<Step>,
    failure_policy: FailurePolicy,
    response_step: Option<String>,
}

impl PlanBuilder {
    pub fn new(intent: impl Into<String>) -> Self {
        Self {
            intent: intent.into(),
            steps: Vec::new(),
            failure_policy: FailurePolicy::default(),
            response_step: None,
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn response_step(mut self, id: impl Into<String>) -> Self {
        self.response_step = Some(id.into());
        self
    }

    /// Checks ids, dependencies and acyclicity (Kahn's algorithm).
    pub fn build(self) -> CoreResult<ExecutionPlan> {
        let mut steps = self.steps;
        let mut ids = HashSet::new();
        for step in &steps {
            if !ids.insert(step.id.clone()) {
                return Err(CoreError::PlanValidation(format!("duplicate step id {}", step.id)));
            }
        }
        for step in &mut steps {
            step.depends_on = step.all_dependencies();
            if let Some(missing) = step.depends_on.iter().find(|d| !ids.contains(*d)) {
                return Err(CoreError::PlanValidation(format!(
                    "step {} depends on unknown step {missing}",
                    step.id
                )));
            }
            if step.depends_on.contains(&step.id) {
                return Err(CoreError::PlanValidation(format!("step {} depends on itself", step.id)));
            }
        }
        if let Some(response) = &self.response_step {
            if !ids.contains(response) {
                return Err(CoreError::PlanValidation(format!("unknown response step {response}")));
            }
        }

        let mut indegree: HashMap<&str, usize> = steps
            .iter()
            .map(|s| (s.id.as_str(), s.depends_on.len()))
            .collect();
        let mut ready: VecDeque<&str> = steps
            .iter()
            .filter(|s| s.depends_on.is_empty())
            .map(|s| s.id.as_str())
            .collect();
        let mut visited = 0usize;
        while let Some(id) = ready.pop_front() {
            visited += 1;
            for step in steps.iter().filter(|s| s.depends_on.iter().any(|d| d == id)) {
                if let Some(n) = indegree.get_mut(step.id.as_str()) {
                    *n -= 1;
                    if *n == 0 {
                        ready.push_back(step.id.as_str());
                    }
                }
            }
        }
        if visited != steps.len() {
            return Err(CoreError::PlanValidation("dependency cycle".to_string()));
        }

        Ok(ExecutionPlan {
            id: uuid::Uuid::new_v4().to_string(),
            intent: self.intent,
            steps,
            failure_policy: self.failure_policy,
            response_step: self.response_step,
        })
    }
}
