//! Blueprints: intent -> plan templates over abstract capabilities.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::plan::{Binding, FailurePolicy, StepTarget};
use crate::error::{CoreError, CoreResult};

/// Where a template step input comes from when the plan is instantiated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateBinding {
    Literal(Value),
    /// Parameter extracted by the classifier (`null` when absent and optional).
    IntentParam(String),
    /// The customer's latest message.
    UserMessage,
    StepOutput {
        step: String,
        #[serde(default)]
        pointer: Option<String>,
    },
}

impl TemplateBinding {
    fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    fn param(name: &str) -> Self {
        Self::IntentParam(name.to_string())
    }

    fn output(step: &str, pointer: Option<&str>) -> Self {
        Self::StepOutput {
            step: step.to_string(),
            pointer: pointer.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTemplate {
    pub id: String,
    pub capability: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, TemplateBinding>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl StepTemplate {
    fn new(id: &str, capability: &str) -> Self {
        Self {
            id: id.to_string(),
            capability: capability.to_string(),
            inputs: BTreeMap::new(),
            depends_on: Vec::new(),
        }
    }

    fn bind(mut self, name: &str, binding: TemplateBinding) -> Self {
        self.inputs.insert(name.to_string(), binding);
        self
    }

    fn after(mut self, step: &str) -> Self {
        self.depends_on.push(step.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    pub intent: String,
    #[serde(default)]
    pub required_params: Vec<String>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub response_step: Option<String>,
    pub steps: Vec<StepTemplate>,
}

/// Materializes a template binding into a plan binding.
pub(crate) fn instantiate_binding(
    binding: &TemplateBinding,
    params: &BTreeMap<String, Value>,
    user_message: &str,
) -> Binding {
    match binding {
        TemplateBinding::Literal(v) => Binding::Literal(v.clone()),
        TemplateBinding::IntentParam(name) => {
            Binding::Literal(params.get(name).cloned().unwrap_or(Value::Null))
        }
        TemplateBinding::UserMessage => Binding::Literal(Value::String(user_message.to_string())),
        TemplateBinding::StepOutput { step, pointer } => Binding::StepOutput {
            step: step.clone(),
            pointer: pointer.clone(),
        },
    }
}

/// Maps template capabilities to concrete step targets.
#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    entries: HashMap<String, StepTarget>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capabilities used by the built-in support blueprints.
    pub fn support_defaults() -> Self {
        let mut table = Self::new();
        table.insert("orders.lookup", StepTarget::Tool { name: "get_order".into() });
        table.insert("refunds.issue", StepTarget::Tool { name: "issue_refund".into() });
        table.insert("tickets.create", StepTarget::Tool { name: "create_ticket".into() });
        table.insert("notify.customer", StepTarget::Tool { name: "send_notification".into() });
        table.insert(
            "knowledge.search",
            StepTarget::Provider { capability: "knowledge.search".into() },
        );
        table.insert(
            "support.reply",
            StepTarget::Provider { capability: "support.reply".into() },
        );
        table
    }

    pub fn insert(&mut self, capability: impl Into<String>, target: StepTarget) {
        self.entries.insert(capability.into(), target);
    }

    pub fn resolve(&self, capability: &str) -> Option<&StepTarget> {
        self.entries.get(capability)
    }
}

/// Registry of blueprints keyed by intent id.
#[derive(Debug, Clone, Default)]
pub struct BlueprintRegistry {
    blueprints: HashMap<String, Blueprint>,
}

impl BlueprintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in customer-support blueprints.
    pub fn default_blueprint() -> Self {
        let mut registry = Self::new();
        for blueprint in default_blueprints() {
            registry.insert(blueprint);
        }
        registry
    }

    /// Parses a JSON array of blueprints.
    pub fn from_json(json: &str) -> CoreResult<Self> {
        let blueprints: Vec<Blueprint> = serde_json::from_str(json)?;
        let mut registry = Self::new();
        for blueprint in blueprints {
            registry.insert(blueprint);
        }
        Ok(registry)
    }

    /// Adds or replaces the blueprint for its intent.
    pub fn insert(&mut self, blueprint: Blueprint) {
        self.blueprints.insert(blueprint.intent.clone(), blueprint);
    }

    pub fn plan_for_intent(&self, intent: &str) -> Option<&Blueprint> {
        self.blueprints.get(intent)
    }

    pub fn intents(&self) -> Vec<String> {
        let mut intents: Vec<String> = self.blueprints.keys().cloned().collect();
        intents.sort();
        intents
    }

    /// Checks that every blueprint capability resolves in `table`.
    pub fn check_capabilities(&self, table: &CapabilityTable) -> CoreResult<()> {
        for blueprint in self.blueprints.values() {
            for step in &blueprint.steps {
                if table.resolve(&step.capability).is_none() {
                    return Err(CoreError::PlanValidation(format!(
                        "blueprint {} step {} uses unknown capability {}",
                        blueprint.intent, step.id, step.capability
                    )));
                }
            }
        }
        Ok(())
    }
}

fn reply(instruction: &str) -> StepTemplate {
    StepTemplate::new("reply", "support.reply")
        .bind("instruction", TemplateBinding::literal(instruction))
        .bind("message", TemplateBinding::UserMessage)
}

fn default_blueprints() -> Vec<Blueprint> {
    vec![
        Blueprint {
            intent: "greeting".into(),
            required_params: vec![],
            failure_policy: FailurePolicy::FailFast,
            response_step: Some("reply".into()),
            steps: vec![reply("Greet the customer warmly and ask how you can help.")],
        },
        Blueprint {
            intent: "order_status".into(),
            required_params: vec!["order_id".into()],
            failure_policy: FailurePolicy::FailFast,
            response_step: Some("reply".into()),
            steps: vec![
                StepTemplate::new("lookup", "orders.lookup")
                    .bind("order_id", TemplateBinding::param("order_id")),
                reply("Tell the customer the current status of their order.")
                    .bind("order", TemplateBinding::output("lookup", None)),
            ],
        },
        Blueprint {
            intent: "returns_refunds".into(),
            required_params: vec!["order_id".into(), "amount".into()],
            failure_policy: FailurePolicy::FailFast,
            response_step: Some("reply".into()),
            steps: vec![
                StepTemplate::new("lookup", "orders.lookup")
                    .bind("order_id", TemplateBinding::param("order_id")),
                StepTemplate::new("policy", "knowledge.search")
                    .bind("instruction", TemplateBinding::literal("refund policy"))
                    .bind("query", TemplateBinding::literal("refund and return policy")),
                StepTemplate::new("refund", "refunds.issue")
                    .bind("order_id", TemplateBinding::param("order_id"))
                    .bind("amount", TemplateBinding::param("amount"))
                    .bind("reason", TemplateBinding::UserMessage)
                    .after("lookup"),
                StepTemplate::new("notify", "notify.customer")
                    .bind("order_id", TemplateBinding::param("order_id"))
                    .bind("template", TemplateBinding::literal("refund_issued"))
                    .bind("refund", TemplateBinding::output("refund", None)),
                reply("Confirm the refund to the customer and summarise the return policy.")
                    .bind("refund", TemplateBinding::output("refund", None))
                    .bind("policy", TemplateBinding::output("policy", Some("/content"))),
            ],
        },
        Blueprint {
            intent: "ticket_creation".into(),
            required_params: vec![],
            failure_policy: FailurePolicy::FailFast,
            response_step: Some("reply".into()),
            steps: vec![
                StepTemplate::new("ticket", "tickets.create")
                    .bind("subject", TemplateBinding::param("subject"))
                    .bind("description", TemplateBinding::UserMessage)
                    .bind("priority", TemplateBinding::literal(json!("normal"))),
                reply("Tell the customer a support ticket was opened and share its reference.")
                    .bind("ticket", TemplateBinding::output("ticket", None)),
            ],
        },
        Blueprint {
            intent: "product_info".into(),
            required_params: vec![],
            failure_policy: FailurePolicy::FailFast,
            response_step: Some("reply".into()),
            steps: vec![
                StepTemplate::new("search", "knowledge.search")
                    .bind("instruction", TemplateBinding::literal("product information"))
                    .bind("query", TemplateBinding::UserMessage),
                reply("Answer the product question using only the provided passages.")
                    .bind("passages", TemplateBinding::output("search", Some("/content"))),
            ],
        },
        Blueprint {
            intent: "general_inquiry".into(),
            required_params: vec![],
            failure_policy: FailurePolicy::BestEffort,
            response_step: Some("reply".into()),
            steps: vec![
                StepTemplate::new("search", "knowledge.search")
                    .bind("instruction", TemplateBinding::literal("general help"))
                    .bind("query", TemplateBinding::UserMessage),
                reply("Answer the customer's question helpfully and concisely."),
            ],
        },
    ]
}
