//! Support integrations (orders, refunds, tickets, notifications) over an in-memory
//! backend that stands in for the commerce platform and helpdesk.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};
use switchyard_core::{CallError, IdempotencyKey, Tool, ToolRegistry, ToolRequest};

/// Shared state behind the support tools.
#[derive(Default)]
pub struct SupportBackend {
    orders: DashMap<String, Value>,
    /// Refunds keyed by idempotency key; the platform deduplicates on it.
    refunds: DashMap<String, Value>,
    tickets: DashMap<String, Value>,
    notifications: AtomicU64,
    /// Pending transient failures per tool name.
    outages: DashMap<String, u32>,
}

impl SupportBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend seeded with a few demo orders.
    pub fn demo() -> Self {
        let backend = Self::new();
        backend.add_order(json!({"order_id": "A100", "status": "shipped", "total": 59.90, "estimated_delivery": "Friday"}));
        backend.add_order(json!({"order_id": "A101", "status": "processing", "total": 120.00}));
        backend.add_order(json!({"order_id": "A102", "status": "delivered", "total": 35.00}));
        backend
    }

    pub fn add_order(&self, order: Value) {
        if let Some(id) = order.get("order_id").and_then(Value::as_str) {
            self.orders.insert(id.to_string(), order.clone());
        }
    }

    /// Makes the next `n` calls to `tool` fail transiently.
    pub fn inject_outage(&self, tool: &str, n: u32) {
        self.outages.insert(tool.to_string(), n);
    }

    pub fn refunds_issued(&self) -> usize {
        self.refunds.len()
    }

    pub fn tickets_opened(&self) -> usize {
        self.tickets.len()
    }

    pub fn notifications_sent(&self) -> u64 {
        self.notifications.load(Ordering::SeqCst)
    }

    fn check_outage(&self, tool: &str) -> Result<(), CallError> {
        if let Some(mut remaining) = self.outages.get_mut(tool) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CallError::transient(format!("{tool} backend unavailable")));
            }
        }
        Ok(())
    }
}

fn required_str<'a>(input: &'a Value, field: &str) -> Result<&'a str, CallError> {
    input
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CallError::permanent(format!("missing field {field}")))
}

fn short_id(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &id[..8]).to_uppercase()
}

pub struct GetOrder {
    backend: Arc<SupportBackend>,
}

impl GetOrder {
    pub fn new(backend: Arc<SupportBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait::async_trait]
impl Tool for GetOrder {
    fn name(&self) -> &str {
        "get_order"
    }

    async fn call(&self, request: &ToolRequest, _key: &IdempotencyKey) -> Result<Value, CallError> {
        self.backend.check_outage(self.name())?;
        let order_id = required_str(&request.input, "order_id")?;
        self.backend
            .orders
            .get(order_id)
            .map(|o| o.value().clone())
            .ok_or_else(|| CallError::permanent(format!("order {order_id} not found")))
    }
}

/// Issues refunds. The platform deduplicates on the idempotency key, so retries after a
/// timeout are safe.
pub struct IssueRefund {
    backend: Arc<SupportBackend>,
}

impl IssueRefund {
    pub fn new(backend: Arc<SupportBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait::async_trait]
impl Tool for IssueRefund {
    fn name(&self) -> &str {
        "issue_refund"
    }

    fn mutating(&self) -> bool {
        true
    }

    fn supports_idempotency(&self) -> bool {
        true
    }

    async fn call(&self, request: &ToolRequest, key: &IdempotencyKey) -> Result<Value, CallError> {
        if let Some(existing) = self.backend.refunds.get(key.as_str()) {
            return Ok(existing.value().clone());
        }
        self.backend.check_outage(self.name())?;
        let order_id = required_str(&request.input, "order_id")?;
        if !self.backend.orders.contains_key(order_id) {
            return Err(CallError::permanent(format!("order {order_id} not found")));
        }
        let amount = request
            .input
            .get("amount")
            .and_then(Value::as_f64)
            .ok_or_else(|| CallError::permanent("amount must be a number"))?;
        let refund = json!({
            "refund_id": short_id("rf"),
            "order_id": order_id,
            "amount": amount,
            "status": "issued",
        });
        let stored = self
            .backend
            .refunds
            .entry(key.as_str().to_string())
            .or_insert(refund)
            .value()
            .clone();
        tracing::info!(target: "switchyard::skills", %order_id, amount, "refund issued");
        Ok(stored)
    }
}

pub struct CreateTicket {
    backend: Arc<SupportBackend>,
}

impl CreateTicket {
    pub fn new(backend: Arc<SupportBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait::async_trait]
impl Tool for CreateTicket {
    fn name(&self) -> &str {
        "create_ticket"
    }

    fn mutating(&self) -> bool {
        true
    }

    async fn call(&self, request: &ToolRequest, _key: &IdempotencyKey) -> Result<Value, CallError> {
        self.backend.check_outage(self.name())?;
        let subject = request
            .input
            .get("subject")
            .and_then(Value::as_str)
            .unwrap_or("Customer request");
        let description = required_str(&request.input, "description")?;
        let ticket_id = short_id("tck");
        let ticket = json!({
            "ticket_id": ticket_id,
            "subject": subject,
            "description": description,
            "priority": request.input.get("priority").cloned().unwrap_or(json!("normal")),
            "session_id": request.session_id,
        });
        self.backend.tickets.insert(ticket_id, ticket.clone());
        Ok(ticket)
    }
}

pub struct SendNotification {
    backend: Arc<SupportBackend>,
}

impl SendNotification {
    pub fn new(backend: Arc<SupportBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait::async_trait]
impl Tool for SendNotification {
    fn name(&self) -> &str {
        "send_notification"
    }

    fn mutating(&self) -> bool {
        true
    }

    async fn call(&self, request: &ToolRequest, _key: &IdempotencyKey) -> Result<Value, CallError> {
        self.backend.check_outage(self.name())?;
        let template = required_str(&request.input, "template")?;
        let sent = self.backend.notifications.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!({ "template": template, "channel": "email", "message_no": sent }))
    }
}

/// Registry with every support tool bound to `backend`.
pub fn support_tools(backend: Arc<SupportBackend>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(GetOrder::new(backend.clone())));
    registry.register(Arc::new(IssueRefund::new(backend.clone())));
    registry.register(Arc::new(CreateTicket::new(backend.clone())));
    registry.register(Arc::new(SendNotification::new(backend)));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(input: Value) -> ToolRequest {
        ToolRequest {
            session_id: "s1".into(),
            step_id: "refund".into(),
            input,
        }
    }

    #[tokio::test]
    async fn refund_is_deduplicated_on_key() {
        let backend = Arc::new(SupportBackend::demo());
        let tool = IssueRefund::new(backend.clone());
        let key = IdempotencyKey::from_raw("refund-key");
        let input = json!({"order_id": "A100", "amount": 20.0});
        let first = tool.call(&request(input.clone()), &key).await.unwrap();
        let second = tool.call(&request(input), &key).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.refunds_issued(), 1);
    }

    #[tokio::test]
    async fn unknown_order_is_permanent() {
        let tool = GetOrder::new(Arc::new(SupportBackend::demo()));
        let err = tool
            .call(&request(json!({"order_id": "Z999"})), &IdempotencyKey::from_raw("k"))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn injected_outage_is_transient_then_clears() {
        let backend = Arc::new(SupportBackend::demo());
        backend.inject_outage("get_order", 1);
        let tool = GetOrder::new(backend);
        let key = IdempotencyKey::from_raw("k");
        let input = request(json!({"order_id": "A100"}));
        assert!(tool.call(&input, &key).await.unwrap_err().is_transient());
        assert_eq!(tool.call(&input, &key).await.unwrap()["status"], json!("shipped"));
    }

    #[test]
    fn registry_exposes_all_support_tools() {
        let registry = support_tools(Arc::new(SupportBackend::new()));
        let mut names = registry.tool_names();
        names.sort();
        assert_eq!(
            names,
            vec!["create_ticket", "get_order", "issue_refund", "send_notification"]
        );
    }
}
