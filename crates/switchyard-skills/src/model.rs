//! Mock model provider: deterministic replies built from the step input, with optional
//! scripted outages so failover and breakers can be exercised without a vendor.

use std::sync::atomic::{AtomicU32, Ordering};

use serde_json::Value;
use switchyard_core::{CallError, IdempotencyKey, ModelProvider, ProviderRequest, ProviderResponse};

/// Environment variable that makes every mock provider fail permanently (`outage`).
const ENV_MOCK_MODE: &str = "SWITCHYARD_MOCK_MODE";

pub struct MockModelProvider {
    id: String,
    /// Remaining transient failures before the provider answers.
    flaky: AtomicU32,
    down: bool,
}

impl MockModelProvider {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            flaky: AtomicU32::new(0),
            down: matches!(std::env::var(ENV_MOCK_MODE).as_deref(), Ok("outage")),
        }
    }

    /// Fails the first `n` calls with a transient error.
    pub fn flaky(self, n: u32) -> Self {
        self.flaky.store(n, Ordering::SeqCst);
        self
    }

    /// Fails every call permanently, like a revoked API key.
    pub fn down(mut self) -> Self {
        self.down = true;
        self
    }

    fn mock_generate(&self, request: &ProviderRequest) -> String {
        let input = &request.input;
        let mut parts: Vec<String> = Vec::new();

        if let Some(order) = input.get("order").filter(|o| o.is_object()) {
            let id = order.get("order_id").and_then(Value::as_str).unwrap_or("your order");
            let status = order.get("status").and_then(Value::as_str).unwrap_or("being processed");
            parts.push(format!("Order {id} is currently {status}."));
            if let Some(eta) = order.get("estimated_delivery").and_then(Value::as_str) {
                parts.push(format!("Expected delivery is {eta}."));
            }
        }
        if let Some(refund) = input.get("refund").filter(|r| r.is_object()) {
            let id = refund.get("refund_id").and_then(Value::as_str).unwrap_or("pending");
            let amount = refund.get("amount").and_then(Value::as_f64).unwrap_or(0.0);
            parts.push(format!(
                "A refund of ${amount:.2} has been issued under reference {id}."
            ));
        }
        if let Some(ticket) = input.get("ticket").filter(|t| t.is_object()) {
            let id = ticket.get("ticket_id").and_then(Value::as_str).unwrap_or("pending");
            parts.push(format!(
                "Support ticket {id} is open and our team will get back to you soon."
            ));
        }
        for key in ["policy", "passages"] {
            if let Some(text) = input.get(key).and_then(Value::as_str) {
                parts.push(format!("Here is what our help center says: {text}"));
            }
        }
        if parts.is_empty() {
            parts.push(
                "Hello! Thanks for reaching out. How can I help you with your order, a return, or one of our products today?"
                    .to_string(),
            );
        }
        parts.join(" ")
    }
}

#[async_trait::async_trait]
impl ModelProvider for MockModelProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(
        &self,
        request: &ProviderRequest,
        _key: &IdempotencyKey,
    ) -> Result<ProviderResponse, CallError> {
        if self.down {
            return Err(CallError::permanent(format!("{} rejected credentials", self.id)));
        }
        let scripted = self
            .flaky
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted {
            return Err(CallError::transient(format!("{} returned 503", self.id)));
        }
        let content = self.mock_generate(request);
        tracing::debug!(target: "switchyard::skills", provider = %self.id, capability = %request.capability, chars = content.len(), "mock generation");
        Ok(ProviderResponse::text(content))
    }
}
