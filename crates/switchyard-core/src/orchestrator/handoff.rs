//! Human-support collaborator that takes over escalated sessions.

use serde::{Deserialize, Serialize};

use super::session::Turn;
use crate::error::CallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    /// The customer asked for a person.
    CustomerRequest,
    /// Too many clarification rounds without a confident intent.
    RepeatedAmbiguity,
    /// A domain rule rejected the requested action.
    PolicyException,
    /// Automated handling failed (providers exhausted, plan failed).
    AiFailure,
}

impl EscalationReason {
    pub fn notice(&self) -> &'static str {
        match self {
            EscalationReason::CustomerRequest => {
                "I'm connecting you with a member of our support team now."
            }
            EscalationReason::RepeatedAmbiguity => {
                "I want to make sure you get the right help, so I'm handing this conversation to a member of our support team."
            }
            EscalationReason::PolicyException => {
                "This request needs a review by our support team. I've passed it on and someone will follow up with you shortly."
            }
            EscalationReason::AiFailure => {
                "I apologize for the inconvenience. I've passed your request to our support team and someone will follow up with you shortly."
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandoffRequest {
    pub session_id: String,
    pub reason: EscalationReason,
    pub detail: String,
    pub last_intent: Option<String>,
    pub recent_turns: Vec<Turn>,
}

#[async_trait::async_trait]
pub trait HumanHandoff: Send + Sync {
    /// Queues the session for a human and returns a reference (ticket or queue id).
    async fn hand_off(&self, request: HandoffRequest) -> Result<String, CallError>;
}
