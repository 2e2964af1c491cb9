//! In-process queue of escalated conversations waiting for a human agent.

use tokio::sync::Mutex;

use switchyard_core::{CallError, HandoffRequest, HumanHandoff};

#[derive(Debug, Clone)]
pub struct QueuedHandoff {
    pub reference: String,
    pub request: HandoffRequest,
}

#[derive(Default)]
pub struct HandoffQueue {
    queue: Mutex<Vec<QueuedHandoff>>,
}

impl HandoffQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn pending(&self) -> Vec<QueuedHandoff> {
        self.queue.lock().await.clone()
    }

    /// Removes and returns the oldest waiting conversation.
    pub async fn take_next(&self) -> Option<QueuedHandoff> {
        let mut queue = self.queue.lock().await;
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }
}

#[async_trait::async_trait]
impl HumanHandoff for HandoffQueue {
    async fn hand_off(&self, request: HandoffRequest) -> Result<String, CallError> {
        let reference = format!("HQ-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        tracing::info!(
            target: "switchyard::skills",
            session_id = %request.session_id,
            reason = ?request.reason,
            %reference,
            "conversation queued for a human"
        );
        self.queue.lock().await.push(QueuedHandoff {
            reference: reference.clone(),
            request,
        });
        Ok(reference)
    }
}
