//! Structured observability events. Sinks are fire-and-forget: `emit` never blocks
//! and never reports failure back into the core path.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::orchestrator::SessionState;
use crate::planner::PlanStatus;
use crate::providers::GuardrailViolation;
use crate::resilience::CircuitState;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    StepStarted {
        plan_id: String,
        step_id: String,
    },
    StepSucceeded {
        plan_id: String,
        step_id: String,
        latency_ms: u64,
    },
    StepFailed {
        plan_id: String,
        step_id: String,
        error: String,
    },
    StepSkipped {
        plan_id: String,
        step_id: String,
    },
    CircuitTransition {
        target: String,
        from: CircuitState,
        to: CircuitState,
    },
    GuardrailViolation(GuardrailViolation),
    PlanFinished {
        plan_id: String,
        status: PlanStatus,
    },
    SessionTransition {
        session_id: String,
        from: SessionState,
        to: SessionState,
    },
}

/// Receiver of core events (metrics exporters, audit logs, UIs).
pub trait EventSink: Send + Sync {
    fn emit(&self, event: CoreEvent);
}

pub type SharedSink = Arc<dyn EventSink>;

/// Writes every event to `tracing` under the `switchyard::events` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: CoreEvent) {
        match &event {
            CoreEvent::StepFailed { .. } | CoreEvent::GuardrailViolation(_) => {
                tracing::warn!(target: "switchyard::events", event = ?event, "core event");
            }
            CoreEvent::CircuitTransition { target, from, to } => {
                tracing::info!(target: "switchyard::events", %target, ?from, ?to, "circuit transition");
            }
            _ => tracing::debug!(target: "switchyard::events", event = ?event, "core event"),
        }
    }
}

/// Publishes events on a lossy broadcast channel; slow or absent receivers are ignored.
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<CoreEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }
}

/// Forwards every event to each inner sink in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<SharedSink>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: SharedSink) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: CoreEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}

/// Default sink used when none is configured.
pub fn tracing_sink() -> SharedSink {
    Arc::new(TracingSink)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Collects events in memory for assertions.
    #[derive(Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<CoreEvent>>,
    }

    impl RecordingSink {
        pub fn events(&self) -> Vec<CoreEvent> {
            self.events.lock().map(|e| e.clone()).unwrap_or_default()
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: CoreEvent) {
            if let Ok(mut events) = self.events.lock() {
                events.push(event);
            }
        }
    }
}
