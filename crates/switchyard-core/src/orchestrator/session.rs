//! Per-session context, its state machine, and persistence through the KV store.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::handoff::EscalationReason;
use crate::error::{CoreError, CoreResult};
use crate::store::{get_json, KvStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Classifying,
    Planning,
    Executing,
    Responding,
    /// Terminal for automated handling; a human owns the conversation.
    Escalated,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Escalated, _) => false,
            (_, Escalated) => true,
            (Idle, Classifying)
            | (Classifying, Planning)
            | (Classifying, Responding)
            | (Planning, Executing)
            | (Planning, Responding)
            | (Executing, Responding)
            | (Responding, Idle) => true,
            // Turn abandoned (cancelled or failed before a reply was assembled).
            (Classifying, Idle) | (Planning, Idle) | (Executing, Idle) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Classifying => "classifying",
            SessionState::Planning => "planning",
            SessionState::Executing => "executing",
            SessionState::Responding => "responding",
            SessionState::Escalated => "escalated",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub reason: EscalationReason,
    pub reference: String,
    pub at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle sessions older than this are destroyed on next access.
    pub ttl_secs: u64,
    /// Turns included in snapshots handed to lower layers.
    pub history_window: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 1800,
            history_window: 10,
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Mutable state of one conversation. Only the orchestrator writes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    pub state: SessionState,
    pub turns: Vec<Turn>,
    /// Step outputs keyed by `<intent>.<step>`, folded in completion order.
    pub plan_outputs: BTreeMap<String, Value>,
    pub clarification_streak: u32,
    pub last_intent: Option<String>,
    pub escalation: Option<EscalationRecord>,
    /// Bumped on every save; guards against lost updates.
    pub version: u64,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            session_id: session_id.into(),
            state: SessionState::Idle,
            turns: Vec::new(),
            plan_outputs: BTreeMap::new(),
            clarification_streak: 0,
            last_intent: None,
            escalation: None,
            version: 0,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    /// Moves to `next`, rejecting transitions the state machine does not allow.
    pub fn transition(&mut self, next: SessionState) -> CoreResult<SessionState> {
        let from = self.state;
        if !from.can_transition_to(next) {
            return Err(CoreError::IllegalTransition {
                from: from.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.updated_at_ms = now_ms();
        Ok(from)
    }

    pub fn push_turn(&mut self, role: Role, text: impl Into<String>) {
        self.turns.push(Turn {
            role,
            text: text.into(),
            at_ms: now_ms(),
        });
        self.updated_at_ms = now_ms();
    }

    pub fn is_expired(&self, ttl_secs: u64, now: u64) -> bool {
        now.saturating_sub(self.updated_at_ms) > ttl_secs.saturating_mul(1000)
    }

    pub fn snapshot(&self, history_window: usize) -> SessionSnapshot {
        let skip = self.turns.len().saturating_sub(history_window);
        SessionSnapshot {
            session_id: self.session_id.clone(),
            turns: self.turns[skip..].to_vec(),
            plan_outputs: self.plan_outputs.clone(),
            clarification_streak: self.clarification_streak,
            last_intent: self.last_intent.clone(),
        }
    }
}

/// Read-only view handed to the intent router, planner and executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub turns: Vec<Turn>,
    pub plan_outputs: BTreeMap<String, Value>,
    pub clarification_streak: u32,
    pub last_intent: Option<String>,
}

impl SessionSnapshot {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    pub fn latest_user_message(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.text.as_str())
    }
}

/// Persists session contexts under `session/<id>` with optimistic versioning.
#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn KvStore>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    fn key(session_id: &str) -> String {
        format!("session/{session_id}")
    }

    /// Loads a context, destroying it first if it outlived `ttl_secs`.
    pub fn load(&self, session_id: &str, ttl_secs: u64) -> CoreResult<Option<SessionContext>> {
        let ctx: Option<SessionContext> = get_json(self.store.as_ref(), &Self::key(session_id))?;
        match ctx {
            Some(ctx) if ctx.is_expired(ttl_secs, now_ms()) => {
                tracing::info!(target: "switchyard::orchestrator", %session_id, "session expired");
                self.destroy(session_id)?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    /// Writes `ctx` if nobody saved a newer version since it was loaded.
    pub fn save(&self, ctx: &mut SessionContext) -> CoreResult<()> {
        let key = Self::key(&ctx.session_id);
        let current = self.store.get(&key)?;
        if let Some(bytes) = &current {
            let stored: SessionContext = serde_json::from_slice(bytes)?;
            if stored.version != ctx.version {
                return Err(CoreError::Storage(format!(
                    "session {} was modified concurrently (stored v{}, local v{})",
                    ctx.session_id, stored.version, ctx.version
                )));
            }
        }
        let mut next = ctx.clone();
        next.version += 1;
        let bytes = serde_json::to_vec(&next)?;
        if !self
            .store
            .compare_and_swap(&key, current.as_deref(), Some(&bytes))?
        {
            return Err(CoreError::Storage(format!(
                "session {} was modified concurrently",
                ctx.session_id
            )));
        }
        ctx.version = next.version;
        Ok(())
    }

    pub fn destroy(&self, session_id: &str) -> CoreResult<()> {
        self.store.remove(&Self::key(session_id))
    }
}
