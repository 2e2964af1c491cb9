//! Deterministic idempotency keys for side-effecting steps.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// SHA-256 hex digest over (session id, step id, canonical input). Stable across restarts
/// so a replayed step presents the same key to the integration and the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn derive(session_id: &str, step_id: &str, input: &serde_json::Value) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(session_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(step_id.as_bytes());
        hasher.update([0u8]);
        // serde_json keeps object keys sorted (no preserve_order), so this is canonical.
        hasher.update(input.to_string().as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wraps a caller-supplied key (read-only calls, tests).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
