//! "Already attempted" ledger for mutating tool calls. Entries live in the KV store so
//! the at-most-once guarantee survives restarts.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreResult;
use crate::idempotency::IdempotencyKey;
use crate::store::{get_json, KvStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LedgerEntry {
    /// Claimed; the call may be in flight or the process died mid-call.
    Attempted { tool: String },
    /// The call may or may not have reached the external system.
    Uncertain { tool: String, reason: String },
    Completed { tool: String, output: Value },
}

/// (session, step, key) triple identifying one logical mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerScope<'a> {
    pub session_id: &'a str,
    pub step_id: &'a str,
    pub key: &'a IdempotencyKey,
}

impl LedgerScope<'_> {
    fn storage_key(&self) -> String {
        format!("ledger/{}/{}/{}", self.session_id, self.step_id, self.key)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// This caller owns the mutation and must dispatch it.
    Claimed,
    /// A previous call completed; its output is returned instead of dispatching.
    Replay(Value),
    /// A previous call may have taken effect; dispatching again could double-apply.
    Refused(LedgerEntry),
}

#[derive(Clone)]
pub struct IdempotencyLedger {
    store: Arc<dyn KvStore>,
}

impl IdempotencyLedger {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub fn lookup(&self, scope: &LedgerScope<'_>) -> CoreResult<Option<LedgerEntry>> {
        get_json(self.store.as_ref(), &scope.storage_key())
    }

    /// Claims the scope with compare-and-swap so only one caller dispatches.
    pub fn claim(&self, scope: &LedgerScope<'_>, tool: &str) -> CoreResult<Claim> {
        let entry = serde_json::to_vec(&LedgerEntry::Attempted {
            tool: tool.to_string(),
        })?;
        if self
            .store
            .compare_and_swap(&scope.storage_key(), None, Some(&entry))?
        {
            return Ok(Claim::Claimed);
        }
        match self.lookup(scope)? {
            Some(LedgerEntry::Completed { output, .. }) => Ok(Claim::Replay(output)),
            Some(other) => Ok(Claim::Refused(other)),
            // Released between our CAS and the read; try once more.
            None => {
                if self
                    .store
                    .compare_and_swap(&scope.storage_key(), None, Some(&entry))?
                {
                    Ok(Claim::Claimed)
                } else {
                    Ok(Claim::Refused(LedgerEntry::Attempted {
                        tool: tool.to_string(),
                    }))
                }
            }
        }
    }

    pub fn complete(&self, scope: &LedgerScope<'_>, tool: &str, output: &Value) -> CoreResult<()> {
        let entry = LedgerEntry::Completed {
            tool: tool.to_string(),
            output: output.clone(),
        };
        self.store
            .put(&scope.storage_key(), &serde_json::to_vec(&entry)?)
    }

    pub fn mark_uncertain(&self, scope: &LedgerScope<'_>, tool: &str, reason: &str) -> CoreResult<()> {
        let entry = LedgerEntry::Uncertain {
            tool: tool.to_string(),
            reason: reason.to_string(),
        };
        self.store
            .put(&scope.storage_key(), &serde_json::to_vec(&entry)?)
    }

    /// Drops a claim after a definite failure so the step may be tried again later.
    pub fn release(&self, scope: &LedgerScope<'_>) -> CoreResult<()> {
        self.store.remove(&scope.storage_key())
    }
}
