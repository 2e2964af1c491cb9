//! Knowledge-retrieval collaborator. Freshness filtering belongs to the implementation;
//! the core only reads the `stale` signal.

use serde::{Deserialize, Serialize};

use crate::error::CallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessPolicy {
    /// Any indexed passage is acceptable.
    Any,
    /// Passages older than the given age should be reported as stale.
    MaxAgeSecs(u64),
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self::MaxAgeSecs(30 * 24 * 3600)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub source: String,
    pub text: String,
    pub score: f32,
}

/// Ordered passages (best first) plus the collaborator's staleness verdict.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Retrieval {
    pub passages: Vec<Passage>,
    pub stale: bool,
}

#[async_trait::async_trait]
pub trait KnowledgeRetriever: Send + Sync {
    async fn retrieve(&self, query: &str, freshness: FreshnessPolicy)
        -> Result<Retrieval, CallError>;
}
