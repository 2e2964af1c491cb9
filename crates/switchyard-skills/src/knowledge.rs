//! Help-center knowledge: a static article index and the provider that exposes it to
//! the router as the `knowledge.search` capability.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::json;
use switchyard_core::{
    CallError, FreshnessPolicy, IdempotencyKey, KnowledgeRetriever, ModelProvider, Passage,
    ProviderRequest, ProviderResponse, Retrieval,
};

const TOP_K: usize = 3;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub source: String,
    pub text: String,
    /// Unix seconds of the last edit.
    pub updated_at: u64,
}

/// In-memory article index scored by term overlap.
#[derive(Debug, Clone, Default)]
pub struct StaticKnowledgeBase {
    articles: Vec<Article>,
}

impl StaticKnowledgeBase {
    pub fn new(articles: Vec<Article>) -> Self {
        Self { articles }
    }

    /// A small help center covering shipping, returns and products.
    pub fn help_center() -> Self {
        let now = now_secs();
        let article = |source: &str, text: &str| Article {
            source: source.to_string(),
            text: text.to_string(),
            updated_at: now,
        };
        Self::new(vec![
            article(
                "returns-policy",
                "Items can be returned within 30 days of delivery for a full refund. Refunds are issued to the original payment method within 5 business days.",
            ),
            article(
                "shipping",
                "Standard shipping takes 3 to 5 business days. Express orders ship the same day when placed before noon.",
            ),
            article(
                "warranty",
                "All products carry a one year warranty covering manufacturing defects. Accidental damage is not covered.",
            ),
            article(
                "sizing",
                "Our product sizing runs true to size. Each product page lists exact measurements for every size.",
            ),
        ])
    }
}

#[async_trait::async_trait]
impl KnowledgeRetriever for StaticKnowledgeBase {
    async fn retrieve(
        &self,
        query: &str,
        freshness: FreshnessPolicy,
    ) -> Result<Retrieval, CallError> {
        let wanted = terms(query);
        if wanted.is_empty() {
            return Ok(Retrieval::default());
        }
        let mut scored: Vec<(&Article, f32)> = self
            .articles
            .iter()
            .filter_map(|a| {
                let hits = terms(&a.text).intersection(&wanted).count();
                (hits > 0).then(|| (a, hits as f32 / wanted.len() as f32))
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(TOP_K);

        let now = now_secs();
        let stale = match freshness {
            FreshnessPolicy::Any => false,
            FreshnessPolicy::MaxAgeSecs(max) => scored
                .iter()
                .any(|(a, _)| now.saturating_sub(a.updated_at) > max),
        };
        Ok(Retrieval {
            passages: scored
                .into_iter()
                .map(|(a, score)| Passage {
                    source: a.source.clone(),
                    text: a.text.clone(),
                    score,
                })
                .collect(),
            stale,
        })
    }
}

/// Exposes a [`KnowledgeRetriever`] as a model provider. Stale retrievals are flagged on
/// the response so the router's guardrails reject them.
pub struct KnowledgeProvider {
    id: String,
    retriever: Arc<dyn KnowledgeRetriever>,
    freshness: FreshnessPolicy,
}

impl KnowledgeProvider {
    pub fn new(
        id: impl Into<String>,
        retriever: Arc<dyn KnowledgeRetriever>,
        freshness: FreshnessPolicy,
    ) -> Self {
        Self {
            id: id.into(),
            retriever,
            freshness,
        }
    }
}

#[async_trait::async_trait]
impl ModelProvider for KnowledgeProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(
        &self,
        request: &ProviderRequest,
        _key: &IdempotencyKey,
    ) -> Result<ProviderResponse, CallError> {
        let query = request
            .input
            .get("query")
            .and_then(|q| q.as_str())
            .unwrap_or(&request.prompt);
        let retrieval = self.retriever.retrieve(query, self.freshness).await?;
        tracing::debug!(target: "switchyard::skills", provider = %self.id, passages = retrieval.passages.len(), stale = retrieval.stale, "knowledge retrieved");

        let content = if retrieval.passages.is_empty() {
            "No help center article matches this question yet.".to_string()
        } else {
            retrieval
                .passages
                .iter()
                .map(|p| p.text.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        };
        Ok(ProviderResponse {
            content,
            structured: Some(json!({ "passages": retrieval.passages })),
            stale: retrieval.stale,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn best_matching_article_comes_first() {
        let kb = StaticKnowledgeBase::help_center();
        let r = kb
            .retrieve("how long do refunds take after a return?", FreshnessPolicy::default())
            .await
            .unwrap();
        assert_eq!(r.passages[0].source, "returns-policy");
        assert!(!r.stale);
    }

    #[tokio::test]
    async fn old_articles_are_reported_stale() {
        let kb = StaticKnowledgeBase::new(vec![Article {
            source: "legacy".into(),
            text: "Refunds are processed by fax.".into(),
            updated_at: 0,
        }]);
        let r = kb
            .retrieve("refunds", FreshnessPolicy::MaxAgeSecs(3600))
            .await
            .unwrap();
        assert!(r.stale);
        let r = kb.retrieve("refunds", FreshnessPolicy::Any).await.unwrap();
        assert!(!r.stale);
    }

    #[tokio::test]
    async fn provider_carries_stale_flag_and_passages() {
        let kb = StaticKnowledgeBase::new(vec![Article {
            source: "legacy".into(),
            text: "Refunds are processed by fax within ninety days.".into(),
            updated_at: 0,
        }]);
        let provider =
            KnowledgeProvider::new("kb", Arc::new(kb), FreshnessPolicy::MaxAgeSecs(60));
        let response = provider
            .invoke(
                &ProviderRequest {
                    capability: "knowledge.search".into(),
                    prompt: "refund policy".into(),
                    input: json!({"query": "refunds"}),
                },
                &IdempotencyKey::from_raw("k"),
            )
            .await
            .unwrap();
        assert!(response.stale);
        assert_eq!(
            response.structured.unwrap()["passages"][0]["source"],
            json!("legacy")
        );
    }
}
