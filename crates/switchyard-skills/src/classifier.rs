//! Keyword classifier: a deterministic stand-in for an LLM intent classifier.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};
use switchyard_core::{CallError, Classification, LanguageUnderstanding, SessionSnapshot};

const METHOD: &str = "keyword";

const INTENT_KEYWORDS: &[(&str, &[&str])] = &[
    ("escalation", &["human", "agent", "manager", "representative", "real person", "speak to someone"]),
    ("returns_refunds", &["refund", "return", "money back", "send back"]),
    ("order_status", &["order", "tracking", "track", "shipped", "delivery", "package"]),
    ("ticket_creation", &["ticket", "complaint", "broken", "damaged", "not working"]),
    ("product_info", &["product", "warranty", "size", "sizing", "material", "in stock"]),
    ("greeting", &["hello", "hi", "hey", "good morning", "good afternoon"]),
];

fn order_id_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b([a-z]{1,3}-?\d{3,})\b").ok())
        .as_ref()
}

fn amount_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\$\s?(\d+(?:\.\d{1,2})?)|(\d+(?:\.\d{1,2})?)\s?(?:dollars|usd)\b").ok()
    })
    .as_ref()
}

fn contains_word(text: &str, keyword: &str) -> bool {
    if keyword.contains(' ') {
        return text.contains(keyword);
    }
    text.split(|c: char| !c.is_alphanumeric())
        .any(|w| w == keyword || (keyword.len() > 3 && w.starts_with(keyword)))
}

/// Extracts `order_id`, `amount` and `subject` from free text.
pub fn extract_params(text: &str) -> BTreeMap<String, Value> {
    let mut params = BTreeMap::new();
    if let Some(caps) = order_id_pattern().and_then(|re| re.captures(text)) {
        params.insert("order_id".to_string(), json!(caps[1].to_uppercase()));
    }
    if let Some(caps) = amount_pattern().and_then(|re| re.captures(text)) {
        let amount = caps
            .get(1)
            .or_else(|| caps.get(2))
            .and_then(|m| m.as_str().parse::<f64>().ok());
        if let Some(amount) = amount {
            params.insert("amount".to_string(), json!(amount));
        }
    }
    let subject: String = text.trim().chars().take(60).collect();
    if !subject.is_empty() {
        params.insert("subject".to_string(), json!(subject));
    }
    params
}

#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Scores each intent by keyword hits. Escalation wins outright; a tie goes to the
    /// intent listed first, at threshold confidence.
    pub fn score(&self, text: &str) -> Classification {
        let lowered = text.to_lowercase();
        let mut hits: Vec<(&str, usize)> = INTENT_KEYWORDS
            .iter()
            .map(|(intent, words)| {
                (*intent, words.iter().filter(|w| contains_word(&lowered, w)).count())
            })
            .filter(|(_, n)| *n > 0)
            .collect();
        hits.sort_by(|a, b| b.1.cmp(&a.1));

        let (intent, confidence) = match hits.as_slice() {
            [] => ("general_inquiry", 0.35),
            [(intent, _), ..] if *intent == "escalation" => (*intent, 0.95),
            _ if hits.iter().any(|(i, _)| *i == "escalation") => ("escalation", 0.95),
            [(first, a), (_, b), ..] if a == b => (*first, 0.6),
            [(intent, n), ..] => (*intent, (0.6 + 0.15 * *n as f64).min(0.95)),
        };
        Classification {
            intent: intent.to_string(),
            params: extract_params(text),
            confidence,
            method: METHOD.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl LanguageUnderstanding for KeywordClassifier {
    async fn classify(
        &self,
        text: &str,
        context: &SessionSnapshot,
    ) -> Result<Classification, CallError> {
        let mut classification = self.score(text);
        // Follow-up answers ("it's A100") keep the intent that asked for them.
        if classification.intent == "general_inquiry" {
            if let Some(previous) = &context.last_intent {
                if classification.params.contains_key("order_id")
                    || classification.params.contains_key("amount")
                {
                    classification.intent = previous.clone();
                    classification.confidence = 0.7;
                }
            }
        }
        Ok(classification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_question_extracts_order_id() {
        let c = KeywordClassifier::new().score("Where is my order a100? The tracking is stuck");
        assert_eq!(c.intent, "order_status");
        assert!(c.confidence >= 0.6);
        assert_eq!(c.params["order_id"], json!("A100"));
    }

    #[test]
    fn refund_extracts_amount() {
        let c = KeywordClassifier::new().score("I want a refund of $45.50 for A101");
        assert_eq!(c.intent, "returns_refunds");
        assert_eq!(c.params["amount"], json!(45.5));
        assert_eq!(c.params["order_id"], json!("A101"));
    }

    #[test]
    fn asking_for_a_person_escalates() {
        let c = KeywordClassifier::new().score("this is useless, let me talk to a human");
        assert_eq!(c.intent, "escalation");
    }

    #[test]
    fn tie_prefers_more_specific_intent() {
        let c = KeywordClassifier::new().score("refund for order A100 please");
        assert_eq!(c.intent, "returns_refunds");
        assert_eq!(c.confidence, 0.6);
    }

    #[test]
    fn unmatched_text_has_low_confidence() {
        let c = KeywordClassifier::new().score("mmm");
        assert_eq!(c.intent, "general_inquiry");
        assert!(c.confidence < 0.6);
    }

    #[tokio::test]
    async fn follow_up_inherits_previous_intent() {
        let mut ctx = SessionSnapshot::for_session("s1");
        ctx.last_intent = Some("order_status".into());
        let c = KeywordClassifier::new()
            .classify("it's A102", &ctx)
            .await
            .unwrap();
        assert_eq!(c.intent, "order_status");
        assert_eq!(c.params["order_id"], json!("A102"));
    }
}
