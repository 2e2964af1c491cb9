//! Output validation applied to every provider response before it is trusted.
//!
//! The pipeline is a fixed sequence of closed validator variants:
//! degeneracy, then schema, then content policy. The first violation wins.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ProviderResponse;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    pub max_chars: usize,
    pub min_chars: usize,
    /// Unique-word ratio below which output of 8+ words counts as repetitive.
    pub min_unique_ratio: f64,
    /// Case-insensitive substrings that must not appear in output.
    pub prohibited_keywords: Vec<String>,
    /// Reject output containing emails, SSNs or card numbers.
    pub detect_pii: bool,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            max_chars: 10_000,
            min_chars: 1,
            min_unique_ratio: 0.2,
            prohibited_keywords: ["password", "secret_key", "api_key", "private_key"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            detect_pii: true,
        }
    }
}

/// Required top-level fields of the JSON object a route expects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaCheck {
    pub required_fields: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    SchemaMismatch,
    DisallowedContent,
    DegenerateOutput,
    StaleResult,
}

/// A provider answered, but the answer cannot be trusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailViolation {
    pub provider: String,
    pub capability: String,
    pub kind: ViolationKind,
    pub detail: String,
}

/// Result of a single validator.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Pass,
    Violation { kind: ViolationKind, detail: String },
}

impl Verdict {
    fn violation(kind: ViolationKind, detail: impl Into<String>) -> Self {
        Self::Violation {
            kind,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Guardrail {
    Degeneracy {
        min_chars: usize,
        min_unique_ratio: f64,
    },
    Schema(SchemaCheck),
    ContentPolicy {
        max_chars: usize,
        prohibited_keywords: Vec<String>,
        detect_pii: bool,
    },
}

impl Guardrail {
    pub fn check(&self, response: &ProviderResponse) -> Verdict {
        match self {
            Guardrail::Degeneracy {
                min_chars,
                min_unique_ratio,
            } => check_degeneracy(response, *min_chars, *min_unique_ratio),
            Guardrail::Schema(schema) => match structured_output(response) {
                None => Verdict::violation(ViolationKind::SchemaMismatch, "no JSON object in output"),
                Some(obj) => {
                    let missing: Vec<&str> = schema
                        .required_fields
                        .iter()
                        .filter(|f| obj.get(f.as_str()).is_none())
                        .map(|f| f.as_str())
                        .collect();
                    if missing.is_empty() {
                        Verdict::Pass
                    } else {
                        Verdict::violation(
                            ViolationKind::SchemaMismatch,
                            format!("missing fields: {}", missing.join(", ")),
                        )
                    }
                }
            },
            Guardrail::ContentPolicy {
                max_chars,
                prohibited_keywords,
                detect_pii,
            } => {
                let content = &response.content;
                if content.chars().count() > *max_chars {
                    return Verdict::violation(
                        ViolationKind::DisallowedContent,
                        format!("output exceeds {max_chars} characters"),
                    );
                }
                let lowered = content.to_lowercase();
                if let Some(word) = prohibited_keywords
                    .iter()
                    .find(|k| lowered.contains(&k.to_lowercase()))
                {
                    return Verdict::violation(
                        ViolationKind::DisallowedContent,
                        format!("prohibited keyword: {word}"),
                    );
                }
                if *detect_pii {
                    if let Some(kind) = pii_kind(content) {
                        return Verdict::violation(
                            ViolationKind::DisallowedContent,
                            format!("contains {kind}"),
                        );
                    }
                }
                Verdict::Pass
            }
        }
    }
}

fn check_degeneracy(response: &ProviderResponse, min_chars: usize, min_unique_ratio: f64) -> Verdict {
    if response.stale {
        return Verdict::violation(ViolationKind::StaleResult, "knowledge source reported stale passages");
    }
    let trimmed = response.content.trim();
    if trimmed.is_empty() {
        return Verdict::violation(ViolationKind::DegenerateOutput, "empty output");
    }
    if trimmed.chars().count() < min_chars {
        return Verdict::violation(
            ViolationKind::DegenerateOutput,
            format!("output shorter than {min_chars} characters"),
        );
    }
    let words: Vec<String> = trimmed
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect();
    if words.len() >= 8 {
        let unique: HashSet<&str> = words.iter().map(|w| w.as_str()).collect();
        let ratio = unique.len() as f64 / words.len() as f64;
        if ratio < min_unique_ratio {
            return Verdict::violation(
                ViolationKind::DegenerateOutput,
                format!("repetitive output (unique ratio {ratio:.2})"),
            );
        }
    }
    Verdict::Pass
}

fn fenced_json() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").ok())
        .as_ref()
}

/// Extracts the JSON object a response carries: the provider's structured field, the
/// whole body, a fenced code block, or the outermost braces embedded in text.
pub fn structured_output(response: &ProviderResponse) -> Option<serde_json::Map<String, Value>> {
    if let Some(Value::Object(obj)) = &response.structured {
        return Some(obj.clone());
    }
    extract_json_object(&response.content)
}

pub fn extract_json_object(text: &str) -> Option<serde_json::Map<String, Value>> {
    let parse = |s: &str| match serde_json::from_str::<Value>(s) {
        Ok(Value::Object(obj)) => Some(obj),
        _ => None,
    };
    if let Some(obj) = parse(text.trim()) {
        return Some(obj);
    }
    if let Some(caps) = fenced_json().and_then(|re| re.captures(text)) {
        if let Some(obj) = caps.get(1).and_then(|m| parse(m.as_str())) {
            return Some(obj);
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    parse(&text[start..=end])
}

fn pii_patterns() -> &'static [(&'static str, Regex)] {
    static PATTERNS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            ("email", r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b"),
            ("ssn", r"\b\d{3}-\d{2}-\d{4}\b"),
            ("card number", r"\b\d{4}[\s-]?\d{4}[\s-]?\d{4}[\s-]?\d{4}\b"),
        ]
        .into_iter()
        .filter_map(|(name, pattern)| Regex::new(pattern).ok().map(|re| (name, re)))
        .collect()
    })
}

fn pii_kind(content: &str) -> Option<&'static str> {
    pii_patterns()
        .iter()
        .find(|(_, re)| re.is_match(content))
        .map(|(name, _)| *name)
}

/// Ordered validators for one route.
#[derive(Debug, Clone)]
pub struct GuardrailPipeline {
    stages: Vec<Guardrail>,
}

impl GuardrailPipeline {
    pub fn new(config: &GuardrailConfig, schema: Option<&SchemaCheck>) -> Self {
        let mut stages = vec![Guardrail::Degeneracy {
            min_chars: config.min_chars,
            min_unique_ratio: config.min_unique_ratio,
        }];
        if let Some(schema) = schema {
            stages.push(Guardrail::Schema(schema.clone()));
        }
        stages.push(Guardrail::ContentPolicy {
            max_chars: config.max_chars,
            prohibited_keywords: config.prohibited_keywords.clone(),
            detect_pii: config.detect_pii,
        });
        Self { stages }
    }

    pub fn validate(&self, response: &ProviderResponse) -> Verdict {
        self.stages
            .iter()
            .map(|g| g.check(response))
            .find(|v| *v != Verdict::Pass)
            .unwrap_or(Verdict::Pass)
    }
}
