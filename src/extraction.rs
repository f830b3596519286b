//! Text extraction capability.
//!
//! The real product runs a deterministic matcher over inbound email text;
//! this module treats it as a capability trait so tests and the worker can
//! swap implementations. The default implementation matches labeled lines
//! (`Email: x@y.com`) with fixed per-field confidence.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Keys the extraction matcher knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKey {
    Email,
    Name,
    Company,
    Intent,
    Timeline,
}

impl FieldKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKey::Email => "email",
            FieldKey::Name => "name",
            FieldKey::Company => "company",
            FieldKey::Intent => "intent",
            FieldKey::Timeline => "timeline",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "email" => Some(FieldKey::Email),
            "name" => Some(FieldKey::Name),
            "company" => Some(FieldKey::Company),
            "intent" => Some(FieldKey::Intent),
            "timeline" => Some(FieldKey::Timeline),
            _ => None,
        }
    }
}

/// One extracted fact with evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedField {
    pub field_key: FieldKey,
    pub field_value_json: Value,
    pub confidence: f64,
    pub evidence_json: Value,
}

/// Find a field by key.
pub fn field_by_key<'a>(fields: &'a [ExtractedField], key: FieldKey) -> Option<&'a ExtractedField> {
    fields.iter().find(|field| field.field_key == key)
}

/// Deterministic text-extraction capability.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn run_extraction(&self, text: &str) -> Vec<ExtractedField>;
}

/// Line-prefix matcher with fixed confidence per field.
pub struct DeterministicExtractor;

const MATCHERS: &[(FieldKey, &str, f64)] = &[
    (FieldKey::Name, "Name", 0.9),
    (FieldKey::Email, "Email", 0.99),
    (FieldKey::Company, "Company", 0.85),
    (FieldKey::Intent, "Intent", 0.9),
    (FieldKey::Timeline, "Timeline", 0.7),
];

impl DeterministicExtractor {
    pub fn extract(text: &str) -> Vec<ExtractedField> {
        let mut output = Vec::new();
        for (index, line) in text.lines().enumerate() {
            for (key, label, confidence) in MATCHERS {
                let prefix = format!("{label}:");
                let Some(rest) = line.strip_prefix(&prefix) else {
                    continue;
                };
                let value = rest.trim();
                if value.is_empty() {
                    continue;
                }
                output.push(ExtractedField {
                    field_key: *key,
                    field_value_json: Value::String(value.to_string()),
                    confidence: *confidence,
                    evidence_json: json!({ "match": line, "line": index + 1 }),
                });
            }
        }
        output
    }
}

#[async_trait]
impl Extractor for DeterministicExtractor {
    async fn run_extraction(&self, text: &str) -> Vec<ExtractedField> {
        Self::extract(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_labeled_lines() {
        let fields = DeterministicExtractor::extract("Name: Jane Doe\nEmail: jane@acme.com");
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].field_key, FieldKey::Name);
        assert_eq!(fields[0].field_value_json, "Jane Doe");
        assert_eq!(fields[1].field_key, FieldKey::Email);
        assert!(fields[1].confidence >= 0.99);
        assert_eq!(fields[1].evidence_json["line"], 2);
    }

    #[test]
    fn ignores_empty_values_and_unlabeled_lines() {
        let fields = DeterministicExtractor::extract("Email:\nhello there\nCompany: Acme");
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].field_key, FieldKey::Company);
    }

    #[test]
    fn field_lookup_by_key() {
        let fields = DeterministicExtractor::extract("Timeline: Q3");
        assert!(field_by_key(&fields, FieldKey::Timeline).is_some());
        assert!(field_by_key(&fields, FieldKey::Email).is_none());
    }
}
