//! Redaction-safe rollup context.
//!
//! The model only ever sees structured facts plus, when the workspace opts
//! in, a handful of tagged and redacted snippets. Raw thread text never
//! leaves the store at the `structured_only` level.

use serde_json::{Value, json};

use crate::governance::readiness::{BantReadiness, DealFact};
use crate::llm::redaction::{self, EVENT_MAX_CHARS, SNIPPET_MAX_CHARS};
use crate::store::threads::Message;
use crate::store::workspaces::LlmContextLevel;

pub const MAX_SNIPPETS: usize = 3;
pub const PAUSED_RISK: &str = "crm_writes_paused_due_to_drift";

/// Signal tags a snippet must carry to be worth sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnippetTag {
    PricingRequest,
    Objection,
    Legal,
}

impl SnippetTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnippetTag::PricingRequest => "pricing_request",
            SnippetTag::Objection => "objection",
            SnippetTag::Legal => "legal",
        }
    }
}

/// Classify a message body; untagged messages never become snippets.
pub fn tag_snippet(text: &str) -> Option<SnippetTag> {
    let lower = text.to_lowercase();
    if ["pricing", "price", "cost", "quote"].iter().any(|kw| lower.contains(kw)) {
        return Some(SnippetTag::PricingRequest);
    }
    if ["concern", "worried", "hesitant", "pushback", "objection"]
        .iter()
        .any(|kw| lower.contains(kw))
    {
        return Some(SnippetTag::Objection);
    }
    if ["legal", "contract", "terms", "compliance"].iter().any(|kw| lower.contains(kw)) {
        return Some(SnippetTag::Legal);
    }
    None
}

pub struct RollupContextInput<'a> {
    pub readiness: &'a BantReadiness,
    pub facts: &'a [DealFact],
    pub messages: &'a [Message],
    pub open_review_reasons: &'a [String],
    pub writes_paused: bool,
    pub level: LlmContextLevel,
}

/// Build the JSON context the rollup prompt embeds.
pub fn build_rollup_context(input: &RollupContextInput<'_>) -> Value {
    let missing: Vec<&str> = input
        .readiness
        .missing_keys
        .iter()
        .map(|k| k.as_str())
        .collect();

    let mut key_facts = serde_json::Map::new();
    for fact in input.facts {
        key_facts.insert(
            fact.key.as_str().to_string(),
            json!({ "value": fact.value_json, "confidence": fact.confidence }),
        );
    }

    let events: Vec<String> = input
        .messages
        .iter()
        .filter_map(|m| m.subject.as_deref())
        .map(|s| redaction::truncate(&redaction::redact(s), EVENT_MAX_CHARS))
        .collect();

    let mut risks: Vec<String> = input.open_review_reasons.to_vec();
    if input.writes_paused {
        risks.push(PAUSED_RISK.to_string());
    }

    let mut context = json!({
        "readiness_score": input.readiness.readiness_score,
        "missing_keys": missing,
        "key_facts": Value::Object(key_facts),
        "events": events,
        "risks": risks,
    });

    if input.level == LlmContextLevel::StructuredPlusSnippets {
        let snippets: Vec<Value> = input
            .messages
            .iter()
            .filter_map(|m| {
                let body = m.body_text.as_deref()?;
                let tag = tag_snippet(body)?;
                Some(json!({
                    "tag": tag.as_str(),
                    "text": redaction::truncate(&redaction::redact(body), SNIPPET_MAX_CHARS),
                }))
            })
            .take(MAX_SNIPPETS)
            .collect();
        context["snippets"] = Value::Array(snippets);
    }

    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::readiness::{BantKey, compute_bant_readiness};
    use chrono::Utc;
    use uuid::Uuid;

    fn message(subject: Option<&str>, body: Option<&str>) -> Message {
        Message {
            id: Uuid::new_v4(),
            thread_id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            from_email: Some("ana@acme.com".to_string()),
            to_emails: vec![],
            subject: subject.map(String::from),
            body_text: body.map(String::from),
            redacted: false,
            received_at: Utc::now(),
        }
    }

    fn fact(key: BantKey) -> DealFact {
        DealFact {
            key,
            value_json: json!("x"),
            confidence: 0.9,
            evidence_json: json!({}),
        }
    }

    #[test]
    fn structured_only_has_no_snippets() {
        let facts = vec![fact(BantKey::Budget)];
        let readiness = compute_bant_readiness(&facts);
        let messages = vec![message(Some("Pricing question"), Some("What does it cost?"))];
        let context = build_rollup_context(&RollupContextInput {
            readiness: &readiness,
            facts: &facts,
            messages: &messages,
            open_review_reasons: &[],
            writes_paused: false,
            level: LlmContextLevel::StructuredOnly,
        });
        assert!(context.get("snippets").is_none());
        assert_eq!(context["events"][0], "Pricing question");
        assert_eq!(context["readiness_score"], 25.0);
        assert!(context["key_facts"]["budget"]["confidence"].as_f64().is_some());
    }

    #[test]
    fn snippets_are_tagged_redacted_and_capped() {
        let readiness = compute_bant_readiness(&[]);
        let messages = vec![
            message(None, Some("Can you send pricing? Reach me at ana@acme.com")),
            message(None, Some("Our legal team wants the contract redlines")),
            message(None, Some("Nothing interesting here")),
            message(None, Some("Big concern about rollout risk")),
            message(None, Some("Another pricing ask")),
        ];
        let context = build_rollup_context(&RollupContextInput {
            readiness: &readiness,
            facts: &[],
            messages: &messages,
            open_review_reasons: &[],
            writes_paused: false,
            level: LlmContextLevel::StructuredPlusSnippets,
        });
        let snippets = context["snippets"].as_array().unwrap();
        assert_eq!(snippets.len(), 3);
        assert_eq!(snippets[0]["tag"], "pricing_request");
        assert!(snippets[0]["text"].as_str().unwrap().contains("***@acme.com"));
        assert_eq!(snippets[1]["tag"], "legal");
        assert_eq!(snippets[2]["tag"], "objection");
    }

    #[test]
    fn pause_surfaces_as_a_risk() {
        let readiness = compute_bant_readiness(&[]);
        let reasons = vec!["needs_deal_linking".to_string()];
        let context = build_rollup_context(&RollupContextInput {
            readiness: &readiness,
            facts: &[],
            messages: &[],
            open_review_reasons: &reasons,
            writes_paused: true,
            level: LlmContextLevel::StructuredOnly,
        });
        let risks = context["risks"].as_array().unwrap();
        assert_eq!(risks.len(), 2);
        assert_eq!(risks[1], PAUSED_RISK);
    }
}
