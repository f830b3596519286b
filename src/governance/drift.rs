//! Extraction-quality drift detection.
//!
//! A source key fingerprints "this kind of inbound message" independent of
//! thread identity: sender domain, normalized subject, and a short digest
//! of (subject, first body line). Quality is a weighted score over the
//! required fields. Drift fires only when a historically good source
//! collapses; baselines ratchet up on sustained good quality and never
//! erode through ordinary noise.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use crate::extraction::{ExtractedField, FieldKey, field_by_key};

/// Baseline must be at least this for drift to be considered.
pub const HISTORICAL_MIN_QUALITY: f64 = 0.85;
/// Current quality must be at or below this for drift to fire.
pub const CURRENT_MAX_QUALITY: f64 = 0.6;
/// Below this, a drift alert is critical rather than warning.
pub const CRITICAL_QUALITY: f64 = 0.45;

/// Fields of an inbound message that feed the source key.
#[derive(Debug, Clone, Default)]
pub struct SourceMessage<'a> {
    pub from_email: Option<&'a str>,
    pub subject: Option<&'a str>,
    pub text: Option<&'a str>,
}

/// Alert severity for a drift event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftSeverity {
    Warning,
    Critical,
}

impl DriftSeverity {
    pub fn for_quality(quality: f64) -> Self {
        if quality < CRITICAL_QUALITY {
            DriftSeverity::Critical
        } else {
            DriftSeverity::Warning
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DriftSeverity::Warning => "warning",
            DriftSeverity::Critical => "critical",
        }
    }
}

fn subject_prefix_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(\s*(re|fwd?|fw)\s*:\s*)+").unwrap())
}

fn whitespace_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

/// Strip repeated Re:/Fwd: prefixes, collapse whitespace, lowercase.
fn normalize_subject(subject: &str) -> String {
    let stripped = subject_prefix_regex().replace(subject, "");
    whitespace_regex()
        .replace_all(&stripped, " ")
        .trim()
        .to_lowercase()
}

/// First 50 chars of the first body line, whitespace-collapsed, lowercase.
fn normalize_text_header(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or("");
    let head: String = first_line.chars().take(50).collect();
    whitespace_regex()
        .replace_all(&head, " ")
        .trim()
        .to_lowercase()
}

fn short_sha(value: &str) -> String {
    let digest = hex::encode(Sha256::digest(value.as_bytes()));
    digest[..12].to_string()
}

fn sender_domain(email: &str) -> String {
    email
        .split('@')
        .nth(1)
        .unwrap_or("unknown")
        .trim()
        .to_lowercase()
}

/// Stable fingerprint for a kind of inbound message.
pub fn compute_source_key(message: &SourceMessage<'_>) -> String {
    let domain = sender_domain(message.from_email.unwrap_or("unknown@unknown"));
    let subject = normalize_subject(message.subject.unwrap_or(""));
    let header = normalize_text_header(message.text.unwrap_or(""));
    let hash = short_sha(&format!("{subject}|{header}"));
    let subject_part = if subject.is_empty() { "none" } else { &subject };
    format!("domain:{domain}|sub:{subject_part}|h:{hash}")
}

/// Weighted quality score: email 0.5, name 0.3, company 0.2.
pub fn compute_extraction_quality(fields: &[ExtractedField]) -> f64 {
    let mut quality: f64 = 0.0;

    if field_by_key(fields, FieldKey::Email).is_some_and(|f| f.confidence >= 0.85) {
        quality += 0.5;
    }
    if field_by_key(fields, FieldKey::Name).is_some_and(|f| f.confidence >= 0.85) {
        quality += 0.3;
    }
    if field_by_key(fields, FieldKey::Company).is_some_and(|f| f.confidence >= 0.8) {
        quality += 0.2;
    }

    (quality.clamp(0.0, 1.0) * 10_000.0).round() / 10_000.0
}

/// Drift fires when a historically good source collapses.
pub fn should_trigger_drift(current_quality: f64, historical_quality: f64) -> bool {
    historical_quality >= HISTORICAL_MIN_QUALITY && current_quality <= CURRENT_MAX_QUALITY
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(key: FieldKey, confidence: f64) -> ExtractedField {
        ExtractedField {
            field_key: key,
            field_value_json: json!("x"),
            confidence,
            evidence_json: json!({}),
        }
    }

    #[test]
    fn source_key_strips_reply_prefixes() {
        let base = compute_source_key(&SourceMessage {
            from_email: Some("alice@acme.com"),
            subject: Some("Pricing question"),
            text: Some("Hello team"),
        });
        let replied = compute_source_key(&SourceMessage {
            from_email: Some("alice@acme.com"),
            subject: Some("Re: RE: Fwd: pricing   question"),
            text: Some("Hello team"),
        });
        assert_eq!(base, replied);
    }

    #[test]
    fn source_key_is_case_insensitive() {
        let a = compute_source_key(&SourceMessage {
            from_email: Some("Alice@ACME.com"),
            subject: Some("Pricing Question"),
            text: Some("HELLO team"),
        });
        let b = compute_source_key(&SourceMessage {
            from_email: Some("alice@acme.com"),
            subject: Some("pricing question"),
            text: Some("hello team"),
        });
        assert_eq!(a, b);
    }

    #[test]
    fn source_key_is_sensitive_to_subject_content() {
        let a = compute_source_key(&SourceMessage {
            from_email: Some("alice@acme.com"),
            subject: Some("Pricing question"),
            text: Some("Hello"),
        });
        let b = compute_source_key(&SourceMessage {
            from_email: Some("alice@acme.com"),
            subject: Some("Contract renewal"),
            text: Some("Hello"),
        });
        assert_ne!(a, b);
    }

    #[test]
    fn source_key_handles_missing_parts() {
        let key = compute_source_key(&SourceMessage::default());
        assert!(key.starts_with("domain:unknown|sub:none|h:"));
        // 12-char digest
        assert_eq!(key.rsplit(":").next().unwrap().len(), 12);
    }

    #[test]
    fn quality_full_marks() {
        let quality = compute_extraction_quality(&[
            field(FieldKey::Email, 0.9),
            field(FieldKey::Name, 0.85),
            field(FieldKey::Company, 0.8),
        ]);
        assert_eq!(quality, 1.0);
    }

    #[test]
    fn quality_zero_when_nothing_present() {
        assert_eq!(compute_extraction_quality(&[]), 0.0);
    }

    #[test]
    fn quality_partial_weights() {
        let quality = compute_extraction_quality(&[
            field(FieldKey::Email, 0.9),
            field(FieldKey::Company, 0.85),
        ]);
        assert_eq!(quality, 0.7);

        // Low-confidence fields contribute nothing.
        let quality = compute_extraction_quality(&[
            field(FieldKey::Email, 0.5),
            field(FieldKey::Name, 0.9),
        ]);
        assert_eq!(quality, 0.3);
    }

    #[test]
    fn drift_trigger_table() {
        assert!(should_trigger_drift(0.55, 0.9));
        assert!(!should_trigger_drift(0.75, 0.9));
        assert!(!should_trigger_drift(0.55, 0.8)); // baseline never good enough
        assert!(should_trigger_drift(0.6, 0.85)); // boundaries inclusive
    }

    #[test]
    fn severity_thresholds() {
        assert_eq!(DriftSeverity::for_quality(0.44), DriftSeverity::Critical);
        assert_eq!(DriftSeverity::for_quality(0.45), DriftSeverity::Warning);
    }
}
