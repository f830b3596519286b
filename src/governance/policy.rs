//! Confidence policy over extracted fields.
//!
//! Pure function, called synchronously inside `extract_thread`. Email is
//! checked before name; the first unmet requirement decides the reason.

use crate::extraction::{ExtractedField, FieldKey, field_by_key};

/// Minimum confidence for required fields.
const REQUIRED_CONFIDENCE: f64 = 0.85;

/// What to do with an extracted thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    Review,
    Sync,
}

/// Why a thread was routed to review.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewReason {
    MissingOrLowConfidenceEmail,
    MissingOrLowConfidenceName,
}

impl ReviewReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewReason::MissingOrLowConfidenceEmail => "missing_or_low_confidence_email",
            ReviewReason::MissingOrLowConfidenceName => "missing_or_low_confidence_name",
        }
    }
}

/// Policy decision for a set of extracted fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyDecision {
    pub action: PolicyAction,
    pub reason: Option<ReviewReason>,
}

/// Required-field check: email and name present with confidence >= 0.85.
pub fn evaluate_policies(fields: &[ExtractedField]) -> PolicyDecision {
    let email = field_by_key(fields, FieldKey::Email);
    if !email.is_some_and(|f| f.confidence >= REQUIRED_CONFIDENCE) {
        return PolicyDecision {
            action: PolicyAction::Review,
            reason: Some(ReviewReason::MissingOrLowConfidenceEmail),
        };
    }

    let name = field_by_key(fields, FieldKey::Name);
    if !name.is_some_and(|f| f.confidence >= REQUIRED_CONFIDENCE) {
        return PolicyDecision {
            action: PolicyAction::Review,
            reason: Some(ReviewReason::MissingOrLowConfidenceName),
        };
    }

    PolicyDecision {
        action: PolicyAction::Sync,
        reason: None,
    }
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
    fn allows_sync_with_confident_email_and_name() {
        let decision = evaluate_policies(&[
            field(FieldKey::Email, 0.99),
            field(FieldKey::Name, 0.9),
        ]);
        assert_eq!(decision.action, PolicyAction::Sync);
        assert!(decision.reason.is_none());
    }

    #[test]
    fn missing_email_checked_before_name() {
        let decision = evaluate_policies(&[field(FieldKey::Company, 0.9)]);
        assert_eq!(decision.action, PolicyAction::Review);
        assert_eq!(
            decision.reason,
            Some(ReviewReason::MissingOrLowConfidenceEmail)
        );
    }

    #[test]
    fn low_confidence_email_routes_to_review() {
        let decision = evaluate_policies(&[
            field(FieldKey::Email, 0.5),
            field(FieldKey::Name, 0.9),
        ]);
        assert_eq!(
            decision.reason,
            Some(ReviewReason::MissingOrLowConfidenceEmail)
        );
    }

    #[test]
    fn confident_email_but_missing_name() {
        let decision = evaluate_policies(&[field(FieldKey::Email, 0.99)]);
        assert_eq!(
            decision.reason,
            Some(ReviewReason::MissingOrLowConfidenceName)
        );
    }

    #[test]
    fn boundary_confidence_is_inclusive() {
        let decision = evaluate_policies(&[
            field(FieldKey::Email, 0.85),
            field(FieldKey::Name, 0.85),
        ]);
        assert_eq!(decision.action, PolicyAction::Sync);
    }
}
