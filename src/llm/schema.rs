//! Strict validation of LLM rollup output.
//!
//! The model's JSON must match this schema exactly; unknown fields, out of
//! range confidences, or an over-long summary all reject the output and
//! push the rollup onto the deterministic fallback.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SUMMARY_MAX_CHARS: usize = 1200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RollupHighlights {
    pub events: Vec<String>,
    pub risks: Vec<String>,
    pub next_actions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldDelta {
    pub key: String,
    pub value: Value,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RollupOutput {
    pub summary_md: String,
    pub highlights: RollupHighlights,
    pub confidence: f64,
    #[serde(default)]
    pub field_deltas: Vec<FieldDelta>,
}

/// Parse and validate raw model output.
pub fn validate_rollup_output(raw: &str) -> Result<RollupOutput, String> {
    let output: RollupOutput =
        serde_json::from_str(raw).map_err(|e| format!("output is not valid rollup JSON: {e}"))?;

    let summary_chars = output.summary_md.chars().count();
    if summary_chars == 0 {
        return Err("summary_md is empty".to_string());
    }
    if summary_chars > SUMMARY_MAX_CHARS {
        return Err(format!(
            "summary_md is {summary_chars} chars, limit {SUMMARY_MAX_CHARS}"
        ));
    }
    if !(0.0..=1.0).contains(&output.confidence) {
        return Err(format!("confidence {} out of range", output.confidence));
    }
    for delta in &output.field_deltas {
        if delta.key.is_empty() {
            return Err("field delta with empty key".to_string());
        }
        if !(0.0..=1.0).contains(&delta.confidence) {
            return Err(format!(
                "field delta {} confidence {} out of range",
                delta.key, delta.confidence
            ));
        }
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> serde_json::Value {
        json!({
            "summary_md": "### Current status\nOn track.",
            "highlights": { "events": [], "risks": [], "next_actions": [] },
            "confidence": 0.75,
            "field_deltas": [{ "key": "timeline", "value": "Q3", "confidence": 0.92 }]
        })
    }

    #[test]
    fn accepts_well_formed_output() {
        let output = validate_rollup_output(&base().to_string()).unwrap();
        assert_eq!(output.field_deltas.len(), 1);
        assert_eq!(output.field_deltas[0].key, "timeline");
    }

    #[test]
    fn rejects_unknown_fields() {
        let mut value = base();
        value["surprise"] = json!(true);
        assert!(validate_rollup_output(&value.to_string()).is_err());

        let mut value = base();
        value["highlights"]["extra"] = json!([]);
        assert!(validate_rollup_output(&value.to_string()).is_err());
    }

    #[test]
    fn rejects_empty_and_oversize_summary() {
        let mut value = base();
        value["summary_md"] = json!("");
        assert!(validate_rollup_output(&value.to_string()).is_err());

        let mut value = base();
        value["summary_md"] = json!("x".repeat(SUMMARY_MAX_CHARS + 1));
        assert!(validate_rollup_output(&value.to_string()).is_err());

        let mut value = base();
        value["summary_md"] = json!("x".repeat(SUMMARY_MAX_CHARS));
        assert!(validate_rollup_output(&value.to_string()).is_ok());
    }

    #[test]
    fn rejects_out_of_range_confidence() {
        let mut value = base();
        value["confidence"] = json!(1.2);
        assert!(validate_rollup_output(&value.to_string()).is_err());

        let mut value = base();
        value["field_deltas"][0]["confidence"] = json!(-0.1);
        assert!(validate_rollup_output(&value.to_string()).is_err());
    }

    #[test]
    fn missing_field_deltas_defaults_empty() {
        let mut value = base();
        value.as_object_mut().unwrap().remove("field_deltas");
        let output = validate_rollup_output(&value.to_string()).unwrap();
        assert!(output.field_deltas.is_empty());
    }

    #[test]
    fn rejects_missing_required_fields() {
        let mut value = base();
        value.as_object_mut().unwrap().remove("highlights");
        assert!(validate_rollup_output(&value.to_string()).is_err());
    }
}
