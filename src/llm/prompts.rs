//! Rollup prompt assembly.

use serde_json::Value;
use sha2::{Digest, Sha256};

pub const ROLLUP_SYSTEM_PROMPT: &str = "You are a sales operations assistant. You receive a \
JSON context describing one deal's week: readiness score, missing BANT keys, known facts, \
event subjects, risks, and optionally short tagged snippets. Respond with a single JSON \
object with exactly these fields: summary_md (markdown, under 1200 characters), highlights \
(object with events, risks, next_actions arrays of strings), confidence (number 0 to 1), \
and field_deltas (array of {key, value, confidence}). Do not add any other fields. Only \
propose a field delta when the context contains direct evidence for it.";

pub fn rollup_user_prompt(context: &Value) -> String {
    format!("Weekly deal context:\n{context}\n\nProduce the rollup JSON now.")
}

/// Content hash of the full prompt, used to key llm_runs.
pub fn prompt_hash(system: &str, user: &str) -> String {
    hex::encode(Sha256::digest(format!("{system}\n{user}").as_bytes()))
}
