//! Idempotency key derivation and content hashing.
//!
//! Keys are the natural primary keys of the CRM write log: re-submitting
//! a write with an identical key is a no-op. Payload hashes use a stable
//! stringification so that key order in a JSON map never changes the hash.

use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::crm::CrmSystem;

/// Input tuple for a CRM write idempotency key.
#[derive(Debug, Clone)]
pub struct CrmIdempotencyInput<'a> {
    pub workspace_id: Uuid,
    pub crm_system: CrmSystem,
    pub object_type: &'a str,
    pub object_id: &'a str,
    pub action: &'a str,
    /// Typically the schema version of the triggering event.
    pub source_event_id: &'a str,
}

/// SHA-256 over the colon-joined parts, hex encoded.
pub fn build_idempotency_key(parts: &[&str]) -> String {
    let value = parts.join(":");
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Canonical key for a (workspace, crm, object, action, event) tuple.
pub fn build_crm_idempotency_key(input: &CrmIdempotencyInput<'_>) -> String {
    let workspace = input.workspace_id.to_string();
    build_idempotency_key(&[
        &workspace,
        input.crm_system.as_str(),
        input.object_type,
        input.object_id,
        input.action,
        input.source_event_id,
    ])
}

/// Order-independent content hash of a JSON payload.
pub fn hash_payload(payload: &Value) -> String {
    hex::encode(Sha256::digest(stable_stringify(payload).as_bytes()))
}

/// Deterministic JSON serialization: object keys sorted lexicographically
/// at every level.
pub fn stable_stringify(value: &Value) -> String {
    match value {
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(stable_stringify).collect();
            format!("[{}]", inner.join(","))
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            let inner: Vec<String> = entries
                .iter()
                .map(|(key, item)| {
                    format!("{}:{}", Value::String((*key).clone()), stable_stringify(item))
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        other => other.to_string(),
    }
}
