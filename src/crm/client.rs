//! CRM write execution.
//!
//! Every side effect against a CRM goes through [`CrmClient::execute_write`]
//! with the already-planned action, object coordinates, and payload. The
//! write log row is created before this trait is called, so an
//! implementation is free to fail; the reconciler handles scheduling.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::crm::CrmSystem;
use crate::error::CrmError;

/// A planned CRM mutation, fully resolved before execution.
#[derive(Debug, Clone, PartialEq)]
pub struct CrmWriteRequest {
    pub workspace_id: Uuid,
    pub crm: CrmSystem,
    pub object_type: String,
    pub object_id: String,
    pub action: String,
    pub payload: Value,
}

/// Executes planned writes against a CRM.
#[async_trait]
pub trait CrmClient: Send + Sync {
    async fn execute_write(&self, request: &CrmWriteRequest) -> Result<Value, CrmError>;
}

/// Client that logs writes without performing them.
///
/// This is the default composition: all planning, idempotency, and audit
/// behavior runs for real while the external call is replaced with a log
/// line and a synthetic response.
pub struct DryRunCrmClient;

#[async_trait]
impl CrmClient for DryRunCrmClient {
    async fn execute_write(&self, request: &CrmWriteRequest) -> Result<Value, CrmError> {
        info!(
            crm = %request.crm,
            action = %request.action,
            object_type = %request.object_type,
            object_id = %request.object_id,
            "dry-run: skipping CRM write"
        );
        Ok(json!({ "dry_run": true, "action": request.action }))
    }
}

/// Client that records every write for assertions in tests.
#[derive(Default)]
pub struct RecordingCrmClient {
    writes: Mutex<Vec<CrmWriteRequest>>,
    pub fail_with: Option<String>,
}

impl RecordingCrmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            writes: Mutex::new(Vec::new()),
            fail_with: Some(reason.to_string()),
        }
    }

    pub fn recorded(&self) -> Vec<CrmWriteRequest> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl CrmClient for RecordingCrmClient {
    async fn execute_write(&self, request: &CrmWriteRequest) -> Result<Value, CrmError> {
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        if let Some(reason) = &self.fail_with {
            return Err(CrmError::RequestFailed {
                crm: request.crm.as_str().to_string(),
                reason: reason.clone(),
            });
        }
        Ok(json!({ "ok": true }))
    }
}
