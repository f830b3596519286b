//! Append-only audit trail.
//!
//! Every governance decision and external side effect leaves an event here;
//! the dashboard and the tests both read this table as the record of what
//! the worker did and why.

use chrono::{DateTime, Utc};
use libsql::params;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::db::{Database, opt_text_owned, parse_datetime};

/// Event type vocabulary.
pub mod events {
    pub const THREAD_AUTO_LINKED: &str = "thread_auto_linked";
    pub const THREAD_NEEDS_LINKING: &str = "thread_needs_linking";
    pub const THREAD_UNLINKED: &str = "thread_unlinked";
    pub const DEAL_READINESS_UPDATED: &str = "deal_readiness_updated";
    pub const POLICY_SYNC_ENQUEUED: &str = "policy.sync_enqueued";
    pub const POLICY_REVIEW_CREATED: &str = "policy.review_created";
    pub const CRM_WRITE_PLANNED: &str = "crm_write_planned";
    pub const WEEKLY_ROLLUP_GENERATED: &str = "weekly_rollup_generated";
    pub const WEEKLY_ROLLUP_LOGGED_TO_CRM: &str = "weekly_rollup_logged_to_crm";
    pub const LLM_ROLLUP_INVALID_OUTPUT: &str = "llm_rollup_invalid_output";
    pub const LLM_ROLLUP_FALLBACK_USED: &str = "llm_rollup_fallback_used";
    pub const LLM_ROLLUP_SKIPPED_DRY_RUN: &str = "llm_rollup_skipped_dry_run";
    pub const LLM_ROLLUP_SKIPPED_NO_CREDENTIAL: &str = "llm_rollup_skipped_no_credential";
    pub const CRM_WRITE_MARKED_PERMANENT_FAILURE: &str = "crm_write_marked_permanent_failure";
    pub const CRM_WRITE_RETRY_SCHEDULED: &str = "crm_write_retry_scheduled";
    pub const CONNECTION_HEALTH_CHECKED: &str = "connection_health_checked";
    pub const RETENTION_PURGE_COMPLETED: &str = "retention_purge_completed";
    pub const DRIFT_ALERT_RAISED: &str = "drift_alert_raised";
    pub const WRITE_PAUSE_OPENED: &str = "write_pause_opened";
    pub const WEEKLY_DIGEST_GENERATED: &str = "weekly_digest_generated";
}

#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub thread_id: Option<Uuid>,
    pub job_id: Option<Uuid>,
    pub event_type: String,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AuditStore {
    db: Database,
}

impl AuditStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn append(
        &self,
        workspace_id: Uuid,
        thread_id: Option<Uuid>,
        job_id: Option<Uuid>,
        event_type: &str,
        data: &Value,
    ) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        let data_json = serde_json::to_string(data)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.db
            .conn()
            .execute(
                "INSERT INTO audit_events (id, workspace_id, thread_id, job_id, event_type,
                    data_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id.to_string(),
                    workspace_id.to_string(),
                    opt_text_owned(thread_id.map(|t| t.to_string())),
                    opt_text_owned(job_id.map(|j| j.to_string())),
                    event_type,
                    data_json,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("audit append: {e}")))?;
        debug!(workspace_id = %workspace_id, event_type, "Audit event appended");
        Ok(id)
    }

    pub async fn list_by_type(
        &self,
        workspace_id: Uuid,
        event_type: &str,
    ) -> Result<Vec<AuditEvent>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT id, workspace_id, thread_id, job_id, event_type, data_json, created_at
                 FROM audit_events
                 WHERE workspace_id = ?1 AND event_type = ?2
                 ORDER BY created_at",
                params![workspace_id.to_string(), event_type],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("audit list_by_type: {e}")))?;

        let mut items = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id_str: String = row.get(0).unwrap_or_default();
            let ws_str: String = row.get(1).unwrap_or_default();
            let thread_str: Option<String> = row.get(2).ok();
            let job_str: Option<String> = row.get(3).ok();
            let event_type: String = row.get(4).unwrap_or_default();
            let data_json: String = row.get(5).unwrap_or_else(|_| "null".to_string());
            let created_str: String = row.get(6).unwrap_or_default();
            let (Ok(id), Ok(workspace_id)) = (Uuid::parse_str(&id_str), Uuid::parse_str(&ws_str))
            else {
                continue;
            };
            items.push(AuditEvent {
                id,
                workspace_id,
                thread_id: thread_str.and_then(|t| Uuid::parse_str(&t).ok()),
                job_id: job_str.and_then(|j| Uuid::parse_str(&j).ok()),
                event_type,
                data: serde_json::from_str(&data_json).unwrap_or(Value::Null),
                created_at: parse_datetime(&created_str),
            });
        }
        Ok(items)
    }

    pub async fn count_by_type(
        &self,
        workspace_id: Uuid,
        event_type: &str,
    ) -> Result<u64, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT COUNT(*) FROM audit_events
                 WHERE workspace_id = ?1 AND event_type = ?2",
                params![workspace_id.to_string(), event_type],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("audit count_by_type: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) as u64),
            _ => Ok(0),
        }
    }
}
