//! CRM write log.
//!
//! Every outbound CRM mutation gets a row here before anything external
//! happens. The UNIQUE idempotency key makes planning a no-op for work
//! already recorded, and reconciliation drives retries off the
//! `failed` rows' `next_retry_at`.

use chrono::{DateTime, Utc};
use libsql::params;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::crm::CrmSystem;
use crate::error::DatabaseError;
use crate::store::db::{Database, opt_datetime, parse_optional_datetime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    DryRun,
    Queued,
    Succeeded,
    Failed,
    PermanentFailure,
}

impl WriteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteStatus::DryRun => "dry_run",
            WriteStatus::Queued => "queued",
            WriteStatus::Succeeded => "succeeded",
            WriteStatus::Failed => "failed",
            WriteStatus::PermanentFailure => "permanent_failure",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "dry_run" => WriteStatus::DryRun,
            "succeeded" => WriteStatus::Succeeded,
            "failed" => WriteStatus::Failed,
            "permanent_failure" => WriteStatus::PermanentFailure,
            _ => WriteStatus::Queued,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrmWriteRecord {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub crm: CrmSystem,
    pub object_type: String,
    pub object_id: String,
    pub action: String,
    pub idempotency_key: String,
    pub status: WriteStatus,
    pub payload: Value,
    pub payload_hash: String,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub external_ids: Option<Value>,
    pub response: Option<Value>,
    pub last_error: Option<String>,
}

/// Outcome of planning a write.
#[derive(Debug, Clone)]
pub enum PlanOutcome {
    /// A new log row was created.
    Created(Uuid),
    /// A row with this idempotency key already exists.
    Existing(CrmWriteRecord),
}

/// What to insert when planning a write.
#[derive(Debug, Clone)]
pub struct PlannedWrite<'a> {
    pub workspace_id: Uuid,
    pub crm: CrmSystem,
    pub object_type: &'a str,
    pub object_id: &'a str,
    pub action: &'a str,
    pub idempotency_key: &'a str,
    pub payload: &'a Value,
    pub payload_hash: &'a str,
}

const WRITE_COLUMNS: &str = "id, workspace_id, crm_system, object_type, object_id, action, \
     idempotency_key, status, payload_json, payload_hash, retry_count, next_retry_at, \
     external_ids_json, response_json, last_error";

fn row_to_record(row: &libsql::Row) -> Result<CrmWriteRecord, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("write row id: {e}")))?;
    let ws_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("write row workspace_id: {e}")))?;
    let crm_str: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("write row crm_system: {e}")))?;
    let object_type: String = row.get(3).unwrap_or_default();
    let object_id: String = row.get(4).unwrap_or_default();
    let action: String = row.get(5).unwrap_or_default();
    let idempotency_key: String = row.get(6).unwrap_or_default();
    let status_str: String = row.get(7).unwrap_or_default();
    let payload_str: String = row.get(8).unwrap_or_else(|_| "null".to_string());
    let payload_hash: String = row.get(9).unwrap_or_default();
    let retry_count: i64 = row.get(10).unwrap_or(0);
    let next_retry_str: Option<String> = row.get(11).ok();
    let external_str: Option<String> = row.get(12).ok();
    let response_str: Option<String> = row.get(13).ok();
    let last_error: Option<String> = row.get(14).ok();

    let crm = CrmSystem::parse(&crm_str).ok_or_else(|| {
        DatabaseError::Query(format!("write row has unknown crm {crm_str}"))
    })?;

    Ok(CrmWriteRecord {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Query(format!("write row id parse: {e}")))?,
        workspace_id: Uuid::parse_str(&ws_str)
            .map_err(|e| DatabaseError::Query(format!("write row workspace parse: {e}")))?,
        crm,
        object_type,
        object_id,
        action,
        idempotency_key,
        status: WriteStatus::parse(&status_str),
        payload: serde_json::from_str(&payload_str).unwrap_or(Value::Null),
        payload_hash,
        retry_count: retry_count as u32,
        next_retry_at: parse_optional_datetime(&next_retry_str),
        external_ids: external_str.and_then(|s| serde_json::from_str(&s).ok()),
        response: response_str.and_then(|s| serde_json::from_str(&s).ok()),
        last_error,
    })
}

#[derive(Clone)]
pub struct CrmWriteStore {
    db: Database,
}

impl CrmWriteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert the planned write unless its key already exists.
    pub async fn plan_write(
        &self,
        write: &PlannedWrite<'_>,
        status: WriteStatus,
    ) -> Result<PlanOutcome, DatabaseError> {
        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        let payload_json = serde_json::to_string(write.payload)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let inserted = self
            .db
            .conn()
            .execute(
                "INSERT OR IGNORE INTO crm_write_log (id, workspace_id, crm_system, object_type,
                    object_id, action, idempotency_key, status, payload_json, payload_hash,
                    retry_count, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?11)",
                params![
                    id.to_string(),
                    write.workspace_id.to_string(),
                    write.crm.as_str(),
                    write.object_type,
                    write.object_id,
                    write.action,
                    write.idempotency_key,
                    status.as_str(),
                    payload_json,
                    write.payload_hash,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("plan_write: {e}")))?;

        if inserted > 0 {
            debug!(
                idempotency_key = write.idempotency_key,
                status = status.as_str(),
                "CRM write planned"
            );
            return Ok(PlanOutcome::Created(id));
        }

        let existing = self
            .get_by_key(write.idempotency_key)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "crm_write_log".into(),
                id: write.idempotency_key.into(),
            })?;
        Ok(PlanOutcome::Existing(existing))
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<CrmWriteRecord>, DatabaseError> {
        self.fetch_one("id = ?1", id.to_string()).await
    }

    pub async fn get_by_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<CrmWriteRecord>, DatabaseError> {
        self.fetch_one("idempotency_key = ?1", idempotency_key.to_string())
            .await
    }

    async fn fetch_one(
        &self,
        filter: &str,
        param: String,
    ) -> Result<Option<CrmWriteRecord>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                &format!("SELECT {WRITE_COLUMNS} FROM crm_write_log WHERE {filter}"),
                params![param],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch crm write: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("fetch crm write: {e}"))),
        }
    }

    pub async fn mark_succeeded(
        &self,
        id: Uuid,
        external_ids: &Value,
        response: &Value,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let external = serde_json::to_string(external_ids)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let response = serde_json::to_string(response)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.db
            .conn()
            .execute(
                "UPDATE crm_write_log SET status = 'succeeded', external_ids_json = ?1,
                    response_json = ?2, last_error = NULL, next_retry_at = NULL, updated_at = ?3
                 WHERE id = ?4",
                params![external, response, now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_succeeded: {e}")))?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.db
            .conn()
            .execute(
                "UPDATE crm_write_log SET status = 'failed', last_error = ?1, updated_at = ?2
                 WHERE id = ?3",
                params![error, now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_failed: {e}")))?;
        warn!(write_id = %id, error, "CRM write failed");
        Ok(())
    }

    /// Record the next scheduled retry for a failed write.
    pub async fn schedule_retry(
        &self,
        id: Uuid,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.db
            .conn()
            .execute(
                "UPDATE crm_write_log SET retry_count = ?1, next_retry_at = ?2, updated_at = ?3
                 WHERE id = ?4",
                params![
                    retry_count as i64,
                    opt_datetime(Some(next_retry_at)),
                    now,
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("schedule_retry: {e}")))?;
        Ok(())
    }

    pub async fn mark_permanent_failure(&self, id: Uuid) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.db
            .conn()
            .execute(
                "UPDATE crm_write_log SET status = 'permanent_failure', next_retry_at = NULL,
                    updated_at = ?1 WHERE id = ?2",
                params![now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_permanent_failure: {e}")))?;
        warn!(write_id = %id, "CRM write marked permanent failure");
        Ok(())
    }

    /// Failed writes of one workspace whose retry time has arrived, oldest
    /// first. Queued rows are included so a write whose sync job was lost
    /// still gets picked up; re-running a completed sync is a no-op. The
    /// workspace filter keeps a busy tenant from crowding others out of
    /// the batch.
    pub async fn due_retries(
        &self,
        workspace_id: Uuid,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<CrmWriteRecord>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                &format!(
                    "SELECT {WRITE_COLUMNS} FROM crm_write_log
                     WHERE workspace_id = ?1
                       AND status IN ('failed', 'queued')
                       AND (next_retry_at IS NULL OR next_retry_at <= ?2)
                     ORDER BY updated_at
                     LIMIT ?3"
                ),
                params![workspace_id.to_string(), now.to_rfc3339(), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("due_retries: {e}")))?;

        let mut records = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    async fn store() -> CrmWriteStore {
        CrmWriteStore::new(Database::new_memory().await.unwrap())
    }

    fn planned<'a>(ws: &'a Uuid, key: &'a str, payload: &'a Value) -> PlannedWrite<'a> {
        PlannedWrite {
            workspace_id: *ws,
            crm: CrmSystem::Hubspot,
            object_type: "thread",
            object_id: "t-1",
            action: "sync",
            idempotency_key: key,
            payload,
            payload_hash: "hash",
        }
    }

    #[tokio::test]
    async fn duplicate_key_is_a_noop() {
        let store = store().await;
        let ws = Uuid::new_v4();
        let payload = json!({ "email": "ana@acme.com" });

        let first = store
            .plan_write(&planned(&ws, "key-1", &payload), WriteStatus::Queued)
            .await
            .unwrap();
        let PlanOutcome::Created(id) = first else {
            panic!("expected a new row");
        };

        let second = store
            .plan_write(&planned(&ws, "key-1", &payload), WriteStatus::Queued)
            .await
            .unwrap();
        let PlanOutcome::Existing(record) = second else {
            panic!("expected the existing row");
        };
        assert_eq!(record.id, id);
        assert_eq!(record.status, WriteStatus::Queued);
    }

    #[tokio::test]
    async fn success_clears_error_state() {
        let store = store().await;
        let ws = Uuid::new_v4();
        let payload = json!({});
        let PlanOutcome::Created(id) = store
            .plan_write(&planned(&ws, "key-1", &payload), WriteStatus::Queued)
            .await
            .unwrap()
        else {
            panic!("expected a new row");
        };

        store.mark_failed(id, "boom (500)").await.unwrap();
        store.schedule_retry(id, 1, Utc::now()).await.unwrap();
        store
            .mark_succeeded(id, &json!({ "contact_id": "c-9" }), &json!({ "ok": true }))
            .await
            .unwrap();

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, WriteStatus::Succeeded);
        assert!(record.last_error.is_none());
        assert!(record.next_retry_at.is_none());
        assert_eq!(record.external_ids.unwrap()["contact_id"], "c-9");
    }

    #[tokio::test]
    async fn due_retries_honors_schedule_and_status() {
        let store = store().await;
        let ws = Uuid::new_v4();
        let payload = json!({});

        let PlanOutcome::Created(due) = store
            .plan_write(&planned(&ws, "due", &payload), WriteStatus::Queued)
            .await
            .unwrap()
        else {
            panic!();
        };
        store.mark_failed(due, "x").await.unwrap();
        store
            .schedule_retry(due, 1, Utc::now() - Duration::minutes(1))
            .await
            .unwrap();

        let PlanOutcome::Created(later) = store
            .plan_write(&planned(&ws, "later", &payload), WriteStatus::Queued)
            .await
            .unwrap()
        else {
            panic!();
        };
        store.mark_failed(later, "x").await.unwrap();
        store
            .schedule_retry(later, 1, Utc::now() + Duration::hours(1))
            .await
            .unwrap();

        let PlanOutcome::Created(dead) = store
            .plan_write(&planned(&ws, "dead", &payload), WriteStatus::Queued)
            .await
            .unwrap()
        else {
            panic!();
        };
        store.mark_failed(dead, "x").await.unwrap();
        store.mark_permanent_failure(dead).await.unwrap();

        // Queued but never picked up by a sync job: eligible right away.
        let PlanOutcome::Created(orphaned) = store
            .plan_write(&planned(&ws, "orphaned", &payload), WriteStatus::Queued)
            .await
            .unwrap()
        else {
            panic!();
        };

        // Another workspace's due write must not appear in this batch.
        let other_ws = Uuid::new_v4();
        let PlanOutcome::Created(foreign) = store
            .plan_write(&planned(&other_ws, "foreign", &payload), WriteStatus::Queued)
            .await
            .unwrap()
        else {
            panic!();
        };
        store.mark_failed(foreign, "x").await.unwrap();

        let eligible = store.due_retries(ws, Utc::now(), 200).await.unwrap();
        let ids: Vec<Uuid> = eligible.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![due, orphaned]);
    }
}
