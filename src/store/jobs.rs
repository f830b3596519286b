//! Durable job queue.
//!
//! Claiming is a single `UPDATE ... WHERE id = (SELECT ...) RETURNING *`
//! statement; the database's write serialization means racing workers each
//! claim a distinct row. Jobs are never deleted, only transitioned.

use chrono::{DateTime, Duration, Utc};
use libsql::params;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::types::{Job, JobStatus, JobType};
use crate::store::db::{Database, parse_datetime, parse_optional_datetime};

#[derive(Clone)]
pub struct JobStore {
    db: Database,
}

const JOB_COLUMNS: &str = "id, workspace_id, job_type, status, payload, attempts, run_after, \
     locked_at, locked_by, last_error, created_at, updated_at";

fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("job row id: {e}")))?;
    let workspace_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("job row workspace_id: {e}")))?;
    let type_str: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("job row job_type: {e}")))?;
    let status_str: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("job row status: {e}")))?;
    let payload_str: String = row.get(4).unwrap_or_else(|_| "{}".to_string());
    let attempts: i64 = row.get(5).unwrap_or(0);
    let run_after_str: String = row.get(6).unwrap_or_default();
    let locked_at_str: Option<String> = row.get(7).ok();
    let locked_by: Option<String> = row.get(8).ok();
    let last_error: Option<String> = row.get(9).ok();
    let created_str: String = row.get(10).unwrap_or_default();
    let updated_str: String = row.get(11).unwrap_or_default();

    let job_type = JobType::parse(&type_str).ok_or_else(|| DatabaseError::Query(format!(
        "job row has unknown type {type_str}"
    )))?;
    let payload: Value = serde_json::from_str(&payload_str)
        .map_err(|e| DatabaseError::Serialization(format!("job payload: {e}")))?;

    Ok(Job {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Query(format!("job row id parse: {e}")))?,
        workspace_id: Uuid::parse_str(&workspace_str)
            .map_err(|e| DatabaseError::Query(format!("job row workspace parse: {e}")))?,
        job_type,
        status: JobStatus::parse(&status_str),
        payload,
        attempts: attempts as u32,
        run_after: parse_datetime(&run_after_str),
        locked_at: parse_optional_datetime(&locked_at_str),
        locked_by,
        last_error,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

impl JobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a queued job, runnable immediately.
    pub async fn enqueue(
        &self,
        workspace_id: Uuid,
        job_type: JobType,
        payload: &Value,
    ) -> Result<Uuid, DatabaseError> {
        self.enqueue_after(workspace_id, job_type, payload, Utc::now())
            .await
    }

    /// Insert a queued job that becomes runnable at `run_after`.
    pub async fn enqueue_after(
        &self,
        workspace_id: Uuid,
        job_type: JobType,
        payload: &Value,
        run_after: DateTime<Utc>,
    ) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        let payload_str = serde_json::to_string(payload)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.db
            .conn()
            .execute(
                "INSERT INTO jobs (id, workspace_id, job_type, status, payload, attempts,
                    run_after, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'queued', ?4, 0, ?5, ?6, ?6)",
                params![
                    id.to_string(),
                    workspace_id.to_string(),
                    job_type.as_str(),
                    payload_str,
                    run_after.to_rfc3339(),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue: {e}")))?;

        debug!(job_id = %id, job_type = %job_type, "Job enqueued");
        Ok(id)
    }

    /// Atomically claim the oldest runnable job, if any.
    pub async fn claim_next(&self, locked_by: &str) -> Result<Option<Job>, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let mut rows = self
            .db
            .conn()
            .query(
                &format!(
                    "UPDATE jobs
                     SET status = 'running', locked_at = ?1, locked_by = ?2,
                         attempts = attempts + 1, updated_at = ?1
                     WHERE id = (
                         SELECT id FROM jobs
                         WHERE status = 'queued' AND run_after <= ?1
                         ORDER BY created_at
                         LIMIT 1
                     )
                     RETURNING {JOB_COLUMNS}"
                ),
                params![now, locked_by],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_next: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("claim_next: {e}"))),
        }
    }

    pub async fn complete(&self, job_id: Uuid) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.db
            .conn()
            .execute(
                "UPDATE jobs SET status = 'succeeded', locked_at = NULL, locked_by = NULL,
                    updated_at = ?1 WHERE id = ?2",
                params![now, job_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete: {e}")))?;
        debug!(job_id = %job_id, "Job completed");
        Ok(())
    }

    /// Mark a job failed with its error message. No auto-retry.
    pub async fn fail(&self, job_id: Uuid, error: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.db
            .conn()
            .execute(
                "UPDATE jobs SET status = 'failed', locked_at = NULL, locked_by = NULL,
                    last_error = ?1, updated_at = ?2 WHERE id = ?3",
                params![error, now, job_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail: {e}")))?;
        warn!(job_id = %job_id, error, "Job failed");
        Ok(())
    }

    /// Return jobs stuck in `running` past `max_age` to the queue.
    ///
    /// A worker that dies mid-job leaves its claim locked; the sweep makes
    /// the job runnable again so another worker picks it up.
    pub async fn reclaim_stale(&self, max_age: std::time::Duration) -> Result<u64, DatabaseError> {
        let now = Utc::now();
        let cutoff = now - Duration::seconds(max_age.as_secs() as i64);
        let count = self
            .db
            .conn()
            .execute(
                "UPDATE jobs SET status = 'queued', locked_at = NULL, locked_by = NULL,
                    updated_at = ?1
                 WHERE status = 'running' AND locked_at IS NOT NULL AND locked_at < ?2",
                params![now.to_rfc3339(), cutoff.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reclaim_stale: {e}")))?;
        if count > 0 {
            info!(count, "Reclaimed stale running jobs");
        }
        Ok(count)
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![job_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get job: {e}"))),
        }
    }

    /// Jobs of a type for a workspace, newest first. Used by tests and the
    /// digest processor.
    pub async fn list_by_type(
        &self,
        workspace_id: Uuid,
        job_type: JobType,
    ) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE workspace_id = ?1 AND job_type = ?2
                     ORDER BY created_at DESC"
                ),
                params![workspace_id.to_string(), job_type.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_by_type: {e}")))?;

        let mut jobs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> JobStore {
        JobStore::new(Database::new_memory().await.unwrap())
    }

    #[tokio::test]
    async fn claim_transitions_and_increments_attempts() {
        let store = store().await;
        let ws = Uuid::new_v4();
        let id = store
            .enqueue(ws, JobType::ExtractThread, &json!({ "thread_id": Uuid::new_v4() }))
            .await
            .unwrap();

        let job = store.claim_next("worker-1").await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.locked_by.as_deref(), Some("worker-1"));

        // Nothing else to claim
        assert!(store.claim_next("worker-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_respects_run_after() {
        let store = store().await;
        let ws = Uuid::new_v4();
        store
            .enqueue_after(
                ws,
                JobType::ReconcileCrmWrites,
                &json!({}),
                Utc::now() + Duration::hours(1),
            )
            .await
            .unwrap();
        assert!(store.claim_next("worker-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_is_oldest_first() {
        let store = store().await;
        let ws = Uuid::new_v4();
        let first = store.enqueue(ws, JobType::WeeklyDigest, &json!({})).await.unwrap();
        let _second = store.enqueue(ws, JobType::WeeklyDigest, &json!({})).await.unwrap();

        let claimed = store.claim_next("worker-1").await.unwrap().unwrap();
        assert_eq!(claimed.id, first);
    }

    #[tokio::test]
    async fn complete_and_fail_release_the_lock() {
        let store = store().await;
        let ws = Uuid::new_v4();
        store.enqueue(ws, JobType::WeeklyDigest, &json!({})).await.unwrap();
        let job = store.claim_next("worker-1").await.unwrap().unwrap();
        store.complete(job.id).await.unwrap();
        let done = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert!(done.locked_by.is_none());

        store.enqueue(ws, JobType::WeeklyDigest, &json!({})).await.unwrap();
        let job = store.claim_next("worker-1").await.unwrap().unwrap();
        store.fail(job.id, "boom").await.unwrap();
        let failed = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn stale_jobs_return_to_queue() {
        let store = store().await;
        let ws = Uuid::new_v4();
        store.enqueue(ws, JobType::WeeklyDigest, &json!({})).await.unwrap();
        let job = store.claim_next("worker-1").await.unwrap().unwrap();

        // Fresh lock is untouched
        let count = store
            .reclaim_stale(std::time::Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(count, 0);

        // Age the lock past the threshold
        let old = (Utc::now() - Duration::minutes(20)).to_rfc3339();
        store
            .db
            .conn()
            .execute(
                "UPDATE jobs SET locked_at = ?1 WHERE id = ?2",
                params![old, job.id.to_string()],
            )
            .await
            .unwrap();

        let count = store
            .reclaim_stale(std::time::Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(count, 1);
        let reclaimed = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(reclaimed.status, JobStatus::Queued);
        assert!(reclaimed.locked_by.is_none());
    }
}
