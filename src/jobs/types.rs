//! Job records and typed payloads.
//!
//! The `jobs.payload` column stores untagged JSON; the `job_type` column is
//! the discriminant. [`JobPayload`] pairs the two back up so processors
//! never poke at raw JSON.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::JobError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobType {
    ExtractThread,
    AssociateThread,
    SyncHubspot,
    SyncSalesforce,
    WeeklyRollup,
    WeeklyDigest,
    OcrTextract,
    ReconcileConnections,
    ReconcileCrmWrites,
    PurgeRetention,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ExtractThread => "extract_thread",
            JobType::AssociateThread => "associate_thread",
            JobType::SyncHubspot => "sync_hubspot",
            JobType::SyncSalesforce => "sync_salesforce",
            JobType::WeeklyRollup => "weekly_rollup",
            JobType::WeeklyDigest => "weekly_digest",
            JobType::OcrTextract => "ocr_textract",
            JobType::ReconcileConnections => "reconcile_connections",
            JobType::ReconcileCrmWrites => "reconcile_crm_writes",
            JobType::PurgeRetention => "purge_retention",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "extract_thread" => Some(JobType::ExtractThread),
            "associate_thread" => Some(JobType::AssociateThread),
            "sync_hubspot" => Some(JobType::SyncHubspot),
            "sync_salesforce" => Some(JobType::SyncSalesforce),
            "weekly_rollup" => Some(JobType::WeeklyRollup),
            "weekly_digest" => Some(JobType::WeeklyDigest),
            "ocr_textract" => Some(JobType::OcrTextract),
            "reconcile_connections" => Some(JobType::ReconcileConnections),
            "reconcile_crm_writes" => Some(JobType::ReconcileCrmWrites),
            "purge_retention" => Some(JobType::PurgeRetention),
            _ => None,
        }
    }

    /// The sync job type for a CRM system.
    pub fn sync_for(crm: crate::crm::CrmSystem) -> Self {
        match crm {
            crate::crm::CrmSystem::Hubspot => JobType::SyncHubspot,
            crate::crm::CrmSystem::Salesforce => JobType::SyncSalesforce,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "running" => JobStatus::Running,
            "succeeded" => JobStatus::Succeeded,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Queued,
        }
    }
}

// ── Payloads ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadPayload {
    pub thread_id: Uuid,
}

/// Payload of the per-CRM sync jobs.
///
/// Enqueued with a thread to sync; reconciliation re-enqueues with the
/// write-log row to retry instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SyncPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crm_write_log_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RollupPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub week_start: Option<NaiveDate>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrPayload {
    pub attachment_id: Uuid,
}

/// Typed view of a job's payload column, keyed by [`JobType`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    ExtractThread(ThreadPayload),
    AssociateThread(ThreadPayload),
    Sync(SyncPayload),
    WeeklyRollup(RollupPayload),
    WeeklyDigest,
    OcrTextract(OcrPayload),
    ReconcileConnections,
    ReconcileCrmWrites,
    PurgeRetention,
}

impl JobPayload {
    /// Encode the payload for the JSON column.
    pub fn encode(&self) -> Value {
        match self {
            JobPayload::ExtractThread(p) | JobPayload::AssociateThread(p) => {
                serde_json::to_value(p).unwrap_or_default()
            }
            JobPayload::Sync(p) => serde_json::to_value(p).unwrap_or_default(),
            JobPayload::WeeklyRollup(p) => serde_json::to_value(p).unwrap_or_default(),
            JobPayload::OcrTextract(p) => serde_json::to_value(p).unwrap_or_default(),
            JobPayload::WeeklyDigest
            | JobPayload::ReconcileConnections
            | JobPayload::ReconcileCrmWrites
            | JobPayload::PurgeRetention => Value::Object(serde_json::Map::new()),
        }
    }

    /// Decode the payload column for a job of the given type.
    pub fn decode(job_id: Uuid, job_type: JobType, raw: &Value) -> Result<Self, JobError> {
        let invalid = |e: serde_json::Error| JobError::InvalidPayload {
            id: job_id,
            reason: e.to_string(),
        };
        match job_type {
            JobType::ExtractThread => {
                Ok(JobPayload::ExtractThread(
                    serde_json::from_value(raw.clone()).map_err(invalid)?,
                ))
            }
            JobType::AssociateThread => {
                Ok(JobPayload::AssociateThread(
                    serde_json::from_value(raw.clone()).map_err(invalid)?,
                ))
            }
            JobType::SyncHubspot | JobType::SyncSalesforce => {
                Ok(JobPayload::Sync(
                    serde_json::from_value(raw.clone()).map_err(invalid)?,
                ))
            }
            JobType::WeeklyRollup => {
                Ok(JobPayload::WeeklyRollup(
                    serde_json::from_value(raw.clone()).map_err(invalid)?,
                ))
            }
            JobType::OcrTextract => {
                Ok(JobPayload::OcrTextract(
                    serde_json::from_value(raw.clone()).map_err(invalid)?,
                ))
            }
            JobType::WeeklyDigest => Ok(JobPayload::WeeklyDigest),
            JobType::ReconcileConnections => Ok(JobPayload::ReconcileConnections),
            JobType::ReconcileCrmWrites => Ok(JobPayload::ReconcileCrmWrites),
            JobType::PurgeRetention => Ok(JobPayload::PurgeRetention),
        }
    }
}

/// A row from the jobs table.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub payload: Value,
    pub attempts: u32,
    pub run_after: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Decode the payload column against this job's type.
    pub fn typed_payload(&self) -> Result<JobPayload, JobError> {
        JobPayload::decode(self.id, self.job_type, &self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_type_round_trip() {
        let all = [
            JobType::ExtractThread,
            JobType::AssociateThread,
            JobType::SyncHubspot,
            JobType::SyncSalesforce,
            JobType::WeeklyRollup,
            JobType::WeeklyDigest,
            JobType::OcrTextract,
            JobType::ReconcileConnections,
            JobType::ReconcileCrmWrites,
            JobType::PurgeRetention,
        ];
        for ty in all {
            assert_eq!(JobType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(JobType::parse("mystery"), None);
    }

    #[test]
    fn payload_encode_decode() {
        let thread_id = Uuid::new_v4();
        let payload = JobPayload::ExtractThread(ThreadPayload { thread_id });
        let encoded = payload.encode();
        let decoded =
            JobPayload::decode(Uuid::new_v4(), JobType::ExtractThread, &encoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn sync_payload_fields_are_optional() {
        let decoded =
            JobPayload::decode(Uuid::new_v4(), JobType::SyncHubspot, &json!({})).unwrap();
        assert_eq!(decoded, JobPayload::Sync(SyncPayload::default()));

        let log_id = Uuid::new_v4();
        let decoded = JobPayload::decode(
            Uuid::new_v4(),
            JobType::SyncSalesforce,
            &json!({ "crm_write_log_id": log_id }),
        )
        .unwrap();
        assert_eq!(
            decoded,
            JobPayload::Sync(SyncPayload {
                thread_id: None,
                crm_write_log_id: Some(log_id),
            })
        );
    }

    #[test]
    fn invalid_payload_is_rejected() {
        let err = JobPayload::decode(
            Uuid::new_v4(),
            JobType::ExtractThread,
            &json!({ "thread_id": "not-a-uuid" }),
        )
        .unwrap_err();
        assert!(matches!(err, crate::error::JobError::InvalidPayload { .. }));
    }

    #[test]
    fn parameterless_payloads_encode_empty_objects() {
        assert_eq!(JobPayload::PurgeRetention.encode(), json!({}));
        assert_eq!(JobPayload::ReconcileCrmWrites.encode(), json!({}));
    }
}
