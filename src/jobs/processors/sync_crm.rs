//! Idempotent CRM write execution.
//!
//! Every write is planned into the write log before anything leaves the
//! process. The idempotency key makes replanning a no-op, and a row that
//! already succeeded short-circuits with zero CRM calls, so the job can be
//! re-run safely at any point.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::crm::CrmSystem;
use crate::crm::client::CrmWriteRequest;
use crate::error::{CrmError, DatabaseError, Error, JobError, Result};
use crate::extraction::{FieldKey, field_by_key};
use crate::idempotency::{CrmIdempotencyInput, build_crm_idempotency_key, hash_payload};
use crate::jobs::processors::{JobProcessor, ProcessorContext};
use crate::jobs::types::{Job, JobPayload, SyncPayload};
use crate::store::audit::events;
use crate::store::crm_writes::{CrmWriteRecord, PlanOutcome, PlannedWrite, WriteStatus};

/// Version of the thread sync payload shape; part of the idempotency key
/// so a schema change produces a fresh write instead of a stale no-op.
pub const SYNC_SCHEMA_VERSION: &str = "v1";

/// Action recorded for the combined contact-plus-note thread sync.
pub const SYNC_THREAD_ACTION: &str = "sync_thread";

pub struct SyncCrm {
    crm: CrmSystem,
}

impl SyncCrm {
    pub fn new(crm: CrmSystem) -> Self {
        Self { crm }
    }
}

#[async_trait]
impl JobProcessor for SyncCrm {
    async fn process(&self, ctx: &ProcessorContext, job: &Job) -> Result<()> {
        let JobPayload::Sync(payload) = job.typed_payload()? else {
            return Err(JobError::MissingPayload {
                field: "sync".into(),
            }
            .into());
        };

        let record = match payload {
            SyncPayload {
                crm_write_log_id: Some(write_id),
                ..
            } => ctx.crm_writes.get(write_id).await?.ok_or_else(|| {
                Error::Database(DatabaseError::NotFound {
                    entity: "crm_write_log".into(),
                    id: write_id.to_string(),
                })
            })?,
            SyncPayload {
                thread_id: Some(thread_id),
                ..
            } => match self.plan_thread_sync(ctx, job, thread_id).await? {
                Some(record) => record,
                None => return Ok(()),
            },
            _ => {
                return Err(JobError::MissingPayload {
                    field: "thread_id or crm_write_log_id".into(),
                }
                .into());
            }
        };

        if record.status == WriteStatus::Succeeded {
            debug!(write_id = %record.id, "Write already succeeded, nothing to send");
            return Ok(());
        }
        if ctx.config.dry_run || record.status == WriteStatus::DryRun {
            debug!(write_id = %record.id, "Dry run, write stays planned");
            return Ok(());
        }

        self.execute(ctx, job, &record).await
    }
}

impl SyncCrm {
    /// Plan the write row for a thread, or return `None` when nothing new
    /// needs to be sent.
    async fn plan_thread_sync(
        &self,
        ctx: &ProcessorContext,
        job: &Job,
        thread_id: Uuid,
    ) -> Result<Option<CrmWriteRecord>> {
        let workspace_id = job.workspace_id;
        let thread = ctx.threads.get_thread(thread_id).await?.ok_or_else(|| {
            Error::Database(DatabaseError::NotFound {
                entity: "thread".into(),
                id: thread_id.to_string(),
            })
        })?;

        let fields = ctx.threads.fields_for_thread(thread_id).await?;
        let payload = json!({
            "contact": {
                "email": field_value(&fields, FieldKey::Email),
                "name": field_value(&fields, FieldKey::Name),
                "company": field_value(&fields, FieldKey::Company),
            },
            "note": {
                "subject": thread.subject,
                "intent": field_value(&fields, FieldKey::Intent),
            },
        });

        let object_id = thread_id.to_string();
        let idempotency_key = build_crm_idempotency_key(&CrmIdempotencyInput {
            workspace_id,
            crm_system: self.crm,
            object_type: "thread",
            object_id: &object_id,
            action: SYNC_THREAD_ACTION,
            source_event_id: SYNC_SCHEMA_VERSION,
        });
        let payload_hash = hash_payload(&payload);
        let status = if ctx.config.dry_run {
            WriteStatus::DryRun
        } else {
            WriteStatus::Queued
        };

        let outcome = ctx
            .crm_writes
            .plan_write(
                &PlannedWrite {
                    workspace_id,
                    crm: self.crm,
                    object_type: "thread",
                    object_id: &object_id,
                    action: SYNC_THREAD_ACTION,
                    idempotency_key: &idempotency_key,
                    payload: &payload,
                    payload_hash: &payload_hash,
                },
                status,
            )
            .await?;

        match outcome {
            PlanOutcome::Created(write_id) => {
                ctx.audit
                    .append(
                        workspace_id,
                        Some(thread_id),
                        Some(job.id),
                        events::CRM_WRITE_PLANNED,
                        &json!({
                            "write_id": write_id,
                            "action": SYNC_THREAD_ACTION,
                            "crm": self.crm.as_str(),
                            "dry_run": ctx.config.dry_run,
                        }),
                    )
                    .await?;
                Ok(ctx.crm_writes.get(write_id).await?)
            }
            PlanOutcome::Existing(existing) => {
                if existing.status == WriteStatus::Succeeded {
                    info!(
                        write_id = %existing.id,
                        "Thread already synced, skipping"
                    );
                    return Ok(None);
                }
                Ok(Some(existing))
            }
        }
    }

    /// Send a planned write to the CRM and settle its log row.
    async fn execute(&self, ctx: &ProcessorContext, job: &Job, record: &CrmWriteRecord) -> Result<()> {
        let workspace_id = record.workspace_id;
        match self.send(ctx, record, workspace_id).await {
            Ok((external_ids, response)) => {
                ctx.crm_writes
                    .mark_succeeded(record.id, &external_ids, &response)
                    .await?;
                info!(
                    write_id = %record.id,
                    crm = %self.crm,
                    action = record.action,
                    job_id = %job.id,
                    "CRM write succeeded"
                );
                Ok(())
            }
            Err(e) => {
                let detail = e.to_string();
                ctx.crm_writes.mark_failed(record.id, &detail).await?;
                if e.is_auth_failure() {
                    ctx.workspaces
                        .flag_connection_error(workspace_id, self.crm, &detail)
                        .await?;
                }
                warn!(write_id = %record.id, error = detail, "CRM write failed");
                Err(e.into())
            }
        }
    }

    async fn send(
        &self,
        ctx: &ProcessorContext,
        record: &CrmWriteRecord,
        workspace_id: Uuid,
    ) -> std::result::Result<(Value, Value), CrmError> {
        let token = ctx
            .capabilities
            .tokens
            .get_access_token(workspace_id, self.crm)
            .await?;
        debug!(crm = %self.crm, token_len = token.len(), "Access token obtained");

        if record.action == SYNC_THREAD_ACTION {
            // Thread sync is two dependent writes: the contact first, then
            // the note attached to it.
            let contact = ctx
                .capabilities
                .crm_client
                .execute_write(&CrmWriteRequest {
                    workspace_id,
                    crm: self.crm,
                    object_type: "contact".into(),
                    object_id: record.object_id.clone(),
                    action: "upsert_contact".into(),
                    payload: record.payload.get("contact").cloned().unwrap_or(Value::Null),
                })
                .await?;
            let note = ctx
                .capabilities
                .crm_client
                .execute_write(&CrmWriteRequest {
                    workspace_id,
                    crm: self.crm,
                    object_type: "note".into(),
                    object_id: record.object_id.clone(),
                    action: "create_note".into(),
                    payload: record.payload.get("note").cloned().unwrap_or(Value::Null),
                })
                .await?;
            let external_ids = json!({
                "contact_id": contact.get("id"),
                "note_id": note.get("id"),
            });
            Ok((external_ids, json!({ "contact": contact, "note": note })))
        } else {
            let response = ctx
                .capabilities
                .crm_client
                .execute_write(&CrmWriteRequest {
                    workspace_id,
                    crm: self.crm,
                    object_type: record.object_type.clone(),
                    object_id: record.object_id.clone(),
                    action: record.action.clone(),
                    payload: record.payload.clone(),
                })
                .await?;
            let external_ids = json!({ "id": response.get("id") });
            Ok((external_ids, response))
        }
    }
}

fn field_value(fields: &[crate::extraction::ExtractedField], key: FieldKey) -> Value {
    field_by_key(fields, key)
        .map(|f| f.field_value_json.clone())
        .unwrap_or(Value::Null)
}
