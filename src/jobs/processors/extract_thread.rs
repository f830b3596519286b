//! Extraction, drift detection, and the confidence policy gate.
//!
//! This is the entry point of the pipeline: every inbound thread passes
//! through here before anything downstream may touch a CRM. Drift checks
//! run against the latest message's source key before the policy decides
//! between review and sync.

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use crate::error::{DatabaseError, Error, JobError, Result};
use crate::extraction::{ExtractedField, FieldKey, field_by_key};
use crate::governance::drift::{
    HISTORICAL_MIN_QUALITY, DriftSeverity, SourceMessage, compute_extraction_quality,
    compute_source_key, should_trigger_drift,
};
use crate::governance::policy::{PolicyAction, evaluate_policies};
use crate::jobs::processors::{JobProcessor, ProcessorContext};
use crate::jobs::types::{Job, JobPayload, JobType, SyncPayload, ThreadPayload};
use crate::store::audit::events;
use crate::store::workspaces::PauseScope;

/// Review reason used when drift pauses writes.
pub const DRIFT_REVIEW_REASON: &str = "drift_pause_review";

pub struct ExtractThread;

#[async_trait]
impl JobProcessor for ExtractThread {
    async fn process(&self, ctx: &ProcessorContext, job: &Job) -> Result<()> {
        let JobPayload::ExtractThread(ThreadPayload { thread_id }) = job.typed_payload()? else {
            return Err(JobError::MissingPayload {
                field: "thread_id".into(),
            }
            .into());
        };
        let workspace_id = job.workspace_id;

        let thread = ctx
            .threads
            .get_thread(thread_id)
            .await?
            .ok_or_else(|| {
                Error::Database(DatabaseError::NotFound {
                    entity: "thread".into(),
                    id: thread_id.to_string(),
                })
            })?;

        let messages = ctx.threads.list_messages(thread_id).await?;
        let Some(latest) = messages.last() else {
            debug!(thread_id = %thread_id, "Thread has no messages, nothing to extract");
            return Ok(());
        };

        let body = latest.body_text.as_deref().unwrap_or_default();
        let fields = ctx.capabilities.extractor.run_extraction(body).await;
        ctx.threads
            .insert_fields(workspace_id, thread_id, &fields)
            .await?;

        let source_key = compute_source_key(&SourceMessage {
            from_email: latest.from_email.as_deref(),
            subject: latest.subject.as_deref().or(thread.subject.as_deref()),
            text: latest.body_text.as_deref(),
        });
        let quality = compute_extraction_quality(&fields);

        self.check_drift(ctx, job, thread_id, &source_key, quality)
            .await?;

        if quality >= HISTORICAL_MIN_QUALITY {
            ctx.governance
                .ratchet_quality(workspace_id, &source_key, quality)
                .await?;
        }

        let decision = evaluate_policies(&fields);
        match decision.action {
            PolicyAction::Review => {
                let reason = decision
                    .reason
                    .map(|r| r.as_str())
                    .unwrap_or("policy_review");
                let created = ctx
                    .governance
                    .open_review_if_absent(
                        workspace_id,
                        Some(thread_id),
                        reason,
                        Some(&json!({ "fields": field_summary(&fields) })),
                    )
                    .await?;
                if created.is_some() {
                    ctx.audit
                        .append(
                            workspace_id,
                            Some(thread_id),
                            Some(job.id),
                            events::POLICY_REVIEW_CREATED,
                            &json!({ "reason": reason, "quality": quality }),
                        )
                        .await?;
                }
                info!(thread_id = %thread_id, reason, "Thread routed to review");
            }
            PolicyAction::Sync => {
                ctx.jobs
                    .enqueue(
                        workspace_id,
                        JobType::AssociateThread,
                        &JobPayload::AssociateThread(ThreadPayload { thread_id }).encode(),
                    )
                    .await?;

                let crms = ctx.workspaces.connected_crms(workspace_id).await?;
                for crm in &crms {
                    ctx.jobs
                        .enqueue(
                            workspace_id,
                            JobType::sync_for(*crm),
                            &JobPayload::Sync(SyncPayload {
                                thread_id: Some(thread_id),
                                ..Default::default()
                            })
                            .encode(),
                        )
                        .await?;
                }

                ctx.audit
                    .append(
                        workspace_id,
                        Some(thread_id),
                        Some(job.id),
                        events::POLICY_SYNC_ENQUEUED,
                        &json!({
                            "quality": quality,
                            "crms": crms.iter().map(|c| c.as_str()).collect::<Vec<_>>(),
                        }),
                    )
                    .await?;
                info!(thread_id = %thread_id, quality, "Thread passed policy, sync enqueued");
            }
        }

        Ok(())
    }
}

impl ExtractThread {
    /// Compare against the source baseline and raise alert, pause, and
    /// review when quality collapsed.
    async fn check_drift(
        &self,
        ctx: &ProcessorContext,
        job: &Job,
        thread_id: uuid::Uuid,
        source_key: &str,
        quality: f64,
    ) -> Result<()> {
        let workspace_id = job.workspace_id;
        let Some(historical) = ctx
            .governance
            .last_good_quality(workspace_id, source_key)
            .await?
        else {
            return Ok(());
        };

        if !should_trigger_drift(quality, historical) {
            return Ok(());
        }

        let severity = DriftSeverity::for_quality(quality);
        let alert_id = ctx
            .governance
            .insert_drift_alert(workspace_id, source_key, severity, quality, historical)
            .await?;
        ctx.audit
            .append(
                workspace_id,
                Some(thread_id),
                Some(job.id),
                events::DRIFT_ALERT_RAISED,
                &json!({
                    "alert_id": alert_id,
                    "source_key": source_key,
                    "severity": severity.as_str(),
                    "current_quality": quality,
                    "historical_quality": historical,
                }),
            )
            .await?;

        let policy = ctx.workspaces.get_policy(workspace_id).await?;
        let scope = policy.drift_pause_scope;
        let scope_value = match scope {
            PauseScope::SourceKey => Some(source_key),
            PauseScope::Schema | PauseScope::Workspace => None,
        };
        let pause_id = ctx
            .governance
            .open_pause_if_absent(workspace_id, scope, scope_value, "extraction_drift")
            .await?;
        if let Some(pause_id) = pause_id {
            ctx.audit
                .append(
                    workspace_id,
                    Some(thread_id),
                    Some(job.id),
                    events::WRITE_PAUSE_OPENED,
                    &json!({
                        "pause_id": pause_id,
                        "scope": scope.as_str(),
                        "scope_value": scope_value,
                    }),
                )
                .await?;
        }

        ctx.governance
            .open_review_if_absent(
                workspace_id,
                Some(thread_id),
                DRIFT_REVIEW_REASON,
                Some(&json!({
                    "source_key": source_key,
                    "severity": severity.as_str(),
                })),
            )
            .await?;
        Ok(())
    }
}

/// Compact per-field confidence map for audit payloads.
fn field_summary(fields: &[ExtractedField]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for key in [
        FieldKey::Email,
        FieldKey::Name,
        FieldKey::Company,
        FieldKey::Intent,
        FieldKey::Timeline,
    ] {
        if let Some(field) = field_by_key(fields, key) {
            map.insert(key.as_str().to_string(), json!(field.confidence));
        }
    }
    serde_json::Value::Object(map)
}
