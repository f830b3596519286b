//! Retry scheduling for failed CRM writes.
//!
//! Failed writes never retry inline; this pass walks the due rows, applies
//! capped exponential backoff with jitter, and re-enqueues the sync job at
//! the scheduled time. Rows past the retry budget become permanent
//! failures instead.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::crm::retry::{compute_retry_schedule, is_permanent_failure};
use crate::error::Result;
use crate::jobs::processors::{JobProcessor, ProcessorContext};
use crate::jobs::types::{Job, JobPayload, JobType, SyncPayload};
use crate::store::audit::events;

pub struct ReconcileCrmWrites;

#[async_trait]
impl JobProcessor for ReconcileCrmWrites {
    async fn process(&self, ctx: &ProcessorContext, job: &Job) -> Result<()> {
        let workspace_id = job.workspace_id;
        let now = Utc::now();
        let due = ctx
            .crm_writes
            .due_retries(workspace_id, now, ctx.config.reconcile_batch_size as u32)
            .await?;

        for record in due {
            // The upcoming attempt counts against the budget, not just the
            // attempts already spent.
            if is_permanent_failure(record.retry_count + 1, ctx.config.max_write_retries) {
                ctx.crm_writes.mark_permanent_failure(record.id).await?;
                ctx.audit
                    .append(
                        workspace_id,
                        None,
                        Some(job.id),
                        events::CRM_WRITE_MARKED_PERMANENT_FAILURE,
                        &json!({
                            "write_id": record.id,
                            "retry_count": record.retry_count,
                            "last_error": record.last_error,
                        }),
                    )
                    .await?;
                warn!(
                    write_id = %record.id,
                    retry_count = record.retry_count,
                    "Write exhausted its retry budget"
                );
                continue;
            }

            let schedule = compute_retry_schedule(
                record.retry_count,
                now,
                ctx.config.retry_base_delay,
                ctx.config.retry_max_delay,
            );
            ctx.crm_writes
                .schedule_retry(record.id, schedule.retry_count, schedule.next_retry_at)
                .await?;
            ctx.jobs
                .enqueue_after(
                    workspace_id,
                    JobType::sync_for(record.crm),
                    &JobPayload::Sync(SyncPayload {
                        crm_write_log_id: Some(record.id),
                        ..Default::default()
                    })
                    .encode(),
                    schedule.next_retry_at,
                )
                .await?;
            ctx.audit
                .append(
                    workspace_id,
                    None,
                    Some(job.id),
                    events::CRM_WRITE_RETRY_SCHEDULED,
                    &json!({
                        "write_id": record.id,
                        "retry_count": schedule.retry_count,
                        "next_retry_at": schedule.next_retry_at,
                    }),
                )
                .await?;
            info!(
                write_id = %record.id,
                retry_count = schedule.retry_count,
                next_retry_at = %schedule.next_retry_at,
                "Write retry scheduled"
            );
        }
        Ok(())
    }
}
