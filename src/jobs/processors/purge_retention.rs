//! Retention enforcement.
//!
//! Message bodies and attachment pointers expire on the workspace policy's
//! clock; extracted fields and the audit trail are what remains of a purged
//! thread. The completion event is appended even when nothing was purged,
//! so the trail shows the pass ran.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info};

use crate::error::Result;
use crate::jobs::processors::{JobProcessor, ProcessorContext};
use crate::jobs::types::Job;
use crate::store::audit::events;

pub struct PurgeRetention;

#[async_trait]
impl JobProcessor for PurgeRetention {
    async fn process(&self, ctx: &ProcessorContext, job: &Job) -> Result<()> {
        let workspace_id = job.workspace_id;
        let policy = ctx
            .workspaces
            .get_retention_policy(workspace_id)
            .await?
            .normalized();
        let now = Utc::now();

        let (messages_redacted, attachments_cleared) = if policy.purge_enabled {
            let redacted = ctx
                .threads
                .redact_messages_before(workspace_id, policy.message_cutoff(now))
                .await?;
            let cleared = ctx
                .threads
                .clear_attachments_before(workspace_id, policy.attachment_cutoff(now))
                .await?;
            (redacted, cleared)
        } else {
            debug!(workspace_id = %workspace_id, "Retention purge disabled by policy");
            (0, 0)
        };

        ctx.audit
            .append(
                workspace_id,
                None,
                Some(job.id),
                events::RETENTION_PURGE_COMPLETED,
                &json!({
                    "purge_enabled": policy.purge_enabled,
                    "messages_redacted": messages_redacted,
                    "attachments_cleared": attachments_cleared,
                    "raw_email_retention_days": policy.raw_email_retention_days,
                    "attachment_retention_days": policy.attachment_retention_days,
                }),
            )
            .await?;
        info!(
            workspace_id = %workspace_id,
            messages_redacted,
            attachments_cleared,
            "Retention purge completed"
        );
        Ok(())
    }
}
