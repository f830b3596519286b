//! CRM connection liveness checks.
//!
//! A token fetch doubles as the probe: a token that can be minted means
//! the connection is usable. Auth rejections flag the connection so new
//! sync work stops being enqueued against it.

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::error::Result;
use crate::jobs::processors::{JobProcessor, ProcessorContext};
use crate::jobs::types::Job;
use crate::store::audit::events;
use crate::store::workspaces::HealthStatus;

pub struct ReconcileConnections;

#[async_trait]
impl JobProcessor for ReconcileConnections {
    async fn process(&self, ctx: &ProcessorContext, job: &Job) -> Result<()> {
        let workspace_id = job.workspace_id;
        let crms = ctx.workspaces.connected_crms(workspace_id).await?;

        for crm in crms {
            let probe = ctx
                .capabilities
                .tokens
                .get_access_token(workspace_id, crm)
                .await;

            let (status, detail) = match probe {
                Ok(_) => (HealthStatus::Ok, None),
                Err(e) if e.is_auth_failure() => {
                    let detail = e.to_string();
                    ctx.workspaces
                        .flag_connection_error(workspace_id, crm, &detail)
                        .await?;
                    (HealthStatus::Error, Some(detail))
                }
                Err(e) => (HealthStatus::Warning, Some(e.to_string())),
            };

            ctx.workspaces
                .record_health(workspace_id, crm, status, detail.as_deref())
                .await?;
            ctx.audit
                .append(
                    workspace_id,
                    None,
                    Some(job.id),
                    events::CONNECTION_HEALTH_CHECKED,
                    &json!({
                        "crm": crm.as_str(),
                        "status": status.as_str(),
                        "detail": detail,
                    }),
                )
                .await?;

            match status {
                HealthStatus::Ok => {
                    info!(workspace_id = %workspace_id, crm = %crm, "Connection healthy")
                }
                _ => warn!(
                    workspace_id = %workspace_id,
                    crm = %crm,
                    status = status.as_str(),
                    "Connection probe degraded"
                ),
            }
        }
        Ok(())
    }
}
