//! Weekly governance digest.
//!
//! Summarizes the open review queue, drift alerts, and pause state so a
//! workspace owner sees everything waiting on a human in one place.

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::error::Result;
use crate::jobs::processors::{JobProcessor, ProcessorContext};
use crate::jobs::types::Job;
use crate::store::audit::events;

pub struct WeeklyDigest;

#[async_trait]
impl JobProcessor for WeeklyDigest {
    async fn process(&self, ctx: &ProcessorContext, job: &Job) -> Result<()> {
        let workspace_id = job.workspace_id;
        let reviews = ctx.governance.list_open_reviews(workspace_id).await?;
        let drift_alerts = ctx.governance.open_drift_alert_count(workspace_id).await?;
        let writes_paused = ctx.governance.has_open_pause(workspace_id).await?;

        let mut by_reason: Vec<(String, usize)> = Vec::new();
        for item in &reviews {
            match by_reason.iter_mut().find(|(reason, _)| *reason == item.reason) {
                Some((_, count)) => *count += 1,
                None => by_reason.push((item.reason.clone(), 1)),
            }
        }
        by_reason.sort();

        let mut summary = String::from("### Review queue\n");
        if by_reason.is_empty() {
            summary.push_str("- Empty.\n");
        } else {
            for (reason, count) in &by_reason {
                summary.push_str(&format!("- {reason}: {count}\n"));
            }
        }
        summary.push_str("\n### Governance\n");
        summary.push_str(&format!("- Open drift alerts: {drift_alerts}\n"));
        summary.push_str(&format!(
            "- CRM writes: {}\n",
            if writes_paused { "paused" } else { "active" }
        ));

        ctx.audit
            .append(
                workspace_id,
                None,
                Some(job.id),
                events::WEEKLY_DIGEST_GENERATED,
                &json!({
                    "open_reviews": reviews.len(),
                    "open_drift_alerts": drift_alerts,
                    "writes_paused": writes_paused,
                    "summary_md": summary,
                }),
            )
            .await?;
        info!(
            workspace_id = %workspace_id,
            open_reviews = reviews.len(),
            drift_alerts,
            writes_paused,
            "Weekly digest generated"
        );
        Ok(())
    }
}
