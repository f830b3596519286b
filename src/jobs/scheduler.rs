//! Cron-driven periodic job enqueueing.
//!
//! The scheduler only enqueues; all execution goes through the same queue
//! and runner as event-driven work, so periodic jobs get the same claims,
//! retries, and audit trail.

use std::str::FromStr;

use chrono::Utc;
use cron::Schedule;
use tracing::{debug, info};

use crate::error::{ConfigError, Result};
use crate::jobs::types::{JobPayload, JobType, RollupPayload};
use crate::store::Database;
use crate::store::jobs::JobStore;
use crate::store::workspaces::WorkspaceStore;

/// (job type, cron expression) for each periodic job.
const SCHEDULES: &[(JobType, &str)] = &[
    // Mondays 06:00 UTC, covering the week that just ended.
    (JobType::WeeklyRollup, "0 0 6 * * Mon *"),
    // Mondays 07:00 UTC, after rollups have landed.
    (JobType::WeeklyDigest, "0 0 7 * * Mon *"),
    // Hourly connection probes.
    (JobType::ReconcileConnections, "0 0 * * * * *"),
    // Failed-write sweep every five minutes.
    (JobType::ReconcileCrmWrites, "0 */5 * * * * *"),
    // Daily retention purge, off-peak.
    (JobType::PurgeRetention, "0 0 3 * * * *"),
];

struct Entry {
    job_type: JobType,
    schedule: Schedule,
}

pub struct Scheduler {
    jobs: JobStore,
    workspaces: WorkspaceStore,
    entries: Vec<Entry>,
}

impl Scheduler {
    pub fn new(db: Database) -> Result<Self> {
        let mut entries = Vec::with_capacity(SCHEDULES.len());
        for (job_type, expression) in SCHEDULES {
            let schedule =
                Schedule::from_str(expression).map_err(|e| ConfigError::InvalidValue {
                    key: format!("schedule for {job_type}"),
                    message: e.to_string(),
                })?;
            entries.push(Entry {
                job_type: *job_type,
                schedule,
            });
        }
        Ok(Self {
            jobs: JobStore::new(db.clone()),
            workspaces: WorkspaceStore::new(db),
            entries,
        })
    }

    /// Sleep until the next cron fire, enqueue, repeat.
    pub async fn run(&self) -> Result<()> {
        info!(entries = self.entries.len(), "Scheduler started");
        loop {
            let now = Utc::now();
            let Some((entry, fire_at)) = self
                .entries
                .iter()
                .filter_map(|entry| {
                    entry
                        .schedule
                        .after(&now)
                        .next()
                        .map(|fire_at| (entry, fire_at))
                })
                .min_by_key(|(_, fire_at)| *fire_at)
            else {
                return Ok(());
            };

            let wait = (fire_at - now).to_std().unwrap_or_default();
            debug!(job_type = %entry.job_type, fire_at = %fire_at, "Next scheduled fire");
            tokio::time::sleep(wait).await;

            self.enqueue_for_all_workspaces(entry.job_type).await?;
            // Step past the fire instant so the same entry is not re-selected
            // within the same second.
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    }

    pub async fn enqueue_for_all_workspaces(&self, job_type: JobType) -> Result<u64> {
        let payload = match job_type {
            JobType::WeeklyRollup => JobPayload::WeeklyRollup(RollupPayload::default()).encode(),
            _ => serde_json::Value::Object(serde_json::Map::new()),
        };
        let workspaces = self.workspaces.list_workspaces().await?;
        let mut enqueued = 0;
        for workspace in &workspaces {
            self.jobs.enqueue(workspace.id, job_type, &payload).await?;
            enqueued += 1;
        }
        info!(job_type = %job_type, enqueued, "Scheduled jobs enqueued");
        Ok(enqueued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn all_cron_expressions_parse() {
        let db = Database::new_memory().await.unwrap();
        let scheduler = Scheduler::new(db).unwrap();
        assert_eq!(scheduler.entries.len(), SCHEDULES.len());
    }

    #[tokio::test]
    async fn enqueues_one_job_per_workspace() {
        let db = Database::new_memory().await.unwrap();
        let scheduler = Scheduler::new(db.clone()).unwrap();
        let workspaces = WorkspaceStore::new(db.clone());
        workspaces.create_workspace("one").await.unwrap();
        workspaces.create_workspace("two").await.unwrap();

        let enqueued = scheduler
            .enqueue_for_all_workspaces(JobType::PurgeRetention)
            .await
            .unwrap();
        assert_eq!(enqueued, 2);
    }
}
