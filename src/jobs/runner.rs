//! The worker loop: claim, dispatch, settle.
//!
//! One runner instance is one queue consumer. Claims are atomic, so any
//! number of runners can share a database; a claim that outlives
//! `stale_job_max_age` is swept back to the queue for someone else.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{JobError, Result};
use crate::jobs::processors::{ProcessorContext, ProcessorRegistry};
use crate::jobs::types::Job;

pub struct JobRunner {
    ctx: Arc<ProcessorContext>,
    registry: Arc<ProcessorRegistry>,
    worker_id: String,
}

impl JobRunner {
    pub fn new(ctx: Arc<ProcessorContext>, registry: Arc<ProcessorRegistry>) -> Self {
        Self {
            ctx,
            registry,
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }

    /// Poll the queue forever.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = %self.worker_id, "Worker runner started");
        let mut last_sweep = Instant::now();

        loop {
            if last_sweep.elapsed() >= self.ctx.config.stale_sweep_interval {
                let reclaimed = self
                    .ctx
                    .jobs
                    .reclaim_stale(self.ctx.config.stale_job_max_age)
                    .await?;
                if reclaimed > 0 {
                    info!(reclaimed, "Stale jobs returned to queue");
                }
                last_sweep = Instant::now();
            }

            if !self.tick().await? {
                tokio::time::sleep(self.ctx.config.poll_interval).await;
            }
        }
    }

    /// Claim and process one job. Returns false when the queue was empty.
    pub async fn tick(&self) -> Result<bool> {
        let Some(job) = self.ctx.jobs.claim_next(&self.worker_id).await? else {
            return Ok(false);
        };
        self.dispatch(&job).await?;
        Ok(true)
    }

    /// Process claimed jobs until the queue is empty. Test helper, also
    /// used by the one-shot CLI mode.
    pub async fn drain(&self) -> Result<u64> {
        let mut processed = 0;
        while self.tick().await? {
            processed += 1;
        }
        Ok(processed)
    }

    async fn dispatch(&self, job: &Job) -> Result<()> {
        let client_id = format!("job-{}", job.id);
        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            client_id,
            "Dispatching job"
        );

        let Some(processor) = self.registry.get(job.job_type) else {
            let err = JobError::MissingProcessor {
                job_type: job.job_type.as_str().to_string(),
            };
            self.ctx.jobs.fail(job.id, &err.to_string()).await?;
            return Ok(());
        };

        match processor.process(&self.ctx, job).await {
            Ok(()) => {
                self.ctx.jobs.complete(job.id).await?;
                Ok(())
            }
            Err(e) => {
                error!(job_id = %job.id, job_type = %job.job_type, error = %e, "Job failed");
                self.ctx.jobs.fail(job.id, &e.to_string()).await?;
                Ok(())
            }
        }
    }
}
