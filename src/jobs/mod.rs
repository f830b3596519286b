//! Durable background jobs: types, queue-driven runner, cron scheduler,
//! and the processors that do the actual work.

pub mod processors;
pub mod runner;
pub mod scheduler;
pub mod types;

pub use types::{Job, JobPayload, JobStatus, JobType};
