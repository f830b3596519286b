//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Worker configuration.
///
/// Built once in `main` and threaded through constructors. The dry-run
/// flag lives here, never in ambient global state: in dry-run mode every
/// external write and LLM call is suppressed while the write-log and
/// audit trail are still exercised.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Suppress real CRM writes and LLM calls.
    pub dry_run: bool,
    /// Path to the local database file.
    pub db_path: String,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Jobs left `running` longer than this are reclaimed to `queued`.
    pub stale_job_max_age: Duration,
    /// How often the runner sweeps for stale jobs.
    pub stale_sweep_interval: Duration,
    /// Retry backoff base delay for failed CRM writes.
    pub retry_base_delay: Duration,
    /// Retry backoff cap.
    pub retry_max_delay: Duration,
    /// Retries beyond this count become permanent failures.
    pub max_write_retries: u32,
    /// Batch size for one reconcile_crm_writes pass.
    pub reconcile_batch_size: usize,
    /// LLM settings for weekly rollups.
    pub llm: LlmSettings,
}

/// LLM client settings.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub model: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            db_path: "./data/conduit.db".to_string(),
            poll_interval: Duration::from_secs(1),
            stale_job_max_age: Duration::from_secs(600), // 10 minutes
            stale_sweep_interval: Duration::from_secs(60),
            retry_base_delay: Duration::from_secs(60),
            retry_max_delay: Duration::from_secs(24 * 60 * 60),
            max_write_retries: 8,
            reconcile_batch_size: 200,
            llm: LlmSettings {
                api_key: None,
                base_url: "https://api.openai.com/v1".to_string(),
                model: "gpt-4o-mini".to_string(),
            },
        }
    }
}

impl WorkerConfig {
    /// Build configuration from the environment.
    ///
    /// Dry run defaults to ON; only `DRY_RUN=false` enables real writes.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self {
            dry_run: std::env::var("DRY_RUN").map(|v| v != "false").unwrap_or(true),
            ..Self::default()
        };

        if let Ok(path) = std::env::var("CONDUIT_DB_PATH") {
            config.db_path = path;
        }
        if let Ok(secs) = std::env::var("CONDUIT_POLL_INTERVAL_SECS") {
            let parsed = secs.parse::<u64>().map_err(|e| ConfigError::InvalidValue {
                key: "CONDUIT_POLL_INTERVAL_SECS".into(),
                message: e.to_string(),
            })?;
            config.poll_interval = Duration::from_secs(parsed.max(1));
        }
        if let Ok(mins) = std::env::var("CONDUIT_STALE_JOB_MINUTES") {
            let parsed = mins.parse::<u64>().map_err(|e| ConfigError::InvalidValue {
                key: "CONDUIT_STALE_JOB_MINUTES".into(),
                message: e.to_string(),
            })?;
            config.stale_job_max_age = Duration::from_secs(parsed.max(1) * 60);
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            if !key.is_empty() {
                config.llm.api_key = Some(SecretString::from(key));
            }
        }
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            config.llm.base_url = url;
        }
        if let Ok(model) = std::env::var("OPENAI_MODEL") {
            config.llm.model = model;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_safe() {
        let config = WorkerConfig::default();
        assert!(config.dry_run);
        assert!(config.llm.api_key.is_none());
        assert_eq!(config.max_write_retries, 8);
        assert_eq!(config.reconcile_batch_size, 200);
    }

    #[test]
    fn retry_window_ordering() {
        let config = WorkerConfig::default();
        assert!(config.retry_base_delay < config.retry_max_delay);
    }
}
