use std::path::Path;
use std::sync::Arc;

use conduit_worker::config::WorkerConfig;
use conduit_worker::jobs::processors::{Capabilities, ProcessorContext, ProcessorRegistry};
use conduit_worker::jobs::runner::JobRunner;
use conduit_worker::jobs::scheduler::Scheduler;
use conduit_worker::llm::LlmClient;
use conduit_worker::llm::openai::OpenAiClient;
use conduit_worker::store::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = WorkerConfig::from_env()?;
    tracing::info!(
        db_path = config.db_path,
        dry_run = config.dry_run,
        "Starting conduit worker"
    );

    let db = Database::new_local(Path::new(&config.db_path)).await?;

    let llm: Option<Arc<dyn LlmClient>> = config.llm.api_key.clone().map(|key| {
        Arc::new(OpenAiClient::new(
            key,
            config.llm.base_url.clone(),
            config.llm.model.clone(),
        )) as Arc<dyn LlmClient>
    });

    let mut capabilities = Capabilities::dry_run();
    capabilities.llm = llm;

    let ctx = Arc::new(ProcessorContext::new(
        config.clone(),
        db.clone(),
        capabilities,
    ));
    let registry = Arc::new(ProcessorRegistry::standard());

    let scheduler = Scheduler::new(db)?;
    let runner = JobRunner::new(ctx, registry);

    tokio::select! {
        result = scheduler.run() => result?,
        result = runner.run() => result?,
    }
    Ok(())
}
