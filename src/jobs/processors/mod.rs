//! Job processors and their shared context.
//!
//! Each processor owns one job type. The context carries the stores plus
//! the injected capabilities (extractor, candidate provider, CRM client,
//! token manager, LLM client); swapping a capability is how tests and
//! dry-run deployments change behavior.

pub mod associate_thread;
pub mod extract_thread;
pub mod purge_retention;
pub mod reconcile_connections;
pub mod reconcile_crm_writes;
pub mod sync_crm;
pub mod weekly_digest;
pub mod weekly_rollup;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::WorkerConfig;
use crate::crm::CrmSystem;
use crate::crm::candidates::{DealCandidateProvider, EmptyCandidateProvider};
use crate::crm::client::{CrmClient, DryRunCrmClient};
use crate::crm::tokens::{DryRunTokenManager, TokenManager};
use crate::error::Result;
use crate::extraction::{DeterministicExtractor, Extractor};
use crate::jobs::types::{Job, JobType};
use crate::llm::LlmClient;
use crate::store::Database;
use crate::store::audit::AuditStore;
use crate::store::crm_writes::CrmWriteStore;
use crate::store::deals::DealStore;
use crate::store::governance::GovernanceStore;
use crate::store::jobs::JobStore;
use crate::store::rollups::RollupStore;
use crate::store::threads::ThreadStore;
use crate::store::workspaces::WorkspaceStore;

/// Injected external capabilities.
pub struct Capabilities {
    pub extractor: Arc<dyn Extractor>,
    pub candidates: Arc<dyn DealCandidateProvider>,
    pub crm_client: Arc<dyn CrmClient>,
    pub tokens: Arc<dyn TokenManager>,
    pub llm: Option<Arc<dyn LlmClient>>,
}

impl Capabilities {
    /// All-dry-run capability set: deterministic extraction, no deal
    /// candidates, logged CRM writes, placeholder tokens, no LLM.
    pub fn dry_run() -> Self {
        Self {
            extractor: Arc::new(DeterministicExtractor),
            candidates: Arc::new(EmptyCandidateProvider),
            crm_client: Arc::new(DryRunCrmClient),
            tokens: Arc::new(DryRunTokenManager),
            llm: None,
        }
    }
}

/// Everything a processor needs.
pub struct ProcessorContext {
    pub config: WorkerConfig,
    pub jobs: JobStore,
    pub threads: ThreadStore,
    pub governance: GovernanceStore,
    pub deals: DealStore,
    pub crm_writes: CrmWriteStore,
    pub rollups: RollupStore,
    pub workspaces: WorkspaceStore,
    pub audit: AuditStore,
    pub capabilities: Capabilities,
}

impl ProcessorContext {
    pub fn new(config: WorkerConfig, db: Database, capabilities: Capabilities) -> Self {
        Self {
            config,
            jobs: JobStore::new(db.clone()),
            threads: ThreadStore::new(db.clone()),
            governance: GovernanceStore::new(db.clone()),
            deals: DealStore::new(db.clone()),
            crm_writes: CrmWriteStore::new(db.clone()),
            rollups: RollupStore::new(db.clone()),
            workspaces: WorkspaceStore::new(db.clone()),
            audit: AuditStore::new(db),
            capabilities,
        }
    }
}

/// One job type's worth of work.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, ctx: &ProcessorContext, job: &Job) -> Result<()>;
}

/// Dispatch table from job type to processor.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: HashMap<JobType, Arc<dyn JobProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The full production dispatch table.
    ///
    /// `ocr_textract` stays unregistered: OCR runs in the external document
    /// pipeline, and a stray job of that type should fail loudly here.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(JobType::ExtractThread, Arc::new(extract_thread::ExtractThread));
        registry.register(
            JobType::AssociateThread,
            Arc::new(associate_thread::AssociateThread),
        );
        registry.register(
            JobType::SyncHubspot,
            Arc::new(sync_crm::SyncCrm::new(CrmSystem::Hubspot)),
        );
        registry.register(
            JobType::SyncSalesforce,
            Arc::new(sync_crm::SyncCrm::new(CrmSystem::Salesforce)),
        );
        registry.register(JobType::WeeklyRollup, Arc::new(weekly_rollup::WeeklyRollup));
        registry.register(JobType::WeeklyDigest, Arc::new(weekly_digest::WeeklyDigest));
        registry.register(
            JobType::ReconcileConnections,
            Arc::new(reconcile_connections::ReconcileConnections),
        );
        registry.register(
            JobType::ReconcileCrmWrites,
            Arc::new(reconcile_crm_writes::ReconcileCrmWrites),
        );
        registry.register(JobType::PurgeRetention, Arc::new(purge_retention::PurgeRetention));
        registry
    }

    pub fn register(&mut self, job_type: JobType, processor: Arc<dyn JobProcessor>) {
        self.processors.insert(job_type, processor);
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobProcessor>> {
        self.processors.get(&job_type).cloned()
    }
}
