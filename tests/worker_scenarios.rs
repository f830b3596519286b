//! End-to-end scenarios driven through the queue and runner.

use std::sync::Arc;

use chrono::{Duration, NaiveDate, NaiveTime, Utc};
use serde_json::json;
use uuid::Uuid;

use conduit_worker::config::WorkerConfig;
use conduit_worker::crm::CrmSystem;
use conduit_worker::crm::candidates::{DealCandidate, FixedCandidateProvider};
use conduit_worker::crm::client::RecordingCrmClient;
use conduit_worker::jobs::processors::{Capabilities, ProcessorContext, ProcessorRegistry};
use conduit_worker::jobs::runner::JobRunner;
use conduit_worker::jobs::types::{JobPayload, JobStatus, JobType, RollupPayload, SyncPayload, ThreadPayload};
use conduit_worker::llm::{FakeLlmClient, LlmClient};
use conduit_worker::store::Database;
use conduit_worker::store::audit::events;
use conduit_worker::store::crm_writes::{PlanOutcome, PlannedWrite, WriteStatus};
use conduit_worker::store::deals::LinkStatus;
use conduit_worker::store::rollups::GenerationMethod;
use conduit_worker::store::workspaces::WorkspacePolicy;

async fn harness(dry_run: bool, capabilities: Capabilities) -> (Arc<ProcessorContext>, JobRunner) {
    let config = WorkerConfig {
        dry_run,
        ..WorkerConfig::default()
    };
    let db = Database::new_memory().await.unwrap();
    let ctx = Arc::new(ProcessorContext::new(config, db, capabilities));
    let runner = JobRunner::new(ctx.clone(), Arc::new(ProcessorRegistry::standard()));
    (ctx, runner)
}

async fn seed_thread(ctx: &ProcessorContext, workspace_id: Uuid, body: &str) -> Uuid {
    let thread_id = ctx
        .threads
        .create_thread(workspace_id, Some("Pricing question"))
        .await
        .unwrap();
    ctx.threads
        .add_message(
            thread_id,
            workspace_id,
            Some("ada@acme.example"),
            &["sales@vendor.example".to_string()],
            Some("Pricing question"),
            Some(body),
            Utc::now(),
        )
        .await
        .unwrap();
    thread_id
}

/// Provider that only matches when it was handed the thread's participants.
struct ParticipantProvider {
    candidate: DealCandidate,
}

#[async_trait::async_trait]
impl conduit_worker::crm::candidates::DealCandidateProvider for ParticipantProvider {
    async fn candidates_for_thread(
        &self,
        _workspace_id: Uuid,
        _thread_id: Uuid,
        participant_emails: &[String],
        _sender_domain: &str,
    ) -> Result<Vec<DealCandidate>, conduit_worker::error::CrmError> {
        if participant_emails.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![self.candidate.clone()])
    }
}

#[tokio::test]
async fn single_candidate_links_and_plans_followup() {
    let mut capabilities = Capabilities::dry_run();
    capabilities.candidates = Arc::new(ParticipantProvider {
        candidate: DealCandidate {
            deal_id: "D-100".into(),
            title: "Acme expansion".into(),
            match_confidence: 0.95,
            why: Some("company_domain_match".into()),
        },
    });
    let (ctx, runner) = harness(true, capabilities).await;

    let workspace_id = ctx.workspaces.create_workspace("acme").await.unwrap();
    ctx.workspaces
        .connect_crm(workspace_id, CrmSystem::Hubspot)
        .await
        .unwrap();
    let thread_id = seed_thread(&ctx, workspace_id, "We have a budget of $50k.").await;

    ctx.jobs
        .enqueue(
            workspace_id,
            JobType::AssociateThread,
            &JobPayload::AssociateThread(ThreadPayload { thread_id }).encode(),
        )
        .await
        .unwrap();
    assert_eq!(runner.drain().await.unwrap(), 1);

    let link = ctx
        .deals
        .get_thread_link(workspace_id, thread_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(link.status, LinkStatus::Linked);
    assert_eq!(link.match_reason.as_deref(), Some("company_domain_match"));
    let deal_id = link.deal_id.unwrap();

    // The budget mention became a fact, so readiness is above zero.
    let readiness = ctx
        .deals
        .get_readiness(workspace_id, deal_id, "bant")
        .await
        .unwrap()
        .unwrap();
    assert!(readiness.readiness_score > 0.0);
    assert!(!readiness.missing_keys.is_empty());

    // Follow-up task write planned, no review opened.
    let planned = ctx
        .audit
        .count_by_type(workspace_id, events::CRM_WRITE_PLANNED)
        .await
        .unwrap();
    assert_eq!(planned, 1);
    let linked = ctx
        .audit
        .count_by_type(workspace_id, events::THREAD_AUTO_LINKED)
        .await
        .unwrap();
    assert_eq!(linked, 1);
    assert!(ctx
        .governance
        .list_open_reviews(workspace_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn multiple_candidates_route_to_review() {
    let mut capabilities = Capabilities::dry_run();
    capabilities.candidates = Arc::new(FixedCandidateProvider {
        candidates: vec![
            DealCandidate {
                deal_id: "D-1".into(),
                title: "First deal".into(),
                match_confidence: 0.7,
                why: None,
            },
            DealCandidate {
                deal_id: "D-2".into(),
                title: "Second deal".into(),
                match_confidence: 0.65,
                why: None,
            },
        ],
    });
    let (ctx, runner) = harness(true, capabilities).await;

    let workspace_id = ctx.workspaces.create_workspace("acme").await.unwrap();
    let thread_id = seed_thread(&ctx, workspace_id, "Following up on our call.").await;

    ctx.jobs
        .enqueue(
            workspace_id,
            JobType::AssociateThread,
            &JobPayload::AssociateThread(ThreadPayload { thread_id }).encode(),
        )
        .await
        .unwrap();
    runner.drain().await.unwrap();

    let reviews = ctx.governance.list_open_reviews(workspace_id).await.unwrap();
    assert_eq!(reviews.len(), 1);
    assert_eq!(reviews[0].reason, "needs_deal_linking");
    let flagged = ctx
        .audit
        .count_by_type(workspace_id, events::THREAD_NEEDS_LINKING)
        .await
        .unwrap();
    assert_eq!(flagged, 1);
    assert!(ctx
        .deals
        .get_thread_link(workspace_id, thread_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn invalid_llm_output_falls_back_to_deterministic() {
    let mut capabilities = Capabilities::dry_run();
    capabilities.llm = Some(Arc::new(FakeLlmClient::with_content("not json at all")) as Arc<dyn LlmClient>);
    let (ctx, runner) = harness(false, capabilities).await;

    let workspace_id = ctx.workspaces.create_workspace("acme").await.unwrap();
    ctx.workspaces
        .set_policy(
            workspace_id,
            &WorkspacePolicy {
                use_llm_rollups: true,
                ..WorkspacePolicy::default()
            },
        )
        .await
        .unwrap();

    let week_start = NaiveDate::from_ymd_opt(2026, 8, 17).unwrap();
    let thread_id = ctx
        .threads
        .create_thread(workspace_id, Some("Renewal"))
        .await
        .unwrap();
    ctx.threads
        .add_message(
            thread_id,
            workspace_id,
            Some("ada@acme.example"),
            &[],
            Some("Renewal"),
            Some("Checking in on the renewal."),
            week_start.and_time(NaiveTime::MIN).and_utc() + Duration::days(1),
        )
        .await
        .unwrap();
    let deal_id = ctx
        .deals
        .upsert_deal(workspace_id, CrmSystem::Hubspot, "D-7", "Acme renewal")
        .await
        .unwrap();
    ctx.deals
        .link_thread(workspace_id, thread_id, deal_id, 0.95, "single_candidate")
        .await
        .unwrap();

    ctx.jobs
        .enqueue(
            workspace_id,
            JobType::WeeklyRollup,
            &JobPayload::WeeklyRollup(RollupPayload {
                week_start: Some(week_start),
                force: false,
            })
            .encode(),
        )
        .await
        .unwrap();
    runner.drain().await.unwrap();

    let rollup = ctx
        .rollups
        .get_rollup(workspace_id, deal_id, week_start)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rollup.generation_method, GenerationMethod::LlmFallback);
    assert!(rollup.summary_md.contains("### What happened this week"));

    let invalid = ctx
        .audit
        .count_by_type(workspace_id, events::LLM_ROLLUP_INVALID_OUTPUT)
        .await
        .unwrap();
    let fallback = ctx
        .audit
        .count_by_type(workspace_id, events::LLM_ROLLUP_FALLBACK_USED)
        .await
        .unwrap();
    assert_eq!(invalid, 1);
    assert_eq!(fallback, 1);
}

#[tokio::test]
async fn succeeded_sync_rerun_makes_no_crm_calls() {
    let recorder = Arc::new(RecordingCrmClient::new());
    let mut capabilities = Capabilities::dry_run();
    capabilities.crm_client = recorder.clone();
    let (ctx, runner) = harness(false, capabilities).await;

    let workspace_id = ctx.workspaces.create_workspace("acme").await.unwrap();
    let thread_id = seed_thread(&ctx, workspace_id, "Email: ada@acme.example").await;

    let payload = JobPayload::Sync(SyncPayload {
        thread_id: Some(thread_id),
        ..Default::default()
    })
    .encode();
    ctx.jobs
        .enqueue(workspace_id, JobType::SyncHubspot, &payload)
        .await
        .unwrap();
    runner.drain().await.unwrap();

    // Contact upsert plus note creation.
    assert_eq!(recorder.recorded().len(), 2);

    ctx.jobs
        .enqueue(workspace_id, JobType::SyncHubspot, &payload)
        .await
        .unwrap();
    runner.drain().await.unwrap();

    // The succeeded write short-circuits; nothing new was sent.
    assert_eq!(recorder.recorded().len(), 2);
    for job in ctx
        .jobs
        .list_by_type(workspace_id, JobType::SyncHubspot)
        .await
        .unwrap()
    {
        assert_eq!(job.status, JobStatus::Succeeded);
    }
}

#[tokio::test]
async fn unregistered_job_type_fails_loudly() {
    let (ctx, runner) = harness(true, Capabilities::dry_run()).await;
    let workspace_id = ctx.workspaces.create_workspace("acme").await.unwrap();

    let job_id = ctx
        .jobs
        .enqueue(
            workspace_id,
            JobType::OcrTextract,
            &json!({ "attachment_id": Uuid::new_v4() }),
        )
        .await
        .unwrap();
    runner.drain().await.unwrap();

    let job = ctx.jobs.get(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.last_error.unwrap().contains("no processor registered"));
}

#[tokio::test]
async fn write_with_spent_retry_budget_goes_permanent() {
    let (ctx, runner) = harness(false, Capabilities::dry_run()).await;
    let workspace_id = ctx.workspaces.create_workspace("acme").await.unwrap();

    let payload = json!({ "email": "ada@acme.example" });
    let PlanOutcome::Created(write_id) = ctx
        .crm_writes
        .plan_write(
            &PlannedWrite {
                workspace_id,
                crm: CrmSystem::Hubspot,
                object_type: "thread",
                object_id: "t-1",
                action: "sync_thread",
                idempotency_key: "k-exhausted",
                payload: &payload,
                payload_hash: "hash",
            },
            WriteStatus::Queued,
        )
        .await
        .unwrap()
    else {
        panic!("expected a new write row");
    };
    ctx.crm_writes.mark_failed(write_id, "502").await.unwrap();
    // Seven attempts already spent; the eighth would bust the budget.
    ctx.crm_writes
        .schedule_retry(write_id, 7, Utc::now() - Duration::minutes(1))
        .await
        .unwrap();

    ctx.jobs
        .enqueue(
            workspace_id,
            JobType::ReconcileCrmWrites,
            &JobPayload::ReconcileCrmWrites.encode(),
        )
        .await
        .unwrap();
    assert_eq!(runner.drain().await.unwrap(), 1);

    let record = ctx.crm_writes.get(write_id).await.unwrap().unwrap();
    assert_eq!(record.status, WriteStatus::PermanentFailure);
    assert!(ctx
        .jobs
        .list_by_type(workspace_id, JobType::SyncHubspot)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        ctx.audit
            .count_by_type(workspace_id, events::CRM_WRITE_MARKED_PERMANENT_FAILURE)
            .await
            .unwrap(),
        1
    );
}
