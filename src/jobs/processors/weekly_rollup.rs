//! Weekly per-deal rollups.
//!
//! The deterministic path always runs and always produces a summary; the
//! LLM path is an overlay that can only improve on it. Whatever the model
//! does, the job succeeds and the rollup row exists.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{JobError, Result};
use crate::governance::readiness::{BantReadiness, compute_bant_readiness};
use crate::idempotency::{CrmIdempotencyInput, build_crm_idempotency_key, hash_payload};
use crate::jobs::processors::{JobProcessor, ProcessorContext};
use crate::jobs::types::{Job, JobPayload, JobType, RollupPayload, SyncPayload};
use crate::llm::context::{PAUSED_RISK, RollupContextInput, build_rollup_context};
use crate::llm::prompts::{ROLLUP_SYSTEM_PROMPT, prompt_hash, rollup_user_prompt};
use crate::llm::schema::RollupOutput;
use crate::llm::{RollupGeneration, generate_rollup};
use crate::store::audit::events;
use crate::store::crm_writes::{PlanOutcome, PlannedWrite, WriteStatus};
use crate::store::deals::DealRecord;
use crate::store::rollups::{GenerationMethod, LlmRunStatus, LlmTelemetry};
use crate::store::threads::Message;
use crate::store::workspaces::WorkspacePolicy;

/// Purpose tag in the llm_runs table.
const LLM_PURPOSE: &str = "weekly_rollup";

/// Deltas below this confidence are discarded rather than staged.
const DELTA_MIN_CONFIDENCE: f64 = 0.9;

/// What the LLM overlay contributed for one deal.
enum LlmAttempt {
    /// Gated off before any call was considered.
    NotAttempted,
    /// Attempted but unusable; the deterministic summary stands in.
    FallbackNeeded,
    /// Validated output to use as the summary.
    Valid(RollupOutput),
}

pub struct WeeklyRollup;

#[async_trait]
impl JobProcessor for WeeklyRollup {
    async fn process(&self, ctx: &ProcessorContext, job: &Job) -> Result<()> {
        let JobPayload::WeeklyRollup(payload) = job.typed_payload()? else {
            return Err(JobError::MissingPayload {
                field: "rollup".into(),
            }
            .into());
        };
        let workspace_id = job.workspace_id;

        let week_start = payload
            .week_start
            .unwrap_or_else(|| previous_week_start(Utc::now().date_naive()));
        let (window_start, window_end) = week_window(week_start);

        let policy = ctx.workspaces.get_policy(workspace_id).await?;
        let deal_ids = ctx.deals.deals_with_linked_threads(workspace_id).await?;
        debug!(
            workspace_id = %workspace_id,
            week_start = %week_start,
            deals = deal_ids.len(),
            "Weekly rollup pass"
        );

        for deal_id in deal_ids {
            let Some(deal) = ctx.deals.get_deal(deal_id).await? else {
                continue;
            };
            if !payload.force
                && ctx
                    .rollups
                    .get_rollup(workspace_id, deal_id, week_start)
                    .await?
                    .is_some()
            {
                continue;
            }

            let messages = ctx
                .threads
                .messages_for_deal_window(workspace_id, deal_id, window_start, window_end)
                .await?;
            if messages.is_empty() && !payload.force {
                continue;
            }

            self.rollup_deal(ctx, job, &policy, &deal, week_start, &messages, &payload)
                .await?;
        }

        Ok(())
    }
}

impl WeeklyRollup {
    #[allow(clippy::too_many_arguments)]
    async fn rollup_deal(
        &self,
        ctx: &ProcessorContext,
        job: &Job,
        policy: &WorkspacePolicy,
        deal: &DealRecord,
        week_start: NaiveDate,
        messages: &[Message],
        payload: &RollupPayload,
    ) -> Result<()> {
        let workspace_id = job.workspace_id;
        let facts = ctx.deals.list_facts(workspace_id, deal.id).await?;
        let readiness = match ctx.deals.get_readiness(workspace_id, deal.id, "bant").await? {
            Some(readiness) => readiness,
            None => compute_bant_readiness(&facts),
        };
        let mut review_reasons: Vec<String> = ctx
            .governance
            .list_open_reviews(workspace_id)
            .await?
            .into_iter()
            .map(|item| item.reason)
            .collect();
        review_reasons.sort();
        review_reasons.dedup();
        let writes_paused = ctx.governance.has_open_pause(workspace_id).await?;

        let fallback = deterministic_rollup(&deal.title, &readiness, messages, &review_reasons, writes_paused);

        let llm_outcome = self
            .try_llm(
                ctx,
                job,
                policy,
                deal,
                &readiness,
                &facts,
                messages,
                &review_reasons,
                writes_paused,
                payload.force,
            )
            .await?;

        let (summary, method, validated) = match llm_outcome {
            LlmAttempt::Valid(validated) => (
                validated.summary_md.clone(),
                GenerationMethod::Llm,
                Some(validated),
            ),
            LlmAttempt::FallbackNeeded => (fallback, GenerationMethod::LlmFallback, None),
            LlmAttempt::NotAttempted => (fallback, GenerationMethod::Deterministic, None),
        };

        ctx.rollups
            .upsert_rollup(workspace_id, deal.id, week_start, &summary, method)
            .await?;
        ctx.audit
            .append(
                workspace_id,
                None,
                Some(job.id),
                events::WEEKLY_ROLLUP_GENERATED,
                &json!({
                    "deal_id": deal.id,
                    "week_start": week_start,
                    "method": method.as_str(),
                }),
            )
            .await?;
        info!(
            deal_id = %deal.id,
            week_start = %week_start,
            method = method.as_str(),
            "Weekly rollup stored"
        );

        if let Some(validated) = &validated {
            self.stage_deltas(ctx, job, policy, deal, week_start, validated).await?;
        }
        if policy.write_weekly_rollup_to_crm {
            self.plan_rollup_write(ctx, job, deal, week_start, &summary).await?;
        }
        Ok(())
    }

    /// Run the LLM overlay if the gates allow it.
    #[allow(clippy::too_many_arguments)]
    async fn try_llm(
        &self,
        ctx: &ProcessorContext,
        job: &Job,
        policy: &WorkspacePolicy,
        deal: &DealRecord,
        readiness: &BantReadiness,
        facts: &[crate::governance::readiness::DealFact],
        messages: &[Message],
        review_reasons: &[String],
        writes_paused: bool,
        force: bool,
    ) -> Result<LlmAttempt> {
        let workspace_id = job.workspace_id;
        if !policy.use_llm_rollups {
            return Ok(LlmAttempt::NotAttempted);
        }
        if writes_paused {
            debug!(deal_id = %deal.id, risk = PAUSED_RISK, "Drift pause open, LLM path closed");
            return Ok(LlmAttempt::NotAttempted);
        }
        if ctx.config.dry_run {
            ctx.audit
                .append(
                    workspace_id,
                    None,
                    Some(job.id),
                    events::LLM_ROLLUP_SKIPPED_DRY_RUN,
                    &json!({ "deal_id": deal.id }),
                )
                .await?;
            return Ok(LlmAttempt::NotAttempted);
        }
        let Some(client) = ctx.capabilities.llm.as_ref() else {
            ctx.audit
                .append(
                    workspace_id,
                    None,
                    Some(job.id),
                    events::LLM_ROLLUP_SKIPPED_NO_CREDENTIAL,
                    &json!({ "deal_id": deal.id }),
                )
                .await?;
            return Ok(LlmAttempt::NotAttempted);
        };

        let context = build_rollup_context(&RollupContextInput {
            readiness,
            facts,
            messages,
            open_review_reasons: review_reasons,
            writes_paused,
            level: policy.llm_context_level,
        });
        let user_prompt = rollup_user_prompt(&context);
        let hash = prompt_hash(ROLLUP_SYSTEM_PROMPT, &user_prompt);

        // An identical prompt was already paid for; reuse its outcome.
        if !force {
            if let Some(prior) = ctx
                .rollups
                .get_llm_run(workspace_id, LLM_PURPOSE, deal.id, &hash)
                .await?
            {
                debug!(deal_id = %deal.id, "Reusing prior LLM run for identical prompt");
                let reused = prior
                    .validated
                    .and_then(|v| serde_json::from_value::<RollupOutput>(v).ok());
                return Ok(match reused {
                    Some(validated) => LlmAttempt::Valid(validated),
                    None => LlmAttempt::FallbackNeeded,
                });
            }
        }

        match generate_rollup(client.as_ref(), ROLLUP_SYSTEM_PROMPT, &user_prompt).await {
            RollupGeneration::Succeeded {
                validated,
                raw,
                model,
                telemetry,
            } => {
                let validated_json = serde_json::to_value(&validated)
                    .map_err(|e| crate::error::DatabaseError::Serialization(e.to_string()))?;
                ctx.rollups
                    .record_llm_run(
                        workspace_id,
                        LLM_PURPOSE,
                        deal.id,
                        &hash,
                        Some(&model),
                        LlmRunStatus::Succeeded,
                        telemetry,
                        Some(&raw),
                        Some(&validated_json),
                    )
                    .await?;
                Ok(LlmAttempt::Valid(validated))
            }
            RollupGeneration::ValidationFailed {
                raw,
                error,
                model,
                telemetry,
            } => {
                ctx.rollups
                    .record_llm_run(
                        workspace_id,
                        LLM_PURPOSE,
                        deal.id,
                        &hash,
                        Some(&model),
                        LlmRunStatus::Invalid,
                        telemetry,
                        Some(&raw),
                        None,
                    )
                    .await?;
                ctx.audit
                    .append(
                        workspace_id,
                        None,
                        Some(job.id),
                        events::LLM_ROLLUP_INVALID_OUTPUT,
                        &json!({ "deal_id": deal.id, "error": error }),
                    )
                    .await?;
                ctx.audit
                    .append(
                        workspace_id,
                        None,
                        Some(job.id),
                        events::LLM_ROLLUP_FALLBACK_USED,
                        &json!({ "deal_id": deal.id, "cause": "invalid_output" }),
                    )
                    .await?;
                warn!(deal_id = %deal.id, error, "LLM output failed validation, using fallback");
                Ok(LlmAttempt::FallbackNeeded)
            }
            RollupGeneration::TransientError { cause } => {
                ctx.rollups
                    .record_llm_run(
                        workspace_id,
                        LLM_PURPOSE,
                        deal.id,
                        &hash,
                        None,
                        LlmRunStatus::Error,
                        LlmTelemetry::default(),
                        None,
                        None,
                    )
                    .await?;
                ctx.audit
                    .append(
                        workspace_id,
                        None,
                        Some(job.id),
                        events::LLM_ROLLUP_FALLBACK_USED,
                        &json!({ "deal_id": deal.id, "cause": cause }),
                    )
                    .await?;
                warn!(deal_id = %deal.id, cause, "LLM request failed, using fallback");
                Ok(LlmAttempt::FallbackNeeded)
            }
            RollupGeneration::Skipped { reason } => {
                debug!(deal_id = %deal.id, reason, "LLM rollup skipped");
                Ok(LlmAttempt::NotAttempted)
            }
        }
    }

    /// Stage high-confidence field deltas and plan their CRM application.
    async fn stage_deltas(
        &self,
        ctx: &ProcessorContext,
        job: &Job,
        policy: &WorkspacePolicy,
        deal: &DealRecord,
        week_start: NaiveDate,
        validated: &RollupOutput,
    ) -> Result<()> {
        if !policy.create_crm_deltas {
            return Ok(());
        }
        let accepted: Vec<Value> = validated
            .field_deltas
            .iter()
            .filter(|d| d.confidence >= DELTA_MIN_CONFIDENCE)
            .map(|d| json!({ "key": d.key, "value": d.value, "confidence": d.confidence }))
            .collect();
        if accepted.is_empty() {
            return Ok(());
        }
        let deltas = Value::Array(accepted);
        ctx.rollups
            .stage_deltas(deal.workspace_id, deal.id, deal.crm, week_start, &deltas)
            .await?;

        let week_key = week_start.to_string();
        let idempotency_key = build_crm_idempotency_key(&CrmIdempotencyInput {
            workspace_id: deal.workspace_id,
            crm_system: deal.crm,
            object_type: "deal",
            object_id: &deal.crm_deal_id,
            action: "apply_field_deltas",
            source_event_id: &week_key,
        });
        let payload = json!({
            "deal_id": deal.crm_deal_id,
            "week_start": week_key,
            "deltas": deltas,
        });
        let payload_hash = hash_payload(&payload);
        let status = if ctx.config.dry_run {
            WriteStatus::DryRun
        } else {
            WriteStatus::Queued
        };
        let outcome = ctx
            .crm_writes
            .plan_write(
                &PlannedWrite {
                    workspace_id: deal.workspace_id,
                    crm: deal.crm,
                    object_type: "deal",
                    object_id: &deal.crm_deal_id,
                    action: "apply_field_deltas",
                    idempotency_key: &idempotency_key,
                    payload: &payload,
                    payload_hash: &payload_hash,
                },
                status,
            )
            .await?;
        if let PlanOutcome::Created(write_id) = outcome {
            ctx.audit
                .append(
                    deal.workspace_id,
                    None,
                    Some(job.id),
                    events::CRM_WRITE_PLANNED,
                    &json!({
                        "deal_id": deal.id,
                        "write_id": write_id,
                        "action": "apply_field_deltas",
                        "week_start": week_key,
                        "dry_run": ctx.config.dry_run,
                    }),
                )
                .await?;
            if !ctx.config.dry_run {
                ctx.jobs
                    .enqueue(
                        deal.workspace_id,
                        JobType::sync_for(deal.crm),
                        &JobPayload::Sync(SyncPayload {
                            crm_write_log_id: Some(write_id),
                            ..Default::default()
                        })
                        .encode(),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Plan the summary-note write back to the deal's CRM.
    async fn plan_rollup_write(
        &self,
        ctx: &ProcessorContext,
        job: &Job,
        deal: &DealRecord,
        week_start: NaiveDate,
        summary: &str,
    ) -> Result<()> {
        let workspace_id = deal.workspace_id;
        let week_key = week_start.to_string();
        let idempotency_key = build_crm_idempotency_key(&CrmIdempotencyInput {
            workspace_id,
            crm_system: deal.crm,
            object_type: "deal",
            object_id: &deal.crm_deal_id,
            action: "upsert_weekly_summary_note",
            source_event_id: &week_key,
        });
        let payload = json!({
            "deal_id": deal.crm_deal_id,
            "week_start": week_key,
            "summary_md": summary,
        });
        let payload_hash = hash_payload(&payload);
        let status = if ctx.config.dry_run {
            WriteStatus::DryRun
        } else {
            WriteStatus::Queued
        };

        let outcome = ctx
            .crm_writes
            .plan_write(
                &PlannedWrite {
                    workspace_id,
                    crm: deal.crm,
                    object_type: "deal",
                    object_id: &deal.crm_deal_id,
                    action: "upsert_weekly_summary_note",
                    idempotency_key: &idempotency_key,
                    payload: &payload,
                    payload_hash: &payload_hash,
                },
                status,
            )
            .await?;

        if let PlanOutcome::Created(write_id) = outcome {
            ctx.audit
                .append(
                    workspace_id,
                    None,
                    Some(job.id),
                    events::WEEKLY_ROLLUP_LOGGED_TO_CRM,
                    &json!({
                        "deal_id": deal.id,
                        "write_id": write_id,
                        "week_start": week_key,
                        "dry_run": ctx.config.dry_run,
                    }),
                )
                .await?;
            if !ctx.config.dry_run {
                ctx.jobs
                    .enqueue(
                        workspace_id,
                        JobType::sync_for(deal.crm),
                        &JobPayload::Sync(SyncPayload {
                            crm_write_log_id: Some(write_id),
                            ..Default::default()
                        })
                        .encode(),
                    )
                    .await?;
            }
        }
        Ok(())
    }
}

/// Monday of the most recent fully elapsed week.
pub fn previous_week_start(today: NaiveDate) -> NaiveDate {
    let this_monday = today - Duration::days(today.weekday().num_days_from_monday() as i64);
    this_monday - Duration::days(7)
}

fn week_window(week_start: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = week_start.and_time(NaiveTime::MIN).and_utc();
    (start, start + Duration::days(7))
}

/// The always-available rollup body built from structured data alone.
pub fn deterministic_rollup(
    title: &str,
    readiness: &BantReadiness,
    messages: &[Message],
    review_reasons: &[String],
    writes_paused: bool,
) -> String {
    let mut out = String::new();

    out.push_str("### What happened this week\n");
    if messages.is_empty() {
        out.push_str("- No new messages this week.\n");
    } else {
        out.push_str(&format!("- {} message(s) received.\n", messages.len()));
        for subject in messages.iter().filter_map(|m| m.subject.as_deref()).take(5) {
            out.push_str(&format!("- {subject}\n"));
        }
    }

    out.push_str("\n### Current status\n");
    out.push_str(&format!(
        "- Readiness score: {:.0}%\n",
        readiness.readiness_score
    ));
    for key in &readiness.missing_keys {
        out.push_str(&format!("- Missing: {}\n", key.as_str()));
    }

    out.push_str("\n### Risks / blockers\n");
    let mut risks: Vec<&str> = review_reasons.iter().map(String::as_str).collect();
    if writes_paused {
        risks.push(PAUSED_RISK);
    }
    if risks.is_empty() {
        out.push_str("- None identified.\n");
    } else {
        for risk in risks {
            out.push_str(&format!("- {risk}\n"));
        }
    }

    out.push_str("\n### Recommended next actions\n");
    if readiness.missing_keys.is_empty() {
        out.push_str("- Keep momentum; no qualification gaps.\n");
    } else {
        for key in &readiness.missing_keys {
            out.push_str(&format!("- Collect {} evidence on {title}.\n", key.as_str()));
        }
    }

    out
}
