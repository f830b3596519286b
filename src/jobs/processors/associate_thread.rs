//! Thread-to-deal association and deal readiness.
//!
//! Exactly one candidate auto-links; zero or several route to the review
//! queue instead. A fresh link updates BANT facts, recomputes readiness,
//! and plans a follow-up task write carrying the suggested questions.

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::crm::CrmSystem;
use crate::crm::candidates::DealCandidate;
use crate::error::{JobError, Result};
use crate::extraction::FieldKey;
use crate::governance::readiness::{BantKey, DealFact, compute_bant_readiness, suggest_questions};
use crate::idempotency::{CrmIdempotencyInput, build_crm_idempotency_key, hash_payload};
use crate::jobs::processors::{JobProcessor, ProcessorContext};
use crate::jobs::types::{Job, JobPayload, JobType, SyncPayload, ThreadPayload};
use crate::store::audit::events;
use crate::store::crm_writes::{PlanOutcome, PlannedWrite, WriteStatus};
use crate::store::threads::Message;

pub const UNLINKED_REVIEW_REASON: &str = "unlinked_thread";
pub const NEEDS_LINKING_REVIEW_REASON: &str = "needs_deal_linking";

/// Fixed confidence for the budget-mention heuristic.
const BUDGET_HEURISTIC_CONFIDENCE: f64 = 0.6;

fn budget_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(\$\s?\d|budget|pricing|\d+\s?(usd|dollars|k|m)\b)").unwrap()
    })
}

pub struct AssociateThread;

#[async_trait]
impl JobProcessor for AssociateThread {
    async fn process(&self, ctx: &ProcessorContext, job: &Job) -> Result<()> {
        let JobPayload::AssociateThread(ThreadPayload { thread_id }) = job.typed_payload()?
        else {
            return Err(JobError::MissingPayload {
                field: "thread_id".into(),
            }
            .into());
        };
        let workspace_id = job.workspace_id;

        let messages = ctx.threads.list_messages(thread_id).await?;
        let participants = participant_emails(&messages);
        let sender_domain = first_external_domain(&participants);

        let candidates = ctx
            .capabilities
            .candidates
            .candidates_for_thread(
                workspace_id,
                thread_id,
                &participants,
                sender_domain.as_deref().unwrap_or_default(),
            )
            .await?;

        match candidates.as_slice() {
            [] => {
                ctx.deals.mark_thread_unlinked(workspace_id, thread_id).await?;
                ctx.governance
                    .open_review_if_absent(
                        workspace_id,
                        Some(thread_id),
                        UNLINKED_REVIEW_REASON,
                        Some(&json!({ "participants": participants })),
                    )
                    .await?;
                ctx.audit
                    .append(
                        workspace_id,
                        Some(thread_id),
                        Some(job.id),
                        events::THREAD_UNLINKED,
                        &json!({ "sender_domain": sender_domain }),
                    )
                    .await?;
                info!(thread_id = %thread_id, "No deal candidates, thread left unlinked");
            }
            [only] => {
                self.link_single(ctx, job, thread_id, only, &messages).await?;
            }
            several => {
                ctx.deals
                    .open_candidates_if_absent(workspace_id, thread_id, several)
                    .await?;
                ctx.governance
                    .open_review_if_absent(
                        workspace_id,
                        Some(thread_id),
                        NEEDS_LINKING_REVIEW_REASON,
                        Some(&json!({ "candidate_count": several.len() })),
                    )
                    .await?;
                ctx.audit
                    .append(
                        workspace_id,
                        Some(thread_id),
                        Some(job.id),
                        events::THREAD_NEEDS_LINKING,
                        &json!({ "candidate_count": several.len() }),
                    )
                    .await?;
                info!(
                    thread_id = %thread_id,
                    candidates = several.len(),
                    "Multiple deal candidates, review required"
                );
            }
        }

        Ok(())
    }
}

impl AssociateThread {
    async fn link_single(
        &self,
        ctx: &ProcessorContext,
        job: &Job,
        thread_id: Uuid,
        candidate: &DealCandidate,
        messages: &[Message],
    ) -> Result<()> {
        let workspace_id = job.workspace_id;
        let crm = ctx
            .workspaces
            .connected_crms(workspace_id)
            .await?
            .into_iter()
            .next()
            .unwrap_or(CrmSystem::Hubspot);

        let deal_id = ctx
            .deals
            .upsert_deal(workspace_id, crm, &candidate.deal_id, &candidate.title)
            .await?;
        ctx.deals
            .link_thread(
                workspace_id,
                thread_id,
                deal_id,
                candidate.match_confidence,
                candidate.match_reason(),
            )
            .await?;

        // A resolved link closes out any earlier ambiguity for this thread.
        ctx.deals.resolve_candidates(workspace_id, thread_id).await?;
        ctx.governance
            .resolve_review(workspace_id, thread_id, NEEDS_LINKING_REVIEW_REASON)
            .await?;
        ctx.governance
            .resolve_review(workspace_id, thread_id, UNLINKED_REVIEW_REASON)
            .await?;

        self.update_facts(ctx, thread_id, deal_id, messages, workspace_id).await?;

        let facts = ctx.deals.list_facts(workspace_id, deal_id).await?;
        let readiness = compute_bant_readiness(&facts);
        ctx.deals
            .upsert_readiness(workspace_id, deal_id, "bant", &readiness)
            .await?;
        ctx.audit
            .append(
                workspace_id,
                Some(thread_id),
                Some(job.id),
                events::DEAL_READINESS_UPDATED,
                &json!({
                    "deal_id": deal_id,
                    "readiness_score": readiness.readiness_score,
                    "missing_keys": readiness
                        .missing_keys
                        .iter()
                        .map(|k| k.as_str())
                        .collect::<Vec<_>>(),
                }),
            )
            .await?;

        if !readiness.missing_keys.is_empty() {
            self.plan_followup_tasks(ctx, job, thread_id, crm, &candidate.deal_id, &readiness.missing_keys)
                .await?;
        }

        ctx.audit
            .append(
                workspace_id,
                Some(thread_id),
                Some(job.id),
                events::THREAD_AUTO_LINKED,
                &json!({
                    "deal_id": deal_id,
                    "crm_deal_id": candidate.deal_id,
                    "match_confidence": candidate.match_confidence,
                    "match_reason": candidate.match_reason(),
                }),
            )
            .await?;
        info!(thread_id = %thread_id, deal_id = %deal_id, "Thread auto-linked to single candidate");
        Ok(())
    }

    /// Derive BANT facts from extracted fields and message text.
    async fn update_facts(
        &self,
        ctx: &ProcessorContext,
        thread_id: Uuid,
        deal_id: Uuid,
        messages: &[Message],
        workspace_id: Uuid,
    ) -> Result<()> {
        let fields = ctx.threads.fields_for_thread(thread_id).await?;

        if let Some(timeline) = fields.iter().find(|f| f.field_key == FieldKey::Timeline) {
            ctx.deals
                .upsert_fact(
                    workspace_id,
                    deal_id,
                    &DealFact {
                        key: BantKey::Timeline,
                        value_json: timeline.field_value_json.clone(),
                        confidence: timeline.confidence,
                        evidence_json: timeline.evidence_json.clone(),
                    },
                )
                .await?;
        }

        if let Some(evidence) = budget_mention(messages) {
            ctx.deals
                .upsert_fact(
                    workspace_id,
                    deal_id,
                    &DealFact {
                        key: BantKey::Budget,
                        value_json: json!("mentioned"),
                        confidence: BUDGET_HEURISTIC_CONFIDENCE,
                        evidence_json: json!({ "snippet": evidence }),
                    },
                )
                .await?;
        }

        Ok(())
    }

    /// Plan the follow-up task write that carries the suggested questions.
    async fn plan_followup_tasks(
        &self,
        ctx: &ProcessorContext,
        job: &Job,
        thread_id: Uuid,
        crm: CrmSystem,
        crm_deal_id: &str,
        missing_keys: &[BantKey],
    ) -> Result<()> {
        let workspace_id = job.workspace_id;
        let thread_key = thread_id.to_string();
        let idempotency_key = build_crm_idempotency_key(&CrmIdempotencyInput {
            workspace_id,
            crm_system: crm,
            object_type: "deal",
            object_id: crm_deal_id,
            action: "followup_tasks",
            source_event_id: &thread_key,
        });

        let payload = json!({
            "deal_id": crm_deal_id,
            "questions": suggest_questions(missing_keys),
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
                    crm,
                    object_type: "deal",
                    object_id: crm_deal_id,
                    action: "followup_tasks",
                    idempotency_key: &idempotency_key,
                    payload: &payload,
                    payload_hash: &payload_hash,
                },
                status,
            )
            .await?;

        match outcome {
            PlanOutcome::Created(write_id) => {
                ctx.audit
                    .append(
                        workspace_id,
                        Some(thread_id),
                        Some(job.id),
                        events::CRM_WRITE_PLANNED,
                        &json!({
                            "write_id": write_id,
                            "action": "followup_tasks",
                            "crm": crm.as_str(),
                            "dry_run": ctx.config.dry_run,
                        }),
                    )
                    .await?;
                if !ctx.config.dry_run {
                    ctx.jobs
                        .enqueue(
                            workspace_id,
                            JobType::sync_for(crm),
                            &JobPayload::Sync(SyncPayload {
                                crm_write_log_id: Some(write_id),
                                ..Default::default()
                            })
                            .encode(),
                        )
                        .await?;
                }
            }
            PlanOutcome::Existing(existing) => {
                debug!(
                    write_id = %existing.id,
                    "Follow-up task write already planned, nothing to do"
                );
            }
        }
        Ok(())
    }
}

/// All participant addresses, lowercased and deduped, sender first.
fn participant_emails(messages: &[Message]) -> Vec<String> {
    let mut seen = Vec::new();
    for message in messages {
        let addresses = message
            .from_email
            .iter()
            .map(String::as_str)
            .chain(message.to_emails.iter().map(String::as_str));
        for address in addresses {
            let lowered = address.trim().to_lowercase();
            if !lowered.is_empty() && !seen.contains(&lowered) {
                seen.push(lowered);
            }
        }
    }
    seen
}

/// Domain of the first sender address; inbound senders are external.
fn first_external_domain(participants: &[String]) -> Option<String> {
    participants
        .iter()
        .find_map(|address| address.split_once('@').map(|(_, domain)| domain.to_string()))
}

/// First budget-flavored line in the thread, if any.
fn budget_mention(messages: &[Message]) -> Option<String> {
    for message in messages {
        let Some(body) = message.body_text.as_deref() else {
            continue;
        };
        for line in body.lines() {
            if budget_regex().is_match(line) {
                return Some(line.trim().to_string());
            }
        }
    }
    None
}
