//! Weekly rollups, LLM run telemetry, and staged CRM deltas.

use chrono::{NaiveDate, Utc};
use libsql::params;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::crm::CrmSystem;
use crate::error::DatabaseError;
use crate::store::db::{Database, opt_text};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMethod {
    Deterministic,
    Llm,
    LlmFallback,
}

impl GenerationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationMethod::Deterministic => "deterministic",
            GenerationMethod::Llm => "llm",
            GenerationMethod::LlmFallback => "llm_fallback",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "llm" => GenerationMethod::Llm,
            "llm_fallback" => GenerationMethod::LlmFallback,
            _ => GenerationMethod::Deterministic,
        }
    }
}

/// Terminal state of one recorded LLM attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmRunStatus {
    Succeeded,
    Invalid,
    Error,
}

impl LlmRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmRunStatus::Succeeded => "succeeded",
            LlmRunStatus::Invalid => "invalid",
            LlmRunStatus::Error => "error",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "succeeded" => LlmRunStatus::Succeeded,
            "invalid" => LlmRunStatus::Invalid,
            _ => LlmRunStatus::Error,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WeeklyRollup {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub deal_id: Uuid,
    pub week_start: NaiveDate,
    pub summary_md: String,
    pub generation_method: GenerationMethod,
}

#[derive(Debug, Clone)]
pub struct LlmRunRecord {
    pub status: LlmRunStatus,
    pub validated: Option<Value>,
}

/// Token and latency counters from one LLM call.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LlmTelemetry {
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub latency_ms: Option<u64>,
}

fn opt_integer(value: Option<i64>) -> libsql::Value {
    match value {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

#[derive(Clone)]
pub struct RollupStore {
    db: Database,
}

impl RollupStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // ── Weekly rollups ──────────────────────────────────────────────

    pub async fn get_rollup(
        &self,
        workspace_id: Uuid,
        deal_id: Uuid,
        week_start: NaiveDate,
    ) -> Result<Option<WeeklyRollup>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT id, summary_md, generation_method FROM weekly_rollups
                 WHERE workspace_id = ?1 AND deal_id = ?2 AND week_start = ?3",
                params![
                    workspace_id.to_string(),
                    deal_id.to_string(),
                    week_start.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_rollup: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let id_str: String = row.get(0).unwrap_or_default();
                let summary_md: String = row.get(1).unwrap_or_default();
                let method_str: String = row.get(2).unwrap_or_default();
                Ok(Some(WeeklyRollup {
                    id: Uuid::parse_str(&id_str)
                        .map_err(|e| DatabaseError::Query(format!("rollup id parse: {e}")))?,
                    workspace_id,
                    deal_id,
                    week_start,
                    summary_md,
                    generation_method: GenerationMethod::parse(&method_str),
                }))
            }
            _ => Ok(None),
        }
    }

    /// Insert or replace the rollup for (workspace, deal, week).
    pub async fn upsert_rollup(
        &self,
        workspace_id: Uuid,
        deal_id: Uuid,
        week_start: NaiveDate,
        summary_md: &str,
        method: GenerationMethod,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.db
            .conn()
            .execute(
                "INSERT INTO weekly_rollups (id, workspace_id, deal_id, week_start, summary_md,
                    generation_method, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (workspace_id, deal_id, week_start)
                 DO UPDATE SET summary_md = excluded.summary_md,
                    generation_method = excluded.generation_method",
                params![
                    Uuid::new_v4().to_string(),
                    workspace_id.to_string(),
                    deal_id.to_string(),
                    week_start.to_string(),
                    summary_md,
                    method.as_str(),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_rollup: {e}")))?;
        debug!(deal_id = %deal_id, week_start = %week_start, method = method.as_str(), "Weekly rollup stored");
        Ok(())
    }

    // ── LLM runs ────────────────────────────────────────────────────

    /// Record one LLM attempt. The unique key keeps a repeat prompt from
    /// being billed twice; a duplicate insert is ignored.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_llm_run(
        &self,
        workspace_id: Uuid,
        purpose: &str,
        deal_id: Uuid,
        prompt_hash: &str,
        model: Option<&str>,
        status: LlmRunStatus,
        telemetry: LlmTelemetry,
        raw_output: Option<&str>,
        validated: Option<&Value>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let validated_json = match validated {
            Some(value) => Some(
                serde_json::to_string(value)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
            ),
            None => None,
        };
        self.db
            .conn()
            .execute(
                "INSERT OR IGNORE INTO llm_runs (id, workspace_id, purpose, deal_id, prompt_hash,
                    model, status, input_tokens, output_tokens, latency_ms, raw_output,
                    validated_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    Uuid::new_v4().to_string(),
                    workspace_id.to_string(),
                    purpose,
                    deal_id.to_string(),
                    prompt_hash,
                    opt_text(model),
                    status.as_str(),
                    opt_integer(telemetry.input_tokens.map(i64::from)),
                    opt_integer(telemetry.output_tokens.map(i64::from)),
                    opt_integer(telemetry.latency_ms.map(|v| v as i64)),
                    opt_text(raw_output),
                    crate::store::db::opt_text_owned(validated_json),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_llm_run: {e}")))?;
        Ok(())
    }

    /// Prior run for the same prompt, if any. Used to skip duplicate spend.
    pub async fn get_llm_run(
        &self,
        workspace_id: Uuid,
        purpose: &str,
        deal_id: Uuid,
        prompt_hash: &str,
    ) -> Result<Option<LlmRunRecord>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT status, validated_json FROM llm_runs
                 WHERE workspace_id = ?1 AND purpose = ?2 AND deal_id = ?3 AND prompt_hash = ?4",
                params![
                    workspace_id.to_string(),
                    purpose,
                    deal_id.to_string(),
                    prompt_hash,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_llm_run: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let status_str: String = row.get(0).unwrap_or_default();
                let validated_str: Option<String> = row.get(1).ok();
                Ok(Some(LlmRunRecord {
                    status: LlmRunStatus::parse(&status_str),
                    validated: validated_str.and_then(|s| serde_json::from_str(&s).ok()),
                }))
            }
            _ => Ok(None),
        }
    }

    // ── Staged deltas ───────────────────────────────────────────────

    /// Stage field deltas for a CRM; one set per (deal, crm, week).
    pub async fn stage_deltas(
        &self,
        workspace_id: Uuid,
        deal_id: Uuid,
        crm: CrmSystem,
        week_start: NaiveDate,
        deltas: &Value,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let deltas_json = serde_json::to_string(deltas)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let inserted = self
            .db
            .conn()
            .execute(
                "INSERT OR IGNORE INTO crm_deltas (id, workspace_id, deal_id, crm_system,
                    week_start, deltas_json, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'staged', ?7)",
                params![
                    Uuid::new_v4().to_string(),
                    workspace_id.to_string(),
                    deal_id.to_string(),
                    crm.as_str(),
                    week_start.to_string(),
                    deltas_json,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("stage_deltas: {e}")))?;
        Ok(inserted > 0)
    }

    pub async fn staged_deltas(
        &self,
        workspace_id: Uuid,
        deal_id: Uuid,
    ) -> Result<Vec<Value>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT deltas_json FROM crm_deltas
                 WHERE workspace_id = ?1 AND deal_id = ?2 ORDER BY created_at",
                params![workspace_id.to_string(), deal_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("staged_deltas: {e}")))?;

        let mut deltas = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let json: String = row.get(0).unwrap_or_else(|_| "null".to_string());
            if let Ok(value) = serde_json::from_str(&json) {
                deltas.push(value);
            }
        }
        Ok(deltas)
    }
}
