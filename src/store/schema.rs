//! Schema creation.
//!
//! All statements are idempotent (`IF NOT EXISTS`) and run at every startup.

use libsql::Connection;
use tracing::debug;

use crate::error::DatabaseError;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS workspaces (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS workspace_policies (
        workspace_id TEXT PRIMARY KEY,
        policy_json TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS retention_policies (
        workspace_id TEXT PRIMARY KEY,
        policy_json TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS crm_connections (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        crm_system TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'connected',
        status_detail TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (workspace_id, crm_system)
    )",
    "CREATE TABLE IF NOT EXISTS connection_health (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        crm_system TEXT NOT NULL,
        status TEXT NOT NULL,
        detail TEXT,
        checked_at TEXT NOT NULL,
        UNIQUE (workspace_id, crm_system)
    )",
    "CREATE TABLE IF NOT EXISTS threads (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        subject TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        thread_id TEXT NOT NULL,
        workspace_id TEXT NOT NULL,
        from_email TEXT,
        to_emails_json TEXT NOT NULL DEFAULT '[]',
        subject TEXT,
        body_text TEXT,
        redacted INTEGER NOT NULL DEFAULT 0,
        received_at TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS attachments (
        id TEXT PRIMARY KEY,
        message_id TEXT NOT NULL,
        workspace_id TEXT NOT NULL,
        filename TEXT NOT NULL,
        storage_pointer TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS field_values (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        thread_id TEXT NOT NULL,
        field_key TEXT NOT NULL,
        field_value_json TEXT NOT NULL,
        confidence REAL NOT NULL,
        evidence_json TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        job_type TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'queued',
        payload TEXT NOT NULL DEFAULT '{}',
        attempts INTEGER NOT NULL DEFAULT 0,
        run_after TEXT NOT NULL,
        locked_at TEXT,
        locked_by TEXT,
        last_error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_jobs_claim
        ON jobs (status, run_after, created_at)",
    "CREATE TABLE IF NOT EXISTS crm_write_log (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        crm_system TEXT NOT NULL,
        object_type TEXT NOT NULL,
        object_id TEXT NOT NULL,
        action TEXT NOT NULL,
        idempotency_key TEXT NOT NULL UNIQUE,
        status TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        payload_hash TEXT NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        next_retry_at TEXT,
        external_ids_json TEXT,
        response_json TEXT,
        last_error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS extraction_quality_history (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        source_key TEXT NOT NULL,
        last_good_quality REAL NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (workspace_id, source_key)
    )",
    "CREATE TABLE IF NOT EXISTS drift_alerts (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        source_key TEXT NOT NULL,
        severity TEXT NOT NULL,
        current_quality REAL NOT NULL,
        historical_quality REAL NOT NULL,
        status TEXT NOT NULL DEFAULT 'open',
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS write_pauses (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        scope TEXT NOT NULL,
        scope_value TEXT,
        reason TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'open',
        created_at TEXT NOT NULL,
        resolved_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS review_items (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        thread_id TEXT,
        reason TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'open',
        data_json TEXT,
        created_at TEXT NOT NULL,
        resolved_at TEXT
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_review_items_open
        ON review_items (workspace_id, COALESCE(thread_id, ''), reason)
        WHERE status = 'open'",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_write_pauses_open
        ON write_pauses (workspace_id, scope, COALESCE(scope_value, ''))
        WHERE status = 'open'",
    "CREATE TABLE IF NOT EXISTS deals (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        crm_system TEXT NOT NULL,
        crm_deal_id TEXT NOT NULL,
        title TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (workspace_id, crm_system, crm_deal_id)
    )",
    "CREATE TABLE IF NOT EXISTS thread_links (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        thread_id TEXT NOT NULL,
        deal_id TEXT,
        match_score REAL,
        match_reason TEXT,
        status TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (workspace_id, thread_id)
    )",
    "CREATE TABLE IF NOT EXISTS deal_facts (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        deal_id TEXT NOT NULL,
        fact_key TEXT NOT NULL,
        value_json TEXT NOT NULL,
        confidence REAL NOT NULL,
        evidence_json TEXT,
        updated_at TEXT NOT NULL,
        UNIQUE (workspace_id, deal_id, fact_key)
    )",
    "CREATE TABLE IF NOT EXISTS deal_readiness (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        deal_id TEXT NOT NULL,
        framework TEXT NOT NULL,
        readiness_score REAL NOT NULL,
        missing_keys_json TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (workspace_id, deal_id, framework)
    )",
    "CREATE TABLE IF NOT EXISTS association_candidates (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        thread_id TEXT NOT NULL,
        candidates_json TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'open',
        created_at TEXT NOT NULL,
        resolved_at TEXT
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_association_candidates_open
        ON association_candidates (workspace_id, thread_id)
        WHERE status = 'open'",
    "CREATE TABLE IF NOT EXISTS weekly_rollups (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        deal_id TEXT NOT NULL,
        week_start TEXT NOT NULL,
        summary_md TEXT NOT NULL,
        generation_method TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (workspace_id, deal_id, week_start)
    )",
    "CREATE TABLE IF NOT EXISTS llm_runs (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        purpose TEXT NOT NULL,
        deal_id TEXT NOT NULL,
        prompt_hash TEXT NOT NULL,
        model TEXT,
        status TEXT NOT NULL,
        input_tokens INTEGER,
        output_tokens INTEGER,
        latency_ms INTEGER,
        raw_output TEXT,
        validated_json TEXT,
        created_at TEXT NOT NULL,
        UNIQUE (workspace_id, purpose, deal_id, prompt_hash)
    )",
    "CREATE TABLE IF NOT EXISTS crm_deltas (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        deal_id TEXT NOT NULL,
        crm_system TEXT NOT NULL,
        week_start TEXT NOT NULL,
        deltas_json TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'staged',
        created_at TEXT NOT NULL,
        UNIQUE (workspace_id, deal_id, crm_system, week_start)
    )",
    "CREATE TABLE IF NOT EXISTS audit_events (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        thread_id TEXT,
        job_id TEXT,
        event_type TEXT NOT NULL,
        data_json TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_audit_events_workspace_type
        ON audit_events (workspace_id, event_type)",
];

pub async fn init_schema(conn: &Connection) -> Result<(), DatabaseError> {
    for statement in SCHEMA {
        conn.execute(statement, ())
            .await
            .map_err(|e| DatabaseError::Schema(format!("{e}: {statement}")))?;
    }
    debug!(statements = SCHEMA.len(), "Schema initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::store::Database;

    #[tokio::test]
    async fn schema_init_is_idempotent() {
        let db = Database::new_memory().await.unwrap();
        super::init_schema(db.conn()).await.unwrap();
        super::init_schema(db.conn()).await.unwrap();
    }
}
