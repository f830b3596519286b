//! Workspaces, their policies, and CRM connection state.

use chrono::{DateTime, Utc};
use libsql::params;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::crm::CrmSystem;
use crate::error::DatabaseError;
use crate::governance::retention::RetentionPolicy;
use crate::store::db::{Database, opt_text, parse_datetime};

// ── Policy vocabulary ───────────────────────────────────────────────

/// Scope of the write pause raised when drift fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PauseScope {
    #[default]
    SourceKey,
    Schema,
    Workspace,
}

impl PauseScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseScope::SourceKey => "source_key",
            PauseScope::Schema => "schema",
            PauseScope::Workspace => "workspace",
        }
    }
}

/// How much raw material the LLM rollup context may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LlmContextLevel {
    #[default]
    StructuredOnly,
    StructuredPlusSnippets,
}

/// Per-workspace behavior toggles, stored as a JSON blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspacePolicy {
    pub use_llm_rollups: bool,
    pub llm_context_level: LlmContextLevel,
    pub write_weekly_rollup_to_crm: bool,
    pub create_crm_deltas: bool,
    pub drift_pause_scope: PauseScope,
}

impl Default for WorkspacePolicy {
    fn default() -> Self {
        Self {
            use_llm_rollups: false,
            llm_context_level: LlmContextLevel::StructuredOnly,
            write_weekly_rollup_to_crm: false,
            create_crm_deltas: false,
            drift_pause_scope: PauseScope::SourceKey,
        }
    }
}

// ── Records ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Workspace {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Error,
    Disconnected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Disconnected => "disconnected",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "error" => ConnectionStatus::Error,
            "disconnected" => ConnectionStatus::Disconnected,
            _ => ConnectionStatus::Connected,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrmConnection {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub crm: CrmSystem,
    pub status: ConnectionStatus,
    pub status_detail: Option<String>,
}

/// Outcome of a connection liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Ok,
    Warning,
    Error,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Ok => "ok",
            HealthStatus::Warning => "warning",
            HealthStatus::Error => "error",
        }
    }
}

// ── Store ───────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct WorkspaceStore {
    db: Database,
}

impl WorkspaceStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create_workspace(&self, name: &str) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        self.db
            .conn()
            .execute(
                "INSERT INTO workspaces (id, name, created_at) VALUES (?1, ?2, ?3)",
                params![id.to_string(), name, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_workspace: {e}")))?;
        debug!(workspace_id = %id, name, "Workspace created");
        Ok(id)
    }

    pub async fn list_workspaces(&self) -> Result<Vec<Workspace>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query("SELECT id, name, created_at FROM workspaces ORDER BY created_at", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("list_workspaces: {e}")))?;

        let mut workspaces = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id_str: String = row.get(0).unwrap_or_default();
            let name: String = row.get(1).unwrap_or_default();
            let created_str: String = row.get(2).unwrap_or_default();
            let Ok(id) = Uuid::parse_str(&id_str) else {
                warn!(id = id_str, "Skipping workspace row with bad id");
                continue;
            };
            workspaces.push(Workspace {
                id,
                name,
                created_at: parse_datetime(&created_str),
            });
        }
        Ok(workspaces)
    }

    // ── Policies ────────────────────────────────────────────────────

    pub async fn set_policy(
        &self,
        workspace_id: Uuid,
        policy: &WorkspacePolicy,
    ) -> Result<(), DatabaseError> {
        let json = serde_json::to_string(policy)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();
        self.db
            .conn()
            .execute(
                "INSERT INTO workspace_policies (workspace_id, policy_json, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (workspace_id) DO UPDATE SET policy_json = ?2, updated_at = ?3",
                params![workspace_id.to_string(), json, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_policy: {e}")))?;
        Ok(())
    }

    /// Workspace policy, defaulting when never set or unreadable.
    pub async fn get_policy(&self, workspace_id: Uuid) -> Result<WorkspacePolicy, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT policy_json FROM workspace_policies WHERE workspace_id = ?1",
                params![workspace_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_policy: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let json: String = row.get(0).unwrap_or_else(|_| "{}".to_string());
                Ok(serde_json::from_str(&json).unwrap_or_default())
            }
            _ => Ok(WorkspacePolicy::default()),
        }
    }

    pub async fn set_retention_policy(
        &self,
        workspace_id: Uuid,
        policy: &RetentionPolicy,
    ) -> Result<(), DatabaseError> {
        let json = serde_json::to_string(policy)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();
        self.db
            .conn()
            .execute(
                "INSERT INTO retention_policies (workspace_id, policy_json, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (workspace_id) DO UPDATE SET policy_json = ?2, updated_at = ?3",
                params![workspace_id.to_string(), json, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_retention_policy: {e}")))?;
        Ok(())
    }

    pub async fn get_retention_policy(
        &self,
        workspace_id: Uuid,
    ) -> Result<RetentionPolicy, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT policy_json FROM retention_policies WHERE workspace_id = ?1",
                params![workspace_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_retention_policy: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let json: String = row.get(0).unwrap_or_else(|_| "{}".to_string());
                Ok(serde_json::from_str(&json).unwrap_or_default())
            }
            _ => Ok(RetentionPolicy::default()),
        }
    }

    // ── CRM connections ─────────────────────────────────────────────

    pub async fn connect_crm(
        &self,
        workspace_id: Uuid,
        crm: CrmSystem,
    ) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        self.db
            .conn()
            .execute(
                "INSERT INTO crm_connections (id, workspace_id, crm_system, status,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'connected', ?4, ?4)
                 ON CONFLICT (workspace_id, crm_system)
                 DO UPDATE SET status = 'connected', status_detail = NULL, updated_at = ?4",
                params![id.to_string(), workspace_id.to_string(), crm.as_str(), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("connect_crm: {e}")))?;
        Ok(id)
    }

    pub async fn connected_crms(&self, workspace_id: Uuid) -> Result<Vec<CrmSystem>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT crm_system FROM crm_connections
                 WHERE workspace_id = ?1 AND status = 'connected'
                 ORDER BY crm_system",
                params![workspace_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("connected_crms: {e}")))?;

        let mut crms = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let crm_str: String = row.get(0).unwrap_or_default();
            if let Some(crm) = CrmSystem::parse(&crm_str) {
                crms.push(crm);
            }
        }
        Ok(crms)
    }

    /// Every connection in `connected` status, across workspaces.
    pub async fn all_connected(&self) -> Result<Vec<CrmConnection>, DatabaseError> {
        self.list_connections("status = 'connected'").await
    }

    async fn list_connections(&self, filter: &str) -> Result<Vec<CrmConnection>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                &format!(
                    "SELECT id, workspace_id, crm_system, status, status_detail
                     FROM crm_connections WHERE {filter} ORDER BY workspace_id, crm_system"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_connections: {e}")))?;

        let mut connections = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id_str: String = row.get(0).unwrap_or_default();
            let ws_str: String = row.get(1).unwrap_or_default();
            let crm_str: String = row.get(2).unwrap_or_default();
            let status_str: String = row.get(3).unwrap_or_default();
            let detail: Option<String> = row.get(4).ok();
            let (Ok(id), Ok(workspace_id), Some(crm)) = (
                Uuid::parse_str(&id_str),
                Uuid::parse_str(&ws_str),
                CrmSystem::parse(&crm_str),
            ) else {
                warn!(id = id_str, "Skipping malformed crm_connections row");
                continue;
            };
            connections.push(CrmConnection {
                id,
                workspace_id,
                crm,
                status: ConnectionStatus::parse(&status_str),
                status_detail: detail,
            });
        }
        Ok(connections)
    }

    /// Flag a connection as broken with the failure detail.
    pub async fn flag_connection_error(
        &self,
        workspace_id: Uuid,
        crm: CrmSystem,
        detail: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.db
            .conn()
            .execute(
                "UPDATE crm_connections SET status = 'error', status_detail = ?1, updated_at = ?2
                 WHERE workspace_id = ?3 AND crm_system = ?4",
                params![detail, now, workspace_id.to_string(), crm.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("flag_connection_error: {e}")))?;
        warn!(workspace_id = %workspace_id, crm = %crm, detail, "CRM connection flagged");
        Ok(())
    }

    pub async fn get_connection(
        &self,
        workspace_id: Uuid,
        crm: CrmSystem,
    ) -> Result<Option<CrmConnection>, DatabaseError> {
        let connections = self
            .list_connections("1 = 1")
            .await?
            .into_iter()
            .find(|c| c.workspace_id == workspace_id && c.crm == crm);
        Ok(connections)
    }

    // ── Connection health ───────────────────────────────────────────

    /// One health row per (workspace, crm); each probe overwrites the last.
    pub async fn record_health(
        &self,
        workspace_id: Uuid,
        crm: CrmSystem,
        status: HealthStatus,
        detail: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        self.db
            .conn()
            .execute(
                "INSERT INTO connection_health (id, workspace_id, crm_system, status, detail,
                    checked_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (workspace_id, crm_system) DO UPDATE SET
                    status = excluded.status,
                    detail = excluded.detail,
                    checked_at = excluded.checked_at",
                params![
                    id.to_string(),
                    workspace_id.to_string(),
                    crm.as_str(),
                    status.as_str(),
                    opt_text(detail),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_health: {e}")))?;
        Ok(())
    }

    pub async fn latest_health(
        &self,
        workspace_id: Uuid,
        crm: CrmSystem,
    ) -> Result<Option<(String, Option<String>)>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT status, detail FROM connection_health
                 WHERE workspace_id = ?1 AND crm_system = ?2",
                params![workspace_id.to_string(), crm.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_health: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let status: String = row.get(0).unwrap_or_default();
                let detail: Option<String> = row.get(1).ok();
                Ok(Some((status, detail)))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> WorkspaceStore {
        WorkspaceStore::new(Database::new_memory().await.unwrap())
    }

    #[tokio::test]
    async fn policy_defaults_when_unset() {
        let store = store().await;
        let ws = store.create_workspace("acme").await.unwrap();
        let policy = store.get_policy(ws).await.unwrap();
        assert_eq!(policy, WorkspacePolicy::default());
        assert!(!policy.use_llm_rollups);
    }

    #[tokio::test]
    async fn policy_round_trip() {
        let store = store().await;
        let ws = store.create_workspace("acme").await.unwrap();
        let policy = WorkspacePolicy {
            use_llm_rollups: true,
            llm_context_level: LlmContextLevel::StructuredPlusSnippets,
            write_weekly_rollup_to_crm: true,
            create_crm_deltas: true,
            drift_pause_scope: PauseScope::Workspace,
        };
        store.set_policy(ws, &policy).await.unwrap();
        assert_eq!(store.get_policy(ws).await.unwrap(), policy);
    }

    #[tokio::test]
    async fn policy_json_tolerates_unknown_and_missing_keys() {
        let policy: WorkspacePolicy =
            serde_json::from_str(r#"{"use_llm_rollups":true,"future_toggle":1}"#).unwrap();
        assert!(policy.use_llm_rollups);
        assert_eq!(policy.llm_context_level, LlmContextLevel::StructuredOnly);
    }

    #[tokio::test]
    async fn connection_flagging() {
        let store = store().await;
        let ws = store.create_workspace("acme").await.unwrap();
        store.connect_crm(ws, CrmSystem::Hubspot).await.unwrap();
        assert_eq!(store.connected_crms(ws).await.unwrap(), vec![CrmSystem::Hubspot]);

        store
            .flag_connection_error(ws, CrmSystem::Hubspot, "token refresh rejected (401)")
            .await
            .unwrap();
        assert!(store.connected_crms(ws).await.unwrap().is_empty());
        let conn = store.get_connection(ws, CrmSystem::Hubspot).await.unwrap().unwrap();
        assert_eq!(conn.status, ConnectionStatus::Error);

        // Reconnecting clears the error
        store.connect_crm(ws, CrmSystem::Hubspot).await.unwrap();
        let conn = store.get_connection(ws, CrmSystem::Hubspot).await.unwrap().unwrap();
        assert_eq!(conn.status, ConnectionStatus::Connected);
        assert!(conn.status_detail.is_none());
    }

    #[tokio::test]
    async fn health_row_is_overwritten_per_probe() {
        let store = store().await;
        let ws = store.create_workspace("acme").await.unwrap();
        store
            .record_health(ws, CrmSystem::Hubspot, HealthStatus::Ok, None)
            .await
            .unwrap();
        store
            .record_health(ws, CrmSystem::Hubspot, HealthStatus::Error, Some("401"))
            .await
            .unwrap();
        let (status, detail) = store
            .latest_health(ws, CrmSystem::Hubspot)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, "error");
        assert_eq!(detail.as_deref(), Some("401"));

        let mut rows = store
            .db
            .conn()
            .query(
                "SELECT COUNT(*) FROM connection_health WHERE workspace_id = ?1",
                params![ws.to_string()],
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 1);
    }
}
