//! Governance state: extraction quality baselines, drift alerts, write
//! pauses, and the review queue.

use chrono::{DateTime, Utc};
use libsql::params;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::governance::drift::DriftSeverity;
use crate::store::db::{Database, opt_text, parse_datetime};
use crate::store::workspaces::PauseScope;

#[derive(Debug, Clone)]
pub struct ReviewItem {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub thread_id: Option<Uuid>,
    pub reason: String,
    pub status: String,
    pub data_json: Option<Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct WritePause {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub scope: PauseScope,
    pub scope_value: Option<String>,
    pub reason: String,
}

#[derive(Clone)]
pub struct GovernanceStore {
    db: Database,
}

impl GovernanceStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // ── Quality baselines ───────────────────────────────────────────

    pub async fn last_good_quality(
        &self,
        workspace_id: Uuid,
        source_key: &str,
    ) -> Result<Option<f64>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT last_good_quality FROM extraction_quality_history
                 WHERE workspace_id = ?1 AND source_key = ?2",
                params![workspace_id.to_string(), source_key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("last_good_quality: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row.get(0).unwrap_or(0.0))),
            _ => Ok(None),
        }
    }

    /// Raise the quality baseline for a source; never lowers it.
    pub async fn ratchet_quality(
        &self,
        workspace_id: Uuid,
        source_key: &str,
        quality: f64,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.db
            .conn()
            .execute(
                "INSERT INTO extraction_quality_history
                    (id, workspace_id, source_key, last_good_quality, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (workspace_id, source_key)
                 DO UPDATE SET
                    last_good_quality = MAX(last_good_quality, excluded.last_good_quality),
                    updated_at = excluded.updated_at",
                params![
                    Uuid::new_v4().to_string(),
                    workspace_id.to_string(),
                    source_key,
                    quality,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("ratchet_quality: {e}")))?;
        debug!(workspace_id = %workspace_id, source_key, quality, "Quality baseline updated");
        Ok(())
    }

    // ── Drift alerts ────────────────────────────────────────────────

    pub async fn insert_drift_alert(
        &self,
        workspace_id: Uuid,
        source_key: &str,
        severity: DriftSeverity,
        current_quality: f64,
        historical_quality: f64,
    ) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        self.db
            .conn()
            .execute(
                "INSERT INTO drift_alerts (id, workspace_id, source_key, severity,
                    current_quality, historical_quality, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'open', ?7)",
                params![
                    id.to_string(),
                    workspace_id.to_string(),
                    source_key,
                    severity.as_str(),
                    current_quality,
                    historical_quality,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_drift_alert: {e}")))?;
        warn!(
            workspace_id = %workspace_id,
            source_key,
            severity = severity.as_str(),
            current_quality,
            historical_quality,
            "Extraction drift detected"
        );
        Ok(id)
    }

    pub async fn open_drift_alert_count(&self, workspace_id: Uuid) -> Result<u64, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT COUNT(*) FROM drift_alerts WHERE workspace_id = ?1 AND status = 'open'",
                params![workspace_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("open_drift_alert_count: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) as u64),
            _ => Ok(0),
        }
    }

    // ── Write pauses ────────────────────────────────────────────────

    /// Open a write pause unless an identical open pause exists.
    ///
    /// Returns the pause id when a new one was created. The partial unique
    /// index on open pauses makes this safe under racing workers; the
    /// loser's insert is ignored.
    pub async fn open_pause_if_absent(
        &self,
        workspace_id: Uuid,
        scope: PauseScope,
        scope_value: Option<&str>,
        reason: &str,
    ) -> Result<Option<Uuid>, DatabaseError> {
        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        let inserted = self
            .db
            .conn()
            .execute(
                "INSERT OR IGNORE INTO write_pauses (id, workspace_id, scope, scope_value,
                    reason, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'open', ?6)",
                params![
                    id.to_string(),
                    workspace_id.to_string(),
                    scope.as_str(),
                    opt_text(scope_value),
                    reason,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("open_pause_if_absent: {e}")))?;
        if inserted == 0 {
            return Ok(None);
        }
        info!(workspace_id = %workspace_id, scope = scope.as_str(), reason, "Write pause opened");
        Ok(Some(id))
    }

    /// Whether the workspace has any open write pause, at any scope.
    pub async fn has_open_pause(&self, workspace_id: Uuid) -> Result<bool, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT COUNT(*) FROM write_pauses
                 WHERE workspace_id = ?1 AND status = 'open'",
                params![workspace_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("has_open_pause: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) > 0),
            _ => Ok(false),
        }
    }

    pub async fn resolve_pauses(&self, workspace_id: Uuid) -> Result<u64, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let count = self
            .db
            .conn()
            .execute(
                "UPDATE write_pauses SET status = 'resolved', resolved_at = ?1
                 WHERE workspace_id = ?2 AND status = 'open'",
                params![now, workspace_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("resolve_pauses: {e}")))?;
        Ok(count)
    }

    // ── Review queue ────────────────────────────────────────────────

    /// Open a review item unless an open one for the same thread and
    /// reason already exists. Returns the new id when created.
    ///
    /// Dedup is enforced by the partial unique index on open items, not by
    /// a read-then-insert, so racing workers cannot double-open.
    pub async fn open_review_if_absent(
        &self,
        workspace_id: Uuid,
        thread_id: Option<Uuid>,
        reason: &str,
        data: Option<&Value>,
    ) -> Result<Option<Uuid>, DatabaseError> {
        let thread_text = thread_id.map(|t| t.to_string());
        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        let data_json = match data {
            Some(value) => Some(
                serde_json::to_string(value)
                    .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
            ),
            None => None,
        };
        let inserted = self
            .db
            .conn()
            .execute(
                "INSERT OR IGNORE INTO review_items (id, workspace_id, thread_id, reason,
                    status, data_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'open', ?5, ?6)",
                params![
                    id.to_string(),
                    workspace_id.to_string(),
                    opt_text(thread_text.as_deref()),
                    reason,
                    crate::store::db::opt_text_owned(data_json),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("open_review_if_absent: {e}")))?;
        if inserted == 0 {
            return Ok(None);
        }
        debug!(workspace_id = %workspace_id, reason, "Review item opened");
        Ok(Some(id))
    }

    pub async fn resolve_review(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        reason: &str,
    ) -> Result<u64, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let count = self
            .db
            .conn()
            .execute(
                "UPDATE review_items SET status = 'resolved', resolved_at = ?1
                 WHERE workspace_id = ?2 AND thread_id = ?3 AND reason = ?4 AND status = 'open'",
                params![
                    now,
                    workspace_id.to_string(),
                    thread_id.to_string(),
                    reason,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("resolve_review: {e}")))?;
        Ok(count)
    }

    pub async fn list_open_reviews(
        &self,
        workspace_id: Uuid,
    ) -> Result<Vec<ReviewItem>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT id, workspace_id, thread_id, reason, status, data_json, created_at
                 FROM review_items
                 WHERE workspace_id = ?1 AND status = 'open'
                 ORDER BY created_at",
                params![workspace_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_open_reviews: {e}")))?;

        let mut items = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id_str: String = row.get(0).unwrap_or_default();
            let ws_str: String = row.get(1).unwrap_or_default();
            let thread_str: Option<String> = row.get(2).ok();
            let reason: String = row.get(3).unwrap_or_default();
            let status: String = row.get(4).unwrap_or_default();
            let data_str: Option<String> = row.get(5).ok();
            let created_str: String = row.get(6).unwrap_or_default();
            let (Ok(id), Ok(workspace_id)) = (Uuid::parse_str(&id_str), Uuid::parse_str(&ws_str))
            else {
                warn!(id = id_str, "Skipping malformed review_items row");
                continue;
            };
            items.push(ReviewItem {
                id,
                workspace_id,
                thread_id: thread_str.and_then(|t| Uuid::parse_str(&t).ok()),
                reason,
                status,
                data_json: data_str.and_then(|d| serde_json::from_str(&d).ok()),
                created_at: parse_datetime(&created_str),
            });
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> GovernanceStore {
        GovernanceStore::new(Database::new_memory().await.unwrap())
    }

    #[tokio::test]
    async fn baseline_only_ratchets_up() {
        let store = store().await;
        let ws = Uuid::new_v4();
        store.ratchet_quality(ws, "domain:acme.com|sub:none|h:abc", 0.9).await.unwrap();
        store.ratchet_quality(ws, "domain:acme.com|sub:none|h:abc", 0.5).await.unwrap();
        let quality = store
            .last_good_quality(ws, "domain:acme.com|sub:none|h:abc")
            .await
            .unwrap();
        assert_eq!(quality, Some(0.9));

        store.ratchet_quality(ws, "domain:acme.com|sub:none|h:abc", 1.0).await.unwrap();
        let quality = store
            .last_good_quality(ws, "domain:acme.com|sub:none|h:abc")
            .await
            .unwrap();
        assert_eq!(quality, Some(1.0));
    }

    #[tokio::test]
    async fn unknown_source_has_no_baseline() {
        let store = store().await;
        assert!(store.last_good_quality(Uuid::new_v4(), "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pause_is_deduplicated_while_open() {
        let store = store().await;
        let ws = Uuid::new_v4();
        let first = store
            .open_pause_if_absent(ws, PauseScope::SourceKey, Some("src-1"), "drift")
            .await
            .unwrap();
        assert!(first.is_some());
        let second = store
            .open_pause_if_absent(ws, PauseScope::SourceKey, Some("src-1"), "drift")
            .await
            .unwrap();
        assert!(second.is_none());

        // Different scope value is a different pause
        let third = store
            .open_pause_if_absent(ws, PauseScope::SourceKey, Some("src-2"), "drift")
            .await
            .unwrap();
        assert!(third.is_some());

        assert!(store.has_open_pause(ws).await.unwrap());
        assert_eq!(store.resolve_pauses(ws).await.unwrap(), 2);
        assert!(!store.has_open_pause(ws).await.unwrap());
    }

    #[tokio::test]
    async fn review_items_unique_while_open() {
        let store = store().await;
        let ws = Uuid::new_v4();
        let thread = Uuid::new_v4();
        let first = store
            .open_review_if_absent(ws, Some(thread), "needs_deal_linking", Some(&json!({"n": 2})))
            .await
            .unwrap();
        assert!(first.is_some());
        let second = store
            .open_review_if_absent(ws, Some(thread), "needs_deal_linking", None)
            .await
            .unwrap();
        assert!(second.is_none());

        assert_eq!(store.resolve_review(ws, thread, "needs_deal_linking").await.unwrap(), 1);

        // Once resolved, a new item may open
        let third = store
            .open_review_if_absent(ws, Some(thread), "needs_deal_linking", None)
            .await
            .unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn open_review_duplicates_rejected_by_the_index() {
        let store = store().await;
        let ws = Uuid::new_v4().to_string();
        let thread = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        // A plain insert bypassing the helper still cannot double-open.
        let insert = "INSERT INTO review_items (id, workspace_id, thread_id, reason, status,
            created_at) VALUES (?1, ?2, ?3, 'needs_deal_linking', 'open', ?4)";
        store
            .db
            .conn()
            .execute(insert, params![Uuid::new_v4().to_string(), ws.clone(), thread.clone(), now.clone()])
            .await
            .unwrap();
        let duplicate = store
            .db
            .conn()
            .execute(insert, params![Uuid::new_v4().to_string(), ws, thread, now])
            .await;
        assert!(duplicate.is_err());
    }
}
