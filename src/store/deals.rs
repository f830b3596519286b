//! Deals, thread links, BANT facts, readiness aggregates, and the
//! association candidate sets raised when a thread matches several deals.

use chrono::Utc;
use libsql::params;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::crm::CrmSystem;
use crate::crm::candidates::DealCandidate;
use crate::error::DatabaseError;
use crate::governance::readiness::{BantKey, BantReadiness, DealFact};
use crate::store::db::Database;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Linked,
    Unlinked,
}

impl LinkStatus {
    fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Linked => "linked",
            LinkStatus::Unlinked => "unlinked",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "linked" => LinkStatus::Linked,
            _ => LinkStatus::Unlinked,
        }
    }
}

/// A deal as mirrored from its CRM.
#[derive(Debug, Clone)]
pub struct DealRecord {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub crm: CrmSystem,
    pub crm_deal_id: String,
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct ThreadLink {
    pub workspace_id: Uuid,
    pub thread_id: Uuid,
    pub deal_id: Option<Uuid>,
    pub match_score: Option<f64>,
    pub match_reason: Option<String>,
    pub status: LinkStatus,
}

#[derive(Clone)]
pub struct DealStore {
    db: Database,
}

impl DealStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // ── Deals ───────────────────────────────────────────────────────

    /// Upsert by (workspace, crm, crm_deal_id) and return the local id.
    pub async fn upsert_deal(
        &self,
        workspace_id: Uuid,
        crm: CrmSystem,
        crm_deal_id: &str,
        title: &str,
    ) -> Result<Uuid, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.db
            .conn()
            .execute(
                "INSERT INTO deals (id, workspace_id, crm_system, crm_deal_id, title, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (workspace_id, crm_system, crm_deal_id)
                 DO UPDATE SET title = excluded.title",
                params![
                    Uuid::new_v4().to_string(),
                    workspace_id.to_string(),
                    crm.as_str(),
                    crm_deal_id,
                    title,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_deal: {e}")))?;

        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT id FROM deals
                 WHERE workspace_id = ?1 AND crm_system = ?2 AND crm_deal_id = ?3",
                params![workspace_id.to_string(), crm.as_str(), crm_deal_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_deal select: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let id_str: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("upsert_deal id: {e}")))?;
                Uuid::parse_str(&id_str)
                    .map_err(|e| DatabaseError::Query(format!("upsert_deal id parse: {e}")))
            }
            _ => Err(DatabaseError::NotFound {
                entity: "deal".into(),
                id: crm_deal_id.into(),
            }),
        }
    }

    pub async fn get_deal(&self, deal_id: Uuid) -> Result<Option<DealRecord>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT workspace_id, crm_system, crm_deal_id, title FROM deals WHERE id = ?1",
                params![deal_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_deal: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let ws_str: String = row.get(0).unwrap_or_default();
                let crm_str: String = row.get(1).unwrap_or_default();
                let crm_deal_id: String = row.get(2).unwrap_or_default();
                let title: String = row.get(3).unwrap_or_default();
                let crm = CrmSystem::parse(&crm_str).ok_or_else(|| {
                    DatabaseError::Query(format!("deal row has unknown crm {crm_str}"))
                })?;
                Ok(Some(DealRecord {
                    id: deal_id,
                    workspace_id: Uuid::parse_str(&ws_str)
                        .map_err(|e| DatabaseError::Query(format!("deal ws parse: {e}")))?,
                    crm,
                    crm_deal_id,
                    title,
                }))
            }
            _ => Ok(None),
        }
    }

    pub async fn deal_title(&self, deal_id: Uuid) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT title FROM deals WHERE id = ?1",
                params![deal_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("deal_title: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get(0).ok()),
            _ => Ok(None),
        }
    }

    /// Deal ids with at least one linked thread in the workspace.
    pub async fn deals_with_linked_threads(
        &self,
        workspace_id: Uuid,
    ) -> Result<Vec<Uuid>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT DISTINCT deal_id FROM thread_links
                 WHERE workspace_id = ?1 AND status = 'linked' AND deal_id IS NOT NULL
                 ORDER BY deal_id",
                params![workspace_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("deals_with_linked_threads: {e}")))?;

        let mut deals = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id_str: String = row.get(0).unwrap_or_default();
            if let Ok(id) = Uuid::parse_str(&id_str) {
                deals.push(id);
            }
        }
        Ok(deals)
    }

    // ── Thread links ────────────────────────────────────────────────

    pub async fn link_thread(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        deal_id: Uuid,
        match_score: f64,
        match_reason: &str,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.db
            .conn()
            .execute(
                "INSERT INTO thread_links (id, workspace_id, thread_id, deal_id, match_score,
                    match_reason, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'linked', ?7)
                 ON CONFLICT (workspace_id, thread_id)
                 DO UPDATE SET deal_id = excluded.deal_id, match_score = excluded.match_score,
                    match_reason = excluded.match_reason, status = 'linked',
                    updated_at = excluded.updated_at",
                params![
                    Uuid::new_v4().to_string(),
                    workspace_id.to_string(),
                    thread_id.to_string(),
                    deal_id.to_string(),
                    match_score,
                    match_reason,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("link_thread: {e}")))?;
        debug!(thread_id = %thread_id, deal_id = %deal_id, "Thread linked to deal");
        Ok(())
    }

    pub async fn mark_thread_unlinked(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.db
            .conn()
            .execute(
                "INSERT INTO thread_links (id, workspace_id, thread_id, status, updated_at)
                 VALUES (?1, ?2, ?3, 'unlinked', ?4)
                 ON CONFLICT (workspace_id, thread_id)
                 DO UPDATE SET deal_id = NULL, match_score = NULL, match_reason = NULL,
                    status = 'unlinked', updated_at = excluded.updated_at",
                params![
                    Uuid::new_v4().to_string(),
                    workspace_id.to_string(),
                    thread_id.to_string(),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_thread_unlinked: {e}")))?;
        Ok(())
    }

    pub async fn get_thread_link(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
    ) -> Result<Option<ThreadLink>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT deal_id, match_score, match_reason, status FROM thread_links
                 WHERE workspace_id = ?1 AND thread_id = ?2",
                params![workspace_id.to_string(), thread_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_thread_link: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let deal_str: Option<String> = row.get(0).ok();
                let match_score: Option<f64> = row.get(1).ok();
                let match_reason: Option<String> = row.get(2).ok();
                let status_str: String = row.get(3).unwrap_or_default();
                Ok(Some(ThreadLink {
                    workspace_id,
                    thread_id,
                    deal_id: deal_str.and_then(|d| Uuid::parse_str(&d).ok()),
                    match_score,
                    match_reason,
                    status: LinkStatus::parse(&status_str),
                }))
            }
            _ => Ok(None),
        }
    }

    // ── Facts & readiness ───────────────────────────────────────────

    pub async fn upsert_fact(
        &self,
        workspace_id: Uuid,
        deal_id: Uuid,
        fact: &DealFact,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let value_json = serde_json::to_string(&fact.value_json)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let evidence_json = serde_json::to_string(&fact.evidence_json)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.db
            .conn()
            .execute(
                "INSERT INTO deal_facts (id, workspace_id, deal_id, fact_key, value_json,
                    confidence, evidence_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (workspace_id, deal_id, fact_key)
                 DO UPDATE SET value_json = excluded.value_json,
                    confidence = excluded.confidence,
                    evidence_json = excluded.evidence_json,
                    updated_at = excluded.updated_at",
                params![
                    Uuid::new_v4().to_string(),
                    workspace_id.to_string(),
                    deal_id.to_string(),
                    fact.key.as_str(),
                    value_json,
                    fact.confidence,
                    evidence_json,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_fact: {e}")))?;
        Ok(())
    }

    pub async fn list_facts(
        &self,
        workspace_id: Uuid,
        deal_id: Uuid,
    ) -> Result<Vec<DealFact>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT fact_key, value_json, confidence, evidence_json FROM deal_facts
                 WHERE workspace_id = ?1 AND deal_id = ?2 ORDER BY fact_key",
                params![workspace_id.to_string(), deal_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_facts: {e}")))?;

        let mut facts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let key_str: String = row.get(0).unwrap_or_default();
            let value_json: String = row.get(1).unwrap_or_else(|_| "null".to_string());
            let confidence: f64 = row.get(2).unwrap_or(0.0);
            let evidence_json: String = row.get(3).unwrap_or_else(|_| "null".to_string());
            let Some(key) = BantKey::parse(&key_str) else {
                warn!(key = key_str, "Skipping deal_facts row with unknown key");
                continue;
            };
            facts.push(DealFact {
                key,
                value_json: serde_json::from_str(&value_json).unwrap_or(Value::Null),
                confidence,
                evidence_json: serde_json::from_str(&evidence_json).unwrap_or(Value::Null),
            });
        }
        Ok(facts)
    }

    pub async fn upsert_readiness(
        &self,
        workspace_id: Uuid,
        deal_id: Uuid,
        framework: &str,
        readiness: &BantReadiness,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let missing: Vec<&str> = readiness.missing_keys.iter().map(|k| k.as_str()).collect();
        let missing_json = serde_json::to_string(&missing)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.db
            .conn()
            .execute(
                "INSERT INTO deal_readiness (id, workspace_id, deal_id, framework,
                    readiness_score, missing_keys_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (workspace_id, deal_id, framework)
                 DO UPDATE SET readiness_score = excluded.readiness_score,
                    missing_keys_json = excluded.missing_keys_json,
                    updated_at = excluded.updated_at",
                params![
                    Uuid::new_v4().to_string(),
                    workspace_id.to_string(),
                    deal_id.to_string(),
                    framework,
                    readiness.readiness_score,
                    missing_json,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_readiness: {e}")))?;
        Ok(())
    }

    pub async fn get_readiness(
        &self,
        workspace_id: Uuid,
        deal_id: Uuid,
        framework: &str,
    ) -> Result<Option<BantReadiness>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT readiness_score, missing_keys_json FROM deal_readiness
                 WHERE workspace_id = ?1 AND deal_id = ?2 AND framework = ?3",
                params![workspace_id.to_string(), deal_id.to_string(), framework],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_readiness: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let score: f64 = row.get(0).unwrap_or(0.0);
                let missing_json: String = row.get(1).unwrap_or_else(|_| "[]".to_string());
                let missing_strs: Vec<String> =
                    serde_json::from_str(&missing_json).unwrap_or_default();
                Ok(Some(BantReadiness {
                    missing_keys: missing_strs.iter().filter_map(|s| BantKey::parse(s)).collect(),
                    readiness_score: score,
                }))
            }
            _ => Ok(None),
        }
    }

    // ── Association candidates ──────────────────────────────────────

    /// Persist the ambiguous candidate set, unless an open set for the
    /// thread already exists.
    /// The partial unique index on open candidate sets makes this safe
    /// under racing workers.
    pub async fn open_candidates_if_absent(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        candidates: &[DealCandidate],
    ) -> Result<Option<Uuid>, DatabaseError> {
        let entries: Vec<Value> = candidates
            .iter()
            .map(|c| {
                serde_json::json!({
                    "deal_id": c.deal_id,
                    "title": c.title,
                    "match_confidence": c.match_confidence,
                    "why": c.why,
                })
            })
            .collect();
        let candidates_json = serde_json::to_string(&entries)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        let inserted = self
            .db
            .conn()
            .execute(
                "INSERT OR IGNORE INTO association_candidates (id, workspace_id, thread_id,
                    candidates_json, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'open', ?5)",
                params![
                    id.to_string(),
                    workspace_id.to_string(),
                    thread_id.to_string(),
                    candidates_json,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("open_candidates_if_absent: {e}")))?;
        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(id))
    }

    pub async fn resolve_candidates(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
    ) -> Result<u64, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let count = self
            .db
            .conn()
            .execute(
                "UPDATE association_candidates SET status = 'resolved', resolved_at = ?1
                 WHERE workspace_id = ?2 AND thread_id = ?3 AND status = 'open'",
                params![now, workspace_id.to_string(), thread_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("resolve_candidates: {e}")))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> DealStore {
        DealStore::new(Database::new_memory().await.unwrap())
    }

    #[tokio::test]
    async fn deal_upsert_is_stable() {
        let store = store().await;
        let ws = Uuid::new_v4();
        let first = store
            .upsert_deal(ws, CrmSystem::Hubspot, "hs-1", "Acme expansion")
            .await
            .unwrap();
        let second = store
            .upsert_deal(ws, CrmSystem::Hubspot, "hs-1", "Acme expansion (renamed)")
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(
            store.deal_title(first).await.unwrap().as_deref(),
            Some("Acme expansion (renamed)")
        );
    }

    #[tokio::test]
    async fn thread_link_upsert_replaces() {
        let store = store().await;
        let ws = Uuid::new_v4();
        let thread = Uuid::new_v4();
        let deal_a = store.upsert_deal(ws, CrmSystem::Hubspot, "a", "A").await.unwrap();
        let deal_b = store.upsert_deal(ws, CrmSystem::Hubspot, "b", "B").await.unwrap();

        store.mark_thread_unlinked(ws, thread).await.unwrap();
        let link = store.get_thread_link(ws, thread).await.unwrap().unwrap();
        assert_eq!(link.status, LinkStatus::Unlinked);

        store.link_thread(ws, thread, deal_a, 0.9, "domain match").await.unwrap();
        store.link_thread(ws, thread, deal_b, 0.95, "manual").await.unwrap();
        let link = store.get_thread_link(ws, thread).await.unwrap().unwrap();
        assert_eq!(link.status, LinkStatus::Linked);
        assert_eq!(link.deal_id, Some(deal_b));
        assert_eq!(link.match_reason.as_deref(), Some("manual"));
    }

    #[tokio::test]
    async fn facts_and_readiness_round_trip() {
        let store = store().await;
        let ws = Uuid::new_v4();
        let deal = store.upsert_deal(ws, CrmSystem::Hubspot, "a", "A").await.unwrap();

        let fact = DealFact {
            key: BantKey::Timeline,
            value_json: json!("Q3"),
            confidence: 0.7,
            evidence_json: json!({ "source": "thread" }),
        };
        store.upsert_fact(ws, deal, &fact).await.unwrap();
        store.upsert_fact(ws, deal, &fact).await.unwrap();

        let facts = store.list_facts(ws, deal).await.unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].key, BantKey::Timeline);

        let readiness = crate::governance::readiness::compute_bant_readiness(&facts);
        store.upsert_readiness(ws, deal, "bant", &readiness).await.unwrap();
        let loaded = store.get_readiness(ws, deal, "bant").await.unwrap().unwrap();
        assert_eq!(loaded, readiness);
    }

    #[tokio::test]
    async fn candidate_set_unique_while_open() {
        let store = store().await;
        let ws = Uuid::new_v4();
        let thread = Uuid::new_v4();
        let candidates = vec![
            DealCandidate { deal_id: "a".into(), title: "A".into(), match_confidence: 0.8, why: None },
            DealCandidate { deal_id: "b".into(), title: "B".into(), match_confidence: 0.7, why: None },
        ];
        assert!(store
            .open_candidates_if_absent(ws, thread, &candidates)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .open_candidates_if_absent(ws, thread, &candidates)
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.resolve_candidates(ws, thread).await.unwrap(), 1);
    }
}
