//! Threads, messages, attachments, and extracted field values.

use chrono::{DateTime, Utc};
use libsql::params;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::extraction::ExtractedField;
use crate::store::db::{Database, opt_text, parse_datetime};

#[derive(Debug, Clone)]
pub struct Thread {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub subject: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub workspace_id: Uuid,
    pub from_email: Option<String>,
    pub to_emails: Vec<String>,
    pub subject: Option<String>,
    pub body_text: Option<String>,
    pub redacted: bool,
    pub received_at: DateTime<Utc>,
}

const MESSAGE_COLUMNS: &str = "id, thread_id, workspace_id, from_email, to_emails_json, \
     subject, body_text, redacted, received_at";

fn row_to_message(row: &libsql::Row) -> Result<Message, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("message row id: {e}")))?;
    let thread_str: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("message row thread_id: {e}")))?;
    let ws_str: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("message row workspace_id: {e}")))?;
    let from_email: Option<String> = row.get(3).ok();
    let to_json: String = row.get(4).unwrap_or_else(|_| "[]".to_string());
    let subject: Option<String> = row.get(5).ok();
    let body_text: Option<String> = row.get(6).ok();
    let redacted: i64 = row.get(7).unwrap_or(0);
    let received_str: String = row.get(8).unwrap_or_default();

    Ok(Message {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Query(format!("message row id parse: {e}")))?,
        thread_id: Uuid::parse_str(&thread_str)
            .map_err(|e| DatabaseError::Query(format!("message row thread parse: {e}")))?,
        workspace_id: Uuid::parse_str(&ws_str)
            .map_err(|e| DatabaseError::Query(format!("message row workspace parse: {e}")))?,
        from_email,
        to_emails: serde_json::from_str(&to_json).unwrap_or_default(),
        subject,
        body_text,
        redacted: redacted != 0,
        received_at: parse_datetime(&received_str),
    })
}

#[derive(Clone)]
pub struct ThreadStore {
    db: Database,
}

impl ThreadStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create_thread(
        &self,
        workspace_id: Uuid,
        subject: Option<&str>,
    ) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        self.db
            .conn()
            .execute(
                "INSERT INTO threads (id, workspace_id, subject, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id.to_string(), workspace_id.to_string(), opt_text(subject), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_thread: {e}")))?;
        debug!(thread_id = %id, "Thread created");
        Ok(id)
    }

    pub async fn get_thread(&self, thread_id: Uuid) -> Result<Option<Thread>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT id, workspace_id, subject, created_at FROM threads WHERE id = ?1",
                params![thread_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_thread: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let id_str: String = row.get(0).unwrap_or_default();
                let ws_str: String = row.get(1).unwrap_or_default();
                let subject: Option<String> = row.get(2).ok();
                let created_str: String = row.get(3).unwrap_or_default();
                Ok(Some(Thread {
                    id: Uuid::parse_str(&id_str)
                        .map_err(|e| DatabaseError::Query(format!("thread id parse: {e}")))?,
                    workspace_id: Uuid::parse_str(&ws_str)
                        .map_err(|e| DatabaseError::Query(format!("thread ws parse: {e}")))?,
                    subject,
                    created_at: parse_datetime(&created_str),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_thread: {e}"))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn add_message(
        &self,
        thread_id: Uuid,
        workspace_id: Uuid,
        from_email: Option<&str>,
        to_emails: &[String],
        subject: Option<&str>,
        body_text: Option<&str>,
        received_at: DateTime<Utc>,
    ) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        let to_json = serde_json::to_string(to_emails)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.db
            .conn()
            .execute(
                "INSERT INTO messages (id, thread_id, workspace_id, from_email, to_emails_json,
                    subject, body_text, redacted, received_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9)",
                params![
                    id.to_string(),
                    thread_id.to_string(),
                    workspace_id.to_string(),
                    opt_text(from_email),
                    to_json,
                    opt_text(subject),
                    opt_text(body_text),
                    received_at.to_rfc3339(),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_message: {e}")))?;
        Ok(id)
    }

    pub async fn list_messages(&self, thread_id: Uuid) -> Result<Vec<Message>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE thread_id = ?1 ORDER BY received_at"
                ),
                params![thread_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            messages.push(row_to_message(&row)?);
        }
        Ok(messages)
    }

    /// Messages received in the window, for threads linked to the given deal.
    pub async fn messages_for_deal_window(
        &self,
        workspace_id: Uuid,
        deal_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Message>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                &format!(
                    "SELECT m.id, m.thread_id, m.workspace_id, m.from_email, m.to_emails_json,
                            m.subject, m.body_text, m.redacted, m.received_at
                     FROM messages m
                     JOIN thread_links tl
                       ON tl.thread_id = m.thread_id AND tl.workspace_id = m.workspace_id
                     WHERE m.workspace_id = ?1 AND tl.deal_id = ?2 AND tl.status = 'linked'
                       AND m.received_at >= ?3 AND m.received_at < ?4
                     ORDER BY m.received_at"
                ),
                params![
                    workspace_id.to_string(),
                    deal_id.to_string(),
                    start.to_rfc3339(),
                    end.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("messages_for_deal_window: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            messages.push(row_to_message(&row)?);
        }
        Ok(messages)
    }

    pub async fn add_attachment(
        &self,
        message_id: Uuid,
        workspace_id: Uuid,
        filename: &str,
        storage_pointer: Option<&str>,
    ) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        self.db
            .conn()
            .execute(
                "INSERT INTO attachments (id, message_id, workspace_id, filename,
                    storage_pointer, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.to_string(),
                    message_id.to_string(),
                    workspace_id.to_string(),
                    filename,
                    opt_text(storage_pointer),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_attachment: {e}")))?;
        Ok(id)
    }

    // ── Retention ───────────────────────────────────────────────────

    /// Blank out message bodies received before the cutoff.
    pub async fn redact_messages_before(
        &self,
        workspace_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let count = self
            .db
            .conn()
            .execute(
                "UPDATE messages SET body_text = NULL, redacted = 1
                 WHERE workspace_id = ?1 AND redacted = 0 AND received_at < ?2",
                params![workspace_id.to_string(), cutoff.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("redact_messages_before: {e}")))?;
        if count > 0 {
            info!(workspace_id = %workspace_id, count, "Message bodies redacted");
        }
        Ok(count)
    }

    /// Drop storage pointers for attachments created before the cutoff.
    pub async fn clear_attachments_before(
        &self,
        workspace_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let count = self
            .db
            .conn()
            .execute(
                "UPDATE attachments SET storage_pointer = NULL
                 WHERE workspace_id = ?1 AND storage_pointer IS NOT NULL AND created_at < ?2",
                params![workspace_id.to_string(), cutoff.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_attachments_before: {e}")))?;
        if count > 0 {
            info!(workspace_id = %workspace_id, count, "Attachment pointers cleared");
        }
        Ok(count)
    }

    // ── Extracted fields ────────────────────────────────────────────

    pub async fn insert_fields(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        fields: &[ExtractedField],
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        for field in fields {
            let value_json = serde_json::to_string(&field.field_value_json)
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
            let evidence_json = serde_json::to_string(&field.evidence_json)
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
            self.db
                .conn()
                .execute(
                    "INSERT INTO field_values (id, workspace_id, thread_id, field_key,
                        field_value_json, confidence, evidence_json, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        Uuid::new_v4().to_string(),
                        workspace_id.to_string(),
                        thread_id.to_string(),
                        field.field_key.as_str(),
                        value_json,
                        field.confidence,
                        evidence_json,
                        now.clone(),
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("insert_fields: {e}")))?;
        }
        Ok(())
    }

    pub async fn fields_for_thread(
        &self,
        thread_id: Uuid,
    ) -> Result<Vec<ExtractedField>, DatabaseError> {
        let mut rows = self
            .db
            .conn()
            .query(
                "SELECT field_key, field_value_json, confidence, evidence_json
                 FROM field_values WHERE thread_id = ?1 ORDER BY created_at",
                params![thread_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fields_for_thread: {e}")))?;

        let mut fields = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let key_str: String = row.get(0).unwrap_or_default();
            let value_json: String = row.get(1).unwrap_or_else(|_| "null".to_string());
            let confidence: f64 = row.get(2).unwrap_or(0.0);
            let evidence_json: String = row.get(3).unwrap_or_else(|_| "null".to_string());
            let Some(field_key) = crate::extraction::FieldKey::parse(&key_str) else {
                continue;
            };
            fields.push(ExtractedField {
                field_key,
                field_value_json: serde_json::from_str(&value_json).unwrap_or(json!(null)),
                confidence,
                evidence_json: serde_json::from_str(&evidence_json).unwrap_or(json!(null)),
            });
        }
        Ok(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn store() -> ThreadStore {
        ThreadStore::new(Database::new_memory().await.unwrap())
    }

    #[tokio::test]
    async fn thread_and_messages_round_trip() {
        let store = store().await;
        let ws = Uuid::new_v4();
        let thread = store.create_thread(ws, Some("Pricing question")).await.unwrap();
        store
            .add_message(
                thread,
                ws,
                Some("ana@acme.com"),
                &["sales@vendor.com".to_string()],
                Some("Pricing question"),
                Some("Hi, what does the pro tier cost?"),
                Utc::now(),
            )
            .await
            .unwrap();

        let messages = store.list_messages(thread).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].from_email.as_deref(), Some("ana@acme.com"));
        assert_eq!(messages[0].to_emails, vec!["sales@vendor.com"]);
        assert!(!messages[0].redacted);
    }

    #[tokio::test]
    async fn retention_redacts_only_old_messages() {
        let store = store().await;
        let ws = Uuid::new_v4();
        let thread = store.create_thread(ws, None).await.unwrap();
        let old = Utc::now() - Duration::days(60);
        store
            .add_message(thread, ws, None, &[], None, Some("old body"), old)
            .await
            .unwrap();
        store
            .add_message(thread, ws, None, &[], None, Some("new body"), Utc::now())
            .await
            .unwrap();

        let cutoff = Utc::now() - Duration::days(30);
        let count = store.redact_messages_before(ws, cutoff).await.unwrap();
        assert_eq!(count, 1);

        let messages = store.list_messages(thread).await.unwrap();
        assert!(messages[0].redacted);
        assert!(messages[0].body_text.is_none());
        assert!(!messages[1].redacted);
        assert_eq!(messages[1].body_text.as_deref(), Some("new body"));

        // Second sweep touches nothing
        assert_eq!(store.redact_messages_before(ws, cutoff).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fields_round_trip() {
        let store = store().await;
        let ws = Uuid::new_v4();
        let thread = store.create_thread(ws, None).await.unwrap();
        let fields = vec![ExtractedField {
            field_key: crate::extraction::FieldKey::Email,
            field_value_json: json!("ana@acme.com"),
            confidence: 0.99,
            evidence_json: json!({ "line": "Email: ana@acme.com" }),
        }];
        store.insert_fields(ws, thread, &fields).await.unwrap();

        let loaded = store.fields_for_thread(thread).await.unwrap();
        assert_eq!(loaded, fields);
    }
}
