//! Workspace retention policy.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Per-workspace retention settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub raw_email_retention_days: i64,
    pub attachment_retention_days: i64,
    pub purge_enabled: bool,
    pub keep_extracted_fields: bool,
    pub keep_audit_events: bool,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            raw_email_retention_days: 30,
            attachment_retention_days: 30,
            purge_enabled: true,
            keep_extracted_fields: true,
            keep_audit_events: true,
        }
    }
}

impl RetentionPolicy {
    /// Clamp retention windows to at least one day.
    pub fn normalized(mut self) -> Self {
        self.raw_email_retention_days = self.raw_email_retention_days.max(1);
        self.attachment_retention_days = self.attachment_retention_days.max(1);
        self
    }

    pub fn message_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.raw_email_retention_days)
    }

    pub fn attachment_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.attachment_retention_days)
    }
}

/// Whether a message body is past its retention window.
pub fn should_redact_message(
    received_at: DateTime<Utc>,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> bool {
    received_at < policy.message_cutoff(now)
}

/// Whether an attachment pointer is past its retention window.
pub fn should_remove_attachment(
    created_at: DateTime<Utc>,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> bool {
    created_at < policy.attachment_cutoff(now)
}
