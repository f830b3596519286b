//! Error types for the worker.

use uuid::Uuid;

/// Top-level error type for the worker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("CRM error: {0}")]
    Crm(#[from] CrmError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Schema initialization failed: {0}")]
    Schema(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Job queue and processor errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("no processor registered for job type {job_type}")]
    MissingProcessor { job_type: String },

    #[error("missing {field} payload")]
    MissingPayload { field: String },

    #[error("invalid payload for job {id}: {reason}")]
    InvalidPayload { id: Uuid, reason: String },

    #[error("job {id} failed: {reason}")]
    Failed { id: Uuid, reason: String },
}

/// CRM connector errors.
#[derive(Debug, thiserror::Error)]
pub enum CrmError {
    #[error("Authentication failed for {crm} (workspace {workspace_id}): {detail}")]
    AuthFailed {
        crm: String,
        workspace_id: Uuid,
        detail: String,
    },

    #[error("{crm} request failed: {reason}")]
    RequestFailed { crm: String, reason: String },

    #[error("No {crm} connection for workspace {workspace_id}")]
    NotConnected { crm: String, workspace_id: Uuid },
}

/// LLM client errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM request failed: {reason}")]
    RequestFailed { reason: String },

    #[error("LLM credential missing")]
    MissingCredential,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CrmError {
    /// Whether this error indicates a rejected credential (401/403 pattern).
    pub fn is_auth_failure(&self) -> bool {
        match self {
            CrmError::AuthFailed { .. } => true,
            CrmError::RequestFailed { reason, .. } => looks_like_auth_failure(reason),
            CrmError::NotConnected { .. } => false,
        }
    }
}

/// Classify an error message as an authentication rejection.
///
/// CRM clients surface HTTP status codes in their error text; 401/403
/// means the token is bad and blind retry will not help.
pub fn looks_like_auth_failure(message: &str) -> bool {
    message.contains("401") || message.contains("403")
}

/// Result type alias for the worker.
pub type Result<T> = std::result::Result<T, Error>;
