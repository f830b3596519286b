//! Access-token capability.
//!
//! Token exchange, refresh, and encryption-at-rest happen outside this
//! subsystem; the worker only asks for a usable access token. A failing
//! refresh doubles as the connection liveness probe in reconciliation.

use async_trait::async_trait;
use uuid::Uuid;

use crate::crm::CrmSystem;
use crate::error::CrmError;

/// Provides access tokens for a workspace's CRM connection.
#[async_trait]
pub trait TokenManager: Send + Sync {
    async fn get_access_token(
        &self,
        workspace_id: Uuid,
        crm: CrmSystem,
    ) -> Result<String, CrmError>;
}

/// Token manager that always returns a placeholder token.
///
/// Used in dry-run composition and tests where no real connection exists.
pub struct DryRunTokenManager;

#[async_trait]
impl TokenManager for DryRunTokenManager {
    async fn get_access_token(
        &self,
        _workspace_id: Uuid,
        crm: CrmSystem,
    ) -> Result<String, CrmError> {
        Ok(format!("dry-run-token-{crm}"))
    }
}

/// Token manager that fails every request with a fixed error message.
pub struct FailingTokenManager {
    pub message: String,
}

#[async_trait]
impl TokenManager for FailingTokenManager {
    async fn get_access_token(
        &self,
        workspace_id: Uuid,
        crm: CrmSystem,
    ) -> Result<String, CrmError> {
        Err(CrmError::RequestFailed {
            crm: crm.as_str().to_string(),
            reason: format!("{} (workspace {workspace_id})", self.message),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dry_run_manager_always_succeeds() {
        let manager = DryRunTokenManager;
        let token = manager
            .get_access_token(Uuid::new_v4(), CrmSystem::Hubspot)
            .await
            .unwrap();
        assert!(token.contains("hubspot"));
    }

    #[tokio::test]
    async fn failing_manager_surfaces_message() {
        let manager = FailingTokenManager {
            message: "refresh rejected (401)".into(),
        };
        let err = manager
            .get_access_token(Uuid::new_v4(), CrmSystem::Salesforce)
            .await
            .unwrap_err();
        assert!(err.is_auth_failure());
    }
}
