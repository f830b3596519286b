//! Deal-candidate lookup for thread association.
//!
//! Matching a thread to deals requires querying the CRM's search API, which
//! this subsystem does not own. The association job receives candidates
//! through this trait; production wires a connector-backed provider, tests
//! and dry runs use the fakes below.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::CrmError;

/// Link reason used when a provider does not say how it matched.
pub const DEFAULT_MATCH_REASON: &str = "participant_email_match";

/// A CRM deal that might correspond to an inbound thread.
#[derive(Debug, Clone, PartialEq)]
pub struct DealCandidate {
    pub deal_id: String,
    pub title: String,
    pub match_confidence: f64,
    /// How the provider matched this deal, e.g. "participant_email_match".
    pub why: Option<String>,
}

impl DealCandidate {
    pub fn match_reason(&self) -> &str {
        self.why.as_deref().unwrap_or(DEFAULT_MATCH_REASON)
    }
}

/// Supplies candidate deals for a thread's participants and sender domain.
#[async_trait]
pub trait DealCandidateProvider: Send + Sync {
    async fn candidates_for_thread(
        &self,
        workspace_id: Uuid,
        thread_id: Uuid,
        participant_emails: &[String],
        sender_domain: &str,
    ) -> Result<Vec<DealCandidate>, CrmError>;
}

/// Provider that never finds any candidates.
pub struct EmptyCandidateProvider;

#[async_trait]
impl DealCandidateProvider for EmptyCandidateProvider {
    async fn candidates_for_thread(
        &self,
        _workspace_id: Uuid,
        _thread_id: Uuid,
        _participant_emails: &[String],
        _sender_domain: &str,
    ) -> Result<Vec<DealCandidate>, CrmError> {
        Ok(Vec::new())
    }
}

/// Provider that returns a fixed candidate list regardless of input.
pub struct FixedCandidateProvider {
    pub candidates: Vec<DealCandidate>,
}

impl FixedCandidateProvider {
    pub fn single(deal_id: &str, title: &str) -> Self {
        Self {
            candidates: vec![DealCandidate {
                deal_id: deal_id.to_string(),
                title: title.to_string(),
                match_confidence: 0.95,
                why: None,
            }],
        }
    }
}

#[async_trait]
impl DealCandidateProvider for FixedCandidateProvider {
    async fn candidates_for_thread(
        &self,
        _workspace_id: Uuid,
        _thread_id: Uuid,
        _participant_emails: &[String],
        _sender_domain: &str,
    ) -> Result<Vec<DealCandidate>, CrmError> {
        Ok(self.candidates.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_provider_returns_nothing() {
        let provider = EmptyCandidateProvider;
        let found = provider
            .candidates_for_thread(
                Uuid::new_v4(),
                Uuid::new_v4(),
                &["ada@acme.com".to_string()],
                "acme.com",
            )
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn fixed_provider_returns_configured_candidates() {
        let provider = FixedCandidateProvider::single("deal-1", "Acme expansion");
        let found = provider
            .candidates_for_thread(Uuid::new_v4(), Uuid::new_v4(), &[], "acme.com")
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].deal_id, "deal-1");
        assert_eq!(found[0].match_reason(), DEFAULT_MATCH_REASON);
    }
}
