//! CRM capability traits and supporting types.
//!
//! The actual HTTP connectors (rate limiting, OAuth refresh, retries) live
//! outside this subsystem; here they appear as injected capabilities with
//! dry-run defaults so every pipeline can run end to end without touching
//! an external system.

pub mod candidates;
pub mod client;
pub mod retry;
pub mod tokens;

use serde::{Deserialize, Serialize};

/// Supported CRM systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrmSystem {
    Hubspot,
    Salesforce,
}

pub const ALL_CRM_SYSTEMS: [CrmSystem; 2] = [CrmSystem::Hubspot, CrmSystem::Salesforce];

impl CrmSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrmSystem::Hubspot => "hubspot",
            CrmSystem::Salesforce => "salesforce",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hubspot" => Some(CrmSystem::Hubspot),
            "salesforce" => Some(CrmSystem::Salesforce),
            _ => None,
        }
    }
}

impl std::fmt::Display for CrmSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
