//! Conduit worker — inbound-email-to-CRM background processing.
//!
//! A durable job queue feeds processors that extract structured fields
//! from email threads, gate them through confidence and drift policies,
//! associate them with CRM deals, and execute idempotent CRM writes.
//! Weekly rollups summarize each deal, deterministically or with an LLM
//! overlay, and reconciliation keeps connections and failed writes honest.

pub mod config;
pub mod crm;
pub mod error;
pub mod extraction;
pub mod governance;
pub mod idempotency;
pub mod jobs;
pub mod llm;
pub mod store;
