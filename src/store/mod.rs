//! Persistence layer.
//!
//! A single libSQL connection shared by per-domain store structs. All
//! timestamps are stored as RFC 3339 text; JSON columns hold serialized
//! `serde_json::Value`s. Unique constraints plus `ON CONFLICT` clauses are
//! the concurrency guard for read-then-upsert patterns.

pub mod audit;
pub mod crm_writes;
pub mod db;
pub mod deals;
pub mod governance;
pub mod jobs;
pub mod rollups;
pub mod schema;
pub mod threads;
pub mod workspaces;

pub use db::Database;
