//! Governance: confidence policy, drift detection, deal readiness,
//! and retention policy.

pub mod drift;
pub mod policy;
pub mod readiness;
pub mod retention;
