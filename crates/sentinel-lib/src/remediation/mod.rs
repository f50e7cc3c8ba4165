//! Remediation of quota-exceeding servers
//!
//! This module covers:
//! - Executing the configured remediation action (engine)
//! - Post-recreation reconciliation of DNS, mappings, and threshold state
//! - Deletion confirmation by polling the provider

mod engine;
mod reconcile;
mod wait;

pub use engine::{RemediationEngine, RemediationPolicy};
pub use reconcile::ReconciliationService;
pub use wait::{wait_until_deleted, WaitConfig};
