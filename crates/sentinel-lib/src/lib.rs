//! Core library for the traffic sentinel
//!
//! This crate provides the decision/action engine that turns usage
//! observations into remediation outcomes:
//! - Traffic usage collection and threshold-crossing detection
//! - Remediation of quota-exceeding servers (notify/shutdown/rebuild/
//!   destroy-and-recreate with ordered fallbacks)
//! - Post-recreation reconciliation of DNS, mappings, and threshold state
//! - Outbound notifications, health checks, and observability

pub mod config;
pub mod dns;
pub mod error;
pub mod health;
pub mod mappings;
pub mod models;
pub mod monitor;
pub mod notify;
pub mod observability;
pub mod provider;
pub mod remediation;
pub mod store;
pub mod threshold;
pub mod traffic;

pub use error::{ProviderError, RemediationError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{SentinelMetrics, StructuredLogger};
