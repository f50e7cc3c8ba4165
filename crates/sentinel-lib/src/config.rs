//! Monitoring and remediation policy configuration
//!
//! Serde types for the policy surface: traffic limit, warning thresholds,
//! exceed action, whitelist, server template, snapshot overrides, fallback
//! profiles, and DNS settings. Loading from env/file is the binary's job;
//! these types only define shape, defaults, and validation.

use crate::dns::DnsRetryPolicy;
use crate::error::RemediationError;
use crate::models::{
    CloudServer, FallbackProfile, RemediationAction, ResourceId, ServerTemplate, SnapshotId,
};
use crate::remediation::{RemediationPolicy, WaitConfig};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Traffic quota and scan cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct TrafficConfig {
    /// Quota per server in GiB.
    pub limit_gib: f64,

    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Warning levels in percent of the limit. Order does not matter.
    #[serde(default = "default_thresholds")]
    pub warning_thresholds: Vec<u32>,

    #[serde(default = "default_action")]
    pub exceed_action: RemediationAction,

    /// Trailing observation window; capped at the provider's 30-day limit.
    #[serde(default = "default_usage_window")]
    pub usage_window_days: i64,
}

fn default_check_interval() -> u64 {
    15 * 60
}

fn default_thresholds() -> Vec<u32> {
    vec![50, 80, 100]
}

fn default_action() -> RemediationAction {
    RemediationAction::Notify
}

fn default_usage_window() -> i64 {
    30
}

/// Servers exempt from remediation, by id or by name.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WhitelistConfig {
    #[serde(default)]
    pub server_ids: Vec<ResourceId>,
    #[serde(default)]
    pub server_names: Vec<String>,
}

impl WhitelistConfig {
    pub fn is_exempt(&self, server: &CloudServer) -> bool {
        self.server_ids.contains(&server.id) || self.server_names.contains(&server.name)
    }
}

/// DNS collaborator settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    #[serde(default = "default_dns_attempts")]
    pub attempts: u32,

    #[serde(default = "default_dns_retry_delay")]
    pub retry_delay_secs: u64,

    /// Initial record name per server id; migrated to replacement ids at
    /// runtime through the mapping registry.
    #[serde(default)]
    pub record_map: HashMap<ResourceId, String>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            attempts: default_dns_attempts(),
            retry_delay_secs: default_dns_retry_delay(),
            record_map: HashMap::new(),
        }
    }
}

fn default_dns_attempts() -> u32 {
    3
}

fn default_dns_retry_delay() -> u64 {
    3
}

impl DnsConfig {
    pub fn retry_policy(&self) -> DnsRetryPolicy {
        DnsRetryPolicy {
            attempts: self.attempts,
            delay: Duration::from_secs(self.retry_delay_secs),
        }
    }
}

/// Full policy surface for the monitor and remediation engine.
#[derive(Debug, Clone, Deserialize)]
pub struct SentinelConfig {
    pub traffic: TrafficConfig,

    #[serde(default)]
    pub whitelist: WhitelistConfig,

    #[serde(default)]
    pub server_template: ServerTemplate,

    #[serde(default)]
    pub fallback_profiles: Vec<FallbackProfile>,

    /// Initial snapshot override per server id; migrated to replacement ids
    /// at runtime through the mapping registry.
    #[serde(default)]
    pub snapshot_map: HashMap<ResourceId, SnapshotId>,

    #[serde(default)]
    pub dns: DnsConfig,
}

impl SentinelConfig {
    /// Engine policy derived from this configuration.
    pub fn remediation_policy(&self) -> RemediationPolicy {
        RemediationPolicy {
            template: self.server_template.clone(),
            fallbacks: self.fallback_profiles.clone(),
            delete_wait: WaitConfig::default(),
        }
    }

    /// Initial mapping seed, applied only when the store has no state yet.
    pub fn mapping_seeds(&self) -> (Vec<(ResourceId, SnapshotId)>, Vec<(ResourceId, String)>) {
        let snapshots = self.snapshot_map.iter().map(|(k, v)| (*k, *v)).collect();
        let records = self
            .dns
            .record_map
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        (snapshots, records)
    }

    /// Fail fast on configuration that would only surface mid-remediation.
    pub fn validate(&self) -> Result<(), RemediationError> {
        if self.traffic.limit_gib <= 0.0 {
            return Err(RemediationError::ConfigInvalid(
                "traffic.limit_gib must be positive".to_string(),
            ));
        }
        if self.traffic.exceed_action == RemediationAction::DeleteRebuild {
            let template = &self.server_template;
            if template.server_type.as_deref().unwrap_or("").is_empty()
                || template.location.as_deref().unwrap_or("").is_empty()
            {
                return Err(RemediationError::ConfigInvalid(
                    "server_template.server_type and .location are required for delete_rebuild"
                        .to_string(),
                ));
            }
        }
        Ok(())
    }
}
