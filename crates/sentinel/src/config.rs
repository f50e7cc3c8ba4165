//! Daemon configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Process-level settings, loaded from the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Instance name used in structured log events
    #[serde(default = "default_instance")]
    pub instance: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Directory for threshold and mapping state files
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Path to the policy file (limits, thresholds, template, mappings)
    #[serde(default = "default_policy_file")]
    pub policy_file: String,

    /// Notification channel capacity
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,
}

fn default_instance() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "sentinel".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/traffic-sentinel")
}

fn default_policy_file() -> String {
    "sentinel.yaml".to_string()
}

fn default_notification_capacity() -> usize {
    256
}

impl DaemonConfig {
    /// Load configuration from `SENTINEL_*` environment variables.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("SENTINEL"))
            .build()?;

        Ok(config.try_deserialize().unwrap_or_else(|_| DaemonConfig {
            instance: default_instance(),
            api_port: default_api_port(),
            state_dir: default_state_dir(),
            policy_file: default_policy_file(),
            notification_capacity: default_notification_capacity(),
        }))
    }

    /// Load the policy file, with `SENTINEL_POLICY_*` environment overrides.
    pub fn load_policy(&self) -> Result<sentinel_lib::config::SentinelConfig> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(&self.policy_file))
            .add_source(
                config::Environment::with_prefix("SENTINEL_POLICY").separator("__"),
            )
            .build()
            .with_context(|| format!("Failed to read policy file {}", self.policy_file))?;

        config
            .try_deserialize()
            .context("Invalid policy configuration")
    }
}
