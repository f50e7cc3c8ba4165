//! Traffic Sentinel - traffic quota watchdog daemon
//!
//! Watches cloud servers for traffic-quota exhaustion and remediates
//! exceeding servers according to the configured policy. This binary wires
//! persistent state, notifications, and the health/metrics API; the
//! monitor loop runs against the compute/DNS adapters the deployment
//! injects.

use anyhow::Result;
use sentinel_lib::{
    health::{components, HealthRegistry},
    mappings::MappingRegistry,
    notify::{spawn_worker, LogSink, Notifier},
    observability::{SentinelMetrics, StructuredLogger},
    store::JsonFileStore,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const SENTINEL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting traffic-sentinel");

    // Load configuration; invalid policy fails fast before anything runs
    let daemon = config::DaemonConfig::load()?;
    let policy = daemon.load_policy()?;
    policy.validate()?;
    info!(
        instance = %daemon.instance,
        limit_gib = policy.traffic.limit_gib,
        action = %policy.traffic.exceed_action,
        "Sentinel configured"
    );

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    health_registry.register(components::MONITOR).await;
    health_registry.register(components::REMEDIATION).await;
    health_registry.register(components::DNS).await;
    health_registry.register(components::NOTIFIER).await;
    health_registry.register(components::STATE_STORE).await;

    // Register metrics with the global Prometheus registry
    SentinelMetrics::new();

    // Initialize structured logger
    let logger = StructuredLogger::new(&daemon.instance);
    logger.log_startup(SENTINEL_VERSION, &policy.traffic.exceed_action.to_string());

    // Persistent identity mappings, seeded from the policy on first start
    let mapping_store = Arc::new(JsonFileStore::new(daemon.state_dir.join("mappings.json")));
    let mappings = Arc::new(MappingRegistry::new(mapping_store));
    let (snapshot_seeds, record_seeds) = policy.mapping_seeds();
    mappings.seed_if_empty(&snapshot_seeds, &record_seeds)?;

    // Outbound notifications drain through a background worker
    let (notifier, notifications) = Notifier::channel(daemon.notification_capacity);
    let worker = spawn_worker(notifications, Arc::new(LogSink));

    // Create shared application state
    let app_state = Arc::new(api::AppState::new(health_registry.clone()));

    // Mark sentinel as ready after initialization
    health_registry.set_ready(true).await;

    // Start health and metrics server
    let _api_handle = tokio::spawn(api::serve(daemon.api_port, app_state));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");

    // Let the worker drain pending notifications before exiting
    drop(notifier);
    let _ = worker.await;
    info!("Shutting down");

    Ok(())
}
