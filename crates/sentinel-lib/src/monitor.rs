//! Traffic monitoring loop
//!
//! Periodically scans every managed server, feeds usage into the threshold
//! tracker, and hands quota-exceeding servers to the remediation engine.
//! Servers are evaluated one at a time; a failure on one server never
//! aborts the cycle, and notification delivery never blocks the scan.

use crate::config::SentinelConfig;
use crate::error::{ProviderError, RemediationError};
use crate::models::{CloudServer, RemediationAction, RemediationResult, ResourceId, TrafficUsage};
use crate::notify::{Notification, Notifier};
use crate::observability::{SentinelMetrics, StructuredLogger};
use crate::provider::ComputeProvider;
use crate::remediation::{ReconciliationService, RemediationEngine};
use crate::threshold::ThresholdTracker;
use crate::traffic;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

/// Band above a threshold (in percent points) still reported as "near" that
/// threshold in cycle summaries.
const WARNING_BAND: f64 = 5.0;

/// Usage evaluation for one server in one cycle.
#[derive(Debug, Clone)]
pub struct TrafficReport {
    pub server_id: ResourceId,
    pub server_name: String,
    pub usage: TrafficUsage,
    pub limit_gib: f64,
    pub usage_percent: f64,
    pub exceeded: bool,
    pub whitelisted: bool,
    /// Threshold newly crossed this cycle, at most once per level.
    pub new_threshold: Option<u32>,
    /// Thresholds the usage currently sits just above.
    pub warnings: Vec<u32>,
}

/// A remediation that actually ran this cycle.
#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub server_name: String,
    pub action: RemediationAction,
    pub usage_gib: f64,
}

/// Outcome of one full scan cycle.
#[derive(Debug, Default)]
pub struct MonitorSummary {
    pub total_servers: usize,
    pub exceeded: Vec<TrafficReport>,
    pub warnings: Vec<TrafficReport>,
    pub normal: Vec<TrafficReport>,
    pub actions_taken: Vec<ActionRecord>,
}

/// Periodic scan loop over all managed servers.
pub struct MonitorLoop {
    provider: Arc<dyn ComputeProvider>,
    tracker: Arc<ThresholdTracker>,
    engine: Arc<RemediationEngine>,
    reconciler: Arc<ReconciliationService>,
    notifier: Notifier,
    metrics: SentinelMetrics,
    logger: StructuredLogger,
    config: SentinelConfig,
}

impl MonitorLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn ComputeProvider>,
        tracker: Arc<ThresholdTracker>,
        engine: Arc<RemediationEngine>,
        reconciler: Arc<ReconciliationService>,
        notifier: Notifier,
        metrics: SentinelMetrics,
        logger: StructuredLogger,
        config: SentinelConfig,
    ) -> Self {
        Self {
            provider,
            tracker,
            engine,
            reconciler,
            notifier,
            metrics,
            logger,
            config,
        }
    }

    /// Run scan cycles until shutdown.
    pub async fn run(self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let base = Duration::from_secs(self.config.traffic.check_interval_secs.max(1));
        info!(
            interval_secs = base.as_secs(),
            action = %self.config.traffic.exceed_action,
            "Starting traffic monitor loop"
        );

        let mut ticker = interval(jittered(base));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let start = Instant::now();
                    let summary = self.scan_cycle().await;
                    let elapsed = start.elapsed();
                    self.metrics.observe_scan_latency(elapsed.as_secs_f64());

                    info!(
                        total = summary.total_servers,
                        exceeded = summary.exceeded.len(),
                        warning = summary.warnings.len(),
                        actions = summary.actions_taken.len(),
                        elapsed_ms = elapsed.as_millis(),
                        "Monitor cycle complete"
                    );

                    ticker = interval(jittered(base));
                }
                _ = shutdown.recv() => {
                    info!("Shutting down traffic monitor loop");
                    break;
                }
            }
        }
    }

    /// Evaluate every server once and remediate the over-quota ones.
    pub async fn scan_cycle(&self) -> MonitorSummary {
        let servers = match self.provider.list_servers().await {
            Ok(servers) => servers,
            Err(err) => {
                warn!(error = %err, "Failed to list servers, skipping cycle");
                self.metrics.inc_scan_errors();
                return MonitorSummary::default();
            }
        };

        let mut summary = MonitorSummary {
            total_servers: servers.len(),
            ..MonitorSummary::default()
        };
        self.metrics.set_servers_monitored(servers.len() as i64);

        for server in &servers {
            let report = match self.check_server(server).await {
                Ok(report) => report,
                Err(err) => {
                    warn!(server_id = %server.id, name = %server.name, error = %err, "Server check failed");
                    self.metrics.inc_scan_errors();
                    continue;
                }
            };

            if let Some(threshold) = report.new_threshold {
                self.metrics.inc_threshold_crossings();
                self.logger.log_threshold_crossing(
                    &report.server_id.key(),
                    &report.server_name,
                    threshold,
                    report.usage_percent,
                );
                self.notifier.publish(Notification::ThresholdCrossed {
                    server_name: report.server_name.clone(),
                    server_id: report.server_id,
                    threshold,
                    usage_percent: report.usage_percent,
                    limit_gib: report.limit_gib,
                });
            }

            if report.exceeded {
                self.handle_exceeded(server, &report, &mut summary).await;
                summary.exceeded.push(report);
            } else if !report.warnings.is_empty() {
                summary.warnings.push(report);
            } else {
                summary.normal.push(report);
            }
        }

        self.metrics.set_servers_exceeded(summary.exceeded.len() as i64);
        summary
    }

    /// Compute usage and threshold state for one server.
    async fn check_server(&self, server: &CloudServer) -> Result<TrafficReport, ProviderError> {
        let traffic_cfg = &self.config.traffic;
        let usage =
            traffic::collect_usage(self.provider.as_ref(), server.id, traffic_cfg.usage_window_days)
                .await?;

        let usage_percent = usage.usage_percent(traffic_cfg.limit_gib);
        let exceeded = usage.billable_gib() > traffic_cfg.limit_gib;
        let whitelisted = self.config.whitelist.is_exempt(server);

        let new_threshold = self
            .tracker
            .record_usage(server.id, usage_percent, &traffic_cfg.warning_thresholds)
            .unwrap_or_else(|err| {
                warn!(server_id = %server.id, error = %err, "Threshold state update failed");
                None
            });

        let mut warnings: Vec<u32> = traffic_cfg
            .warning_thresholds
            .iter()
            .copied()
            .filter(|t| usage_percent >= *t as f64 && usage_percent < *t as f64 + WARNING_BAND)
            .collect();
        warnings.sort_unstable();

        debug!(
            server_id = %server.id,
            name = %server.name,
            usage_gib = usage.billable_gib(),
            limit_gib = traffic_cfg.limit_gib,
            usage_percent,
            exceeded,
            "Server checked"
        );

        Ok(TrafficReport {
            server_id: server.id,
            server_name: server.name.clone(),
            usage,
            limit_gib: traffic_cfg.limit_gib,
            usage_percent,
            exceeded,
            whitelisted,
            new_threshold,
            warnings,
        })
    }

    /// Apply the configured action to an over-quota server. Whitelisted
    /// servers are reported but never handed to the engine.
    async fn handle_exceeded(
        &self,
        server: &CloudServer,
        report: &TrafficReport,
        summary: &mut MonitorSummary,
    ) {
        let action = self.config.traffic.exceed_action;

        self.notifier.publish(Notification::TrafficExceeded {
            server_name: report.server_name.clone(),
            server_id: report.server_id,
            usage_gib: report.usage.billable_gib(),
            limit_gib: report.limit_gib,
            action,
            whitelisted: report.whitelisted,
        });

        if report.whitelisted {
            info!(server_id = %server.id, name = %server.name, "Server over quota but whitelisted");
            return;
        }

        warn!(
            server_id = %server.id,
            name = %server.name,
            usage_gib = report.usage.billable_gib(),
            limit_gib = report.limit_gib,
            %action,
            "Server over quota, remediating"
        );

        let policy = self.config.remediation_policy();
        let result = self.engine.execute(server, action, &policy).await;
        self.metrics.inc_remediation(&action.to_string(), result.success);

        let detail = match (&result.error, result.new_server_id) {
            (Some(error), _) => error.to_string(),
            (None, Some(new_id)) => format!("new server {new_id}"),
            (None, None) => String::new(),
        };
        self.logger.log_remediation(
            &server.id.key(),
            &server.name,
            &action.to_string(),
            result.success,
            &detail,
        );

        if result.success {
            summary.actions_taken.push(ActionRecord {
                server_name: report.server_name.clone(),
                action,
                usage_gib: report.usage.billable_gib(),
            });
            self.after_success(server.id, action, &result).await;
        } else {
            if let Some(RemediationError::CreateFailedAfterFallbacks { attempts, .. }) =
                &result.error
            {
                self.metrics.inc_critical_failures();
                self.logger.log_capacity_loss(&server.id.key(), &server.name, *attempts);
            }
            if let Some(error) = result.error.clone() {
                self.notifier.publish(Notification::RebuildFailed {
                    server_id: server.id,
                    server_name: server.name.clone(),
                    error,
                });
            }
        }
    }

    async fn after_success(
        &self,
        old_id: ResourceId,
        action: RemediationAction,
        result: &RemediationResult,
    ) {
        if action != RemediationAction::DeleteRebuild {
            return;
        }

        if let Some(new_id) = result.new_server_id {
            self.notifier.publish(Notification::RebuildSucceeded {
                old_id,
                new_id,
                new_ip: result.new_ip.clone(),
                snapshot_id: result.snapshot_id,
                server_type: result.server_type.clone(),
            });
        }

        self.reconciler.reconcile(old_id, result).await;
    }
}

/// Add jitter to the scan interval to avoid synchronized polling across
/// instances.
fn jittered(base: Duration) -> Duration {
    let max_jitter_ms = (base.as_millis() as u64 / 10).max(1);
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    base + Duration::from_millis(now % max_jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{DnsRetryPolicy, DnsUpdater};
    use crate::mappings::MappingRegistry;
    use crate::models::{
        CreateServerRequest, NetworkSeries, ServerStatus, Snapshot, SnapshotId,
    };
    use crate::provider::{DnsProvider, DnsRecord};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    const GIB: u64 = 1024 * 1024 * 1024;

    /// Provider with fixed usage per server and full create/delete support.
    struct ScriptedProvider {
        servers: Mutex<HashMap<ResourceId, CloudServer>>,
        snapshots: Vec<Snapshot>,
        delete_calls: AtomicUsize,
        create_calls: AtomicUsize,
        power_off_calls: AtomicUsize,
        next_id: AtomicU64,
    }

    impl ScriptedProvider {
        fn new(servers: Vec<CloudServer>, snapshots: Vec<Snapshot>) -> Self {
            Self {
                servers: Mutex::new(servers.into_iter().map(|s| (s.id, s)).collect()),
                snapshots,
                delete_calls: AtomicUsize::new(0),
                create_calls: AtomicUsize::new(0),
                power_off_calls: AtomicUsize::new(0),
                next_id: AtomicU64::new(100),
            }
        }
    }

    #[async_trait]
    impl ComputeProvider for ScriptedProvider {
        async fn list_servers(&self) -> Result<Vec<CloudServer>, ProviderError> {
            let mut servers: Vec<_> = self.servers.lock().unwrap().values().cloned().collect();
            servers.sort_by_key(|s| s.id);
            Ok(servers)
        }

        async fn get_server(&self, id: ResourceId) -> Result<CloudServer, ProviderError> {
            self.servers
                .lock()
                .unwrap()
                .get(&id)
                .cloned()
                .ok_or(ProviderError::NotFound)
        }

        async fn network_series(
            &self,
            _id: ResourceId,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<NetworkSeries, ProviderError> {
            Ok(NetworkSeries::default())
        }

        async fn power_on(&self, _id: ResourceId) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn power_off(&self, _id: ResourceId) -> Result<(), ProviderError> {
            self.power_off_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reboot(&self, _id: ResourceId) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn delete_server(&self, id: ResourceId) -> Result<(), ProviderError> {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);
            self.servers.lock().unwrap().remove(&id);
            Ok(())
        }

        async fn create_server(
            &self,
            request: &CreateServerRequest,
        ) -> Result<CloudServer, ProviderError> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            let id = ResourceId(self.next_id.fetch_add(1, Ordering::SeqCst));
            let server = CloudServer {
                id,
                name: request.name.clone(),
                status: ServerStatus::Initializing,
                public_ip: Some("198.51.100.7".to_string()),
                server_type: request.server_type.clone(),
                ingoing_traffic: Some(0),
                outgoing_traffic: Some(0),
            };
            self.servers.lock().unwrap().insert(id, server.clone());
            Ok(server)
        }

        async fn rebuild_server(
            &self,
            _id: ResourceId,
            _image: SnapshotId,
        ) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn list_snapshots(&self) -> Result<Vec<Snapshot>, ProviderError> {
            Ok(self.snapshots.clone())
        }

        async fn create_snapshot(
            &self,
            _id: ResourceId,
            _description: &str,
        ) -> Result<Snapshot, ProviderError> {
            Err(ProviderError::permanent("not supported"))
        }
    }

    struct NullDns;

    #[async_trait]
    impl DnsProvider for NullDns {
        async fn find_a_record(&self, _name: &str) -> Result<Option<DnsRecord>, ProviderError> {
            Ok(None)
        }

        async fn update_a_record(
            &self,
            _record: &DnsRecord,
            _ip: &str,
        ) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    fn server_with_usage(id: u64, name: &str, outbound_gib: u64) -> CloudServer {
        CloudServer {
            id: ResourceId(id),
            name: name.to_string(),
            status: ServerStatus::Running,
            public_ip: Some("192.0.2.1".to_string()),
            server_type: "cx21".to_string(),
            ingoing_traffic: Some(0),
            outgoing_traffic: Some(outbound_gib * GIB),
        }
    }

    fn snapshot_for(id: u64, from: u64) -> Snapshot {
        Snapshot {
            id: SnapshotId(id),
            description: String::new(),
            created: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            created_from: Some(ResourceId(from)),
        }
    }

    fn config(action: &str, whitelist_names: Vec<&str>) -> SentinelConfig {
        serde_json::from_value(json!({
            "traffic": {
                "limit_gib": 100.0,
                "warning_thresholds": [50, 80, 100],
                "exceed_action": action,
            },
            "whitelist": { "server_names": whitelist_names },
            "server_template": { "server_type": "cx21", "location": "fsn1" },
        }))
        .unwrap()
    }

    struct Fixture {
        provider: Arc<ScriptedProvider>,
        tracker: Arc<ThresholdTracker>,
        monitor: MonitorLoop,
        notifications: tokio::sync::mpsc::Receiver<Notification>,
    }

    fn fixture(provider: ScriptedProvider, config: SentinelConfig) -> Fixture {
        let provider = Arc::new(provider);
        let tracker = Arc::new(ThresholdTracker::new(Arc::new(MemoryStore::new())));
        let mappings = Arc::new(MappingRegistry::new(Arc::new(MemoryStore::new())));
        let engine = Arc::new(RemediationEngine::new(provider.clone(), mappings.clone()));
        let (notifier, notifications) = Notifier::channel(64);
        let dns = DnsUpdater::new(
            Arc::new(NullDns),
            DnsRetryPolicy {
                attempts: 1,
                delay: Duration::from_millis(1),
            },
        );
        let reconciler = Arc::new(ReconciliationService::new(
            mappings,
            tracker.clone(),
            Some(dns),
            notifier.clone(),
            SentinelMetrics::new(),
            StructuredLogger::new("test"),
        ));
        let mut config = config;
        config.traffic.check_interval_secs = 1;
        let monitor = MonitorLoop::new(
            provider.clone(),
            tracker.clone(),
            engine,
            reconciler,
            notifier,
            SentinelMetrics::new(),
            StructuredLogger::new("test"),
            config,
        );
        Fixture {
            provider,
            tracker,
            monitor,
            notifications,
        }
    }

    fn drain(rx: &mut tokio::sync::mpsc::Receiver<Notification>) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    #[tokio::test]
    async fn cycle_classifies_servers() {
        let provider = ScriptedProvider::new(
            vec![
                server_with_usage(1, "calm", 10),
                server_with_usage(2, "warm", 52),
                server_with_usage(3, "hot", 150),
            ],
            vec![],
        );
        let f = fixture(provider, config("notify", vec![]));

        let summary = f.monitor.scan_cycle().await;

        assert_eq!(summary.total_servers, 3);
        assert_eq!(summary.normal.len(), 1);
        assert_eq!(summary.warnings.len(), 1);
        assert_eq!(summary.exceeded.len(), 1);
        assert_eq!(summary.warnings[0].server_name, "warm");
        assert_eq!(summary.warnings[0].warnings, vec![50]);
        assert_eq!(summary.exceeded[0].server_name, "hot");
        // notify counts as an action taken
        assert_eq!(summary.actions_taken.len(), 1);
    }

    #[tokio::test]
    async fn threshold_crossing_notifies_once_across_cycles() {
        let provider = ScriptedProvider::new(vec![server_with_usage(1, "warm", 55)], vec![]);
        let mut f = fixture(provider, config("notify", vec![]));

        f.monitor.scan_cycle().await;
        let first = drain(&mut f.notifications);
        assert!(first
            .iter()
            .any(|n| matches!(n, Notification::ThresholdCrossed { threshold: 50, .. })));

        // Same usage next cycle: no new crossing
        f.monitor.scan_cycle().await;
        let second = drain(&mut f.notifications);
        assert!(!second
            .iter()
            .any(|n| matches!(n, Notification::ThresholdCrossed { .. })));
    }

    #[tokio::test]
    async fn whitelisted_server_is_never_remediated() {
        let provider = ScriptedProvider::new(
            vec![server_with_usage(1, "prod-db", 150)],
            vec![snapshot_for(1, 1)],
        );
        let mut f = fixture(provider, config("delete_rebuild", vec!["prod-db"]));

        let summary = f.monitor.scan_cycle().await;

        assert_eq!(summary.exceeded.len(), 1);
        assert!(summary.actions_taken.is_empty());
        assert_eq!(f.provider.delete_calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.provider.create_calls.load(Ordering::SeqCst), 0);

        // Exceeding is still reported
        let notifications = drain(&mut f.notifications);
        assert!(notifications.iter().any(|n| matches!(
            n,
            Notification::TrafficExceeded { whitelisted: true, .. }
        )));
    }

    #[tokio::test]
    async fn shutdown_action_powers_off_exceeding_server() {
        let provider = ScriptedProvider::new(vec![server_with_usage(1, "hot", 150)], vec![]);
        let f = fixture(provider, config("shutdown", vec![]));

        let summary = f.monitor.scan_cycle().await;

        assert_eq!(summary.actions_taken.len(), 1);
        assert_eq!(f.provider.power_off_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delete_rebuild_recreates_and_resets_threshold_state() {
        let provider = ScriptedProvider::new(
            vec![server_with_usage(10, "hot", 150)],
            vec![snapshot_for(1, 10)],
        );
        let mut f = fixture(provider, config("delete_rebuild", vec![]));

        let summary = f.monitor.scan_cycle().await;

        assert_eq!(summary.actions_taken.len(), 1);
        assert_eq!(f.provider.delete_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.provider.create_calls.load(Ordering::SeqCst), 1);

        // Old threshold row is gone; replacement starts clean
        assert_eq!(f.tracker.last_notified(ResourceId(10)), 0);
        let servers = f.provider.list_servers().await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(f.tracker.last_notified(servers[0].id), 0);

        let notifications = drain(&mut f.notifications);
        assert!(notifications
            .iter()
            .any(|n| matches!(n, Notification::RebuildSucceeded { .. })));
    }

    #[tokio::test]
    async fn failed_remediation_is_reported_not_thrown() {
        // delete_rebuild with no snapshot anywhere: remediation fails, the
        // cycle still completes and other servers are still scanned
        let provider = ScriptedProvider::new(
            vec![
                server_with_usage(10, "hot", 150),
                server_with_usage(11, "calm", 1),
            ],
            vec![],
        );
        let mut f = fixture(provider, config("delete_rebuild", vec![]));

        let summary = f.monitor.scan_cycle().await;

        assert_eq!(summary.total_servers, 2);
        assert_eq!(summary.exceeded.len(), 1);
        assert_eq!(summary.normal.len(), 1);
        assert!(summary.actions_taken.is_empty());
        assert_eq!(f.provider.delete_calls.load(Ordering::SeqCst), 0);

        let notifications = drain(&mut f.notifications);
        assert!(notifications
            .iter()
            .any(|n| matches!(n, Notification::RebuildFailed { .. })));
    }

    #[tokio::test]
    async fn scan_survives_empty_server_list() {
        let provider = ScriptedProvider::new(vec![], vec![]);
        let f = fixture(provider, config("notify", vec![]));

        let summary = f.monitor.scan_cycle().await;
        assert_eq!(summary.total_servers, 0);
        assert!(summary.actions_taken.is_empty());
    }
}
