//! Observability infrastructure for the sentinel
//!
//! Prometheus metrics for the scan/remediation pipeline plus structured
//! event logging for the operations that matter when reconstructing an
//! incident: what was destroyed, what replaced it, and what DNS saw.

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Histogram buckets for scan cycle latency (in seconds). Cycles talk to a
/// remote API per server, so these run much coarser than request latencies.
const SCAN_LATENCY_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<SentinelMetricsInner> = OnceLock::new();

struct SentinelMetricsInner {
    scan_latency_seconds: Histogram,
    servers_monitored: IntGauge,
    servers_exceeded: IntGauge,
    threshold_crossings_total: IntCounter,
    remediations_total: IntCounterVec,
    critical_failures_total: IntCounter,
    dns_updates_total: IntCounterVec,
    scan_errors_total: IntCounter,
}

impl SentinelMetricsInner {
    fn new() -> Self {
        Self {
            scan_latency_seconds: register_histogram!(
                "traffic_sentinel_scan_latency_seconds",
                "Time spent scanning all servers in one monitor cycle",
                SCAN_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register scan_latency_seconds"),

            servers_monitored: register_int_gauge!(
                "traffic_sentinel_servers_monitored",
                "Number of servers seen in the last scan cycle"
            )
            .expect("Failed to register servers_monitored"),

            servers_exceeded: register_int_gauge!(
                "traffic_sentinel_servers_exceeded",
                "Number of servers over their traffic quota in the last cycle"
            )
            .expect("Failed to register servers_exceeded"),

            threshold_crossings_total: register_int_counter!(
                "traffic_sentinel_threshold_crossings_total",
                "Total number of new warning threshold crossings"
            )
            .expect("Failed to register threshold_crossings_total"),

            remediations_total: register_int_counter_vec!(
                "traffic_sentinel_remediations_total",
                "Remediation attempts by action and outcome",
                &["action", "outcome"]
            )
            .expect("Failed to register remediations_total"),

            critical_failures_total: register_int_counter!(
                "traffic_sentinel_critical_failures_total",
                "Servers destroyed with no replacement created"
            )
            .expect("Failed to register critical_failures_total"),

            dns_updates_total: register_int_counter_vec!(
                "traffic_sentinel_dns_updates_total",
                "DNS record updates by result",
                &["result"]
            )
            .expect("Failed to register dns_updates_total"),

            scan_errors_total: register_int_counter!(
                "traffic_sentinel_scan_errors_total",
                "Per-server scan failures"
            )
            .expect("Failed to register scan_errors_total"),
        }
    }
}

/// Metrics handle for the monitor/remediation pipeline.
///
/// A lightweight handle to the global instance; clones share the same
/// underlying metrics.
#[derive(Clone)]
pub struct SentinelMetrics {
    _private: (),
}

impl Default for SentinelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SentinelMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(SentinelMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &SentinelMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn observe_scan_latency(&self, duration_secs: f64) {
        self.inner().scan_latency_seconds.observe(duration_secs);
    }

    pub fn set_servers_monitored(&self, count: i64) {
        self.inner().servers_monitored.set(count);
    }

    pub fn set_servers_exceeded(&self, count: i64) {
        self.inner().servers_exceeded.set(count);
    }

    pub fn inc_threshold_crossings(&self) {
        self.inner().threshold_crossings_total.inc();
    }

    pub fn inc_remediation(&self, action: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.inner()
            .remediations_total
            .with_label_values(&[action, outcome])
            .inc();
    }

    pub fn inc_critical_failures(&self) {
        self.inner().critical_failures_total.inc();
    }

    pub fn inc_dns_update(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.inner()
            .dns_updates_total
            .with_label_values(&[result])
            .inc();
    }

    pub fn inc_scan_errors(&self) {
        self.inner().scan_errors_total.inc();
    }
}

/// Structured logger for sentinel events
///
/// Consistent JSON-formatted events for threshold crossings, remediation
/// outcomes, and DNS changes.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log a new threshold crossing
    pub fn log_threshold_crossing(
        &self,
        server_id: &str,
        server_name: &str,
        threshold: u32,
        usage_percent: f64,
    ) {
        info!(
            event = "threshold_crossed",
            instance = %self.instance,
            server_id = %server_id,
            server_name = %server_name,
            threshold = threshold,
            usage_percent = usage_percent,
            "Traffic threshold crossed"
        );
    }

    /// Log a remediation outcome
    pub fn log_remediation(
        &self,
        server_id: &str,
        server_name: &str,
        action: &str,
        success: bool,
        detail: &str,
    ) {
        if success {
            info!(
                event = "remediation_completed",
                instance = %self.instance,
                server_id = %server_id,
                server_name = %server_name,
                action = %action,
                detail = %detail,
                "Remediation completed"
            );
        } else {
            warn!(
                event = "remediation_failed",
                instance = %self.instance,
                server_id = %server_id,
                server_name = %server_name,
                action = %action,
                detail = %detail,
                "Remediation failed"
            );
        }
    }

    /// Log a destroyed-without-replacement outcome. Kept apart from
    /// ordinary failures so alerting can key on the event name.
    pub fn log_capacity_loss(&self, server_id: &str, server_name: &str, attempts: usize) {
        error!(
            event = "capacity_lost",
            instance = %self.instance,
            server_id = %server_id,
            server_name = %server_name,
            create_attempts = attempts,
            "Server destroyed and no replacement could be created"
        );
    }

    /// Log a DNS record change
    pub fn log_dns_update(&self, record: &str, ip: &str, success: bool) {
        if success {
            info!(
                event = "dns_updated",
                instance = %self.instance,
                record = %record,
                ip = %ip,
                "DNS record updated"
            );
        } else {
            warn!(
                event = "dns_update_failed",
                instance = %self.instance,
                record = %record,
                ip = %ip,
                "DNS record update failed"
            );
        }
    }

    /// Log sentinel startup
    pub fn log_startup(&self, version: &str, action: &str) {
        info!(
            event = "sentinel_started",
            instance = %self.instance,
            version = %version,
            exceed_action = %action,
            "Traffic sentinel started"
        );
    }

    /// Log sentinel shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "sentinel_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Traffic sentinel shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_metrics_creation() {
        // Prometheus registration is global; creating the handle twice must
        // reuse the same instance rather than re-register.
        let metrics = SentinelMetrics::new();
        let _again = SentinelMetrics::new();

        metrics.observe_scan_latency(0.5);
        metrics.set_servers_monitored(3);
        metrics.set_servers_exceeded(1);
        metrics.inc_threshold_crossings();
        metrics.inc_remediation("delete_rebuild", true);
        metrics.inc_remediation("delete_rebuild", false);
        metrics.inc_critical_failures();
        metrics.inc_dns_update(true);
        metrics.inc_scan_errors();
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("sentinel-1");
        assert_eq!(logger.instance, "sentinel-1");
    }
}
