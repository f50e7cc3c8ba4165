//! Post-recreation reconciliation
//!
//! After a successful destroy-and-recreate, identity-keyed state still
//! points at the old server id. Reconciliation performs three independently
//! idempotent steps: migrate the snapshot/DNS mappings, push the DNS record
//! at the new address, and restart threshold tracking under the new id.
//! Re-running after a crash repeats overwrites and deletes, never appends.

use crate::dns::DnsUpdater;
use crate::mappings::MappingRegistry;
use crate::models::{RemediationResult, ResourceId};
use crate::notify::{Notification, Notifier};
use crate::observability::{SentinelMetrics, StructuredLogger};
use crate::threshold::ThresholdTracker;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct ReconciliationService {
    mappings: Arc<MappingRegistry>,
    thresholds: Arc<ThresholdTracker>,
    /// Absent when no DNS collaborator is configured.
    dns: Option<DnsUpdater>,
    notifier: Notifier,
    metrics: SentinelMetrics,
    logger: StructuredLogger,
}

impl ReconciliationService {
    pub fn new(
        mappings: Arc<MappingRegistry>,
        thresholds: Arc<ThresholdTracker>,
        dns: Option<DnsUpdater>,
        notifier: Notifier,
        metrics: SentinelMetrics,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            mappings,
            thresholds,
            dns,
            notifier,
            metrics,
            logger,
        }
    }

    /// Reconcile state after a successful recreation. A result without a new
    /// server id (or a failed one) is ignored.
    ///
    /// Failures in individual steps are reported and logged, never
    /// propagated: a DNS outage must not stop threshold tracking from
    /// moving to the new identity.
    pub async fn reconcile(&self, old_id: ResourceId, result: &RemediationResult) {
        let new_id = match (result.success, result.new_server_id) {
            (true, Some(new_id)) => new_id,
            _ => {
                debug!(old_id = %old_id, "Nothing to reconcile for unsuccessful result");
                return;
            }
        };

        if let Err(err) = self.mappings.migrate(old_id, new_id) {
            warn!(old_id = %old_id, new_id = %new_id, error = %err, "Mapping migration failed");
        }

        self.update_dns(old_id, new_id, result).await;

        if let Err(err) = self.thresholds.migrate(old_id, new_id) {
            warn!(old_id = %old_id, new_id = %new_id, error = %err, "Threshold migration failed");
        }
    }

    async fn update_dns(&self, old_id: ResourceId, new_id: ResourceId, result: &RemediationResult) {
        let updater = match &self.dns {
            Some(updater) => updater,
            None => return,
        };
        let ip = match &result.new_ip {
            Some(ip) => ip,
            None => {
                debug!(new_id = %new_id, "No address on replacement, skipping DNS");
                return;
            }
        };

        // After migration the record rides under the new id; the old id is
        // checked as well so a crashed, half-finished run still resolves.
        let record = self
            .mappings
            .record_name(new_id)
            .or_else(|| self.mappings.record_name(old_id));
        let record = match record {
            Some(record) => record,
            None => return,
        };

        match updater.update_record(&record, ip).await {
            Ok(()) => {
                self.metrics.inc_dns_update(true);
                self.logger.log_dns_update(&record, ip, true);
                self.notifier.publish(Notification::DnsUpdated {
                    record,
                    ip: ip.clone(),
                });
            }
            Err(err) => {
                self.metrics.inc_dns_update(false);
                self.logger.log_dns_update(&record, ip, false);
                self.notifier.publish(Notification::DnsUpdateFailed {
                    record,
                    ip: ip.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::DnsRetryPolicy;
    use crate::error::ProviderError;
    use crate::models::SnapshotId;
    use crate::provider::{DnsProvider, DnsRecord};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    struct StubDns {
        updates: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    impl StubDns {
        fn new(fail: bool) -> Self {
            Self {
                updates: Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    #[async_trait]
    impl DnsProvider for StubDns {
        async fn find_a_record(&self, name: &str) -> Result<Option<DnsRecord>, ProviderError> {
            Ok(Some(DnsRecord {
                id: "rec-1".to_string(),
                name: name.to_string(),
                content: "192.0.2.1".to_string(),
                ttl: 300,
                proxied: true,
            }))
        }

        async fn update_a_record(
            &self,
            record: &DnsRecord,
            ip: &str,
        ) -> Result<(), ProviderError> {
            if self.fail {
                return Err(ProviderError::transient("timeout"));
            }
            self.updates
                .lock()
                .unwrap()
                .push((record.name.clone(), ip.to_string()));
            Ok(())
        }
    }

    struct Fixture {
        mappings: Arc<MappingRegistry>,
        thresholds: Arc<ThresholdTracker>,
        dns: Arc<StubDns>,
        service: ReconciliationService,
    }

    fn fixture(dns_fails: bool) -> Fixture {
        let mappings = Arc::new(MappingRegistry::new(Arc::new(MemoryStore::new())));
        let thresholds = Arc::new(ThresholdTracker::new(Arc::new(MemoryStore::new())));
        let dns = Arc::new(StubDns::new(dns_fails));
        let updater = DnsUpdater::new(
            dns.clone(),
            DnsRetryPolicy {
                attempts: 2,
                delay: Duration::from_millis(1),
            },
        );
        let service = ReconciliationService::new(
            mappings.clone(),
            thresholds.clone(),
            Some(updater),
            Notifier::disabled(),
            SentinelMetrics::new(),
            StructuredLogger::new("test"),
        );
        Fixture {
            mappings,
            thresholds,
            dns,
            service,
        }
    }

    fn success(new_id: u64, ip: &str) -> RemediationResult {
        RemediationResult {
            success: true,
            new_server_id: Some(ResourceId(new_id)),
            new_ip: Some(ip.to_string()),
            snapshot_id: Some(SnapshotId(42)),
            server_type: Some("cx21".to_string()),
            fallback_index: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn reconcile_migrates_mappings_dns_and_thresholds() {
        let f = fixture(false);
        let old = ResourceId(10);

        f.mappings.set_snapshot_override(old, SnapshotId(42)).unwrap();
        f.mappings.set_record_name(old, "vpn.example.com").unwrap();
        f.thresholds.record_usage(old, 85.0, &[50, 80]).unwrap();

        f.service.reconcile(old, &success(20, "198.51.100.7")).await;

        assert_eq!(f.mappings.snapshot_override(old), None);
        assert_eq!(
            f.mappings.snapshot_override(ResourceId(20)),
            Some(SnapshotId(42))
        );
        assert_eq!(
            f.mappings.record_name(ResourceId(20)),
            Some("vpn.example.com".to_string())
        );
        assert_eq!(f.thresholds.last_notified(old), 0);
        assert_eq!(f.thresholds.last_notified(ResourceId(20)), 0);
        assert_eq!(
            f.dns.updates.lock().unwrap().as_slice(),
            &[("vpn.example.com".to_string(), "198.51.100.7".to_string())]
        );
    }

    #[tokio::test]
    async fn reconcile_twice_reaches_the_same_state() {
        let f = fixture(false);
        let old = ResourceId(10);
        f.mappings.set_record_name(old, "vpn.example.com").unwrap();
        f.thresholds.record_usage(old, 85.0, &[50, 80]).unwrap();

        let result = success(20, "198.51.100.7");
        f.service.reconcile(old, &result).await;
        f.service.reconcile(old, &result).await;

        assert_eq!(f.mappings.record_name(old), None);
        assert_eq!(
            f.mappings.record_name(ResourceId(20)),
            Some("vpn.example.com".to_string())
        );
        assert_eq!(f.thresholds.last_notified(ResourceId(20)), 0);
        // The record still resolves after migration, so both runs update DNS
        assert_eq!(f.dns.updates.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_result_is_ignored() {
        let f = fixture(false);
        let old = ResourceId(10);
        f.mappings.set_record_name(old, "vpn.example.com").unwrap();

        f.service
            .reconcile(
                old,
                &RemediationResult::failed(crate::error::RemediationError::DestroyFailed {
                    id: old,
                    reason: "locked".to_string(),
                }),
            )
            .await;

        assert_eq!(
            f.mappings.record_name(old),
            Some("vpn.example.com".to_string())
        );
        assert!(f.dns.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dns_failure_does_not_block_threshold_migration() {
        let f = fixture(true);
        let old = ResourceId(10);
        f.mappings.set_record_name(old, "vpn.example.com").unwrap();
        f.thresholds.record_usage(old, 85.0, &[50, 80]).unwrap();

        f.service.reconcile(old, &success(20, "198.51.100.7")).await;

        // Threshold state moved even though DNS never succeeded
        assert_eq!(f.thresholds.last_notified(old), 0);
        assert_eq!(f.thresholds.last_notified(ResourceId(20)), 0);
    }

    #[tokio::test]
    async fn missing_record_mapping_skips_dns() {
        let f = fixture(false);
        f.service
            .reconcile(ResourceId(10), &success(20, "198.51.100.7"))
            .await;
        assert!(f.dns.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_ip_skips_dns() {
        let f = fixture(false);
        let old = ResourceId(10);
        f.mappings.set_record_name(old, "vpn.example.com").unwrap();

        let mut result = success(20, "unused");
        result.new_ip = None;
        f.service.reconcile(old, &result).await;

        assert!(f.dns.updates.lock().unwrap().is_empty());
        // Mapping migration still happened
        assert_eq!(
            f.mappings.record_name(ResourceId(20)),
            Some("vpn.example.com".to_string())
        );
    }
}
