//! DNS record updates with a fixed retry policy
//!
//! Wraps the [`DnsProvider`] capability with the retry behavior the
//! reconciliation path relies on: a fixed number of attempts with a fixed
//! delay between them. A missing record fails immediately; retrying cannot
//! create one. TTL and proxy flags ride along unchanged from the looked-up
//! record.

use crate::error::{ProviderError, RemediationError};
use crate::provider::DnsProvider;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Fixed retry policy for record updates.
#[derive(Debug, Clone)]
pub struct DnsRetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for DnsRetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(3),
        }
    }
}

/// Retrying facade over a DNS provider.
pub struct DnsUpdater {
    provider: Arc<dyn DnsProvider>,
    policy: DnsRetryPolicy,
}

impl DnsUpdater {
    pub fn new(provider: Arc<dyn DnsProvider>, policy: DnsRetryPolicy) -> Self {
        Self { provider, policy }
    }

    /// Point the named A record at `ip`.
    pub async fn update_record(&self, record_name: &str, ip: &str) -> Result<(), RemediationError> {
        let mut last_error: Option<ProviderError> = None;

        for attempt in 1..=self.policy.attempts.max(1) {
            if attempt > 1 {
                tokio::time::sleep(self.policy.delay).await;
            }

            let record = match self.provider.find_a_record(record_name).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    // Nothing to retry against
                    return Err(RemediationError::DnsUpdateFailed {
                        record: record_name.to_string(),
                        reason: "record does not exist".to_string(),
                    });
                }
                Err(err) => {
                    debug!(record = record_name, attempt, error = %err, "DNS lookup failed");
                    last_error = Some(err);
                    continue;
                }
            };

            match self.provider.update_a_record(&record, ip).await {
                Ok(()) => {
                    debug!(record = record_name, ip, attempt, "DNS record updated");
                    return Ok(());
                }
                Err(err) => {
                    debug!(record = record_name, attempt, error = %err, "DNS update failed");
                    last_error = Some(err);
                }
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        warn!(record = record_name, ip, reason = %reason, "DNS update exhausted retries");
        Err(RemediationError::DnsUpdateFailed {
            record: record_name.to_string(),
            reason,
        })
    }
}
