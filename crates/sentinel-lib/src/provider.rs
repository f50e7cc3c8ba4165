//! Capability traits for the external collaborators
//!
//! The concrete HTTP clients live outside this crate; everything here is the
//! boundary the monitoring and remediation core consumes. Implementations
//! are expected to map wire failures into [`ProviderError`] so retryability
//! is decided in one place.

use crate::error::ProviderError;
use crate::models::{
    CloudServer, CreateServerRequest, NetworkSeries, ResourceId, Snapshot, SnapshotId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Compute provider API surface consumed by the sentinel.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    async fn list_servers(&self) -> Result<Vec<CloudServer>, ProviderError>;

    /// Fetch one server. `Err(ProviderError::NotFound)` means the server no
    /// longer exists, which the deletion wait relies on.
    async fn get_server(&self, id: ResourceId) -> Result<CloudServer, ProviderError>;

    /// Network byte time-series for a bounded range. Providers cap the range
    /// (callers clamp to 30 days before asking).
    async fn network_series(
        &self,
        id: ResourceId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<NetworkSeries, ProviderError>;

    async fn power_on(&self, id: ResourceId) -> Result<(), ProviderError>;

    async fn power_off(&self, id: ResourceId) -> Result<(), ProviderError>;

    async fn reboot(&self, id: ResourceId) -> Result<(), ProviderError>;

    async fn delete_server(&self, id: ResourceId) -> Result<(), ProviderError>;

    async fn create_server(
        &self,
        request: &CreateServerRequest,
    ) -> Result<CloudServer, ProviderError>;

    /// Reimage a server in place from a snapshot.
    async fn rebuild_server(&self, id: ResourceId, image: SnapshotId)
        -> Result<(), ProviderError>;

    async fn list_snapshots(&self) -> Result<Vec<Snapshot>, ProviderError>;

    /// Create a snapshot tagged as created-from the given server.
    async fn create_snapshot(
        &self,
        id: ResourceId,
        description: &str,
    ) -> Result<Snapshot, ProviderError>;
}

/// A DNS A record as the provider reports it. TTL and proxy flags are
/// carried through updates unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub id: String,
    pub name: String,
    pub content: String,
    pub ttl: u32,
    pub proxied: bool,
}

/// DNS provider API surface consumed by reconciliation.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Look up an A record by name. `Ok(None)` means no record exists.
    async fn find_a_record(&self, name: &str) -> Result<Option<DnsRecord>, ProviderError>;

    /// Point an existing record at a new address, preserving its TTL and
    /// proxy flags.
    async fn update_a_record(&self, record: &DnsRecord, ip: &str) -> Result<(), ProviderError>;
}

/// Pick the most recent snapshot created from the given server. Ties on the
/// creation timestamp break arbitrarily.
pub fn latest_snapshot_for(snapshots: &[Snapshot], id: ResourceId) -> Option<&Snapshot> {
    snapshots
        .iter()
        .filter(|s| s.created_from == Some(id))
        .max_by_key(|s| s.created)
}
