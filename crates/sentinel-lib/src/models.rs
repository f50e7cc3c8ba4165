//! Core data model for the traffic sentinel

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Provider-assigned server identifier.
///
/// The canonical key form is the decimal string. Persisted mappings and
/// configuration historically carried ids as either numbers or strings, so
/// deserialization accepts both and normalizes here, at the model boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u64);

impl ResourceId {
    /// Canonical string form used as a persistence key.
    pub fn key(&self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ResourceId {
    fn from(raw: u64) -> Self {
        ResourceId(raw)
    }
}

impl FromStr for ResourceId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(ResourceId)
    }
}

impl Serialize for ResourceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(IdVisitor("resource id")).map(ResourceId)
    }
}

/// Provider-assigned snapshot (image) identifier. Same tolerance rules as
/// [`ResourceId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotId(pub u64);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SnapshotId {
    fn from(raw: u64) -> Self {
        SnapshotId(raw)
    }
}

impl FromStr for SnapshotId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(SnapshotId)
    }
}

impl Serialize for SnapshotId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for SnapshotId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(IdVisitor("snapshot id")).map(SnapshotId)
    }
}

/// Visitor accepting a numeric id as u64, i64, or decimal string.
struct IdVisitor(&'static str);

impl<'de> de::Visitor<'de> for IdVisitor {
    type Value = u64;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a {} as a number or decimal string", self.0)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
        Ok(v)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
        u64::try_from(v).map_err(|_| E::custom(format!("negative {}: {v}", self.0)))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
        v.trim()
            .parse::<u64>()
            .map_err(|_| E::custom(format!("invalid {}: {v:?}", self.0)))
    }
}

/// Server lifecycle status as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Running,
    Initializing,
    Starting,
    Stopping,
    Off,
    Deleting,
    Rebuilding,
    Migrating,
    #[serde(other)]
    Unknown,
}

/// A managed compute resource, owned by the provider and read through its API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudServer {
    pub id: ResourceId,
    pub name: String,
    pub status: ServerStatus,
    /// Public IPv4 address, if assigned.
    pub public_ip: Option<String>,
    pub server_type: String,
    /// Cumulative inbound bytes since creation, when the provider reports it.
    pub ingoing_traffic: Option<u64>,
    /// Cumulative outbound bytes since creation, when the provider reports it.
    pub outgoing_traffic: Option<u64>,
}

/// A snapshot image, optionally tagged with the server it was created from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    #[serde(default)]
    pub description: String,
    pub created: DateTime<Utc>,
    pub created_from: Option<ResourceId>,
}

/// Bounded network time-series returned by the provider metrics API.
///
/// Samples are `(unix timestamp, bytes)` pairs; ordering is provider-defined
/// and irrelevant for summation.
#[derive(Debug, Clone, Default)]
pub struct NetworkSeries {
    pub inbound: Vec<(i64, f64)>,
    pub outbound: Vec<(i64, f64)>,
}

impl NetworkSeries {
    pub fn inbound_gib(&self) -> f64 {
        sum_gib(&self.inbound)
    }

    pub fn outbound_gib(&self) -> f64 {
        sum_gib(&self.outbound)
    }
}

fn sum_gib(samples: &[(i64, f64)]) -> f64 {
    samples.iter().map(|(_, v)| v).sum::<f64>() / GIB
}

/// Traffic usage for one server over the observation window.
#[derive(Debug, Clone, Serialize)]
pub struct TrafficUsage {
    pub inbound_gib: f64,
    pub outbound_gib: f64,
    pub total_gib: f64,
    /// Cumulative counters from the server detail, when available. These are
    /// authoritative for billing and preferred over the summed series.
    pub inbound_bytes: Option<u64>,
    pub outbound_bytes: Option<u64>,
}

impl TrafficUsage {
    pub fn new(series: &NetworkSeries, server: Option<&CloudServer>) -> Self {
        let inbound_gib = series.inbound_gib();
        let outbound_gib = series.outbound_gib();
        Self {
            inbound_gib,
            outbound_gib,
            total_gib: inbound_gib + outbound_gib,
            inbound_bytes: server.and_then(|s| s.ingoing_traffic),
            outbound_bytes: server.and_then(|s| s.outgoing_traffic),
        }
    }

    /// Traffic counted against the quota: the cumulative outbound counter
    /// when the provider reports one, otherwise the summed series total.
    pub fn billable_gib(&self) -> f64 {
        match self.outbound_bytes {
            Some(bytes) => bytes as f64 / GIB,
            None => self.total_gib,
        }
    }

    /// Usage as a percentage of the configured limit.
    pub fn usage_percent(&self, limit_gib: f64) -> f64 {
        if limit_gib <= 0.0 {
            return 0.0;
        }
        self.billable_gib() / limit_gib * 100.0
    }
}

/// Remediation action applied when a server exceeds its traffic quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    /// Report only, no mutation.
    Notify,
    /// Power the server off.
    Shutdown,
    /// Reimage in place from the latest snapshot created from this server.
    Rebuild,
    /// Destroy the server and recreate it from a snapshot.
    DeleteRebuild,
}

impl RemediationAction {
    /// Whether this action mutates provider state.
    pub fn is_destructive(&self) -> bool {
        !matches!(self, RemediationAction::Notify)
    }
}

impl fmt::Display for RemediationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RemediationAction::Notify => "notify",
            RemediationAction::Shutdown => "shutdown",
            RemediationAction::Rebuild => "rebuild",
            RemediationAction::DeleteRebuild => "delete_rebuild",
        };
        f.write_str(s)
    }
}

/// An alternate (server type, snapshot) pair tried only after the primary
/// creation profile fails entirely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackProfile {
    pub server_type: String,
    pub snapshot_id: SnapshotId,
}

/// Template describing how replacement servers are created.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerTemplate {
    pub server_type: Option<String>,
    pub location: Option<String>,
    #[serde(default)]
    pub ssh_keys: Vec<u64>,
    /// Prefix for generated names. Setting this disables the automatic
    /// retry under a fresh name after a primary create failure.
    pub name_prefix: Option<String>,
    #[serde(default = "default_use_original_name")]
    pub use_original_name: bool,
}

fn default_use_original_name() -> bool {
    true
}

/// Parameters for creating a server from a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateServerRequest {
    pub name: String,
    pub server_type: String,
    pub location: String,
    pub image: SnapshotId,
    pub ssh_keys: Vec<u64>,
}

/// Outcome of one remediation attempt. Transient: returned to callers and
/// reconciliation, never persisted.
#[derive(Debug, Clone)]
pub struct RemediationResult {
    pub success: bool,
    pub new_server_id: Option<ResourceId>,
    pub new_ip: Option<String>,
    /// Snapshot the replacement was actually created from.
    pub snapshot_id: Option<SnapshotId>,
    /// Server type the replacement was actually created with.
    pub server_type: Option<String>,
    /// 0-based index into the fallback list; `None` means the primary
    /// profile succeeded.
    pub fallback_index: Option<usize>,
    pub error: Option<crate::error::RemediationError>,
}

impl RemediationResult {
    /// A successful non-recreating action (notify, shutdown, rebuild).
    pub fn done() -> Self {
        Self {
            success: true,
            new_server_id: None,
            new_ip: None,
            snapshot_id: None,
            server_type: None,
            fallback_index: None,
            error: None,
        }
    }

    pub fn recreated(
        server: &CloudServer,
        snapshot_id: SnapshotId,
        fallback_index: Option<usize>,
    ) -> Self {
        Self {
            success: true,
            new_server_id: Some(server.id),
            new_ip: server.public_ip.clone(),
            snapshot_id: Some(snapshot_id),
            server_type: Some(server.server_type.clone()),
            fallback_index,
            error: None,
        }
    }

    pub fn failed(error: crate::error::RemediationError) -> Self {
        Self {
            success: false,
            new_server_id: None,
            new_ip: None,
            snapshot_id: None,
            server_type: None,
            fallback_index: None,
            error: Some(error),
        }
    }

    /// Whether the failure left the resource destroyed with no replacement.
    pub fn is_critical_failure(&self) -> bool {
        self.error.as_ref().map(|e| e.is_critical()).unwrap_or(false)
    }
}
