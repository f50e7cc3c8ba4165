//! Remediation actions for quota-exceeding servers
//!
//! The destroy-and-recreate path is deliberately conservative: every
//! precondition is checked before the first mutation, a failed destroy
//! aborts before any create, and once the server is gone the workflow runs
//! to completion or reports the server as lost. A per-server lock
//! serializes remediation against any other mutating path in the process.

use crate::error::RemediationError;
use crate::mappings::MappingRegistry;
use crate::models::{
    CloudServer, CreateServerRequest, FallbackProfile, RemediationAction, RemediationResult,
    ResourceId, ServerTemplate,
};
use crate::provider::{latest_snapshot_for, ComputeProvider};
use crate::remediation::wait::{wait_until_deleted, WaitConfig};
use chrono::Utc;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Settings governing how replacements are created.
#[derive(Debug, Clone, Default)]
pub struct RemediationPolicy {
    pub template: ServerTemplate,
    /// Tried in order only after the primary profile fails entirely.
    pub fallbacks: Vec<FallbackProfile>,
    pub delete_wait: WaitConfig,
}

/// Workflow phase, surfaced in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Evaluating,
    NoAction,
    Remediating,
    Success,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Evaluating => "evaluating",
            Phase::NoAction => "no_action",
            Phase::Remediating => "remediating",
            Phase::Success => "success",
            Phase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Executes configured remediation actions against the compute provider.
pub struct RemediationEngine {
    provider: Arc<dyn ComputeProvider>,
    mappings: Arc<MappingRegistry>,
    locks: DashMap<ResourceId, Arc<Mutex<()>>>,
}

impl RemediationEngine {
    pub fn new(provider: Arc<dyn ComputeProvider>, mappings: Arc<MappingRegistry>) -> Self {
        Self {
            provider,
            mappings,
            locks: DashMap::new(),
        }
    }

    /// Advisory lock for one server. Scheduled bulk jobs and
    /// threshold-triggered remediation share it, so a server is never
    /// mutated from two paths at once.
    pub fn lock_for(&self, id: ResourceId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run one remediation action. All failures come back as structured
    /// results; nothing on the destructive path is silently swallowed.
    pub async fn execute(
        &self,
        server: &CloudServer,
        action: RemediationAction,
        policy: &RemediationPolicy,
    ) -> RemediationResult {
        let lock = self.lock_for(server.id);
        let _guard = lock.lock().await;

        debug!(server_id = %server.id, %action, phase = %Phase::Evaluating, "Remediation starting");

        let result = match action {
            RemediationAction::Notify => {
                debug!(server_id = %server.id, phase = %Phase::NoAction, "Notify only");
                RemediationResult::done()
            }
            RemediationAction::Shutdown => self.shutdown(server).await,
            RemediationAction::Rebuild => self.rebuild_in_place(server).await,
            RemediationAction::DeleteRebuild => match validate_template(&policy.template) {
                Ok((server_type, location)) => {
                    self.delete_rebuild(server, policy, server_type, location).await
                }
                Err(err) => RemediationResult::failed(err),
            },
        };

        if result.success {
            debug!(server_id = %server.id, %action, phase = %Phase::Success, "Remediation finished");
        } else {
            warn!(
                server_id = %server.id,
                %action,
                phase = %Phase::Failed,
                error = %result.error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                "Remediation failed"
            );
        }
        result
    }

    async fn shutdown(&self, server: &CloudServer) -> RemediationResult {
        warn!(server_id = %server.id, name = %server.name, "Powering off server over quota");
        match self.provider.power_off(server.id).await {
            Ok(()) => RemediationResult::done(),
            Err(err) => {
                RemediationResult::failed(RemediationError::from_provider(err, server.id))
            }
        }
    }

    /// Reimage in place from the latest snapshot created from this server.
    async fn rebuild_in_place(&self, server: &CloudServer) -> RemediationResult {
        let snapshots = match self.provider.list_snapshots().await {
            Ok(snapshots) => snapshots,
            Err(err) => {
                return RemediationResult::failed(RemediationError::from_provider(err, server.id))
            }
        };
        let snapshot = match latest_snapshot_for(&snapshots, server.id) {
            Some(snapshot) => snapshot.id,
            None => {
                return RemediationResult::failed(RemediationError::SnapshotNotFound(server.id))
            }
        };

        warn!(server_id = %server.id, snapshot = %snapshot, "Rebuilding server in place");
        match self.provider.rebuild_server(server.id, snapshot).await {
            Ok(()) => RemediationResult {
                snapshot_id: Some(snapshot),
                ..RemediationResult::done()
            },
            Err(err) => {
                RemediationResult::failed(RemediationError::from_provider(err, server.id))
            }
        }
    }

    /// Destroy the server and recreate it from a snapshot.
    async fn delete_rebuild(
        &self,
        server: &CloudServer,
        policy: &RemediationPolicy,
        server_type: &str,
        location: &str,
    ) -> RemediationResult {
        let id = server.id;
        let template = &policy.template;

        // Resolve the snapshot first: an explicit override wins, otherwise
        // the most recent snapshot created from this server.
        let snapshot_id = match self.mappings.snapshot_override(id) {
            Some(snapshot) => snapshot,
            None => {
                let snapshots = match self.provider.list_snapshots().await {
                    Ok(snapshots) => snapshots,
                    Err(err) => {
                        return RemediationResult::failed(RemediationError::from_provider(err, id))
                    }
                };
                match latest_snapshot_for(&snapshots, id) {
                    Some(snapshot) => snapshot.id,
                    None => {
                        return RemediationResult::failed(RemediationError::SnapshotNotFound(id))
                    }
                }
            }
        };

        // Fresh read: the server must still exist, and its current name
        // seeds the replacement's name. No mutation has happened yet.
        let current = match self.provider.get_server(id).await {
            Ok(server) => server,
            Err(err) if err.is_not_found() => {
                return RemediationResult::failed(RemediationError::ResourceNotFound(id))
            }
            Err(err) => {
                return RemediationResult::failed(RemediationError::from_provider(err, id))
            }
        };

        let name = if template.use_original_name && !current.name.is_empty() {
            current.name.clone()
        } else {
            generated_name(template.name_prefix.as_deref())
        };

        warn!(
            server_id = %id,
            name = %current.name,
            snapshot = %snapshot_id,
            phase = %Phase::Remediating,
            "Destroying server for recreation"
        );

        if let Err(err) = self.provider.delete_server(id).await {
            // Nothing was created; aborting here cannot leave duplicates.
            return RemediationResult::failed(RemediationError::DestroyFailed {
                id,
                reason: err.to_string(),
            });
        }

        if !wait_until_deleted(self.provider.as_ref(), id, &policy.delete_wait).await {
            warn!(server_id = %id, "Proceeding to create without deletion confirmation");
        }

        let mut attempts = 0usize;
        let request = CreateServerRequest {
            name: name.clone(),
            server_type: server_type.to_string(),
            location: location.to_string(),
            image: snapshot_id,
            ssh_keys: template.ssh_keys.clone(),
        };

        attempts += 1;
        match self.provider.create_server(&request).await {
            Ok(created) => {
                warn!(new_id = %created.id, name = %created.name, "Replacement server created");
                return RemediationResult::recreated(&created, snapshot_id, None);
            }
            Err(err) => {
                warn!(server_id = %id, error = %err, "Primary create failed");
            }
        }

        // The original name may still be held by the half-released server.
        // Without an explicit prefix override, retry once under a fresh
        // generated name before falling back.
        if template.name_prefix.is_none() {
            let retry = CreateServerRequest {
                name: generated_name(None),
                ..request.clone()
            };
            attempts += 1;
            match self.provider.create_server(&retry).await {
                Ok(created) => {
                    warn!(new_id = %created.id, name = %created.name, "Replacement server created under generated name");
                    return RemediationResult::recreated(&created, snapshot_id, None);
                }
                Err(err) => {
                    warn!(server_id = %id, error = %err, "Create under generated name failed");
                }
            }
        }

        for (index, fallback) in policy.fallbacks.iter().enumerate() {
            warn!(
                server_id = %id,
                fallback_type = %fallback.server_type,
                fallback_snapshot = %fallback.snapshot_id,
                index,
                "Trying fallback profile"
            );
            let request = CreateServerRequest {
                name: name.clone(),
                server_type: fallback.server_type.clone(),
                location: location.to_string(),
                image: fallback.snapshot_id,
                ssh_keys: template.ssh_keys.clone(),
            };
            attempts += 1;
            match self.provider.create_server(&request).await {
                Ok(created) => {
                    warn!(new_id = %created.id, name = %created.name, index, "Fallback profile succeeded");
                    return RemediationResult::recreated(&created, fallback.snapshot_id, Some(index));
                }
                Err(err) => {
                    warn!(server_id = %id, index, error = %err, "Fallback create failed");
                }
            }
        }

        error!(
            server_id = %id,
            attempts,
            "Server destroyed and no replacement could be created"
        );
        RemediationResult::failed(RemediationError::CreateFailedAfterFallbacks { id, attempts })
    }
}

fn validate_template(template: &ServerTemplate) -> Result<(&str, &str), RemediationError> {
    let server_type = template
        .server_type
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            RemediationError::ConfigInvalid("server_template.server_type is required".to_string())
        })?;
    let location = template
        .location
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            RemediationError::ConfigInvalid("server_template.location is required".to_string())
        })?;
    Ok((server_type, location))
}

fn generated_name(prefix: Option<&str>) -> String {
    format!(
        "{}{}",
        prefix.unwrap_or("auto-"),
        Utc::now().format("%Y%m%d%H%M%S")
    )
}
