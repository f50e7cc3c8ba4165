//! Outbound notification channel
//!
//! Remediation and monitoring publish events onto a bounded channel; a
//! background worker renders them to text and hands them to the configured
//! sink. Publishing never blocks and never fails the caller: a full or
//! closed channel drops the event with a warning, and sink delivery errors
//! are logged and discarded.

use crate::error::RemediationError;
use crate::models::{RemediationAction, ResourceId, SnapshotId};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Events published by the monitoring/remediation core.
#[derive(Debug, Clone)]
pub enum Notification {
    ThresholdCrossed {
        server_name: String,
        server_id: ResourceId,
        threshold: u32,
        usage_percent: f64,
        limit_gib: f64,
    },
    TrafficExceeded {
        server_name: String,
        server_id: ResourceId,
        usage_gib: f64,
        limit_gib: f64,
        action: RemediationAction,
        whitelisted: bool,
    },
    RebuildSucceeded {
        old_id: ResourceId,
        new_id: ResourceId,
        new_ip: Option<String>,
        snapshot_id: Option<SnapshotId>,
        server_type: Option<String>,
    },
    RebuildFailed {
        server_id: ResourceId,
        server_name: String,
        error: RemediationError,
    },
    DnsUpdated {
        record: String,
        ip: String,
    },
    DnsUpdateFailed {
        record: String,
        ip: String,
        reason: String,
    },
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::ThresholdCrossed {
                server_name,
                server_id,
                threshold,
                usage_percent,
                limit_gib,
            } => write!(
                f,
                "Traffic warning: {server_name} (id {server_id}) reached {threshold}% of its \
                 {limit_gib:.0} GiB limit (now {usage_percent:.1}%)"
            ),
            Notification::TrafficExceeded {
                server_name,
                server_id,
                usage_gib,
                limit_gib,
                action,
                whitelisted,
            } => {
                if *whitelisted {
                    write!(
                        f,
                        "Traffic exceeded: {server_name} (id {server_id}) used {usage_gib:.2} GiB \
                         of {limit_gib:.0} GiB, whitelisted, no action taken"
                    )
                } else {
                    write!(
                        f,
                        "Traffic exceeded: {server_name} (id {server_id}) used {usage_gib:.2} GiB \
                         of {limit_gib:.0} GiB, applying action {action}"
                    )
                }
            }
            Notification::RebuildSucceeded {
                old_id,
                new_id,
                new_ip,
                snapshot_id,
                server_type,
            } => {
                write!(f, "Server {old_id} recreated as {new_id}")?;
                if let Some(ip) = new_ip {
                    write!(f, ", ip {ip}")?;
                }
                if let Some(snapshot) = snapshot_id {
                    write!(f, ", snapshot {snapshot}")?;
                }
                if let Some(kind) = server_type {
                    write!(f, ", type {kind}")?;
                }
                Ok(())
            }
            Notification::RebuildFailed {
                server_id,
                server_name,
                error,
            } => {
                if error.is_critical() {
                    write!(
                        f,
                        "CRITICAL: {server_name} (id {server_id}) was destroyed and no \
                         replacement could be created: {error}"
                    )
                } else {
                    write!(f, "Remediation failed for {server_name} (id {server_id}): {error}")
                }
            }
            Notification::DnsUpdated { record, ip } => {
                write!(f, "DNS updated: {record} -> {ip}")
            }
            Notification::DnsUpdateFailed { record, ip, reason } => {
                write!(f, "DNS update failed: {record} -> {ip} ({reason})")
            }
        }
    }
}

/// Destination for rendered notification text. Delivery is fire-and-forget
/// from the core's perspective.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, text: &str) -> anyhow::Result<()>;
}

/// Sink that writes notifications to the log. Used when no external sink is
/// wired up.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, text: &str) -> anyhow::Result<()> {
        info!(notification = text, "Notification");
        Ok(())
    }
}

/// Cheap cloneable publishing handle.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Notification>,
}

impl Notifier {
    /// Create a notifier and the receiving end for a worker.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Notifier whose events go nowhere. Useful in tests and embedders that
    /// do not deliver notifications.
    pub fn disabled() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { tx }
    }

    /// Publish an event. Never blocks; a full or closed channel drops the
    /// event with a warning.
    pub fn publish(&self, notification: Notification) {
        if let Err(err) = self.tx.try_send(notification) {
            warn!(error = %err, "Dropping notification, channel unavailable");
        }
    }
}

/// Drain the channel into the sink until all senders are gone.
pub fn spawn_worker(
    mut rx: mpsc::Receiver<Notification>,
    sink: Arc<dyn NotificationSink>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            let text = notification.to_string();
            if let Err(err) = sink.deliver(&text).await {
                warn!(error = %err, notification = %text, "Notification delivery failed");
            }
        }
    })
}
