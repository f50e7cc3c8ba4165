//! Error taxonomy for provider calls and remediation outcomes
//!
//! Provider errors classify by retryability at the capability boundary;
//! remediation errors classify by what (if anything) was mutated before the
//! failure, so callers can tell a safe precondition failure from a destroyed
//! resource with no replacement.

use crate::models::ResourceId;
use thiserror::Error;

/// Error returned by compute/DNS capability implementations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The addressed resource does not exist.
    #[error("resource not found")]
    NotFound,

    /// Network failure or 5xx; the same call may succeed later.
    #[error("transient provider error{}: {message}", fmt_status(.status))]
    Transient {
        status: Option<u16>,
        message: String,
    },

    /// 4xx or validation failure; retrying the same call is pointless.
    #[error("permanent provider error{}: {message}", fmt_status(.status))]
    Permanent {
        status: Option<u16>,
        message: String,
    },
}

fn fmt_status(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" ({code})"),
        None => String::new(),
    }
}

impl ProviderError {
    /// Classify an HTTP status code into the taxonomy.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            404 => ProviderError::NotFound,
            500..=599 | 429 => ProviderError::Transient {
                status: Some(status),
                message,
            },
            _ => ProviderError::Permanent {
                status: Some(status),
                message,
            },
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        ProviderError::Transient {
            status: None,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ProviderError::Permanent {
            status: None,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }
}

/// Structured outcome kinds for the remediation path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemediationError {
    /// The server no longer exists. Nothing was mutated.
    #[error("server {0} not found")]
    ResourceNotFound(ResourceId),

    /// No usable snapshot for the server. Nothing was mutated.
    #[error("no snapshot found for server {0}")]
    SnapshotNotFound(ResourceId),

    /// Transient provider failure outside the destructive sequence.
    #[error("transient provider error: {0}")]
    TransientApi(String),

    /// Permanent provider failure outside the destructive sequence.
    #[error("permanent provider error: {0}")]
    PermanentApi(String),

    /// Destroy failed; no create was attempted, the server still exists.
    #[error("destroy failed for server {id}: {reason}")]
    DestroyFailed { id: ResourceId, reason: String },

    /// The server was destroyed and every create attempt failed. The
    /// resource is gone with no replacement.
    #[error("server {id} destroyed, all {attempts} create attempts failed")]
    CreateFailedAfterFallbacks { id: ResourceId, attempts: usize },

    /// Required template fields are missing. Checked before any mutation.
    #[error("invalid remediation config: {0}")]
    ConfigInvalid(String),

    /// DNS update failed after the collaborator's retry policy. Non-fatal
    /// for reconciliation.
    #[error("DNS update failed for {record}: {reason}")]
    DnsUpdateFailed { record: String, reason: String },
}

impl RemediationError {
    /// Capacity/availability loss: the resource is gone with no replacement.
    pub fn is_critical(&self) -> bool {
        matches!(self, RemediationError::CreateFailedAfterFallbacks { .. })
    }

    /// Failed before any mutation occurred.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            RemediationError::ResourceNotFound(_)
                | RemediationError::SnapshotNotFound(_)
                | RemediationError::ConfigInvalid(_)
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, RemediationError::TransientApi(_))
    }

    /// Map a provider error encountered outside the destructive sequence.
    pub fn from_provider(err: ProviderError, id: ResourceId) -> Self {
        match err {
            ProviderError::NotFound => RemediationError::ResourceNotFound(id),
            ProviderError::Transient { .. } => RemediationError::TransientApi(err.to_string()),
            ProviderError::Permanent { .. } => RemediationError::PermanentApi(err.to_string()),
        }
    }
}
