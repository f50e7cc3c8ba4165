//! Deletion confirmation by polling
//!
//! The provider has no synchronous delete confirmation, so after a destroy
//! the engine polls the server until the API reports it gone, with
//! exponential backoff and a bounded timeout. A timeout is reported to the
//! caller, not treated as fatal: the create that follows may still succeed.

use crate::models::ResourceId;
use crate::provider::ComputeProvider;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Backoff/timeout settings for the deletion wait.
#[derive(Debug, Clone)]
pub struct WaitConfig {
    /// Delay before the first poll.
    pub initial_delay: Duration,
    /// Cap for the exponentially growing delay.
    pub max_delay: Duration,
    /// Total time budget before giving up.
    pub timeout: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Poll until the provider confirms the server is gone.
///
/// Returns `true` once the provider reports the server missing, `false` if
/// the time budget ran out first. Transient lookup errors count as "still
/// unknown" and keep polling.
pub async fn wait_until_deleted(
    provider: &dyn ComputeProvider,
    id: ResourceId,
    config: &WaitConfig,
) -> bool {
    let start = Instant::now();
    let mut delay = config.initial_delay;
    let mut attempts = 0u32;

    loop {
        tokio::time::sleep(delay).await;
        attempts += 1;

        match provider.get_server(id).await {
            Err(err) if err.is_not_found() => {
                debug!(server_id = %id, attempts, "Deletion confirmed");
                return true;
            }
            Ok(_) => {
                debug!(server_id = %id, attempts, "Server still present after delete");
            }
            Err(err) => {
                debug!(server_id = %id, attempts, error = %err, "Deletion check failed");
            }
        }

        if start.elapsed() >= config.timeout {
            warn!(
                server_id = %id,
                attempts,
                timeout_secs = config.timeout.as_secs(),
                "Gave up waiting for deletion confirmation"
            );
            return false;
        }

        delay = (delay * 2).min(config.max_delay);
    }
}
