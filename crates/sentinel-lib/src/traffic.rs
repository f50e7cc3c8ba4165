//! Traffic usage collection
//!
//! Combines the provider's bounded network time-series with the cumulative
//! byte counters from the server detail. The counters are authoritative for
//! billing when present; the series fills in when they are not.

use crate::error::ProviderError;
use crate::models::{ResourceId, TrafficUsage};
use crate::provider::ComputeProvider;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

/// Providers cap metric queries to this many days.
pub const MAX_RANGE_DAYS: i64 = 30;

/// Normalize a metrics range: swap an inverted pair and cap the span to the
/// provider limit (keeping the end fixed).
pub fn clamp_range(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let (start, end) = if end < start { (end, start) } else { (start, end) };
    let max_span = Duration::days(MAX_RANGE_DAYS);
    if end - start > max_span {
        (end - max_span, end)
    } else {
        (start, end)
    }
}

/// Fetch usage for one server over the trailing `days` window.
///
/// A failed server-detail read only costs the cumulative counters; the
/// series sums still produce a usable result.
pub async fn collect_usage(
    provider: &dyn ComputeProvider,
    id: ResourceId,
    days: i64,
) -> Result<TrafficUsage, ProviderError> {
    let end = Utc::now();
    let (start, end) = clamp_range(end - Duration::days(days.clamp(1, MAX_RANGE_DAYS)), end);

    let series = provider.network_series(id, start, end).await?;

    let server = match provider.get_server(id).await {
        Ok(server) => Some(server),
        Err(err) => {
            debug!(server_id = %id, error = %err, "Server detail unavailable, using series only");
            None
        }
    };

    Ok(TrafficUsage::new(&series, server.as_ref()))
}
