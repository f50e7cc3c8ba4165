//! Threshold-crossing detection
//!
//! Tracks, per managed server, the highest usage percentage already
//! notified, so repeated polling of a still-exceeding server produces at
//! most one notification per threshold level. State survives restarts
//! through the injected store.

use crate::models::ResourceId;
use crate::store::StateStore;
use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Persistent monotonic threshold tracker.
///
/// The stored value for a server only grows until [`reset`](Self::reset) or
/// [`migrate`](Self::migrate) clears it.
pub struct ThresholdTracker {
    store: Arc<dyn StateStore>,
}

impl ThresholdTracker {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Record a usage observation against the configured warning thresholds.
    ///
    /// `thresholds` is an unordered set of percentages. The current level is
    /// the highest threshold at or below `usage_percent` (0 if none). Returns
    /// `Some(level)` only when that level exceeds the last persisted one for
    /// this server, persisting the new level in the same step.
    pub fn record_usage(
        &self,
        id: ResourceId,
        usage_percent: f64,
        thresholds: &[u32],
    ) -> Result<Option<u32>> {
        let mut sorted = thresholds.to_vec();
        sorted.sort_unstable();

        let mut current = 0u32;
        for threshold in sorted {
            if usage_percent >= threshold as f64 {
                current = threshold;
            }
        }

        let mut crossed = None;
        self.store.update(&mut |doc| {
            let last = doc
                .get(&id.key())
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32;
            if current > last {
                doc.insert(id.key(), json!(current));
                crossed = Some(current);
            }
        })?;

        if let Some(level) = crossed {
            debug!(server_id = %id, level, usage_percent, "New threshold crossed");
        }
        Ok(crossed)
    }

    /// Last notified threshold for a server (0 if never notified).
    pub fn last_notified(&self, id: ResourceId) -> u32 {
        self.store
            .get(&id.key())
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32
    }

    /// Start a server over at level 0.
    pub fn reset(&self, id: ResourceId) -> Result<()> {
        self.store.set(&id.key(), json!(0))
    }

    /// Drop a server's row entirely.
    pub fn forget(&self, id: ResourceId) -> Result<()> {
        self.store.remove(&id.key())
    }

    /// Move tracking from a destroyed server to its replacement: the old row
    /// is removed and the new identity starts clean. Idempotent.
    pub fn migrate(&self, old: ResourceId, new: ResourceId) -> Result<()> {
        self.store.update(&mut |doc| {
            doc.remove(&old.key());
            doc.insert(new.key(), json!(0));
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{JsonFileStore, MemoryStore};

    const THRESHOLDS: &[u32] = &[50, 80, 100];

    fn tracker() -> ThresholdTracker {
        ThresholdTracker::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn first_crossing_is_reported_once() {
        let tracker = tracker();
        let id = ResourceId(1);

        // 55% crosses 50 exactly once
        assert_eq!(tracker.record_usage(id, 55.0, THRESHOLDS).unwrap(), Some(50));
        // Still over 50 next cycle, no new crossing
        assert_eq!(tracker.record_usage(id, 58.0, THRESHOLDS).unwrap(), None);
        // Jump to 85% crosses 80
        assert_eq!(tracker.record_usage(id, 85.0, THRESHOLDS).unwrap(), Some(80));
    }

    #[test]
    fn skipped_levels_report_only_the_highest() {
        let tracker = tracker();
        let id = ResourceId(1);

        assert_eq!(
            tracker.record_usage(id, 101.0, THRESHOLDS).unwrap(),
            Some(100)
        );
        // Usage dropping back does not re-arm lower levels
        assert_eq!(tracker.record_usage(id, 85.0, THRESHOLDS).unwrap(), None);
        assert_eq!(tracker.last_notified(id), 100);
    }

    #[test]
    fn below_all_thresholds_reports_nothing() {
        let tracker = tracker();
        assert_eq!(
            tracker.record_usage(ResourceId(1), 10.0, THRESHOLDS).unwrap(),
            None
        );
        assert_eq!(tracker.last_notified(ResourceId(1)), 0);
    }

    #[test]
    fn unordered_threshold_sets_are_handled() {
        let tracker = tracker();
        assert_eq!(
            tracker
                .record_usage(ResourceId(1), 85.0, &[100, 50, 80])
                .unwrap(),
            Some(80)
        );
    }

    #[test]
    fn reset_rearms_all_levels() {
        let tracker = tracker();
        let id = ResourceId(1);

        tracker.record_usage(id, 85.0, THRESHOLDS).unwrap();
        tracker.reset(id).unwrap();

        assert_eq!(tracker.last_notified(id), 0);
        assert_eq!(tracker.record_usage(id, 55.0, THRESHOLDS).unwrap(), Some(50));
    }

    #[test]
    fn migrate_moves_tracking_to_new_identity() {
        let tracker = tracker();
        let old = ResourceId(1);
        let new = ResourceId(2);

        tracker.record_usage(old, 85.0, THRESHOLDS).unwrap();
        tracker.migrate(old, new).unwrap();

        assert_eq!(tracker.last_notified(old), 0);
        assert_eq!(tracker.last_notified(new), 0);
        // Migrating again changes nothing
        tracker.migrate(old, new).unwrap();
        assert_eq!(tracker.record_usage(new, 55.0, THRESHOLDS).unwrap(), Some(50));
    }

    #[test]
    fn servers_are_tracked_independently() {
        let tracker = tracker();

        assert_eq!(
            tracker.record_usage(ResourceId(1), 85.0, THRESHOLDS).unwrap(),
            Some(80)
        );
        assert_eq!(
            tracker.record_usage(ResourceId(2), 85.0, THRESHOLDS).unwrap(),
            Some(80)
        );
    }

    #[test]
    fn state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("thresholds.json");
        let id = ResourceId(7);

        {
            let tracker = ThresholdTracker::new(Arc::new(JsonFileStore::new(&path)));
            assert_eq!(tracker.record_usage(id, 55.0, THRESHOLDS).unwrap(), Some(50));
        }

        let tracker = ThresholdTracker::new(Arc::new(JsonFileStore::new(&path)));
        assert_eq!(tracker.last_notified(id), 50);
        assert_eq!(tracker.record_usage(id, 58.0, THRESHOLDS).unwrap(), None);
    }
}
