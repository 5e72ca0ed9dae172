//! Authoritative statistics map.
//!
//! All mutation goes through one mutex, so the map is never observed in a
//! torn state. The map lives behind an `Arc`: `snapshot()` hands out a
//! reference-counted copy under the lock, and the next writer clones the map
//! only if that copy is still alive (`Arc::make_mut`).

use crate::notify::{Subscribers, Subscription, lock};
use crate::stats::{CallDelta, StatisticsSnapshot, merge_snapshot};
use log::debug;
use std::sync::{Arc, Mutex};

/// Event sent to clear subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cleared;

/// Folds call deltas into the cumulative statistics map
pub struct Aggregator {
    statistics: Mutex<Arc<StatisticsSnapshot>>,
    on_clear: Subscribers<Cleared>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            statistics: Mutex::new(Arc::new(StatisticsSnapshot::new())),
            on_clear: Subscribers::new(),
        }
    }

    /// Apply one completed call
    pub fn apply(&self, delta: &CallDelta) {
        let mut statistics = lock(&self.statistics);
        apply_delta(Arc::make_mut(&mut statistics), delta);
    }

    /// Apply a drained buffer of deltas under a single lock acquisition
    pub fn apply_batch(&self, deltas: &[CallDelta]) {
        if deltas.is_empty() {
            return;
        }
        let mut statistics = lock(&self.statistics);
        let map = Arc::make_mut(&mut statistics);
        for delta in deltas {
            apply_delta(map, delta);
        }
    }

    /// Immutable copy of the current statistics
    pub fn snapshot(&self) -> Arc<StatisticsSnapshot> {
        Arc::clone(&lock(&self.statistics))
    }

    /// Replace the statistics with an empty map and notify clear subscribers.
    ///
    /// Snapshots taken earlier keep their contents.
    pub fn clear(&self) {
        {
            let mut statistics = lock(&self.statistics);
            *statistics = Arc::new(StatisticsSnapshot::new());
        }
        debug!("Statistics cleared");
        self.on_clear.notify(&Cleared);
    }

    /// Swap the statistics for an empty map and return what was accumulated.
    ///
    /// Used for incremental harvesting; clear subscribers are not notified.
    pub fn take(&self) -> Arc<StatisticsSnapshot> {
        let mut statistics = lock(&self.statistics);
        std::mem::replace(&mut *statistics, Arc::new(StatisticsSnapshot::new()))
    }

    /// Merge a harvested map back in, as if its calls had never been taken.
    ///
    /// Used when an incremental harvest could not be delivered.
    pub fn restore(&self, statistics: &StatisticsSnapshot) {
        if statistics.is_empty() {
            return;
        }
        let mut current = lock(&self.statistics);
        merge_snapshot(Arc::make_mut(&mut current), statistics);
    }

    /// Register for notifications when the statistics are cleared
    pub fn subscribe_clear<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Cleared) + Send + Sync + 'static,
    {
        self.on_clear.subscribe(callback)
    }

    /// Number of functions currently tracked
    pub fn function_count(&self) -> usize {
        lock(&self.statistics).len()
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Fold one delta into a statistics map.
///
/// The call's own counters and the edges it carries land in its own entry;
/// the caller only gets a count in `callers`. The caller's side of the edge
/// arrives with the caller's delta once it completes.
pub fn apply_delta(map: &mut StatisticsSnapshot, delta: &CallDelta) {
    let entry = map.entry(delta.function).or_default();
    entry.stats.add_call(delta);
    for (callee, stats) in &delta.callees {
        entry.callees.entry(*callee).or_default().merge(stats);
    }
    if let Some(caller) = delta.caller {
        let count = entry.callers.entry(caller).or_insert(0);
        *count = count.saturating_add(1);
    }
}
