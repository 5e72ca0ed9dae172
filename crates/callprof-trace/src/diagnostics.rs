//! Loss counters exposed alongside the statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, shared between the collector and the session worker
#[derive(Debug, Default)]
pub struct Diagnostics {
    unbalanced_exits: AtomicU64,
    orphaned_frames: AtomicU64,
    dropped_events: AtomicU64,
    dropped_snapshots: AtomicU64,
}

/// Point-in-time copy of [`Diagnostics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    /// `exit` calls with no matching open frame
    pub unbalanced_exits: u64,
    /// Frames discarded while recovering from a non-local exit
    pub orphaned_frames: u64,
    /// Probe calls that could not be recorded at all
    pub dropped_events: u64,
    /// Harvested snapshots that never reached the consumer
    pub dropped_snapshots: u64,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_unbalanced_exit(&self) {
        self.unbalanced_exits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_orphaned_frames(&self, count: u64) {
        self.orphaned_frames.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dropped_event(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_snapshot(&self) {
        self.dropped_snapshots.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            unbalanced_exits: self.unbalanced_exits.load(Ordering::Relaxed),
            orphaned_frames: self.orphaned_frames.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            dropped_snapshots: self.dropped_snapshots.load(Ordering::Relaxed),
        }
    }
}

impl DiagnosticsSnapshot {
    /// True if any data was lost
    pub fn has_loss(&self) -> bool {
        self.unbalanced_exits > 0
            || self.orphaned_frames > 0
            || self.dropped_events > 0
            || self.dropped_snapshots > 0
    }
}
