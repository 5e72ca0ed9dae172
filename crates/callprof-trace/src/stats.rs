//! Statistics model shared by the aggregator, the codec and consumers.

use std::collections::HashMap;

/// Opaque function identifier, stable for the lifetime of one session.
pub type Address = u64;

/// Per-callee statistics attributed to calls made from one function.
pub type CalleeMap = HashMap<Address, FunctionStatistics>;

/// Number of calls received from each caller.
pub type CallerMap = HashMap<Address, u64>;

/// Cumulative statistics for every function seen so far.
pub type StatisticsSnapshot = HashMap<Address, DetailedStatistics>;

/// Measurement produced by one completed call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallDelta {
    pub function: Address,
    pub caller: Option<Address>,
    pub exclusive_ticks: u64,
    pub inclusive_ticks: u64,
    pub reentrance_depth: u32,
    /// Calls this call made that have completed, one entry per callee.
    ///
    /// Edges travel with the caller's own delta so a function never shows
    /// callees before it has a completed call of its own.
    pub callees: Vec<(Address, FunctionStatistics)>,
}

/// Summary counters for one function (or one caller/callee edge).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionStatistics {
    pub times_called: u64,
    pub exclusive_time: u64,
    pub inclusive_time: u64,
    pub max_reentrance: u32,
    pub max_call_time: u64,
}

impl FunctionStatistics {
    /// Statistics for a single completed call
    pub fn from_delta(delta: &CallDelta) -> Self {
        Self {
            times_called: 1,
            exclusive_time: delta.exclusive_ticks,
            inclusive_time: delta.inclusive_ticks,
            max_reentrance: delta.reentrance_depth,
            max_call_time: delta.inclusive_ticks,
        }
    }

    /// Fold one completed call into these statistics
    pub fn add_call(&mut self, delta: &CallDelta) {
        self.merge(&Self::from_delta(delta));
    }

    /// Additive merge: counters are summed, maxima take the larger operand.
    ///
    /// Sums saturate instead of wrapping; the codec uses [`checked_merge`]
    /// where overflow has to be reported.
    ///
    /// [`checked_merge`]: FunctionStatistics::checked_merge
    pub fn merge(&mut self, other: &Self) {
        self.times_called = self.times_called.saturating_add(other.times_called);
        self.exclusive_time = self.exclusive_time.saturating_add(other.exclusive_time);
        self.inclusive_time = self.inclusive_time.saturating_add(other.inclusive_time);
        self.max_reentrance = self.max_reentrance.max(other.max_reentrance);
        self.max_call_time = self.max_call_time.max(other.max_call_time);
    }

    /// Merge result, or `None` if a summed counter would overflow `u64`
    pub fn checked_merge(&self, other: &Self) -> Option<Self> {
        Some(Self {
            times_called: self.times_called.checked_add(other.times_called)?,
            exclusive_time: self.exclusive_time.checked_add(other.exclusive_time)?,
            inclusive_time: self.inclusive_time.checked_add(other.inclusive_time)?,
            max_reentrance: self.max_reentrance.max(other.max_reentrance),
            max_call_time: self.max_call_time.max(other.max_call_time),
        })
    }
}

/// Function statistics plus its slice of the call graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailedStatistics {
    pub stats: FunctionStatistics,
    /// Calls made from this function, keyed by callee
    pub callees: CalleeMap,
    /// Calls received by this function, keyed by caller
    pub callers: CallerMap,
}

impl DetailedStatistics {
    /// Merge another entry into this one, recursing into the call graph maps
    pub fn merge(&mut self, other: &Self) {
        self.stats.merge(&other.stats);
        merge_callees(&mut self.callees, &other.callees);
        for (&caller, &count) in &other.callers {
            let slot = self.callers.entry(caller).or_insert(0);
            *slot = slot.saturating_add(count);
        }
    }

    /// Total calls made from this function into its callees
    pub fn outgoing_calls(&self) -> u64 {
        self.callees.values().map(|s| s.times_called).sum()
    }
}

/// Merge `source` callee statistics into `target`
pub fn merge_callees(target: &mut CalleeMap, source: &CalleeMap) {
    for (&callee, stats) in source {
        target.entry(callee).or_default().merge(stats);
    }
}

/// Merge a whole snapshot into `target` using the additive rule
pub fn merge_snapshot(target: &mut StatisticsSnapshot, source: &StatisticsSnapshot) {
    for (&address, entry) in source {
        target.entry(address).or_default().merge(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(calls: u64, excl: u64, incl: u64, reent: u32, max: u64) -> FunctionStatistics {
        FunctionStatistics {
            times_called: calls,
            exclusive_time: excl,
            inclusive_time: incl,
            max_reentrance: reent,
            max_call_time: max,
        }
    }

    #[test]
    fn test_merge_sums_counters_and_maxes_maxima() {
        let mut a = stats(17, 32123, 123123123, 2012, 2213);
        a.merge(&stats(1117, 3213, 1231123, 212, 112213));

        assert_eq!(a, stats(1134, 35336, 124354246, 2012, 112213));
    }

    #[test]
    fn test_add_call_uses_inclusive_as_call_time() {
        let mut s = FunctionStatistics::default();
        let delta = CallDelta {
            function: 1,
            caller: None,
            exclusive_ticks: 4,
            inclusive_ticks: 9,
            reentrance_depth: 1,
            callees: Vec::new(),
        };
        s.add_call(&delta);
        s.add_call(&CallDelta {
            inclusive_ticks: 3,
            exclusive_ticks: 3,
            ..delta
        });

        assert_eq!(s, stats(2, 7, 12, 1, 9));
    }

    #[test]
    fn test_checked_merge_reports_overflow() {
        let a = stats(u64::MAX, 0, 0, 1, 1);
        assert!(a.checked_merge(&stats(1, 0, 0, 1, 1)).is_none());
        assert_eq!(a.checked_merge(&stats(0, 5, 5, 3, 0)), Some(stats(u64::MAX, 5, 5, 3, 1)));
    }

    #[test]
    fn test_detailed_merge_recurses() {
        let mut a = DetailedStatistics::default();
        a.callees.insert(7, stats(1, 1, 1, 1, 1));
        a.callers.insert(3, 2);

        let mut b = DetailedStatistics::default();
        b.callees.insert(7, stats(2, 2, 2, 1, 2));
        b.callees.insert(8, stats(1, 5, 5, 1, 5));
        b.callers.insert(3, 1);
        b.callers.insert(4, 1);

        a.merge(&b);

        assert_eq!(a.callees[&7], stats(3, 3, 3, 1, 2));
        assert_eq!(a.callees[&8], stats(1, 5, 5, 1, 5));
        assert_eq!(a.callers[&3], 3);
        assert_eq!(a.callers[&4], 1);
        assert_eq!(a.outgoing_calls(), 4);
    }
}
