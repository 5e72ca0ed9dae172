//! Consumer-side view of the profiled process' statistics.

use callprof_trace::codec::merge_checked;
use callprof_trace::{
    Address, DecodeError, DetailedStatistics, DiagnosticsSnapshot, FunctionStatistics,
    ProcessInfo, StatisticsSnapshot, Subscribers, Subscription,
};

/// Change notification delivered to model subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelEvent {
    /// A snapshot was applied; `addresses` lists the functions it touched
    Updated {
        sequence: u64,
        addresses: Vec<Address>,
    },
    /// All statistics were dropped
    Cleared,
}

/// Running statistics of one session
pub struct ReadModel {
    process: ProcessInfo,
    statistics: StatisticsSnapshot,
    diagnostics: DiagnosticsSnapshot,
    last_sequence: Option<u64>,
    subscribers: Subscribers<ModelEvent>,
}

impl ReadModel {
    pub fn new(process: ProcessInfo) -> Self {
        Self {
            process,
            statistics: StatisticsSnapshot::new(),
            diagnostics: DiagnosticsSnapshot::default(),
            last_sequence: None,
            subscribers: Subscribers::new(),
        }
    }

    pub fn process(&self) -> &ProcessInfo {
        &self.process
    }

    pub fn statistics(&self) -> &StatisticsSnapshot {
        &self.statistics
    }

    /// Diagnostics reported with the latest snapshot
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    pub fn len(&self) -> usize {
        self.statistics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statistics.is_empty()
    }

    pub fn function(&self, address: Address) -> Option<FunctionView<'_>> {
        self.statistics
            .get(&address)
            .map(|entry| FunctionView::new(address, entry, self.process.ticks_per_second))
    }

    /// All functions, in no particular order
    pub fn functions(&self) -> impl Iterator<Item = FunctionView<'_>> {
        let tps = self.process.ticks_per_second;
        self.statistics
            .iter()
            .map(move |(&address, entry)| FunctionView::new(address, entry, tps))
    }

    /// Be told about updates and clears until the handle is dropped
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ModelEvent) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(callback)
    }

    /// Fold in a snapshot. Incremental snapshots merge, cumulative ones
    /// replace everything seen so far.
    ///
    /// On error the model is unchanged and nobody is notified.
    pub fn apply(
        &mut self,
        sequence: u64,
        incremental: bool,
        diagnostics: DiagnosticsSnapshot,
        snapshot: &StatisticsSnapshot,
    ) -> Result<(), DecodeError> {
        if incremental {
            merge_checked(&mut self.statistics, snapshot)?;
        } else {
            self.statistics = snapshot.clone();
        }
        self.diagnostics = diagnostics;
        self.last_sequence = Some(sequence);

        let mut addresses: Vec<Address> = snapshot.keys().copied().collect();
        addresses.sort_unstable();
        self.subscribers.notify(&ModelEvent::Updated {
            sequence,
            addresses,
        });
        Ok(())
    }

    pub fn clear(&mut self) {
        self.statistics.clear();
        self.subscribers.notify(&ModelEvent::Cleared);
    }
}

/// One function's statistics with times converted to seconds
#[derive(Debug, Clone, Copy)]
pub struct FunctionView<'a> {
    address: Address,
    entry: &'a DetailedStatistics,
    ticks_per_second: u64,
}

impl<'a> FunctionView<'a> {
    fn new(address: Address, entry: &'a DetailedStatistics, ticks_per_second: u64) -> Self {
        Self {
            address,
            entry,
            ticks_per_second,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn statistics(&self) -> &'a FunctionStatistics {
        &self.entry.stats
    }

    pub fn times_called(&self) -> u64 {
        self.entry.stats.times_called
    }

    pub fn max_reentrance(&self) -> u32 {
        self.entry.stats.max_reentrance
    }

    pub fn inclusive_seconds(&self) -> f64 {
        self.seconds(self.entry.stats.inclusive_time)
    }

    pub fn exclusive_seconds(&self) -> f64 {
        self.seconds(self.entry.stats.exclusive_time)
    }

    pub fn max_call_seconds(&self) -> f64 {
        self.seconds(self.entry.stats.max_call_time)
    }

    /// Mean inclusive time per call; `None` before the first completed call
    pub fn avg_inclusive_seconds(&self) -> Option<f64> {
        self.per_call(self.inclusive_seconds())
    }

    pub fn avg_exclusive_seconds(&self) -> Option<f64> {
        self.per_call(self.exclusive_seconds())
    }

    /// Functions called from this one, with per-edge statistics
    pub fn callees(&self) -> impl Iterator<Item = (Address, &'a FunctionStatistics)> + 'a {
        self.entry.callees.iter().map(|(&address, stats)| (address, stats))
    }

    /// Functions that called this one, with call counts
    pub fn callers(&self) -> impl Iterator<Item = (Address, u64)> + 'a {
        self.entry.callers.iter().map(|(&address, &calls)| (address, calls))
    }

    fn seconds(&self, ticks: u64) -> f64 {
        if self.ticks_per_second == 0 {
            return 0.0;
        }
        ticks as f64 / self.ticks_per_second as f64
    }

    fn per_call(&self, total: f64) -> Option<f64> {
        match self.entry.stats.times_called {
            0 => None,
            calls => Some(total / calls as f64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn process() -> ProcessInfo {
        ProcessInfo {
            pid: 77,
            executable: "/bin/app".to_string(),
            ticks_per_second: 1_000,
        }
    }

    fn snapshot(address: Address, calls: u64, inclusive: u64) -> StatisticsSnapshot {
        let mut snapshot = StatisticsSnapshot::new();
        snapshot.insert(
            address,
            DetailedStatistics {
                stats: FunctionStatistics {
                    times_called: calls,
                    exclusive_time: inclusive / 2,
                    inclusive_time: inclusive,
                    max_reentrance: 1,
                    max_call_time: inclusive,
                },
                ..Default::default()
            },
        );
        snapshot
    }

    fn recorder(model: &ReadModel) -> (Arc<Mutex<Vec<ModelEvent>>>, Subscription) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let subscription = model.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
        (events, subscription)
    }

    #[test]
    fn test_incremental_merges_and_notifies() {
        let mut model = ReadModel::new(process());
        let (events, _subscription) = recorder(&model);

        model
            .apply(1, true, DiagnosticsSnapshot::default(), &snapshot(5, 2, 400))
            .unwrap();
        model
            .apply(2, true, DiagnosticsSnapshot::default(), &snapshot(5, 1, 100))
            .unwrap();

        let view = model.function(5).unwrap();
        assert_eq!(view.times_called(), 3);
        assert_eq!(view.inclusive_seconds(), 0.5);
        assert_eq!(view.avg_inclusive_seconds(), Some(0.5 / 3.0));
        assert_eq!(model.last_sequence(), Some(2));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            ModelEvent::Updated {
                sequence: 2,
                addresses: vec![5]
            }
        );
    }

    #[test]
    fn test_cumulative_replaces() {
        let mut model = ReadModel::new(process());
        model
            .apply(1, false, DiagnosticsSnapshot::default(), &snapshot(5, 2, 400))
            .unwrap();
        model
            .apply(2, false, DiagnosticsSnapshot::default(), &snapshot(6, 1, 10))
            .unwrap();
        assert!(model.function(5).is_none());
        assert_eq!(model.function(6).unwrap().times_called(), 1);
    }

    #[test]
    fn test_clear_and_cancelled_subscription() {
        let mut model = ReadModel::new(process());
        let (events, subscription) = recorder(&model);
        let (silent, cancelled) = recorder(&model);
        cancelled.cancel();

        model
            .apply(1, true, DiagnosticsSnapshot::default(), &snapshot(1, 1, 1))
            .unwrap();
        model.clear();
        drop(subscription);
        model.clear();

        assert!(model.is_empty());
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], ModelEvent::Cleared);
        assert!(silent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_overflowing_merge_leaves_model_untouched() {
        let mut model = ReadModel::new(process());
        model
            .apply(1, true, DiagnosticsSnapshot::default(), &snapshot(9, u64::MAX, 10))
            .unwrap();
        let err = model
            .apply(2, true, DiagnosticsSnapshot::default(), &snapshot(9, 1, 10))
            .unwrap_err();
        assert_eq!(err, DecodeError::Overflow { address: 9 });
        assert_eq!(model.function(9).unwrap().times_called(), u64::MAX);
        assert_eq!(model.last_sequence(), Some(1));
    }

    #[test]
    fn test_uncalled_function_has_no_average() {
        let mut model = ReadModel::new(process());
        model
            .apply(1, true, DiagnosticsSnapshot::default(), &snapshot(3, 0, 0))
            .unwrap();
        assert_eq!(model.function(3).unwrap().avg_exclusive_seconds(), None);
    }
}
