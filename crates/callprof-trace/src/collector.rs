//! Per-thread call capture.
//!
//! Every thread gets its own shadow call stack and its own delta buffer. The
//! stack is only ever touched by its thread. The buffer is shared with the
//! collector so the session worker can drain it; the owning thread is the only
//! producer, so its lock is uncontended except while a drain is in progress.

use crate::aggregator::Aggregator;
use crate::clock::{Clock, MonotonicClock};
use crate::diagnostics::Diagnostics;
use crate::notify::lock;
use crate::stats::{Address, CallDelta, FunctionStatistics};
use log::debug;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Frames reserved per thread up front
pub const DEFAULT_STACK_RESERVE: usize = 256;

/// Buffered deltas that make a thread flush on its own
pub const DEFAULT_FLUSH_THRESHOLD: usize = 4096;

static NEXT_COLLECTOR_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// One trace per collector this thread has reported to
    static TRACES: RefCell<Vec<ThreadTrace>> = const { RefCell::new(Vec::new()) };
}

/// Collector tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorConfig {
    /// Shadow stack frames reserved when a thread first reports
    pub stack_reserve: usize,
    /// A thread hands its deltas to the aggregator once this many are buffered
    pub flush_threshold: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            stack_reserve: DEFAULT_STACK_RESERVE,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        }
    }
}

/// Shadow stack frame
#[derive(Debug, Clone)]
struct Frame {
    address: Address,
    entry_timestamp: u64,
    child_time: u64,
    /// Completed calls made from this frame, folded per callee
    callees: Vec<(Address, FunctionStatistics)>,
}

/// Deltas waiting to be applied, shared between a thread and the collector
#[derive(Debug, Default)]
struct ThreadBuffer {
    deltas: Mutex<Vec<CallDelta>>,
}

/// Thread-local state for one collector
struct ThreadTrace {
    collector_id: u64,
    stack: Vec<Frame>,
    /// Open frames per address, for reentrance depth
    active: HashMap<Address, u32>,
    buffer: Arc<ThreadBuffer>,
}

/// Result of popping the shadow stack
enum Exit {
    Completed { delta: CallDelta, orphaned: u64 },
    Unbalanced,
}

impl ThreadTrace {
    fn push(&mut self, address: Address, now: u64) {
        self.stack.push(Frame {
            address,
            entry_timestamp: now,
            child_time: 0,
            callees: Vec::new(),
        });
        *self.active.entry(address).or_insert(0) += 1;
    }

    fn pop(&mut self, address: Address, now: u64) -> Exit {
        let Some(index) = self.stack.iter().rposition(|f| f.address == address) else {
            return Exit::Unbalanced;
        };

        // Frames above the match were left by a non-local exit. Their time
        // stays inside the matched frame's exclusive time and their pending
        // callee edges go with them.
        let orphaned = (self.stack.len() - 1 - index) as u64;
        for frame in self.stack.drain(index + 1..) {
            release(&mut self.active, frame.address);
        }

        let Some(frame) = self.stack.pop() else {
            return Exit::Unbalanced;
        };
        let reentrance_depth = self.active.get(&address).copied().unwrap_or(1);
        release(&mut self.active, address);

        let call_time = now.saturating_sub(frame.entry_timestamp);
        let exclusive = call_time.saturating_sub(frame.child_time);
        let delta = CallDelta {
            function: address,
            caller: None,
            exclusive_ticks: exclusive,
            inclusive_ticks: call_time,
            reentrance_depth,
            callees: frame.callees,
        };

        let caller = self.stack.last_mut().map(|parent| {
            parent.child_time = parent.child_time.saturating_add(call_time);
            let edge = FunctionStatistics::from_delta(&delta);
            match parent.callees.iter_mut().find(|(callee, _)| *callee == address) {
                Some((_, stats)) => stats.merge(&edge),
                None => parent.callees.push((address, edge)),
            }
            parent.address
        });

        Exit::Completed {
            delta: CallDelta { caller, ..delta },
            orphaned,
        }
    }
}

fn release(active: &mut HashMap<Address, u32>, address: Address) {
    if let Some(count) = active.get_mut(&address) {
        *count -= 1;
        if *count == 0 {
            active.remove(&address);
        }
    }
}

/// Converts `enter`/`exit` hooks into call deltas.
///
/// `enter` and `exit` can be called from any thread, never block on I/O and
/// never panic; anything that cannot be recorded is counted in
/// [`Diagnostics`] instead.
pub struct Collector {
    id: u64,
    aggregator: Arc<Aggregator>,
    clock: Arc<dyn Clock>,
    diagnostics: Arc<Diagnostics>,
    config: CollectorConfig,
    buffers: Mutex<Vec<Arc<ThreadBuffer>>>,
}

impl Collector {
    pub fn new(aggregator: Arc<Aggregator>, clock: Arc<dyn Clock>, config: CollectorConfig) -> Self {
        Self {
            id: NEXT_COLLECTOR_ID.fetch_add(1, Ordering::Relaxed),
            aggregator,
            clock,
            diagnostics: Arc::new(Diagnostics::new()),
            config,
            buffers: Mutex::new(Vec::new()),
        }
    }

    /// Collector with a fresh aggregator and a nanosecond clock
    pub fn with_defaults() -> Self {
        Self::new(
            Arc::new(Aggregator::new()),
            Arc::new(MonotonicClock::new()),
            CollectorConfig::default(),
        )
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    /// Record entry into `address` on the calling thread
    #[inline]
    pub fn enter(&self, address: Address) {
        let recorded = TRACES
            .try_with(|traces| {
                let Ok(mut traces) = traces.try_borrow_mut() else {
                    return false;
                };
                let now = self.clock.now();
                self.thread_trace(&mut traces).push(address, now);
                true
            })
            .unwrap_or(false);

        if !recorded {
            self.diagnostics.record_dropped_event();
        }
    }

    /// Record exit from `address` on the calling thread
    #[inline]
    pub fn exit(&self, address: Address) {
        let now = self.clock.now();
        let outcome = TRACES
            .try_with(|traces| {
                let Ok(mut traces) = traces.try_borrow_mut() else {
                    return None;
                };
                let trace = self.thread_trace(&mut traces);
                let exit = trace.pop(address, now);
                Some((exit, Arc::clone(&trace.buffer)))
            })
            .ok()
            .flatten();

        match outcome {
            Some((Exit::Completed { delta, orphaned }, buffer)) => {
                if orphaned > 0 {
                    self.diagnostics.record_orphaned_frames(orphaned);
                }
                self.buffer_delta(&buffer, delta);
            }
            Some((Exit::Unbalanced, _)) => self.diagnostics.record_unbalanced_exit(),
            None => self.diagnostics.record_dropped_event(),
        }
    }

    /// Enter `address` and exit it when the returned guard drops, including
    /// during unwinding
    pub fn scope(&self, address: Address) -> CallGuard<'_> {
        self.enter(address);
        CallGuard {
            collector: self,
            address,
        }
    }

    /// Drain every thread's buffered deltas into the aggregator.
    ///
    /// Returns the number of deltas applied. Buffers of threads that have
    /// exited are dropped once drained.
    pub fn flush(&self) -> usize {
        let mut buffers = lock(&self.buffers);
        let mut applied = 0;
        buffers.retain(|buffer| {
            let mut deltas = lock(&buffer.deltas);
            applied += deltas.len();
            self.aggregator.apply_batch(&deltas);
            deltas.clear();
            // The thread-local side holds the other reference while its
            // thread lives. Checked under the buffer lock, so a thread that
            // is gone cannot have pushed after the drain.
            Arc::strong_count(buffer) > 1
        });
        if applied > 0 {
            debug!("Flushed {} call deltas from {} threads", applied, buffers.len());
        }
        applied
    }

    /// Number of threads with a registered buffer
    pub fn thread_count(&self) -> usize {
        lock(&self.buffers).len()
    }

    /// Applies under the buffer lock so one thread's deltas reach the
    /// aggregator in completion order even when a drain runs concurrently
    fn buffer_delta(&self, buffer: &ThreadBuffer, delta: CallDelta) {
        let mut deltas = lock(&buffer.deltas);
        deltas.push(delta);
        if deltas.len() >= self.config.flush_threshold {
            self.aggregator.apply_batch(&deltas);
            deltas.clear();
        }
    }

    fn thread_trace<'t>(&self, traces: &'t mut Vec<ThreadTrace>) -> &'t mut ThreadTrace {
        let index = match traces.iter().position(|t| t.collector_id == self.id) {
            Some(index) => index,
            None => {
                // Forget traces of collectors that no longer exist
                traces.retain(|t| Arc::strong_count(&t.buffer) > 1);

                let buffer = Arc::new(ThreadBuffer::default());
                lock(&self.buffers).push(Arc::clone(&buffer));
                traces.push(ThreadTrace {
                    collector_id: self.id,
                    stack: Vec::with_capacity(self.config.stack_reserve),
                    active: HashMap::new(),
                    buffer,
                });
                traces.len() - 1
            }
        };
        &mut traces[index]
    }
}

/// RAII guard returned by [`Collector::scope`]
#[must_use = "dropping the guard immediately records an empty call"]
pub struct CallGuard<'a> {
    collector: &'a Collector,
    address: Address,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.collector.exit(self.address);
    }
}
