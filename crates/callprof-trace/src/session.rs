//! Profiling session.
//!
//! A session owns the channel to one consumer. `open` performs the
//! handshake on the calling thread, then a worker thread takes over: it
//! harvests the collector every `harvest_interval`, answers consumer
//! requests, and reports local clears. Channel failures never reach the
//! instrumented threads; they only cost snapshots, which are counted in the
//! diagnostics.
//!
//! State machine:
//!
//! ```text
//! Idle -> Open -> Active -> Closing -> Closed
//!           \_______________________/
//!              handshake failure
//! ```

use crate::codec::encode_limited;
use crate::collector::Collector;
use crate::config::{ConfigError, DeliveryPolicy, HarvestMode, SessionConfig};
use crate::hook::TerminationHook;
use crate::notify::{Subscription, lock};
use crate::protocol::{MAX_PAYLOAD_LEN, Message, PROTOCOL_VERSION, ProcessInfo, ProtocolError};
use crate::stats::StatisticsSnapshot;
use crate::transport::{Channel, SOCKET_ENV, TransportError, UnixChannel};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, no channel yet
    Idle,
    /// Handshake in progress
    Open,
    /// Worker running
    Active,
    /// Final harvest in progress
    Closing,
    Closed,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Consumer rejected the session (consumer protocol version {version})")]
    Rejected { version: u32 },

    #[error("Protocol version mismatch: ours {ours}, consumer's {theirs}")]
    VersionMismatch { ours: u32, theirs: u32 },

    #[error("No handshake reply within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Unexpected {0} during handshake")]
    UnexpectedMessage(&'static str),

    #[error("Session was already opened")]
    AlreadyOpened,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to start session worker: {0}")]
    Spawn(#[source] std::io::Error),
}

/// State shared between the session handle, its worker and termination hooks
struct Shared {
    state: Mutex<SessionState>,
    stop: AtomicBool,
    snapshot_requested: AtomicBool,
    cleared: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    done: Mutex<Option<Receiver<()>>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Idle),
            stop: AtomicBool::new(false),
            snapshot_requested: AtomicBool::new(false),
            cleared: AtomicBool::new(false),
            worker: Mutex::new(None),
            done: Mutex::new(None),
        }
    }

    fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    fn set_state(&self, next: SessionState) {
        let mut state = lock(&self.state);
        if *state != SessionState::Closed && *state != next {
            debug!("Session {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    /// Stop the worker and wait for it, at most `budget` if given.
    ///
    /// Returns whether the worker finished.
    fn shutdown(&self, budget: Option<Duration>) -> bool {
        self.stop.store(true, Ordering::SeqCst);

        let done = lock(&self.done).take();
        let Some(done) = done else {
            // Never opened, or already shut down
            if self.state() == SessionState::Idle {
                self.set_state(SessionState::Closed);
            }
            return self.state() == SessionState::Closed;
        };

        let finished = match budget {
            Some(budget) => !matches!(done.recv_timeout(budget), Err(RecvTimeoutError::Timeout)),
            None => {
                let _ = done.recv();
                true
            }
        };

        let worker = lock(&self.worker).take();
        if finished {
            if let Some(worker) = worker
                && worker.join().is_err()
            {
                warn!("Session worker panicked");
                self.set_state(SessionState::Closed);
            }
        } else {
            warn!(
                "Session did not finish its final snapshot within {:?}",
                budget.unwrap_or_default()
            );
        }
        finished
    }
}

/// Connection between a collector and one consumer
pub struct Session {
    collector: Arc<Collector>,
    config: SessionConfig,
    shared: Arc<Shared>,
}

impl Session {
    /// New idle session; nothing is sent until [`open`](Self::open)
    pub fn new(collector: Arc<Collector>, config: SessionConfig) -> Self {
        Self {
            collector,
            config,
            shared: Arc::new(Shared::new()),
        }
    }

    /// Connect to the consumer named by `CALLPROF_SOCKET` and open a session
    /// configured from the environment
    pub fn connect_from_env(collector: Arc<Collector>) -> Result<Self, SessionError> {
        let path = std::env::var_os(SOCKET_ENV).ok_or(ConfigError::Missing(SOCKET_ENV))?;
        let config = SessionConfig::from_env()?;
        let channel = UnixChannel::connect(Path::new(&path))?;
        info!("Connected to consumer at {}", Path::new(&path).display());

        let mut session = Self::new(collector, config);
        session.open(channel)?;
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    /// Handshake over `channel` and start the worker.
    ///
    /// On failure the session ends up `Closed`.
    pub fn open<C: Channel + 'static>(&mut self, mut channel: C) -> Result<(), SessionError> {
        if self.state() != SessionState::Idle {
            return Err(SessionError::AlreadyOpened);
        }
        self.shared.set_state(SessionState::Open);

        if let Err(e) = self.handshake(&mut channel) {
            warn!("Session handshake failed: {}", e);
            self.shared.set_state(SessionState::Closed);
            return Err(e);
        }

        let flag = Arc::clone(&self.shared);
        let clear_subscription = self
            .collector
            .aggregator()
            .subscribe_clear(move |_| flag.cleared.store(true, Ordering::SeqCst));

        let worker = Worker {
            collector: Arc::clone(&self.collector),
            channel: Box::new(channel),
            config: self.config.clone(),
            shared: Arc::clone(&self.shared),
            pending: VecDeque::new(),
            next_sequence: 1,
            peer_lost: false,
            _clear_subscription: clear_subscription,
        };

        let (done_tx, done_rx) = mpsc::channel();
        self.shared.set_state(SessionState::Active);
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("callprof-session".to_string())
            .spawn(move || {
                worker.run();
                shared.set_state(SessionState::Closed);
                let _ = done_tx.send(());
            });

        match spawned {
            Ok(handle) => {
                *lock(&self.shared.worker) = Some(handle);
                *lock(&self.shared.done) = Some(done_rx);
                info!("Session active");
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(SessionState::Closed);
                Err(SessionError::Spawn(e))
            }
        }
    }

    fn handshake(&self, channel: &mut dyn Channel) -> Result<(), SessionError> {
        let timeout = self.config.handshake_timeout;
        let deadline = Instant::now() + timeout;
        let process = ProcessInfo::current(self.collector.clock().ticks_per_second());

        channel
            .send(
                &Message::Handshake {
                    protocol_version: PROTOCOL_VERSION,
                    process,
                },
                timeout,
            )
            .map_err(|e| match e {
                TransportError::TimedOut => SessionError::HandshakeTimeout(timeout),
                e => e.into(),
            })?;

        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(SessionError::HandshakeTimeout(timeout));
            }
            match channel.recv(left)? {
                Some(Message::HandshakeAck {
                    accepted: false,
                    version,
                }) => return Err(SessionError::Rejected { version }),
                Some(Message::HandshakeAck { version, .. }) if version != PROTOCOL_VERSION => {
                    return Err(SessionError::VersionMismatch {
                        ours: PROTOCOL_VERSION,
                        theirs: version,
                    });
                }
                Some(Message::HandshakeAck { .. }) => return Ok(()),
                Some(other) => return Err(SessionError::UnexpectedMessage(other.kind())),
                None => {}
            }
        }
    }

    /// Ask the worker for a snapshot now instead of at the next tick
    pub fn request_snapshot(&self) {
        self.shared.snapshot_requested.store(true, Ordering::SeqCst);
    }

    /// Send a final snapshot and stop, waiting as long as it takes
    pub fn close(&self) {
        self.shared.shutdown(None);
    }

    /// Send a final snapshot and stop, waiting at most `budget`.
    ///
    /// Returns false if the worker was still busy when the budget ran out;
    /// it is left to finish on its own.
    pub fn shutdown(&self, budget: Duration) -> bool {
        self.shared.shutdown(Some(budget))
    }

    /// Flush a final snapshot when the process terminates, bounded by
    /// `final_flush_budget`
    pub fn install_termination_hook(&self, hook: &dyn TerminationHook) -> bool {
        let shared = Arc::clone(&self.shared);
        let budget = self.config.final_flush_budget;
        hook.install(Box::new(move || {
            shared.shutdown(Some(budget));
        }))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if matches!(
            self.state(),
            SessionState::Active | SessionState::Closing
        ) {
            self.shared.shutdown(Some(self.config.final_flush_budget));
        }
    }
}

/// Encoded snapshot on its way to the consumer
struct Outgoing {
    sequence: u64,
    message: Message,
    /// What an incremental harvest took from the aggregator
    taken: Option<Arc<StatisticsSnapshot>>,
}

struct Worker {
    collector: Arc<Collector>,
    channel: Box<dyn Channel>,
    config: SessionConfig,
    shared: Arc<Shared>,
    /// Snapshots waiting for the channel (buffering policy only)
    pending: VecDeque<Outgoing>,
    next_sequence: u64,
    /// The consumer is gone; keep harvesting but stop reading
    peer_lost: bool,
    _clear_subscription: Subscription,
}

impl Worker {
    fn run(mut self) {
        let interval = self.config.harvest_interval;
        let mut next_tick = Instant::now() + interval;

        loop {
            if self.shared.stop.load(Ordering::SeqCst) {
                debug!("Session closing on local request");
                self.shared.set_state(SessionState::Closing);
                self.harvest();
                break;
            }
            if self.shared.snapshot_requested.swap(false, Ordering::SeqCst) {
                self.harvest();
            }
            if self.shared.cleared.swap(false, Ordering::SeqCst) {
                self.discard_pending("statistics cleared");
                self.send_control(&Message::Cleared);
            }

            let now = Instant::now();
            if now >= next_tick {
                self.harvest();
                next_tick = now + interval;
                continue;
            }

            let wait = (next_tick - now).min(self.config.poll_interval);
            if self.peer_lost {
                std::thread::sleep(wait);
                continue;
            }
            match self.channel.recv(wait) {
                Ok(Some(message)) => {
                    if self.handle(message).is_break() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(TransportError::Protocol(ProtocolError::FrameTooLarge(len))) => {
                    warn!("Consumer sent a {} byte frame; stream is unusable", len);
                    self.peer_lost = true;
                }
                Err(TransportError::Protocol(e)) => {
                    warn!("Discarding unreadable control message: {}", e);
                }
                Err(TransportError::TimedOut) => {}
                Err(e) => {
                    warn!("Lost consumer ({}); further snapshots will be dropped", e);
                    self.peer_lost = true;
                }
            }
        }

        if !self.pending.is_empty() && !self.peer_lost {
            self.send_pending();
        }
        while let Some(outgoing) = self.pending.pop_front() {
            self.give_back(outgoing, "session ended");
        }
        if !self.peer_lost
            && let Err(e) = self.channel.flush(self.config.write_timeout)
        {
            warn!("Could not finish the last message: {}", e);
        }
        debug!("Session worker finished");
    }

    fn handle(&mut self, message: Message) -> ControlFlow<()> {
        debug!("Received {}", message.kind());
        match message {
            Message::SnapshotRequest => self.harvest(),
            Message::ClearRequest => {
                self.collector.flush();
                self.collector.aggregator().clear();
                // The Ack tells the consumer; no separate Cleared
                self.shared.cleared.store(false, Ordering::SeqCst);
                self.discard_pending("statistics cleared");
                self.send_control(&Message::Ack);
            }
            Message::CloseRequest => {
                self.shared.set_state(SessionState::Closing);
                self.harvest();
                self.send_control(&Message::Ack);
                return ControlFlow::Break(());
            }
            other => warn!("Ignoring unexpected {} from consumer", other.kind()),
        }
        ControlFlow::Continue(())
    }

    /// Flush thread buffers, take a snapshot and deliver it.
    ///
    /// In incremental mode an undelivered snapshot's calls go back to the
    /// aggregator, so the next harvest carries them.
    fn harvest(&mut self) {
        self.collector.flush();
        let aggregator = self.collector.aggregator();
        let (statistics, incremental) = match self.config.harvest_mode {
            HarvestMode::Incremental => (aggregator.take(), true),
            HarvestMode::Cumulative => (aggregator.snapshot(), false),
        };

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        debug!(
            "Harvested snapshot {} ({} functions)",
            sequence,
            statistics.len()
        );

        let payload = match encode_limited(&statistics, MAX_PAYLOAD_LEN) {
            Ok(payload) => payload,
            Err(e) => {
                // Handing these calls back would only grow the next harvest
                self.drop_snapshot(sequence, &e.to_string());
                return;
            }
        };
        let outgoing = Outgoing {
            sequence,
            message: Message::SnapshotResponse {
                sequence,
                incremental,
                diagnostics: self.collector.diagnostics().snapshot(),
                payload,
            },
            taken: incremental.then_some(statistics),
        };

        match self.config.delivery {
            DeliveryPolicy::Drop => {
                if let Err(e) = self.channel.send(&outgoing.message, self.config.write_timeout) {
                    self.give_back(outgoing, &e.to_string());
                }
            }
            DeliveryPolicy::Buffer { max_pending } => {
                self.pending.push_back(outgoing);
                self.send_pending();
                while self.pending.len() > max_pending {
                    if let Some(oldest) = self.pending.pop_front() {
                        self.give_back(oldest, "pending queue full");
                    }
                }
            }
        }
    }

    /// Send buffered snapshots oldest first until the channel pushes back
    fn send_pending(&mut self) {
        while let Some(outgoing) = self.pending.pop_front() {
            if let Err(e) = self.channel.send(&outgoing.message, self.config.write_timeout) {
                debug!("Deferring {} snapshots: {}", self.pending.len() + 1, e);
                self.pending.push_front(outgoing);
                break;
            }
        }
    }

    /// Drop every buffered snapshot without returning its calls
    fn discard_pending(&mut self, reason: &str) {
        while let Some(outgoing) = self.pending.pop_front() {
            self.drop_snapshot(outgoing.sequence, reason);
        }
    }

    /// Count a snapshot as dropped and return its calls to the aggregator
    fn give_back(&self, outgoing: Outgoing, reason: &str) {
        if let Some(taken) = &outgoing.taken {
            self.collector.aggregator().restore(taken);
        }
        self.drop_snapshot(outgoing.sequence, reason);
    }

    fn drop_snapshot(&self, sequence: u64, reason: &str) {
        self.collector.diagnostics().record_dropped_snapshot();
        if self.peer_lost {
            debug!("Dropped snapshot {}: {}", sequence, reason);
        } else {
            warn!("Dropped snapshot {}: {}", sequence, reason);
        }
    }

    fn send_control(&mut self, message: &Message) {
        if let Err(e) = self.channel.send(message, self.config.write_timeout) {
            warn!("Failed to send {}: {}", message.kind(), e);
        }
    }
}
