//! Consumer end of a profiling session.

use crate::error::{Error, Result};
use crate::model::ReadModel;
use callprof_trace::{
    Channel, DecodeError, DiagnosticsSnapshot, Message, PROTOCOL_VERSION, ProcessInfo,
    StatisticsSnapshot, decode_snapshot,
};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// What a call to [`Frontend::poll`] observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A snapshot was applied to the model
    Snapshot {
        sequence: u64,
        incremental: bool,
        diagnostics: DiagnosticsSnapshot,
        statistics: StatisticsSnapshot,
    },
    /// A snapshot could not be applied and was skipped
    Discarded { sequence: u64, error: DecodeError },
    /// Statistics were cleared, on our request or by the profiled process
    Cleared,
    /// The profiled process acknowledged our close request
    Closed,
}

/// Requests that the profiled process answers with `Ack`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Clear,
    Close,
}

pub struct Frontend<C: Channel> {
    channel: C,
    model: ReadModel,
    write_timeout: Duration,
    awaiting_ack: VecDeque<Pending>,
    last_sequence: Option<u64>,
    decode_errors: u64,
    missed_snapshots: u64,
    closed: bool,
}

impl<C: Channel> Frontend<C> {
    /// Wait for the profiled process to introduce itself and answer it.
    ///
    /// A protocol version other than ours is rejected with
    /// `HandshakeAck { accepted: false }` and an error.
    pub fn accept_handshake(mut channel: C, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        let (protocol_version, process) = loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(Error::Handshake(format!(
                    "no handshake within {}",
                    humantime::format_duration(timeout)
                )));
            }
            match channel.recv(left)? {
                Some(Message::Handshake {
                    protocol_version,
                    process,
                }) => break (protocol_version, process),
                Some(other) => {
                    return Err(Error::Handshake(format!(
                        "expected Handshake, got {}",
                        other.kind()
                    )));
                }
                None => {}
            }
        };

        let accepted = protocol_version == PROTOCOL_VERSION;
        channel.send(
            &Message::HandshakeAck {
                accepted,
                version: PROTOCOL_VERSION,
            },
            timeout,
        )?;
        if !accepted {
            return Err(Error::Handshake(format!(
                "{} (PID {}) speaks protocol version {}, expected {}",
                process.name(),
                process.pid,
                protocol_version,
                PROTOCOL_VERSION
            )));
        }

        info!(
            "Session accepted: {} (PID {}, {} ticks/s)",
            process.name(),
            process.pid,
            process.ticks_per_second
        );
        Ok(Self {
            channel,
            model: ReadModel::new(process),
            write_timeout: timeout,
            awaiting_ack: VecDeque::new(),
            last_sequence: None,
            decode_errors: 0,
            missed_snapshots: 0,
            closed: false,
        })
    }

    pub fn model(&self) -> &ReadModel {
        &self.model
    }

    pub fn process(&self) -> &ProcessInfo {
        self.model.process()
    }

    /// Snapshots skipped because they could not be decoded or merged
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors
    }

    /// Snapshots never received, judging by gaps in the sequence numbers
    pub fn missed_snapshots(&self) -> u64 {
        self.missed_snapshots
    }

    /// Whether the profiled process acknowledged a close request
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn set_write_timeout(&mut self, timeout: Duration) {
        self.write_timeout = timeout;
    }

    pub fn request_snapshot(&mut self) -> Result<()> {
        self.channel
            .send(&Message::SnapshotRequest, self.write_timeout)?;
        Ok(())
    }

    pub fn request_clear(&mut self) -> Result<()> {
        self.channel
            .send(&Message::ClearRequest, self.write_timeout)?;
        self.awaiting_ack.push_back(Pending::Clear);
        Ok(())
    }

    /// Ask for a final snapshot and the end of the session
    pub fn request_close(&mut self) -> Result<()> {
        self.channel
            .send(&Message::CloseRequest, self.write_timeout)?;
        self.awaiting_ack.push_back(Pending::Close);
        Ok(())
    }

    /// Handle at most one incoming message, waiting up to `timeout`
    pub fn poll(&mut self, timeout: Duration) -> Result<Option<Event>> {
        let Some(message) = self.channel.recv(timeout)? else {
            return Ok(None);
        };

        let event = match message {
            Message::SnapshotResponse {
                sequence,
                incremental,
                diagnostics,
                payload,
            } => Some(self.on_snapshot(sequence, incremental, diagnostics, &payload)),
            Message::Cleared => {
                debug!("Profiled process cleared its statistics");
                self.model.clear();
                Some(Event::Cleared)
            }
            Message::Ack => match self.awaiting_ack.pop_front() {
                Some(Pending::Clear) => {
                    self.model.clear();
                    Some(Event::Cleared)
                }
                Some(Pending::Close) => {
                    self.closed = true;
                    Some(Event::Closed)
                }
                None => {
                    warn!("Unexpected Ack");
                    None
                }
            },
            other => {
                warn!("Ignoring unexpected {} from profiled process", other.kind());
                None
            }
        };
        Ok(event)
    }

    fn on_snapshot(
        &mut self,
        sequence: u64,
        incremental: bool,
        diagnostics: DiagnosticsSnapshot,
        payload: &[u8],
    ) -> Event {
        if let Some(last) = self.last_sequence
            && sequence > last.saturating_add(1)
        {
            let missed = sequence - last - 1;
            warn!("Missed {} snapshots before {}", missed, sequence);
            self.missed_snapshots += missed;
        }
        self.last_sequence = Some(sequence);

        let applied = decode_snapshot(payload).and_then(|statistics| {
            self.model
                .apply(sequence, incremental, diagnostics, &statistics)
                .map(|()| statistics)
        });

        match applied {
            Ok(statistics) => {
                debug!(
                    "Snapshot {}: {} functions ({})",
                    sequence,
                    statistics.len(),
                    if incremental { "incremental" } else { "cumulative" }
                );
                Event::Snapshot {
                    sequence,
                    incremental,
                    diagnostics,
                    statistics,
                }
            }
            Err(error) => {
                warn!("Skipping snapshot {}: {}", sequence, error);
                self.decode_errors += 1;
                Event::Discarded { sequence, error }
            }
        }
    }
}
