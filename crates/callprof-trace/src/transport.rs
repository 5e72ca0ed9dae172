//! Message channels between the profiled process and its consumer.

use crate::protocol::{Message, ProtocolError, frame_len};
use log::debug;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Environment variable naming the consumer's socket
pub const SOCKET_ENV: &str = "CALLPROF_SOCKET";

/// Socket timeouts must be non-zero
const MIN_IO_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Channel operation timed out")]
    TimedOut,

    #[error("Peer disconnected")]
    Disconnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Bidirectional message channel with bounded waits
pub trait Channel: Send {
    /// Send a message, waiting at most `timeout` for the peer to accept it.
    ///
    /// `Ok` means the message is committed: it reaches the peer unless the
    /// channel breaks, though part of it may still be queued for
    /// [`flush`](Channel::flush) or the next `send`. An error means none of
    /// it will be delivered.
    fn send(&mut self, message: &Message, timeout: Duration) -> Result<(), TransportError>;

    /// Receive the next message, or `None` if nothing arrived within `timeout`
    fn recv(&mut self, timeout: Duration) -> Result<Option<Message>, TransportError>;

    /// Finish writing committed messages, waiting at most `timeout`
    fn flush(&mut self, _timeout: Duration) -> Result<(), TransportError> {
        Ok(())
    }
}

impl<C: Channel + ?Sized> Channel for Box<C> {
    fn send(&mut self, message: &Message, timeout: Duration) -> Result<(), TransportError> {
        (**self).send(message, timeout)
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Message>, TransportError> {
        (**self).recv(timeout)
    }

    fn flush(&mut self, timeout: Duration) -> Result<(), TransportError> {
        (**self).flush(timeout)
    }
}

// =============================================================================
// Unix domain socket
// =============================================================================

/// Length-prefixed frames over a Unix domain socket
pub struct UnixChannel {
    stream: UnixStream,
    /// Received bytes not yet forming a complete frame
    inbound: Vec<u8>,
    /// Tail of a frame whose write timed out part-way
    outbound: Vec<u8>,
}

impl UnixChannel {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            inbound: Vec::new(),
            outbound: Vec::new(),
        }
    }

    /// Connect to a consumer listening on `path`
    pub fn connect(path: &Path) -> Result<Self, TransportError> {
        Ok(Self::new(UnixStream::connect(path)?))
    }

    /// Write pending bytes until done or the deadline passes
    fn drain_outbound(&mut self, deadline: Instant) -> Result<(), TransportError> {
        while !self.outbound.is_empty() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(TransportError::TimedOut);
            }
            self.stream.set_write_timeout(Some(left.max(MIN_IO_TIMEOUT)))?;
            match self.stream.write(&self.outbound) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(e) if is_timeout(&e) => return Err(TransportError::TimedOut),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if is_disconnect(&e) => return Err(TransportError::Disconnected),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn take_frame(&mut self) -> Result<Option<Message>, TransportError> {
        if self.inbound.len() < 4 {
            return Ok(None);
        }
        let len = frame_len([
            self.inbound[0],
            self.inbound[1],
            self.inbound[2],
            self.inbound[3],
        ])?;
        if self.inbound.len() < 4 + len {
            return Ok(None);
        }
        let message = Message::from_body(&self.inbound[4..4 + len]);
        self.inbound.drain(..4 + len);
        Ok(Some(message?))
    }
}

impl Channel for UnixChannel {
    fn send(&mut self, message: &Message, timeout: Duration) -> Result<(), TransportError> {
        let deadline = Instant::now() + timeout;

        // Finish a previously interrupted frame first so the stream stays
        // aligned on frame boundaries
        if !self.outbound.is_empty() {
            self.drain_outbound(deadline)?;
        }

        let frame = message.to_frame();
        let total = frame.len();
        self.outbound = frame;
        match self.drain_outbound(deadline) {
            Ok(()) => Ok(()),
            Err(TransportError::TimedOut) if self.outbound.len() == total => {
                // Nothing of this frame went out: forget it entirely
                self.outbound.clear();
                Err(TransportError::TimedOut)
            }
            Err(TransportError::TimedOut) => {
                // The peer has the start of this frame; the rest goes out
                // ahead of anything else
                debug!(
                    "{} of {} bytes of {} deferred",
                    self.outbound.len(),
                    total,
                    message.kind()
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn flush(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.drain_outbound(Instant::now() + timeout)
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Message>, TransportError> {
        if let Some(message) = self.take_frame()? {
            return Ok(Some(message));
        }

        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 64 * 1024];
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(None);
            }
            self.stream.set_read_timeout(Some(left.max(MIN_IO_TIMEOUT)))?;
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(n) => {
                    self.inbound.extend_from_slice(&chunk[..n]);
                    if let Some(message) = self.take_frame()? {
                        return Ok(Some(message));
                    }
                }
                Err(e) if is_timeout(&e) => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if is_disconnect(&e) => return Err(TransportError::Disconnected),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

fn is_disconnect(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
    )
}

// =============================================================================
// In-memory channel
// =============================================================================

/// One end of an in-process channel pair.
///
/// Messages travel as encoded frames so both ends exercise the protocol
/// codec. Each direction holds at most `capacity` undelivered frames; a
/// sender facing a full queue waits up to its timeout, then reports
/// [`TransportError::TimedOut`].
pub struct MemoryChannel {
    tx: SyncSender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl MemoryChannel {
    /// Connected pair with room for 1024 frames in each direction
    pub fn pair() -> (Self, Self) {
        Self::bounded_pair(1024)
    }

    pub fn bounded_pair(capacity: usize) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::sync_channel(capacity);
        let (b_tx, a_rx) = mpsc::sync_channel(capacity);
        (Self { tx: a_tx, rx: a_rx }, Self { tx: b_tx, rx: b_rx })
    }
}

impl Channel for MemoryChannel {
    fn send(&mut self, message: &Message, timeout: Duration) -> Result<(), TransportError> {
        let deadline = Instant::now() + timeout;
        let mut frame = message.to_frame();
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Disconnected(_)) => return Err(TransportError::Disconnected),
                Err(TrySendError::Full(returned)) => {
                    if Instant::now() >= deadline {
                        return Err(TransportError::TimedOut);
                    }
                    frame = returned;
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Message>, TransportError> {
        let frame = match self.rx.recv_timeout(timeout) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => return Ok(None),
            Err(RecvTimeoutError::Disconnected) => return Err(TransportError::Disconnected),
        };
        // Frames come from `to_frame`, so the prefix is always present
        Ok(Some(Message::from_body(&frame[4..])?))
    }
}
