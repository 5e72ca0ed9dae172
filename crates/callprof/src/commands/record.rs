use crate::error::{Error, Result};
use crate::frontend::{Event, Frontend};
use crate::storage::Storage;
use callprof_trace::{Channel, DiagnosticsSnapshot, TransportError};
use log::{debug, warn};
use std::io::ErrorKind;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Longest single wait for an incoming message
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Time the profiled process gets to answer the close request
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Recording loop settings
#[derive(Debug, Clone)]
pub struct RecordOptions {
    /// Time between snapshot requests
    pub interval: Duration,
    /// Stop after this long (default: until Ctrl-C or the target exits)
    pub duration: Option<Duration>,
}

/// Outcome of a recording
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordSummary {
    pub snapshots: u64,
    pub checkpoints: u64,
    pub functions: usize,
    pub diagnostics: DiagnosticsSnapshot,
    pub missed_snapshots: u64,
    pub decode_errors: u64,
    /// The target went away instead of acknowledging the close
    pub disconnected: bool,
}

/// Listen on `socket`, replacing a stale socket file left by an earlier run
pub fn bind(socket: &Path) -> Result<UnixListener> {
    if let Ok(metadata) = std::fs::symlink_metadata(socket) {
        if !metadata.file_type().is_socket() {
            return Err(Error::InvalidArgument(format!(
                "{} exists and is not a socket",
                socket.display()
            )));
        }
        std::fs::remove_file(socket)?;
    }
    Ok(UnixListener::bind(socket)?)
}

/// Wait for one profiled process to connect
pub fn accept(listener: &UnixListener, timeout: Duration, running: &AtomicBool) -> Result<UnixStream> {
    listener.set_nonblocking(true)?;
    let deadline = Instant::now() + timeout;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                return Ok(stream);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if !running.load(Ordering::SeqCst) {
                    return Err(Error::Handshake("interrupted while waiting".to_string()));
                }
                if Instant::now() >= deadline {
                    return Err(Error::Handshake(format!(
                        "no profiled process connected within {}",
                        humantime::format_duration(timeout)
                    )));
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Request snapshots every interval and store them until `running` is
/// cleared, the duration elapses or the target disconnects. Ends with a
/// close request whose final snapshot is stored too.
pub fn run<C: Channel>(
    frontend: &mut Frontend<C>,
    storage: &mut Storage,
    options: &RecordOptions,
    running: &AtomicBool,
) -> Result<RecordSummary> {
    let start = Instant::now();
    let mut last_request = Instant::now();
    let mut summary = RecordSummary::default();

    eprintln!("Recording (Ctrl-C to stop)...");

    while running.load(Ordering::SeqCst) {
        if let Some(max_duration) = options.duration
            && start.elapsed() >= max_duration
        {
            break;
        }

        if last_request.elapsed() >= options.interval {
            if let Err(e) = frontend.request_snapshot() {
                if is_disconnect(&e) {
                    summary.disconnected = true;
                    break;
                }
                // A slow target only costs this request
                warn!("Snapshot request failed: {}", e);
            }
            last_request = Instant::now();
        }

        match next_event(frontend, storage, &mut summary) {
            Ok(true) => eprint!(
                "\rSnapshots: {} | Functions: {} | Elapsed: {}",
                summary.snapshots,
                frontend.model().len(),
                humantime::format_duration(Duration::from_secs(start.elapsed().as_secs()))
            ),
            Ok(false) => {}
            Err(e) if is_disconnect(&e) => {
                summary.disconnected = true;
                break;
            }
            Err(e) => return Err(e),
        }
    }

    if !summary.disconnected {
        close(frontend, storage, &mut summary)?;
    }

    summary.functions = frontend.model().len();
    summary.diagnostics = frontend.model().diagnostics();
    summary.missed_snapshots = frontend.missed_snapshots();
    summary.decode_errors = frontend.decode_errors();
    summary.checkpoints = storage.checkpoint_count()?;
    storage.record_summary(
        &summary.diagnostics,
        summary.missed_snapshots,
        summary.decode_errors,
    )?;
    Ok(summary)
}

/// Send the close request and store whatever arrives until it is acknowledged
fn close<C: Channel>(
    frontend: &mut Frontend<C>,
    storage: &mut Storage,
    summary: &mut RecordSummary,
) -> Result<()> {
    if let Err(e) = frontend.request_close() {
        if is_disconnect(&e) {
            summary.disconnected = true;
            return Ok(());
        }
        return Err(e);
    }

    let deadline = Instant::now() + CLOSE_TIMEOUT;
    while !frontend.is_closed() {
        if Instant::now() >= deadline {
            warn!("Target did not acknowledge the close request");
            break;
        }
        match next_event(frontend, storage, summary) {
            Ok(_) => {}
            Err(e) if is_disconnect(&e) => {
                summary.disconnected = true;
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Poll once and store the result. Returns whether a snapshot was stored.
fn next_event<C: Channel>(
    frontend: &mut Frontend<C>,
    storage: &mut Storage,
    summary: &mut RecordSummary,
) -> Result<bool> {
    let event = match frontend.poll(POLL_INTERVAL) {
        Ok(event) => event,
        Err(Error::Transport(TransportError::Protocol(e))) => {
            warn!("Skipping unreadable message: {}", e);
            return Ok(false);
        }
        Err(e) => return Err(e),
    };

    match event {
        Some(Event::Snapshot {
            sequence,
            incremental,
            statistics,
            ..
        }) => {
            summary.snapshots += 1;
            if let Some(id) = storage.record_snapshot(sequence, incremental, &statistics)? {
                debug!("Snapshot {} stored as checkpoint {}", sequence, id);
            }
            Ok(true)
        }
        Some(Event::Cleared) => {
            storage.record_clear()?;
            Ok(false)
        }
        Some(Event::Discarded { .. } | Event::Closed) | None => Ok(false),
    }
}

fn is_disconnect(e: &Error) -> bool {
    matches!(e, Error::Transport(TransportError::Disconnected))
}
