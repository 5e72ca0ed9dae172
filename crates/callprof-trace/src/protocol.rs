//! Session control protocol.
//!
//! Each frame is a little-endian `u32` body length followed by the body. The
//! body starts with a one-byte message tag; fields follow in declaration
//! order, integers little-endian, strings and payloads as `u32` length plus
//! bytes.

use crate::codec::{DecodeError, Reader, put_u32, put_u64};
use crate::diagnostics::DiagnosticsSnapshot;

/// Version exchanged in the handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted frame body
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// `SnapshotResponse` body bytes besides the payload: tag, sequence,
/// incremental flag, four diagnostics counters, payload length
const SNAPSHOT_RESPONSE_OVERHEAD: usize = 1 + 8 + 1 + 4 * 8 + 4;

/// Largest snapshot payload that still fits in one frame
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - SNAPSHOT_RESPONSE_OVERHEAD;

const TAG_HANDSHAKE: u8 = 1;
const TAG_HANDSHAKE_ACK: u8 = 2;
const TAG_SNAPSHOT_REQUEST: u8 = 3;
const TAG_SNAPSHOT_RESPONSE: u8 = 4;
const TAG_CLEAR_REQUEST: u8 = 5;
const TAG_CLOSE_REQUEST: u8 = 6;
const TAG_ACK: u8 = 7;
const TAG_CLEARED: u8 = 8;

/// Identity of the profiled process, sent with the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub executable: String,
    pub ticks_per_second: u64,
}

impl ProcessInfo {
    /// Describe the current process
    pub fn current(ticks_per_second: u64) -> Self {
        let executable = std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "[unknown]".to_string());
        Self {
            pid: std::process::id(),
            executable,
            ticks_per_second,
        }
    }

    /// Executable file name without its directory
    pub fn name(&self) -> &str {
        self.executable
            .rsplit('/')
            .next()
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.executable)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Handshake {
        protocol_version: u32,
        process: ProcessInfo,
    },
    HandshakeAck {
        accepted: bool,
        version: u32,
    },
    SnapshotRequest,
    SnapshotResponse {
        sequence: u64,
        /// Payload holds only what accumulated since the previous response
        incremental: bool,
        diagnostics: DiagnosticsSnapshot,
        payload: Vec<u8>,
    },
    ClearRequest,
    CloseRequest,
    Ack,
    /// Statistics were reset on the profiled side
    Cleared,
}

impl Message {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Handshake { .. } => "Handshake",
            Message::HandshakeAck { .. } => "HandshakeAck",
            Message::SnapshotRequest => "SnapshotRequest",
            Message::SnapshotResponse { .. } => "SnapshotResponse",
            Message::ClearRequest => "ClearRequest",
            Message::CloseRequest => "CloseRequest",
            Message::Ack => "Ack",
            Message::Cleared => "Cleared",
        }
    }

    /// Encode as a complete frame (length prefix included)
    pub fn to_frame(&self) -> Vec<u8> {
        let mut frame = vec![0u8; 4];
        self.encode_body(&mut frame);
        let body_len = (frame.len() - 4) as u32;
        frame[..4].copy_from_slice(&body_len.to_le_bytes());
        frame
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            Message::Handshake {
                protocol_version,
                process,
            } => {
                out.push(TAG_HANDSHAKE);
                put_u32(out, *protocol_version);
                put_u32(out, process.pid);
                put_u64(out, process.ticks_per_second);
                put_bytes(out, process.executable.as_bytes());
            }
            Message::HandshakeAck { accepted, version } => {
                out.push(TAG_HANDSHAKE_ACK);
                out.push(u8::from(*accepted));
                put_u32(out, *version);
            }
            Message::SnapshotRequest => out.push(TAG_SNAPSHOT_REQUEST),
            Message::SnapshotResponse {
                sequence,
                incremental,
                diagnostics,
                payload,
            } => {
                out.push(TAG_SNAPSHOT_RESPONSE);
                put_u64(out, *sequence);
                out.push(u8::from(*incremental));
                put_u64(out, diagnostics.unbalanced_exits);
                put_u64(out, diagnostics.orphaned_frames);
                put_u64(out, diagnostics.dropped_events);
                put_u64(out, diagnostics.dropped_snapshots);
                put_bytes(out, payload);
            }
            Message::ClearRequest => out.push(TAG_CLEAR_REQUEST),
            Message::CloseRequest => out.push(TAG_CLOSE_REQUEST),
            Message::Ack => out.push(TAG_ACK),
            Message::Cleared => out.push(TAG_CLEARED),
        }
    }

    /// Decode a frame body (without the length prefix)
    pub fn from_body(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(body);
        let message = match reader.u8()? {
            TAG_HANDSHAKE => {
                let protocol_version = reader.u32()?;
                let pid = reader.u32()?;
                let ticks_per_second = reader.u64()?;
                let executable = String::from_utf8(read_bytes(&mut reader)?.to_vec())
                    .map_err(|_| ProtocolError::InvalidString)?;
                Message::Handshake {
                    protocol_version,
                    process: ProcessInfo {
                        pid,
                        executable,
                        ticks_per_second,
                    },
                }
            }
            TAG_HANDSHAKE_ACK => Message::HandshakeAck {
                accepted: read_bool(&mut reader)?,
                version: reader.u32()?,
            },
            TAG_SNAPSHOT_REQUEST => Message::SnapshotRequest,
            TAG_SNAPSHOT_RESPONSE => Message::SnapshotResponse {
                sequence: reader.u64()?,
                incremental: read_bool(&mut reader)?,
                diagnostics: DiagnosticsSnapshot {
                    unbalanced_exits: reader.u64()?,
                    orphaned_frames: reader.u64()?,
                    dropped_events: reader.u64()?,
                    dropped_snapshots: reader.u64()?,
                },
                payload: read_bytes(&mut reader)?.to_vec(),
            },
            TAG_CLEAR_REQUEST => Message::ClearRequest,
            TAG_CLOSE_REQUEST => Message::CloseRequest,
            TAG_ACK => Message::Ack,
            TAG_CLEARED => Message::Cleared,
            tag => return Err(ProtocolError::UnknownTag(tag)),
        };
        reader.finish()?;
        Ok(message)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] DecodeError),

    #[error("Unknown message tag {0}")]
    UnknownTag(u8),

    #[error("Invalid boolean byte {0}")]
    InvalidBool(u8),

    #[error("Invalid UTF-8 string")]
    InvalidString,

    #[error("Frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

fn read_bytes<'a>(reader: &mut Reader<'a>) -> Result<&'a [u8], DecodeError> {
    let len = reader.u32()? as usize;
    reader.take(len)
}

fn read_bool(reader: &mut Reader<'_>) -> Result<bool, ProtocolError> {
    match reader.u8()? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ProtocolError::InvalidBool(other)),
    }
}

/// Parse a frame length prefix
pub fn frame_len(prefix: [u8; 4]) -> Result<usize, ProtocolError> {
    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: Message) -> Message {
        let frame = message.to_frame();
        let len = frame_len([frame[0], frame[1], frame[2], frame[3]]).unwrap();
        assert_eq!(len, frame.len() - 4);
        Message::from_body(&frame[4..]).unwrap()
    }

    #[test]
    fn test_handshake_carries_process_info() {
        let message = Message::Handshake {
            protocol_version: PROTOCOL_VERSION,
            process: ProcessInfo {
                pid: 4242,
                executable: "/usr/bin/target-app".to_string(),
                ticks_per_second: 1_000_000_000,
            },
        };
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_snapshot_response_keeps_payload_and_diagnostics() {
        let message = Message::SnapshotResponse {
            sequence: 7,
            incremental: true,
            diagnostics: DiagnosticsSnapshot {
                unbalanced_exits: 1,
                orphaned_frames: 2,
                dropped_events: 3,
                dropped_snapshots: 4,
            },
            payload: vec![0, 0, 0, 0],
        };
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn test_control_messages_are_single_byte() {
        for message in [
            Message::SnapshotRequest,
            Message::ClearRequest,
            Message::CloseRequest,
            Message::Ack,
            Message::Cleared,
        ] {
            assert_eq!(message.to_frame().len(), 5);
        }
    }

    #[test]
    fn test_unknown_tag_and_bad_bool_are_rejected() {
        assert_eq!(Message::from_body(&[99]), Err(ProtocolError::UnknownTag(99)));
        assert_eq!(
            Message::from_body(&[TAG_HANDSHAKE_ACK, 2, 1, 0, 0, 0]),
            Err(ProtocolError::InvalidBool(2))
        );
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let prefix = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes();
        assert!(matches!(frame_len(prefix), Err(ProtocolError::FrameTooLarge(_))));
    }

    #[test]
    fn test_process_name() {
        let info = ProcessInfo {
            pid: 1,
            executable: "/opt/app/bin/server".to_string(),
            ticks_per_second: 1,
        };
        assert_eq!(info.name(), "server");
    }

    #[test]
    fn test_largest_payload_fills_a_frame() {
        let message = Message::SnapshotResponse {
            sequence: 1,
            incremental: true,
            diagnostics: DiagnosticsSnapshot::default(),
            payload: Vec::new(),
        };
        let overhead = message.to_frame().len() - 4;
        assert_eq!(MAX_PAYLOAD_LEN + overhead, MAX_FRAME_LEN);
    }
}
