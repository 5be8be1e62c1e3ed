//! Packet envelope, opcode table, and frame-level codec rules.
//!
//! Wire format: `{"type": <u16>, "seq": <string>, "data": <object>,
//! "timestamp": <i64 ms>}`.  The `seq` of a request is echoed verbatim in
//! the matching response; server-initiated pushes carry a fresh seq from
//! [`SeqGen`].

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Default cap on a single WebSocket text frame (1 MiB).
pub const MAX_FRAME_BYTES_DEFAULT: usize = 1024 * 1024;

// ---------------------------------------------------------------------------
// Opcode table
// ---------------------------------------------------------------------------

/// All opcodes in the v1 protocol.  Values are frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    // Client -> Server
    Login = 1,
    Logout = 2,
    Heartbeat = 3,
    ChatMessage = 10,
    Typing = 11,
    ReadAck = 12,
    RecallMessage = 13,
    SyncRequest = 20,
    OfflineSyncAck = 22,
    OnlineStatusRequest = 23,
    OnlineStatusSubscribe = 24,
    // Server -> Client
    LoginResponse = 101,
    LogoutResponse = 102,
    HeartbeatResponse = 103,
    ChatMessageAck = 110,
    ReceiveMessage = 111,
    TypingNotify = 112,
    RecallAck = 113,
    RecallNotify = 114,
    SyncResponse = 120,
    OfflineSyncResponse = 121,
    OfflineSyncComplete = 122,
    OnlineStatusResponse = 123,
    OnlineStatusChange = 124,
    ReadReceiptNotify = 125,
    ReactionNotify = 126,
    KickedOffline = 200,
    ServerError = 500,
}

impl Opcode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            1 => Self::Login,
            2 => Self::Logout,
            3 => Self::Heartbeat,
            10 => Self::ChatMessage,
            11 => Self::Typing,
            12 => Self::ReadAck,
            13 => Self::RecallMessage,
            20 => Self::SyncRequest,
            22 => Self::OfflineSyncAck,
            23 => Self::OnlineStatusRequest,
            24 => Self::OnlineStatusSubscribe,
            101 => Self::LoginResponse,
            102 => Self::LogoutResponse,
            103 => Self::HeartbeatResponse,
            110 => Self::ChatMessageAck,
            111 => Self::ReceiveMessage,
            112 => Self::TypingNotify,
            113 => Self::RecallAck,
            114 => Self::RecallNotify,
            120 => Self::SyncResponse,
            121 => Self::OfflineSyncResponse,
            122 => Self::OfflineSyncComplete,
            123 => Self::OnlineStatusResponse,
            124 => Self::OnlineStatusChange,
            125 => Self::ReadReceiptNotify,
            126 => Self::ReactionNotify,
            200 => Self::KickedOffline,
            500 => Self::ServerError,
            _ => return None,
        })
    }

    /// Opcodes that may arrive server-initiated (111..126, 200, 500).  They
    /// are dispatched through the event bus whenever no pending request
    /// matches the seq; a matching seq always wins (SYNC_RESPONSE and
    /// ONLINE_STATUS_RESPONSE answer requests too).
    pub fn is_push(self) -> bool {
        matches!(
            self,
            Self::ReceiveMessage
                | Self::TypingNotify
                | Self::RecallNotify
                | Self::SyncResponse
                | Self::OfflineSyncResponse
                | Self::OfflineSyncComplete
                | Self::OnlineStatusResponse
                | Self::OnlineStatusChange
                | Self::ReadReceiptNotify
                | Self::ReactionNotify
                | Self::KickedOffline
                | Self::ServerError
        )
    }
}

impl TryFrom<u16> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, ProtocolError> {
        Self::from_u16(value).ok_or(ProtocolError::UnknownOpcode(value))
    }
}

// ---------------------------------------------------------------------------
// Packet envelope
// ---------------------------------------------------------------------------

/// The raw frame envelope.  `opcode` is kept as a bare `u16` here so that a
/// frame with an unrecognized type can still be parsed far enough to log it
/// and keep the connection open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    #[serde(rename = "type")]
    pub opcode: u16,
    pub seq: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: i64,
}

impl Packet {
    pub fn new(opcode: Opcode, seq: impl Into<String>, data: serde_json::Value, timestamp: i64) -> Self {
        Self {
            opcode: opcode.as_u16(),
            seq: seq.into(),
            data,
            timestamp,
        }
    }

    /// Parse a text frame, enforcing the frame size cap before touching the
    /// JSON parser.
    pub fn parse(text: &str, max_bytes: usize) -> Result<Self, ProtocolError> {
        if text.len() > max_bytes {
            return Err(ProtocolError::Oversize {
                len: text.len(),
                max: max_bytes,
            });
        }
        serde_json::from_str(text).map_err(ProtocolError::Malformed)
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Malformed)
    }
}

// ---------------------------------------------------------------------------
// Seq allocation
// ---------------------------------------------------------------------------

/// Monotonic seq allocator for locally-originated packets.
///
/// Each peer runs its own generator; the server's carries a `srv` prefix so
/// push seqs can never collide with an in-flight client request seq.
#[derive(Debug)]
pub struct SeqGen {
    prefix: &'static str,
    counter: AtomicU64,
}

impl SeqGen {
    pub fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            counter: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", self.prefix, n)
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Frame-level protocol violations.
///
/// | Variant       | Connection policy          |
/// |---------------|----------------------------|
/// | Oversize      | SERVER_ERROR, then close   |
/// | Malformed     | SERVER_ERROR, then close   |
/// | UnknownOpcode | log and drop, stay open    |
/// | Payload       | SERVER_ERROR, then close   |
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    Oversize { len: usize, max: usize },
    #[error("malformed frame: {0}")]
    Malformed(serde_json::Error),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    #[error("invalid payload for opcode {opcode}: {source}")]
    Payload {
        opcode: u16,
        source: serde_json::Error,
    },
    #[error("opcode {0} is not valid in this direction")]
    Direction(u16),
}
