//! Typed payloads per opcode plus the two direction enums.
//!
//! `ClientFrame::decode` / `ServerFrame::decode` turn a raw [`Packet`] into
//! a typed frame, so handler dispatch on both peers is total: every known
//! opcode has exactly one payload shape, and every violation is a
//! [`ProtocolError`].

use crate::model::{
    ChatMessage, DeviceType, MsgType, PresenceStatus, SyncDelta,
};
use crate::packet::{Opcode, Packet, ProtocolError};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Client -> Server payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginData {
    pub token: String,
    pub device_id: String,
    pub device_type: DeviceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageData {
    pub msg_id: String,
    pub conversation_id: i64,
    pub msg_type: MsgType,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_msg_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_user_ids: Option<Vec<String>>,
    pub client_created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingData {
    pub conversation_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadAckData {
    pub conversation_id: i64,
    pub last_read_msg_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecallData {
    pub msg_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_cursor: Option<i64>,
}

/// Both ack strategies are accepted: an explicit entry-id list, or
/// `mark_all_delivered` to confirm the whole drained batch.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineSyncAckData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offline_message_ids: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mark_all_delivered: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineStatusRequestData {
    pub user_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineStatusSubscribeData {
    pub user_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Server -> Client payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponseData {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageAckData {
    pub msg_id: String,
    pub success: bool,
    /// Server-assigned ordering id; the authoring device never sees its own
    /// RECEIVE_MESSAGE, so the ack carries the id instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotifyData {
    pub conversation_id: i64,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecallAckData {
    pub msg_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecallNotifyData {
    pub msg_id: String,
    pub conversation_id: i64,
    pub recalled_at: i64,
    pub recalled_by: String,
}

/// One drained offline entry: the queue entry id the client must ack, plus
/// the message itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineMessage {
    pub entry_id: i64,
    pub message: ChatMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineSyncResponseData {
    pub messages: Vec<OfflineMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineSyncCompleteData {
    pub total_delivered: u32,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineStatusResponseData {
    pub statuses: Vec<PresenceStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineStatusChangeData {
    pub user_id: String,
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptNotifyData {
    pub conversation_id: i64,
    pub reader_id: String,
    pub last_read_msg_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionNotifyData {
    pub msg_id: String,
    pub conversation_id: i64,
    pub user_id: String,
    pub reaction: String,
    pub added: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KickedOfflineData {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerErrorData {
    pub error: String,
}

// ---------------------------------------------------------------------------
// Direction enums
// ---------------------------------------------------------------------------

/// Every packet a client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Login(LoginData),
    Logout,
    Heartbeat,
    ChatMessage(ChatMessageData),
    Typing(TypingData),
    ReadAck(ReadAckData),
    RecallMessage(RecallData),
    SyncRequest(SyncRequestData),
    OfflineSyncAck(OfflineSyncAckData),
    OnlineStatusRequest(OnlineStatusRequestData),
    OnlineStatusSubscribe(OnlineStatusSubscribeData),
}

impl ClientFrame {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Login(_) => Opcode::Login,
            Self::Logout => Opcode::Logout,
            Self::Heartbeat => Opcode::Heartbeat,
            Self::ChatMessage(_) => Opcode::ChatMessage,
            Self::Typing(_) => Opcode::Typing,
            Self::ReadAck(_) => Opcode::ReadAck,
            Self::RecallMessage(_) => Opcode::RecallMessage,
            Self::SyncRequest(_) => Opcode::SyncRequest,
            Self::OfflineSyncAck(_) => Opcode::OfflineSyncAck,
            Self::OnlineStatusRequest(_) => Opcode::OnlineStatusRequest,
            Self::OnlineStatusSubscribe(_) => Opcode::OnlineStatusSubscribe,
        }
    }

    /// Decode the typed payload out of a raw packet.  The opcode must be a
    /// client-direction opcode.
    pub fn decode(packet: &Packet) -> Result<Self, ProtocolError> {
        let opcode = Opcode::try_from(packet.opcode)?;
        let payload = |e| ProtocolError::Payload {
            opcode: packet.opcode,
            source: e,
        };
        Ok(match opcode {
            Opcode::Login => Self::Login(
                serde_json::from_value(packet.data.clone()).map_err(payload)?,
            ),
            Opcode::Logout => Self::Logout,
            Opcode::Heartbeat => Self::Heartbeat,
            Opcode::ChatMessage => Self::ChatMessage(
                serde_json::from_value(packet.data.clone()).map_err(payload)?,
            ),
            Opcode::Typing => Self::Typing(
                serde_json::from_value(packet.data.clone()).map_err(payload)?,
            ),
            Opcode::ReadAck => Self::ReadAck(
                serde_json::from_value(packet.data.clone()).map_err(payload)?,
            ),
            Opcode::RecallMessage => Self::RecallMessage(
                serde_json::from_value(packet.data.clone()).map_err(payload)?,
            ),
            Opcode::SyncRequest => Self::SyncRequest(
                serde_json::from_value(packet.data.clone()).map_err(payload)?,
            ),
            Opcode::OfflineSyncAck => Self::OfflineSyncAck(
                serde_json::from_value(packet.data.clone()).map_err(payload)?,
            ),
            Opcode::OnlineStatusRequest => Self::OnlineStatusRequest(
                serde_json::from_value(packet.data.clone()).map_err(payload)?,
            ),
            Opcode::OnlineStatusSubscribe => Self::OnlineStatusSubscribe(
                serde_json::from_value(packet.data.clone()).map_err(payload)?,
            ),
            _ => return Err(ProtocolError::Direction(packet.opcode)),
        })
    }

    pub fn encode_data(&self) -> serde_json::Value {
        match self {
            Self::Login(d) => serde_json::to_value(d).unwrap_or_default(),
            Self::Logout | Self::Heartbeat => serde_json::Value::Object(Default::default()),
            Self::ChatMessage(d) => serde_json::to_value(d).unwrap_or_default(),
            Self::Typing(d) => serde_json::to_value(d).unwrap_or_default(),
            Self::ReadAck(d) => serde_json::to_value(d).unwrap_or_default(),
            Self::RecallMessage(d) => serde_json::to_value(d).unwrap_or_default(),
            Self::SyncRequest(d) => serde_json::to_value(d).unwrap_or_default(),
            Self::OfflineSyncAck(d) => serde_json::to_value(d).unwrap_or_default(),
            Self::OnlineStatusRequest(d) => serde_json::to_value(d).unwrap_or_default(),
            Self::OnlineStatusSubscribe(d) => serde_json::to_value(d).unwrap_or_default(),
        }
    }

    pub fn into_packet(self, seq: impl Into<String>, timestamp: i64) -> Packet {
        Packet::new(self.opcode(), seq, self.encode_data(), timestamp)
    }
}

/// Every packet a server may send.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    LoginResponse(LoginResponseData),
    LogoutResponse,
    HeartbeatResponse,
    ChatMessageAck(ChatMessageAckData),
    ReceiveMessage(ChatMessage),
    TypingNotify(TypingNotifyData),
    RecallAck(RecallAckData),
    RecallNotify(RecallNotifyData),
    SyncResponse(SyncDelta),
    OfflineSyncResponse(OfflineSyncResponseData),
    OfflineSyncComplete(OfflineSyncCompleteData),
    OnlineStatusResponse(OnlineStatusResponseData),
    OnlineStatusChange(OnlineStatusChangeData),
    ReadReceiptNotify(ReadReceiptNotifyData),
    ReactionNotify(ReactionNotifyData),
    KickedOffline(KickedOfflineData),
    ServerError(ServerErrorData),
}

impl ServerFrame {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::LoginResponse(_) => Opcode::LoginResponse,
            Self::LogoutResponse => Opcode::LogoutResponse,
            Self::HeartbeatResponse => Opcode::HeartbeatResponse,
            Self::ChatMessageAck(_) => Opcode::ChatMessageAck,
            Self::ReceiveMessage(_) => Opcode::ReceiveMessage,
            Self::TypingNotify(_) => Opcode::TypingNotify,
            Self::RecallAck(_) => Opcode::RecallAck,
            Self::RecallNotify(_) => Opcode::RecallNotify,
            Self::SyncResponse(_) => Opcode::SyncResponse,
            Self::OfflineSyncResponse(_) => Opcode::OfflineSyncResponse,
            Self::OfflineSyncComplete(_) => Opcode::OfflineSyncComplete,
            Self::OnlineStatusResponse(_) => Opcode::OnlineStatusResponse,
            Self::OnlineStatusChange(_) => Opcode::OnlineStatusChange,
            Self::ReadReceiptNotify(_) => Opcode::ReadReceiptNotify,
            Self::ReactionNotify(_) => Opcode::ReactionNotify,
            Self::KickedOffline(_) => Opcode::KickedOffline,
            Self::ServerError(_) => Opcode::ServerError,
        }
    }

    pub fn decode(packet: &Packet) -> Result<Self, ProtocolError> {
        let opcode = Opcode::try_from(packet.opcode)?;
        let payload = |e| ProtocolError::Payload {
            opcode: packet.opcode,
            source: e,
        };
        Ok(match opcode {
            Opcode::LoginResponse => Self::LoginResponse(
                serde_json::from_value(packet.data.clone()).map_err(payload)?,
            ),
            Opcode::LogoutResponse => Self::LogoutResponse,
            Opcode::HeartbeatResponse => Self::HeartbeatResponse,
            Opcode::ChatMessageAck => Self::ChatMessageAck(
                serde_json::from_value(packet.data.clone()).map_err(payload)?,
            ),
            Opcode::ReceiveMessage => Self::ReceiveMessage(
                serde_json::from_value(packet.data.clone()).map_err(payload)?,
            ),
            Opcode::TypingNotify => Self::TypingNotify(
                serde_json::from_value(packet.data.clone()).map_err(payload)?,
            ),
            Opcode::RecallAck => Self::RecallAck(
                serde_json::from_value(packet.data.clone()).map_err(payload)?,
            ),
            Opcode::RecallNotify => Self::RecallNotify(
                serde_json::from_value(packet.data.clone()).map_err(payload)?,
            ),
            Opcode::SyncResponse => Self::SyncResponse(
                serde_json::from_value(packet.data.clone()).map_err(payload)?,
            ),
            Opcode::OfflineSyncResponse => Self::OfflineSyncResponse(
                serde_json::from_value(packet.data.clone()).map_err(payload)?,
            ),
            Opcode::OfflineSyncComplete => Self::OfflineSyncComplete(
                serde_json::from_value(packet.data.clone()).map_err(payload)?,
            ),
            Opcode::OnlineStatusResponse => Self::OnlineStatusResponse(
                serde_json::from_value(packet.data.clone()).map_err(payload)?,
            ),
            Opcode::OnlineStatusChange => Self::OnlineStatusChange(
                serde_json::from_value(packet.data.clone()).map_err(payload)?,
            ),
            Opcode::ReadReceiptNotify => Self::ReadReceiptNotify(
                serde_json::from_value(packet.data.clone()).map_err(payload)?,
            ),
            Opcode::ReactionNotify => Self::ReactionNotify(
                serde_json::from_value(packet.data.clone()).map_err(payload)?,
            ),
            Opcode::KickedOffline => Self::KickedOffline(
                serde_json::from_value(packet.data.clone()).map_err(payload)?,
            ),
            Opcode::ServerError => Self::ServerError(
                serde_json::from_value(packet.data.clone()).map_err(payload)?,
            ),
            _ => return Err(ProtocolError::Direction(packet.opcode)),
        })
    }

    pub fn encode_data(&self) -> serde_json::Value {
        match self {
            Self::LoginResponse(d) => serde_json::to_value(d).unwrap_or_default(),
            Self::LogoutResponse | Self::HeartbeatResponse => {
                serde_json::Value::Object(Default::default())
            }
            Self::ChatMessageAck(d) => serde_json::to_value(d).unwrap_or_default(),
            Self::ReceiveMessage(d) => serde_json::to_value(d).unwrap_or_default(),
            Self::TypingNotify(d) => serde_json::to_value(d).unwrap_or_default(),
            Self::RecallAck(d) => serde_json::to_value(d).unwrap_or_default(),
            Self::RecallNotify(d) => serde_json::to_value(d).unwrap_or_default(),
            Self::SyncResponse(d) => serde_json::to_value(d).unwrap_or_default(),
            Self::OfflineSyncResponse(d) => serde_json::to_value(d).unwrap_or_default(),
            Self::OfflineSyncComplete(d) => serde_json::to_value(d).unwrap_or_default(),
            Self::OnlineStatusResponse(d) => serde_json::to_value(d).unwrap_or_default(),
            Self::OnlineStatusChange(d) => serde_json::to_value(d).unwrap_or_default(),
            Self::ReadReceiptNotify(d) => serde_json::to_value(d).unwrap_or_default(),
            Self::ReactionNotify(d) => serde_json::to_value(d).unwrap_or_default(),
            Self::KickedOffline(d) => serde_json::to_value(d).unwrap_or_default(),
            Self::ServerError(d) => serde_json::to_value(d).unwrap_or_default(),
        }
    }

    pub fn into_packet(self, seq: impl Into<String>, timestamp: i64) -> Packet {
        Packet::new(self.opcode(), seq, self.encode_data(), timestamp)
    }
}
