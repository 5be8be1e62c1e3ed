//! Internal HTTP API types (Gateway <-> Persistence Service) and the
//! cross-node fan-out event.  Frozen schema definitions: the mock
//! persistence used in tests and the production service both serve these
//! shapes under `/internal`.

use crate::model::DeviceType;
use crate::packet::Packet;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateRequest {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateResponse {
    pub user_id: String,
    pub nickname: String,
    /// Remaining token lifetime; bounds how long the gateway may cache the
    /// validation result.
    pub expires_in_seconds: i64,
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertDeviceRequest {
    pub user_id: String,
    pub device_id: String,
    pub device_type: DeviceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub device_id: String,
    pub user_id: String,
    pub device_type: DeviceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_token: Option<String>,
    pub created_at: i64,
    pub last_active_at: i64,
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Body of `POST /internal/messages`.  The sender identity comes from the
/// acting-principal headers, never from the body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub msg_id: String,
    pub conversation_id: i64,
    pub msg_type: crate::model::MsgType,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_msg_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_user_ids: Option<Vec<String>>,
    pub client_created_at: i64,
}

/// Result of `PUT /internal/messages/{msgId}/recall`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecallOutcome {
    pub msg_id: String,
    pub conversation_id: i64,
    pub recalled_at: i64,
    pub recalled_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBatchRequest {
    pub ids: Vec<i64>,
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantsResponse {
    pub participant_ids: Vec<String>,
    pub kind: crate::model::ConversationKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadRequest {
    pub last_read_msg_id: i64,
}

/// Result of the monotone read-cursor CAS.  `applied` is false when the
/// submitted cursor was not strictly greater than the stored one; stale
/// updates trigger no notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadOutcome {
    pub conversation_id: i64,
    pub last_read_msg_id: i64,
    pub reader_id: String,
    pub applied: bool,
    /// Present only for private chats: the peer whose devices receive a
    /// READ_RECEIPT_NOTIFY.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_user_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Offline queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineEnqueue {
    pub target_user_id: String,
    /// None targets every device of the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_device_id: Option<String>,
    pub message_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineEnqueueRequest {
    pub entries: Vec<OfflineEnqueue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineEntry {
    pub id: i64,
    pub target_user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_device_id: Option<String>,
    pub message_id: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflinePendingResponse {
    pub entries: Vec<OfflineEntry>,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineAckRequest {
    pub user_id: String,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_ids: Option<Vec<i64>>,
    /// Alternative strategy: deliver-through watermark by message id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<i64>,
    #[serde(default)]
    pub mark_all_delivered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineAckResponse {
    pub acked: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReapResponse {
    pub reaped: u64,
}

// ---------------------------------------------------------------------------
// REST-layer -> Gateway notices
// ---------------------------------------------------------------------------

/// Events the CRUD REST layer pushes into the gateway so they reach live
/// sessions: reactions (which have no client opcode) and group-membership
/// changes (which invalidate the participant cache).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum GatewayNotice {
    Reaction {
        #[serde(rename = "msgId")]
        msg_id: String,
        #[serde(rename = "conversationId")]
        conversation_id: i64,
        #[serde(rename = "userId")]
        user_id: String,
        reaction: String,
        added: bool,
    },
    MembershipChanged {
        #[serde(rename = "conversationId")]
        conversation_id: i64,
    },
}

// ---------------------------------------------------------------------------
// Cross-node fan-out
// ---------------------------------------------------------------------------

/// One event published on channel `user.{targetUserId}`; the node holding
/// the target session translates it into a local enqueue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutEvent {
    pub target_user_id: String,
    /// None fans out to every live device of the user on the receiving
    /// node.  The publisher targets remote devices individually, so a node
    /// receiving its own publication finds no matching local session and
    /// drops it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_device_id: Option<String>,
    pub packet: Packet,
}

/// Frozen HTTP error envelope used by all non-2xx internal responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpErrorEnvelope {
    pub code: String,
    pub message: String,
}
