//! Shared data-model types carried on the wire and through the internal
//! HTTP API.  All timestamps are epoch milliseconds; field names are
//! camelCase on the wire.

use serde::{Deserialize, Serialize};

/// Durable client installation categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Web,
    Ios,
    Android,
    Pc,
    Tablet,
}

/// Message content categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgType {
    Text,
    Image,
    File,
    Voice,
    Video,
    Location,
    UserCard,
    GroupCard,
    Recall,
    System,
}

/// Conversation variants.  A private chat always has exactly two
/// participants; a group mirrors the current member set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    PrivateChat,
    Group,
    Stranger,
}

/// A persisted message.  Immutable once stored; `id` is the server-assigned
/// monotonic ordering key, `msg_id` the client-chosen idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: i64,
    pub msg_id: String,
    pub conversation_id: i64,
    pub sender_id: String,
    pub sender_device_id: String,
    pub msg_type: MsgType,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_msg_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_user_ids: Option<Vec<String>>,
    pub client_created_at: i64,
    pub server_created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recalled_at: Option<i64>,
}

/// Aggregated presence for one user, derived from the session set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceStatus {
    pub user_id: String,
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
    #[serde(default)]
    pub active_devices: Vec<DeviceType>,
}

/// A read-cursor advance by `user_id`, pushed to that user's other devices
/// and included in sync deltas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadStatusUpdate {
    pub conversation_id: i64,
    pub user_id: String,
    pub last_read_msg_id: i64,
}

/// A recall that happened while a device was away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecallRecord {
    pub msg_id: String,
    pub conversation_id: i64,
    pub recalled_at: i64,
    pub recalled_by: String,
}

/// Conversation membership as of the sync point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationUpdate {
    pub conversation_id: i64,
    pub kind: ConversationKind,
    pub participant_ids: Vec<String>,
}

/// Delta payload for SYNC_RESPONSE, bounded at the sync page limit.
/// `has_more` invites the client to re-request with `sync_cursor`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDelta {
    pub new_messages: Vec<ChatMessage>,
    pub recalled_messages: Vec<RecallRecord>,
    pub read_status_updates: Vec<ReadStatusUpdate>,
    pub conversation_updates: Vec<ConversationUpdate>,
    pub sync_cursor: i64,
    pub has_more: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_wire_fields_are_camel_case() {
        let msg = ChatMessage {
            id: 7,
            msg_id: "m-1".to_owned(),
            conversation_id: 42,
            sender_id: "u1".to_owned(),
            sender_device_id: "d1".to_owned(),
            msg_type: MsgType::Text,
            content: "hi".to_owned(),
            metadata: None,
            quote_msg_id: None,
            at_user_ids: None,
            client_created_at: 1,
            server_created_at: 2,
            recalled_at: None,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["msgId"], "m-1");
        assert_eq!(v["conversationId"], 42);
        assert_eq!(v["senderDeviceId"], "d1");
        assert_eq!(v["serverCreatedAt"], 2);
        assert!(v.get("recalledAt").is_none(), "absent fields are omitted");
    }

    #[test]
    fn msg_type_uses_snake_case_wire_names() {
        assert_eq!(
            serde_json::to_value(MsgType::UserCard).unwrap(),
            serde_json::json!("user_card")
        );
        assert_eq!(
            serde_json::from_value::<MsgType>(serde_json::json!("group_card")).unwrap(),
            MsgType::GroupCard
        );
    }

    #[test]
    fn device_type_round_trips_lowercase() {
        for (dt, name) in [
            (DeviceType::Web, "web"),
            (DeviceType::Ios, "ios"),
            (DeviceType::Android, "android"),
            (DeviceType::Pc, "pc"),
            (DeviceType::Tablet, "tablet"),
        ] {
            assert_eq!(serde_json::to_value(dt).unwrap(), serde_json::json!(name));
        }
    }
}
