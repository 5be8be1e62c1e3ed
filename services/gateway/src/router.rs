//! Message router: fan-out of chat, typing, recall, read, and reaction
//! events across local sessions, peer nodes, and the offline queue.
//!
//! Handlers commit to persistence before any fan-out begins.  Partial
//! fan-out failure is never surfaced to the sender: unreachable devices are
//! recorded in the offline queue instead.

use crate::error::PersistenceError;
use crate::persistence::Principal;
use crate::registry::SessionEntry;
use crate::state::{now_ms, AppState};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use lumi_protocol::{
    ChatMessage, ChatMessageAckData, ChatMessageData, ConversationKind, FanoutEvent,
    GatewayNotice, OfflineEnqueue, OfflineEnqueueRequest, Packet, ReactionNotifyData,
    ReadAckData, ReadReceiptNotifyData, ReadStatusUpdate, RecallAckData, RecallData,
    RecallNotifyData, SendMessageRequest, ServerErrorData, ServerFrame, SyncDelta,
    SyncRequestData, TypingData, TypingNotifyData,
};
use std::collections::HashSet;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Delivery primitives
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
pub enum DeliverOutcome {
    Sent,
    /// The destination queue stayed full past the grace period; the session
    /// has been closed and the packet dropped.
    SlowConsumer,
    Closed,
}

/// Enqueue one packet on a session's bounded outbound queue, enforcing the
/// slow-consumer policy.
pub async fn deliver(state: &AppState, target: &SessionEntry, packet: Packet) -> DeliverOutcome {
    use tokio::sync::mpsc::error::SendTimeoutError;
    match target
        .outbound
        .send_timeout(packet, state.config.slow_consumer_grace)
        .await
    {
        Ok(()) => DeliverOutcome::Sent,
        Err(SendTimeoutError::Timeout(_)) => {
            warn!(
                user_id = %target.user_id,
                device_id = %target.device_id,
                "slow consumer, closing session"
            );
            target.request_close();
            DeliverOutcome::SlowConsumer
        }
        Err(SendTimeoutError::Closed(_)) => DeliverOutcome::Closed,
    }
}

fn push_packet(state: &AppState, frame: ServerFrame) -> Packet {
    frame.into_packet(state.server_seq.next(), now_ms())
}

/// Participant lookup through the TTL cache.
pub async fn participants_of(
    state: &AppState,
    conversation_id: i64,
) -> Result<(Vec<String>, ConversationKind), PersistenceError> {
    if let Some(hit) = state.participants.get(conversation_id).await {
        return Ok((hit.participant_ids, hit.kind));
    }
    let response = state.persistence.participants(conversation_id).await?;
    state
        .participants
        .insert(
            conversation_id,
            response.participant_ids.clone(),
            response.kind,
            state.config.participant_cache_ttl,
        )
        .await;
    Ok((response.participant_ids, response.kind))
}

/// Fan one frame out to every relevant session of one user.
///
/// Local sessions get a direct enqueue; devices live on other nodes get a
/// targeted pub/sub event; when `offline_message_id` is set, registered
/// devices with no session anywhere get an offline-queue entry (as does any
/// local device that failed the enqueue).
async fn fan_out_to_user(
    state: &AppState,
    user_id: &str,
    exclude_device: Option<&str>,
    frame: &ServerFrame,
    offline_message_id: Option<i64>,
    offline: &mut Vec<OfflineEnqueue>,
) {
    let locals = state.registry.sessions_of(user_id).await;
    let local_ids: HashSet<String> = locals.iter().map(|s| s.device_id.clone()).collect();

    for session in &locals {
        if Some(session.device_id.as_str()) == exclude_device {
            continue;
        }
        let outcome = deliver(state, session, push_packet(state, frame.clone())).await;
        if outcome != DeliverOutcome::Sent {
            if let Some(message_id) = offline_message_id {
                offline.push(OfflineEnqueue {
                    target_user_id: user_id.to_owned(),
                    target_device_id: Some(session.device_id.clone()),
                    message_id,
                });
            }
        }
    }

    let cluster = match state.coordination.devices_online(user_id).await {
        Ok(devices) => devices,
        Err(e) => {
            warn!(user_id, error = %e, "presence lookup failed, skipping remote fan-out");
            HashSet::new()
        }
    };

    for device_id in &cluster {
        if local_ids.contains(device_id) || Some(device_id.as_str()) == exclude_device {
            continue;
        }
        let event = FanoutEvent {
            target_user_id: user_id.to_owned(),
            target_device_id: Some(device_id.clone()),
            packet: push_packet(state, frame.clone()),
        };
        if let Err(e) = state.coordination.publish(&event).await {
            warn!(user_id, device_id = %device_id, error = %e, "cross-node publish failed");
            if let Some(message_id) = offline_message_id {
                offline.push(OfflineEnqueue {
                    target_user_id: user_id.to_owned(),
                    target_device_id: Some(device_id.clone()),
                    message_id,
                });
            }
        }
    }

    let Some(message_id) = offline_message_id else {
        return;
    };
    match state.persistence.devices_of(user_id).await {
        Ok(devices) => {
            for device in devices {
                if local_ids.contains(&device.device_id)
                    || cluster.contains(&device.device_id)
                    || Some(device.device_id.as_str()) == exclude_device
                {
                    continue;
                }
                offline.push(OfflineEnqueue {
                    target_user_id: user_id.to_owned(),
                    target_device_id: Some(device.device_id),
                    message_id,
                });
            }
        }
        Err(e) => warn!(user_id, error = %e, "device list lookup failed, offline entries skipped"),
    }
}

async fn flush_offline(state: &AppState, offline: Vec<OfflineEnqueue>) {
    if offline.is_empty() {
        return;
    }
    let count = offline.len();
    if let Err(e) = state
        .persistence
        .offline_enqueue(&OfflineEnqueueRequest { entries: offline })
        .await
    {
        warn!(count, error = %e, "offline enqueue failed");
    }
}

/// Translate a pub/sub event from a peer node into local enqueues.
pub async fn deliver_fanout_event(state: &AppState, event: FanoutEvent) {
    match &event.target_device_id {
        Some(device_id) => {
            if let Some(session) = state.registry.get(device_id).await {
                if session.user_id == event.target_user_id {
                    deliver(state, &session, event.packet).await;
                }
            }
        }
        None => {
            for session in state.registry.sessions_of(&event.target_user_id).await {
                deliver(state, &session, event.packet.clone()).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// CHAT_MESSAGE
// ---------------------------------------------------------------------------

pub async fn handle_chat(
    state: &AppState,
    session: &SessionEntry,
    seq: &str,
    chat: ChatMessageData,
) {
    let principal = Principal::session(&session.user_id, &session.device_id);
    let request = SendMessageRequest {
        msg_id: chat.msg_id.clone(),
        conversation_id: chat.conversation_id,
        msg_type: chat.msg_type,
        content: chat.content,
        metadata: chat.metadata,
        quote_msg_id: chat.quote_msg_id,
        at_user_ids: chat.at_user_ids,
        client_created_at: chat.client_created_at,
    };

    let (message, created) = match state.persistence.persist_message(&principal, &request).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(msg_id = %chat.msg_id, error = %e, "message persist failed");
            let ack = ServerFrame::ChatMessageAck(ChatMessageAckData {
                msg_id: chat.msg_id,
                success: false,
                message_id: None,
                server_timestamp: None,
                error: Some(e.ack_message()),
            });
            deliver(state, session, ack.into_packet(seq, now_ms())).await;
            return;
        }
    };

    let ack = ServerFrame::ChatMessageAck(ChatMessageAckData {
        msg_id: message.msg_id.clone(),
        success: true,
        message_id: Some(message.id),
        server_timestamp: Some(message.server_created_at),
        error: None,
    });
    deliver(state, session, ack.into_packet(seq, now_ms())).await;

    if !created {
        debug!(msg_id = %message.msg_id, "duplicate msgId, fan-out suppressed");
        return;
    }
    fan_out_message(state, &session.user_id, &session.device_id, &message).await;
}

async fn fan_out_message(
    state: &AppState,
    author_id: &str,
    author_device: &str,
    message: &ChatMessage,
) {
    let (participants, _kind) = match participants_of(state, message.conversation_id).await {
        Ok(p) => p,
        Err(e) => {
            warn!(
                conversation_id = message.conversation_id,
                error = %e,
                "participant lookup failed, fan-out skipped"
            );
            return;
        }
    };

    let frame = ServerFrame::ReceiveMessage(message.clone());
    let mut offline = Vec::new();
    for user_id in &participants {
        // The authoring device already holds the ack; every other device of
        // the author still receives the message.
        let exclude = (user_id == author_id).then_some(author_device);
        fan_out_to_user(state, user_id, exclude, &frame, Some(message.id), &mut offline).await;
    }
    flush_offline(state, offline).await;
    debug!(
        msg_id = %message.msg_id,
        conversation_id = message.conversation_id,
        participants = participants.len(),
        "message fanned out"
    );
}

// ---------------------------------------------------------------------------
// RECALL_MESSAGE
// ---------------------------------------------------------------------------

pub async fn handle_recall(
    state: &AppState,
    session: &SessionEntry,
    seq: &str,
    recall: RecallData,
) {
    let principal = Principal::session(&session.user_id, &session.device_id);
    let outcome = match state.persistence.recall_message(&principal, &recall.msg_id).await {
        Ok(outcome) => outcome,
        Err(e) => {
            info!(msg_id = %recall.msg_id, error = %e, "recall rejected");
            let ack = ServerFrame::RecallAck(RecallAckData {
                msg_id: recall.msg_id,
                success: false,
                error: Some(e.ack_message()),
            });
            deliver(state, session, ack.into_packet(seq, now_ms())).await;
            return;
        }
    };

    let ack = ServerFrame::RecallAck(RecallAckData {
        msg_id: outcome.msg_id.clone(),
        success: true,
        error: None,
    });
    deliver(state, session, ack.into_packet(seq, now_ms())).await;

    let (participants, _kind) = match participants_of(state, outcome.conversation_id).await {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "participant lookup failed, recall notify skipped");
            return;
        }
    };

    // Offline devices learn about recalls through the sync delta, so no
    // offline-queue entries here.
    let frame = ServerFrame::RecallNotify(RecallNotifyData {
        msg_id: outcome.msg_id,
        conversation_id: outcome.conversation_id,
        recalled_at: outcome.recalled_at,
        recalled_by: outcome.recalled_by,
    });
    let mut unused = Vec::new();
    for user_id in &participants {
        let exclude = (user_id == &session.user_id).then_some(session.device_id.as_str());
        fan_out_to_user(state, user_id, exclude, &frame, None, &mut unused).await;
    }
}

// ---------------------------------------------------------------------------
// TYPING
// ---------------------------------------------------------------------------

pub async fn handle_typing(state: &AppState, session: &SessionEntry, typing: TypingData) {
    let (participants, _kind) = match participants_of(state, typing.conversation_id).await {
        Ok(p) => p,
        Err(e) => {
            debug!(error = %e, "participant lookup failed, typing dropped");
            return;
        }
    };
    if !participants.iter().any(|u| u == &session.user_id) {
        return;
    }

    let frame = ServerFrame::TypingNotify(TypingNotifyData {
        conversation_id: typing.conversation_id,
        user_id: session.user_id.clone(),
    });
    let mut unused = Vec::new();
    for user_id in participants.iter().filter(|u| *u != &session.user_id) {
        fan_out_to_user(state, user_id, None, &frame, None, &mut unused).await;
    }
}

// ---------------------------------------------------------------------------
// READ_ACK
// ---------------------------------------------------------------------------

pub async fn handle_read_ack(state: &AppState, session: &SessionEntry, read: ReadAckData) {
    let principal = Principal::session(&session.user_id, &session.device_id);
    let outcome = match state
        .persistence
        .mark_read(&principal, read.conversation_id, read.last_read_msg_id)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(
                conversation_id = read.conversation_id,
                error = %e,
                "read-cursor update failed"
            );
            return;
        }
    };
    if !outcome.applied {
        debug!(
            conversation_id = read.conversation_id,
            last_read_msg_id = read.last_read_msg_id,
            "stale read cursor ignored"
        );
        return;
    }

    // Reader's other devices zero their unread badge via a read-status-only
    // sync delta (sync_cursor 0 = no cursor advance).
    let update = ServerFrame::SyncResponse(SyncDelta {
        new_messages: Vec::new(),
        recalled_messages: Vec::new(),
        read_status_updates: vec![ReadStatusUpdate {
            conversation_id: outcome.conversation_id,
            user_id: session.user_id.clone(),
            last_read_msg_id: outcome.last_read_msg_id,
        }],
        conversation_updates: Vec::new(),
        sync_cursor: 0,
        has_more: false,
    });
    let mut unused = Vec::new();
    fan_out_to_user(
        state,
        &session.user_id,
        Some(&session.device_id),
        &update,
        None,
        &mut unused,
    )
    .await;

    // Private chats notify the peer's live devices.
    if let Some(peer) = outcome.notify_user_id {
        let receipt = ServerFrame::ReadReceiptNotify(ReadReceiptNotifyData {
            conversation_id: outcome.conversation_id,
            reader_id: session.user_id.clone(),
            last_read_msg_id: outcome.last_read_msg_id,
        });
        fan_out_to_user(state, &peer, None, &receipt, None, &mut unused).await;
    }
}

// ---------------------------------------------------------------------------
// SYNC_REQUEST
// ---------------------------------------------------------------------------

pub async fn handle_sync(
    state: &AppState,
    session: &SessionEntry,
    seq: &str,
    request: SyncRequestData,
) {
    let principal = Principal::session(&session.user_id, &session.device_id);
    let after = request.last_sync_cursor.unwrap_or(0);
    match state
        .persistence
        .sync_delta(&principal, after, state.config.sync_page_limit)
        .await
    {
        Ok(delta) => {
            let frame = ServerFrame::SyncResponse(delta);
            deliver(state, session, frame.into_packet(seq, now_ms())).await;
        }
        Err(e) => {
            warn!(after, error = %e, "sync delta failed");
            let frame = ServerFrame::ServerError(ServerErrorData {
                error: e.ack_message(),
            });
            deliver(state, session, frame.into_packet(seq, now_ms())).await;
        }
    }
}

// ---------------------------------------------------------------------------
// REST-layer notices (POST /internal/events)
// ---------------------------------------------------------------------------

pub async fn handle_notice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(notice): Json<GatewayNotice>,
) -> StatusCode {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(crate::auth::extract_bearer)
        .is_some_and(|token| token == state.config.persistence_token);
    if !authorized {
        return StatusCode::UNAUTHORIZED;
    }

    match notice {
        GatewayNotice::MembershipChanged { conversation_id } => {
            state.participants.invalidate(conversation_id).await;
            debug!(conversation_id, "participant cache invalidated");
            StatusCode::NO_CONTENT
        }
        GatewayNotice::Reaction {
            msg_id,
            conversation_id,
            user_id,
            reaction,
            added,
        } => {
            let (participants, _kind) = match participants_of(&state, conversation_id).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(conversation_id, error = %e, "participant lookup failed for reaction");
                    return StatusCode::BAD_GATEWAY;
                }
            };
            let frame = ServerFrame::ReactionNotify(ReactionNotifyData {
                msg_id,
                conversation_id,
                user_id,
                reaction,
                added,
            });
            let mut unused = Vec::new();
            for participant in &participants {
                fan_out_to_user(&state, participant, None, &frame, None, &mut unused).await;
            }
            StatusCode::NO_CONTENT
        }
    }
}
