//! Offline queue drain: replay buffered messages to a freshly bound
//! session, then wait for the client's ack before marking entries
//! delivered (at-least-once; the client dedupes by msgId).

use crate::registry::SessionEntry;
use crate::router::{deliver, DeliverOutcome};
use crate::state::{now_ms, AppState};
use lumi_protocol::{
    ChatMessage, OfflineAckRequest, OfflineMessage, OfflineSyncAckData, OfflineSyncCompleteData,
    OfflineSyncResponseData, ServerFrame,
};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Bookkeeping between the drain push and the client's OFFLINE_SYNC_ACK.
pub struct DrainState {
    pub entry_ids: Vec<i64>,
    pub has_more: bool,
}

/// Drain pending entries for the session's device (and the user's
/// all-device entries), in monotonic message-id order, chunked.  Entries
/// stay pending until acked; a disconnect before the ack redelivers them on
/// the next login.
pub async fn drain(state: &AppState, session: &SessionEntry) -> Option<DrainState> {
    let pending = match state
        .persistence
        .offline_pending(
            &session.user_id,
            &session.device_id,
            state.config.offline_drain_batch,
        )
        .await
    {
        Ok(pending) => pending,
        Err(e) => {
            warn!(
                user_id = %session.user_id,
                device_id = %session.device_id,
                error = %e,
                "offline queue lookup failed, drain skipped"
            );
            return None;
        }
    };

    if pending.entries.is_empty() {
        let complete = ServerFrame::OfflineSyncComplete(OfflineSyncCompleteData {
            total_delivered: 0,
            has_more: false,
        });
        deliver(
            state,
            session,
            complete.into_packet(state.server_seq.next(), now_ms()),
        )
        .await;
        return None;
    }

    let message_ids: Vec<i64> = pending.entries.iter().map(|e| e.message_id).collect();
    let messages = match state.persistence.messages_batch(&message_ids).await {
        Ok(messages) => messages,
        Err(e) => {
            warn!(error = %e, "offline message batch load failed, drain skipped");
            return None;
        }
    };
    let by_id: HashMap<i64, ChatMessage> =
        messages.into_iter().map(|m| (m.id, m)).collect();

    let mut items: Vec<OfflineMessage> = pending
        .entries
        .iter()
        .filter_map(|entry| {
            by_id.get(&entry.message_id).map(|message| OfflineMessage {
                entry_id: entry.id,
                message: message.clone(),
            })
        })
        .collect();
    items.sort_by_key(|item| item.message.id);

    let total = items.len();
    for chunk in items.chunks(state.config.offline_chunk_size.max(1)) {
        let frame = ServerFrame::OfflineSyncResponse(OfflineSyncResponseData {
            messages: chunk.to_vec(),
        });
        let outcome = deliver(
            state,
            session,
            frame.into_packet(state.server_seq.next(), now_ms()),
        )
        .await;
        if outcome != DeliverOutcome::Sent {
            // Entries stay pending; the next login retries the drain.
            return None;
        }
    }

    let complete = ServerFrame::OfflineSyncComplete(OfflineSyncCompleteData {
        total_delivered: total as u32,
        has_more: pending.has_more,
    });
    deliver(
        state,
        session,
        complete.into_packet(state.server_seq.next(), now_ms()),
    )
    .await;

    info!(
        user_id = %session.user_id,
        device_id = %session.device_id,
        delivered = total,
        has_more = pending.has_more,
        "offline drain pushed"
    );
    Some(DrainState {
        entry_ids: items.into_iter().map(|i| i.entry_id).collect(),
        has_more: pending.has_more,
    })
}

/// Apply the client's ack, then continue draining if the last batch was
/// truncated.
pub async fn handle_ack(
    state: &AppState,
    session: &SessionEntry,
    drain_state: &mut Option<DrainState>,
    ack: OfflineSyncAckData,
) {
    let request = OfflineAckRequest {
        user_id: session.user_id.clone(),
        device_id: session.device_id.clone(),
        entry_ids: ack.offline_message_ids,
        last_message_id: ack.last_message_id,
        mark_all_delivered: ack.mark_all_delivered.unwrap_or(false),
    };
    match state.persistence.offline_ack(&request).await {
        Ok(response) => {
            debug!(
                user_id = %session.user_id,
                device_id = %session.device_id,
                acked = response.acked,
                "offline entries acked"
            );
        }
        Err(e) => {
            warn!(error = %e, "offline ack failed, entries stay pending");
            return;
        }
    }

    let had_more = drain_state.as_ref().is_some_and(|d| d.has_more);
    *drain_state = if had_more {
        drain(state, session).await
    } else {
        None
    };
}
