//! WebSocket session lifecycle: LOGIN handshake, frame dispatch, and
//! teardown.
//!
//! Each accepted socket runs one read loop (this handler) and one writer
//! task draining the session's bounded outbound queue.  The close signal is
//! cooperative: eviction, the reaper, and the slow-consumer policy all set
//! it, and both tasks observe it at their next suspension point.

use crate::auth::{self, AuthFailure};
use crate::offline::{self, DrainState};
use crate::persistence::Principal;
use crate::registry::SessionEntry;
use crate::router;
use crate::state::{now_ms, AppState};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use lumi_protocol::{
    ClientFrame, KickedOfflineData, LoginData, LoginResponseData, Packet, ProtocolError,
    ServerErrorData, ServerFrame, UpsertDeviceRequest,
};
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Grace period for the client to read a LOGIN failure before the close.
const LOGIN_FAILURE_GRACE: Duration = Duration::from_secs(1);
/// Writer window for flushing already-queued packets after a close signal.
const WRITER_FLUSH_WINDOW: Duration = Duration::from_secs(1);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let max_frame = state.config.max_frame_bytes;
    ws.max_message_size(max_frame)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    // ---- LOGIN handshake ----
    let Some((login_seq, login)) = wait_for_login(&mut socket, &state).await else {
        return;
    };

    let identity = match auth::authenticate(&state, &login.token).await {
        Ok(identity) => identity,
        Err(failure) => {
            info!(device_id = %login.device_id, error = failure.message(), "login rejected");
            let frame = ServerFrame::LoginResponse(LoginResponseData {
                success: false,
                user_id: None,
                error: Some(failure.message().to_owned()),
            });
            let _ = send_packet(&mut socket, frame.into_packet(login_seq, now_ms())).await;
            if matches!(failure, AuthFailure::InvalidToken(_)) {
                tokio::time::sleep(LOGIN_FAILURE_GRACE).await;
            }
            return;
        }
    };

    let principal = Principal::session(&identity.user_id, &login.device_id);
    let device = UpsertDeviceRequest {
        user_id: identity.user_id.clone(),
        device_id: login.device_id.clone(),
        device_type: login.device_type,
        device_name: login.device_name.clone(),
    };
    if let Err(e) = state.persistence.upsert_device(&principal, &device).await {
        warn!(device_id = %login.device_id, error = %e, "device upsert failed");
        let frame = ServerFrame::LoginResponse(LoginResponseData {
            success: false,
            user_id: None,
            error: Some(e.ack_message()),
        });
        let _ = send_packet(&mut socket, frame.into_packet(login_seq, now_ms())).await;
        return;
    }

    // ---- bind ----
    let session_id = uuid::Uuid::new_v4().to_string();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Packet>(state.config.outbound_queue_capacity);
    let (close_tx, mut close_rx) = watch::channel(false);
    let entry = SessionEntry {
        session_id: session_id.clone(),
        user_id: identity.user_id.clone(),
        device_id: login.device_id.clone(),
        device_type: login.device_type,
        connected_at_ms: now_ms(),
        last_heartbeat_ms: Arc::new(AtomicI64::new(now_ms())),
        outbound: outbound_tx,
        close: close_tx,
    };

    let was_online = state.registry.has_user(&entry.user_id).await
        || !state
            .coordination
            .devices_online(&entry.user_id)
            .await
            .unwrap_or_default()
            .is_empty();

    if let Some(displaced) = state.registry.bind(entry.clone()).await {
        info!(
            user_id = %entry.user_id,
            device_id = %entry.device_id,
            "new login displaces prior session"
        );
        let kick = ServerFrame::KickedOffline(KickedOfflineData {
            reason: "Another device logged in".to_owned(),
        });
        let _ = displaced
            .outbound
            .try_send(kick.into_packet(state.server_seq.next(), now_ms()));
        displaced.request_close();
    }
    if let Err(e) = state
        .coordination
        .mark_online(&entry.user_id, &entry.device_id)
        .await
    {
        warn!(error = %e, "presence mark-online failed");
    }

    let ok = ServerFrame::LoginResponse(LoginResponseData {
        success: true,
        user_id: Some(identity.user_id.clone()),
        error: None,
    });
    if send_packet(&mut socket, ok.into_packet(login_seq, now_ms())).await.is_err() {
        teardown(&state, &entry, &session_id).await;
        return;
    }
    info!(user_id = %entry.user_id, device_id = %entry.device_id, "session bound");

    if !was_online {
        crate::presence::notify_change(&state, &entry.user_id, true, None).await;
    }

    let (ws_tx, ws_rx) = socket.split();
    let writer = tokio::spawn(run_writer(ws_tx, outbound_rx, close_rx.clone()));

    // Step 5 of the handshake: replay buffered messages immediately.
    let mut drain_state = offline::drain(&state, &entry).await;

    run_read_loop(&state, &entry, &mut close_rx, ws_rx, &mut drain_state).await;

    teardown(&state, &entry, &session_id).await;
    let _ = writer.await;
    info!(user_id = %entry.user_id, device_id = %entry.device_id, "session ended");
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

async fn wait_for_login(socket: &mut WebSocket, state: &AppState) -> Option<(String, LoginData)> {
    let text = match tokio::time::timeout(state.config.login_timeout, async {
        loop {
            match socket.recv().await {
                Some(Ok(Message::Text(text))) => return Some(text),
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return None,
            }
        }
    })
    .await
    {
        Ok(Some(text)) => text,
        Ok(None) => return None,
        Err(_) => {
            send_error(socket, "timeout waiting for LOGIN").await;
            return None;
        }
    };

    let packet = match Packet::parse(text.as_str(), state.config.max_frame_bytes) {
        Ok(packet) => packet,
        Err(e) => {
            send_error(socket, &format!("invalid frame: {e}")).await;
            return None;
        }
    };
    match ClientFrame::decode(&packet) {
        Ok(ClientFrame::Login(login)) => Some((packet.seq, login)),
        Ok(_) | Err(_) => {
            send_error(socket, "expected LOGIN").await;
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Read loop & dispatch
// ---------------------------------------------------------------------------

enum HandleOutcome {
    Continue,
    Close,
}

async fn run_read_loop(
    state: &AppState,
    entry: &SessionEntry,
    close_rx: &mut watch::Receiver<bool>,
    mut ws_rx: SplitStream<WebSocket>,
    drain_state: &mut Option<DrainState>,
) {
    loop {
        tokio::select! {
            biased;
            changed = close_rx.changed() => {
                if changed.is_err() || *close_rx.borrow() {
                    break;
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        // Wrap the handler so a close signal cancels
                        // in-flight work at its next suspension point.
                        let outcome = tokio::select! {
                            biased;
                            _ = close_rx.changed() => HandleOutcome::Close,
                            outcome = handle_text(state, entry, drain_state, text.as_str()) => outcome,
                        };
                        if matches!(outcome, HandleOutcome::Close) {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(device_id = %entry.device_id, "peer closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(device_id = %entry.device_id, error = %e, "socket error");
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_text(
    state: &AppState,
    entry: &SessionEntry,
    drain_state: &mut Option<DrainState>,
    text: &str,
) -> HandleOutcome {
    let packet = match Packet::parse(text, state.config.max_frame_bytes) {
        Ok(packet) => packet,
        Err(e) => {
            warn!(device_id = %entry.device_id, error = %e, "malformed frame, closing");
            deliver_error(state, entry, state.server_seq.next(), &e.to_string()).await;
            return HandleOutcome::Close;
        }
    };

    let frame = match ClientFrame::decode(&packet) {
        Ok(frame) => frame,
        Err(ProtocolError::UnknownOpcode(opcode)) => {
            warn!(device_id = %entry.device_id, opcode, "ignoring unknown opcode");
            return HandleOutcome::Continue;
        }
        Err(e) => {
            warn!(device_id = %entry.device_id, error = %e, "invalid payload, closing");
            deliver_error(state, entry, packet.seq, &e.to_string()).await;
            return HandleOutcome::Close;
        }
    };

    match frame {
        ClientFrame::Login(_) => {
            deliver_error(state, entry, packet.seq, "already authenticated").await;
            HandleOutcome::Continue
        }
        ClientFrame::Heartbeat => {
            entry.touch_heartbeat(now_ms());
            let frame = ServerFrame::HeartbeatResponse;
            router::deliver(state, entry, frame.into_packet(packet.seq, now_ms())).await;
            HandleOutcome::Continue
        }
        ClientFrame::Logout => {
            let principal = Principal::session(&entry.user_id, &entry.device_id);
            if let Err(e) = state
                .persistence
                .remove_device(&principal, &entry.device_id)
                .await
            {
                warn!(device_id = %entry.device_id, error = %e, "device removal failed");
            }
            let frame = ServerFrame::LogoutResponse;
            router::deliver(state, entry, frame.into_packet(packet.seq, now_ms())).await;
            HandleOutcome::Close
        }
        ClientFrame::ChatMessage(data) => {
            router::handle_chat(state, entry, &packet.seq, data).await;
            HandleOutcome::Continue
        }
        ClientFrame::Typing(data) => {
            router::handle_typing(state, entry, data).await;
            HandleOutcome::Continue
        }
        ClientFrame::ReadAck(data) => {
            router::handle_read_ack(state, entry, data).await;
            HandleOutcome::Continue
        }
        ClientFrame::RecallMessage(data) => {
            router::handle_recall(state, entry, &packet.seq, data).await;
            HandleOutcome::Continue
        }
        ClientFrame::SyncRequest(data) => {
            router::handle_sync(state, entry, &packet.seq, data).await;
            HandleOutcome::Continue
        }
        ClientFrame::OfflineSyncAck(data) => {
            offline::handle_ack(state, entry, drain_state, data).await;
            HandleOutcome::Continue
        }
        ClientFrame::OnlineStatusRequest(data) => {
            crate::presence::handle_status_request(state, entry, &packet.seq, data).await;
            HandleOutcome::Continue
        }
        ClientFrame::OnlineStatusSubscribe(data) => {
            crate::presence::handle_subscribe(state, entry, &packet.seq, data).await;
            HandleOutcome::Continue
        }
    }
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

async fn run_writer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Packet>,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            maybe = rx.recv() => match maybe {
                Some(packet) => {
                    let Ok(text) = packet.to_text() else { continue };
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        return;
                    }
                }
                None => break,
            },
            changed = close_rx.changed() => {
                if changed.is_err() || *close_rx.borrow() {
                    break;
                }
            }
        }
    }

    // Close path: flush what is already queued (eviction notices must reach
    // the peer), then drop the rest.
    let deadline = tokio::time::Instant::now() + WRITER_FLUSH_WINDOW;
    while let Ok(packet) = rx.try_recv() {
        let Ok(text) = packet.to_text() else { continue };
        let sent = tokio::time::timeout_at(deadline, ws_tx.send(Message::Text(text.into()))).await;
        if !matches!(sent, Ok(Ok(()))) {
            return;
        }
    }
    let _ = tokio::time::timeout_at(deadline, ws_tx.send(Message::Close(None))).await;
}

// ---------------------------------------------------------------------------
// Teardown & small helpers
// ---------------------------------------------------------------------------

async fn teardown(state: &AppState, entry: &SessionEntry, session_id: &str) {
    entry.request_close();

    // A kicked session finds its replacement bound under the same deviceId;
    // in that case presence and watcher state now belong to the newcomer.
    let Some((_, none_left_local)) = state.registry.unbind(&entry.device_id, session_id).await
    else {
        return;
    };

    let last_seen = now_ms();
    if let Err(e) = state
        .coordination
        .mark_offline(&entry.user_id, &entry.device_id, last_seen)
        .await
    {
        warn!(error = %e, "presence mark-offline failed");
    }
    crate::presence::unsubscribe_all(state, &entry.device_id).await;

    if none_left_local {
        let any_remote = !state
            .coordination
            .devices_online(&entry.user_id)
            .await
            .unwrap_or_default()
            .is_empty();
        if !any_remote {
            info!(user_id = %entry.user_id, "user offline");
            crate::presence::notify_change(state, &entry.user_id, false, Some(last_seen)).await;
        }
    }
}

async fn send_packet(socket: &mut WebSocket, packet: Packet) -> Result<(), axum::Error> {
    let text = packet.to_text().map_err(axum::Error::new)?;
    socket.send(Message::Text(text.into())).await
}

async fn send_error(socket: &mut WebSocket, message: &str) {
    let frame = ServerFrame::ServerError(ServerErrorData {
        error: message.to_owned(),
    });
    let _ = send_packet(socket, frame.into_packet("srv-0", now_ms())).await;
}

async fn deliver_error(state: &AppState, entry: &SessionEntry, seq: String, message: &str) {
    let frame = ServerFrame::ServerError(ServerErrorData {
        error: message.to_owned(),
    });
    router::deliver(state, entry, frame.into_packet(seq, now_ms())).await;
}
