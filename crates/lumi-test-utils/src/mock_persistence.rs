//! In-memory mock of the Persistence Service `/internal` API.
//!
//! Binds to port 0 (random) and exposes the bound address; each test spins
//! up its own isolated instance.  Behavior follows the frozen contract:
//! idempotent message persist on msgId, 403 on non-participant sends and
//! out-of-window recalls, monotone read cursors, at-most-once offline
//! entries on `(messageId, targetDeviceId)`.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use lumi_protocol::{
    AuthenticateRequest, AuthenticateResponse, ChatMessage, ConversationKind, ConversationUpdate,
    DeviceRecord, DeviceType, HttpErrorEnvelope, MarkReadOutcome, MarkReadRequest,
    MessageBatchRequest, OfflineAckRequest, OfflineAckResponse, OfflineEnqueueRequest,
    OfflineEntry, OfflinePendingResponse, ParticipantsResponse, ReadStatusUpdate, ReapResponse,
    RecallOutcome, RecallRecord, SendMessageRequest, SyncDelta, UpsertDeviceRequest,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

const USER_HEADER: &str = "x-internal-user-id";
const DEVICE_HEADER: &str = "x-internal-device-id";

#[derive(Default)]
struct StoreInner {
    tokens: HashMap<String, (String, String)>,
    devices: HashMap<(String, String), DeviceRecord>,
    conversations: HashMap<i64, (Vec<String>, ConversationKind)>,
    messages: Vec<ChatMessage>,
    by_msg_id: HashMap<String, usize>,
    next_message_id: i64,
    read_cursors: HashMap<(String, i64), i64>,
    offline: Vec<OfflineRow>,
    next_entry_id: i64,
    recall_window_ms: i64,
    offline_ttl_ms: i64,
}

#[derive(Clone)]
struct OfflineRow {
    entry: OfflineEntry,
    delivered_at: Option<i64>,
}

#[derive(Clone, Default)]
struct Store {
    inner: Arc<Mutex<StoreInner>>,
}

impl Store {
    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().expect("mock persistence lock poisoned")
    }
}

pub struct MockPersistence {
    addr: SocketAddr,
    store: Store,
    _task: tokio::task::JoinHandle<()>,
}

impl MockPersistence {
    pub async fn start() -> Self {
        let store = Store::default();
        {
            let mut inner = store.lock();
            inner.next_message_id = 1;
            inner.next_entry_id = 1;
            inner.recall_window_ms = 120_000;
            inner.offline_ttl_ms = 7 * 24 * 60 * 60 * 1000;
        }

        let router = Router::new()
            .route("/internal/auth/tokens", post(authenticate))
            .route("/internal/devices", put(upsert_device))
            .route("/internal/devices/{device_id}", delete(remove_device))
            .route("/internal/users/{user_id}/devices", get(list_devices))
            .route("/internal/messages", post(persist_message))
            .route("/internal/messages/batch", post(messages_batch))
            .route("/internal/messages/{msg_id}/recall", put(recall_message))
            .route(
                "/internal/conversations/{id}/participants",
                get(participants),
            )
            .route(
                "/internal/conversations/{id}/messages",
                get(conversation_messages),
            )
            .route("/internal/conversations/{id}/read", post(mark_read))
            .route("/internal/offline", post(offline_enqueue).get(offline_pending))
            .route("/internal/offline/ack", post(offline_ack))
            .route("/internal/offline/expired", delete(offline_reap))
            .route("/internal/sync", get(sync_delta))
            .with_state(store.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock persistence");
        let addr = listener.local_addr().expect("local addr");
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Self {
            addr,
            store,
            _task: task,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    // -----------------------------------------------------------------------
    // Seeding knobs
    // -----------------------------------------------------------------------

    pub fn register_token(&self, token: &str, user_id: &str, nickname: &str) {
        self.store
            .lock()
            .tokens
            .insert(token.to_owned(), (user_id.to_owned(), nickname.to_owned()));
    }

    pub fn add_conversation(&self, id: i64, participants: &[&str], kind: ConversationKind) {
        self.store.lock().conversations.insert(
            id,
            (
                participants.iter().map(|p| (*p).to_owned()).collect(),
                kind,
            ),
        );
    }

    /// Register a device without a login, so fan-out can target it while
    /// its owner is offline.
    pub fn add_device(&self, user_id: &str, device_id: &str, device_type: DeviceType) {
        let now = crate::now_ms();
        self.store.lock().devices.insert(
            (user_id.to_owned(), device_id.to_owned()),
            DeviceRecord {
                device_id: device_id.to_owned(),
                user_id: user_id.to_owned(),
                device_type,
                device_name: None,
                push_token: None,
                created_at: now,
                last_active_at: now,
            },
        );
    }

    /// Shift a stored message's server timestamp, for recall-window tests.
    pub fn backdate_message(&self, msg_id: &str, server_created_at: i64) {
        let mut inner = self.store.lock();
        if let Some(&index) = inner.by_msg_id.get(msg_id) {
            inner.messages[index].server_created_at = server_created_at;
        }
    }

    /// Shift an offline entry's creation time, for TTL reap tests.
    pub fn backdate_offline_entries(&self, created_at: i64) {
        let mut inner = self.store.lock();
        for row in &mut inner.offline {
            row.entry.created_at = created_at;
        }
    }

    // -----------------------------------------------------------------------
    // Assertion helpers
    // -----------------------------------------------------------------------

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.store.lock().messages.clone()
    }

    pub fn offline_entries(&self) -> Vec<OfflineEntry> {
        self.store
            .lock()
            .offline
            .iter()
            .map(|row| row.entry.clone())
            .collect()
    }

    pub fn pending_offline_count(&self, user_id: &str) -> usize {
        self.store
            .lock()
            .offline
            .iter()
            .filter(|row| row.entry.target_user_id == user_id && row.delivered_at.is_none())
            .count()
    }

    pub fn read_cursor(&self, user_id: &str, conversation_id: i64) -> Option<i64> {
        self.store
            .lock()
            .read_cursors
            .get(&(user_id.to_owned(), conversation_id))
            .copied()
    }

    pub fn has_device(&self, user_id: &str, device_id: &str) -> bool {
        self.store
            .lock()
            .devices
            .contains_key(&(user_id.to_owned(), device_id.to_owned()))
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(HttpErrorEnvelope {
            code: code.to_owned(),
            message: message.to_owned(),
        }),
    )
        .into_response()
}

fn principal(headers: &HeaderMap) -> (String, String) {
    let user = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    let device = headers
        .get(DEVICE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    (user, device)
}

async fn authenticate(
    State(store): State<Store>,
    Json(request): Json<AuthenticateRequest>,
) -> Response {
    let inner = store.lock();
    match inner.tokens.get(&request.token) {
        Some((user_id, nickname)) => Json(AuthenticateResponse {
            user_id: user_id.clone(),
            nickname: nickname.clone(),
            expires_in_seconds: 3600,
        })
        .into_response(),
        None => error_response(StatusCode::UNAUTHORIZED, "INVALID_TOKEN", "unknown token"),
    }
}

async fn upsert_device(
    State(store): State<Store>,
    Json(request): Json<UpsertDeviceRequest>,
) -> StatusCode {
    let now = crate::now_ms();
    let mut inner = store.lock();
    let key = (request.user_id.clone(), request.device_id.clone());
    let record = inner.devices.entry(key).or_insert_with(|| DeviceRecord {
        device_id: request.device_id.clone(),
        user_id: request.user_id.clone(),
        device_type: request.device_type,
        device_name: request.device_name.clone(),
        push_token: None,
        created_at: now,
        last_active_at: now,
    });
    record.device_type = request.device_type;
    record.device_name = request.device_name;
    record.last_active_at = now;
    StatusCode::NO_CONTENT
}

async fn remove_device(
    State(store): State<Store>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
) -> StatusCode {
    let (user_id, _) = principal(&headers);
    store.lock().devices.remove(&(user_id, device_id));
    StatusCode::NO_CONTENT
}

async fn list_devices(
    State(store): State<Store>,
    Path(user_id): Path<String>,
) -> Json<Vec<DeviceRecord>> {
    let inner = store.lock();
    let mut devices: Vec<DeviceRecord> = inner
        .devices
        .values()
        .filter(|d| d.user_id == user_id)
        .cloned()
        .collect();
    devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
    Json(devices)
}

async fn persist_message(
    State(store): State<Store>,
    headers: HeaderMap,
    Json(request): Json<SendMessageRequest>,
) -> Response {
    let (sender_id, sender_device_id) = principal(&headers);
    let mut inner = store.lock();

    // Idempotent replay returns the first outcome.
    if let Some(&index) = inner.by_msg_id.get(&request.msg_id) {
        return Json(inner.messages[index].clone()).into_response();
    }

    let Some((participant_ids, _kind)) = inner.conversations.get(&request.conversation_id).cloned()
    else {
        return error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "unknown conversation");
    };
    if !participant_ids.contains(&sender_id) {
        return error_response(
            StatusCode::FORBIDDEN,
            "NOT_A_PARTICIPANT",
            "sender is not a participant",
        );
    }

    let id = inner.next_message_id;
    inner.next_message_id += 1;
    let message = ChatMessage {
        id,
        msg_id: request.msg_id.clone(),
        conversation_id: request.conversation_id,
        sender_id,
        sender_device_id,
        msg_type: request.msg_type,
        content: request.content,
        metadata: request.metadata,
        quote_msg_id: request.quote_msg_id,
        at_user_ids: request.at_user_ids,
        client_created_at: request.client_created_at,
        server_created_at: crate::now_ms(),
        recalled_at: None,
    };
    inner.messages.push(message.clone());
    let index = inner.messages.len() - 1;
    inner.by_msg_id.insert(request.msg_id, index);
    (StatusCode::CREATED, Json(message)).into_response()
}

async fn messages_batch(
    State(store): State<Store>,
    Json(request): Json<MessageBatchRequest>,
) -> Json<Vec<ChatMessage>> {
    let inner = store.lock();
    let mut messages: Vec<ChatMessage> = inner
        .messages
        .iter()
        .filter(|m| request.ids.contains(&m.id))
        .cloned()
        .collect();
    messages.sort_by_key(|m| m.id);
    Json(messages)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecallQuery {
    window_seconds: Option<i64>,
}

async fn recall_message(
    State(store): State<Store>,
    headers: HeaderMap,
    Path(msg_id): Path<String>,
    Query(query): Query<RecallQuery>,
) -> Response {
    let (user_id, _) = principal(&headers);
    let now = crate::now_ms();
    let mut inner = store.lock();
    let window = query
        .window_seconds
        .map(|s| s * 1000)
        .unwrap_or(inner.recall_window_ms);

    let Some(&index) = inner.by_msg_id.get(&msg_id) else {
        return error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "unknown message");
    };
    let message = &mut inner.messages[index];
    if message.sender_id != user_id {
        return error_response(StatusCode::FORBIDDEN, "NOT_SENDER", "not the sender");
    }
    if now - message.server_created_at > window {
        return error_response(StatusCode::FORBIDDEN, "WINDOW_EXPIRED", "window expired");
    }
    message.recalled_at = Some(now);
    Json(RecallOutcome {
        msg_id,
        conversation_id: message.conversation_id,
        recalled_at: now,
        recalled_by: user_id,
    })
    .into_response()
}

async fn participants(State(store): State<Store>, Path(id): Path<i64>) -> Response {
    let inner = store.lock();
    match inner.conversations.get(&id) {
        Some((participant_ids, kind)) => Json(ParticipantsResponse {
            participant_ids: participant_ids.clone(),
            kind: *kind,
        })
        .into_response(),
        None => error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "unknown conversation"),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagesQuery {
    #[serde(default)]
    after_id: i64,
    #[serde(default = "default_messages_limit")]
    limit: usize,
}

fn default_messages_limit() -> usize {
    100
}

async fn conversation_messages(
    State(store): State<Store>,
    Path(id): Path<i64>,
    Query(query): Query<MessagesQuery>,
) -> Json<Vec<ChatMessage>> {
    let inner = store.lock();
    let mut messages: Vec<ChatMessage> = inner
        .messages
        .iter()
        .filter(|m| m.conversation_id == id && m.id > query.after_id)
        .cloned()
        .collect();
    messages.sort_by_key(|m| m.id);
    messages.truncate(query.limit.min(100));
    Json(messages)
}

async fn mark_read(
    State(store): State<Store>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(request): Json<MarkReadRequest>,
) -> Response {
    let (reader_id, _) = principal(&headers);
    let mut inner = store.lock();
    let Some((participant_ids, kind)) = inner.conversations.get(&id).cloned() else {
        return error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "unknown conversation");
    };

    let key = (reader_id.clone(), id);
    let current = inner.read_cursors.get(&key).copied().unwrap_or(0);
    let applied = request.last_read_msg_id > current;
    if applied {
        inner.read_cursors.insert(key, request.last_read_msg_id);
    }

    let notify_user_id = (kind == ConversationKind::PrivateChat && applied)
        .then(|| {
            participant_ids
                .iter()
                .find(|p| **p != reader_id)
                .cloned()
        })
        .flatten();

    Json(MarkReadOutcome {
        conversation_id: id,
        last_read_msg_id: if applied {
            request.last_read_msg_id
        } else {
            current
        },
        reader_id,
        applied,
        notify_user_id,
    })
    .into_response()
}

async fn offline_enqueue(
    State(store): State<Store>,
    Json(request): Json<OfflineEnqueueRequest>,
) -> StatusCode {
    let now = crate::now_ms();
    let mut inner = store.lock();
    for enqueue in request.entries {
        let duplicate = inner.offline.iter().any(|row| {
            row.entry.message_id == enqueue.message_id
                && row.entry.target_device_id == enqueue.target_device_id
                && row.entry.target_user_id == enqueue.target_user_id
        });
        if duplicate {
            continue;
        }
        let id = inner.next_entry_id;
        inner.next_entry_id += 1;
        inner.offline.push(OfflineRow {
            entry: OfflineEntry {
                id,
                target_user_id: enqueue.target_user_id,
                target_device_id: enqueue.target_device_id,
                message_id: enqueue.message_id,
                created_at: now,
            },
            delivered_at: None,
        });
    }
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfflineQuery {
    user_id: String,
    device_id: String,
    #[serde(default = "default_offline_limit")]
    limit: usize,
}

fn default_offline_limit() -> usize {
    500
}

async fn offline_pending(
    State(store): State<Store>,
    Query(query): Query<OfflineQuery>,
) -> Json<OfflinePendingResponse> {
    let now = crate::now_ms();
    let inner = store.lock();
    let ttl = inner.offline_ttl_ms;
    let mut pending: Vec<OfflineEntry> = inner
        .offline
        .iter()
        .filter(|row| {
            row.delivered_at.is_none()
                && row.entry.created_at + ttl > now
                && row.entry.target_user_id == query.user_id
                && row
                    .entry
                    .target_device_id
                    .as_deref()
                    .is_none_or(|d| d == query.device_id)
        })
        .map(|row| row.entry.clone())
        .collect();
    pending.sort_by_key(|e| e.created_at);
    let has_more = pending.len() > query.limit;
    pending.truncate(query.limit);
    Json(OfflinePendingResponse {
        entries: pending,
        has_more,
    })
}

async fn offline_ack(
    State(store): State<Store>,
    Json(request): Json<OfflineAckRequest>,
) -> Json<OfflineAckResponse> {
    let now = crate::now_ms();
    let mut inner = store.lock();
    let mut acked = 0;
    for row in &mut inner.offline {
        if row.delivered_at.is_some() {
            continue;
        }
        if row.entry.target_user_id != request.user_id {
            continue;
        }
        if row
            .entry
            .target_device_id
            .as_deref()
            .is_some_and(|d| d != request.device_id)
        {
            continue;
        }
        let matches = request.mark_all_delivered
            || request
                .entry_ids
                .as_ref()
                .is_some_and(|ids| ids.contains(&row.entry.id))
            || request
                .last_message_id
                .is_some_and(|last| row.entry.message_id <= last);
        if matches {
            row.delivered_at = Some(now);
            acked += 1;
        }
    }
    Json(OfflineAckResponse { acked })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReapQuery {
    ttl_days: Option<i64>,
}

async fn offline_reap(State(store): State<Store>, Query(query): Query<ReapQuery>) -> Json<ReapResponse> {
    let now = crate::now_ms();
    let mut inner = store.lock();
    let ttl = query
        .ttl_days
        .map(|d| d * 24 * 60 * 60 * 1000)
        .unwrap_or(inner.offline_ttl_ms);
    let before = inner.offline.len();
    inner
        .offline
        .retain(|row| row.delivered_at.is_some() || row.entry.created_at + ttl > now);
    Json(ReapResponse {
        reaped: (before - inner.offline.len()) as u64,
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncQuery {
    user_id: String,
    #[serde(default)]
    #[allow(dead_code)]
    device_id: String,
    #[serde(default)]
    after_id: i64,
    #[serde(default = "default_offline_limit")]
    limit: usize,
}

async fn sync_delta(State(store): State<Store>, Query(query): Query<SyncQuery>) -> Json<SyncDelta> {
    let inner = store.lock();
    let member_conversations: Vec<i64> = inner
        .conversations
        .iter()
        .filter(|(_, (participants, _))| participants.contains(&query.user_id))
        .map(|(id, _)| *id)
        .collect();

    let mut fresh: Vec<ChatMessage> = inner
        .messages
        .iter()
        .filter(|m| m.id > query.after_id && member_conversations.contains(&m.conversation_id))
        .cloned()
        .collect();
    fresh.sort_by_key(|m| m.id);
    let has_more = fresh.len() > query.limit;
    fresh.truncate(query.limit);

    let recalled: Vec<RecallRecord> = fresh
        .iter()
        .filter_map(|m| {
            m.recalled_at.map(|at| RecallRecord {
                msg_id: m.msg_id.clone(),
                conversation_id: m.conversation_id,
                recalled_at: at,
                recalled_by: m.sender_id.clone(),
            })
        })
        .collect();
    let new_messages: Vec<ChatMessage> = fresh
        .into_iter()
        .filter(|m| m.recalled_at.is_none())
        .collect();

    let read_status_updates: Vec<ReadStatusUpdate> = inner
        .read_cursors
        .iter()
        .filter(|((user, _), _)| *user == query.user_id)
        .map(|((user, conversation_id), last_read)| ReadStatusUpdate {
            conversation_id: *conversation_id,
            user_id: user.clone(),
            last_read_msg_id: *last_read,
        })
        .collect();

    let conversation_updates: Vec<ConversationUpdate> = member_conversations
        .iter()
        .filter_map(|id| {
            inner.conversations.get(id).map(|(participants, kind)| {
                ConversationUpdate {
                    conversation_id: *id,
                    kind: *kind,
                    participant_ids: participants.clone(),
                }
            })
        })
        .collect();

    let sync_cursor = new_messages
        .iter()
        .map(|m| m.id)
        .chain(std::iter::once(query.after_id))
        .max()
        .unwrap_or(0);

    Json(SyncDelta {
        new_messages,
        recalled_messages: recalled,
        read_status_updates,
        conversation_updates,
        sync_cursor,
        has_more,
    })
}
