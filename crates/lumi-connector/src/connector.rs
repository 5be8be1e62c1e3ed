//! The client connector: one instantiable value per device, owning the
//! socket, the login handshake, heartbeats, reconnect backoff, and
//! request/response correlation.
//!
//! # Lifecycle
//! `disconnected -> connecting -> connected -> (reconnecting ->
//! connecting)* -> disconnected`.  A KICKED_OFFLINE push clears the auth
//! state and never auto-reconnects.

use crate::backoff::reconnect_delay;
use crate::pending::PendingTable;
use crate::ConnectorError;
use futures_util::{SinkExt, StreamExt};
use lumi_protocol::{
    ClientFrame, DeviceType, LoginData, Packet, ServerFrame, SeqGen, MAX_FRAME_BYTES_DEFAULT,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// ---------------------------------------------------------------------------
// Config & events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// WebSocket URL of the gateway, e.g. `ws://chat.example:9090/ws`.
    pub url: String,
    pub token: String,
    pub device_id: String,
    pub device_type: DeviceType,
    pub device_name: Option<String>,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    pub reconnect_max_attempts: u32,
}

impl ConnectorConfig {
    pub fn new(url: &str, token: &str, device_id: &str, device_type: DeviceType) -> Self {
        Self {
            url: url.to_owned(),
            token: token.to_owned(),
            device_id: device_id.to_owned(),
            device_type,
            device_name: None,
            heartbeat_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            reconnect_base: Duration::from_millis(1000),
            reconnect_cap: Duration::from_millis(30_000),
            reconnect_max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub enum ConnectorEvent {
    Connected { user_id: String },
    Reconnecting { attempt: u32 },
    Disconnected,
    Kicked { reason: String },
    /// Any server-initiated push (RECEIVE_MESSAGE, notifications, offline
    /// drain traffic).
    Push(ServerFrame),
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

struct Inner {
    config: ConnectorConfig,
    /// Present while the connector should hold a session; cleared by
    /// `disconnect()` and by KICKED_OFFLINE.
    token: Mutex<Option<String>>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ConnectorEvent>,
    pending: PendingTable,
    out_tx: Mutex<Option<mpsc::UnboundedSender<Packet>>>,
    shutdown: Mutex<watch::Sender<bool>>,
    seq: SeqGen,
}

#[derive(Clone)]
pub struct Connector {
    inner: Arc<Inner>,
}

impl Connector {
    pub fn new(config: ConnectorConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(256);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                token: Mutex::new(None),
                state_tx,
                events_tx,
                pending: PendingTable::default(),
                out_tx: Mutex::new(None),
                shutdown: Mutex::new(shutdown_tx),
                seq: SeqGen::new("c"),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Subscribe to lifecycle events and server pushes.
    pub fn events(&self) -> broadcast::Receiver<ConnectorEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Open the socket, perform the LOGIN handshake, and start the session
    /// task.  Returns the authenticated userId.
    pub async fn connect(&self) -> Result<String, ConnectorError> {
        if self.state() != ConnectionState::Disconnected {
            return Err(ConnectorError::AlreadyConnected);
        }
        set_state(&self.inner, ConnectionState::Connecting);
        *lock(&self.inner.token) = Some(self.inner.config.token.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *lock(&self.inner.shutdown) = shutdown_tx;

        match establish(&self.inner.config, &self.inner.seq).await {
            Ok((ws, user_id)) => {
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                *lock(&self.inner.out_tx) = Some(out_tx);
                set_state(&self.inner, ConnectionState::Connected);
                emit(
                    &self.inner,
                    ConnectorEvent::Connected {
                        user_id: user_id.clone(),
                    },
                );
                tokio::spawn(run_session(self.inner.clone(), ws, out_rx, shutdown_rx));
                Ok(user_id)
            }
            Err(e) => {
                *lock(&self.inner.token) = None;
                set_state(&self.inner, ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Send a request and await the matching response (same seq), with the
    /// default timeout.
    pub async fn request(&self, frame: ClientFrame) -> Result<ServerFrame, ConnectorError> {
        self.request_with_timeout(frame, self.inner.config.request_timeout)
            .await
    }

    /// Per-call timeout override for long-running operations such as a full
    /// initial sync.
    pub async fn request_with_timeout(
        &self,
        frame: ClientFrame,
        timeout: Duration,
    ) -> Result<ServerFrame, ConnectorError> {
        let out = lock(&self.inner.out_tx)
            .clone()
            .ok_or(ConnectorError::NotConnected)?;
        let seq = self.inner.seq.next();
        let rx = self.inner.pending.register(seq.clone());
        let packet = frame.into_packet(seq.clone(), now_ms());
        if out.send(packet).is_err() {
            self.inner.pending.discard(&seq);
            return Err(ConnectorError::ConnectionClosed);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConnectorError::ConnectionClosed),
            Err(_) => {
                self.inner.pending.discard(&seq);
                Err(ConnectorError::RequestTimeout)
            }
        }
    }

    /// Fire-and-forget send (TYPING, READ_ACK, OFFLINE_SYNC_ACK).
    pub fn send(&self, frame: ClientFrame) -> Result<(), ConnectorError> {
        let out = lock(&self.inner.out_tx)
            .clone()
            .ok_or(ConnectorError::NotConnected)?;
        let packet = frame.into_packet(self.inner.seq.next(), now_ms());
        out.send(packet).map_err(|_| ConnectorError::ConnectionClosed)
    }

    /// Best-effort LOGOUT, close the socket, reject every pending request
    /// with "Connection closed", and stop reconnecting.  Pushes arriving
    /// after this point are discarded.
    pub async fn disconnect(&self) {
        *lock(&self.inner.token) = None;
        if let Some(out) = lock(&self.inner.out_tx).take() {
            let _ = out.send(ClientFrame::Logout.into_packet(self.inner.seq.next(), now_ms()));
        }
        let _ = lock(&self.inner.shutdown).send(true);
        self.inner.pending.reject_all(ConnectorError::ConnectionClosed);
        set_state(&self.inner, ConnectionState::Disconnected);
        emit(&self.inner, ConnectorEvent::Disconnected);
    }

    /// Number of requests still awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

async fn run_session(
    inner: Arc<Inner>,
    mut ws: WsStream,
    mut out_rx: mpsc::UnboundedReceiver<Packet>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    'session: loop {
        let mut heartbeat = tokio::time::interval(inner.config.heartbeat_interval);
        heartbeat.tick().await;
        let mut kicked = false;

        loop {
            tokio::select! {
                biased;
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        let _ = ws.close(None).await;
                        return;
                    }
                }
                maybe = out_rx.recv() => match maybe {
                    Some(packet) => {
                        let Ok(text) = packet.to_text() else { continue };
                        if ws.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                incoming = ws.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if handle_incoming(&inner, text.as_str()) {
                                kicked = true;
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = ws.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(error = %e, "socket error");
                            break;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    let packet = ClientFrame::Heartbeat.into_packet(inner.seq.next(), now_ms());
                    let Ok(text) = packet.to_text() else { continue };
                    if ws.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
            }
        }

        // Connection lost.
        let _ = ws.close(None).await;
        *lock(&inner.out_tx) = None;
        inner.pending.reject_all(ConnectorError::ConnectionClosed);

        if kicked || lock(&inner.token).is_none() {
            set_state(&inner, ConnectionState::Disconnected);
            emit(&inner, ConnectorEvent::Disconnected);
            return;
        }

        // Reconnect with exponential backoff; a fresh LOGIN replays missed
        // traffic through the gateway's offline drain.
        for attempt in 1..=inner.config.reconnect_max_attempts {
            set_state(&inner, ConnectionState::Reconnecting);
            emit(&inner, ConnectorEvent::Reconnecting { attempt });
            let delay = reconnect_delay(
                attempt,
                inner.config.reconnect_base,
                inner.config.reconnect_cap,
            );
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
            if lock(&inner.token).is_none() {
                set_state(&inner, ConnectionState::Disconnected);
                return;
            }

            set_state(&inner, ConnectionState::Connecting);
            match establish(&inner.config, &inner.seq).await {
                Ok((new_ws, user_id)) => {
                    let (out_tx, new_out_rx) = mpsc::unbounded_channel();
                    *lock(&inner.out_tx) = Some(out_tx);
                    out_rx = new_out_rx;
                    ws = new_ws;
                    set_state(&inner, ConnectionState::Connected);
                    emit(&inner, ConnectorEvent::Connected { user_id });
                    info!(attempt, "reconnected");
                    continue 'session;
                }
                Err(ConnectorError::LoginRejected(reason)) => {
                    // Re-auth is out of band; retrying would loop forever.
                    warn!(reason = %reason, "reconnect login rejected");
                    *lock(&inner.token) = None;
                    set_state(&inner, ConnectionState::Disconnected);
                    emit(&inner, ConnectorEvent::Disconnected);
                    return;
                }
                Err(e) => {
                    debug!(attempt, error = %e, "reconnect attempt failed");
                }
            }
        }

        set_state(&inner, ConnectionState::Disconnected);
        emit(&inner, ConnectorEvent::Disconnected);
        return;
    }
}

/// Returns true when the frame was a KICKED_OFFLINE.
fn handle_incoming(inner: &Arc<Inner>, text: &str) -> bool {
    let packet = match Packet::parse(text, MAX_FRAME_BYTES_DEFAULT) {
        Ok(packet) => packet,
        Err(e) => {
            warn!(error = %e, "dropping malformed server frame");
            return false;
        }
    };
    let frame = match ServerFrame::decode(&packet) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "dropping undecodable server frame");
            return false;
        }
    };

    if inner.pending.resolve(&packet.seq, frame.clone()) {
        return false;
    }

    match frame {
        ServerFrame::KickedOffline(kick) => {
            info!(reason = %kick.reason, "kicked offline, clearing auth state");
            *lock(&inner.token) = None;
            emit(inner, ConnectorEvent::Kicked { reason: kick.reason });
            true
        }
        frame if frame.opcode().is_push() => {
            let _ = inner.events_tx.send(ConnectorEvent::Push(frame));
            false
        }
        frame => {
            // A response whose request already timed out (or a stray
            // heartbeat reply); drop it.
            debug!(opcode = frame.opcode().as_u16(), "unmatched response dropped");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

async fn establish(
    config: &ConnectorConfig,
    seq: &SeqGen,
) -> Result<(WsStream, String), ConnectorError> {
    let (mut ws, _response) = tokio_tungstenite::connect_async(config.url.as_str())
        .await
        .map_err(|e| ConnectorError::Connect(e.to_string()))?;

    let login = ClientFrame::Login(LoginData {
        token: config.token.clone(),
        device_id: config.device_id.clone(),
        device_type: config.device_type,
        device_name: config.device_name.clone(),
    });
    let packet = login.into_packet(seq.next(), now_ms());
    let text = packet
        .to_text()
        .map_err(|e| ConnectorError::Protocol(e.to_string()))?;
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| ConnectorError::Connect(e.to_string()))?;

    let response = tokio::time::timeout(config.request_timeout, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return Some(text),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Ok(_)) => continue,
                Some(Err(_)) => return None,
            }
        }
    })
    .await
    .map_err(|_| ConnectorError::Connect("timeout waiting for LOGIN_RESPONSE".to_owned()))?
    .ok_or_else(|| ConnectorError::Connect("closed during login".to_owned()))?;

    let packet = Packet::parse(response.as_str(), MAX_FRAME_BYTES_DEFAULT)
        .map_err(|e| ConnectorError::Protocol(e.to_string()))?;
    match ServerFrame::decode(&packet) {
        Ok(ServerFrame::LoginResponse(data)) if data.success => {
            let user_id = data.user_id.unwrap_or_default();
            Ok((ws, user_id))
        }
        Ok(ServerFrame::LoginResponse(data)) => Err(ConnectorError::LoginRejected(
            data.error.unwrap_or_else(|| "login rejected".to_owned()),
        )),
        Ok(ServerFrame::ServerError(data)) => Err(ConnectorError::LoginRejected(data.error)),
        Ok(other) => Err(ConnectorError::Protocol(format!(
            "expected LOGIN_RESPONSE, got {:?}",
            other.opcode()
        ))),
        Err(e) => Err(ConnectorError::Protocol(e.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Small helpers
// ---------------------------------------------------------------------------

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().expect("connector lock poisoned")
}

fn set_state(inner: &Arc<Inner>, state: ConnectionState) {
    let _ = inner.state_tx.send(state);
}

fn emit(inner: &Arc<Inner>, event: ConnectorEvent) {
    let _ = inner.events_tx.send(event);
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
