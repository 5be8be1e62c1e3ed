//! Scripted mock gateway for exercising the client connector.
//!
//! Accepts connections on a random port, performs the LOGIN handshake, and
//! answers requests with canned responses.  Behavior knobs cover the
//! connector's failure paths: rejected tokens, silent opcodes (to provoke
//! request timeouts), post-login drops (to provoke reconnects), and an
//! immediate kick.

use futures_util::{SinkExt, StreamExt};
use lumi_protocol::{
    ChatMessageAckData, ClientFrame, KickedOfflineData, LoginResponseData, Opcode, Packet,
    ServerFrame, SyncDelta, MAX_FRAME_BYTES_DEFAULT,
};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::Message;

#[derive(Default)]
pub struct MockGatewayBehavior {
    /// Tokens answered with `LOGIN_RESPONSE {success:false}`.
    pub reject_tokens: HashSet<String>,
    /// Request opcodes that get no response (request-timeout tests).
    pub silent_opcodes: HashSet<u16>,
    /// Drop this many connections right after a successful login
    /// (reconnect tests).
    pub drop_after_login: usize,
    /// Push KICKED_OFFLINE right after a successful login.
    pub kick_after_login: bool,
}

pub struct MockGateway {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockGateway {
    pub async fn start(behavior: MockGatewayBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock gateway");
        let addr = listener.local_addr().expect("local addr");
        let behavior = Arc::new(behavior);
        let drops_left = Arc::new(AtomicUsize::new(behavior.drop_after_login));
        let accepted = Arc::new(AtomicUsize::new(0));
        let seq = Arc::new(AtomicU64::new(0));

        let accepted_clone = accepted.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _peer)) = listener.accept().await else {
                    break;
                };
                accepted_clone.fetch_add(1, Ordering::SeqCst);
                let behavior = behavior.clone();
                let drops_left = drops_left.clone();
                let seq = seq.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, behavior, drops_left, seq).await;
                });
            }
        });

        Self {
            addr,
            accepted,
            _task: task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// How many connections have been accepted so far.
    pub fn accepted_connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

fn server_seq(seq: &AtomicU64) -> String {
    format!("srv-{}", seq.fetch_add(1, Ordering::Relaxed) + 1)
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    behavior: Arc<MockGatewayBehavior>,
    drops_left: Arc<AtomicUsize>,
    seq: Arc<AtomicU64>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut ws = tokio_tungstenite::accept_async(stream).await?;

    // ---- LOGIN ----
    let login_packet = loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                break Packet::parse(text.as_str(), MAX_FRAME_BYTES_DEFAULT)?;
            }
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    };
    let login = match ClientFrame::decode(&login_packet)? {
        ClientFrame::Login(login) => login,
        _ => return Ok(()),
    };

    if behavior.reject_tokens.contains(&login.token) {
        let frame = ServerFrame::LoginResponse(LoginResponseData {
            success: false,
            user_id: None,
            error: Some("invalid token".to_owned()),
        });
        send(&mut ws, frame.into_packet(login_packet.seq, crate::now_ms())).await?;
        return Ok(());
    }

    let frame = ServerFrame::LoginResponse(LoginResponseData {
        success: true,
        user_id: Some(format!("user-of-{}", login.device_id)),
        error: None,
    });
    send(&mut ws, frame.into_packet(login_packet.seq, crate::now_ms())).await?;

    if drops_left
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        let _ = ws.close(None).await;
        return Ok(());
    }

    if behavior.kick_after_login {
        let kick = ServerFrame::KickedOffline(KickedOfflineData {
            reason: "Another device logged in".to_owned(),
        });
        send(&mut ws, kick.into_packet(server_seq(&seq), crate::now_ms())).await?;
        let _ = ws.close(None).await;
        return Ok(());
    }

    // ---- canned request handling ----
    while let Some(message) = ws.next().await {
        let text = match message? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            Message::Ping(data) => {
                ws.send(Message::Pong(data)).await?;
                continue;
            }
            _ => continue,
        };
        let packet = Packet::parse(text.as_str(), MAX_FRAME_BYTES_DEFAULT)?;
        if behavior.silent_opcodes.contains(&packet.opcode) {
            continue;
        }
        let response = match Opcode::from_u16(packet.opcode) {
            Some(Opcode::Heartbeat) => Some(ServerFrame::HeartbeatResponse),
            Some(Opcode::Logout) => Some(ServerFrame::LogoutResponse),
            Some(Opcode::ChatMessage) => {
                let frame = ClientFrame::decode(&packet)?;
                match frame {
                    ClientFrame::ChatMessage(chat) => {
                        Some(ServerFrame::ChatMessageAck(ChatMessageAckData {
                            msg_id: chat.msg_id,
                            success: true,
                            message_id: Some(1),
                            server_timestamp: Some(crate::now_ms()),
                            error: None,
                        }))
                    }
                    _ => None,
                }
            }
            Some(Opcode::SyncRequest) => Some(ServerFrame::SyncResponse(SyncDelta {
                new_messages: Vec::new(),
                recalled_messages: Vec::new(),
                read_status_updates: Vec::new(),
                conversation_updates: Vec::new(),
                sync_cursor: 0,
                has_more: false,
            })),
            _ => None,
        };
        if let Some(frame) = response {
            send(&mut ws, frame.into_packet(packet.seq, crate::now_ms())).await?;
        }
    }

    Ok(())
}

async fn send(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    packet: Packet,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let text = packet.to_text()?;
    ws.send(Message::Text(text.into())).await?;
    Ok(())
}
