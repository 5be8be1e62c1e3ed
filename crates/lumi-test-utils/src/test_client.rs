//! Packet-level WebSocket client for driving a gateway in tests.

use futures_util::{SinkExt, StreamExt};
use lumi_protocol::{
    ClientFrame, DeviceType, LoginData, LoginResponseData, Packet, ServerFrame,
    MAX_FRAME_BYTES_DEFAULT,
};
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestClient {
    ws: WsStream,
    next_seq: u64,
}

impl TestClient {
    pub async fn connect(url: &str) -> Self {
        let (ws, _response) = tokio_tungstenite::connect_async(url)
            .await
            .expect("test client connect");
        Self { ws, next_seq: 0 }
    }

    fn seq(&mut self) -> String {
        self.next_seq += 1;
        format!("t-{}", self.next_seq)
    }

    /// Send a typed frame; returns the seq used so responses can be matched.
    pub async fn send_frame(&mut self, frame: ClientFrame) -> String {
        let seq = self.seq();
        let packet = frame.into_packet(seq.clone(), crate::now_ms());
        self.send_packet(packet).await;
        seq
    }

    pub async fn send_packet(&mut self, packet: Packet) {
        let text = packet.to_text().expect("serialize packet");
        self.send_raw(&text).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_owned().into()))
            .await
            .expect("test client send");
    }

    /// Receive the next text frame as a packet, within the default timeout.
    pub async fn recv_packet(&mut self) -> Option<Packet> {
        self.recv_packet_timeout(RECV_TIMEOUT).await
    }

    /// Receive with an explicit timeout; `None` on timeout or close.  Handy
    /// for asserting that nothing arrives.
    pub async fn recv_packet_timeout(&mut self, timeout: Duration) -> Option<Packet> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let message = tokio::time::timeout_at(deadline, self.ws.next())
                .await
                .ok()??;
            match message {
                Ok(Message::Text(text)) => {
                    return Some(
                        Packet::parse(text.as_str(), MAX_FRAME_BYTES_DEFAULT)
                            .expect("parse server packet"),
                    );
                }
                Ok(Message::Ping(data)) => {
                    let _ = self.ws.send(Message::Pong(data)).await;
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    pub async fn recv_frame(&mut self) -> Option<(String, ServerFrame)> {
        let packet = self.recv_packet().await?;
        let frame = ServerFrame::decode(&packet).expect("decode server frame");
        Some((packet.seq, frame))
    }

    /// Skip frames until `predicate` matches, bounded by the recv timeout
    /// per frame.
    pub async fn recv_until(
        &mut self,
        mut predicate: impl FnMut(&ServerFrame) -> bool,
    ) -> Option<(String, ServerFrame)> {
        loop {
            let (seq, frame) = self.recv_frame().await?;
            if predicate(&frame) {
                return Some((seq, frame));
            }
        }
    }

    /// Full LOGIN handshake; returns the response payload.
    pub async fn login(
        &mut self,
        token: &str,
        device_id: &str,
        device_type: DeviceType,
    ) -> LoginResponseData {
        let seq = self
            .send_frame(ClientFrame::Login(LoginData {
                token: token.to_owned(),
                device_id: device_id.to_owned(),
                device_type,
                device_name: None,
            }))
            .await;
        let (response_seq, frame) = self
            .recv_until(|f| matches!(f, ServerFrame::LoginResponse(_)))
            .await
            .expect("login response");
        assert_eq!(response_seq, seq, "LOGIN_RESPONSE must echo the LOGIN seq");
        match frame {
            ServerFrame::LoginResponse(data) => data,
            _ => unreachable!(),
        }
    }

    /// True when the server closes (or drops) the connection without
    /// further frames.
    pub async fn expect_closed(&mut self) -> bool {
        self.recv_packet().await.is_none()
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
