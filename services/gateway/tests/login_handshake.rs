//! LOGIN handshake, heartbeat, protocol-error policy, and logout.

mod common;

use common::{start_gateway, start_gateway_with};
use lumi_protocol::{ClientFrame, DeviceType, Packet, ServerFrame};
use lumi_test_utils::TestClient;
use std::time::Duration;

#[tokio::test]
async fn login_succeeds_and_registers_the_device() {
    let harness = start_gateway().await;
    harness.persistence.register_token("tok-u1", "u1", "Ada");

    let mut client = TestClient::connect(&harness.ws_url()).await;
    let response = client.login("tok-u1", "d1", DeviceType::Web).await;
    assert!(response.success);
    assert_eq!(response.user_id.as_deref(), Some("u1"));
    assert!(response.error.is_none());
    assert!(harness.persistence.has_device("u1", "d1"));

    // The drain for a fresh device reports an empty backlog.
    let (_, frame) = client
        .recv_until(|f| matches!(f, ServerFrame::OfflineSyncComplete(_)))
        .await
        .expect("offline sync complete");
    match frame {
        ServerFrame::OfflineSyncComplete(data) => {
            assert_eq!(data.total_delivered, 0);
            assert!(!data.has_more);
        }
        _ => unreachable!(),
    }
    client.close().await;
}

#[tokio::test]
async fn invalid_token_is_rejected_and_the_connection_closes() {
    let harness = start_gateway().await;

    let mut client = TestClient::connect(&harness.ws_url()).await;
    let response = client.login("no-such-token", "d1", DeviceType::Web).await;
    assert!(!response.success);
    assert!(response.user_id.is_none());
    assert!(response.error.is_some());
    assert!(client.expect_closed().await);
}

#[tokio::test]
async fn first_packet_other_than_login_closes_with_server_error() {
    let harness = start_gateway().await;

    let mut client = TestClient::connect(&harness.ws_url()).await;
    client.send_frame(ClientFrame::Heartbeat).await;
    let (_, frame) = client.recv_frame().await.expect("server error frame");
    assert!(matches!(frame, ServerFrame::ServerError(_)));
    assert!(client.expect_closed().await);
}

#[tokio::test]
async fn heartbeat_gets_a_response_echoing_the_seq() {
    let harness = start_gateway().await;
    harness.persistence.register_token("tok-u1", "u1", "Ada");

    let mut client = TestClient::connect(&harness.ws_url()).await;
    client.login("tok-u1", "d1", DeviceType::Web).await;
    client
        .recv_until(|f| matches!(f, ServerFrame::OfflineSyncComplete(_)))
        .await;

    let seq = client.send_frame(ClientFrame::Heartbeat).await;
    let (response_seq, frame) = client.recv_frame().await.expect("heartbeat response");
    assert_eq!(response_seq, seq);
    assert!(matches!(frame, ServerFrame::HeartbeatResponse));
    client.close().await;
}

#[tokio::test]
async fn unknown_opcode_is_dropped_without_closing() {
    let harness = start_gateway().await;
    harness.persistence.register_token("tok-u1", "u1", "Ada");

    let mut client = TestClient::connect(&harness.ws_url()).await;
    client.login("tok-u1", "d1", DeviceType::Web).await;
    client
        .recv_until(|f| matches!(f, ServerFrame::OfflineSyncComplete(_)))
        .await;

    let bogus = Packet {
        opcode: 77,
        seq: "t-bogus".to_owned(),
        data: serde_json::json!({}),
        timestamp: 0,
    };
    client.send_packet(bogus).await;

    // The session must still be alive and serving requests.
    let seq = client.send_frame(ClientFrame::Heartbeat).await;
    let (response_seq, frame) = client.recv_frame().await.expect("heartbeat after unknown");
    assert_eq!(response_seq, seq);
    assert!(matches!(frame, ServerFrame::HeartbeatResponse));
    client.close().await;
}

#[tokio::test]
async fn malformed_frame_closes_the_connection() {
    let harness = start_gateway().await;
    harness.persistence.register_token("tok-u1", "u1", "Ada");

    let mut client = TestClient::connect(&harness.ws_url()).await;
    client.login("tok-u1", "d1", DeviceType::Web).await;
    client
        .recv_until(|f| matches!(f, ServerFrame::OfflineSyncComplete(_)))
        .await;

    client.send_raw("{definitely not a packet").await;
    let (_, frame) = client.recv_frame().await.expect("server error");
    assert!(matches!(frame, ServerFrame::ServerError(_)));
    assert!(client.expect_closed().await);
}

#[tokio::test]
async fn oversize_frame_closes_the_connection() {
    let harness = start_gateway_with(|config| {
        config.max_frame_bytes = 512;
    })
    .await;
    harness.persistence.register_token("tok-u1", "u1", "Ada");

    let mut client = TestClient::connect(&harness.ws_url()).await;
    client.login("tok-u1", "d1", DeviceType::Web).await;
    client
        .recv_until(|f| matches!(f, ServerFrame::OfflineSyncComplete(_)))
        .await;

    let huge = format!(
        r#"{{"type":3,"seq":"t-big","data":{{"pad":"{}"}},"timestamp":0}}"#,
        "x".repeat(2048)
    );
    client.send_raw(&huge).await;
    assert!(
        client
            .recv_until(|f| !matches!(f, ServerFrame::ServerError(_)))
            .await
            .is_none(),
        "only a SERVER_ERROR (if anything) may precede the close"
    );
}

#[tokio::test]
async fn logout_removes_the_device_and_closes() {
    let harness = start_gateway().await;
    harness.persistence.register_token("tok-u1", "u1", "Ada");

    let mut client = TestClient::connect(&harness.ws_url()).await;
    client.login("tok-u1", "d1", DeviceType::Web).await;
    client
        .recv_until(|f| matches!(f, ServerFrame::OfflineSyncComplete(_)))
        .await;
    assert!(harness.persistence.has_device("u1", "d1"));

    let seq = client.send_frame(ClientFrame::Logout).await;
    let (response_seq, frame) = client.recv_frame().await.expect("logout response");
    assert_eq!(response_seq, seq);
    assert!(matches!(frame, ServerFrame::LogoutResponse));
    assert!(client.expect_closed().await);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!harness.persistence.has_device("u1", "d1"));
    assert!(harness.state.registry.get("d1").await.is_none());
}

#[tokio::test]
async fn login_timeout_is_enforced() {
    let harness = start_gateway_with(|config| {
        config.login_timeout = Duration::from_millis(100);
    })
    .await;

    let mut client = TestClient::connect(&harness.ws_url()).await;
    let (_, frame) = client.recv_frame().await.expect("timeout error");
    assert!(matches!(frame, ServerFrame::ServerError(_)));
    assert!(client.expect_closed().await);
}
