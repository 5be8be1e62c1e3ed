//! End-to-end: the real client connector against the real gateway with the
//! mock Persistence Service behind it.

mod common;

use common::start_gateway;
use lumi_connector::{ConnectionState, Connector, ConnectorConfig, ConnectorEvent};
use lumi_protocol::{
    ChatMessageData, ClientFrame, ConversationKind, DeviceType, MsgType, ServerFrame,
};
use std::time::Duration;

fn connector(harness: &common::Harness, token: &str, device: &str) -> Connector {
    Connector::new(ConnectorConfig::new(
        &harness.ws_url(),
        token,
        device,
        DeviceType::Web,
    ))
}

fn chat(msg_id: &str, conversation_id: i64, content: &str) -> ClientFrame {
    ClientFrame::ChatMessage(ChatMessageData {
        msg_id: msg_id.to_owned(),
        conversation_id,
        msg_type: MsgType::Text,
        content: content.to_owned(),
        metadata: None,
        quote_msg_id: None,
        at_user_ids: None,
        client_created_at: lumi_test_utils::now_ms(),
    })
}

async fn next_event(
    events: &mut tokio::sync::broadcast::Receiver<ConnectorEvent>,
    mut predicate: impl FnMut(&ConnectorEvent) -> bool,
) -> ConnectorEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event stream");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event in time")
}

#[tokio::test]
async fn connector_logs_in_and_requests_round_trip() {
    let harness = start_gateway().await;
    harness.persistence.register_token("tok-a", "userA", "A");
    harness
        .persistence
        .add_conversation(61, &["userA", "userB"], ConversationKind::PrivateChat);

    let client = connector(&harness, "tok-a", "d-a");
    let mut events = client.events();
    let user_id = client.connect().await.expect("connect");
    assert_eq!(user_id, "userA");
    assert_eq!(client.state(), ConnectionState::Connected);

    // The login drain arrives as a push.
    next_event(&mut events, |e| {
        matches!(
            e,
            ConnectorEvent::Push(ServerFrame::OfflineSyncComplete(_))
        )
    })
    .await;

    let response = client
        .request(chat("e2e-1", 61, "over the connector"))
        .await
        .expect("chat request");
    match response {
        ServerFrame::ChatMessageAck(ack) => {
            assert!(ack.success);
            assert_eq!(ack.msg_id, "e2e-1");
        }
        other => panic!("expected ChatMessageAck, got {other:?}"),
    }
    assert_eq!(client.pending_requests(), 0);
    client.disconnect().await;
}

#[tokio::test]
async fn pushes_flow_between_two_connectors() {
    let harness = start_gateway().await;
    harness.persistence.register_token("tok-a", "userA", "A");
    harness.persistence.register_token("tok-b", "userB", "B");
    harness
        .persistence
        .add_conversation(62, &["userA", "userB"], ConversationKind::PrivateChat);

    let sender = connector(&harness, "tok-a", "d-a");
    sender.connect().await.expect("sender connect");

    let receiver = connector(&harness, "tok-b", "d-b");
    let mut receiver_events = receiver.events();
    receiver.connect().await.expect("receiver connect");

    sender
        .request(chat("e2e-push", 62, "incoming"))
        .await
        .expect("send");

    let event = next_event(&mut receiver_events, |e| {
        matches!(e, ConnectorEvent::Push(ServerFrame::ReceiveMessage(_)))
    })
    .await;
    match event {
        ConnectorEvent::Push(ServerFrame::ReceiveMessage(message)) => {
            assert_eq!(message.msg_id, "e2e-push");
            assert_eq!(message.sender_id, "userA");
        }
        _ => unreachable!(),
    }
    sender.disconnect().await;
    receiver.disconnect().await;
}

#[tokio::test]
async fn kicked_connector_clears_auth_and_does_not_reconnect() {
    let harness = start_gateway().await;
    harness.persistence.register_token("tok-a", "userA", "A");

    let first = connector(&harness, "tok-a", "d-shared");
    let mut first_events = first.events();
    first.connect().await.expect("first connect");

    let second = connector(&harness, "tok-a", "d-shared");
    second.connect().await.expect("second connect");

    let event = next_event(&mut first_events, |e| {
        matches!(e, ConnectorEvent::Kicked { .. })
    })
    .await;
    match event {
        ConnectorEvent::Kicked { reason } => {
            assert_eq!(reason, "Another device logged in");
        }
        _ => unreachable!(),
    }

    next_event(&mut first_events, |e| {
        matches!(e, ConnectorEvent::Disconnected)
    })
    .await;
    assert_eq!(first.state(), ConnectionState::Disconnected);

    // No reconnect: the gateway must still hold exactly one session for
    // the device, owned by the second connector.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(harness.state.registry.sessions_of("userA").await.len(), 1);
    second.disconnect().await;
}

#[tokio::test]
async fn disconnect_leaves_no_pending_requests() {
    let harness = start_gateway().await;
    harness.persistence.register_token("tok-a", "userA", "A");

    let client = connector(&harness, "tok-a", "d-a");
    client.connect().await.expect("connect");
    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.pending_requests(), 0);

    // Requests after disconnect fail fast.
    let err = client
        .request(ClientFrame::Heartbeat)
        .await
        .expect_err("disconnected request must fail");
    assert!(matches!(err, lumi_connector::ConnectorError::NotConnected));
}
