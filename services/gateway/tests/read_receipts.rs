//! READ_ACK: monotone read cursor, private-chat receipts, and read-status
//! propagation to the reader's other devices.

mod common;

use common::start_gateway;
use lumi_protocol::{
    ChatMessageData, ClientFrame, ConversationKind, DeviceType, MsgType, ReadAckData, ServerFrame,
};
use lumi_test_utils::TestClient;
use std::time::Duration;

fn chat(msg_id: &str, conversation_id: i64) -> ClientFrame {
    ClientFrame::ChatMessage(ChatMessageData {
        msg_id: msg_id.to_owned(),
        conversation_id,
        msg_type: MsgType::Text,
        content: "ping".to_owned(),
        metadata: None,
        quote_msg_id: None,
        at_user_ids: None,
        client_created_at: lumi_test_utils::now_ms(),
    })
}

async fn drain_login(client: &mut TestClient, token: &str, device: &str) {
    assert!(client.login(token, device, DeviceType::Web).await.success);
    client
        .recv_until(|f| matches!(f, ServerFrame::OfflineSyncComplete(_)))
        .await;
}

#[tokio::test]
async fn private_chat_read_notifies_peer_and_readers_other_devices() {
    let harness = start_gateway().await;
    harness.persistence.register_token("tok-a", "userA", "A");
    harness.persistence.register_token("tok-b", "userB", "B");
    harness
        .persistence
        .add_conversation(21, &["userA", "userB"], ConversationKind::PrivateChat);

    let mut a = TestClient::connect(&harness.ws_url()).await;
    drain_login(&mut a, "tok-a", "d-a").await;
    let mut b1 = TestClient::connect(&harness.ws_url()).await;
    drain_login(&mut b1, "tok-b", "d-b1").await;
    let mut b2 = TestClient::connect(&harness.ws_url()).await;
    drain_login(&mut b2, "tok-b", "d-b2").await;

    // A sends two messages so B has something to read.
    a.send_frame(chat("r-1", 21)).await;
    a.recv_until(|f| matches!(f, ServerFrame::ChatMessageAck(_)))
        .await;
    a.send_frame(chat("r-2", 21)).await;
    let (_, ack) = a
        .recv_until(|f| matches!(f, ServerFrame::ChatMessageAck(_)))
        .await
        .expect("second ack");
    let last_id = match ack {
        ServerFrame::ChatMessageAck(data) => data.message_id.expect("message id"),
        _ => unreachable!(),
    };
    b1.recv_until(|f| matches!(f, ServerFrame::ReceiveMessage(m) if m.msg_id == "r-2"))
        .await;
    b2.recv_until(|f| matches!(f, ServerFrame::ReceiveMessage(m) if m.msg_id == "r-2"))
        .await;

    // B reads on d-b1.
    b1.send_frame(ClientFrame::ReadAck(ReadAckData {
        conversation_id: 21,
        last_read_msg_id: last_id,
    }))
    .await;

    // A's devices get the receipt.
    let (_, frame) = a
        .recv_until(|f| matches!(f, ServerFrame::ReadReceiptNotify(_)))
        .await
        .expect("read receipt");
    match frame {
        ServerFrame::ReadReceiptNotify(data) => {
            assert_eq!(data.conversation_id, 21);
            assert_eq!(data.reader_id, "userB");
            assert_eq!(data.last_read_msg_id, last_id);
        }
        _ => unreachable!(),
    }

    // B's other device gets a read-status update that zeroes its badge.
    let (_, frame) = b2
        .recv_until(|f| matches!(f, ServerFrame::SyncResponse(_)))
        .await
        .expect("read-status sync push");
    match frame {
        ServerFrame::SyncResponse(delta) => {
            assert_eq!(delta.read_status_updates.len(), 1);
            assert_eq!(delta.read_status_updates[0].conversation_id, 21);
            assert_eq!(delta.read_status_updates[0].user_id, "userB");
            assert_eq!(delta.read_status_updates[0].last_read_msg_id, last_id);
            assert!(delta.new_messages.is_empty());
        }
        _ => unreachable!(),
    }

    // The issuing device gets no packet back.
    assert!(
        b1.recv_packet_timeout(Duration::from_millis(300)).await.is_none(),
        "READ_ACK is not answered on the issuing device"
    );

    assert_eq!(harness.persistence.read_cursor("userB", 21), Some(last_id));
    a.close().await;
    b1.close().await;
    b2.close().await;
}

#[tokio::test]
async fn stale_read_ack_is_silently_ignored() {
    let harness = start_gateway().await;
    harness.persistence.register_token("tok-a", "userA", "A");
    harness.persistence.register_token("tok-b", "userB", "B");
    harness
        .persistence
        .add_conversation(22, &["userA", "userB"], ConversationKind::PrivateChat);

    let mut a = TestClient::connect(&harness.ws_url()).await;
    drain_login(&mut a, "tok-a", "d-a").await;
    let mut b = TestClient::connect(&harness.ws_url()).await;
    drain_login(&mut b, "tok-b", "d-b").await;

    a.send_frame(chat("s-1", 22)).await;
    let (_, ack) = a
        .recv_until(|f| matches!(f, ServerFrame::ChatMessageAck(_)))
        .await
        .expect("ack");
    let last_id = match ack {
        ServerFrame::ChatMessageAck(data) => data.message_id.expect("message id"),
        _ => unreachable!(),
    };
    b.recv_until(|f| matches!(f, ServerFrame::ReceiveMessage(_)))
        .await;

    b.send_frame(ClientFrame::ReadAck(ReadAckData {
        conversation_id: 22,
        last_read_msg_id: last_id,
    }))
    .await;
    a.recv_until(|f| matches!(f, ServerFrame::ReadReceiptNotify(_)))
        .await
        .expect("first receipt");

    // A lower cursor must be a no-op: no receipt, cursor unchanged.
    b.send_frame(ClientFrame::ReadAck(ReadAckData {
        conversation_id: 22,
        last_read_msg_id: last_id - 1,
    }))
    .await;
    assert!(
        a.recv_packet_timeout(Duration::from_millis(300)).await.is_none(),
        "stale read must not produce a receipt"
    );
    assert_eq!(harness.persistence.read_cursor("userB", 22), Some(last_id));
    a.close().await;
    b.close().await;
}
