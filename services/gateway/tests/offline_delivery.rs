//! Offline queue: buffering for offline devices, drain on login, ack
//! semantics (at-least-once until acked), chunking, and TTL reaping.

mod common;

use common::{start_gateway, start_gateway_with};
use lumi_protocol::{
    ChatMessageData, ClientFrame, ConversationKind, DeviceType, MsgType, OfflineSyncAckData,
    ServerFrame,
};
use lumi_test_utils::TestClient;
use std::time::Duration;

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

async fn drain_login(client: &mut TestClient, token: &str, device: &str) {
    assert!(client.login(token, device, DeviceType::Web).await.success);
    client
        .recv_until(|f| matches!(f, ServerFrame::OfflineSyncComplete(_)))
        .await;
}

/// Collect one full drain: OFFLINE_SYNC_RESPONSE chunks until the COMPLETE
/// marker.  Returns (entry ids, message msgIds, total, has_more).
async fn collect_drain(client: &mut TestClient) -> (Vec<i64>, Vec<String>, u32, bool) {
    let mut entry_ids = Vec::new();
    let mut msg_ids = Vec::new();
    loop {
        let (_, frame) = client
            .recv_until(|f| {
                matches!(
                    f,
                    ServerFrame::OfflineSyncResponse(_) | ServerFrame::OfflineSyncComplete(_)
                )
            })
            .await
            .expect("drain frame");
        match frame {
            ServerFrame::OfflineSyncResponse(chunk) => {
                for item in chunk.messages {
                    entry_ids.push(item.entry_id);
                    msg_ids.push(item.message.msg_id);
                }
            }
            ServerFrame::OfflineSyncComplete(complete) => {
                return (entry_ids, msg_ids, complete.total_delivered, complete.has_more);
            }
            _ => unreachable!(),
        }
    }
}

#[tokio::test]
async fn offline_message_is_delivered_on_login_and_not_after_ack() {
    let harness = start_gateway().await;
    harness.persistence.register_token("tok-a", "userA", "A");
    harness.persistence.register_token("tok-b", "userB", "B");
    harness
        .persistence
        .add_conversation(11, &["userA", "userB"], ConversationKind::PrivateChat);
    harness.persistence.add_device("userB", "d-b", DeviceType::Ios);

    // A sends while B is offline.
    let mut a = TestClient::connect(&harness.ws_url()).await;
    drain_login(&mut a, "tok-a", "d-a").await;
    a.send_frame(chat("m2", 11, "missed you")).await;
    a.recv_until(|f| matches!(f, ServerFrame::ChatMessageAck(_)))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.persistence.pending_offline_count("userB"), 1);

    // B logs in and receives the buffered message.
    let mut b = TestClient::connect(&harness.ws_url()).await;
    assert!(b.login("tok-b", "d-b", DeviceType::Ios).await.success);
    let (entry_ids, msg_ids, total, has_more) = collect_drain(&mut b).await;
    assert_eq!(msg_ids, vec!["m2".to_owned()]);
    assert_eq!(total, 1);
    assert!(!has_more);

    b.send_frame(ClientFrame::OfflineSyncAck(OfflineSyncAckData {
        offline_message_ids: Some(entry_ids),
        last_message_id: None,
        mark_all_delivered: None,
    }))
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.persistence.pending_offline_count("userB"), 0);
    b.close().await;

    // Log out and back in: no redelivery.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut b2 = TestClient::connect(&harness.ws_url()).await;
    assert!(b2.login("tok-b", "d-b", DeviceType::Ios).await.success);
    let (_, msg_ids, total, _) = collect_drain(&mut b2).await;
    assert!(msg_ids.is_empty(), "acked entries must not redeliver");
    assert_eq!(total, 0);
    a.close().await;
    b2.close().await;
}

#[tokio::test]
async fn unacked_entries_redeliver_on_the_next_login() {
    let harness = start_gateway().await;
    harness.persistence.register_token("tok-a", "userA", "A");
    harness.persistence.register_token("tok-b", "userB", "B");
    harness
        .persistence
        .add_conversation(12, &["userA", "userB"], ConversationKind::PrivateChat);
    harness.persistence.add_device("userB", "d-b", DeviceType::Web);

    let mut a = TestClient::connect(&harness.ws_url()).await;
    drain_login(&mut a, "tok-a", "d-a").await;
    a.send_frame(chat("m-lost", 12, "fragile")).await;
    a.recv_until(|f| matches!(f, ServerFrame::ChatMessageAck(_)))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // First login receives but drops before acking.
    let mut b = TestClient::connect(&harness.ws_url()).await;
    assert!(b.login("tok-b", "d-b", DeviceType::Web).await.success);
    let (_, msg_ids, _, _) = collect_drain(&mut b).await;
    assert_eq!(msg_ids, vec!["m-lost".to_owned()]);
    b.close().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Second login: still pending, redelivered (client dedupes by msgId).
    let mut b2 = TestClient::connect(&harness.ws_url()).await;
    assert!(b2.login("tok-b", "d-b", DeviceType::Web).await.success);
    let (entry_ids, msg_ids, _, _) = collect_drain(&mut b2).await;
    assert_eq!(msg_ids, vec!["m-lost".to_owned()]);

    b2.send_frame(ClientFrame::OfflineSyncAck(OfflineSyncAckData {
        offline_message_ids: Some(entry_ids),
        last_message_id: None,
        mark_all_delivered: None,
    }))
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.persistence.pending_offline_count("userB"), 0);
    a.close().await;
    b2.close().await;
}

#[tokio::test]
async fn mark_all_delivered_acks_the_whole_drain() {
    let harness = start_gateway().await;
    harness.persistence.register_token("tok-a", "userA", "A");
    harness.persistence.register_token("tok-b", "userB", "B");
    harness
        .persistence
        .add_conversation(13, &["userA", "userB"], ConversationKind::PrivateChat);
    harness.persistence.add_device("userB", "d-b", DeviceType::Web);

    let mut a = TestClient::connect(&harness.ws_url()).await;
    drain_login(&mut a, "tok-a", "d-a").await;
    for i in 0..3 {
        a.send_frame(chat(&format!("m-all-{i}"), 13, "bulk")).await;
        a.recv_until(|f| matches!(f, ServerFrame::ChatMessageAck(_)))
            .await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.persistence.pending_offline_count("userB"), 3);

    let mut b = TestClient::connect(&harness.ws_url()).await;
    assert!(b.login("tok-b", "d-b", DeviceType::Web).await.success);
    let (_, msg_ids, total, _) = collect_drain(&mut b).await;
    assert_eq!(total, 3);
    assert_eq!(msg_ids.len(), 3);

    b.send_frame(ClientFrame::OfflineSyncAck(OfflineSyncAckData {
        offline_message_ids: None,
        last_message_id: None,
        mark_all_delivered: Some(true),
    }))
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.persistence.pending_offline_count("userB"), 0);
    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn drain_chunks_respect_the_configured_size_and_id_order() {
    let harness = start_gateway_with(|config| {
        config.offline_chunk_size = 2;
    })
    .await;
    harness.persistence.register_token("tok-a", "userA", "A");
    harness.persistence.register_token("tok-b", "userB", "B");
    harness
        .persistence
        .add_conversation(14, &["userA", "userB"], ConversationKind::PrivateChat);
    harness.persistence.add_device("userB", "d-b", DeviceType::Web);

    let mut a = TestClient::connect(&harness.ws_url()).await;
    drain_login(&mut a, "tok-a", "d-a").await;
    for i in 0..5 {
        a.send_frame(chat(&format!("m-chunk-{i}"), 14, "chunked")).await;
        a.recv_until(|f| matches!(f, ServerFrame::ChatMessageAck(_)))
            .await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut b = TestClient::connect(&harness.ws_url()).await;
    assert!(b.login("tok-b", "d-b", DeviceType::Web).await.success);

    let mut chunk_sizes = Vec::new();
    let mut delivered_ids: Vec<i64> = Vec::new();
    loop {
        let (_, frame) = b
            .recv_until(|f| {
                matches!(
                    f,
                    ServerFrame::OfflineSyncResponse(_) | ServerFrame::OfflineSyncComplete(_)
                )
            })
            .await
            .expect("drain frame");
        match frame {
            ServerFrame::OfflineSyncResponse(chunk) => {
                chunk_sizes.push(chunk.messages.len());
                delivered_ids.extend(chunk.messages.iter().map(|m| m.message.id));
            }
            ServerFrame::OfflineSyncComplete(complete) => {
                assert_eq!(complete.total_delivered, 5);
                break;
            }
            _ => unreachable!(),
        }
    }
    assert_eq!(chunk_sizes, vec![2, 2, 1]);
    let mut sorted = delivered_ids.clone();
    sorted.sort_unstable();
    assert_eq!(delivered_ids, sorted, "monotonic id order");
    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn expired_entries_are_reaped_and_never_delivered() {
    let harness = start_gateway().await;
    harness.persistence.register_token("tok-a", "userA", "A");
    harness.persistence.register_token("tok-b", "userB", "B");
    harness
        .persistence
        .add_conversation(15, &["userA", "userB"], ConversationKind::PrivateChat);
    harness.persistence.add_device("userB", "d-b", DeviceType::Web);

    let mut a = TestClient::connect(&harness.ws_url()).await;
    drain_login(&mut a, "tok-a", "d-a").await;
    a.send_frame(chat("m-stale", 15, "ancient")).await;
    a.recv_until(|f| matches!(f, ServerFrame::ChatMessageAck(_)))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Push the entry past the 7-day TTL, then reap.
    let eight_days_ms = 8 * 24 * 60 * 60 * 1000;
    harness
        .persistence
        .backdate_offline_entries(lumi_test_utils::now_ms() - eight_days_ms);
    let reaped = harness
        .state
        .persistence
        .offline_reap()
        .await
        .expect("reap call")
        .reaped;
    assert_eq!(reaped, 1);

    let mut b = TestClient::connect(&harness.ws_url()).await;
    assert!(b.login("tok-b", "d-b", DeviceType::Web).await.success);
    let (_, msg_ids, total, _) = collect_drain(&mut b).await;
    assert!(msg_ids.is_empty());
    assert_eq!(total, 0);
    a.close().await;
    b.close().await;
}
