//! Presence aggregation and ONLINE_STATUS handling.
//!
//! Presence is derived from the cluster-wide device set; `activeDevices`
//! types come from the device directory.  Watchers registered through
//! ONLINE_STATUS_SUBSCRIBE get ONLINE_STATUS_CHANGE pushes on transitions
//! observed by this node.

use crate::registry::SessionEntry;
use crate::router::deliver;
use crate::state::{now_ms, AppState};
use lumi_protocol::{
    OnlineStatusChangeData, OnlineStatusRequestData, OnlineStatusResponseData,
    OnlineStatusSubscribeData, PresenceStatus, ServerFrame,
};
use tracing::{debug, warn};

pub async fn snapshot(state: &AppState, user_ids: &[String]) -> Vec<PresenceStatus> {
    let mut statuses = Vec::with_capacity(user_ids.len());
    for user_id in user_ids {
        let online_devices = match state.coordination.devices_online(user_id).await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "presence lookup failed");
                Default::default()
            }
        };
        let online = !online_devices.is_empty();

        let last_seen = if online {
            None
        } else {
            state.coordination.last_seen(user_id).await.ok().flatten()
        };

        let active_devices = if online {
            match state.persistence.devices_of(user_id).await {
                Ok(devices) => devices
                    .into_iter()
                    .filter(|d| online_devices.contains(&d.device_id))
                    .map(|d| d.device_type)
                    .collect(),
                Err(e) => {
                    debug!(user_id = %user_id, error = %e, "device directory lookup failed");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        statuses.push(PresenceStatus {
            user_id: user_id.clone(),
            online,
            last_seen,
            active_devices,
        });
    }
    statuses
}

pub async fn handle_status_request(
    state: &AppState,
    session: &SessionEntry,
    seq: &str,
    request: OnlineStatusRequestData,
) {
    let statuses = snapshot(state, &request.user_ids).await;
    let frame = ServerFrame::OnlineStatusResponse(OnlineStatusResponseData { statuses });
    deliver(state, session, frame.into_packet(seq, now_ms())).await;
}

/// Register the session as a watcher and reply with the current snapshot.
pub async fn handle_subscribe(
    state: &AppState,
    session: &SessionEntry,
    seq: &str,
    request: OnlineStatusSubscribeData,
) {
    {
        let mut watchers = state.presence_watchers.write().await;
        for user_id in &request.user_ids {
            watchers
                .entry(user_id.clone())
                .or_default()
                .insert(session.device_id.clone());
        }
    }
    let statuses = snapshot(state, &request.user_ids).await;
    let frame = ServerFrame::OnlineStatusResponse(OnlineStatusResponseData { statuses });
    deliver(state, session, frame.into_packet(seq, now_ms())).await;
}

/// Drop every watch registration held by a departing device.
pub async fn unsubscribe_all(state: &AppState, device_id: &str) {
    let mut watchers = state.presence_watchers.write().await;
    watchers.retain(|_, devices| {
        devices.remove(device_id);
        !devices.is_empty()
    });
}

/// Push ONLINE_STATUS_CHANGE to every local watcher of `user_id`.
pub async fn notify_change(state: &AppState, user_id: &str, online: bool, last_seen: Option<i64>) {
    let watcher_devices: Vec<String> = {
        let watchers = state.presence_watchers.read().await;
        match watchers.get(user_id) {
            Some(devices) => devices.iter().cloned().collect(),
            None => return,
        }
    };

    let data = OnlineStatusChangeData {
        user_id: user_id.to_owned(),
        online,
        last_seen,
    };
    for device_id in watcher_devices {
        if let Some(session) = state.registry.get(&device_id).await {
            let frame = ServerFrame::OnlineStatusChange(data.clone());
            let packet = frame.into_packet(state.server_seq.next(), now_ms());
            deliver(state, &session, packet).await;
        }
    }
}
