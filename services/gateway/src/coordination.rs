//! Coordination store: cluster-wide presence set and cross-node fan-out.
//!
//! Single-node deployments (no `COORDINATION_URL`) run on
//! [`LocalCoordination`], which mirrors only this node's sessions and
//! publishes to nobody.  Multi-node deployments use a redis-compatible
//! store: presence lives in `presence:device:{userId}` sets, fan-out events
//! travel as JSON on channels `user.{userId}`.

use crate::error::CoordinationError;
use async_trait::async_trait;
use lumi_protocol::FanoutEvent;
use redis::AsyncCommands;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[async_trait]
pub trait Coordination: Send + Sync {
    /// Record a device as online somewhere in the cluster.
    async fn mark_online(&self, user_id: &str, device_id: &str) -> Result<(), CoordinationError>;

    /// Remove a device from the cluster presence set and stamp last-seen.
    async fn mark_offline(
        &self,
        user_id: &str,
        device_id: &str,
        last_seen_ms: i64,
    ) -> Result<(), CoordinationError>;

    /// All device ids of the user with a live session anywhere (including
    /// this node).
    async fn devices_online(&self, user_id: &str) -> Result<HashSet<String>, CoordinationError>;

    async fn last_seen(&self, user_id: &str) -> Result<Option<i64>, CoordinationError>;

    /// Publish a fan-out event on `user.{targetUserId}` for a session owned
    /// by another node.
    async fn publish(&self, event: &FanoutEvent) -> Result<(), CoordinationError>;
}

// ---------------------------------------------------------------------------
// Single-node implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct LocalCoordination {
    devices: RwLock<HashMap<String, HashSet<String>>>,
    last_seen: RwLock<HashMap<String, i64>>,
}

#[async_trait]
impl Coordination for LocalCoordination {
    async fn mark_online(&self, user_id: &str, device_id: &str) -> Result<(), CoordinationError> {
        self.devices
            .write()
            .await
            .entry(user_id.to_owned())
            .or_default()
            .insert(device_id.to_owned());
        Ok(())
    }

    async fn mark_offline(
        &self,
        user_id: &str,
        device_id: &str,
        last_seen_ms: i64,
    ) -> Result<(), CoordinationError> {
        let mut devices = self.devices.write().await;
        if let Some(set) = devices.get_mut(user_id) {
            set.remove(device_id);
            if set.is_empty() {
                devices.remove(user_id);
            }
        }
        self.last_seen
            .write()
            .await
            .insert(user_id.to_owned(), last_seen_ms);
        Ok(())
    }

    async fn devices_online(&self, user_id: &str) -> Result<HashSet<String>, CoordinationError> {
        Ok(self
            .devices
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn last_seen(&self, user_id: &str) -> Result<Option<i64>, CoordinationError> {
        Ok(self.last_seen.read().await.get(user_id).copied())
    }

    async fn publish(&self, event: &FanoutEvent) -> Result<(), CoordinationError> {
        // No peers on a single node; the targeted device is simply offline.
        debug!(target_user = %event.target_user_id, "dropping publish in single-node mode");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

pub struct RedisCoordination {
    manager: redis::aio::ConnectionManager,
}

fn device_key(user_id: &str) -> String {
    format!("presence:device:{user_id}")
}

fn last_seen_key(user_id: &str) -> String {
    format!("presence:lastseen:{user_id}")
}

pub fn user_channel(user_id: &str) -> String {
    format!("user.{user_id}")
}

impl RedisCoordination {
    pub async fn connect(url: &str) -> Result<Self, CoordinationError> {
        let client =
            redis::Client::open(url).map_err(|e| CoordinationError::Redis(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| CoordinationError::Redis(e.to_string()))?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl Coordination for RedisCoordination {
    async fn mark_online(&self, user_id: &str, device_id: &str) -> Result<(), CoordinationError> {
        let mut conn = self.manager.clone();
        conn.sadd::<_, _, ()>(device_key(user_id), device_id)
            .await
            .map_err(|e| CoordinationError::Redis(e.to_string()))
    }

    async fn mark_offline(
        &self,
        user_id: &str,
        device_id: &str,
        last_seen_ms: i64,
    ) -> Result<(), CoordinationError> {
        let mut conn = self.manager.clone();
        conn.srem::<_, _, ()>(device_key(user_id), device_id)
            .await
            .map_err(|e| CoordinationError::Redis(e.to_string()))?;
        conn.set::<_, _, ()>(last_seen_key(user_id), last_seen_ms)
            .await
            .map_err(|e| CoordinationError::Redis(e.to_string()))
    }

    async fn devices_online(&self, user_id: &str) -> Result<HashSet<String>, CoordinationError> {
        let mut conn = self.manager.clone();
        let members: Vec<String> = conn
            .smembers(device_key(user_id))
            .await
            .map_err(|e| CoordinationError::Redis(e.to_string()))?;
        Ok(members.into_iter().collect())
    }

    async fn last_seen(&self, user_id: &str) -> Result<Option<i64>, CoordinationError> {
        let mut conn = self.manager.clone();
        conn.get(last_seen_key(user_id))
            .await
            .map_err(|e| CoordinationError::Redis(e.to_string()))
    }

    async fn publish(&self, event: &FanoutEvent) -> Result<(), CoordinationError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| CoordinationError::Decode(e.to_string()))?;
        let mut conn = self.manager.clone();
        conn.publish::<_, _, ()>(user_channel(&event.target_user_id), payload)
            .await
            .map_err(|e| CoordinationError::Redis(e.to_string()))
    }
}

/// Build the coordination handle from config: redis when a URL is set,
/// single-node otherwise.
pub async fn connect(url: Option<&str>) -> Result<Arc<dyn Coordination>, CoordinationError> {
    match url {
        Some(url) => Ok(Arc::new(RedisCoordination::connect(url).await?)),
        None => Ok(Arc::new(LocalCoordination::default())),
    }
}

/// Subscriber side of the pub/sub adapter.
///
/// One pattern subscription covers every user channel; events for users
/// without a local session are dropped here.  The publisher targets remote
/// devices individually, so this node's own publications never match a
/// local session.
pub async fn run_pubsub_listener(
    url: String,
    state: crate::state::AppState,
) -> Result<(), CoordinationError> {
    use futures_util::StreamExt;

    let client = redis::Client::open(url.as_str())
        .map_err(|e| CoordinationError::Redis(e.to_string()))?;
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| CoordinationError::Redis(e.to_string()))?;
    pubsub
        .psubscribe("user.*")
        .await
        .map_err(|e| CoordinationError::Redis(e.to_string()))?;

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "unreadable pubsub payload");
                continue;
            }
        };
        let event: FanoutEvent = match serde_json::from_str(&payload) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "malformed fanout event");
                continue;
            }
        };
        crate::router::deliver_fanout_event(&state, event).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_coordination_tracks_devices_per_user() {
        let coord = LocalCoordination::default();
        coord.mark_online("u1", "d1").await.unwrap();
        coord.mark_online("u1", "d2").await.unwrap();
        coord.mark_online("u2", "d9").await.unwrap();

        let online = coord.devices_online("u1").await.unwrap();
        assert_eq!(online.len(), 2);
        assert!(online.contains("d1") && online.contains("d2"));

        coord.mark_offline("u1", "d1", 100).await.unwrap();
        assert_eq!(coord.devices_online("u1").await.unwrap().len(), 1);
        assert_eq!(coord.last_seen("u1").await.unwrap(), Some(100));

        coord.mark_offline("u1", "d2", 200).await.unwrap();
        assert!(coord.devices_online("u1").await.unwrap().is_empty());
        assert_eq!(coord.last_seen("u1").await.unwrap(), Some(200));
    }

    #[test]
    fn channel_and_key_naming() {
        assert_eq!(user_channel("u7"), "user.u7");
        assert_eq!(device_key("u7"), "presence:device:u7");
        assert_eq!(last_seen_key("u7"), "presence:lastseen:u7");
    }
}
