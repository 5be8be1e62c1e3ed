//! Session registry: `(user, device) -> live session` bindings on this node.
//!
//! Mutations are serialised behind one RwLock and never perform network
//! I/O; eviction notifications and presence publication are the caller's
//! job, using the handles a mutation returns.

use lumi_protocol::{DeviceType, Packet};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};

/// A live binding of a device to an accepted WebSocket.
///
/// `outbound` is the bounded per-session send queue (FIFO order is the
/// delivery order guarantee); `close` is the cooperative shutdown signal
/// observed by both the read loop and the writer task.
#[derive(Clone)]
pub struct SessionEntry {
    pub session_id: String,
    pub user_id: String,
    pub device_id: String,
    pub device_type: DeviceType,
    pub connected_at_ms: i64,
    pub last_heartbeat_ms: Arc<AtomicI64>,
    pub outbound: mpsc::Sender<Packet>,
    pub close: watch::Sender<bool>,
}

impl SessionEntry {
    pub fn touch_heartbeat(&self, now_ms: i64) {
        self.last_heartbeat_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn last_heartbeat(&self) -> i64 {
        self.last_heartbeat_ms.load(Ordering::Relaxed)
    }

    /// Trigger cooperative close.  Safe to call more than once.
    pub fn request_close(&self) {
        let _ = self.close.send(true);
    }
}

#[derive(Default)]
struct Maps {
    by_device: HashMap<String, SessionEntry>,
    by_user: HashMap<String, HashSet<String>>,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<Maps>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a session, atomically replacing any existing session for the
    /// same deviceId.  Returns the displaced entry so the caller can send
    /// KICKED_OFFLINE and close it.  A login from a different deviceId
    /// never displaces anything.
    pub async fn bind(&self, entry: SessionEntry) -> Option<SessionEntry> {
        let mut maps = self.inner.write().await;
        let displaced = maps.by_device.remove(&entry.device_id);
        if let Some(old) = &displaced {
            if let Some(set) = maps.by_user.get_mut(&old.user_id) {
                set.remove(&old.device_id);
                if set.is_empty() {
                    maps.by_user.remove(&old.user_id);
                }
            }
        }
        maps.by_user
            .entry(entry.user_id.clone())
            .or_default()
            .insert(entry.device_id.clone());
        maps.by_device.insert(entry.device_id.clone(), entry);
        displaced
    }

    /// Remove the binding, but only if `session_id` still owns it: a kicked
    /// session unwinding later must not unbind its replacement.  Returns
    /// the removed entry and whether the user now has no local sessions.
    pub async fn unbind(
        &self,
        device_id: &str,
        session_id: &str,
    ) -> Option<(SessionEntry, bool)> {
        let mut maps = self.inner.write().await;
        let owner = maps.by_device.get(device_id)?;
        if owner.session_id != session_id {
            return None;
        }
        let entry = maps.by_device.remove(device_id)?;
        let none_left = match maps.by_user.get_mut(&entry.user_id) {
            Some(set) => {
                set.remove(device_id);
                if set.is_empty() {
                    maps.by_user.remove(&entry.user_id);
                    true
                } else {
                    false
                }
            }
            None => true,
        };
        Some((entry, none_left))
    }

    pub async fn get(&self, device_id: &str) -> Option<SessionEntry> {
        self.inner.read().await.by_device.get(device_id).cloned()
    }

    pub async fn sessions_of(&self, user_id: &str) -> Vec<SessionEntry> {
        let maps = self.inner.read().await;
        match maps.by_user.get(user_id) {
            Some(devices) => devices
                .iter()
                .filter_map(|d| maps.by_device.get(d).cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    pub async fn has_user(&self, user_id: &str) -> bool {
        self.inner.read().await.by_user.contains_key(user_id)
    }

    /// Every live session on this node, for the reaper.
    pub async fn snapshot(&self) -> Vec<SessionEntry> {
        self.inner.read().await.by_device.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(user: &str, device: &str, session: &str) -> SessionEntry {
        let (tx, _rx) = mpsc::channel(8);
        let (close, _) = watch::channel(false);
        SessionEntry {
            session_id: session.to_owned(),
            user_id: user.to_owned(),
            device_id: device.to_owned(),
            device_type: DeviceType::Web,
            connected_at_ms: 0,
            last_heartbeat_ms: Arc::new(AtomicI64::new(0)),
            outbound: tx,
            close,
        }
    }

    #[tokio::test]
    async fn bind_same_device_displaces_prior_session() {
        let registry = SessionRegistry::new();
        assert!(registry.bind(entry("u1", "d1", "s1")).await.is_none());
        let displaced = registry
            .bind(entry("u1", "d1", "s2"))
            .await
            .expect("second bind for same device must displace");
        assert_eq!(displaced.session_id, "s1");
        assert_eq!(registry.sessions_of("u1").await.len(), 1);
        assert_eq!(registry.get("d1").await.unwrap().session_id, "s2");
    }

    #[tokio::test]
    async fn bind_different_device_never_displaces() {
        let registry = SessionRegistry::new();
        assert!(registry.bind(entry("u1", "d1", "s1")).await.is_none());
        assert!(registry.bind(entry("u1", "d2", "s2")).await.is_none());
        let sessions = registry.sessions_of("u1").await;
        assert_eq!(sessions.len(), 2);
    }

    #[tokio::test]
    async fn unbind_is_a_noop_for_a_stale_session_id() {
        let registry = SessionRegistry::new();
        let _ = registry.bind(entry("u1", "d1", "s1")).await;
        let _ = registry.bind(entry("u1", "d1", "s2")).await;

        // The kicked session's cleanup must not remove the replacement.
        assert!(registry.unbind("d1", "s1").await.is_none());
        assert!(registry.get("d1").await.is_some());

        let (removed, none_left) = registry.unbind("d1", "s2").await.unwrap();
        assert_eq!(removed.session_id, "s2");
        assert!(none_left);
        assert!(!registry.has_user("u1").await);
    }

    #[tokio::test]
    async fn unbind_reports_whether_local_sessions_remain() {
        let registry = SessionRegistry::new();
        let _ = registry.bind(entry("u1", "d1", "s1")).await;
        let _ = registry.bind(entry("u1", "d2", "s2")).await;

        let (_, none_left) = registry.unbind("d1", "s1").await.unwrap();
        assert!(!none_left);
        let (_, none_left) = registry.unbind("d2", "s2").await.unwrap();
        assert!(none_left);
    }

    #[tokio::test]
    async fn heartbeat_touch_is_visible_through_every_handle() {
        let registry = SessionRegistry::new();
        let _ = registry.bind(entry("u1", "d1", "s1")).await;
        let handle = registry.get("d1").await.unwrap();
        handle.touch_heartbeat(123);
        assert_eq!(registry.get("d1").await.unwrap().last_heartbeat(), 123);
    }
}
