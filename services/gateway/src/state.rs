//! Shared gateway state handed to every handler.

use crate::config::Config;
use crate::coordination::Coordination;
use crate::persistence::PersistenceClient;
use crate::registry::SessionRegistry;
use lumi_protocol::{ConversationKind, SeqGen};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Cached conversation membership, refreshed after the TTL or on a
/// membership-change notice.
#[derive(Clone)]
pub struct CachedParticipants {
    pub participant_ids: Vec<String>,
    pub kind: ConversationKind,
    expires_at: Instant,
}

#[derive(Clone, Default)]
pub struct ParticipantCache {
    inner: Arc<RwLock<HashMap<i64, CachedParticipants>>>,
}

impl ParticipantCache {
    pub async fn get(&self, conversation_id: i64) -> Option<CachedParticipants> {
        let cache = self.inner.read().await;
        cache
            .get(&conversation_id)
            .filter(|c| c.expires_at > Instant::now())
            .cloned()
    }

    pub async fn insert(
        &self,
        conversation_id: i64,
        participant_ids: Vec<String>,
        kind: ConversationKind,
        ttl: std::time::Duration,
    ) {
        self.inner.write().await.insert(
            conversation_id,
            CachedParticipants {
                participant_ids,
                kind,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub async fn invalidate(&self, conversation_id: i64) {
        self.inner.write().await.remove(&conversation_id);
    }
}

/// watched user -> device ids that asked for ONLINE_STATUS_CHANGE pushes.
pub type PresenceWatchers = Arc<RwLock<HashMap<String, HashSet<String>>>>;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: SessionRegistry,
    pub persistence: PersistenceClient,
    pub coordination: Arc<dyn Coordination>,
    pub participants: ParticipantCache,
    pub auth_cache: crate::auth::AuthCache,
    pub presence_watchers: PresenceWatchers,
    pub server_seq: Arc<SeqGen>,
}

impl AppState {
    pub fn new(
        config: Config,
        persistence: PersistenceClient,
        coordination: Arc<dyn Coordination>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry: SessionRegistry::new(),
            persistence,
            coordination,
            participants: ParticipantCache::default(),
            auth_cache: crate::auth::AuthCache::default(),
            presence_watchers: Arc::new(RwLock::new(HashMap::new())),
            server_seq: Arc::new(SeqGen::new("srv")),
        }
    }
}

/// Current wall-clock time in epoch milliseconds, the timestamp unit used
/// everywhere on the wire.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
