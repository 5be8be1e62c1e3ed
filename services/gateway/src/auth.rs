//! Bearer-token validation against the identity endpoint, with an
//! in-process cache bounded by the token lifetime.  Tokens are cached under
//! their SHA-256 so raw secrets never sit in gateway memory longer than the
//! validation call.

use crate::error::PersistenceError;
use crate::state::AppState;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub nickname: String,
}

#[derive(Clone)]
struct CachedIdentity {
    identity: Identity,
    expires_at: Instant,
}

#[derive(Clone, Default)]
pub struct AuthCache {
    inner: Arc<RwLock<HashMap<[u8; 32], CachedIdentity>>>,
}

impl AuthCache {
    async fn get(&self, key: &[u8; 32]) -> Option<Identity> {
        let cache = self.inner.read().await;
        cache
            .get(key)
            .filter(|c| c.expires_at > Instant::now())
            .map(|c| c.identity.clone())
    }

    async fn insert(&self, key: [u8; 32], identity: Identity, ttl: Duration) {
        let mut cache = self.inner.write().await;
        let now = Instant::now();
        cache.retain(|_, c| c.expires_at > now);
        cache.insert(
            key,
            CachedIdentity {
                identity,
                expires_at: now + ttl,
            },
        );
    }
}

/// Why a LOGIN was rejected.
#[derive(Debug)]
pub enum AuthFailure {
    /// The token is invalid or expired; the client must re-auth out of band.
    InvalidToken(String),
    /// The identity collaborator could not be reached.
    Unavailable,
}

impl AuthFailure {
    pub fn message(&self) -> &str {
        match self {
            Self::InvalidToken(m) => m,
            Self::Unavailable => "authentication service unavailable",
        }
    }
}

/// Extracts the token from a `Bearer <token>` Authorization header value.
pub fn extract_bearer(header: &str) -> Option<&str> {
    header.strip_prefix("Bearer ")
}

pub async fn authenticate(state: &AppState, token: &str) -> Result<Identity, AuthFailure> {
    if token.is_empty() {
        return Err(AuthFailure::InvalidToken("missing token".to_owned()));
    }

    let key: [u8; 32] = Sha256::digest(token.as_bytes()).into();
    if let Some(identity) = state.auth_cache.get(&key).await {
        return Ok(identity);
    }

    match state.persistence.authenticate(token).await {
        Ok(response) => {
            let identity = Identity {
                user_id: response.user_id,
                nickname: response.nickname,
            };
            let ttl = Duration::from_secs(response.expires_in_seconds.max(0) as u64);
            if !ttl.is_zero() {
                state.auth_cache.insert(key, identity.clone(), ttl).await;
            }
            Ok(identity)
        }
        Err(PersistenceError::Status { status, message }) if status == 401 || status == 403 => {
            Err(AuthFailure::InvalidToken(message))
        }
        Err(_) => Err(AuthFailure::Unavailable),
    }
}
