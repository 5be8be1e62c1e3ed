//! HTTP client for the Persistence Service `/internal` API.
//!
//! Authenticated with the shared service token plus acting-principal
//! headers.  Each attempt is bounded by the configured per-attempt timeout;
//! 5xx and transport errors retry with exponential backoff, 4xx surface to
//! the caller unchanged.

use crate::config::Config;
use crate::error::PersistenceError;
use lumi_protocol::{
    AuthenticateRequest, AuthenticateResponse, ChatMessage, DeviceRecord, HttpErrorEnvelope,
    MarkReadOutcome, MarkReadRequest, MessageBatchRequest, OfflineAckRequest, OfflineAckResponse,
    OfflineEnqueueRequest, OfflinePendingResponse, ParticipantsResponse, ReapResponse,
    RecallOutcome, SendMessageRequest, SyncDelta, UpsertDeviceRequest,
};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::warn;

const USER_HEADER: &str = "X-Internal-User-Id";
const DEVICE_HEADER: &str = "X-Internal-Device-Id";

/// The acting principal carried on internal calls made on behalf of a
/// session.  Background tasks use [`Principal::service`].
#[derive(Debug, Clone, Default)]
pub struct Principal {
    pub user_id: Option<String>,
    pub device_id: Option<String>,
}

impl Principal {
    pub fn session(user_id: &str, device_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_owned()),
            device_id: Some(device_id.to_owned()),
        }
    }

    pub fn service() -> Self {
        Self::default()
    }
}

#[derive(Clone)]
pub struct PersistenceClient {
    http: reqwest::Client,
    base_url: String,
    service_token: String,
    retries: u32,
    backoff: Duration,
    attempt_timeout: Duration,
    recall_window_seconds: u64,
    offline_ttl_days: u64,
}

impl PersistenceClient {
    pub fn new(config: &Config) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.persistence_timeout)
            .build()
            .expect("failed to build persistence HTTP client");
        Self {
            http,
            base_url: config.persistence_url.trim_end_matches('/').to_owned(),
            service_token: config.persistence_token.clone(),
            retries: config.persistence_retries.max(1),
            backoff: config.persistence_backoff,
            attempt_timeout: config.persistence_timeout,
            recall_window_seconds: config.recall_window.as_secs(),
            offline_ttl_days: config.offline_ttl.as_secs() / (24 * 60 * 60),
        }
    }

    // -----------------------------------------------------------------------
    // Identity & devices
    // -----------------------------------------------------------------------

    pub async fn authenticate(
        &self,
        token: &str,
    ) -> Result<AuthenticateResponse, PersistenceError> {
        self.request_json(
            reqwest::Method::POST,
            "/internal/auth/tokens",
            &Principal::service(),
            Some(&AuthenticateRequest {
                token: token.to_owned(),
            }),
        )
        .await
    }

    pub async fn upsert_device(
        &self,
        principal: &Principal,
        device: &UpsertDeviceRequest,
    ) -> Result<(), PersistenceError> {
        self.request_empty(reqwest::Method::PUT, "/internal/devices", principal, Some(device))
            .await
    }

    pub async fn remove_device(
        &self,
        principal: &Principal,
        device_id: &str,
    ) -> Result<(), PersistenceError> {
        self.request_empty::<()>(
            reqwest::Method::DELETE,
            &format!("/internal/devices/{device_id}"),
            principal,
            None,
        )
        .await
    }

    pub async fn devices_of(&self, user_id: &str) -> Result<Vec<DeviceRecord>, PersistenceError> {
        self.request_json::<Vec<DeviceRecord>, ()>(
            reqwest::Method::GET,
            &format!("/internal/users/{user_id}/devices"),
            &Principal::service(),
            None,
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Messages & conversations
    // -----------------------------------------------------------------------

    /// Persist a message, idempotent on msgId.  The boolean is true when
    /// this call created the row; a replay returns the first outcome with
    /// `created == false` so the router can suppress duplicate fan-out.
    pub async fn persist_message(
        &self,
        principal: &Principal,
        request: &SendMessageRequest,
    ) -> Result<(ChatMessage, bool), PersistenceError> {
        let response = self
            .send_with_retry(
                reqwest::Method::POST,
                "/internal/messages",
                principal,
                Some(request),
            )
            .await?;
        let created = response.status() == reqwest::StatusCode::CREATED;
        let message = response
            .json::<ChatMessage>()
            .await
            .map_err(|e| PersistenceError::Decode(e.to_string()))?;
        Ok((message, created))
    }

    /// The gateway is the configuration authority for the recall window;
    /// persistence enforces whatever window the caller passes.
    pub async fn recall_message(
        &self,
        principal: &Principal,
        msg_id: &str,
    ) -> Result<RecallOutcome, PersistenceError> {
        self.request_json::<RecallOutcome, ()>(
            reqwest::Method::PUT,
            &format!(
                "/internal/messages/{msg_id}/recall?windowSeconds={}",
                self.recall_window_seconds
            ),
            principal,
            None,
        )
        .await
    }

    pub async fn participants(
        &self,
        conversation_id: i64,
    ) -> Result<ParticipantsResponse, PersistenceError> {
        self.request_json::<ParticipantsResponse, ()>(
            reqwest::Method::GET,
            &format!("/internal/conversations/{conversation_id}/participants"),
            &Principal::service(),
            None,
        )
        .await
    }

    pub async fn mark_read(
        &self,
        principal: &Principal,
        conversation_id: i64,
        last_read_msg_id: i64,
    ) -> Result<MarkReadOutcome, PersistenceError> {
        self.request_json(
            reqwest::Method::POST,
            &format!("/internal/conversations/{conversation_id}/read"),
            principal,
            Some(&MarkReadRequest { last_read_msg_id }),
        )
        .await
    }

    pub async fn messages_batch(
        &self,
        ids: &[i64],
    ) -> Result<Vec<ChatMessage>, PersistenceError> {
        self.request_json(
            reqwest::Method::POST,
            "/internal/messages/batch",
            &Principal::service(),
            Some(&MessageBatchRequest { ids: ids.to_vec() }),
        )
        .await
    }

    pub async fn sync_delta(
        &self,
        principal: &Principal,
        after_id: i64,
        limit: usize,
    ) -> Result<SyncDelta, PersistenceError> {
        let user = principal.user_id.as_deref().unwrap_or_default();
        let device = principal.device_id.as_deref().unwrap_or_default();
        self.request_json::<SyncDelta, ()>(
            reqwest::Method::GET,
            &format!("/internal/sync?userId={user}&deviceId={device}&afterId={after_id}&limit={limit}"),
            principal,
            None,
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Offline queue
    // -----------------------------------------------------------------------

    pub async fn offline_enqueue(
        &self,
        request: &OfflineEnqueueRequest,
    ) -> Result<(), PersistenceError> {
        self.request_empty(
            reqwest::Method::POST,
            "/internal/offline",
            &Principal::service(),
            Some(request),
        )
        .await
    }

    pub async fn offline_pending(
        &self,
        user_id: &str,
        device_id: &str,
        limit: usize,
    ) -> Result<OfflinePendingResponse, PersistenceError> {
        self.request_json::<OfflinePendingResponse, ()>(
            reqwest::Method::GET,
            &format!("/internal/offline?userId={user_id}&deviceId={device_id}&limit={limit}"),
            &Principal::service(),
            None,
        )
        .await
    }

    pub async fn offline_ack(
        &self,
        request: &OfflineAckRequest,
    ) -> Result<OfflineAckResponse, PersistenceError> {
        self.request_json(
            reqwest::Method::POST,
            "/internal/offline/ack",
            &Principal::service(),
            Some(request),
        )
        .await
    }

    pub async fn offline_reap(&self) -> Result<ReapResponse, PersistenceError> {
        self.request_json::<ReapResponse, ()>(
            reqwest::Method::DELETE,
            &format!("/internal/offline/expired?ttlDays={}", self.offline_ttl_days),
            &Principal::service(),
            None,
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Transport
    // -----------------------------------------------------------------------

    async fn request_json<T: DeserializeOwned, B: serde::Serialize>(
        &self,
        method: reqwest::Method,
        path: &str,
        principal: &Principal,
        body: Option<&B>,
    ) -> Result<T, PersistenceError> {
        let response = self.send_with_retry(method, path, principal, body).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| PersistenceError::Decode(e.to_string()))
    }

    async fn request_empty<B: serde::Serialize>(
        &self,
        method: reqwest::Method,
        path: &str,
        principal: &Principal,
        body: Option<&B>,
    ) -> Result<(), PersistenceError> {
        self.send_with_retry(method, path, principal, body).await?;
        Ok(())
    }

    async fn send_with_retry<B: serde::Serialize>(
        &self,
        method: reqwest::Method,
        path: &str,
        principal: &Principal,
        body: Option<&B>,
    ) -> Result<reqwest::Response, PersistenceError> {
        let url = format!("{}{}", self.base_url, path);
        let mut delay = self.backoff;
        let mut last_err = None;

        for attempt in 1..=self.retries {
            let mut builder = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&self.service_token);
            if let Some(user) = &principal.user_id {
                builder = builder.header(USER_HEADER, user);
            }
            if let Some(device) = &principal.device_id {
                builder = builder.header(DEVICE_HEADER, device);
            }
            if let Some(b) = body {
                builder = builder.json(b);
            }

            let err = match builder.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let message = decode_error_message(response).await;
                    let err = PersistenceError::Status {
                        status: status.as_u16(),
                        message,
                    };
                    if !err.is_retriable() {
                        return Err(err);
                    }
                    err
                }
                Err(e) if e.is_timeout() => PersistenceError::Timeout(self.attempt_timeout),
                Err(e) => PersistenceError::Transport(e.to_string()),
            };

            warn!(path, attempt, error = %err, "persistence call failed");
            last_err = Some(err);
            if attempt < self.retries {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }

        Err(last_err.unwrap_or_else(|| PersistenceError::Transport("no attempts made".to_owned())))
    }
}

async fn decode_error_message(response: reqwest::Response) -> String {
    match response.json::<HttpErrorEnvelope>().await {
        Ok(envelope) => envelope.message,
        Err(_) => "upstream error".to_owned(),
    }
}
