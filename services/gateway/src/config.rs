//! Gateway configuration from environment variables.
//!
//! Every knob has a default; only `PERSISTENCE_URL` and
//! `PERSISTENCE_SERVICE_TOKEN` are required.  Parsing goes through a lookup
//! closure so it can be unit-tested without mutating process env.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub ws_path: String,
    pub max_frame_bytes: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub login_timeout: Duration,
    pub slow_consumer_grace: Duration,
    pub outbound_queue_capacity: usize,
    pub offline_ttl: Duration,
    pub recall_window: Duration,
    pub offline_drain_batch: usize,
    pub offline_chunk_size: usize,
    pub sync_page_limit: usize,
    pub persistence_url: String,
    pub persistence_token: String,
    pub persistence_timeout: Duration,
    pub persistence_retries: u32,
    pub persistence_backoff: Duration,
    /// Absent means single-node mode: no cross-node presence or fan-out.
    pub coordination_url: Option<String>,
    pub participant_cache_ttl: Duration,
    pub reaper_interval: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let persistence_url = lookup("PERSISTENCE_URL")
            .ok_or(ConfigError::Missing("PERSISTENCE_URL"))?;
        let persistence_token = lookup("PERSISTENCE_SERVICE_TOKEN")
            .ok_or(ConfigError::Missing("PERSISTENCE_SERVICE_TOKEN"))?;

        Ok(Self {
            listen_addr: lookup("GATEWAY_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:9090".to_owned()),
            ws_path: lookup("WS_PATH").unwrap_or_else(|| "/ws".to_owned()),
            max_frame_bytes: parse(&lookup, "MAX_FRAME_BYTES", 1024 * 1024)?,
            heartbeat_interval: millis(&lookup, "HEARTBEAT_INTERVAL_MS", 30_000)?,
            heartbeat_timeout: millis(&lookup, "HEARTBEAT_TIMEOUT_MS", 90_000)?,
            login_timeout: seconds(&lookup, "LOGIN_TIMEOUT_SECONDS", 10)?,
            slow_consumer_grace: millis(&lookup, "SLOW_CONSUMER_GRACE_MS", 2_000)?,
            outbound_queue_capacity: parse(&lookup, "OUTBOUND_QUEUE_CAPACITY", 256)?,
            offline_ttl: days(&lookup, "OFFLINE_TTL_DAYS", 7)?,
            recall_window: seconds(&lookup, "RECALL_WINDOW_SECONDS", 120)?,
            offline_drain_batch: parse(&lookup, "OFFLINE_DRAIN_BATCH", 500)?,
            offline_chunk_size: parse(&lookup, "OFFLINE_CHUNK_SIZE", 50)?,
            sync_page_limit: parse(&lookup, "SYNC_PAGE_LIMIT", 500)?,
            persistence_url,
            persistence_token,
            persistence_timeout: millis(&lookup, "PERSISTENCE_TIMEOUT_MS", 5_000)?,
            persistence_retries: parse(&lookup, "PERSISTENCE_RETRIES", 3)?,
            persistence_backoff: millis(&lookup, "PERSISTENCE_BACKOFF_MS", 200)?,
            coordination_url: lookup("COORDINATION_URL").filter(|v| !v.is_empty()),
            participant_cache_ttl: seconds(&lookup, "PARTICIPANT_CACHE_TTL_SECONDS", 30)?,
            reaper_interval: seconds(&lookup, "REAPER_INTERVAL_SECONDS", 15)?,
        })
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    parse(lookup, name, default).map(Duration::from_millis)
}

fn seconds(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    parse(lookup, name, default).map(Duration::from_secs)
}

fn days(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    parse(lookup, name, default).map(|d: u64| Duration::from_secs(d * 24 * 60 * 60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        move |name| map.get(name).map(|v| (*v).to_owned())
    }

    #[test]
    fn defaults_apply_when_only_required_vars_are_set() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("PERSISTENCE_URL", "http://persistence:8080"),
            ("PERSISTENCE_SERVICE_TOKEN", "svc-token"),
        ]))
        .unwrap();
        assert_eq!(cfg.listen_addr, "0.0.0.0:9090");
        assert_eq!(cfg.ws_path, "/ws");
        assert_eq!(cfg.max_frame_bytes, 1024 * 1024);
        assert_eq!(cfg.heartbeat_timeout, Duration::from_secs(90));
        assert_eq!(cfg.outbound_queue_capacity, 256);
        assert_eq!(cfg.offline_ttl, Duration::from_secs(7 * 24 * 60 * 60));
        assert_eq!(cfg.recall_window, Duration::from_secs(120));
        assert!(cfg.coordination_url.is_none());
    }

    #[test]
    fn missing_persistence_url_is_an_error() {
        let err = Config::from_lookup(lookup_from(&[(
            "PERSISTENCE_SERVICE_TOKEN",
            "svc-token",
        )]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("PERSISTENCE_URL")));
    }

    #[test]
    fn invalid_numeric_value_is_reported_with_its_name() {
        let err = Config::from_lookup(lookup_from(&[
            ("PERSISTENCE_URL", "http://p"),
            ("PERSISTENCE_SERVICE_TOKEN", "t"),
            ("OUTBOUND_QUEUE_CAPACITY", "lots"),
        ]))
        .unwrap_err();
        match err {
            ConfigError::Invalid { name, value } => {
                assert_eq!(name, "OUTBOUND_QUEUE_CAPACITY");
                assert_eq!(value, "lots");
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn empty_coordination_url_means_single_node() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("PERSISTENCE_URL", "http://p"),
            ("PERSISTENCE_SERVICE_TOKEN", "t"),
            ("COORDINATION_URL", ""),
        ]))
        .unwrap();
        assert!(cfg.coordination_url.is_none());
    }
}
