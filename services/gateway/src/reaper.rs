//! Background tasks: the heartbeat reaper and the offline-queue expiry
//! sweep.  Both log and continue; they never propagate into live requests.

use crate::state::{now_ms, AppState};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const OFFLINE_REAP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Close every session whose heartbeat has been silent past the timeout.
/// Closure unwinds through the normal session teardown, which propagates
/// presence changes.
pub fn spawn_session_reaper(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.config.reaper_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let cutoff = now_ms() - state.config.heartbeat_timeout.as_millis() as i64;
            for session in state.registry.snapshot().await {
                if session.last_heartbeat() < cutoff {
                    info!(
                        user_id = %session.user_id,
                        device_id = %session.device_id,
                        "reaping silent session"
                    );
                    session.request_close();
                }
            }
        }
    })
}

/// Ask persistence to drop expired offline entries (TTL'd, never delivered).
pub fn spawn_offline_reaper(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(OFFLINE_REAP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match state.persistence.offline_reap().await {
                Ok(response) if response.reaped > 0 => {
                    info!(reaped = response.reaped, "expired offline entries reaped");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "offline reap failed"),
            }
        }
    })
}
