pub mod auth;
pub mod config;
pub mod coordination;
pub mod error;
pub mod offline;
pub mod persistence;
pub mod presence;
pub mod reaper;
pub mod registry;
pub mod router;
pub mod state;
pub mod ws_session;

pub use config::Config;
pub use state::AppState;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    let ws_path = state.config.ws_path.clone();
    Router::new()
        .route(&ws_path, get(ws_session::ws_handler))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/internal/events", post(router::handle_notice))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

mod health {
    use axum::response::IntoResponse;
    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }
    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}
