use gateway::state::AppState;
use gateway::{config::Config, coordination, persistence::PersistenceClient, reaper};
use std::env;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = Config::from_env().expect("invalid gateway configuration");
    let coordination_url = config.coordination_url.clone();
    let listen_addr = config.listen_addr.clone();

    let coordination = coordination::connect(coordination_url.as_deref())
        .await
        .expect("failed to reach coordination store");
    let persistence = PersistenceClient::new(&config);
    let state = AppState::new(config, persistence, coordination);

    reaper::spawn_session_reaper(state.clone());
    reaper::spawn_offline_reaper(state.clone());
    if let Some(url) = coordination_url {
        let listener_state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = coordination::run_pubsub_listener(url, listener_state).await {
                error!(error = %e, "pubsub listener exited");
            }
        });
    }

    let router = gateway::build_router(state);
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .expect("failed to bind");
    info!(addr = %listen_addr, "gateway listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
    info!("gateway shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
