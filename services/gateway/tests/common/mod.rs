//! In-process harness: mock persistence + gateway on random ports.

use gateway::config::Config;
use gateway::coordination::LocalCoordination;
use gateway::persistence::PersistenceClient;
use gateway::state::AppState;
use lumi_test_utils::MockPersistence;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub struct Harness {
    pub persistence: MockPersistence,
    pub state: AppState,
    pub addr: SocketAddr,
}

impl Harness {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }
}

pub async fn start_gateway() -> Harness {
    start_gateway_with(|_| {}).await
}

pub async fn start_gateway_with(tweak: impl FnOnce(&mut Config)) -> Harness {
    let persistence = MockPersistence::start().await;
    let mut config = Config::from_lookup(|name| match name {
        "PERSISTENCE_URL" => Some(persistence.base_url()),
        "PERSISTENCE_SERVICE_TOKEN" => Some("svc-token".to_owned()),
        _ => None,
    })
    .expect("test config");
    tweak(&mut config);

    let client = PersistenceClient::new(&config);
    let state = AppState::new(config, client, Arc::new(LocalCoordination::default()));
    let router = gateway::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind gateway");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("gateway error");
    });
    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(20)).await;

    Harness {
        persistence,
        state,
        addr,
    }
}
