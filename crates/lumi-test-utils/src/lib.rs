// lumi-test-utils: shared test doubles for the real-time messaging fabric.
//
// - MockPersistence: in-memory Persistence Service speaking the /internal
//   HTTP API, with seeding and backdating knobs for scenario tests.
// - TestClient: packet-level WebSocket client for driving a gateway.
// - MockGateway: scripted gateway for exercising the client connector.

pub mod mock_gateway;
pub mod mock_persistence;
pub mod test_client;

pub use mock_gateway::{MockGateway, MockGatewayBehavior};
pub use mock_persistence::MockPersistence;
pub use test_client::TestClient;

/// Epoch milliseconds, matching the wire timestamp unit.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
