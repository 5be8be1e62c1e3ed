// lumi-connector: embedded client connector for the Lumi-Chat gateway.
//
// One Connector value per device: explicit lifecycle, heartbeats,
// reconnect with exponential backoff, and seq-correlated request/response
// over the packet protocol.

pub mod backoff;
mod connector;
mod pending;

pub use connector::{ConnectionState, Connector, ConnectorConfig, ConnectorEvent};
pub use pending::PendingTable;

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ConnectorError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Login rejected: {0}")]
    LoginRejected(String),
    #[error("Request timeout")]
    RequestTimeout,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Already connected")]
    AlreadyConnected,
}
