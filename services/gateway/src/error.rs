//! Gateway-side error kinds.
//!
//! Propagation policy: transient routing failures are absorbed (offline
//! queue); authoritative errors surface on the originating request as the
//! matching response opcode with the echoed seq.

use std::time::Duration;
use thiserror::Error;

/// Failures talking to the Persistence Service.
///
/// 5xx and transport failures are retriable; 4xx are terminal and surface
/// to the originating WebSocket request.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("decode: {0}")]
    Decode(String),
}

impl PersistenceError {
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Status { status, .. } => *status >= 500,
            Self::Decode(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Human-readable reason suitable for an ACK error field.
    pub fn ack_message(&self) -> String {
        match self {
            Self::Status { status, message } if *status < 500 => message.clone(),
            _ => "persistence unavailable".to_owned(),
        }
    }
}

/// Failures talking to the coordination store.  Absorbed (logged) on the
/// fan-out path; cross-node delivery degrades to the offline queue.
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("redis: {0}")]
    Redis(String),
    #[error("decode: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_retriable_client_errors_are_not() {
        let upstream = PersistenceError::Status {
            status: 503,
            message: "overloaded".to_owned(),
        };
        assert!(upstream.is_retriable());

        let forbidden = PersistenceError::Status {
            status: 403,
            message: "not the sender".to_owned(),
        };
        assert!(!forbidden.is_retriable());
        assert_eq!(forbidden.ack_message(), "not the sender");

        assert!(PersistenceError::Transport("reset".to_owned()).is_retriable());
        assert_eq!(
            PersistenceError::Status {
                status: 500,
                message: "boom".to_owned()
            }
            .ack_message(),
            "persistence unavailable"
        );
    }
}
