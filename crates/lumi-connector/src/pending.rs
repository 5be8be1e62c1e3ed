//! Pending-request table: seq -> response channel.
//!
//! Each request owns its response channel and timeout; the table only maps
//! an incoming seq back to the waiting caller.  Closing a connection
//! rejects every entry with "Connection closed" before the table is
//! discarded.

use crate::ConnectorError;
use lumi_protocol::ServerFrame;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

type Resolver = oneshot::Sender<Result<ServerFrame, ConnectorError>>;

#[derive(Default)]
pub struct PendingTable {
    inner: Mutex<HashMap<String, Resolver>>,
}

impl PendingTable {
    pub fn register(&self, seq: String) -> oneshot::Receiver<Result<ServerFrame, ConnectorError>> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .lock()
            .expect("pending table lock poisoned")
            .insert(seq, tx);
        rx
    }

    /// Resolve the entry matching `seq`.  Returns false when no request is
    /// waiting (the frame is a push or a late response).
    pub fn resolve(&self, seq: &str, frame: ServerFrame) -> bool {
        let resolver = self
            .inner
            .lock()
            .expect("pending table lock poisoned")
            .remove(seq);
        match resolver {
            Some(tx) => {
                let _ = tx.send(Ok(frame));
                true
            }
            None => false,
        }
    }

    /// Drop a timed-out or unsendable entry.
    pub fn discard(&self, seq: &str) {
        self.inner
            .lock()
            .expect("pending table lock poisoned")
            .remove(seq);
    }

    pub fn reject_all(&self, error: ConnectorError) {
        let entries: Vec<Resolver> = {
            let mut table = self.inner.lock().expect("pending table lock poisoned");
            table.drain().map(|(_, tx)| tx).collect()
        };
        for tx in entries {
            let _ = tx.send(Err(error.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending table lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumi_protocol::ServerFrame;

    #[tokio::test]
    async fn resolve_routes_the_frame_to_the_registered_waiter() {
        let table = PendingTable::default();
        let rx = table.register("c-1".to_owned());
        assert!(table.resolve("c-1", ServerFrame::HeartbeatResponse));
        match rx.await.unwrap() {
            Ok(ServerFrame::HeartbeatResponse) => {}
            other => panic!("expected HeartbeatResponse, got {other:?}"),
        }
        assert!(table.is_empty());
    }

    #[test]
    fn unmatched_seq_is_reported_as_a_push() {
        let table = PendingTable::default();
        let _rx = table.register("c-1".to_owned());
        assert!(!table.resolve("c-2", ServerFrame::HeartbeatResponse));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn reject_all_fails_every_pending_request() {
        let table = PendingTable::default();
        let rx1 = table.register("c-1".to_owned());
        let rx2 = table.register("c-2".to_owned());
        table.reject_all(ConnectorError::ConnectionClosed);
        assert!(matches!(
            rx1.await.unwrap(),
            Err(ConnectorError::ConnectionClosed)
        ));
        assert!(matches!(
            rx2.await.unwrap(),
            Err(ConnectorError::ConnectionClosed)
        ));
        assert!(table.is_empty());
    }
}
