//! Connection registry and broadcast fan-out.
//!
//! Each WebSocket connection registers an outbound queue here; its writer
//! task drains the queue into the socket. Dropping the queue sender closes
//! the connection after any already-queued frames (a kick notice) flush.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, warn};
use serde::Serialize;
use tokio::sync::mpsc;

/// One outbound protocol frame: `{"type": kind, "payload": ...}`.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
}

/// Build a frame from any serializable payload.
pub fn frame(kind: &str, payload: impl Serialize) -> OutboundFrame {
    let payload = match serde_json::to_value(payload) {
        Ok(value) => value,
        Err(e) => {
            warn!("frame payload for '{kind}' failed to serialize: {e}");
            serde_json::Value::Null
        }
    };
    OutboundFrame {
        kind: kind.to_string(),
        payload,
    }
}

#[derive(Default)]
struct HubInner {
    conns: DashMap<u64, mpsc::UnboundedSender<OutboundFrame>>,
    next_id: AtomicU64,
}

/// Cheaply clonable handle on the connection registry.
#[derive(Clone, Default)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new() -> Hub {
        Hub::default()
    }

    /// Register a connection; returns its id and the outbound queue.
    pub fn register(&self) -> (u64, mpsc::UnboundedReceiver<OutboundFrame>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.conns.insert(id, tx);
        debug!("connection {id} registered");
        (id, rx)
    }

    /// Drop a connection's queue; its writer task finishes draining and
    /// closes the socket.
    pub fn close(&self, conn_id: u64) {
        if self.inner.conns.remove(&conn_id).is_some() {
            debug!("connection {conn_id} closed");
        }
    }

    pub fn send_to(&self, conn_id: u64, frame: OutboundFrame) {
        if let Some(tx) = self.inner.conns.get(&conn_id) {
            if tx.send(frame).is_err() {
                debug!("connection {conn_id} queue dropped");
            }
        }
    }

    /// Fan a frame out to every connected channel; observers receive all
    /// broadcasts even though they cannot mutate.
    pub fn broadcast(&self, frame: OutboundFrame) {
        for entry in self.inner.conns.iter() {
            if entry.value().send(frame.clone()).is_err() {
                debug!("connection {} queue dropped during broadcast", entry.key());
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.conns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_all_connections() {
        let hub = Hub::new();
        let (a, mut rx_a) = hub.register();
        let (_b, mut rx_b) = hub.register();
        assert_eq!(hub.connection_count(), 2);

        hub.broadcast(frame("toast", serde_json::json!({"level": "info"})));
        assert_eq!(rx_a.recv().await.unwrap().kind, "toast");
        assert_eq!(rx_b.recv().await.unwrap().kind, "toast");

        hub.send_to(a, frame("session:stale", serde_json::json!({})));
        assert_eq!(rx_a.recv().await.unwrap().kind, "session:stale");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_drains_queued_frames_then_ends() {
        let hub = Hub::new();
        let (id, mut rx) = hub.register();
        hub.send_to(id, frame("session:kicked", serde_json::json!({"reason": "takeover"})));
        hub.close(id);
        assert_eq!(rx.recv().await.unwrap().kind, "session:kicked");
        assert!(rx.recv().await.is_none());
        assert_eq!(hub.connection_count(), 0);
    }
}
