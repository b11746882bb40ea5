//! Transport layer: a registry of per-socket outbound channels extended
//! with emit-with-ack semantics, grounded on the teacher's
//! `ConnectionManager` (`RwLock<HashMap<..>>` + fire-and-forget broadcast)
//! but generalized to support awaiting a client's acknowledgement.

pub mod handler;
pub mod protocol;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, RwLock};
use tokio::time::timeout;

use crate::error::CoreError;

use protocol::ServerFrame;

struct Connection {
    sender: tokio::sync::mpsc::UnboundedSender<String>,
}

/// §4.3.3's required ack shape: `{success: true, message: "received"}`. Any
/// other JSON value the client sends back does not count as a delivery.
fn is_valid_delivery_ack(value: &Value) -> bool {
    value.get("success").and_then(|v| v.as_bool()) == Some(true)
        && value.get("message").and_then(|v| v.as_str()) == Some("received")
}

/// Tracks every pending ack by id so an inbound ack frame can resolve the
/// right waiter.
#[derive(Default)]
struct PendingAcks {
    waiters: HashMap<String, oneshot::Sender<Value>>,
}

#[derive(Clone)]
pub struct GatewayConnections {
    connections: Arc<RwLock<HashMap<String, Connection>>>,
    pending: Arc<RwLock<PendingAcks>>,
    next_ack_id: Arc<AtomicU64>,
}

impl GatewayConnections {
    pub fn new() -> Self {
        GatewayConnections {
            connections: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(RwLock::new(PendingAcks::default())),
            next_ack_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub async fn add(&self, socket_id: String, sender: tokio::sync::mpsc::UnboundedSender<String>) {
        self.connections
            .write()
            .await
            .insert(socket_id, Connection { sender });
    }

    pub async fn remove(&self, socket_id: &str) {
        self.connections.write().await.remove(socket_id);
    }

    pub async fn is_connected(&self, socket_id: &str) -> bool {
        self.connections.read().await.contains_key(socket_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    fn next_id(&self) -> String {
        format!("srv-{}", self.next_ack_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Fire-and-forget send, no acknowledgement expected.
    pub async fn send_event(&self, socket_id: &str, event: &str, data: Value) -> Result<(), CoreError> {
        self.send_frame(socket_id, &ServerFrame::event(event, data)).await
    }

    /// Pushes an already-built frame (e.g. an ack response) verbatim.
    pub async fn send_frame(&self, socket_id: &str, frame: &ServerFrame) -> Result<(), CoreError> {
        let connections = self.connections.read().await;
        let conn = connections
            .get(socket_id)
            .ok_or_else(|| CoreError::Transport("Socket not connected".into()))?;
        conn.sender
            .send(frame.to_json())
            .map_err(|_| CoreError::Transport("Socket channel closed".into()))
    }

    /// Sends `event` to `socket_id` and awaits its ack frame up to
    /// `per_emit_timeout`. This is what [`crate::message::core::MessageCore`]
    /// uses to decide whether a delivery attempt actually landed.
    pub async fn emit_with_ack(
        &self,
        socket_id: &str,
        event: &str,
        data: Value,
        per_emit_timeout: Duration,
    ) -> Result<Value, CoreError> {
        let ack_id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending.write().await.waiters.insert(ack_id.clone(), tx);

        let frame = ServerFrame::Event {
            event: event.to_string(),
            data: serde_json::json!({ "ackId": ack_id, "payload": data }),
        };
        let send_result = {
            let connections = self.connections.read().await;
            connections
                .get(socket_id)
                .ok_or_else(|| CoreError::Transport("Socket not connected".into()))
                .and_then(|conn| {
                    conn.sender
                        .send(frame.to_json())
                        .map_err(|_| CoreError::Transport("Socket channel closed".into()))
                })
        };
        if let Err(e) = send_result {
            self.pending.write().await.waiters.remove(&ack_id);
            return Err(e);
        }

        match timeout(per_emit_timeout, rx).await {
            Ok(Ok(value)) => {
                if is_valid_delivery_ack(&value) {
                    Ok(value)
                } else {
                    Err(CoreError::Transport("Malformed acknowledgement".into()))
                }
            }
            Ok(Err(_)) => Err(CoreError::Transport("Ack channel dropped".into())),
            Err(_) => {
                self.pending.write().await.waiters.remove(&ack_id);
                Err(CoreError::Timeout)
            }
        }
    }

    /// Resolves a pending ack waiter. Called by the connection's receive
    /// loop when an inbound ack frame arrives.
    pub async fn resolve_ack(&self, ack_id: &str, value: Value) {
        if let Some(tx) = self.pending.write().await.waiters.remove(ack_id) {
            let _ = tx.send(value);
        }
    }

    pub async fn broadcast_to_sockets(&self, socket_ids: &[String], event: &str, data: Value) {
        for socket_id in socket_ids {
            let _ = self.send_event(socket_id, event, data.clone()).await;
        }
    }

    pub async fn connected_socket_ids(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }
}

impl Default for GatewayConnections {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_event_to_unknown_socket_errors() {
        let conns = GatewayConnections::new();
        let result = conns.send_event("ghost", "message:new", serde_json::json!({})).await;
        assert!(matches!(result, Err(CoreError::Transport(_))));
    }

    #[tokio::test]
    async fn add_then_is_connected() {
        let conns = GatewayConnections::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        conns.add("sock-1".into(), tx).await;
        assert!(conns.is_connected("sock-1").await);
        conns.remove("sock-1").await;
        assert!(!conns.is_connected("sock-1").await);
    }

    #[tokio::test]
    async fn emit_with_ack_times_out_without_a_response() {
        let conns = GatewayConnections::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        conns.add("sock-1".into(), tx).await;

        let result = conns
            .emit_with_ack("sock-1", "message:new", serde_json::json!({}), Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(CoreError::Timeout)));
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn emit_with_ack_resolves_on_matching_ack() {
        let conns = GatewayConnections::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        conns.add("sock-1".into(), tx).await;

        let conns2 = conns.clone();
        let handle = tokio::spawn(async move {
            conns2
                .emit_with_ack("sock-1", "message:new", serde_json::json!({"x":1}), Duration::from_secs(1))
                .await
        });

        let sent = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&sent).unwrap();
        let ack_id = parsed["data"]["ackId"].as_str().unwrap().to_string();
        conns
            .resolve_ack(&ack_id, serde_json::json!({"success": true, "message": "received"}))
            .await;

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result, serde_json::json!({"success": true, "message": "received"}));
    }

    #[tokio::test]
    async fn emit_with_ack_rejects_a_malformed_ack_shape() {
        let conns = GatewayConnections::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        conns.add("sock-1".into(), tx).await;

        let conns2 = conns.clone();
        let handle = tokio::spawn(async move {
            conns2
                .emit_with_ack("sock-1", "message:new", serde_json::json!({"x":1}), Duration::from_secs(1))
                .await
        });

        let sent = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&sent).unwrap();
        let ack_id = parsed["data"]["ackId"].as_str().unwrap().to_string();
        conns.resolve_ack(&ack_id, serde_json::json!({"ok": true})).await;

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(CoreError::Transport(_))));
    }
}
