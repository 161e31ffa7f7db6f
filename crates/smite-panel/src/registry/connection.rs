//! In-memory registry of live node control channels.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, RwLock, mpsc, oneshot};
use tracing::{debug, info};

use smite_proto::ControlMessage;

/// One authenticated control channel to a node agent.
pub struct NodeConnection {
    /// Node this connection belongs to.
    pub node_id: String,
    /// Distinguishes a reconnect from the connection it replaced.
    pub conn_id: u64,
    /// Frames queued for the connection's writer task.
    frame_tx: mpsc::Sender<ControlMessage>,
    /// Reply waiters keyed by correlation id.
    pending: RwLock<HashMap<String, oneshot::Sender<ControlMessage>>>,
    /// Held for the whole push/ack exchange so pushes to a node never overlap.
    send_lock: Mutex<()>,
}

impl NodeConnection {
    pub fn new(node_id: String, conn_id: u64, frame_tx: mpsc::Sender<ControlMessage>) -> Self {
        Self {
            node_id,
            conn_id,
            frame_tx,
            pending: RwLock::new(HashMap::new()),
            send_lock: Mutex::new(()),
        }
    }

    pub async fn send_frame(
        &self,
        msg: ControlMessage,
    ) -> Result<(), mpsc::error::SendError<ControlMessage>> {
        self.frame_tx.send(msg).await
    }

    /// Serialize pushes to this node.
    pub async fn lock_send(&self) -> MutexGuard<'_, ()> {
        self.send_lock.lock().await
    }

    /// Register a reply waiter and return its receiver.
    pub async fn register_pending(&self, correlation_id: String) -> oneshot::Receiver<ControlMessage> {
        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(correlation_id, tx);
        rx
    }

    /// Deliver a reply to its waiter. Returns false when nobody is waiting.
    pub async fn complete_pending(&self, correlation_id: &str, msg: ControlMessage) -> bool {
        if let Some(tx) = self.pending.write().await.remove(correlation_id) {
            tx.send(msg).is_ok()
        } else {
            false
        }
    }

    /// Drop a waiter whose caller gave up.
    pub async fn forget_pending(&self, correlation_id: &str) {
        self.pending.write().await.remove(correlation_id);
    }

    /// Cancel all pending waiters; their receivers observe a closed channel.
    pub async fn cancel_all_pending(&self) {
        self.pending.write().await.clear();
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }
}

/// Live connections keyed by node id. At most one per node.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<NodeConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, replacing any previous one for the node.
    ///
    /// The replaced connection's waiters are cancelled.
    pub async fn register(&self, conn: Arc<NodeConnection>) {
        let node_id = conn.node_id.clone();
        let replaced = self
            .connections
            .write()
            .await
            .insert(node_id.clone(), conn);
        if let Some(old) = replaced {
            debug!(node_id = %node_id, conn_id = old.conn_id, "Replacing previous connection");
            old.cancel_all_pending().await;
        }
        info!(node_id = %node_id, "Node connection registered");
    }

    /// Remove the node's connection if it is still `conn_id`.
    pub async fn unregister(&self, node_id: &str, conn_id: u64) -> Option<Arc<NodeConnection>> {
        let mut connections = self.connections.write().await;
        if connections.get(node_id).is_some_and(|c| c.conn_id == conn_id) {
            info!(node_id = %node_id, "Node connection unregistered");
            connections.remove(node_id)
        } else {
            None
        }
    }

    /// Remove the node's connection regardless of which one it is.
    pub async fn remove(&self, node_id: &str) -> Option<Arc<NodeConnection>> {
        self.connections.write().await.remove(node_id)
    }

    pub async fn get(&self, node_id: &str) -> Option<Arc<NodeConnection>> {
        self.connections.read().await.get(node_id).cloned()
    }

    pub async fn is_connected(&self, node_id: &str) -> bool {
        self.connections.read().await.contains_key(node_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}
