//! Node records, liveness and config delivery.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use smite_core::db::unix_timestamp;
use smite_proto::{ConfigPayload, ControlMessage, MessageType, ProtoError};

use super::connection::{ConnectionRegistry, NodeConnection};
use crate::model::{NewNode, Node, NodeStatus};
use crate::storage::{DatabaseError, PanelDatabase};

/// Outbound queue depth per node connection.
pub const FRAME_QUEUE_DEPTH: usize = 64;

/// Liveness transitions published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Online(String),
    Offline(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("node name '{0}' is already registered")]
    DuplicateName(String),

    #[error("certificate subject '{0}' is already registered")]
    DuplicateSubject(String),

    #[error("node {0} not found")]
    NotFound(String),

    #[error("no node registered for certificate subject '{0}'")]
    UnknownSubject(String),

    #[error("certificate fingerprint does not match the pin for node {0}")]
    FingerprintMismatch(String),

    #[error("storage error: {0}")]
    Storage(#[from] DatabaseError),
}

/// Outcome of a push that did not complete with an ack.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("node {0} is not connected")]
    NotConnected(String),

    /// No reply within the send timeout. The node may or may not have applied
    /// the config.
    #[error("node {0} did not acknowledge in time")]
    Timeout(String),

    #[error("node rejected config: {0}")]
    Rejected(String),

    #[error("failed to encode payload: {0}")]
    Encode(#[from] ProtoError),
}

struct NodeEntry {
    node: Node,
    last_heartbeat: Option<Instant>,
}

/// Tracks registered nodes and carries config pushes to them.
pub struct NodeRegistry {
    db: PanelDatabase,
    nodes: RwLock<HashMap<String, NodeEntry>>,
    connections: ConnectionRegistry,
    events: broadcast::Sender<NodeEvent>,
    heartbeat_timeout: Duration,
    send_timeout: Duration,
    next_conn_id: AtomicU64,
}

impl NodeRegistry {
    /// Load registered nodes from storage. Every node starts `unknown` until
    /// its agent dials in.
    pub async fn load(
        db: PanelDatabase,
        heartbeat_timeout: Duration,
        send_timeout: Duration,
    ) -> Result<Self, RegistryError> {
        db.reset_node_statuses().await?;
        let nodes = db
            .list_nodes()
            .await?
            .into_iter()
            .map(|row| {
                let node = Node::from(row);
                (
                    node.id.clone(),
                    NodeEntry {
                        node,
                        last_heartbeat: None,
                    },
                )
            })
            .collect::<HashMap<_, _>>();
        info!(count = nodes.len(), "Node registry loaded");

        let (events, _) = broadcast::channel(256);
        Ok(Self {
            db,
            nodes: RwLock::new(nodes),
            connections: ConnectionRegistry::new(),
            events,
            heartbeat_timeout,
            send_timeout,
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    // =========================================================================
    // Records
    // =========================================================================

    /// Register a node. Names and certificate subjects are unique.
    pub async fn register(&self, mut new: NewNode) -> Result<Node, RegistryError> {
        {
            let nodes = self.nodes.read().await;
            if nodes.values().any(|e| e.node.name == new.name) {
                return Err(RegistryError::DuplicateName(new.name));
            }
            if nodes.values().any(|e| e.node.cert_subject == new.cert_subject) {
                return Err(RegistryError::DuplicateSubject(new.cert_subject));
            }
        }
        if new.id.is_empty() {
            new.id = Uuid::new_v4().to_string();
        }

        let row = self.db.create_node(&new).await.map_err(|e| match e {
            DatabaseError::Constraint(_) => RegistryError::DuplicateName(new.name.clone()),
            other => RegistryError::Storage(other),
        })?;
        let node = Node::from(row);

        self.nodes.write().await.insert(
            node.id.clone(),
            NodeEntry {
                node: node.clone(),
                last_heartbeat: None,
            },
        );
        info!(node_id = %node.id, name = %node.name, "Node registered");
        Ok(node)
    }

    /// Delete a node record and drop its connection.
    ///
    /// Callers check for referencing tunnels first.
    pub async fn remove(&self, node_id: &str) -> Result<(), RegistryError> {
        if self.nodes.write().await.remove(node_id).is_none() {
            return Err(RegistryError::NotFound(node_id.to_string()));
        }
        self.db.delete_node(node_id).await?;
        if let Some(conn) = self.connections.remove(node_id).await {
            conn.cancel_all_pending().await;
        }
        info!(node_id = %node_id, "Node removed");
        Ok(())
    }

    pub async fn get(&self, node_id: &str) -> Option<Node> {
        self.nodes.read().await.get(node_id).map(|e| e.node.clone())
    }

    pub async fn list(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .nodes
            .read()
            .await
            .values()
            .map(|e| e.node.clone())
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    pub async fn node_ids(&self) -> HashSet<String> {
        self.nodes.read().await.keys().cloned().collect()
    }

    pub async fn is_online(&self, node_id: &str) -> bool {
        self.nodes
            .read()
            .await
            .get(node_id)
            .is_some_and(|e| e.node.status == NodeStatus::Online)
    }

    /// Resolve a verified client certificate to its node.
    ///
    /// `fingerprint` is the lowercase hex SHA-256 of the certificate DER; it is
    /// only compared when the node pins one.
    pub async fn authenticate(
        &self,
        subject: &str,
        fingerprint: &str,
    ) -> Result<Node, RegistryError> {
        let nodes = self.nodes.read().await;
        let entry = nodes
            .values()
            .find(|e| e.node.cert_subject == subject)
            .ok_or_else(|| RegistryError::UnknownSubject(subject.to_string()))?;
        if let Some(pin) = &entry.node.cert_fingerprint {
            if !pin.eq_ignore_ascii_case(fingerprint) {
                return Err(RegistryError::FingerprintMismatch(entry.node.id.clone()));
            }
        }
        Ok(entry.node.clone())
    }

    // =========================================================================
    // Liveness
    // =========================================================================

    /// Record a live connection for the node and mark it online.
    pub async fn attach(
        &self,
        node_id: &str,
        frame_tx: mpsc::Sender<ControlMessage>,
    ) -> Arc<NodeConnection> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(NodeConnection::new(node_id.to_string(), conn_id, frame_tx));
        self.connections.register(Arc::clone(&conn)).await;
        self.mark_online(node_id).await;
        conn
    }

    /// Drop the connection and mark the node offline, unless a newer
    /// connection has already replaced it.
    pub async fn detach(&self, conn: &NodeConnection) {
        if let Some(conn) = self.connections.unregister(&conn.node_id, conn.conn_id).await {
            conn.cancel_all_pending().await;
            self.set_status(&conn.node_id, NodeStatus::Offline).await;
        }
    }

    /// Any frame from the node counts as a heartbeat.
    pub async fn heartbeat(&self, node_id: &str) {
        self.mark_online(node_id).await;
    }

    async fn mark_online(&self, node_id: &str) {
        if let Some(entry) = self.nodes.write().await.get_mut(node_id) {
            entry.last_heartbeat = Some(Instant::now());
        }
        self.set_status(node_id, NodeStatus::Online).await;
    }

    /// Update status and `last_seen`, persist, and publish a transition.
    async fn set_status(&self, node_id: &str, status: NodeStatus) {
        let now = unix_timestamp();
        let changed = {
            let mut nodes = self.nodes.write().await;
            let Some(entry) = nodes.get_mut(node_id) else {
                return;
            };
            let changed = entry.node.status != status;
            entry.node.status = status;
            if status == NodeStatus::Online {
                entry.node.last_seen = Some(now);
            }
            changed
        };

        let last_seen = (status == NodeStatus::Online).then_some(now);
        if let Err(e) = self.db.update_node_status(node_id, status, last_seen).await {
            warn!(node_id = %node_id, error = %e, "Failed to persist node status");
        }

        if changed {
            info!(node_id = %node_id, status = %status, "Node status changed");
            let event = match status {
                NodeStatus::Online => NodeEvent::Online(node_id.to_string()),
                NodeStatus::Offline | NodeStatus::Unknown => NodeEvent::Offline(node_id.to_string()),
            };
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }

    /// Mark online nodes whose last heartbeat is older than the timeout as
    /// offline. Returns the ids that transitioned.
    pub async fn sweep(&self) -> Vec<String> {
        let stale: Vec<String> = {
            let nodes = self.nodes.read().await;
            nodes
                .values()
                .filter(|e| e.node.status == NodeStatus::Online)
                .filter(|e| {
                    e.last_heartbeat
                        .is_none_or(|at| at.elapsed() > self.heartbeat_timeout)
                })
                .map(|e| e.node.id.clone())
                .collect()
        };
        for node_id in &stale {
            warn!(node_id = %node_id, "Node missed heartbeats");
            self.set_status(node_id, NodeStatus::Offline).await;
        }
        stale
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `shutdown` fires.
    pub fn spawn_liveness_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.sweep().await;
                    }
                }
            }
            debug!("Liveness sweeper stopped");
        })
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    /// Push a config fragment and wait for the node's ack.
    ///
    /// Pushes to one node are serialized. On [`SendError::Timeout`] the
    /// outcome on the node is unknown.
    pub async fn send(
        &self,
        node_id: &str,
        tunnel_id: &str,
        payload: &ConfigPayload,
    ) -> Result<(), SendError> {
        let conn = self
            .connections
            .get(node_id)
            .await
            .ok_or_else(|| SendError::NotConnected(node_id.to_string()))?;

        let _guard = conn.lock_send().await;

        let correlation_id = Uuid::new_v4().to_string();
        let msg = ControlMessage::config_push(correlation_id.clone(), tunnel_id, payload)?;
        let reply_rx = conn.register_pending(correlation_id.clone()).await;

        if conn.send_frame(msg).await.is_err() {
            conn.forget_pending(&correlation_id).await;
            return Err(SendError::NotConnected(node_id.to_string()));
        }
        debug!(node_id = %node_id, tunnel_id = %tunnel_id, correlation_id = %correlation_id, "Config pushed");

        match timeout(self.send_timeout, reply_rx).await {
            Ok(Ok(reply)) => match reply.message_type {
                MessageType::Ack => Ok(()),
                MessageType::Nack => Err(SendError::Rejected(
                    reply.nack_reason().unwrap_or("no reason given").to_string(),
                )),
                other => Err(SendError::Rejected(format!(
                    "unexpected reply type {}",
                    other.as_str()
                ))),
            },
            // Waiter cancelled: the connection went away mid-exchange.
            Ok(Err(_)) => Err(SendError::NotConnected(node_id.to_string())),
            Err(_) => {
                conn.forget_pending(&correlation_id).await;
                warn!(node_id = %node_id, tunnel_id = %tunnel_id, correlation_id = %correlation_id, "Config push timed out");
                Err(SendError::Timeout(node_id.to_string()))
            }
        }
    }

    /// Route an ack/nack to the push waiting for it.
    pub async fn complete(&self, node_id: &str, reply: ControlMessage) -> bool {
        let Some(correlation_id) = reply.correlation_id.clone() else {
            return false;
        };
        match self.connections.get(node_id).await {
            Some(conn) => conn.complete_pending(&correlation_id, reply).await,
            None => false,
        }
    }

    pub async fn is_connected(&self, node_id: &str) -> bool {
        self.connections.is_connected(node_id).await
    }
}
