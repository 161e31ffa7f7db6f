//! Row types for panel storage.

use serde::{Deserialize, Serialize};

use super::db::DatabaseError;
use crate::model::{BackendKind, Node, NodeStatus, Tunnel, TunnelKind, TunnelSpec, TunnelStatus};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NodeRow {
    pub id: String,
    pub name: String,
    pub address: String,
    pub cert_subject: String,
    pub cert_fingerprint: Option<String>,
    pub status: String,
    pub last_seen: Option<i64>,
    pub registered_at: i64,
}

impl From<NodeRow> for Node {
    fn from(row: NodeRow) -> Self {
        Self {
            status: NodeStatus::parse(&row.status).unwrap_or(NodeStatus::Unknown),
            id: row.id,
            name: row.name,
            address: row.address,
            cert_subject: row.cert_subject,
            cert_fingerprint: row.cert_fingerprint,
            last_seen: row.last_seen,
            registered_at: row.registered_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TunnelRow {
    pub id: String,
    pub name: String,
    pub kind: String,
    /// JSON-encoded `TunnelSpec`.
    pub spec: String,
    pub node_id: Option<String>,
    pub status: String,
    pub reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TunnelRow {
    pub fn tunnel(&self) -> Result<Tunnel, DatabaseError> {
        let kind = TunnelKind::parse(&self.kind).ok_or_else(|| {
            DatabaseError::Query(format!("tunnel {} has unknown kind '{}'", self.id, self.kind))
        })?;
        let spec: TunnelSpec = serde_json::from_str(&self.spec).map_err(|e| {
            DatabaseError::Query(format!("tunnel {} has corrupt spec: {e}", self.id))
        })?;
        Ok(Tunnel {
            id: self.id.clone(),
            name: self.name.clone(),
            kind,
            spec,
            node_id: self.node_id.clone(),
        })
    }

    pub fn status(&self) -> TunnelStatus {
        TunnelStatus::parse(&self.status).unwrap_or(TunnelStatus::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AppliedConfig {
    pub tunnel_id: String,
    pub backend: String,
    pub node_id: Option<String>,
    pub config: Vec<u8>,
    pub applied_at: i64,
}

impl AppliedConfig {
    pub fn backend_kind(&self) -> Option<BackendKind> {
        BackendKind::parse(&self.backend)
    }
}
