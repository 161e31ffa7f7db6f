//! Database queries for the Smite panel.

use smite_core::db::unix_timestamp;

use super::db::{DatabaseError, PanelDatabase};
use super::models::{AppliedConfig, NodeRow, TunnelRow};
use crate::model::{BackendKind, NewNode, NodeStatus, Tunnel, TunnelStatus};

impl PanelDatabase {
    // =========================================================================
    // Node queries
    // =========================================================================

    /// Insert a node record. `node.id` must be set.
    pub async fn create_node(&self, node: &NewNode) -> Result<NodeRow, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            "INSERT INTO nodes (id, name, address, cert_subject, cert_fingerprint, status, registered_at) VALUES (?, ?, ?, ?, ?, 'unknown', ?)",
        )
        .bind(&node.id)
        .bind(&node.name)
        .bind(&node.address)
        .bind(&node.cert_subject)
        .bind(&node.cert_fingerprint)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_node(&node.id).await
    }

    pub async fn get_node(&self, id: &str) -> Result<NodeRow, DatabaseError> {
        sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Node {id}")))
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeRow>, DatabaseError> {
        let nodes = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes ORDER BY registered_at, id")
            .fetch_all(self.pool())
            .await?;
        Ok(nodes)
    }

    /// Update node status, and `last_seen` when given.
    pub async fn update_node_status(
        &self,
        id: &str,
        status: NodeStatus,
        last_seen: Option<i64>,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE nodes SET status = ?, last_seen = COALESCE(?, last_seen) WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(last_seen)
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Reset every node to `unknown`; used at startup before any agent dials in.
    pub async fn reset_node_statuses(&self) -> Result<u64, DatabaseError> {
        let result = sqlx::query("UPDATE nodes SET status = 'unknown'")
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_node(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM nodes WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Tunnel queries
    // =========================================================================

    /// Insert or replace an accepted tunnel spec.
    pub async fn upsert_tunnel(
        &self,
        tunnel: &Tunnel,
        status: TunnelStatus,
        reason: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = unix_timestamp();
        let spec = serde_json::to_string(&tunnel.spec)
            .map_err(|e| DatabaseError::Query(format!("Failed to encode spec: {e}")))?;

        sqlx::query(
            "INSERT INTO tunnels (id, name, kind, spec, node_id, status, reason, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, kind = excluded.kind, \
             spec = excluded.spec, node_id = excluded.node_id, status = excluded.status, \
             reason = excluded.reason, updated_at = excluded.updated_at",
        )
        .bind(&tunnel.id)
        .bind(&tunnel.name)
        .bind(tunnel.kind.as_str())
        .bind(spec)
        .bind(&tunnel.node_id)
        .bind(status.as_str())
        .bind(reason)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn update_tunnel_status(
        &self,
        id: &str,
        status: TunnelStatus,
        reason: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let result =
            sqlx::query("UPDATE tunnels SET status = ?, reason = ?, updated_at = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(reason)
                .bind(unix_timestamp())
                .bind(id)
                .execute(self.pool())
                .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_tunnel(&self, id: &str) -> Result<TunnelRow, DatabaseError> {
        sqlx::query_as::<_, TunnelRow>("SELECT * FROM tunnels WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Tunnel {id}")))
    }

    pub async fn list_tunnels(&self) -> Result<Vec<TunnelRow>, DatabaseError> {
        let tunnels =
            sqlx::query_as::<_, TunnelRow>("SELECT * FROM tunnels ORDER BY created_at, id")
                .fetch_all(self.pool())
                .await?;
        Ok(tunnels)
    }

    /// Tunnels referencing `node_id` that are not stopped.
    pub async fn count_live_tunnels_for_node(&self, node_id: &str) -> Result<i64, DatabaseError> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM tunnels WHERE node_id = ? AND status != 'stopped'",
        )
        .bind(node_id)
        .fetch_one(self.pool())
        .await?;
        Ok(count.0)
    }

    // =========================================================================
    // Applied config queries
    // =========================================================================

    /// Record the configuration confirmed applied for a tunnel.
    pub async fn upsert_applied_config(
        &self,
        tunnel_id: &str,
        backend: BackendKind,
        node_id: Option<&str>,
        config: &[u8],
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO applied_configs (tunnel_id, backend, node_id, config, applied_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(tunnel_id) DO UPDATE SET backend = excluded.backend, \
             node_id = excluded.node_id, config = excluded.config, applied_at = excluded.applied_at",
        )
        .bind(tunnel_id)
        .bind(backend.as_str())
        .bind(node_id)
        .bind(config)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn get_applied_config(
        &self,
        tunnel_id: &str,
    ) -> Result<Option<AppliedConfig>, DatabaseError> {
        let config =
            sqlx::query_as::<_, AppliedConfig>("SELECT * FROM applied_configs WHERE tunnel_id = ?")
                .bind(tunnel_id)
                .fetch_optional(self.pool())
                .await?;
        Ok(config)
    }

    pub async fn delete_applied_config(&self, tunnel_id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM applied_configs WHERE tunnel_id = ?")
            .bind(tunnel_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Applied configs on `node_id` whose tunnel is already stopped, i.e.
    /// removals the node never confirmed.
    pub async fn list_unconfirmed_removals(
        &self,
        node_id: &str,
    ) -> Result<Vec<AppliedConfig>, DatabaseError> {
        let configs = sqlx::query_as::<_, AppliedConfig>(
            "SELECT a.* FROM applied_configs a JOIN tunnels t ON t.id = a.tunnel_id \
             WHERE a.node_id = ? AND t.status = 'stopped' ORDER BY a.tunnel_id",
        )
        .bind(node_id)
        .fetch_all(self.pool())
        .await?;
        Ok(configs)
    }
}
