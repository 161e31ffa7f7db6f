//! Reverse tunnels realized by a rathole client on a node agent.
//!
//! The panel side runs one rathole server per tunnel, listening on the
//! tunnel's `listen_port` and exposing `remote_port`. The node's client dials
//! `panel_host:listen_port` and forwards to `forward_to`.

use std::collections::BTreeMap;
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use smite_proto::{ConfigPayload, ProtoError, RatholeFragment};

use crate::model::TunnelSpec;
use crate::registry::{NodeRegistry, SendError};
use crate::validator::{ValidationError, check_tunnel_id};

#[derive(Debug, thiserror::Error)]
pub enum ReverseError {
    #[error("node {0} is not connected")]
    NodeUnreachable(String),

    /// The push went out but no reply arrived; the node state is unknown.
    #[error("node {node_id} did not acknowledge in time")]
    AckTimeout { node_id: String },

    #[error("node agent rejected config: {0}")]
    AgentRejected(String),

    #[error("tunnel {0} has no remote_port")]
    MissingRemotePort(String),

    #[error(transparent)]
    InvalidId(ValidationError),

    #[error("failed to encode push: {0}")]
    Encode(#[from] ProtoError),

    #[error("failed to render config: {0}")]
    Render(#[from] serde_json::Error),

    #[error("failed to render server config: {0}")]
    ServerToml(#[from] toml::ser::Error),

    #[error("failed to write server config {path}: {source}")]
    ServerConfig {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl ReverseError {
    fn from_send(err: SendError) -> Self {
        match err {
            SendError::NotConnected(node_id) => Self::NodeUnreachable(node_id),
            SendError::Timeout(node_id) => Self::AckTimeout { node_id },
            SendError::Rejected(reason) => Self::AgentRejected(reason),
            SendError::Encode(e) => Self::Encode(e),
        }
    }
}

#[derive(Serialize)]
struct ServerFile {
    server: ServerSection,
}

#[derive(Serialize)]
struct ServerSection {
    bind_addr: String,
    services: BTreeMap<String, ServerService>,
}

#[derive(Serialize)]
struct ServerService {
    token: String,
    bind_addr: String,
}

/// Token shared by both ends of a tunnel when none is configured.
pub fn derive_token(tunnel_id: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"smite-rathole:");
    hasher.update(tunnel_id.as_bytes());
    hasher.update(b":");
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Render the panel-side rathole server config for one tunnel.
pub fn render_server_toml(fragment: &RatholeFragment, listen_port: u16) -> Result<String, toml::ser::Error> {
    let mut services = BTreeMap::new();
    services.insert(
        fragment.service.clone(),
        ServerService {
            token: fragment.token.clone(),
            bind_addr: format!("0.0.0.0:{}", fragment.remote_port),
        },
    );
    toml::to_string(&ServerFile {
        server: ServerSection {
            bind_addr: format!("0.0.0.0:{listen_port}"),
            services,
        },
    })
}

pub struct ReverseBackend {
    registry: Arc<NodeRegistry>,
    panel_host: String,
    token_secret: String,
    config_dir: Option<PathBuf>,
}

impl ReverseBackend {
    /// `config_dir`, when set, receives one `<tunnel_id>.server.toml` per
    /// active tunnel.
    pub fn new(
        registry: Arc<NodeRegistry>,
        panel_host: impl Into<String>,
        token_secret: impl Into<String>,
        config_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            registry,
            panel_host: panel_host.into(),
            token_secret: token_secret.into(),
            config_dir,
        }
    }

    /// Build the fragment pushed to the node for this tunnel.
    pub fn fragment(&self, tunnel_id: &str, spec: &TunnelSpec) -> Result<RatholeFragment, ReverseError> {
        check_tunnel_id(tunnel_id).map_err(ReverseError::InvalidId)?;
        let remote_port = spec
            .remote_port
            .ok_or_else(|| ReverseError::MissingRemotePort(tunnel_id.to_string()))?;
        let host = if self.panel_host.parse::<Ipv6Addr>().is_ok() {
            format!("[{}]", self.panel_host)
        } else {
            self.panel_host.clone()
        };
        let token = spec
            .token
            .clone()
            .unwrap_or_else(|| derive_token(tunnel_id, &self.token_secret));
        Ok(RatholeFragment {
            service: tunnel_id.to_string(),
            remote_addr: format!("{host}:{}", spec.listen_port),
            token,
            local_addr: spec.forward_to.clone(),
            remote_port,
        })
    }

    /// Canonical bytes recorded as the applied config for this tunnel.
    pub fn render(&self, tunnel_id: &str, spec: &TunnelSpec) -> Result<Vec<u8>, ReverseError> {
        let fragment = self.fragment(tunnel_id, spec)?;
        Ok(serde_json::to_vec(&fragment)?)
    }

    /// `None` without a config dir, or for an id that would escape it.
    pub fn server_config_path(&self, tunnel_id: &str) -> Option<PathBuf> {
        if check_tunnel_id(tunnel_id).is_err() {
            return None;
        }
        self.config_dir
            .as_ref()
            .map(|dir| dir.join(format!("{tunnel_id}.server.toml")))
    }

    /// Push the tunnel to its node and, once acknowledged, install the
    /// panel-side server config. Returns the rendered config.
    pub async fn apply(
        &self,
        tunnel_id: &str,
        node_id: &str,
        spec: &TunnelSpec,
    ) -> Result<Vec<u8>, ReverseError> {
        let fragment = self.fragment(tunnel_id, spec)?;
        let rendered = serde_json::to_vec(&fragment)?;
        let server_toml = render_server_toml(&fragment, spec.listen_port)?;

        self.registry
            .send(node_id, tunnel_id, &ConfigPayload::Apply(fragment))
            .await
            .map_err(ReverseError::from_send)?;

        if let Some(path) = self.server_config_path(tunnel_id) {
            write_atomic(&path, server_toml.as_bytes()).await?;
            debug!(tunnel_id = %tunnel_id, path = %path.display(), "Server config written");
        }
        info!(tunnel_id = %tunnel_id, node_id = %node_id, "Reverse tunnel applied");
        Ok(rendered)
    }

    /// Drop the panel-side server config, then ask the node to drop its
    /// client entry.
    ///
    /// The server config is removed even when the node cannot be reached.
    pub async fn remove(&self, tunnel_id: &str, node_id: &str) -> Result<(), ReverseError> {
        if let Some(path) = self.server_config_path(tunnel_id) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(tunnel_id = %tunnel_id, "Server config removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(tunnel_id = %tunnel_id, path = %path.display(), error = %e, "Failed to remove server config");
                }
            }
        }

        let payload = ConfigPayload::Remove {
            service: tunnel_id.to_string(),
        };
        self.registry
            .send(node_id, tunnel_id, &payload)
            .await
            .map_err(ReverseError::from_send)?;
        info!(tunnel_id = %tunnel_id, node_id = %node_id, "Reverse tunnel removed");
        Ok(())
    }
}

/// Write via a sibling temp file and rename so readers never see a partial
/// file.
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), ReverseError> {
    let to_err = |source| ReverseError::ServerConfig {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(to_err)?;
    }
    let tmp = path.with_extension("toml.tmp");
    tokio::fs::write(&tmp, contents).await.map_err(to_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(to_err)
}
