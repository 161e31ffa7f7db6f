//! Node agent configuration.

use std::path::PathBuf;
use std::time::Duration;

use smite_core::BackoffPolicy;

/// Configuration for the agent's connection to the panel.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Panel control-channel address (`host:port`).
    pub panel_addr: String,

    /// Name the panel's certificate must be valid for.
    pub server_name: String,

    /// CA that signed the panel's certificate.
    pub ca_cert_path: PathBuf,

    /// This node's client certificate and key, issued by the panel's CA.
    pub cert_path: PathBuf,
    pub key_path: PathBuf,

    /// Directory holding the rendered rathole client configs.
    pub state_dir: PathBuf,

    /// Reconnection policy.
    pub reconnect: BackoffPolicy,

    /// Heartbeat interval.
    pub heartbeat_interval: Duration,

    /// Time allowed for TCP connect plus TLS handshake.
    pub connect_timeout: Duration,
}

impl AgentConfig {
    /// Create a config with required fields and defaults.
    pub fn new(
        panel_addr: String,
        server_name: String,
        ca_cert_path: PathBuf,
        cert_path: PathBuf,
        key_path: PathBuf,
        state_dir: PathBuf,
    ) -> Self {
        Self {
            panel_addr,
            server_name,
            ca_cert_path,
            cert_path,
            key_path,
            state_dir,
            reconnect: BackoffPolicy::default(),
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}
