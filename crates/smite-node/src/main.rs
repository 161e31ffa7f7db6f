//! Smite Node Agent
//!
//! Keeps an mTLS control channel open to the panel and applies the reverse
//! tunnel configuration it pushes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use smite_core::tracing_init::{LogFormat, init_tracing};
use smite_node::agent::{AgentClient, AgentConfig, ConfigHandler};

#[derive(Parser, Debug)]
#[command(name = "smite-node")]
#[command(version, about = "Smite node agent - applies reverse tunnels pushed by the panel")]
struct Args {
    /// Panel control-channel address (host:port).
    #[arg(long, env = "SMITE_PANEL_ADDR")]
    panel_addr: String,

    /// Name the panel certificate is checked against.
    #[arg(long, env = "SMITE_SERVER_NAME", default_value = "localhost")]
    server_name: String,

    /// CA certificate (PEM) that signed the panel certificate.
    #[arg(long, env = "SMITE_CA_CERT")]
    ca_cert: PathBuf,

    /// This node's client certificate (PEM).
    #[arg(long, env = "SMITE_NODE_CERT")]
    cert: PathBuf,

    /// This node's private key (PEM).
    #[arg(long, env = "SMITE_NODE_KEY")]
    key: PathBuf,

    /// Directory for rendered rathole client configs.
    #[arg(long, env = "SMITE_STATE_DIR", default_value = "/var/lib/smite-node")]
    state_dir: PathBuf,

    /// Heartbeat interval in seconds.
    #[arg(long, env = "SMITE_HEARTBEAT_SECS", default_value_t = 30)]
    heartbeat_secs: u64,

    /// Give up after this many consecutive failed connection attempts.
    #[arg(long)]
    max_reconnect_attempts: Option<u32>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("smite_node=info", LogFormat::from_flag(args.log_json))?;

    if args.heartbeat_secs == 0 {
        anyhow::bail!("--heartbeat-secs must be non-zero");
    }

    let mut config = AgentConfig::new(
        args.panel_addr,
        args.server_name,
        args.ca_cert,
        args.cert,
        args.key,
        args.state_dir,
    );
    config.heartbeat_interval = Duration::from_secs(args.heartbeat_secs);
    config.reconnect.max_attempts = args.max_reconnect_attempts;

    let handler = Arc::new(ConfigHandler::load(config.state_dir.clone()).await?);
    info!(
        panel = %config.panel_addr,
        services = handler.services().await.len(),
        "Node agent starting"
    );
    let client = AgentClient::new(config, handler)?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                signal.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    client.run(shutdown).await;
    info!("Node agent stopped");
    Ok(())
}
