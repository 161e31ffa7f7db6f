//! Smite Panel
//!
//! Tunnel control plane: reconciles tunnel specs onto the forwarding engine
//! and the node-mediated reverse-tunnel backend, and serves the mTLS node
//! control channel.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::de::DeserializeOwned;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use smite_core::config::{default_database_path, global_config_path, load_config};
use smite_core::tracing_init::{LogFormat, init_tracing};

use smite_panel::backend::{ForwardingEngine, ReverseBackend};
use smite_panel::channel::ControlServer;
use smite_panel::model::{NewNode, TunnelRequest};
use smite_panel::reconciler::Reconciler;
use smite_panel::registry::{NodeRegistry, RegistryError};
use smite_panel::storage::PanelDatabase;
use smite_panel::tls::TlsMode;

#[derive(Parser, Debug)]
#[command(name = "smite-panel")]
#[command(version, about = "Smite panel - tunnel reconciler and node control channel")]
struct Args {
    /// Explicit config file (JSON), layered over the global one.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to SQLite database file.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Address the node control channel listens on.
    #[arg(long)]
    control_addr: Option<SocketAddr>,

    /// Host nodes use to reach panel-side rathole servers.
    #[arg(long)]
    panel_host: Option<String>,

    /// Address the forwarding engine binds tunnel listeners on.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind_host: IpAddr,

    /// JSON file with node records to register at startup.
    #[arg(long)]
    nodes: Option<PathBuf>,

    /// JSON file with tunnel specs to submit at startup.
    #[arg(long)]
    specs: Option<PathBuf>,

    /// Enable dev mTLS with auto-generated self-signed certificates.
    #[arg(long, conflicts_with = "tls_cert")]
    dev_tls: bool,

    /// Directory for dev certificates (defaults next to the global config).
    #[arg(long, requires = "dev_tls")]
    dev_cert_dir: Option<PathBuf>,

    /// Path to TLS certificate file (PEM).
    #[arg(long, requires_all = ["tls_key", "tls_client_ca"])]
    tls_cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM).
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// CA certificate (PEM) that signs node client certificates.
    #[arg(long, requires = "tls_cert")]
    tls_client_ca: Option<PathBuf>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing("smite_panel=info", LogFormat::from_flag(args.log_json))?;

    let mut config = load_config(args.config.as_deref())?;
    if let Some(path) = &args.db_path {
        config.database_path = Some(path.clone());
    }
    if let Some(addr) = args.control_addr {
        config.control_addr = addr;
    }
    if let Some(host) = &args.panel_host {
        config.panel_host.clone_from(host);
    }
    config.validate()?;

    let tls_mode = if let (Some(cert), Some(key), Some(ca)) =
        (&args.tls_cert, &args.tls_key, &args.tls_client_ca)
    {
        TlsMode::Custom {
            cert_path: cert.clone(),
            key_path: key.clone(),
            client_ca_path: ca.clone(),
        }
    } else if args.dev_tls {
        let cert_dir = match &args.dev_cert_dir {
            Some(dir) => dir.clone(),
            None => global_config_path()
                .as_deref()
                .and_then(Path::parent)
                .map(|dir| dir.join("certs"))
                .ok_or_else(|| anyhow::anyhow!("Cannot determine dev certificate directory"))?,
        };
        TlsMode::DevSelfSigned {
            cert_dir,
            server_names: vec!["localhost".to_string(), config.panel_host.clone()],
        }
    } else {
        anyhow::bail!("The control channel requires mTLS: pass --dev-tls or --tls-cert/--tls-key/--tls-client-ca");
    };
    let tls_config = tls_mode.to_server_config()?;

    let db_path = match &config.database_path {
        Some(path) => path.clone(),
        None => default_database_path()
            .ok_or_else(|| anyhow::anyhow!("Cannot determine database path"))?,
    };
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    info!(path = %db_path.display(), "Opening database");
    let db = PanelDatabase::open(&db_path).await?;

    let shutdown = CancellationToken::new();

    let registry = Arc::new(
        NodeRegistry::load(db.clone(), config.heartbeat_timeout(), config.send_timeout()).await?,
    );
    let sweeper = registry.spawn_liveness_sweeper(config.sweep_interval(), shutdown.clone());

    if let Some(path) = &args.nodes {
        for node in read_json::<Vec<NewNode>>(path)? {
            let name = node.name.clone();
            match registry.register(node).await {
                Ok(node) => info!(node_id = %node.id, name = %node.name, "Registered seed node"),
                Err(RegistryError::DuplicateName(_) | RegistryError::DuplicateSubject(_)) => {
                    info!(name = %name, "Seed node already registered");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    let forwarding = Arc::new(ForwardingEngine::new(args.bind_host, config.apply_timeout()));
    let reverse = Arc::new(ReverseBackend::new(
        Arc::clone(&registry),
        config.panel_host.clone(),
        config.rathole_token_secret.clone(),
        config.rathole_config_dir.clone(),
    ));
    let reconciler = Reconciler::new(db, Arc::clone(&registry), forwarding, reverse, &config);

    let restored = reconciler.restore().await?;
    info!(restored, "Restored persisted tunnels");
    let node_watch = reconciler.spawn_node_watch();
    let resets = reconciler.spawn_auto_reset(&config.auto_reset);

    if let Some(path) = &args.specs {
        for spec in read_json::<Vec<TunnelRequest>>(path)? {
            let id = spec.id.clone();
            match reconciler.submit_spec(spec).await {
                Ok(state) => info!(tunnel_id = %id, status = %state.status.as_str(), "Submitted seed spec"),
                Err(e) => warn!(tunnel_id = %id, error = %e, "Seed spec rejected"),
            }
        }
    }

    let listener = TcpListener::bind(config.control_addr)
        .await
        .with_context(|| format!("Failed to bind control channel on {}", config.control_addr))?;
    let server = Arc::new(ControlServer::new(Arc::clone(&registry), tls_config));
    let serve = tokio::spawn(server.serve(listener, shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    shutdown.cancel();
    reconciler.shutdown().await;
    node_watch.abort();
    for handle in resets {
        handle.abort();
    }
    let _ = serve.await;
    let _ = sweeper.await;

    info!("Panel stopped");
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}
