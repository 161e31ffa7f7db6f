//! Mutually authenticated control-channel listener.
//!
//! Nodes dial in. A connection is only attached to a node once its client
//! certificate has verified against the node CA and its subject (and pin, if
//! any) matches a registered node; anything else is dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use smite_proto::{ControlMessage, FrameReader, MessageType, ProtoError, write_message};

use crate::registry::{FRAME_QUEUE_DEPTH, NodeRegistry, RegistryError};

/// Time allowed for the TLS handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] std::io::Error),

    #[error("TLS handshake timed out")]
    HandshakeTimeout,

    #[error("peer presented no client certificate")]
    NoClientCertificate,

    #[error("invalid client certificate: {0}")]
    Certificate(String),

    #[error("node authentication failed: {0}")]
    Unauthorized(#[from] RegistryError),
}

/// Identity read from a verified client certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Subject common name.
    pub subject: String,
    /// Lowercase hex SHA-256 of the certificate DER.
    pub fingerprint: String,
}

/// Extract the subject CN and fingerprint of a DER certificate.
pub fn peer_identity(cert_der: &[u8]) -> Result<PeerIdentity, ChannelError> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| ChannelError::Certificate(e.to_string()))?;
    let subject = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or_else(|| ChannelError::Certificate("certificate has no common name".into()))?
        .to_string();
    Ok(PeerIdentity {
        subject,
        fingerprint: hex::encode(Sha256::digest(cert_der)),
    })
}

pub struct ControlServer {
    registry: Arc<NodeRegistry>,
    acceptor: TlsAcceptor,
}

impl ControlServer {
    pub fn new(registry: Arc<NodeRegistry>, tls: Arc<ServerConfig>) -> Self {
        Self {
            registry,
            acceptor: TlsAcceptor::from(tls),
        }
    }

    /// Accept node connections until `shutdown` fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "Control channel listening");
        }
        loop {
            let (stream, peer) = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept control connection");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
            };
            let server = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle(stream, peer, shutdown).await {
                    warn!(peer = %peer, error = %e, "Control connection refused");
                }
            });
        }
        debug!("Control channel stopped");
    }

    #[instrument(skip(self, stream, shutdown), fields(peer = %peer))]
    async fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<(), ChannelError> {
        let tls = timeout(HANDSHAKE_TIMEOUT, self.acceptor.accept(stream))
            .await
            .map_err(|_| ChannelError::HandshakeTimeout)?
            .map_err(ChannelError::Handshake)?;

        let identity = {
            let (_, session) = tls.get_ref();
            let cert = session
                .peer_certificates()
                .and_then(|certs| certs.first())
                .ok_or(ChannelError::NoClientCertificate)?;
            peer_identity(cert.as_ref())?
        };
        let node = self
            .registry
            .authenticate(&identity.subject, &identity.fingerprint)
            .await?;

        info!(node_id = %node.id, name = %node.name, "Node authenticated");
        serve_connection(Arc::clone(&self.registry), node.id, tls, shutdown).await;
        Ok(())
    }
}

/// Run an authenticated control connection until either side closes it.
///
/// Every frame received counts as a heartbeat. Acks and nacks complete the
/// push waiting on their correlation id.
pub async fn serve_connection<S>(
    registry: Arc<NodeRegistry>,
    node_id: String,
    stream: S,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let (frame_tx, mut frame_rx) = mpsc::channel::<ControlMessage>(FRAME_QUEUE_DEPTH);
    let conn = registry.attach(&node_id, frame_tx).await;

    let writer_node = node_id.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = frame_rx.recv().await {
            if let Err(e) = write_message(&mut writer, &msg).await {
                debug!(node_id = %writer_node, error = %e, "Control write failed");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut frames = FrameReader::new(reader);
    loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => break,
            next = frames.next_message() => next,
        };
        match next {
            Ok(Some(msg)) => {
                registry.heartbeat(&node_id).await;
                handle_frame(&registry, &node_id, msg).await;
            }
            Ok(None) => {
                info!(node_id = %node_id, "Node closed control channel");
                break;
            }
            Err(ProtoError::UnknownType(t)) => {
                warn!(node_id = %node_id, message_type = %t, "Ignoring frame of unknown type");
            }
            Err(ProtoError::Json(e)) => {
                warn!(node_id = %node_id, error = %e, "Ignoring malformed frame");
            }
            Err(ProtoError::Malformed(why)) => {
                warn!(node_id = %node_id, reason = %why, "Ignoring malformed frame");
            }
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "Control channel read failed");
                break;
            }
        }
    }

    registry.detach(&conn).await;
    writer_task.abort();
}

async fn handle_frame(registry: &NodeRegistry, node_id: &str, msg: ControlMessage) {
    match msg.message_type {
        MessageType::Heartbeat => debug!(node_id = %node_id, "Heartbeat"),
        MessageType::Ack | MessageType::Nack => {
            let correlation_id = msg.correlation_id.clone().unwrap_or_default();
            if !registry.complete(node_id, msg).await {
                warn!(node_id = %node_id, correlation_id = %correlation_id, "No pending push for reply");
            }
        }
        MessageType::ConfigPush => {
            warn!(node_id = %node_id, "Unexpected config_push from node");
        }
    }
}
