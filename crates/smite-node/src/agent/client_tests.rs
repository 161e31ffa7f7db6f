//! Agent session tests over in-memory pipes, plus one real mTLS reconnect.

use std::sync::Arc;
use std::time::Duration;

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use smite_core::BackoffPolicy;
use smite_proto::{ConfigPayload, ControlMessage, FrameReader, MessageType, RatholeFragment, write_message};

use super::client::{AgentClient, run_session};
use super::config::AgentConfig;
use super::error::AgentError;
use super::handler::ConfigHandler;

struct Panel {
    frames: FrameReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl Panel {
    async fn next_non_heartbeat(&mut self) -> ControlMessage {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), self.frames.next_message())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if msg.message_type != MessageType::Heartbeat {
                return msg;
            }
        }
    }

    async fn push(&mut self, correlation_id: &str, payload: &ConfigPayload) -> ControlMessage {
        let push = ControlMessage::config_push(correlation_id, payload.service(), payload).unwrap();
        write_message(&mut self.writer, &push).await.unwrap();
        self.next_non_heartbeat().await
    }
}

fn fragment(service: &str) -> RatholeFragment {
    RatholeFragment {
        service: service.into(),
        remote_addr: "panel.example:2333".into(),
        token: "tok".into(),
        local_addr: "127.0.0.1:22".into(),
        remote_port: 6022,
    }
}

fn start_session(
    handler: Arc<ConfigHandler>,
    heartbeat: Duration,
    shutdown: CancellationToken,
) -> (Panel, JoinHandle<Result<(), AgentError>>) {
    let (node_end, panel_end) = tokio::io::duplex(64 * 1024);
    let session = tokio::spawn(async move { run_session(node_end, &handler, heartbeat, &shutdown).await });
    let (reader, writer) = tokio::io::split(panel_end);
    (
        Panel {
            frames: FrameReader::new(reader),
            writer,
        },
        session,
    )
}

async fn handler() -> (tempfile::TempDir, Arc<ConfigHandler>) {
    let dir = tempfile::tempdir().unwrap();
    let handler = Arc::new(ConfigHandler::load(dir.path()).await.unwrap());
    (dir, handler)
}

#[tokio::test]
async fn heartbeat_is_sent_on_connect() {
    let (_dir, handler) = handler().await;
    let (mut panel, _session) = start_session(handler, Duration::from_secs(30), CancellationToken::new());

    let first = tokio::time::timeout(Duration::from_secs(2), panel.frames.next_message())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first.message_type, MessageType::Heartbeat);
}

#[tokio::test]
async fn heartbeats_repeat_on_interval() {
    let (_dir, handler) = handler().await;
    let (mut panel, _session) = start_session(handler, Duration::from_millis(20), CancellationToken::new());

    for _ in 0..3 {
        let msg = tokio::time::timeout(Duration::from_secs(2), panel.frames.next_message())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(msg.message_type, MessageType::Heartbeat);
    }
}

#[tokio::test]
async fn apply_push_is_acked_and_written() {
    let (_dir, handler) = handler().await;
    let (mut panel, _session) =
        start_session(Arc::clone(&handler), Duration::from_secs(30), CancellationToken::new());

    let reply = panel.push("c-1", &ConfigPayload::Apply(fragment("ssh"))).await;
    assert_eq!(reply.message_type, MessageType::Ack);
    assert_eq!(reply.correlation_id.as_deref(), Some("c-1"));
    assert_eq!(reply.tunnel_id.as_deref(), Some("ssh"));
    assert!(handler.config_path("ssh").exists());

    let reply = panel
        .push(
            "c-2",
            &ConfigPayload::Remove {
                service: "ssh".into(),
            },
        )
        .await;
    assert_eq!(reply.message_type, MessageType::Ack);
    assert!(!handler.config_path("ssh").exists());
}

#[tokio::test]
async fn invalid_push_is_nacked_with_reason() {
    let (_dir, handler) = handler().await;
    let (mut panel, _session) = start_session(handler, Duration::from_secs(30), CancellationToken::new());

    let mut bad = fragment("ssh");
    bad.local_addr = "nowhere".into();
    let reply = panel.push("c-1", &ConfigPayload::Apply(bad)).await;
    assert_eq!(reply.message_type, MessageType::Nack);
    assert_eq!(reply.correlation_id.as_deref(), Some("c-1"));
    assert!(reply.nack_reason().unwrap().contains("local_addr"));
}

#[tokio::test]
async fn push_without_payload_is_nacked() {
    let (_dir, handler) = handler().await;
    let (mut panel, _session) = start_session(handler, Duration::from_secs(30), CancellationToken::new());

    panel
        .writer
        .write_all(b"{\"type\":\"config_push\",\"correlationId\":\"c-9\"}\n")
        .await
        .unwrap();
    let reply = panel.next_non_heartbeat().await;
    assert_eq!(reply.message_type, MessageType::Nack);
    assert_eq!(reply.correlation_id.as_deref(), Some("c-9"));
}

#[tokio::test]
async fn unknown_frames_are_skipped() {
    let (_dir, handler) = handler().await;
    let (mut panel, _session) = start_session(handler, Duration::from_secs(30), CancellationToken::new());

    panel.writer.write_all(b"{\"type\":\"status\"}\n").await.unwrap();
    panel.writer.write_all(b"not json\n").await.unwrap();
    panel.writer.write_all(b"{\"correlationId\":\"c-0\"}\n").await.unwrap();
    panel.writer.write_all(b"[1,2]\n").await.unwrap();
    let reply = panel.push("c-1", &ConfigPayload::Apply(fragment("web"))).await;
    assert_eq!(reply.message_type, MessageType::Ack);
}

#[tokio::test]
async fn closed_channel_is_an_error() {
    let (_dir, handler) = handler().await;
    let (panel, session) = start_session(handler, Duration::from_secs(30), CancellationToken::new());

    drop(panel);
    let result = tokio::time::timeout(Duration::from_secs(2), session)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(AgentError::Connection(_))));
}

#[tokio::test]
async fn shutdown_ends_session_cleanly() {
    let (_dir, handler) = handler().await;
    let shutdown = CancellationToken::new();
    let (_panel, session) = start_session(handler, Duration::from_secs(30), shutdown.clone());

    shutdown.cancel();
    let result = tokio::time::timeout(Duration::from_secs(2), session)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

// =========================================================================
// Real mTLS
// =========================================================================

struct Pki {
    ca_pem: String,
    server_cert: String,
    server_key: String,
    node_cert: String,
    node_key: String,
}

fn pki() -> Pki {
    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.distinguished_name.push(DnType::CommonName, "Test CA");
    let ca_key = KeyPair::generate().unwrap();
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();
    let issuer = Issuer::from_params(&ca_params, &ca_key);

    let mut server = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    server.extended_key_usages.push(ExtendedKeyUsagePurpose::ServerAuth);
    let server_key = KeyPair::generate().unwrap();
    let server_cert = server.signed_by(&server_key, &issuer).unwrap();

    let mut node = CertificateParams::default();
    node.distinguished_name.push(DnType::CommonName, "edge-1");
    node.extended_key_usages.push(ExtendedKeyUsagePurpose::ClientAuth);
    let node_key = KeyPair::generate().unwrap();
    let node_cert = node.signed_by(&node_key, &issuer).unwrap();

    Pki {
        ca_pem: ca_cert.pem(),
        server_cert: server_cert.pem(),
        server_key: server_key.serialize_pem(),
        node_cert: node_cert.pem(),
        node_key: node_key.serialize_pem(),
    }
}

fn acceptor(pki: &Pki) -> TlsAcceptor {
    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_slice_iter(pki.ca_pem.as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots)).build().unwrap();
    let certs = CertificateDer::pem_slice_iter(pki.server_cert.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    let key = PrivateKeyDer::from_pem_slice(pki.server_key.as_bytes()).unwrap();
    let config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

#[tokio::test]
async fn agent_reconnects_after_panel_drops_channel() {
    let pki = pki();
    let dir = tempfile::tempdir().unwrap();
    for (name, pem) in [
        ("ca.pem", &pki.ca_pem),
        ("node.pem", &pki.node_cert),
        ("node-key.pem", &pki.node_key),
    ] {
        std::fs::write(dir.path().join(name), pem).unwrap();
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = acceptor(&pki);

    let mut config = AgentConfig::new(
        addr.to_string(),
        "localhost".into(),
        dir.path().join("ca.pem"),
        dir.path().join("node.pem"),
        dir.path().join("node-key.pem"),
        dir.path().join("state"),
    );
    config.reconnect = BackoffPolicy::new(Duration::from_millis(20), Duration::from_millis(100));
    let handler = Arc::new(ConfigHandler::load(dir.path().join("state")).await.unwrap());
    let client = AgentClient::new(config, handler).unwrap();

    let shutdown = CancellationToken::new();
    let agent_shutdown = shutdown.clone();
    let agent = tokio::spawn(async move { client.run(agent_shutdown).await });

    for _ in 0..2 {
        let (tcp, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let tls = acceptor.accept(tcp).await.unwrap();
        let (reader, _writer) = tokio::io::split(tls);
        let mut frames = FrameReader::new(reader);
        let first = tokio::time::timeout(Duration::from_secs(2), frames.next_message())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(first.message_type, MessageType::Heartbeat);
        // Dropping both halves closes the channel and forces a reconnect.
    }

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), agent)
        .await
        .unwrap()
        .unwrap();
}
