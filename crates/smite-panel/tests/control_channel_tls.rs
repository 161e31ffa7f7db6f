#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! mTLS control-channel tests: a real listener, real handshakes, and
//! certificates minted per test with rcgen.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncReadExt, split};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_util::sync::CancellationToken;

use smite_proto::{ConfigPayload, ControlMessage, FrameReader, MessageType, write_message};

use smite_panel::channel::{ControlServer, peer_identity};
use smite_panel::model::NewNode;
use smite_panel::registry::NodeRegistry;
use smite_panel::storage::PanelDatabase;
use smite_panel::tls::certs::{CaBundle, generate_ca, generate_node_cert, generate_server_cert};
use smite_panel::tls::{CertPair, parse_certificates, server_config_from_pem};

const NODE: &str = "node-1";
const SUBJECT: &str = "edge-1.nodes";

struct Panel {
    ca: CaBundle,
    registry: Arc<NodeRegistry>,
    addr: std::net::SocketAddr,
    shutdown: CancellationToken,
}

async fn start_panel(pin: Option<String>) -> Panel {
    let ca = generate_ca("Smite Test CA").unwrap();
    let server = generate_server_cert(&ca, &["localhost".to_string()]).unwrap();
    let tls = server_config_from_pem(
        server.cert_pem.as_bytes(),
        server.key_pem.as_bytes(),
        ca.cert_pem.as_bytes(),
    )
    .unwrap();

    let db = PanelDatabase::open_in_memory().await.unwrap();
    let registry = Arc::new(
        NodeRegistry::load(db, Duration::from_secs(90), Duration::from_secs(2))
            .await
            .unwrap(),
    );
    registry
        .register(NewNode {
            id: NODE.into(),
            name: "edge-1".into(),
            address: String::new(),
            cert_subject: SUBJECT.into(),
            cert_fingerprint: pin,
        })
        .await
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let server = Arc::new(ControlServer::new(Arc::clone(&registry), tls));
    tokio::spawn(server.serve(listener, shutdown.clone()));

    Panel {
        ca,
        registry,
        addr,
        shutdown,
    }
}

fn client_config(ca_pem: &str, identity: &CertPair) -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certificates(ca_pem.as_bytes()).unwrap() {
        roots.add(cert).unwrap();
    }
    let certs = parse_certificates(identity.cert_pem.as_bytes()).unwrap();
    let key = PrivateKeyDer::from_pem_slice(identity.key_pem.as_bytes()).unwrap();
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .unwrap(),
    )
}

async fn dial(
    panel: &Panel,
    config: Arc<ClientConfig>,
) -> std::io::Result<TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(panel.addr).await?;
    let name = ServerName::try_from("localhost".to_string()).unwrap();
    TlsConnector::from(config).connect(name, tcp).await
}

/// The panel must close a refused connection without ever attaching it.
async fn assert_refused(panel: &Panel, config: Arc<ClientConfig>) {
    if let Ok(mut stream) = dial(panel, config).await {
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)), "refused peer received data");
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!panel.registry.is_online(NODE).await);
    assert!(!panel.registry.is_connected(NODE).await);
}

async fn wait_connected(registry: &NodeRegistry) {
    for _ in 0..200 {
        if registry.is_connected(NODE).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("node never attached");
}

#[tokio::test]
async fn registered_node_with_ca_signed_cert_attaches() {
    let panel = start_panel(None).await;
    let identity = generate_node_cert(&panel.ca, SUBJECT).unwrap();
    let stream = dial(&panel, client_config(&panel.ca.cert_pem, &identity))
        .await
        .unwrap();
    let (reader, mut writer) = split(stream);
    let mut frames = FrameReader::new(reader);

    write_message(&mut writer, &ControlMessage::heartbeat())
        .await
        .unwrap();
    wait_connected(&panel.registry).await;
    assert!(panel.registry.is_online(NODE).await);

    let registry = Arc::clone(&panel.registry);
    let push = tokio::spawn(async move {
        registry
            .send(NODE, "t1", &ConfigPayload::Remove { service: "t1".into() })
            .await
    });
    let msg = frames.next_message().await.unwrap().unwrap();
    assert_eq!(msg.message_type, MessageType::ConfigPush);
    let ack = ControlMessage::ack(msg.correlation_id.unwrap(), msg.tunnel_id);
    write_message(&mut writer, &ack).await.unwrap();
    push.await.unwrap().unwrap();

    panel.shutdown.cancel();
}

#[tokio::test]
async fn certificate_from_foreign_ca_is_refused() {
    let panel = start_panel(None).await;
    let rogue_ca = generate_ca("Rogue CA").unwrap();
    let identity = generate_node_cert(&rogue_ca, SUBJECT).unwrap();

    assert_refused(&panel, client_config(&panel.ca.cert_pem, &identity)).await;
}

#[tokio::test]
async fn unregistered_subject_is_refused() {
    let panel = start_panel(None).await;
    let identity = generate_node_cert(&panel.ca, "stranger.nodes").unwrap();

    assert_refused(&panel, client_config(&panel.ca.cert_pem, &identity)).await;
}

#[tokio::test]
async fn pinned_fingerprint_must_match() {
    let ca_for_pin = generate_ca("Pin CA").unwrap();
    let pinned = generate_node_cert(&ca_for_pin, SUBJECT).unwrap();
    let der = parse_certificates(pinned.cert_pem.as_bytes()).unwrap().remove(0);
    let pin = peer_identity(der.as_ref()).unwrap().fingerprint;

    let panel = start_panel(Some(pin)).await;
    // Right CA and subject, but not the pinned certificate.
    let identity = generate_node_cert(&panel.ca, SUBJECT).unwrap();

    assert_refused(&panel, client_config(&panel.ca.cert_pem, &identity)).await;
}

#[tokio::test]
async fn client_without_panel_ca_rejects_server() {
    let panel = start_panel(None).await;
    let identity = generate_node_cert(&panel.ca, SUBJECT).unwrap();
    let other = generate_ca("Other CA").unwrap();

    let result = dial(&panel, client_config(&other.cert_pem, &identity)).await;
    assert!(result.is_err());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!panel.registry.is_online(NODE).await);
}
