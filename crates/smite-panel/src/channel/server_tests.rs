//! Control-connection tests over in-memory pipes (no TLS).

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

use smite_proto::{ConfigPayload, ControlMessage, FrameReader, MessageType, write_message};

use super::server::{peer_identity, serve_connection};
use crate::model::NewNode;
use crate::registry::{NodeRegistry, SendError};
use crate::storage::PanelDatabase;
use crate::tls::certs::{generate_ca, generate_node_cert};
use crate::tls::parse_certificates;

const NODE: &str = "n1";

async fn registry() -> Arc<NodeRegistry> {
    let db = PanelDatabase::open_in_memory().await.unwrap();
    let registry = NodeRegistry::load(db, Duration::from_secs(90), Duration::from_secs(2))
        .await
        .unwrap();
    registry
        .register(NewNode {
            id: NODE.into(),
            name: "edge-1".into(),
            address: String::new(),
            cert_subject: "edge-1".into(),
            cert_fingerprint: None,
        })
        .await
        .unwrap();
    Arc::new(registry)
}

struct Agent {
    frames: FrameReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

/// Start a panel-side connection and return the node's end of it.
async fn connect(registry: &Arc<NodeRegistry>, shutdown: CancellationToken) -> Agent {
    let (panel_end, node_end) = tokio::io::duplex(64 * 1024);
    tokio::spawn(serve_connection(
        Arc::clone(registry),
        NODE.to_string(),
        panel_end,
        shutdown,
    ));
    let (reader, writer) = tokio::io::split(node_end);

    for _ in 0..100 {
        if registry.is_connected(NODE).await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Agent {
        frames: FrameReader::new(reader),
        writer,
    }
}

async fn wait_offline(registry: &NodeRegistry) {
    for _ in 0..200 {
        if !registry.is_online(NODE).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("node never went offline");
}

fn remove(service: &str) -> ConfigPayload {
    ConfigPayload::Remove {
        service: service.into(),
    }
}

#[tokio::test]
async fn connection_marks_node_online_until_closed() {
    let registry = registry().await;
    let agent = connect(&registry, CancellationToken::new()).await;
    assert!(registry.is_online(NODE).await);

    drop(agent);
    wait_offline(&registry).await;
    assert!(!registry.is_connected(NODE).await);
}

#[tokio::test]
async fn ack_completes_push() {
    let registry = registry().await;
    let mut agent = connect(&registry, CancellationToken::new()).await;

    let node = tokio::spawn(async move {
        let push = agent.frames.next_message().await.unwrap().unwrap();
        assert_eq!(push.message_type, MessageType::ConfigPush);
        assert_eq!(push.config_payload().unwrap(), remove("t1"));
        let ack = ControlMessage::ack(push.correlation_id.unwrap(), push.tunnel_id);
        write_message(&mut agent.writer, &ack).await.unwrap();
        agent
    });

    registry.send(NODE, "t1", &remove("t1")).await.unwrap();
    node.await.unwrap();
}

#[tokio::test]
async fn nack_reason_reaches_sender() {
    let registry = registry().await;
    let mut agent = connect(&registry, CancellationToken::new()).await;

    let node = tokio::spawn(async move {
        let push = agent.frames.next_message().await.unwrap().unwrap();
        let nack = ControlMessage::nack(push.correlation_id.unwrap(), push.tunnel_id, "bad fragment");
        write_message(&mut agent.writer, &nack).await.unwrap();
        agent
    });

    let err = registry.send(NODE, "t1", &remove("t1")).await.unwrap_err();
    assert!(matches!(err, SendError::Rejected(reason) if reason == "bad fragment"));
    node.await.unwrap();
}

#[tokio::test]
async fn garbage_lines_do_not_drop_the_connection() {
    let registry = registry().await;
    let mut agent = connect(&registry, CancellationToken::new()).await;

    agent.writer.write_all(b"not json\n").await.unwrap();
    agent.writer.write_all(b"{\"type\":\"status\"}\n").await.unwrap();
    agent.writer.write_all(b"{\"correlationId\":\"c-1\"}\n").await.unwrap();
    agent.writer.write_all(b"[1,2]\n").await.unwrap();
    write_message(&mut agent.writer, &ControlMessage::heartbeat())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(registry.is_connected(NODE).await);
    assert!(registry.is_online(NODE).await);
}

#[tokio::test]
async fn shutdown_closes_connection() {
    let registry = registry().await;
    let shutdown = CancellationToken::new();
    let mut agent = connect(&registry, shutdown.clone()).await;

    shutdown.cancel();
    wait_offline(&registry).await;
    let eof = tokio::time::timeout(Duration::from_secs(2), agent.frames.next_message())
        .await
        .unwrap();
    assert!(matches!(eof, Ok(None) | Err(_)));
}

#[tokio::test]
async fn disconnect_fails_outstanding_push() {
    let registry = registry().await;
    let mut agent = connect(&registry, CancellationToken::new()).await;

    let node = tokio::spawn(async move {
        agent.frames.next_message().await.unwrap().unwrap();
        drop(agent);
    });

    assert!(matches!(
        registry.send(NODE, "t1", &remove("t1")).await,
        Err(SendError::NotConnected(_))
    ));
    node.await.unwrap();
}

#[test]
fn peer_identity_reads_common_name_and_fingerprint() {
    let ca = generate_ca("Smite Test").unwrap();
    let pair = generate_node_cert(&ca, "edge-1").unwrap();
    let der = parse_certificates(pair.cert_pem.as_bytes()).unwrap().remove(0);

    let identity = peer_identity(der.as_ref()).unwrap();
    assert_eq!(identity.subject, "edge-1");
    assert_eq!(identity.fingerprint.len(), 64);
    assert_eq!(identity.fingerprint, identity.fingerprint.to_lowercase());
}

#[test]
fn peer_identity_rejects_garbage() {
    assert!(peer_identity(b"definitely not der").is_err());
}
