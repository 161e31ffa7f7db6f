//! Tests for the agent-mediated reverse-tunnel backend.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use smite_proto::{ConfigPayload, ControlMessage};

use super::reverse::{ReverseBackend, ReverseError, derive_token, render_server_toml};
use crate::model::{NewNode, TunnelSpec};
use crate::registry::{FRAME_QUEUE_DEPTH, NodeRegistry};
use crate::storage::PanelDatabase;

const NODE: &str = "n1";

async fn registry(send_timeout: Duration) -> Arc<NodeRegistry> {
    let db = PanelDatabase::open_in_memory().await.unwrap();
    let registry = NodeRegistry::load(db, Duration::from_secs(90), send_timeout)
        .await
        .unwrap();
    registry
        .register(NewNode {
            id: NODE.into(),
            name: "edge-1".into(),
            address: "198.51.100.4".into(),
            cert_subject: "edge-1".into(),
            cert_fingerprint: None,
        })
        .await
        .unwrap();
    Arc::new(registry)
}

fn spec() -> TunnelSpec {
    TunnelSpec {
        listen_port: 2333,
        forward_to: "127.0.0.1:22".into(),
        remote_port: Some(6022),
        token: None,
    }
}

/// Connect a fake agent that answers pushes and reports what it received.
async fn connect_agent(
    registry: &Arc<NodeRegistry>,
    reject: Option<&'static str>,
) -> mpsc::UnboundedReceiver<ConfigPayload> {
    let (tx, mut rx) = mpsc::channel::<ControlMessage>(FRAME_QUEUE_DEPTH);
    registry.attach(NODE, tx).await;
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    let registry = Arc::clone(registry);
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let corr = msg.correlation_id.clone().unwrap();
            seen_tx.send(msg.config_payload().unwrap()).unwrap();
            let reply = match reject {
                Some(reason) => ControlMessage::nack(corr, msg.tunnel_id.clone(), reason),
                None => ControlMessage::ack(corr, msg.tunnel_id.clone()),
            };
            registry.complete(NODE, reply).await;
        }
    });
    seen_rx
}

#[tokio::test]
async fn fragment_derives_stable_token() {
    let backend = ReverseBackend::new(registry(Duration::from_secs(1)).await, "panel.example", "s3cret", None);

    let fragment = backend.fragment("r1", &spec()).unwrap();
    assert_eq!(fragment.service, "r1");
    assert_eq!(fragment.remote_addr, "panel.example:2333");
    assert_eq!(fragment.local_addr, "127.0.0.1:22");
    assert_eq!(fragment.remote_port, 6022);
    assert_eq!(fragment.token, derive_token("r1", "s3cret"));
    assert_eq!(fragment.token.len(), 64);

    assert_ne!(derive_token("r1", "s3cret"), derive_token("r2", "s3cret"));
    assert_ne!(derive_token("r1", "s3cret"), derive_token("r1", "other"));
    assert_eq!(
        backend.render("r1", &spec()).unwrap(),
        backend.render("r1", &spec()).unwrap()
    );
}

#[tokio::test]
async fn fragment_honors_explicit_token_and_ipv6_host() {
    let backend = ReverseBackend::new(registry(Duration::from_secs(1)).await, "2001:db8::1", "s", None);
    let mut spec = spec();
    spec.token = Some("fixed".into());

    let fragment = backend.fragment("r1", &spec).unwrap();
    assert_eq!(fragment.token, "fixed");
    assert_eq!(fragment.remote_addr, "[2001:db8::1]:2333");
}

#[tokio::test]
async fn fragment_requires_remote_port() {
    let backend = ReverseBackend::new(registry(Duration::from_secs(1)).await, "panel", "s", None);
    let mut spec = spec();
    spec.remote_port = None;

    assert!(matches!(
        backend.fragment("r1", &spec),
        Err(ReverseError::MissingRemotePort(id)) if id == "r1"
    ));
}

#[test]
fn server_toml_lists_one_service() {
    let fragment = smite_proto::RatholeFragment {
        service: "r1".into(),
        remote_addr: "panel:2333".into(),
        token: "tok".into(),
        local_addr: "127.0.0.1:22".into(),
        remote_port: 6022,
    };
    let rendered = render_server_toml(&fragment, 2333).unwrap();
    let parsed: toml::Value = toml::from_str(&rendered).unwrap();

    assert_eq!(parsed["server"]["bind_addr"].as_str(), Some("0.0.0.0:2333"));
    let service = &parsed["server"]["services"]["r1"];
    assert_eq!(service["token"].as_str(), Some("tok"));
    assert_eq!(service["bind_addr"].as_str(), Some("0.0.0.0:6022"));
}

#[tokio::test]
async fn apply_pushes_fragment_and_writes_server_config() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(Duration::from_secs(2)).await;
    let mut seen = connect_agent(&registry, None).await;
    let backend = ReverseBackend::new(registry, "panel", "s", Some(dir.path().to_path_buf()));

    let rendered = backend.apply("r1", NODE, &spec()).await.unwrap();
    assert_eq!(rendered, backend.render("r1", &spec()).unwrap());

    match seen.recv().await.unwrap() {
        ConfigPayload::Apply(fragment) => {
            assert_eq!(fragment, backend.fragment("r1", &spec()).unwrap());
        }
        other => panic!("expected apply, got {other:?}"),
    }

    let path = backend.server_config_path("r1").unwrap();
    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains("0.0.0.0:6022"));
    assert!(!path.with_extension("toml.tmp").exists());
}

#[tokio::test]
async fn remove_deletes_server_config_and_notifies_node() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(Duration::from_secs(2)).await;
    let mut seen = connect_agent(&registry, None).await;
    let backend = ReverseBackend::new(registry, "panel", "s", Some(dir.path().to_path_buf()));

    backend.apply("r1", NODE, &spec()).await.unwrap();
    seen.recv().await.unwrap();

    backend.remove("r1", NODE).await.unwrap();
    assert_eq!(
        seen.recv().await.unwrap(),
        ConfigPayload::Remove {
            service: "r1".into()
        }
    );
    assert!(!backend.server_config_path("r1").unwrap().exists());
}

#[tokio::test]
async fn unreachable_node_still_drops_server_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("r1.server.toml");
    std::fs::write(&path, "stale").unwrap();
    let backend = ReverseBackend::new(
        registry(Duration::from_secs(1)).await,
        "panel",
        "s",
        Some(dir.path().to_path_buf()),
    );

    assert!(matches!(
        backend.remove("r1", NODE).await,
        Err(ReverseError::NodeUnreachable(id)) if id == NODE
    ));
    assert!(!path.exists());

    assert!(matches!(
        backend.apply("r1", NODE, &spec()).await,
        Err(ReverseError::NodeUnreachable(_))
    ));
    assert!(!path.exists());
}

#[tokio::test]
async fn escaping_id_never_touches_files_outside_config_dir() {
    let root = tempfile::tempdir().unwrap();
    let config_dir = root.path().join("rathole");
    std::fs::create_dir(&config_dir).unwrap();
    let outside = root.path().join("x.server.toml");
    std::fs::write(&outside, "keep").unwrap();
    let backend = ReverseBackend::new(
        registry(Duration::from_millis(50)).await,
        "panel",
        "s",
        Some(config_dir),
    );

    assert!(backend.server_config_path("../x").is_none());
    let _ = backend.remove("../x", NODE).await;
    assert_eq!(std::fs::read_to_string(&outside).unwrap(), "keep");

    assert!(matches!(
        backend.apply("../x", NODE, &spec()).await,
        Err(ReverseError::InvalidId(_))
    ));
}

#[tokio::test]
async fn agent_rejection_surfaces_reason() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(Duration::from_secs(2)).await;
    let _seen = connect_agent(&registry, Some("address in use")).await;
    let backend = ReverseBackend::new(registry, "panel", "s", Some(dir.path().to_path_buf()));

    let err = backend.apply("r1", NODE, &spec()).await.unwrap_err();
    assert!(matches!(err, ReverseError::AgentRejected(reason) if reason == "address in use"));
    assert!(!backend.server_config_path("r1").unwrap().exists());
}

#[tokio::test]
async fn silent_agent_is_an_ack_timeout() {
    let registry = registry(Duration::from_millis(50)).await;
    let (tx, mut rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
    registry.attach(NODE, tx).await;
    let (got_tx, got_rx) = oneshot::channel();
    tokio::spawn(async move {
        let msg = rx.recv().await.unwrap();
        let _ = got_tx.send(msg);
        // Keep the queue open without answering.
        std::future::pending::<()>().await;
    });
    let backend = ReverseBackend::new(registry, "panel", "s", None);

    assert!(matches!(
        backend.apply("r1", NODE, &spec()).await,
        Err(ReverseError::AckTimeout { node_id }) if node_id == NODE
    ));
    assert!(got_rx.await.is_ok());
}
