//! In-process forwarding engine for tcp, udp, grpc and tcpmux tunnels.
//!
//! Each tunnel owns one listener task. Accepted connections run in their own
//! tasks under a per-tunnel connection token, so a reload only stops the
//! accept loop: connections established before the reload keep flowing to
//! their original target until they close or the tunnel is removed.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::{BackendKind, TunnelKind, TunnelSpec};

/// Idle time after which a UDP client session is dropped.
pub const UDP_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

const UDP_BUFFER_SIZE: usize = 65_535;

#[derive(Debug, thiserror::Error)]
pub enum ForwardingError {
    #[error("{0} tunnels are not handled by the forwarding engine")]
    Unsupported(TunnelKind),

    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("binding port {0} timed out")]
    Timeout(u16),

    #[error("failed to render config: {0}")]
    Render(#[from] serde_json::Error),
}

/// Engine-side view of one tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    Running,
    Stopped,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// First bind for this tunnel.
    Started,
    /// Listener replaced; established connections were left running.
    Reloaded,
    /// Rendered config identical to the running one; nothing touched.
    Unchanged,
}

// Rendered configuration, shaped like a gost service list.

#[derive(Serialize)]
struct RenderedConfig<'a> {
    services: [ServiceConfig<'a>; 1],
}

#[derive(Serialize)]
struct ServiceConfig<'a> {
    name: &'a str,
    addr: String,
    handler: TypeRef,
    listener: TypeRef,
    forwarder: ForwarderConfig<'a>,
}

#[derive(Serialize)]
struct TypeRef {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ForwarderConfig<'a> {
    nodes: [ForwardNode<'a>; 1],
}

#[derive(Serialize)]
struct ForwardNode<'a> {
    name: &'static str,
    addr: &'a str,
}

/// Render the engine configuration for a tunnel.
///
/// Output depends only on the arguments, so identical specs always produce
/// byte-identical configs.
pub fn render_config(
    tunnel_id: &str,
    kind: TunnelKind,
    spec: &TunnelSpec,
) -> Result<Vec<u8>, ForwardingError> {
    if kind.backend() != BackendKind::Forwarding {
        return Err(ForwardingError::Unsupported(kind));
    }
    let handler = if kind.is_stream() { "tcp" } else { "udp" };
    let config = RenderedConfig {
        services: [ServiceConfig {
            name: tunnel_id,
            addr: format!(":{}", spec.listen_port),
            handler: TypeRef { kind: handler },
            listener: TypeRef {
                kind: kind.as_str(),
            },
            forwarder: ForwarderConfig {
                nodes: [ForwardNode {
                    name: "target-0",
                    addr: &spec.forward_to,
                }],
            },
        }],
    };
    Ok(serde_json::to_vec(&config)?)
}

struct Forward {
    kind: TunnelKind,
    listen_port: u16,
    config: Vec<u8>,
    accept_cancel: CancellationToken,
    /// Shared by every connection accepted for this tunnel, across reloads.
    conn_cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Forward {
    fn failed(kind: TunnelKind, listen_port: u16, conn_cancel: CancellationToken) -> Self {
        Self {
            kind,
            listen_port,
            config: Vec::new(),
            accept_cancel: CancellationToken::new(),
            conn_cancel,
            task: None,
        }
    }

    fn status(&self) -> BackendStatus {
        match &self.task {
            Some(task) if !task.is_finished() => BackendStatus::Running,
            _ => BackendStatus::Errored,
        }
    }

    /// Whether the live listener occupies the socket `kind`/`port` needs.
    fn holds(&self, kind: TunnelKind, port: u16) -> bool {
        self.task.is_some()
            && self.listen_port == port
            && self.kind.is_stream() == kind.is_stream()
    }

    async fn stop_accepting(&mut self) {
        self.accept_cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

enum Bound {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

/// Runs forwarding listeners keyed by tunnel id.
pub struct ForwardingEngine {
    bind_host: IpAddr,
    apply_timeout: Duration,
    udp_idle_timeout: Duration,
    forwards: Mutex<HashMap<String, Forward>>,
}

impl ForwardingEngine {
    pub fn new(bind_host: IpAddr, apply_timeout: Duration) -> Self {
        Self {
            bind_host,
            apply_timeout,
            udp_idle_timeout: UDP_SESSION_TIMEOUT,
            forwards: Mutex::new(HashMap::new()),
        }
    }

    /// Override [`UDP_SESSION_TIMEOUT`] for listeners started afterwards.
    #[must_use]
    pub fn with_udp_idle_timeout(mut self, idle: Duration) -> Self {
        self.udp_idle_timeout = idle;
        self
    }

    fn forwards(&self) -> std::sync::MutexGuard<'_, HashMap<String, Forward>> {
        self.forwards.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bring the tunnel's listener in line with `spec`.
    ///
    /// Returns [`ApplyOutcome::Unchanged`] without touching the listener when
    /// the rendered config matches the running one, unless `force` is set.
    /// Failures are reported, never retried here.
    pub async fn apply(
        &self,
        tunnel_id: &str,
        kind: TunnelKind,
        spec: &TunnelSpec,
        force: bool,
    ) -> Result<ApplyOutcome, ForwardingError> {
        let config = render_config(tunnel_id, kind, spec)?;

        let previous = {
            let mut forwards = self.forwards();
            if let Some(existing) = forwards.get(tunnel_id) {
                if !force
                    && existing.config == config
                    && existing.status() == BackendStatus::Running
                {
                    debug!(tunnel_id = %tunnel_id, "Forwarding config unchanged");
                    return Ok(ApplyOutcome::Unchanged);
                }
            }
            forwards.remove(tunnel_id)
        };

        let reloaded = previous.as_ref().is_some_and(|p| p.task.is_some());
        let conn_cancel = previous
            .as_ref()
            .map_or_else(CancellationToken::new, |p| p.conn_cancel.clone());

        let bound = match previous {
            Some(mut previous) if previous.holds(kind, spec.listen_port) => {
                // Same socket: release it first. Connection tasks are untouched.
                previous.stop_accepting().await;
                self.bind(kind, spec.listen_port).await
            }
            Some(mut previous) => match self.bind(kind, spec.listen_port).await {
                Ok(bound) => {
                    previous.stop_accepting().await;
                    Ok(bound)
                }
                Err(e) => {
                    warn!(tunnel_id = %tunnel_id, port = spec.listen_port, error = %e, "Forwarding bind failed, keeping previous listener");
                    self.forwards().insert(tunnel_id.to_string(), previous);
                    return Err(e);
                }
            },
            None => self.bind(kind, spec.listen_port).await,
        };

        let bound = match bound {
            Ok(bound) => bound,
            Err(e) => {
                warn!(tunnel_id = %tunnel_id, port = spec.listen_port, error = %e, "Forwarding bind failed");
                self.forwards().insert(
                    tunnel_id.to_string(),
                    Forward::failed(kind, spec.listen_port, conn_cancel),
                );
                return Err(e);
            }
        };

        let accept_cancel = CancellationToken::new();
        let task = spawn_listener(
            tunnel_id.to_string(),
            bound,
            spec.forward_to.clone(),
            self.udp_idle_timeout,
            accept_cancel.clone(),
            conn_cancel.clone(),
        );

        self.forwards().insert(
            tunnel_id.to_string(),
            Forward {
                kind,
                listen_port: spec.listen_port,
                config,
                accept_cancel,
                conn_cancel,
                task: Some(task),
            },
        );

        info!(
            tunnel_id = %tunnel_id,
            kind = %kind,
            listen_port = spec.listen_port,
            forward_to = %spec.forward_to,
            reloaded,
            "Forwarding applied"
        );

        Ok(if reloaded {
            ApplyOutcome::Reloaded
        } else {
            ApplyOutcome::Started
        })
    }

    async fn bind(&self, kind: TunnelKind, port: u16) -> Result<Bound, ForwardingError> {
        let addr = SocketAddr::new(self.bind_host, port);
        let result = if kind.is_stream() {
            timeout(self.apply_timeout, TcpListener::bind(addr))
                .await
                .map(|r| r.map(Bound::Tcp))
        } else {
            timeout(self.apply_timeout, UdpSocket::bind(addr))
                .await
                .map(|r| r.map(Bound::Udp))
        };
        match result {
            Ok(Ok(bound)) => Ok(bound),
            Ok(Err(source)) => Err(ForwardingError::Bind { port, source }),
            Err(_) => Err(ForwardingError::Timeout(port)),
        }
    }

    /// Stop the tunnel's listener and close its connections.
    ///
    /// Returns whether the tunnel was known. Removing an unknown tunnel is not
    /// an error.
    pub async fn remove(&self, tunnel_id: &str) -> bool {
        let Some(mut forward) = self.forwards().remove(tunnel_id) else {
            return false;
        };
        forward.stop_accepting().await;
        forward.conn_cancel.cancel();
        info!(tunnel_id = %tunnel_id, "Forwarding removed");
        true
    }

    pub fn status(&self, tunnel_id: &str) -> BackendStatus {
        self.forwards()
            .get(tunnel_id)
            .map_or(BackendStatus::Stopped, Forward::status)
    }

    /// Config currently running for the tunnel, if any.
    pub fn running_config(&self, tunnel_id: &str) -> Option<Vec<u8>> {
        self.forwards()
            .get(tunnel_id)
            .filter(|f| f.status() == BackendStatus::Running)
            .map(|f| f.config.clone())
    }

    pub fn tunnel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.forwards().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Remove every tunnel.
    pub async fn shutdown(&self) {
        for id in self.tunnel_ids() {
            self.remove(&id).await;
        }
    }
}

fn spawn_listener(
    tunnel_id: String,
    bound: Bound,
    target: String,
    udp_idle: Duration,
    accept_cancel: CancellationToken,
    conn_cancel: CancellationToken,
) -> JoinHandle<()> {
    match bound {
        Bound::Tcp(listener) => tokio::spawn(async move {
            serve_tcp(&tunnel_id, listener, Arc::from(target), accept_cancel, conn_cancel).await;
        }),
        // UDP has no connections to drain: sessions end with the listener.
        Bound::Udp(socket) => tokio::spawn(async move {
            let session_cancel = accept_cancel.child_token();
            let udp = UdpListener {
                socket: Arc::new(socket),
                target: Arc::from(target),
                idle: udp_idle,
            };
            udp.serve(&tunnel_id, accept_cancel, session_cancel).await;
        }),
    }
}

async fn serve_tcp(
    tunnel_id: &str,
    listener: TcpListener,
    target: Arc<str>,
    accept_cancel: CancellationToken,
    conn_cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = accept_cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(tunnel_id = %tunnel_id, peer = %peer, "Accepted connection");
                    let target = Arc::clone(&target);
                    let cancel = conn_cancel.clone();
                    let tunnel_id = tunnel_id.to_string();
                    tokio::spawn(async move {
                        tokio::select! {
                            () = cancel.cancelled() => {
                                debug!(tunnel_id = %tunnel_id, peer = %peer, "Connection closed by removal");
                            }
                            result = proxy_tcp(stream, &target) => {
                                if let Err(e) = result {
                                    debug!(tunnel_id = %tunnel_id, peer = %peer, error = %e, "Connection ended with error");
                                }
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!(tunnel_id = %tunnel_id, error = %e, "Failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
    debug!(tunnel_id = %tunnel_id, "Stopped accepting");
}

async fn proxy_tcp(mut inbound: TcpStream, target: &str) -> std::io::Result<()> {
    let mut outbound = TcpStream::connect(target).await?;
    match copy_bidirectional(&mut inbound, &mut outbound).await {
        Ok(_) => Ok(()),
        Err(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::ConnectionReset
            ) =>
        {
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Upstream socket for one client address. Idle once neither side has sent
/// anything for the listener's idle timeout.
struct UdpSession {
    upstream: Arc<UdpSocket>,
    last_active: Mutex<Instant>,
}

impl UdpSession {
    fn touch(&self) {
        *self.last_active.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn last_active(&self) -> Instant {
        *self.last_active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

type UdpSessions = Arc<Mutex<HashMap<SocketAddr, Arc<UdpSession>>>>;

struct UdpListener {
    socket: Arc<UdpSocket>,
    target: Arc<str>,
    idle: Duration,
}

impl UdpListener {
    async fn serve(
        &self,
        tunnel_id: &str,
        accept_cancel: CancellationToken,
        session_cancel: CancellationToken,
    ) {
        let sessions: UdpSessions = Arc::new(Mutex::new(HashMap::new()));
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];

        loop {
            let (len, client) = tokio::select! {
                () = accept_cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        debug!(tunnel_id = %tunnel_id, error = %e, "UDP receive failed");
                        continue;
                    }
                },
            };

            let existing = sessions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&client)
                .cloned();
            let session = match existing {
                Some(session) => session,
                None => match open_udp_session(&self.target).await {
                    Ok(upstream) => {
                        debug!(tunnel_id = %tunnel_id, client = %client, "Created UDP session");
                        let session = Arc::new(UdpSession {
                            upstream,
                            last_active: Mutex::new(Instant::now()),
                        });
                        sessions
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert(client, Arc::clone(&session));
                        tokio::spawn(relay_udp_replies(
                            Arc::clone(&self.socket),
                            Arc::clone(&session),
                            client,
                            self.idle,
                            Arc::clone(&sessions),
                            session_cancel.clone(),
                        ));
                        session
                    }
                    Err(e) => {
                        warn!(tunnel_id = %tunnel_id, target = %self.target, error = %e, "Failed to open UDP session");
                        continue;
                    }
                },
            };

            session.touch();
            if let Err(e) = session.upstream.send(&buf[..len]).await {
                debug!(tunnel_id = %tunnel_id, client = %client, error = %e, "UDP send upstream failed");
            }
        }
        debug!(tunnel_id = %tunnel_id, "Stopped UDP listener");
    }
}

async fn open_udp_session(target: &str) -> std::io::Result<Arc<UdpSocket>> {
    let target_addr = tokio::net::lookup_host(target)
        .await?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "target did not resolve"))?;
    let local: SocketAddr = if target_addr.is_ipv6() {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    };
    let upstream = UdpSocket::bind(local).await?;
    upstream.connect(target_addr).await?;
    Ok(Arc::new(upstream))
}

async fn relay_udp_replies(
    listener: Arc<UdpSocket>,
    session: Arc<UdpSession>,
    client: SocketAddr,
    idle: Duration,
    sessions: UdpSessions,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    loop {
        let deadline = session.last_active() + idle;
        tokio::select! {
            () = cancel.cancelled() => break,
            () = sleep_until(deadline) => {
                // Client traffic may have moved the deadline while we slept.
                if session.last_active() + idle <= Instant::now() {
                    debug!(client = %client, "UDP session idle");
                    break;
                }
            }
            received = session.upstream.recv(&mut buf) => match received {
                Ok(len) => {
                    session.touch();
                    if let Err(e) = listener.send_to(&buf[..len], client).await {
                        debug!(client = %client, error = %e, "UDP reply to client failed");
                    }
                }
                Err(e) => {
                    debug!(client = %client, error = %e, "UDP upstream receive failed");
                    break;
                }
            },
        }
    }
    sessions
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&client);
}
