//! Control-channel client that keeps the node attached to the panel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use smite_proto::{ControlMessage, FrameReader, MessageType, ProtoError, write_message};

use super::config::AgentConfig;
use super::error::AgentError;
use super::handler::ConfigHandler;
use super::tls::load_client_config;

/// Connections that stayed up this long reset the backoff.
const STABLE_CONNECTION: Duration = Duration::from_secs(60);

const OUTBOUND_QUEUE_DEPTH: usize = 64;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Agent client that maintains a persistent connection to the panel.
pub struct AgentClient {
    config: AgentConfig,
    handler: Arc<ConfigHandler>,
    connector: TlsConnector,
}

impl AgentClient {
    pub fn new(config: AgentConfig, handler: Arc<ConfigHandler>) -> Result<Self, AgentError> {
        let tls = load_client_config(&config.ca_cert_path, &config.cert_path, &config.key_path)?;
        Ok(Self {
            config,
            handler,
            connector: TlsConnector::from(tls),
        })
    }

    /// Run the agent with automatic reconnection until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut attempt: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                info!("Agent shutting down");
                return;
            }

            let started = Instant::now();
            match self.connect_and_run(&shutdown).await {
                Ok(()) => {
                    info!("Control channel closed cleanly");
                    return;
                }
                Err(e) => {
                    if started.elapsed() > STABLE_CONNECTION {
                        attempt = 0;
                    }

                    if !self.config.reconnect.should_retry(attempt) {
                        error!(error = %e, attempt, "Max reconnect attempts reached");
                        return;
                    }

                    let delay = self.config.reconnect.delay_for_attempt(attempt);
                    warn!(error = %e, attempt, delay_ms = delay.as_millis(), "Reconnecting");

                    tokio::select! {
                        () = sleep(delay) => {}
                        () = shutdown.cancelled() => {
                            info!("Agent shutting down during reconnect wait");
                            return;
                        }
                    }

                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn connect_and_run(&self, shutdown: &CancellationToken) -> Result<(), AgentError> {
        let server_name = ServerName::try_from(self.config.server_name.clone())
            .map_err(|e| AgentError::Tls(format!("Invalid server name: {e}")))?;

        let connect = async {
            let tcp = TcpStream::connect(&self.config.panel_addr)
                .await
                .map_err(|e| AgentError::Connection(format!("{}: {e}", self.config.panel_addr)))?;
            self.connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| AgentError::Tls(format!("Handshake failed: {e}")))
        };
        let stream = timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| AgentError::Connection("Connect timed out".into()))??;

        info!(panel = %self.config.panel_addr, "Control channel connected");
        run_session(
            stream,
            &self.handler,
            self.config.heartbeat_interval,
            shutdown,
        )
        .await
    }
}

/// Serve one established control channel.
///
/// Sends a heartbeat straight away and then every `heartbeat_interval`, and
/// answers each `config_push` with exactly one ack or nack. Returns `Ok` only
/// on shutdown; a closed or broken channel is an error so the caller
/// reconnects.
pub async fn run_session<S>(
    stream: S,
    handler: &ConfigHandler,
    heartbeat_interval: Duration,
    shutdown: &CancellationToken,
) -> Result<(), AgentError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let (out_tx, mut out_rx) = mpsc::channel::<ControlMessage>(OUTBOUND_QUEUE_DEPTH);

    let writer_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if let Err(e) = write_message(&mut writer, &msg).await {
                debug!(error = %e, "Control write failed");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let heartbeat_tx = out_tx.clone();
    let heartbeat_task = tokio::spawn(async move {
        let mut timer = tokio::time::interval(heartbeat_interval);
        loop {
            timer.tick().await;
            if heartbeat_tx.send(ControlMessage::heartbeat()).await.is_err() {
                break;
            }
        }
    });

    let mut frames = FrameReader::new(reader);
    let result = loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => {
                info!("Agent received shutdown signal");
                break Ok(());
            }
            next = frames.next_message() => next,
        };
        match next {
            Ok(Some(msg)) => {
                if let Some(reply) = handle_frame(handler, msg).await {
                    if out_tx.send(reply).await.is_err() {
                        break Err(AgentError::Stream("Control writer stopped".into()));
                    }
                }
            }
            Ok(None) => break Err(AgentError::Connection("Channel closed by panel".into())),
            Err(ProtoError::UnknownType(t)) => {
                warn!(message_type = %t, "Ignoring frame of unknown type");
            }
            Err(ProtoError::Json(e)) => {
                warn!(error = %e, "Ignoring malformed frame");
            }
            Err(ProtoError::Malformed(why)) => {
                warn!(reason = %why, "Ignoring malformed frame");
            }
            Err(e) => break Err(AgentError::Stream(e.to_string())),
        }
    };

    heartbeat_task.abort();
    drop(out_tx);
    // Let queued replies drain before the socket closes.
    let _ = timeout(WRITER_DRAIN_TIMEOUT, writer_task).await;
    result
}

async fn handle_frame(handler: &ConfigHandler, msg: ControlMessage) -> Option<ControlMessage> {
    match msg.message_type {
        MessageType::ConfigPush => {
            let Some(correlation_id) = msg.correlation_id.clone() else {
                warn!("config_push without correlation id");
                return None;
            };
            let tunnel_id = msg.tunnel_id.clone();
            let result = match msg.config_payload() {
                Ok(payload) => handler.handle(&payload).await,
                Err(e) => Err(format!("bad payload: {e}")),
            };
            Some(match result {
                Ok(applied) => {
                    debug!(correlation_id = %correlation_id, ?applied, "Push applied");
                    ControlMessage::ack(correlation_id, tunnel_id)
                }
                Err(reason) => {
                    warn!(correlation_id = %correlation_id, reason = %reason, "Push refused");
                    ControlMessage::nack(correlation_id, tunnel_id, reason)
                }
            })
        }
        MessageType::Heartbeat => {
            debug!("Heartbeat from panel");
            None
        }
        MessageType::Ack | MessageType::Nack => {
            warn!(message_type = ?msg.message_type, "Unexpected reply from panel");
            None
        }
    }
}
