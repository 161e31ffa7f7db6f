//! Node agent error types.

/// Errors that can occur in the node agent.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("State error: {0}")]
    State(String),
}
