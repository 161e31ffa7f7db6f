//! Error types shared by the panel and the node agent.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The global tracing subscriber could not be installed.
    #[error("Logging setup failed: {0}")]
    Logging(String),
}
