//! Smite control-channel protocol
//!
//! Types exchanged between the panel and node agents over the mutually
//! authenticated control channel, plus newline-delimited JSON framing.
//!
//! This crate contains:
//! - [`ControlMessage`] envelopes (`config_push`, `heartbeat`, `ack`, `nack`)
//! - [`ConfigPayload`] carried by `config_push`
//! - [`FrameReader`] / [`write_message`] for NDJSON framing

pub mod codec;
pub mod messages;

pub use codec::{FrameReader, MAX_FRAME_BYTES, decode_line, encode_line, write_message};
pub use messages::{ConfigPayload, ControlMessage, MessageType, RatholeFragment};

/// Errors raised while encoding or decoding control messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Frame exceeds {0} bytes")]
    FrameTooLarge(usize),

    #[error("Missing payload on {0} message")]
    MissingPayload(&'static str),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
