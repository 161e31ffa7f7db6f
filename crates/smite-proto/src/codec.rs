//! Newline-delimited JSON framing.
//!
//! Tolerant reader: blank lines are skipped and unknown fields ignored, but a
//! frame whose `type` is not part of the protocol is reported so the caller
//! can log it and carry on.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::ProtoError;
use crate::messages::{ControlMessage, MessageType};

/// Upper bound on a single encoded frame, newline included.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Encode a message as one NDJSON line (trailing newline included).
pub fn encode_line(msg: &ControlMessage) -> Result<String, ProtoError> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    Ok(line)
}

/// Decode one NDJSON line.
pub fn decode_line(line: &str) -> Result<ControlMessage, ProtoError> {
    let raw: Value = serde_json::from_str(line.trim())?;
    let msg_type = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ProtoError::Malformed("Missing 'type' field".into()))?;

    if MessageType::parse(msg_type).is_none() {
        return Err(ProtoError::UnknownType(msg_type.to_string()));
    }

    Ok(serde_json::from_value(raw)?)
}

/// Write a message as one NDJSON line and flush.
pub async fn write_message<W>(writer: &mut W, msg: &ControlMessage) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
{
    let line = encode_line(msg)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads [`ControlMessage`] frames from a byte stream.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            line: String::new(),
        }
    }

    /// Read the next frame. Returns `Ok(None)` on a clean end of stream.
    pub async fn next_message(&mut self) -> Result<Option<ControlMessage>, ProtoError> {
        loop {
            self.line.clear();
            let limit = (MAX_FRAME_BYTES + 1) as u64;
            let read = (&mut self.inner)
                .take(limit)
                .read_line(&mut self.line)
                .await?;

            if read == 0 {
                return Ok(None);
            }
            if read > MAX_FRAME_BYTES {
                return Err(ProtoError::FrameTooLarge(MAX_FRAME_BYTES));
            }
            if self.line.trim().is_empty() {
                continue;
            }

            return decode_line(&self.line).map(Some);
        }
    }
}
