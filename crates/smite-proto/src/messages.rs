//! Control-channel message envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtoError;

/// Discriminant carried in the `type` field of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Panel -> node: apply or remove a configuration fragment.
    ConfigPush,
    /// Node -> panel: liveness signal.
    Heartbeat,
    /// Node -> panel: the referenced `config_push` was applied.
    Ack,
    /// Node -> panel: the referenced `config_push` was refused.
    Nack,
}

impl MessageType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConfigPush => "config_push",
            Self::Heartbeat => "heartbeat",
            Self::Ack => "ack",
            Self::Nack => "nack",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "config_push" => Some(Self::ConfigPush),
            "heartbeat" => Some(Self::Heartbeat),
            "ack" => Some(Self::Ack),
            "nack" => Some(Self::Nack),
            _ => None,
        }
    }
}

/// One frame on the control channel.
///
/// Every `config_push` carries a correlation id and is answered with exactly
/// one `ack` or `nack` that echoes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ControlMessage {
    /// Build a `config_push` frame.
    pub fn config_push(
        correlation_id: impl Into<String>,
        tunnel_id: impl Into<String>,
        payload: &ConfigPayload,
    ) -> Result<Self, ProtoError> {
        Ok(Self {
            message_type: MessageType::ConfigPush,
            correlation_id: Some(correlation_id.into()),
            tunnel_id: Some(tunnel_id.into()),
            payload: Some(serde_json::to_value(payload)?),
        })
    }

    pub const fn heartbeat() -> Self {
        Self {
            message_type: MessageType::Heartbeat,
            correlation_id: None,
            tunnel_id: None,
            payload: None,
        }
    }

    /// Acknowledge the push identified by `correlation_id`.
    pub fn ack(correlation_id: impl Into<String>, tunnel_id: Option<String>) -> Self {
        Self {
            message_type: MessageType::Ack,
            correlation_id: Some(correlation_id.into()),
            tunnel_id,
            payload: None,
        }
    }

    /// Refuse the push identified by `correlation_id`.
    pub fn nack(
        correlation_id: impl Into<String>,
        tunnel_id: Option<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            message_type: MessageType::Nack,
            correlation_id: Some(correlation_id.into()),
            tunnel_id,
            payload: Some(serde_json::json!({ "reason": reason.into() })),
        }
    }

    /// Decode the `config_push` payload.
    pub fn config_payload(&self) -> Result<ConfigPayload, ProtoError> {
        let payload = self
            .payload
            .clone()
            .ok_or(ProtoError::MissingPayload("config_push"))?;
        Ok(serde_json::from_value(payload)?)
    }

    /// Reason string carried by a `nack`, if any.
    pub fn nack_reason(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|p| p.get("reason"))
            .and_then(Value::as_str)
    }
}

/// Body of a `config_push`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ConfigPayload {
    /// Install or replace the fragment keyed by `service`.
    Apply(RatholeFragment),
    /// Drop the fragment keyed by `service`.
    Remove { service: String },
}

impl ConfigPayload {
    pub fn service(&self) -> &str {
        match self {
            Self::Apply(fragment) => &fragment.service,
            Self::Remove { service } => service,
        }
    }
}

/// Agent-side configuration for one reverse tunnel.
///
/// `service` is the mapping key shared by the panel-side server entry and the
/// node-side client entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatholeFragment {
    pub service: String,
    /// Panel control address the node's client dials (`host:port`).
    pub remote_addr: String,
    pub token: String,
    /// Node-local service the tunnel exposes (`host:port`).
    pub local_addr: String,
    /// Port exposed on the panel side.
    pub remote_port: u16,
}
