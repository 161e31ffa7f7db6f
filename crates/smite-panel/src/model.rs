//! Domain types shared by the reconciler, backends and status tracker.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Protocol a tunnel carries. Determines the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    Tcp,
    Udp,
    Grpc,
    Tcpmux,
    Rathole,
}

impl TunnelKind {
    pub const ALL: [Self; 5] = [Self::Tcp, Self::Udp, Self::Grpc, Self::Tcpmux, Self::Rathole];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Grpc => "grpc",
            Self::Tcpmux => "tcpmux",
            Self::Rathole => "rathole",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// The one backend that realizes tunnels of this kind.
    pub const fn backend(self) -> BackendKind {
        match self {
            Self::Rathole => BackendKind::Reverse,
            Self::Tcp | Self::Udp | Self::Grpc | Self::Tcpmux => BackendKind::Forwarding,
        }
    }

    /// Connection-oriented kinds support drain-then-swap reloads.
    pub const fn is_stream(self) -> bool {
        !matches!(self, Self::Udp)
    }
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process TCP/UDP forwarding engine.
    Forwarding,
    /// Agent-mediated rathole reverse tunnels.
    Reverse,
}

impl BackendKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Forwarding => "forwarding",
            Self::Reverse => "reverse",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "forwarding" => Some(Self::Forwarding),
            "reverse" => Some(Self::Reverse),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific tunnel fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSpec {
    /// Forwarding: port bound on the panel. Rathole: panel-side control port
    /// the node's client dials.
    pub listen_port: u16,
    /// `host:port` traffic is delivered to. For rathole, the node-local service.
    pub forward_to: String,
    /// Rathole only: port exposed on the panel side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    /// Rathole only: explicit service token. Derived when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// A tunnel as submitted by the record-management layer.
///
/// `kind` is kept as a string so unsupported types surface as a validation
/// error rather than a deserialization failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRequest {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub spec: TunnelSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

/// A tunnel whose spec passed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunnel {
    pub id: String,
    pub name: String,
    pub kind: TunnelKind,
    pub spec: TunnelSpec,
    pub node_id: Option<String>,
}

impl Tunnel {
    pub const fn backend(&self) -> BackendKind {
        self.kind.backend()
    }
}

impl From<&Tunnel> for TunnelRequest {
    fn from(t: &Tunnel) -> Self {
        Self {
            id: t.id.clone(),
            name: t.name.clone(),
            kind: t.kind.as_str().to_string(),
            spec: t.spec.clone(),
            node_id: t.node_id.clone(),
        }
    }
}

/// Externally visible tunnel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Pending,
    Active,
    Degraded,
    Error,
    Stopped,
}

impl TunnelStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "degraded" => Some(Self::Degraded),
            "error" => Some(Self::Error),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Staying in the same state is always allowed (the reason may change).
    /// `pending -> degraded` covers a reverse tunnel whose node is offline at
    /// submission; `pending -> stopped` covers deletion mid-apply.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Pending)
                | (Self::Active, Self::Active)
                | (Self::Degraded, Self::Degraded)
                | (Self::Error, Self::Error)
                | (Self::Stopped, Self::Stopped)
                | (_, Self::Stopped)
                | (Self::Pending, Self::Active | Self::Error | Self::Degraded)
                | (Self::Active, Self::Degraded | Self::Error)
                | (Self::Degraded, Self::Active | Self::Error)
                | (Self::Error | Self::Stopped, Self::Pending)
        )
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Unknown,
    Online,
    Offline,
}

impl NodeStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(Self::Unknown),
            "online" => Some(Self::Online),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered node agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub address: String,
    /// Common name the node's client certificate must carry.
    pub cert_subject: String,
    /// Optional SHA-256 (hex) pin of the node's client certificate.
    pub cert_fingerprint: Option<String>,
    pub status: NodeStatus,
    pub last_seen: Option<i64>,
    pub registered_at: i64,
}

/// Input to node registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewNode {
    /// Generated when empty.
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub address: String,
    pub cert_subject: String,
    #[serde(default)]
    pub cert_fingerprint: Option<String>,
}
