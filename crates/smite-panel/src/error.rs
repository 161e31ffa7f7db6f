//! Errors surfaced by the reconciler.

use crate::backend::{ForwardingError, ReverseError};
use crate::registry::RegistryError;
use crate::storage::DatabaseError;
use crate::validator::{ValidationError, ValidationKind};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The spec itself is invalid; only a spec change clears it.
    #[error("validation failed: {0}")]
    Validation(ValidationError),

    /// The spec collides with a tunnel already accepted.
    #[error("conflict: {0}")]
    Conflict(ValidationError),

    #[error("transient backend failure: {0}")]
    TransientBackend(String),

    #[error("node {0} is unreachable")]
    NodeUnreachable(String),

    /// The push may or may not have been applied.
    #[error("node {0} did not acknowledge in time")]
    AckTimeout(String),

    #[error("rejected by node agent: {0}")]
    Rejected(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("node {node_id} is referenced by {count} tunnel(s)")]
    NodeInUse { node_id: String, count: i64 },

    #[error("storage error: {0}")]
    Storage(#[from] DatabaseError),
}

impl ReconcileError {
    /// Whether the reconciler keeps retrying after this failure.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientBackend(_) | Self::NodeUnreachable(_) | Self::AckTimeout(_) | Self::Storage(_)
        )
    }
}

impl From<ValidationError> for ReconcileError {
    fn from(err: ValidationError) -> Self {
        match err.kind {
            ValidationKind::PortConflict => Self::Conflict(err),
            _ => Self::Validation(err),
        }
    }
}

impl From<ForwardingError> for ReconcileError {
    fn from(err: ForwardingError) -> Self {
        match err {
            ForwardingError::Unsupported(kind) => Self::Validation(ValidationError::new(
                ValidationKind::UnsupportedType,
                format!("forwarding backend cannot run '{kind}' tunnels"),
            )),
            other => Self::TransientBackend(other.to_string()),
        }
    }
}

impl From<ReverseError> for ReconcileError {
    fn from(err: ReverseError) -> Self {
        match err {
            ReverseError::NodeUnreachable(node_id) => Self::NodeUnreachable(node_id),
            ReverseError::AckTimeout { node_id } => Self::AckTimeout(node_id),
            ReverseError::AgentRejected(reason) => Self::Rejected(reason),
            ReverseError::MissingRemotePort(id) => Self::Validation(ValidationError::new(
                ValidationKind::InvalidPort,
                format!("tunnel {id} has no remote_port"),
            )),
            ReverseError::InvalidId(e) => Self::Validation(e),
            other => Self::TransientBackend(other.to_string()),
        }
    }
}

impl From<RegistryError> for ReconcileError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(id) => Self::NotFound(format!("node {id}")),
            RegistryError::Storage(e) => Self::Storage(e),
            other => Self::TransientBackend(other.to_string()),
        }
    }
}
