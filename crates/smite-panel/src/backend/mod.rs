//! Backends that realize tunnels: the in-process forwarding engine and the
//! agent-mediated reverse-tunnel backend.

pub mod forwarding;
pub mod reverse;


#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod reverse_tests;

pub use forwarding::{ApplyOutcome, BackendStatus, ForwardingEngine, ForwardingError};
pub use reverse::{ReverseBackend, ReverseError};
