//! Node control channel.

pub mod server;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod server_tests;

pub use server::{ChannelError, ControlServer, HANDSHAKE_TIMEOUT, PeerIdentity, peer_identity, serve_connection};
