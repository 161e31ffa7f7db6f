//! Node agent: control-channel client and rathole client-config handler.

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod tls;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod client_tests;

pub use client::{AgentClient, run_session};
pub use config::AgentConfig;
pub use error::AgentError;
pub use handler::ConfigHandler;
