//! Smite Node Agent Library
//!
//! Runs on each node that hosts reverse tunnels:
//! - Dials the panel's control channel over mutual TLS
//! - Heartbeats so the panel can track liveness
//! - Writes pushed rathole fragments to per-tunnel client configs
//! - Reconnects with exponential backoff

pub mod agent;
