//! Smite Panel Library
//!
//! Core functionality for the Smite tunnel control plane:
//! - Semantic validation of submitted tunnel specs
//! - In-process TCP/UDP forwarding engine
//! - Agent-mediated rathole reverse tunnels
//! - Node registry and the mTLS node control channel
//! - Per-tunnel reconciliation and status tracking
//! - SQLite storage for nodes, tunnels and applied configuration

pub mod backend;
pub mod channel;
pub mod error;
pub mod model;
pub mod reconciler;
pub mod registry;
pub mod status;
pub mod storage;
pub mod tls;
pub mod validator;
