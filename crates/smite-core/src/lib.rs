//! `Smite` Core Library
//!
//! Shared functionality for `Smite` components:
//! - Configuration resolution and hierarchy
//! - `SQLite` pool setup and `DatabaseError`
//! - Exponential backoff policy shared by the reconciler and node agent
//! - Logging setup (text or JSON)
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod retry;
pub mod tracing_init;

pub use config::PanelConfig;
pub use error::{Error, Result};
pub use retry::BackoffPolicy;
