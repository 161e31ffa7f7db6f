//! SQLite storage for the Smite panel.
//!
//! Persists node records, accepted tunnel specs with their last status, and
//! the last applied configuration per tunnel.

mod db;
mod models;
mod queries;


pub use db::{DatabaseError, PanelDatabase};
pub use models::*;
