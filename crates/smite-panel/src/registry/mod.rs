//! Node registry and per-node control channel bookkeeping.

mod connection;
mod node_registry;


pub use connection::{ConnectionRegistry, NodeConnection};
pub use node_registry::{FRAME_QUEUE_DEPTH, NodeEvent, NodeRegistry, RegistryError, SendError};
