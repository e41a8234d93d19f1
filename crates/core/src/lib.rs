//! # Cascade Core
//!
//! Core identifier types for the Cascade dataflow engine.
//! This crate provides the fundamental building blocks used by all other
//! Cascade crates.
//!
//! ## Key Components
//!
//! - **Identifiers**: GraphId, NodeId, ProcessId, RecordingId — strongly
//!   typed UUID wrappers that cannot be mixed up at compile time
//! - **Port keys**: PortId, the string identifier of a node's input or
//!   output port
//!
//! ## Usage
//!
//! ```rust
//! use cascade_core::{GraphId, NodeId, PortId, ProcessId};
//!
//! let graph_id = GraphId::v4();
//! let node_id = NodeId::v4();
//! let process_id = ProcessId::v4();
//! let port: PortId = "output1".into();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod id;
pub mod port;

// Re-export main types for convenience
pub use id::*;
pub use port::*;

/// Common prelude for Cascade crates
pub mod prelude {
    pub use super::{GraphId, NodeId, PortId, ProcessId, RecordingId, UuidParseError};
}
