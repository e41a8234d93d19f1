#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Cascade Graph
//!
//! Graph data model, port topology, and cycle analysis for the Cascade
//! dataflow engine.
//!
//! This crate provides the static types a graph is made of and the indexed
//! view the engine executes against. It includes:
//!
//! - [`DataValue`] — the tagged values flowing along connections, including
//!   the control-flow exclusion sentinel
//! - [`Node`] and [`PortDefinition`] for individual computation steps
//! - [`Connection`] for port-to-port edges
//! - [`Graph`] and [`Project`] containers
//! - [`GraphIndex`] (a `petgraph` wrapper) for node/connection lookup,
//!   per-port connection resolution, and Tarjan SCC cycle classification

pub mod connection;
pub mod error;
pub mod graph;
pub mod index;
pub mod node;
pub mod value;

pub use connection::Connection;
pub use error::GraphError;
pub use graph::{Graph, Project};
pub use index::GraphIndex;
pub use node::{Node, NodePorts, PortDefinition};
pub use value::{CONTROL_FLOW_EXCLUDED_PORT, DataValue, ExclusionReason};
