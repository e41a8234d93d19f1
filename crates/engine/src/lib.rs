#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Cascade Engine
//!
//! Concurrent executor for Cascade dataflow graphs.
//!
//! The engine pulls a graph from its terminal nodes backwards, runs every
//! node whose inputs have settled, and streams typed events describing the
//! run as it happens. It includes:
//!
//! - [`GraphProcessor`] — the run lifecycle: scheduling, abort, pause and
//!   resume, user-input suspension, and subgraph processor trees
//! - [`NodeHandler`] and [`HandlerRegistry`] for pluggable node behavior,
//!   with the built-in control-flow vocabulary under [`nodes`]
//! - [`NodeContext`] — the capability surface handlers execute against:
//!   globals, named events, partial outputs, cost, cancellation
//! - [`ProcessEvent`] and [`EventBus`] for observing runs
//! - [`ExecutionRecorder`] and [`replay`] for capturing a run's event
//!   stream and reconstructing its state later
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use cascade_engine::{GraphProcessor, HandlerRegistry, Inputs};
//! use cascade_graph::Project;
//!
//! # async fn demo(project: Project, graph_id: cascade_core::GraphId) -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(HandlerRegistry::with_builtins());
//! let processor = GraphProcessor::new(project, graph_id, registry)?;
//!
//! let mut events = processor.events();
//! tokio::spawn(async move {
//!     while let Some(event) = events.recv().await {
//!         println!("{}", event.name());
//!     }
//! });
//!
//! let outputs = processor.run(Inputs::new(), Inputs::new()).await?;
//! # let _ = outputs;
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod error;
pub mod event;
pub mod handler;
pub mod nodes;
pub mod recorder;
pub mod registry;

mod processor;
mod state;

pub use context::NodeContext;
pub use error::{NodeError, ProcessError, RecordingError};
pub use event::{DEFAULT_EVENT_CAPACITY, EventBus, EventSubscriber, ProcessEvent};
pub use handler::{Inputs, NodeHandler, Outputs};
pub use processor::GraphProcessor;
pub use recorder::{
    ExecutionRecorder, RecordedEvent, Recording, ReplayedRun, SERIALIZED_RECORDING_VERSION, replay,
};
pub use registry::HandlerRegistry;
