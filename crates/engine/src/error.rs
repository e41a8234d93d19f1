//! Error taxonomy: per-node failures, whole-run failures, and recording
//! failures.

use cascade_core::{GraphId, NodeId};
use cascade_graph::GraphError;
use thiserror::Error;

/// Error raised by a single node invocation.
///
/// Node errors never tear down the run by themselves: the processor records
/// them per node, lets independent branches keep going, and aggregates the
/// survivors into a [`ProcessError::GraphFailed`] once the graph settles.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Handler-specific failure with a plain message.
    #[error("{0}")]
    Message(String),

    /// The node's cancellation token fired while its handler was running.
    /// Race losers end up here.
    #[error("aborted")]
    Aborted,

    /// The run was already aborted when the node came up for dispatch.
    #[error("processing aborted")]
    ProcessingAborted,

    /// A wait for an external event or global was cut short by an abort.
    #[error("process aborted")]
    WaitAborted,

    /// One or more upstream nodes errored, so this node can never get its
    /// inputs.
    #[error("cannot process node {title} ({node_id}) because it depends on errored nodes: {blocked}")]
    DependencyFailed {
        /// Title of the blocked node.
        title: String,
        /// Id of the blocked node.
        node_id: NodeId,
        /// Formatted `title (id)` list of the errored dependencies.
        blocked: String,
    },

    /// A loop controller was reached while already inside a different
    /// controller's loop.
    #[error("nested loops are not supported")]
    NestedLoop,

    /// Scheduler-side backstop for a controller whose re-arm count passes
    /// its configured limit. The controller's own cap check
    /// ([`MaxLoopIterations`](Self::MaxLoopIterations)) fires first on the
    /// offending pass, so that is the message runs normally surface.
    #[error("loop controller {title} has exceeded max iterations of {max}")]
    LoopLimitExceeded {
        /// Title of the offending controller.
        title: String,
        /// Configured iteration limit.
        max: usize,
    },

    /// The controller itself hit its iteration limit with the at-max action
    /// set to `error`.
    #[error("loop controller exceeded max iterations of {max}")]
    MaxLoopIterations {
        /// Configured iteration limit.
        max: usize,
    },

    /// A global-variable node resolved to an empty variable id.
    #[error("missing variable id")]
    MissingVariableId,

    /// A subgraph node referenced a graph the project does not contain.
    #[error("graph {0} not found in project")]
    GraphNotFound(GraphId),

    /// The node's `data` blob did not deserialize into the handler's
    /// configuration shape.
    #[error("invalid node data: {0}")]
    InvalidData(#[from] serde_json::Error),

    /// No handler is registered for the node's type tag.
    #[error("unknown node type: {0}")]
    UnknownNodeType(String),
}

impl NodeError {
    /// Wraps an arbitrary message, the escape hatch for handler-specific
    /// failures.
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// Error returned from a whole-graph run.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// One or more nodes errored and the run was not aborted as successful.
    #[error("graph {name} ({graph_id}) failed to process due to errors in nodes: {failures}")]
    GraphFailed {
        /// Display name of the failed graph.
        name: String,
        /// Id of the failed graph.
        graph_id: GraphId,
        /// Formatted `title (id): message` list of node failures.
        failures: String,
    },

    /// The run was aborted with a host-supplied error message.
    #[error("{0}")]
    Aborted(String),

    /// `run` was called while a previous run on the same processor had not
    /// finished.
    #[error("cannot process graph while already processing")]
    AlreadyProcessing,

    /// The processor was pointed at a graph id the project does not contain.
    #[error("graph {0} not found in project")]
    GraphNotFound(GraphId),

    /// A node in the graph has a type tag with no registered handler.
    #[error("unknown node type: {0}")]
    UnknownNodeType(String),

    /// The graph failed structural validation while building the execution
    /// index.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Error raised while serializing, loading, or replaying a recording.
#[derive(Debug, Error)]
pub enum RecordingError {
    /// The serialized envelope carries a version this build cannot read.
    #[error("unsupported serialized events version: {0}")]
    UnsupportedVersion(u32),

    /// The recording references a graph the supplied project does not have.
    #[error("mismatch between project and recording: graph {0} not found in project")]
    GraphMismatch(GraphId),

    /// The recording references a node no graph in the supplied project has.
    #[error("mismatch between project and recording: node {0} not found in any graph in project")]
    NodeMismatch(NodeId),

    /// The envelope itself failed to encode or decode.
    #[error("recording serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}
