//! Per-invocation capabilities handed to node handlers.

use std::collections::HashMap;
use std::sync::Arc;

use cascade_core::{GraphId, NodeId, ProcessId};
use cascade_graph::{DataValue, Project};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::error::{NodeError, ProcessError};
use crate::event::ProcessEvent;
use crate::handler::{Inputs, Outputs};
use crate::processor::{ExecutorInfo, GraphProcessor, Inner};

/// Everything a handler may do besides computing outputs.
///
/// A context is built fresh for each invocation (each loop iteration and
/// each split branch gets its own) and snapshots the run-scoped values it
/// exposes by reference. Mutable facilities (globals, cache, graph
/// outputs) go through the processor and are shared across the whole
/// processor tree.
pub struct NodeContext {
    inner: Arc<Inner>,
    node_id: NodeId,
    process_id: ProcessId,
    token: CancellationToken,
    branch_index: usize,
    graph_inputs: Inputs,
    context_values: Inputs,
    plugin_settings: HashMap<String, String>,
}

impl NodeContext {
    pub(crate) fn new(
        inner: Arc<Inner>,
        node_id: NodeId,
        process_id: ProcessId,
        token: CancellationToken,
        branch_index: usize,
    ) -> Self {
        let graph_inputs = inner.state.graph_inputs();
        let context_values = inner.state.context_values();
        let plugin_settings = inner.plugin_settings();
        Self {
            inner,
            node_id,
            process_id,
            token,
            branch_index,
            graph_inputs,
            context_values,
            plugin_settings,
        }
    }

    /// Node being invoked.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Graph the node belongs to.
    #[must_use]
    pub fn graph_id(&self) -> GraphId {
        self.inner.graph_id
    }

    /// Identifier of this invocation.
    #[must_use]
    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    /// Split branch index, 0 outside split runs.
    #[must_use]
    pub fn branch_index(&self) -> usize {
        self.branch_index
    }

    /// Token cancelled when this invocation (or the whole run) is aborted.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.token
    }

    /// The project this run executes in.
    #[must_use]
    pub fn project(&self) -> &Project {
        &self.inner.project
    }

    /// Values supplied for the graph's input nodes this run.
    #[must_use]
    pub fn graph_inputs(&self) -> &Inputs {
        &self.graph_inputs
    }

    /// Host-supplied ambient values, identical across the processor tree.
    #[must_use]
    pub fn context_values(&self) -> &Inputs {
        &self.context_values
    }

    /// Host settings passed through to handlers unmodified.
    #[must_use]
    pub fn plugin_settings(&self) -> &HashMap<String, String> {
        &self.plugin_settings
    }

    /// One host setting by key.
    #[must_use]
    pub fn plugin_setting(&self, key: &str) -> Option<&str> {
        self.plugin_settings.get(key).map(String::as_str)
    }

    /// Scratch cache shared across runs and subprocessors.
    #[must_use]
    pub fn cache(&self) -> &DashMap<String, serde_json::Value> {
        &self.inner.cache
    }

    /// Number of completed activations of this node's loop controller.
    ///
    /// 0 on the first pass and outside loops.
    #[must_use]
    pub fn loop_iteration(&self) -> usize {
        self.inner
            .state
            .loop_info_of(self.node_id)
            .map_or(0, |info| info.iteration)
    }

    /// Reads a global variable.
    #[must_use]
    pub fn get_global(&self, id: &str) -> Option<DataValue> {
        self.inner.globals.get(id)
    }

    /// Writes a global variable and announces the write on the event
    /// stream.
    pub fn set_global(&self, id: impl Into<String>, value: DataValue) {
        let id = id.into();
        self.inner.globals.set(id.clone(), value.clone());
        self.inner.emit(ProcessEvent::GlobalSet {
            id,
            value,
            process_id: self.process_id,
        });
    }

    /// Waits until a global variable exists and returns its value.
    pub async fn wait_for_global(&self, id: &str) -> Result<DataValue, NodeError> {
        tokio::select! {
            value = self.inner.globals.wait_for(id) => Ok(value),
            () = self.token.cancelled() => Err(NodeError::WaitAborted),
        }
    }

    /// Raises a named event, visible to subscribers of the root processor
    /// and to any node waiting on the name anywhere in the tree.
    pub fn raise_event(&self, name: &str, data: Option<DataValue>) {
        self.inner.raise_event(name, data);
    }

    /// Waits for the next event with the given name and returns its
    /// payload.
    pub async fn wait_for_event(&self, name: &str) -> Result<Option<DataValue>, NodeError> {
        tokio::select! {
            payload = self.inner.user_events.wait(name) => Ok(payload),
            () = self.token.cancelled() => Err(NodeError::WaitAborted),
        }
    }

    /// Emits a diagnostic line on the event stream.
    pub fn trace(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::trace!(node = %self.node_id, "{message}");
        self.inner.emit(ProcessEvent::Trace { message });
    }

    /// Aborts the whole run.
    ///
    /// Without an error the abort counts as successful: the run ends
    /// without raising. With an error the run fails with that message.
    pub fn abort_graph(&self, error: Option<String>) {
        let _ = self.inner.begin_abort(error.is_none(), error);
    }

    /// Streams intermediate outputs before the node finishes.
    pub fn partial_output(&self, outputs: Outputs) {
        self.inner
            .emit_partial(self.node_id, self.process_id, self.branch_index, outputs);
    }

    /// Adds to the run's accumulated cost counter.
    pub fn add_cost(&self, amount: f64) {
        self.inner.state.record_cost(amount);
    }

    /// Reads a graph output recorded so far this run.
    #[must_use]
    pub fn graph_output(&self, id: &str) -> Option<DataValue> {
        self.inner
            .state
            .graph_outputs
            .get(id)
            .map(|entry| entry.value().clone())
    }

    /// Records a graph output.
    pub fn set_graph_output(&self, id: impl Into<cascade_core::PortId>, value: DataValue) {
        self.inner.state.graph_outputs.insert(id.into(), value);
    }

    /// Builds a subprocessor for another graph in the project, wired as a
    /// child of this invocation: it shares the cache, globals, events,
    /// and pause state, forwards its events to this processor, and is
    /// cancelled with this node.
    pub fn create_subprocessor(
        &self,
        graph_id: GraphId,
        graph_partials: bool,
    ) -> Result<GraphProcessor, NodeError> {
        let executor = ExecutorInfo {
            node_id: self.node_id,
            process_id: self.process_id,
            index: self.branch_index,
            graph_partials,
        };
        self.inner
            .create_subprocessor(graph_id, executor, self.token.clone())
            .map_err(|error| match error {
                ProcessError::GraphNotFound(id) => NodeError::GraphNotFound(id),
                other => NodeError::message(other.to_string()),
            })
    }
}
