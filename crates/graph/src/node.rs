//! Node definitions within a graph.

use cascade_core::{NodeId, PortId};
use serde::{Deserialize, Serialize};

/// A single computation step inside a graph.
///
/// The engine never interprets `data`; it is the node type's own
/// configuration, handed verbatim to that type's handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier within the graph.
    pub id: NodeId,
    /// Type tag selecting the handler that executes this node.
    pub node_type: String,
    /// Human-readable label, also used in error messages.
    pub title: String,
    /// Optional description of what this node does.
    #[serde(default)]
    pub description: Option<String>,
    /// Skip this node entirely (treated as excluded by control flow).
    #[serde(default)]
    pub disabled: bool,
    /// Fan the node out over the elements of its array inputs.
    #[serde(default)]
    pub split_run: bool,
    /// Run split branches one at a time instead of concurrently.
    #[serde(default)]
    pub split_sequential: bool,
    /// Cap on split fan-out; unset means the engine default of 10.
    #[serde(default)]
    pub split_run_max: Option<usize>,
    /// Opaque per-type configuration.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Node {
    /// Create a minimal node.
    #[must_use]
    pub fn new(id: NodeId, node_type: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id,
            node_type: node_type.into(),
            title: title.into(),
            description: None,
            disabled: false,
            split_run: false,
            split_sequential: false,
            split_run_max: None,
            data: serde_json::Value::Null,
        }
    }

    /// Set a description.
    #[must_use]
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Set the per-type configuration payload.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Mark the node disabled.
    #[must_use]
    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    /// Enable split execution over array inputs.
    #[must_use]
    pub fn with_split_run(mut self, enabled: bool) -> Self {
        self.split_run = enabled;
        self
    }

    /// Run split branches sequentially.
    #[must_use]
    pub fn with_split_sequential(mut self, sequential: bool) -> Self {
        self.split_sequential = sequential;
        self
    }

    /// Cap split fan-out.
    #[must_use]
    pub fn with_split_run_max(mut self, max: usize) -> Self {
        self.split_run_max = Some(max);
        self
    }
}

/// One input or output port a node exposes.
///
/// Definitions are computed per node by its handler and may depend on the
/// node's connections and sibling graphs, not just its static configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDefinition {
    /// Port identifier, unique per node and direction.
    pub id: PortId,
    /// Wire type name this port carries (`"string"`, `"any[]"`, ...).
    pub data_type: String,
    /// Required input ports gate readiness: a connected required port must
    /// have a visited source before the node can run.
    #[serde(default)]
    pub required: bool,
}

impl PortDefinition {
    /// Create an optional port.
    #[must_use]
    pub fn new(id: impl Into<PortId>, data_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data_type: data_type.into(),
            required: false,
        }
    }

    /// Mark the port required.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// The computed input and output port sets of one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodePorts {
    /// Input port definitions.
    pub inputs: Vec<PortDefinition>,
    /// Output port definitions.
    pub outputs: Vec<PortDefinition>,
}

impl NodePorts {
    /// Bundle input and output definitions.
    #[must_use]
    pub fn new(inputs: Vec<PortDefinition>, outputs: Vec<PortDefinition>) -> Self {
        Self { inputs, outputs }
    }

    /// Does this node define the given input port?
    #[must_use]
    pub fn has_input(&self, port: &PortId) -> bool {
        self.inputs.iter().any(|def| def.id == *port)
    }

    /// Does this node define the given output port?
    #[must_use]
    pub fn has_output(&self, port: &PortId) -> bool {
        self.outputs.iter().any(|def| def.id == *port)
    }
}
