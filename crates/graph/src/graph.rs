//! Graph and project containers.

use cascade_core::{GraphId, NodeId};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::connection::Connection;
use crate::node::Node;

/// An immutable snapshot of one graph: its nodes and the connections
/// between their ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    /// Unique graph identifier.
    pub id: GraphId,
    /// Human-readable name, used in run-level error messages.
    pub name: String,
    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,
    /// Nodes in this graph.
    pub nodes: Vec<Node>,
    /// Connections between node ports.
    pub connections: Vec<Connection>,
}

impl Graph {
    /// Create an empty graph with a fresh id.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: GraphId::v4(),
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            connections: Vec::new(),
        }
    }

    /// Set a description.
    #[must_use]
    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Add a node.
    #[must_use]
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Add a connection.
    #[must_use]
    pub fn with_connection(mut self, connection: Connection) -> Self {
        self.connections.push(connection);
        self
    }

    /// Look up a node by id.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// All nodes of a given type tag.
    pub fn nodes_of_type<'a>(&'a self, node_type: &'a str) -> impl Iterator<Item = &'a Node> {
        self.nodes.iter().filter(move |n| n.node_type == node_type)
    }
}

/// A set of graphs addressable by id; sub-graph nodes resolve their target
/// through the project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Project {
    /// Graphs by id, in insertion order.
    pub graphs: IndexMap<GraphId, Graph>,
}

impl Project {
    /// Create an empty project.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a graph, keyed by its own id.
    #[must_use]
    pub fn with_graph(mut self, graph: Graph) -> Self {
        self.graphs.insert(graph.id, graph);
        self
    }

    /// Look up a graph by id.
    #[must_use]
    pub fn graph(&self, id: GraphId) -> Option<&Graph> {
        self.graphs.get(&id)
    }

    /// Find the graph containing the given node, if any.
    #[must_use]
    pub fn graph_containing(&self, node: NodeId) -> Option<&Graph> {
        self.graphs.values().find(|g| g.node(node).is_some())
    }
}
