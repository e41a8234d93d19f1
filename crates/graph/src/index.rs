//! Graph topology index built on `petgraph`.
//!
//! [`GraphIndex`] is constructed once per graph and reused across runs. It
//! holds the node/connection lookup tables, the computed port definitions,
//! and the cycle classification produced by Tarjan's strongly-connected
//! components algorithm. Connections referencing ports a node does not
//! define are dropped at construction so the scheduler never sees them.

use std::collections::HashMap;

use cascade_core::{NodeId, PortId};
use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::warn;

use crate::connection::Connection;
use crate::error::GraphError;
use crate::graph::Graph;
use crate::node::{Node, NodePorts, PortDefinition};

/// Lookup tables and cycle analysis for one graph.
#[derive(Debug)]
pub struct GraphIndex {
    nodes_by_id: HashMap<NodeId, Node>,
    ports: HashMap<NodeId, NodePorts>,
    connections_by_node: HashMap<NodeId, Vec<Connection>>,
    graph: DiGraph<NodeId, Connection>,
    index_map: HashMap<NodeId, NodeIndex>,
    component_of: HashMap<NodeId, usize>,
    cycles: Vec<Vec<NodeId>>,
}

impl GraphIndex {
    /// Build an index from a graph and the computed port definitions of its
    /// nodes.
    ///
    /// Returns an error on duplicate node ids, connections touching unknown
    /// nodes, or self-loop connections. Connections whose ports are not in
    /// the supplied definitions are dropped with a warning, not an error.
    pub fn build(graph: &Graph, ports: HashMap<NodeId, NodePorts>) -> Result<Self, GraphError> {
        let mut nodes_by_id = HashMap::with_capacity(graph.nodes.len());
        for node in &graph.nodes {
            if nodes_by_id.insert(node.id, node.clone()).is_some() {
                return Err(GraphError::DuplicateNodeId(node.id));
            }
        }

        let empty = NodePorts::default();
        let mut kept = Vec::with_capacity(graph.connections.len());
        for conn in &graph.connections {
            if !nodes_by_id.contains_key(&conn.output_node) {
                return Err(GraphError::UnknownNode(conn.output_node));
            }
            if !nodes_by_id.contains_key(&conn.input_node) {
                return Err(GraphError::UnknownNode(conn.input_node));
            }
            if conn.is_self_loop() {
                return Err(GraphError::SelfLoop(conn.output_node));
            }

            let source_ports = ports.get(&conn.output_node).unwrap_or(&empty);
            let target_ports = ports.get(&conn.input_node).unwrap_or(&empty);
            if !source_ports.has_output(&conn.output_port) {
                warn!(
                    node = %conn.output_node,
                    port = %conn.output_port,
                    "dropping connection from undefined output port"
                );
                continue;
            }
            if !target_ports.has_input(&conn.input_port) {
                warn!(
                    node = %conn.input_node,
                    port = %conn.input_port,
                    "dropping connection to undefined input port"
                );
                continue;
            }
            kept.push(conn.clone());
        }

        let mut digraph = DiGraph::new();
        let mut index_map = HashMap::with_capacity(nodes_by_id.len());
        for node in &graph.nodes {
            let idx = digraph.add_node(node.id);
            index_map.insert(node.id, idx);
        }
        for conn in &kept {
            digraph.add_edge(
                index_map[&conn.output_node],
                index_map[&conn.input_node],
                conn.clone(),
            );
        }

        // Components of size one are acyclic nodes; only larger components
        // participate in loop handling.
        let mut component_of = HashMap::new();
        let mut cycles = Vec::new();
        for component in tarjan_scc(&digraph) {
            if component.len() > 1 {
                let ids: Vec<NodeId> = component.iter().map(|&idx| digraph[idx]).collect();
                for &id in &ids {
                    component_of.insert(id, cycles.len());
                }
                cycles.push(ids);
            }
        }

        let mut connections_by_node: HashMap<NodeId, Vec<Connection>> = HashMap::new();
        for conn in &kept {
            connections_by_node
                .entry(conn.output_node)
                .or_default()
                .push(conn.clone());
            connections_by_node
                .entry(conn.input_node)
                .or_default()
                .push(conn.clone());
        }

        Ok(Self {
            nodes_by_id,
            ports,
            connections_by_node,
            graph: digraph,
            index_map,
            component_of,
            cycles,
        })
    }

    /// Look up a node by id.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes_by_id.get(&id)
    }

    /// Iterate over every node.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes_by_id.values()
    }

    /// Iterate over every node id.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes_by_id.keys().copied()
    }

    /// Number of nodes in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of connections that survived port filtering.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// All kept connections touching the given node, on either side.
    #[must_use]
    pub fn connections(&self, id: NodeId) -> &[Connection] {
        self.connections_by_node
            .get(&id)
            .map_or(&[], Vec::as_slice)
    }

    /// Connections feeding the given node's input ports.
    pub fn input_connections(&self, id: NodeId) -> impl Iterator<Item = &Connection> {
        self.connections(id)
            .iter()
            .filter(move |c| c.input_node == id)
    }

    /// Connections leaving the given node's output ports.
    pub fn output_connections(&self, id: NodeId) -> impl Iterator<Item = &Connection> {
        self.connections(id)
            .iter()
            .filter(move |c| c.output_node == id)
    }

    /// The connection feeding one specific input port, if any.
    #[must_use]
    pub fn connection_to(&self, id: NodeId, input_port: &PortId) -> Option<&Connection> {
        self.input_connections(id)
            .find(|c| c.input_port == *input_port)
    }

    /// Unique ids of the nodes feeding this node's inputs.
    #[must_use]
    pub fn input_nodes(&self, id: NodeId) -> Vec<NodeId> {
        let mut seen = Vec::new();
        for conn in self.input_connections(id) {
            if !seen.contains(&conn.output_node) {
                seen.push(conn.output_node);
            }
        }
        seen
    }

    /// Unique ids of the nodes consuming this node's outputs.
    #[must_use]
    pub fn dependent_nodes(&self, id: NodeId) -> Vec<NodeId> {
        let mut seen = Vec::new();
        for conn in self.output_connections(id) {
            if !seen.contains(&conn.input_node) {
                seen.push(conn.input_node);
            }
        }
        seen
    }

    /// Computed input port definitions of a node.
    #[must_use]
    pub fn input_definitions(&self, id: NodeId) -> &[PortDefinition] {
        self.ports.get(&id).map_or(&[], |p| p.inputs.as_slice())
    }

    /// Computed output port definitions of a node.
    #[must_use]
    pub fn output_definitions(&self, id: NodeId) -> &[PortDefinition] {
        self.ports.get(&id).map_or(&[], |p| p.outputs.as_slice())
    }

    /// Is the node part of a multi-node cycle?
    #[must_use]
    pub fn in_cycle(&self, id: NodeId) -> bool {
        self.component_of.contains_key(&id)
    }

    /// Are both nodes members of the same cycle?
    #[must_use]
    pub fn same_cycle(&self, a: NodeId, b: NodeId) -> bool {
        match (self.component_of.get(&a), self.component_of.get(&b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    /// The multi-node strongly-connected components of the graph.
    #[must_use]
    pub fn cycles(&self) -> &[Vec<NodeId>] {
        &self.cycles
    }

    /// Nodes with no outgoing kept connections; a run seeds its scheduling
    /// from these unless given an explicit target set.
    #[must_use]
    pub fn terminal_nodes(&self) -> Vec<NodeId> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Outgoing)
                    .count()
                    == 0
            })
            .map(|idx| self.graph[idx])
            .collect()
    }

    /// Does the node with this id exist?
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.index_map.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::node::PortDefinition;

    /// Helper: a node whose ports are all typed `any`.
    fn node(id: NodeId) -> Node {
        Node::new(id, "test", "n")
    }

    fn ports(inputs: &[&str], outputs: &[&str]) -> NodePorts {
        NodePorts::new(
            inputs
                .iter()
                .map(|p| PortDefinition::new(*p, "any"))
                .collect(),
            outputs
                .iter()
                .map(|p| PortDefinition::new(*p, "any"))
                .collect(),
        )
    }

    /// Helper: every node gets one `in` input and one `out` output.
    fn uniform_ports(graph: &Graph) -> HashMap<NodeId, NodePorts> {
        graph
            .nodes
            .iter()
            .map(|n| (n.id, ports(&["in"], &["out"])))
            .collect()
    }

    // ---- linear graph: a -> b -> c ----

    fn linear() -> (Graph, NodeId, NodeId, NodeId) {
        let (a, b, c) = (NodeId::v4(), NodeId::v4(), NodeId::v4());
        let graph = Graph::new("linear")
            .with_node(node(a))
            .with_node(node(b))
            .with_node(node(c))
            .with_connection(Connection::new(a, "out", b, "in"))
            .with_connection(Connection::new(b, "out", c, "in"));
        (graph, a, b, c)
    }

    #[test]
    fn build_linear() {
        let (graph, a, b, c) = linear();
        let index = GraphIndex::build(&graph, uniform_ports(&graph)).unwrap();

        assert_eq!(index.node_count(), 3);
        assert_eq!(index.connection_count(), 2);
        assert_eq!(index.input_nodes(b), vec![a]);
        assert_eq!(index.dependent_nodes(b), vec![c]);
        assert_eq!(index.terminal_nodes(), vec![c]);
        assert!(!index.in_cycle(a));
    }

    #[test]
    fn build_rejects_duplicate_node_id() {
        let a = NodeId::v4();
        let graph = Graph::new("dup").with_node(node(a)).with_node(node(a));
        let err = GraphIndex::build(&graph, HashMap::new()).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateNodeId(_)));
    }

    #[test]
    fn build_rejects_unknown_node() {
        let a = NodeId::v4();
        let graph = Graph::new("unknown")
            .with_node(node(a))
            .with_connection(Connection::new(a, "out", NodeId::v4(), "in"));
        let err = GraphIndex::build(&graph, uniform_ports(&graph)).unwrap_err();
        assert!(matches!(err, GraphError::UnknownNode(_)));
    }

    #[test]
    fn build_rejects_self_loop() {
        let a = NodeId::v4();
        let graph = Graph::new("self")
            .with_node(node(a))
            .with_connection(Connection::new(a, "out", a, "in"));
        let err = GraphIndex::build(&graph, uniform_ports(&graph)).unwrap_err();
        assert!(matches!(err, GraphError::SelfLoop(_)));
    }

    #[test]
    fn build_drops_connection_to_undefined_port() {
        let (a, b) = (NodeId::v4(), NodeId::v4());
        let graph = Graph::new("stale")
            .with_node(node(a))
            .with_node(node(b))
            .with_connection(Connection::new(a, "out", b, "no_such_port"));
        let mut defs = HashMap::new();
        defs.insert(a, ports(&[], &["out"]));
        defs.insert(b, ports(&["in"], &[]));
        let index = GraphIndex::build(&graph, defs).unwrap();

        assert_eq!(index.connection_count(), 0);
        assert!(index.input_nodes(b).is_empty());
        // With the edge gone, both nodes are terminal.
        let mut terminals = index.terminal_nodes();
        terminals.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(terminals, expected);
    }

    #[test]
    fn cycle_classification_via_tarjan() {
        let (a, b, c) = (NodeId::v4(), NodeId::v4(), NodeId::v4());
        let graph = Graph::new("loop")
            .with_node(node(a))
            .with_node(node(b))
            .with_node(node(c))
            .with_connection(Connection::new(a, "out", b, "in"))
            .with_connection(Connection::new(b, "out", a, "in"))
            .with_connection(Connection::new(b, "out", c, "in"));
        let index = GraphIndex::build(&graph, uniform_ports(&graph)).unwrap();

        assert!(index.in_cycle(a));
        assert!(index.in_cycle(b));
        assert!(!index.in_cycle(c));
        assert!(index.same_cycle(a, b));
        assert!(!index.same_cycle(a, c));
        assert_eq!(index.cycles().len(), 1);
        assert_eq!(index.terminal_nodes(), vec![c]);
    }

    #[test]
    fn input_nodes_dedup_multiple_connections_from_one_source() {
        let (a, b) = (NodeId::v4(), NodeId::v4());
        let graph = Graph::new("fan")
            .with_node(node(a))
            .with_node(node(b))
            .with_connection(Connection::new(a, "out", b, "x"))
            .with_connection(Connection::new(a, "out", b, "y"));
        let mut defs = HashMap::new();
        defs.insert(a, ports(&[], &["out"]));
        defs.insert(b, ports(&["x", "y"], &[]));
        let index = GraphIndex::build(&graph, defs).unwrap();

        assert_eq!(index.input_nodes(b), vec![a]);
        assert_eq!(index.connection_count(), 2);
    }

    #[test]
    fn connection_to_finds_feeding_edge() {
        let (graph, a, b, _c) = linear();
        let index = GraphIndex::build(&graph, uniform_ports(&graph)).unwrap();

        let conn = index.connection_to(b, &"in".into()).unwrap();
        assert_eq!(conn.output_node, a);
        assert!(index.connection_to(b, &"other".into()).is_none());
    }

    #[test]
    fn diamond_input_nodes() {
        let (a, b, c, d) = (NodeId::v4(), NodeId::v4(), NodeId::v4(), NodeId::v4());
        let graph = Graph::new("diamond")
            .with_node(node(a))
            .with_node(node(b))
            .with_node(node(c))
            .with_node(node(d))
            .with_connection(Connection::new(a, "out", b, "in"))
            .with_connection(Connection::new(a, "out", c, "in"))
            .with_connection(Connection::new(b, "out", d, "x"))
            .with_connection(Connection::new(c, "out", d, "y"));
        let mut defs = uniform_ports(&graph);
        defs.insert(d, ports(&["x", "y"], &["out"]));
        let index = GraphIndex::build(&graph, defs).unwrap();

        let mut inputs = index.input_nodes(d);
        inputs.sort();
        let mut expected = vec![b, c];
        expected.sort();
        assert_eq!(inputs, expected);
        assert_eq!(index.terminal_nodes(), vec![d]);
    }
}
