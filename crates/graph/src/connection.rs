//! Edge (connection) types linking node ports.

use cascade_core::{NodeId, PortId};
use serde::{Deserialize, Serialize};

/// A directed edge from one node's output port to another node's input port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Source node.
    pub output_node: NodeId,
    /// Source output port.
    pub output_port: PortId,
    /// Target node.
    pub input_node: NodeId,
    /// Target input port.
    pub input_port: PortId,
}

impl Connection {
    /// Create a connection between two ports.
    #[must_use]
    pub fn new(
        output_node: NodeId,
        output_port: impl Into<PortId>,
        input_node: NodeId,
        input_port: impl Into<PortId>,
    ) -> Self {
        Self {
            output_node,
            output_port: output_port.into(),
            input_node,
            input_port: input_port.into(),
        }
    }

    /// Returns `true` if this connection forms a self-loop.
    #[must_use]
    pub fn is_self_loop(&self) -> bool {
        self.output_node == self.input_node
    }

    /// Does this connection touch the given node on either side?
    #[must_use]
    pub fn involves(&self, node: NodeId) -> bool {
        self.output_node == node || self.input_node == node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_new() {
        let a = NodeId::v4();
        let b = NodeId::v4();
        let conn = Connection::new(a, "out", b, "in");
        assert_eq!(conn.output_node, a);
        assert_eq!(conn.output_port, "out");
        assert_eq!(conn.input_node, b);
        assert_eq!(conn.input_port, "in");
    }

    #[test]
    fn connection_is_self_loop() {
        let a = NodeId::v4();
        let b = NodeId::v4();
        assert!(Connection::new(a, "out", a, "in").is_self_loop());
        assert!(!Connection::new(a, "out", b, "in").is_self_loop());
    }

    #[test]
    fn connection_involves_either_side() {
        let a = NodeId::v4();
        let b = NodeId::v4();
        let other = NodeId::v4();
        let conn = Connection::new(a, "out", b, "in");
        assert!(conn.involves(a));
        assert!(conn.involves(b));
        assert!(!conn.involves(other));
    }

    #[test]
    fn connection_serde_roundtrip() {
        let conn = Connection::new(NodeId::v4(), "output", NodeId::v4(), "value");
        let json = serde_json::to_string(&conn).unwrap();
        let back: Connection = serde_json::from_str(&json).unwrap();
        assert_eq!(back, conn);
    }
}
