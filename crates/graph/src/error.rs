//! Graph-construction error types.

use cascade_core::NodeId;
use thiserror::Error;

/// Errors that can occur while indexing a graph's topology.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Duplicate node id found.
    #[error("duplicate node id: {0}")]
    DuplicateNodeId(NodeId),

    /// Connection references a node that does not exist.
    #[error("connection references unknown node: {0}")]
    UnknownNode(NodeId),

    /// A connection has the same source and target node.
    #[error("self-loop detected on node: {0}")]
    SelfLoop(NodeId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_node() {
        let id = NodeId::parse("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(
            GraphError::UnknownNode(id).to_string(),
            "connection references unknown node: 550e8400-e29b-41d4-a716-446655440000"
        );
        assert_eq!(
            GraphError::SelfLoop(id).to_string(),
            "self-loop detected on node: 550e8400-e29b-41d4-a716-446655440000"
        );
        assert_eq!(
            GraphError::DuplicateNodeId(id).to_string(),
            "duplicate node id: 550e8400-e29b-41d4-a716-446655440000"
        );
    }
}
