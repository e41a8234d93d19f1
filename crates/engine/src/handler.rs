//! The contract between the processor and node implementations.

use std::collections::BTreeMap;

use async_trait::async_trait;
use cascade_core::PortId;
use cascade_graph::{Connection, DataValue, Node, PortDefinition, Project};

use crate::context::NodeContext;
use crate::error::NodeError;

/// Values flowing into one node invocation, keyed by input port.
pub type Inputs = BTreeMap<PortId, DataValue>;

/// Values produced by one node invocation, keyed by output port.
pub type Outputs = BTreeMap<PortId, DataValue>;

/// Executable behavior of one node type.
///
/// A handler is registered once per type tag and shared across all nodes of
/// that type, so implementations must be stateless with respect to a single
/// node: everything invocation-specific arrives through the arguments.
///
/// Port definitions may depend on the node's connections (numbered ports
/// grow one past the highest connected index) and on sibling graphs (a
/// subgraph node derives its ports from the target graph), which is why
/// both are passed in.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// Input ports this node exposes.
    fn input_definitions(
        &self,
        node: &Node,
        connections: &[Connection],
        project: &Project,
    ) -> Vec<PortDefinition>;

    /// Output ports this node exposes.
    fn output_definitions(
        &self,
        node: &Node,
        connections: &[Connection],
        project: &Project,
    ) -> Vec<PortDefinition>;

    /// Executes the node.
    ///
    /// Long-running handlers should watch [`NodeContext::cancellation`];
    /// the processor drops the future when the token fires, but handlers
    /// that spawn work of their own must propagate the signal themselves.
    async fn process(
        &self,
        node: &Node,
        inputs: &Inputs,
        context: &NodeContext,
    ) -> Result<Outputs, NodeError>;

    /// Whether this node suspends the run and waits for host-supplied
    /// answers instead of executing `process`.
    fn requires_user_input(&self, node: &Node) -> bool {
        let _ = node;
        false
    }

    /// Questions the host should pose while the node is suspended.
    ///
    /// Only consulted when [`NodeHandler::requires_user_input`] is true.
    fn user_input_questions(&self, node: &Node, inputs: &Inputs) -> Vec<String> {
        let _ = (node, inputs);
        Vec::new()
    }

    /// Converts host-supplied answers into the node's outputs.
    ///
    /// Only invoked when [`NodeHandler::requires_user_input`] is true.
    fn resolve_user_input(
        &self,
        node: &Node,
        inputs: &Inputs,
        answers: &[String],
    ) -> Result<Outputs, NodeError> {
        let _ = (node, inputs, answers);
        Err(NodeError::message("node does not accept user input"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::NodeId;
    use pretty_assertions::assert_eq;

    struct Passthrough;

    #[async_trait]
    impl NodeHandler for Passthrough {
        fn input_definitions(
            &self,
            _node: &Node,
            _connections: &[Connection],
            _project: &Project,
        ) -> Vec<PortDefinition> {
            vec![PortDefinition::new("input", "any")]
        }

        fn output_definitions(
            &self,
            _node: &Node,
            _connections: &[Connection],
            _project: &Project,
        ) -> Vec<PortDefinition> {
            vec![PortDefinition::new("output", "any")]
        }

        async fn process(
            &self,
            _node: &Node,
            inputs: &Inputs,
            _context: &NodeContext,
        ) -> Result<Outputs, NodeError> {
            let mut outputs = Outputs::new();
            if let Some(value) = inputs.get("input") {
                outputs.insert("output".into(), value.clone());
            }
            Ok(outputs)
        }
    }

    #[test]
    fn default_hooks_opt_out_of_user_input() {
        let handler = Passthrough;
        let node = Node::new(NodeId::v4(), "passthrough", "p");

        assert!(!handler.requires_user_input(&node));
        assert!(handler.user_input_questions(&node, &Inputs::new()).is_empty());

        let resolved = handler.resolve_user_input(&node, &Inputs::new(), &["hi".to_string()]);
        assert_eq!(
            resolved.unwrap_err().to_string(),
            "node does not accept user input"
        );
    }
}
