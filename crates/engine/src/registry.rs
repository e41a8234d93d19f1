//! Mapping from node type tags to their handlers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::handler::NodeHandler;

/// Registry of node handlers, consulted once per node when a processor is
/// built and again at dispatch time.
///
/// The registry is assembled before any run starts and shared immutably
/// (behind an `Arc`) between the processor and its subprocessors.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Creates a registry pre-populated with every built-in node type.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::nodes::register_builtins(&mut registry);
        registry
    }

    /// Registers a handler under a type tag, replacing any previous one.
    pub fn register(&mut self, node_type: impl Into<String>, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(node_type.into(), handler);
    }

    /// Fluent form of [`HandlerRegistry::register`].
    #[must_use]
    pub fn with_handler(
        mut self,
        node_type: impl Into<String>,
        handler: Arc<dyn NodeHandler>,
    ) -> Self {
        self.register(node_type, handler);
        self
    }

    /// Looks up the handler for a type tag.
    #[must_use]
    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(node_type).cloned()
    }

    /// Whether a handler is registered for the tag.
    #[must_use]
    pub fn contains(&self, node_type: &str) -> bool {
        self.handlers.contains_key(node_type)
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered type tags, in arbitrary order.
    pub fn node_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.node_types().collect();
        types.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("node_types", &types)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cascade_graph::{Connection, Node, PortDefinition, Project};
    use pretty_assertions::assert_eq;

    use crate::context::NodeContext;
    use crate::error::NodeError;
    use crate::handler::{Inputs, Outputs};

    struct Noop;

    #[async_trait]
    impl NodeHandler for Noop {
        fn input_definitions(
            &self,
            _node: &Node,
            _connections: &[Connection],
            _project: &Project,
        ) -> Vec<PortDefinition> {
            Vec::new()
        }

        fn output_definitions(
            &self,
            _node: &Node,
            _connections: &[Connection],
            _project: &Project,
        ) -> Vec<PortDefinition> {
            Vec::new()
        }

        async fn process(
            &self,
            _node: &Node,
            _inputs: &Inputs,
            _context: &NodeContext,
        ) -> Result<Outputs, NodeError> {
            Ok(Outputs::new())
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.is_empty());

        registry.register("noop", Arc::new(Noop));
        assert!(registry.contains("noop"));
        assert!(registry.get("noop").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let registry = HandlerRegistry::new()
            .with_handler("noop", Arc::new(Noop))
            .with_handler("noop", Arc::new(Noop));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn builtins_cover_the_control_flow_node_types() {
        let registry = HandlerRegistry::with_builtins();
        for node_type in [
            "if",
            "ifElse",
            "coalesce",
            "raceInputs",
            "loopController",
            "graphInput",
            "graphOutput",
            "subGraph",
            "userInput",
            "waitForEvent",
            "raiseEvent",
            "getGlobal",
            "setGlobal",
        ] {
            assert!(registry.contains(node_type), "missing builtin: {node_type}");
        }
    }
}
