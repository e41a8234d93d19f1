//! Built-in node handlers.
//!
//! These cover the control-flow and I/O vocabulary every graph needs:
//! conditionals, loops, races, graph inputs and outputs, subgraph calls,
//! global variables, user input, and named events. Domain-specific nodes
//! are expected to come from the host through
//! [`HandlerRegistry::register`](crate::HandlerRegistry::register).

use std::sync::Arc;

use cascade_core::NodeId;
use cascade_graph::Connection;
use serde::de::DeserializeOwned;

use crate::error::NodeError;
use crate::registry::HandlerRegistry;

mod control;
mod events;
mod globals;
mod io;
mod loop_controller;
mod subgraph;

pub use control::{CoalesceNode, IfElseNode, IfNode, RaceInputsNode};
pub use events::{RaiseEventNode, WaitForEventNode};
pub use globals::{GetGlobalNode, SetGlobalNode};
pub use io::{GraphInputNode, GraphOutputNode, UserInputNode};
pub use loop_controller::{DEFAULT_MAX_ITERATIONS, LoopControllerNode};
pub use subgraph::SubGraphNode;

pub(crate) use loop_controller::configured_max_iterations;

/// Type tag of [`IfNode`].
pub const IF: &str = "if";
/// Type tag of [`IfElseNode`].
pub const IF_ELSE: &str = "ifElse";
/// Type tag of [`CoalesceNode`].
pub const COALESCE: &str = "coalesce";
/// Type tag of [`RaceInputsNode`].
pub const RACE_INPUTS: &str = "raceInputs";
/// Type tag of [`LoopControllerNode`].
pub const LOOP_CONTROLLER: &str = "loopController";
/// Type tag of [`GraphInputNode`].
pub const GRAPH_INPUT: &str = "graphInput";
/// Type tag of [`GraphOutputNode`].
pub const GRAPH_OUTPUT: &str = "graphOutput";
/// Type tag of [`SubGraphNode`].
pub const SUB_GRAPH: &str = "subGraph";
/// Type tag of [`UserInputNode`].
pub const USER_INPUT: &str = "userInput";
/// Type tag of [`WaitForEventNode`].
pub const WAIT_FOR_EVENT: &str = "waitForEvent";
/// Type tag of [`RaiseEventNode`].
pub const RAISE_EVENT: &str = "raiseEvent";
/// Type tag of [`GetGlobalNode`].
pub const GET_GLOBAL: &str = "getGlobal";
/// Type tag of [`SetGlobalNode`].
pub const SET_GLOBAL: &str = "setGlobal";

pub(crate) fn register_builtins(registry: &mut HandlerRegistry) {
    registry.register(IF, Arc::new(IfNode));
    registry.register(IF_ELSE, Arc::new(IfElseNode));
    registry.register(COALESCE, Arc::new(CoalesceNode));
    registry.register(RACE_INPUTS, Arc::new(RaceInputsNode));
    registry.register(LOOP_CONTROLLER, Arc::new(LoopControllerNode));
    registry.register(GRAPH_INPUT, Arc::new(GraphInputNode));
    registry.register(GRAPH_OUTPUT, Arc::new(GraphOutputNode));
    registry.register(SUB_GRAPH, Arc::new(SubGraphNode));
    registry.register(USER_INPUT, Arc::new(UserInputNode));
    registry.register(WAIT_FOR_EVENT, Arc::new(WaitForEventNode));
    registry.register(RAISE_EVENT, Arc::new(RaiseEventNode));
    registry.register(GET_GLOBAL, Arc::new(GetGlobalNode));
    registry.register(SET_GLOBAL, Arc::new(SetGlobalNode));
}

fn default_data_type() -> String {
    "any".to_string()
}

/// Deserializes a node's `data` blob into its config struct; `Null` means
/// all defaults.
pub(crate) fn node_data<T>(node: &cascade_graph::Node) -> Result<T, NodeError>
where
    T: DeserializeOwned + Default,
{
    if node.data.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(node.data.clone()).map_err(NodeError::from)
}

/// Highest `N` wired to a `{prefix}{N}` or `{prefix}{N}Default` input of
/// the node, `0` when none are connected. Variadic nodes expose one port
/// past this so there is always a free slot to wire.
pub(crate) fn max_numbered_port(connections: &[Connection], node_id: NodeId, prefix: &str) -> usize {
    connections
        .iter()
        .filter(|connection| connection.input_node == node_id)
        .filter_map(|connection| {
            let rest = connection.input_port.as_str().strip_prefix(prefix)?;
            let digits = rest.strip_suffix("Default").unwrap_or(rest);
            digits.parse::<usize>().ok()
        })
        .max()
        .unwrap_or(0)
}
