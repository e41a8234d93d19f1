//! Named events: raising them and suspending on them.
//!
//! Events resolve at the root of the processor tree, so a node in one
//! subgraph can wake a waiter in another.

use async_trait::async_trait;
use cascade_graph::{Connection, DataValue, Node, PortDefinition, Project};
use serde::Deserialize;

use super::node_data;
use crate::context::NodeContext;
use crate::error::NodeError;
use crate::handler::{Inputs, NodeHandler, Outputs};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EventConfig {
    event_name: String,
    use_event_name_input: bool,
}

fn resolve_event_name(config: &EventConfig, inputs: &Inputs) -> String {
    if config.use_event_name_input {
        if let Some(value) = inputs.get("eventName") {
            return value.coerce_string();
        }
    }
    config.event_name.clone()
}

/// Parks the run until a matching named event is raised.
///
/// Whatever arrives on `inputData` passes through on `outputData`, so the
/// node can gate a value on an external signal; the event's payload, if
/// any, comes out on `eventData`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitForEventNode;

#[async_trait]
impl NodeHandler for WaitForEventNode {
    fn input_definitions(
        &self,
        node: &Node,
        _connections: &[Connection],
        _project: &Project,
    ) -> Vec<PortDefinition> {
        let config: EventConfig = node_data(node).unwrap_or_default();
        let mut defs = Vec::new();
        if config.use_event_name_input {
            defs.push(PortDefinition::new("eventName", "string"));
        }
        defs.push(PortDefinition::new("inputData", "any"));
        defs
    }

    fn output_definitions(
        &self,
        _node: &Node,
        _connections: &[Connection],
        _project: &Project,
    ) -> Vec<PortDefinition> {
        vec![
            PortDefinition::new("outputData", "any"),
            PortDefinition::new("eventData", "any"),
        ]
    }

    async fn process(
        &self,
        node: &Node,
        inputs: &Inputs,
        context: &NodeContext,
    ) -> Result<Outputs, NodeError> {
        let config: EventConfig = node_data(node)?;
        let name = resolve_event_name(&config, inputs);
        let payload = context.wait_for_event(&name).await?;

        let mut outputs = Outputs::new();
        if let Some(data) = inputs.get("inputData") {
            outputs.insert("outputData".into(), data.clone());
        }
        if let Some(data) = payload {
            outputs.insert("eventData".into(), data);
        }
        Ok(outputs)
    }
}

/// Raises a named event, waking any matching waiter in the run.
///
/// The event also surfaces to host subscribers on the root processor's
/// stream, so it doubles as a signal out of the graph.
#[derive(Debug, Clone, Copy, Default)]
pub struct RaiseEventNode;

#[async_trait]
impl NodeHandler for RaiseEventNode {
    fn input_definitions(
        &self,
        node: &Node,
        _connections: &[Connection],
        _project: &Project,
    ) -> Vec<PortDefinition> {
        let config: EventConfig = node_data(node).unwrap_or_default();
        let mut defs = Vec::new();
        if config.use_event_name_input {
            defs.push(PortDefinition::new("eventName", "string"));
        }
        defs.push(PortDefinition::new("data", "any"));
        defs
    }

    fn output_definitions(
        &self,
        _node: &Node,
        _connections: &[Connection],
        _project: &Project,
    ) -> Vec<PortDefinition> {
        vec![PortDefinition::new("result", "any")]
    }

    async fn process(
        &self,
        node: &Node,
        inputs: &Inputs,
        context: &NodeContext,
    ) -> Result<Outputs, NodeError> {
        let config: EventConfig = node_data(node)?;
        let name = resolve_event_name(&config, inputs);
        let data = inputs.get("data").cloned();
        context.raise_event(&name, data.clone());

        let mut outputs = Outputs::new();
        outputs.insert(
            "result".into(),
            data.unwrap_or(DataValue::Any(serde_json::Value::Null)),
        );
        Ok(outputs)
    }
}
