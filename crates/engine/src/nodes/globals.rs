//! Global variables: run-spanning named values shared with subgraphs.

use async_trait::async_trait;
use cascade_graph::{Connection, DataValue, Node, PortDefinition, Project};
use serde::Deserialize;

use super::{default_data_type, node_data};
use crate::context::NodeContext;
use crate::error::NodeError;
use crate::handler::{Inputs, NodeHandler, Outputs};

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GlobalConfig {
    id: String,
    data_type: String,
    use_id_input: bool,
    wait: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            data_type: default_data_type(),
            use_id_input: false,
            wait: false,
        }
    }
}

fn resolve_variable_id(config: &GlobalConfig, inputs: &Inputs) -> Result<String, NodeError> {
    let id = if config.use_id_input {
        inputs
            .get("id")
            .map_or_else(|| config.id.clone(), DataValue::coerce_string)
    } else {
        config.id.clone()
    };
    if id.is_empty() {
        return Err(NodeError::MissingVariableId);
    }
    Ok(id)
}

fn id_input_definitions(config: &GlobalConfig) -> Vec<PortDefinition> {
    if config.use_id_input {
        vec![PortDefinition::new("id", "string")]
    } else {
        Vec::new()
    }
}

/// Writes a global variable.
///
/// Announces the write on the event stream so hosts can watch it, and
/// reports the previous value (or the type's zero value) alongside the
/// saved one.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetGlobalNode;

#[async_trait]
impl NodeHandler for SetGlobalNode {
    fn input_definitions(
        &self,
        node: &Node,
        _connections: &[Connection],
        _project: &Project,
    ) -> Vec<PortDefinition> {
        let config: GlobalConfig = node_data(node).unwrap_or_default();
        let mut defs = vec![PortDefinition::new("value", "any")];
        defs.extend(id_input_definitions(&config));
        defs
    }

    fn output_definitions(
        &self,
        _node: &Node,
        _connections: &[Connection],
        _project: &Project,
    ) -> Vec<PortDefinition> {
        vec![
            PortDefinition::new("saved-value", "any"),
            PortDefinition::new("previous-value", "any"),
            PortDefinition::new("variable-id", "string"),
        ]
    }

    async fn process(
        &self,
        node: &Node,
        inputs: &Inputs,
        context: &NodeContext,
    ) -> Result<Outputs, NodeError> {
        let config: GlobalConfig = node_data(node)?;
        let id = resolve_variable_id(&config, inputs)?;
        let value = inputs
            .get("value")
            .cloned()
            .unwrap_or(DataValue::Object(serde_json::json!({})));
        let previous = context
            .get_global(&id)
            .unwrap_or_else(|| DataValue::default_for_type(&config.data_type));

        context.set_global(id.clone(), value.clone());

        let mut outputs = Outputs::new();
        outputs.insert("saved-value".into(), value);
        outputs.insert("previous-value".into(), previous);
        outputs.insert("variable-id".into(), DataValue::String(id));
        Ok(outputs)
    }
}

/// Reads a global variable.
///
/// An unset variable reads as the zero value of the configured type, or,
/// with `wait`, suspends this branch until some other node writes it.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetGlobalNode;

#[async_trait]
impl NodeHandler for GetGlobalNode {
    fn input_definitions(
        &self,
        node: &Node,
        _connections: &[Connection],
        _project: &Project,
    ) -> Vec<PortDefinition> {
        let config: GlobalConfig = node_data(node).unwrap_or_default();
        id_input_definitions(&config)
    }

    fn output_definitions(
        &self,
        node: &Node,
        _connections: &[Connection],
        _project: &Project,
    ) -> Vec<PortDefinition> {
        let config: GlobalConfig = node_data(node).unwrap_or_default();
        vec![PortDefinition::new("value", config.data_type)]
    }

    async fn process(
        &self,
        node: &Node,
        inputs: &Inputs,
        context: &NodeContext,
    ) -> Result<Outputs, NodeError> {
        let config: GlobalConfig = node_data(node)?;
        let id = resolve_variable_id(&config, inputs)?;

        let value = if config.wait {
            context.wait_for_global(&id).await?
        } else {
            context
                .get_global(&id)
                .unwrap_or_else(|| DataValue::default_for_type(&config.data_type))
        };

        let mut outputs = Outputs::new();
        outputs.insert("value".into(), value);
        Ok(outputs)
    }
}
