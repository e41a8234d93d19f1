//! Graph boundary nodes: inputs, outputs, and user input.

use async_trait::async_trait;
use cascade_graph::{Connection, DataValue, Node, PortDefinition, Project};
use serde::Deserialize;

use super::{default_data_type, node_data};
use crate::context::NodeContext;
use crate::error::NodeError;
use crate::handler::{Inputs, NodeHandler, Outputs};

#[derive(Debug, Deserialize)]
#[serde(default)]
struct GraphInputConfig {
    id: String,
    data_type: String,
    default_value: Option<serde_json::Value>,
    use_default_value_input: bool,
}

impl Default for GraphInputConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            data_type: default_data_type(),
            default_value: None,
            use_default_value_input: false,
        }
    }
}

/// Surfaces one of the values the run was called with.
///
/// Resolution order: the caller-supplied value under this node's `id`,
/// then the optional `default` input port, then the configured default,
/// then the zero value of the declared type.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphInputNode;

#[async_trait]
impl NodeHandler for GraphInputNode {
    fn input_definitions(
        &self,
        node: &Node,
        _connections: &[Connection],
        _project: &Project,
    ) -> Vec<PortDefinition> {
        let config: GraphInputConfig = node_data(node).unwrap_or_default();
        if config.use_default_value_input {
            vec![PortDefinition::new("default", config.data_type)]
        } else {
            Vec::new()
        }
    }

    fn output_definitions(
        &self,
        node: &Node,
        _connections: &[Connection],
        _project: &Project,
    ) -> Vec<PortDefinition> {
        let config: GraphInputConfig = node_data(node).unwrap_or_default();
        vec![PortDefinition::new("data", config.data_type)]
    }

    async fn process(
        &self,
        node: &Node,
        inputs: &Inputs,
        context: &NodeContext,
    ) -> Result<Outputs, NodeError> {
        let config: GraphInputConfig = node_data(node)?;
        let value = context
            .graph_inputs()
            .get(config.id.as_str())
            .cloned()
            .or_else(|| inputs.get("default").cloned())
            .or_else(|| {
                config
                    .default_value
                    .clone()
                    .map(|json| DataValue::from_typed_json(&config.data_type, json))
            })
            .unwrap_or_else(|| DataValue::default_for_type(&config.data_type));

        let mut outputs = Outputs::new();
        outputs.insert("data".into(), value);
        Ok(outputs)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GraphOutputConfig {
    id: String,
}

/// Records a value as one of the run's outputs.
///
/// The first live value written under an id wins; an excluded write only
/// holds the slot until a live one arrives, and an absent input writes
/// nothing at all. The recorded slot passes through on `valueOutput` so
/// recording can sit mid-chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphOutputNode;

#[async_trait]
impl NodeHandler for GraphOutputNode {
    fn input_definitions(
        &self,
        _node: &Node,
        _connections: &[Connection],
        _project: &Project,
    ) -> Vec<PortDefinition> {
        vec![PortDefinition::new("value", "any")]
    }

    fn output_definitions(
        &self,
        _node: &Node,
        _connections: &[Connection],
        _project: &Project,
    ) -> Vec<PortDefinition> {
        vec![PortDefinition::new("valueOutput", "any")]
    }

    async fn process(
        &self,
        node: &Node,
        inputs: &Inputs,
        context: &NodeContext,
    ) -> Result<Outputs, NodeError> {
        let config: GraphOutputConfig = node_data(node)?;
        let value = inputs.get("value");
        let excluded = value.is_some_and(DataValue::is_excluded);

        // An absent input writes nothing, so an upstream node that was
        // skipped entirely leaves the slot untouched.
        let slot_is_live = context
            .graph_output(&config.id)
            .is_some_and(|existing| !existing.is_excluded());
        if let Some(value) = value
            && !slot_is_live
        {
            context.set_graph_output(config.id.clone(), value.clone());
        }

        let mut outputs = Outputs::new();
        if excluded {
            outputs.insert("valueOutput".into(), DataValue::excluded());
        } else if let Some(current) = context.graph_output(&config.id) {
            outputs.insert("valueOutput".into(), current);
        }
        Ok(outputs)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct UserInputConfig {
    prompt: String,
    use_input: bool,
}

impl Default for UserInputConfig {
    fn default() -> Self {
        Self {
            prompt: "Please enter your input:".to_string(),
            use_input: false,
        }
    }
}

fn questions_for(node: &Node, inputs: &Inputs) -> Vec<String> {
    let config: UserInputConfig = node_data(node).unwrap_or_default();
    if config.use_input {
        inputs
            .get("questions")
            .map(DataValue::coerce_string_array)
            .unwrap_or_default()
    } else {
        vec![config.prompt]
    }
}

/// Suspends the run until the host supplies answers.
///
/// The processor parks this node on a channel and emits the questions on
/// the event stream; [`GraphProcessor::answer_user_input`] resumes it.
///
/// [`GraphProcessor::answer_user_input`]: crate::GraphProcessor::answer_user_input
#[derive(Debug, Clone, Copy, Default)]
pub struct UserInputNode;

#[async_trait]
impl NodeHandler for UserInputNode {
    fn input_definitions(
        &self,
        node: &Node,
        _connections: &[Connection],
        _project: &Project,
    ) -> Vec<PortDefinition> {
        let config: UserInputConfig = node_data(node).unwrap_or_default();
        if config.use_input {
            vec![PortDefinition::new("questions", "string[]")]
        } else {
            Vec::new()
        }
    }

    fn output_definitions(
        &self,
        _node: &Node,
        _connections: &[Connection],
        _project: &Project,
    ) -> Vec<PortDefinition> {
        vec![
            PortDefinition::new("output", "string[]"),
            PortDefinition::new("questionsAndAnswers", "string[]"),
        ]
    }

    async fn process(
        &self,
        _node: &Node,
        _inputs: &Inputs,
        _context: &NodeContext,
    ) -> Result<Outputs, NodeError> {
        Err(NodeError::message(
            "user input node resolves through answers, not process",
        ))
    }

    fn requires_user_input(&self, _node: &Node) -> bool {
        true
    }

    fn user_input_questions(&self, node: &Node, inputs: &Inputs) -> Vec<String> {
        questions_for(node, inputs)
    }

    fn resolve_user_input(
        &self,
        node: &Node,
        inputs: &Inputs,
        answers: &[String],
    ) -> Result<Outputs, NodeError> {
        let questions = questions_for(node, inputs);
        let paired: Vec<String> = questions
            .iter()
            .zip(answers.iter())
            .map(|(question, answer)| format!("{question}\n{answer}"))
            .collect();

        let mut outputs = Outputs::new();
        outputs.insert("output".into(), DataValue::StringArray(answers.to_vec()));
        outputs.insert(
            "questionsAndAnswers".into(),
            DataValue::StringArray(paired),
        );
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use cascade_core::{NodeId, PortId};
    use pretty_assertions::assert_eq;

    use super::*;

    // ---- graph input config ----

    #[test]
    fn graph_input_ports_follow_configuration() {
        let node = Node::new(NodeId::v4(), "graphInput", "Input").with_data(serde_json::json!({
            "id": "query",
            "data_type": "string",
            "use_default_value_input": true,
        }));
        let handler = GraphInputNode;
        let project = Project::new();

        let inputs = handler.input_definitions(&node, &[], &project);
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].id.as_str(), "default");
        assert_eq!(inputs[0].data_type, "string");

        let outputs = handler.output_definitions(&node, &[], &project);
        assert_eq!(outputs[0].id.as_str(), "data");
        assert_eq!(outputs[0].data_type, "string");
    }

    #[test]
    fn graph_input_without_default_port() {
        let node = Node::new(NodeId::v4(), "graphInput", "Input")
            .with_data(serde_json::json!({ "id": "query" }));
        let handler = GraphInputNode;
        assert!(
            handler
                .input_definitions(&node, &[], &Project::new())
                .is_empty()
        );
    }

    // ---- user input questions ----

    #[test]
    fn prompt_is_the_default_question() {
        let node = Node::new(NodeId::v4(), "userInput", "Ask")
            .with_data(serde_json::json!({ "prompt": "Name?" }));
        assert_eq!(questions_for(&node, &Inputs::new()), vec!["Name?"]);
    }

    #[test]
    fn wired_questions_override_the_prompt() {
        let node = Node::new(NodeId::v4(), "userInput", "Ask")
            .with_data(serde_json::json!({ "prompt": "unused", "use_input": true }));
        let mut inputs = Inputs::new();
        inputs.insert(
            PortId::new("questions"),
            DataValue::StringArray(vec!["A?".to_string(), "B?".to_string()]),
        );
        assert_eq!(questions_for(&node, &inputs), vec!["A?", "B?"]);
    }

    #[test]
    fn resolve_pairs_questions_with_answers() {
        let node = Node::new(NodeId::v4(), "userInput", "Ask")
            .with_data(serde_json::json!({ "prompt": "Name?" }));
        let outputs = UserInputNode
            .resolve_user_input(&node, &Inputs::new(), &["Ada".to_string()])
            .unwrap();

        assert_eq!(
            outputs.get("output"),
            Some(&DataValue::StringArray(vec!["Ada".to_string()]))
        );
        assert_eq!(
            outputs.get("questionsAndAnswers"),
            Some(&DataValue::StringArray(vec!["Name?\nAda".to_string()]))
        );
    }
}
