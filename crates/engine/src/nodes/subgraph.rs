//! Runs another graph of the project as a single node.

use std::time::Instant;

use async_trait::async_trait;
use cascade_core::GraphId;
use cascade_graph::{Connection, DataValue, Graph, Node, PortDefinition, Project};
use serde::Deserialize;

use super::{GRAPH_INPUT, GRAPH_OUTPUT, node_data};
use crate::context::NodeContext;
use crate::error::NodeError;
use crate::handler::{Inputs, NodeHandler, Outputs};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SubGraphConfig {
    graph_id: Option<GraphId>,
    use_error_output: bool,
    use_as_graph_partial_output: bool,
}

/// The ids a graph exposes through its boundary nodes of `node_type`,
/// with their declared wire types, sorted and deduplicated.
fn boundary_ids(graph: &Graph, node_type: &str) -> Vec<(String, String)> {
    let mut ids: Vec<(String, String)> = graph
        .nodes_of_type(node_type)
        .filter_map(|node| {
            let id = node.data.get("id")?.as_str()?.to_string();
            let data_type = node
                .data
                .get("data_type")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("any")
                .to_string();
            Some((id, data_type))
        })
        .collect();
    ids.sort();
    ids.dedup_by(|a, b| a.0 == b.0);
    ids
}

fn target_graph<'a>(project: &'a Project, node: &Node) -> Option<&'a Graph> {
    let config: SubGraphConfig = node_data(node).ok()?;
    project.graph(config.graph_id?)
}

/// Invokes another graph of the project.
///
/// Input ports mirror the target's input nodes and output ports mirror
/// its output nodes, so wiring a subgraph feels like wiring any other
/// node. The child runs on a processor that shares this run's globals,
/// cache, events, and pause state, and is cancelled with this node.
///
/// With `use_error_output` a failing child surfaces its message on the
/// `error` port instead of failing this node, letting graphs handle
/// subgraph failures in-band.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubGraphNode;

#[async_trait]
impl NodeHandler for SubGraphNode {
    fn input_definitions(
        &self,
        node: &Node,
        _connections: &[Connection],
        project: &Project,
    ) -> Vec<PortDefinition> {
        let Some(graph) = target_graph(project, node) else {
            return Vec::new();
        };
        boundary_ids(graph, GRAPH_INPUT)
            .into_iter()
            .map(|(id, data_type)| PortDefinition::new(id, data_type))
            .collect()
    }

    fn output_definitions(
        &self,
        node: &Node,
        _connections: &[Connection],
        project: &Project,
    ) -> Vec<PortDefinition> {
        let config: SubGraphConfig = node_data(node).unwrap_or_default();
        let mut defs: Vec<PortDefinition> = target_graph(project, node)
            .map(|graph| {
                boundary_ids(graph, GRAPH_OUTPUT)
                    .into_iter()
                    .map(|(id, data_type)| PortDefinition::new(id, data_type))
                    .collect()
            })
            .unwrap_or_default();
        if config.use_error_output {
            defs.push(PortDefinition::new("error", "string"));
        }
        defs.push(PortDefinition::new("duration", "number"));
        defs
    }

    async fn process(
        &self,
        node: &Node,
        inputs: &Inputs,
        context: &NodeContext,
    ) -> Result<Outputs, NodeError> {
        let config: SubGraphConfig = node_data(node)?;
        let graph_id = config
            .graph_id
            .ok_or_else(|| NodeError::message("subgraph node has no target graph"))?;

        let child =
            context.create_subprocessor(graph_id, config.use_as_graph_partial_output)?;
        let started = Instant::now();
        let result = child
            .run(inputs.clone(), context.context_values().clone())
            .await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(mut outputs) => {
                if config.use_error_output {
                    outputs.insert("error".into(), DataValue::excluded());
                }
                outputs
                    .entry("duration".into())
                    .or_insert(DataValue::Number(duration_ms));
                Ok(outputs)
            }
            Err(error) => {
                if !config.use_error_output {
                    return Err(NodeError::message(error.to_string()));
                }
                let mut outputs = Outputs::new();
                if let Some(graph) = context.project().graph(graph_id) {
                    for (id, _) in boundary_ids(graph, GRAPH_OUTPUT) {
                        outputs.insert(id.into(), DataValue::excluded());
                    }
                }
                outputs.insert("error".into(), DataValue::from(error.to_string()));
                Ok(outputs)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use cascade_core::NodeId;
    use pretty_assertions::assert_eq;

    use super::*;

    fn project_with_target() -> (Project, GraphId) {
        let graph = Graph::new("inner")
            .with_node(
                Node::new(NodeId::v4(), GRAPH_INPUT, "In")
                    .with_data(serde_json::json!({ "id": "query", "data_type": "string" })),
            )
            .with_node(
                Node::new(NodeId::v4(), GRAPH_OUTPUT, "Out")
                    .with_data(serde_json::json!({ "id": "answer" })),
            );
        let graph_id = graph.id;
        (Project::new().with_graph(graph), graph_id)
    }

    #[test]
    fn ports_mirror_the_target_graph() {
        let (project, graph_id) = project_with_target();
        let node = Node::new(NodeId::v4(), "subGraph", "Call")
            .with_data(serde_json::json!({ "graph_id": graph_id }));

        let handler = SubGraphNode;
        let inputs = handler.input_definitions(&node, &[], &project);
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].id.as_str(), "query");
        assert_eq!(inputs[0].data_type, "string");

        let outputs = handler.output_definitions(&node, &[], &project);
        let ids: Vec<&str> = outputs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["answer", "duration"]);
    }

    #[test]
    fn error_port_is_optional() {
        let (project, graph_id) = project_with_target();
        let node = Node::new(NodeId::v4(), "subGraph", "Call").with_data(serde_json::json!({
            "graph_id": graph_id,
            "use_error_output": true,
        }));

        let outputs = SubGraphNode.output_definitions(&node, &[], &project);
        let ids: Vec<&str> = outputs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["answer", "error", "duration"]);
    }

    #[test]
    fn duplicate_boundary_ids_collapse() {
        let graph = Graph::new("inner")
            .with_node(
                Node::new(NodeId::v4(), GRAPH_OUTPUT, "A")
                    .with_data(serde_json::json!({ "id": "value" })),
            )
            .with_node(
                Node::new(NodeId::v4(), GRAPH_OUTPUT, "B")
                    .with_data(serde_json::json!({ "id": "value" })),
            );
        assert_eq!(boundary_ids(&graph, GRAPH_OUTPUT).len(), 1);
    }

    #[test]
    fn unknown_target_means_no_ports() {
        let node = Node::new(NodeId::v4(), "subGraph", "Call")
            .with_data(serde_json::json!({ "graph_id": GraphId::v4() }));
        let project = Project::new();
        assert!(SubGraphNode.input_definitions(&node, &[], &project).is_empty());
    }
}
