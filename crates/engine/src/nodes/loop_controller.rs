//! The loop controller node.
//!
//! A cycle through this node is the only legal cycle in a graph. While the
//! loop continues, the `break` output carries a loop-not-broken exclusion,
//! which makes downstream consumers wait and tells the processor to re-arm
//! the loop body; on the final pass `break` carries the resolved values
//! instead.

use std::collections::BTreeSet;

use async_trait::async_trait;
use cascade_graph::{Connection, DataValue, Node, PortDefinition, Project};
use serde::Deserialize;

use super::{max_numbered_port, node_data};
use crate::context::NodeContext;
use crate::error::NodeError;
use crate::handler::{Inputs, NodeHandler, Outputs};

/// Iteration cap applied when a node does not configure one.
pub const DEFAULT_MAX_ITERATIONS: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum AtMaxIterations {
    /// Reaching the cap fails the node.
    #[default]
    Error,
    /// Reaching the cap breaks the loop with the current values.
    Break,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LoopControllerConfig {
    max_iterations: Option<usize>,
    at_max_iterations_action: AtMaxIterations,
}

/// Iteration cap configured on a loop controller node.
pub(crate) fn configured_max_iterations(node: &Node) -> usize {
    node_data::<LoopControllerConfig>(node)
        .ok()
        .and_then(|config| config.max_iterations)
        .unwrap_or(DEFAULT_MAX_ITERATIONS)
}

/// Indices wired through `input{N}` or `input{N}Default` ports, in numeric
/// order.
fn wired_indices(inputs: &Inputs) -> BTreeSet<usize> {
    inputs
        .keys()
        .filter_map(|port| {
            let rest = port.as_str().strip_prefix("input")?;
            let digits = rest.strip_suffix("Default").unwrap_or(rest);
            digits.parse().ok()
        })
        .collect()
}

/// The value an index resolves to on this pass: the fed-back value when
/// the body has run, otherwise the seed from outside the loop.
fn resolve_index(inputs: &Inputs, index: usize) -> Option<&DataValue> {
    inputs
        .get(format!("input{index}").as_str())
        .or_else(|| inputs.get(format!("input{index}Default").as_str()))
}

fn run_pass(
    config: &LoopControllerConfig,
    inputs: &Inputs,
    iteration_count: usize,
) -> Result<Outputs, NodeError> {
    let mut outputs = Outputs::new();
    let indices = wired_indices(inputs);

    // An excluded seed means the loop as a whole was gated off.
    let any_default_excluded = indices.iter().any(|index| {
        inputs
            .get(format!("input{index}Default").as_str())
            .is_some_and(DataValue::is_excluded)
    });
    if any_default_excluded {
        outputs.insert("break".into(), DataValue::excluded());
        outputs.insert("iteration".into(), DataValue::excluded());
        for index in &indices {
            outputs.insert(format!("output{index}").into(), DataValue::excluded());
        }
        return Ok(outputs);
    }

    let max = config.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS);
    if iteration_count >= max && config.at_max_iterations_action != AtMaxIterations::Break {
        return Err(NodeError::MaxLoopIterations { max });
    }

    let mut continuing = match inputs.get("continue") {
        None => true,
        Some(value) if value.is_excluded() => false,
        Some(value) => value.coerce_bool(),
    };
    if iteration_count >= max && config.at_max_iterations_action == AtMaxIterations::Break {
        continuing = false;
    }

    #[allow(clippy::cast_precision_loss)]
    let iteration = DataValue::Number((iteration_count + 1) as f64);
    outputs.insert("iteration".into(), iteration);

    if continuing {
        outputs.insert("break".into(), DataValue::loop_not_broken());
        for index in &indices {
            if let Some(value) = resolve_index(inputs, *index) {
                outputs.insert(format!("output{index}").into(), value.clone());
            }
        }
    } else {
        // Break carries what the body fed back, not the seeds: a slot whose
        // feedback never ran is null.
        let values: Vec<DataValue> = indices
            .iter()
            .map(|index| {
                inputs
                    .get(format!("input{index}").as_str())
                    .cloned()
                    .unwrap_or(DataValue::Any(serde_json::Value::Null))
            })
            .collect();
        outputs.insert("break".into(), DataValue::AnyArray(values));
        for index in &indices {
            outputs.insert(format!("output{index}").into(), DataValue::excluded());
        }
    }
    Ok(outputs)
}

/// Drives a loop over its numbered value slots.
///
/// Each slot pairs `input{N}` (fed back from inside the loop) with
/// `input{N}Default` (the seed from outside) and surfaces the pass's value
/// on `output{N}`. The `continue` input decides whether another pass runs;
/// leaving it unwired loops until the iteration cap.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopControllerNode;

#[async_trait]
impl NodeHandler for LoopControllerNode {
    fn input_definitions(
        &self,
        node: &Node,
        connections: &[Connection],
        _project: &Project,
    ) -> Vec<PortDefinition> {
        let count = max_numbered_port(connections, node.id, "input") + 1;
        let mut defs = vec![PortDefinition::new("continue", "any")];
        for index in 1..=count {
            defs.push(PortDefinition::new(format!("input{index}"), "any"));
            defs.push(PortDefinition::new(format!("input{index}Default"), "any"));
        }
        defs
    }

    fn output_definitions(
        &self,
        node: &Node,
        connections: &[Connection],
        _project: &Project,
    ) -> Vec<PortDefinition> {
        let count = max_numbered_port(connections, node.id, "input") + 1;
        let mut defs = vec![
            PortDefinition::new("break", "any"),
            PortDefinition::new("iteration", "number"),
        ];
        for index in 1..=count {
            defs.push(PortDefinition::new(format!("output{index}"), "any"));
        }
        defs
    }

    async fn process(
        &self,
        node: &Node,
        inputs: &Inputs,
        context: &NodeContext,
    ) -> Result<Outputs, NodeError> {
        let config: LoopControllerConfig = node_data(node)?;
        run_pass(&config, inputs, context.loop_iteration())
    }
}

#[cfg(test)]
mod tests {
    use cascade_core::{NodeId, PortId};
    use pretty_assertions::assert_eq;

    use super::*;

    fn inputs(entries: &[(&str, DataValue)]) -> Inputs {
        entries
            .iter()
            .map(|(port, value)| (PortId::new(*port), value.clone()))
            .collect()
    }

    // ---- config ----

    #[test]
    fn config_defaults() {
        let node = Node::new(NodeId::v4(), "loopController", "Loop");
        assert_eq!(configured_max_iterations(&node), DEFAULT_MAX_ITERATIONS);
    }

    #[test]
    fn config_reads_cap_and_action() {
        let node = Node::new(NodeId::v4(), "loopController", "Loop").with_data(serde_json::json!({
            "max_iterations": 3,
            "at_max_iterations_action": "break",
        }));
        assert_eq!(configured_max_iterations(&node), 3);
        let config: LoopControllerConfig = node_data(&node).unwrap();
        assert_eq!(config.at_max_iterations_action, AtMaxIterations::Break);
    }

    // ---- continuing passes ----

    #[test]
    fn first_pass_uses_defaults_and_withholds_break() {
        let config = LoopControllerConfig::default();
        let map = inputs(&[("input1Default", DataValue::Number(0.0))]);

        let outputs = run_pass(&config, &map, 0).unwrap();
        assert_eq!(outputs.get("output1"), Some(&DataValue::Number(0.0)));
        assert_eq!(outputs.get("iteration"), Some(&DataValue::Number(1.0)));
        assert!(outputs.get("break").unwrap().is_loop_not_broken());
    }

    #[test]
    fn fed_back_value_shadows_default() {
        let config = LoopControllerConfig::default();
        let map = inputs(&[
            ("input1", DataValue::Number(7.0)),
            ("input1Default", DataValue::Number(0.0)),
            ("continue", DataValue::Boolean(true)),
        ]);

        let outputs = run_pass(&config, &map, 3).unwrap();
        assert_eq!(outputs.get("output1"), Some(&DataValue::Number(7.0)));
        assert_eq!(outputs.get("iteration"), Some(&DataValue::Number(4.0)));
    }

    // ---- breaking ----

    #[test]
    fn false_continue_breaks_with_final_values() {
        let config = LoopControllerConfig::default();
        let map = inputs(&[
            ("input1", DataValue::from("done")),
            ("continue", DataValue::Boolean(false)),
        ]);

        let outputs = run_pass(&config, &map, 2).unwrap();
        assert_eq!(
            outputs.get("break"),
            Some(&DataValue::AnyArray(vec![DataValue::from("done")]))
        );
        assert!(outputs.get("output1").unwrap().is_excluded());
        assert_eq!(outputs.get("iteration"), Some(&DataValue::Number(3.0)));
    }

    #[test]
    fn break_before_feedback_yields_null_slot() {
        let config = LoopControllerConfig::default();
        let map = inputs(&[
            ("input1Default", DataValue::Number(0.0)),
            ("continue", DataValue::Boolean(false)),
        ]);

        let outputs = run_pass(&config, &map, 0).unwrap();
        assert_eq!(
            outputs.get("break"),
            Some(&DataValue::AnyArray(vec![DataValue::Any(
                serde_json::Value::Null
            )]))
        );
    }

    #[test]
    fn excluded_continue_breaks() {
        let config = LoopControllerConfig::default();
        let map = inputs(&[
            ("input1", DataValue::Number(1.0)),
            ("continue", DataValue::excluded()),
        ]);

        let outputs = run_pass(&config, &map, 0).unwrap();
        assert!(!outputs.get("break").unwrap().is_excluded());
    }

    // ---- iteration cap ----

    #[test]
    fn cap_errors_by_default() {
        let config = LoopControllerConfig {
            max_iterations: Some(2),
            ..LoopControllerConfig::default()
        };
        let map = inputs(&[("input1", DataValue::Number(1.0))]);

        assert!(run_pass(&config, &map, 1).is_ok());
        let error = run_pass(&config, &map, 2).unwrap_err();
        assert_eq!(
            error.to_string(),
            "loop controller exceeded max iterations of 2"
        );
    }

    #[test]
    fn cap_with_break_action_breaks_instead() {
        let config = LoopControllerConfig {
            max_iterations: Some(2),
            at_max_iterations_action: AtMaxIterations::Break,
        };
        let map = inputs(&[
            ("input1", DataValue::Number(9.0)),
            ("continue", DataValue::Boolean(true)),
        ]);

        let outputs = run_pass(&config, &map, 2).unwrap();
        assert_eq!(
            outputs.get("break"),
            Some(&DataValue::AnyArray(vec![DataValue::Number(9.0)]))
        );
    }

    // ---- excluded seed ----

    #[test]
    fn excluded_default_excludes_every_output() {
        let config = LoopControllerConfig::default();
        let map = inputs(&[("input1Default", DataValue::excluded())]);

        let outputs = run_pass(&config, &map, 0).unwrap();
        assert!(outputs.get("break").unwrap().is_excluded());
        assert!(!outputs.get("break").unwrap().is_loop_not_broken());
        assert!(outputs.get("output1").unwrap().is_excluded());
        assert!(outputs.get("iteration").unwrap().is_excluded());
    }

    // ---- ports ----

    #[test]
    fn ports_grow_with_wired_slots() {
        let node = Node::new(NodeId::v4(), "loopController", "Loop");
        let connections = vec![Connection::new(
            NodeId::v4(),
            PortId::new("out"),
            node.id,
            PortId::new("input1Default"),
        )];

        let handler = LoopControllerNode;
        let project = Project::new();
        let inputs = handler.input_definitions(&node, &connections, &project);
        let ids: Vec<&str> = inputs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["continue", "input1", "input1Default", "input2", "input2Default"]
        );

        let outputs = handler.output_definitions(&node, &connections, &project);
        let ids: Vec<&str> = outputs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["break", "iteration", "output1", "output2"]);
    }
}
