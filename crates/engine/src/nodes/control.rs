//! Conditional routing: if, if/else, coalesce, and race.
//!
//! These are the nodes allowed to look at an excluded input instead of
//! being skipped by it, which is what lets a graph branch and then join
//! again downstream.

use async_trait::async_trait;
use cascade_graph::{Connection, DataValue, Node, PortDefinition, Project};

use super::max_numbered_port;
use crate::context::NodeContext;
use crate::error::NodeError;
use crate::handler::{Inputs, NodeHandler, Outputs};

/// Whether the value on `port` is present, not excluded, and truthy.
fn truthy(inputs: &Inputs, port: &str) -> bool {
    inputs
        .get(port)
        .is_some_and(|value| !value.is_excluded() && value.coerce_bool())
}

/// Values on `input1..inputN` ports in numeric order. Map order is
/// lexicographic, which would put `input10` before `input2`.
fn numbered_values(inputs: &Inputs) -> Vec<&DataValue> {
    let mut indexed: Vec<(usize, &DataValue)> = inputs
        .iter()
        .filter_map(|(port, value)| {
            let index = port.as_str().strip_prefix("input")?.parse::<usize>().ok()?;
            Some((index, value))
        })
        .collect();
    indexed.sort_by_key(|(index, _)| *index);
    indexed.into_iter().map(|(_, value)| value).collect()
}

fn numbered_input_definitions(connections: &[Connection], node: &Node) -> Vec<PortDefinition> {
    let count = max_numbered_port(connections, node.id, "input") + 1;
    (1..=count)
        .map(|index| PortDefinition::new(format!("input{index}"), "any"))
        .collect()
}

/// Gates a value on a condition.
///
/// A truthy, non-excluded `if` passes `value` through `output` and
/// excludes `falseOutput`; anything else does the reverse. Both arms are
/// always present so either side can drive further nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct IfNode;

#[async_trait]
impl NodeHandler for IfNode {
    fn input_definitions(
        &self,
        _node: &Node,
        _connections: &[Connection],
        _project: &Project,
    ) -> Vec<PortDefinition> {
        vec![
            PortDefinition::new("if", "any"),
            PortDefinition::new("value", "any"),
        ]
    }

    fn output_definitions(
        &self,
        _node: &Node,
        _connections: &[Connection],
        _project: &Project,
    ) -> Vec<PortDefinition> {
        vec![
            PortDefinition::new("output", "any"),
            PortDefinition::new("falseOutput", "any"),
        ]
    }

    async fn process(
        &self,
        _node: &Node,
        inputs: &Inputs,
        _context: &NodeContext,
    ) -> Result<Outputs, NodeError> {
        let value = inputs
            .get("value")
            .cloned()
            .unwrap_or_else(DataValue::excluded);

        let mut outputs = Outputs::new();
        if truthy(inputs, "if") {
            outputs.insert("output".into(), value);
            outputs.insert("falseOutput".into(), DataValue::excluded());
        } else {
            outputs.insert("output".into(), DataValue::excluded());
            outputs.insert("falseOutput".into(), value);
        }
        Ok(outputs)
    }
}

/// Picks between two values on a condition.
///
/// Unlike [`IfNode`] this always produces a live `output`: the chosen
/// branch's value, or the exclusion marker when that branch is unwired.
#[derive(Debug, Clone, Copy, Default)]
pub struct IfElseNode;

#[async_trait]
impl NodeHandler for IfElseNode {
    fn input_definitions(
        &self,
        _node: &Node,
        _connections: &[Connection],
        _project: &Project,
    ) -> Vec<PortDefinition> {
        vec![
            PortDefinition::new("if", "any"),
            PortDefinition::new("true", "any"),
            PortDefinition::new("false", "any"),
        ]
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
        let branch = if truthy(inputs, "if") { "true" } else { "false" };
        let value = inputs
            .get(branch)
            .cloned()
            .unwrap_or_else(DataValue::excluded);

        let mut outputs = Outputs::new();
        outputs.insert("output".into(), value);
        Ok(outputs)
    }
}

/// First truthy input wins.
///
/// Scans `input1..inputN` in numeric order and emits the first value that
/// is neither excluded nor falsy. An excluded `conditional` input, or no
/// candidate at all, excludes the output.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoalesceNode;

#[async_trait]
impl NodeHandler for CoalesceNode {
    fn input_definitions(
        &self,
        node: &Node,
        connections: &[Connection],
        _project: &Project,
    ) -> Vec<PortDefinition> {
        let mut defs = vec![PortDefinition::new("conditional", "boolean")];
        defs.extend(numbered_input_definitions(connections, node));
        defs
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
        if inputs
            .get("conditional")
            .is_some_and(DataValue::is_excluded)
        {
            outputs.insert("output".into(), DataValue::excluded());
            return Ok(outputs);
        }

        let chosen = numbered_values(inputs)
            .into_iter()
            .find(|value| !value.is_excluded() && value.coerce_bool())
            .cloned()
            .unwrap_or_else(DataValue::excluded);
        outputs.insert("output".into(), chosen);
        Ok(outputs)
    }
}

/// First input to arrive wins.
///
/// The processor runs this node as soon as any one input is available and
/// then cancels and freezes everything still feeding the other inputs.
/// The handler itself just reports the first live value in port order.
#[derive(Debug, Clone, Copy, Default)]
pub struct RaceInputsNode;

#[async_trait]
impl NodeHandler for RaceInputsNode {
    fn input_definitions(
        &self,
        node: &Node,
        connections: &[Connection],
        _project: &Project,
    ) -> Vec<PortDefinition> {
        numbered_input_definitions(connections, node)
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
        _node: &Node,
        inputs: &Inputs,
        _context: &NodeContext,
    ) -> Result<Outputs, NodeError> {
        let winner = numbered_values(inputs)
            .into_iter()
            .find(|value| !value.is_excluded())
            .cloned()
            .unwrap_or_else(DataValue::excluded);

        let mut outputs = Outputs::new();
        outputs.insert("result".into(), winner);
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use cascade_core::NodeId;
    use cascade_core::PortId;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn inputs(entries: &[(&str, DataValue)]) -> Inputs {
        entries
            .iter()
            .map(|(port, value)| (PortId::new(*port), value.clone()))
            .collect()
    }

    // ---- truthiness ----

    #[rstest]
    #[case::true_boolean(Some(DataValue::Boolean(true)), true)]
    #[case::false_boolean(Some(DataValue::Boolean(false)), false)]
    #[case::excluded(Some(DataValue::excluded()), false)]
    #[case::absent(None, false)]
    #[case::nonempty_string(Some(DataValue::from("yes")), true)]
    #[case::empty_string(Some(DataValue::from("")), false)]
    fn truthy_requires_present_live_and_true(
        #[case] value: Option<DataValue>,
        #[case] expected: bool,
    ) {
        let map = value.map_or_else(Inputs::new, |v| inputs(&[("if", v)]));
        assert_eq!(truthy(&map, "if"), expected);
    }

    // ---- numeric port order ----

    #[test]
    fn numbered_values_sort_numerically_not_lexicographically() {
        let map = inputs(&[
            ("input10", DataValue::Number(10.0)),
            ("input2", DataValue::Number(2.0)),
            ("input1", DataValue::Number(1.0)),
            ("conditional", DataValue::Boolean(true)),
        ]);
        let ordered: Vec<f64> = numbered_values(&map)
            .into_iter()
            .filter_map(DataValue::coerce_number)
            .collect();
        assert_eq!(ordered, vec![1.0, 2.0, 10.0]);
    }

    // ---- port growth ----

    #[test]
    fn variadic_inputs_grow_one_past_highest_wired() {
        let node = Node::new(NodeId::v4(), "coalesce", "Coalesce");
        let connections = vec![Connection::new(
            NodeId::v4(),
            PortId::new("out"),
            node.id,
            PortId::new("input2"),
        )];
        let defs = numbered_input_definitions(&connections, &node);
        let ids: Vec<&str> = defs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["input1", "input2", "input3"]);
    }

    #[test]
    fn variadic_inputs_start_with_one_free_port() {
        let node = Node::new(NodeId::v4(), "raceInputs", "Race");
        let defs = numbered_input_definitions(&[], &node);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].id.as_str(), "input1");
    }
}
