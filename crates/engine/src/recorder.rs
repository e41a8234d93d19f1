//! Recording and replaying runs.
//!
//! A recorder taps a processor's event stream and keeps a timestamped
//! copy of everything it emits. The capture serializes to a versioned
//! JSON document, and [`replay`] later reconstructs the run's final state
//! from it, optionally re-emitting the events for subscribers, without
//! executing any node.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cascade_core::{GraphId, NodeId, RecordingId};
use cascade_graph::{CONTROL_FLOW_EXCLUDED_PORT, DataValue, Project};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::RecordingError;
use crate::event::{EventBus, ProcessEvent};
use crate::handler::{Inputs, Outputs};
use crate::processor::GraphProcessor;

/// Format version written by [`ExecutionRecorder::serialize`].
pub const SERIALIZED_RECORDING_VERSION: u32 = 1;

/// One captured event with the time it was observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// When the recorder observed the event.
    pub ts: DateTime<Utc>,
    /// The event itself.
    pub event: ProcessEvent,
}

/// A complete capture of one or more runs on a processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    /// Stable identity of this capture.
    pub recording_id: RecordingId,
    /// When the recorder was created.
    pub start_ts: DateTime<Utc>,
    /// Timestamp of the last captured event, if any.
    pub finish_ts: Option<DateTime<Utc>>,
    /// Captured events in observation order.
    pub events: Vec<RecordedEvent>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SerializedRecording {
    version: u32,
    recording: Recording,
}

/// Captures a processor's event stream.
///
/// Attach before calling [`GraphProcessor::run`]; events from subgraphs
/// arrive through the root's stream, so one recorder covers the whole
/// tree. Partial outputs and trace lines can be left out to keep
/// recordings of chatty runs small.
#[derive(Debug)]
pub struct ExecutionRecorder {
    recording_id: RecordingId,
    started_at: DateTime<Utc>,
    include_partial_outputs: bool,
    include_trace: bool,
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl ExecutionRecorder {
    /// Creates a recorder capturing everything.
    #[must_use]
    pub fn new() -> Self {
        Self {
            recording_id: RecordingId::v4(),
            started_at: Utc::now(),
            include_partial_outputs: true,
            include_trace: true,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Whether `partial_output` events are captured.
    #[must_use]
    pub fn with_partial_outputs(mut self, include: bool) -> Self {
        self.include_partial_outputs = include;
        self
    }

    /// Whether `trace` events are captured.
    #[must_use]
    pub fn with_trace(mut self, include: bool) -> Self {
        self.include_trace = include;
        self
    }

    /// Identity of the capture this recorder produces.
    #[must_use]
    pub fn recording_id(&self) -> RecordingId {
        self.recording_id
    }

    /// Starts capturing the processor's events.
    ///
    /// The tap stays installed for the processor's lifetime; dropping the
    /// recorder stops nothing, it only drops the shared buffer handle.
    pub fn attach(&self, processor: &GraphProcessor) {
        let events = Arc::clone(&self.events);
        let include_partials = self.include_partial_outputs;
        let include_trace = self.include_trace;
        processor.tap_events(move |event| {
            if !include_partials && matches!(event, ProcessEvent::PartialOutput { .. }) {
                return;
            }
            if !include_trace && matches!(event, ProcessEvent::Trace { .. }) {
                return;
            }
            events.lock().push(RecordedEvent {
                ts: Utc::now(),
                event: event.clone(),
            });
        });
    }

    /// Snapshot of everything captured so far.
    #[must_use]
    pub fn recording(&self) -> Recording {
        let events = self.events.lock().clone();
        Recording {
            recording_id: self.recording_id,
            start_ts: self.started_at,
            finish_ts: events.last().map(|recorded| recorded.ts),
            events,
        }
    }

    /// Serializes the capture as a versioned JSON document.
    pub fn serialize(&self) -> Result<String, RecordingError> {
        let serialized = SerializedRecording {
            version: SERIALIZED_RECORDING_VERSION,
            recording: self.recording(),
        };
        Ok(serde_json::to_string(&serialized)?)
    }

    /// Parses a JSON document produced by [`ExecutionRecorder::serialize`].
    pub fn deserialize(json: &str) -> Result<Recording, RecordingError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let version = value
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .and_then(|version| u32::try_from(version).ok())
            .unwrap_or(0);
        if version != SERIALIZED_RECORDING_VERSION {
            return Err(RecordingError::UnsupportedVersion(version));
        }
        let serialized: SerializedRecording = serde_json::from_value(value)?;
        Ok(serialized.recording)
    }
}

impl Default for ExecutionRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Final run state reconstructed from a recording.
#[derive(Debug, Default, Clone)]
pub struct ReplayedRun {
    /// Outputs of every node that finished.
    pub node_results: HashMap<NodeId, Outputs>,
    /// Nodes that ran, errored, or were skipped.
    pub visited: HashSet<NodeId>,
    /// Error message per failed node.
    pub errored: HashMap<NodeId, String>,
    /// The run's graph outputs, when the run completed.
    pub outputs: Outputs,
    /// Inputs the run was called with.
    pub graph_inputs: Inputs,
    /// Ambient values the run was called with.
    pub context_values: Inputs,
}

fn event_graph_id(event: &ProcessEvent) -> Option<GraphId> {
    match event {
        ProcessEvent::Start { graph_id, .. }
        | ProcessEvent::GraphStart { graph_id }
        | ProcessEvent::GraphFinish { graph_id, .. }
        | ProcessEvent::GraphError { graph_id, .. }
        | ProcessEvent::GraphAbort { graph_id, .. } => Some(*graph_id),
        _ => None,
    }
}

/// Reconstructs a run's final state from a recording against the project
/// it was captured from.
///
/// Every graph and node the recording mentions must still exist in the
/// project; a mismatch fails the whole replay rather than producing a
/// partial state. With a bus, each event is re-emitted in order first, so
/// subscribers see the run exactly as a live one.
pub fn replay(
    recording: &Recording,
    project: &Project,
    bus: Option<&EventBus>,
) -> Result<ReplayedRun, RecordingError> {
    for recorded in &recording.events {
        if let Some(graph_id) = event_graph_id(&recorded.event) {
            if project.graph(graph_id).is_none() {
                return Err(RecordingError::GraphMismatch(graph_id));
            }
        }
        if let Some(node_id) = recorded.event.node_id() {
            if project.graph_containing(node_id).is_none() {
                return Err(RecordingError::NodeMismatch(node_id));
            }
        }
    }

    let mut run = ReplayedRun::default();
    for recorded in &recording.events {
        if let Some(bus) = bus {
            bus.emit(recorded.event.clone());
        }
        match &recorded.event {
            ProcessEvent::Start {
                inputs,
                context_values,
                ..
            } => {
                run.graph_inputs = inputs.clone();
                run.context_values = context_values.clone();
            }
            ProcessEvent::NodeFinish {
                node_id, outputs, ..
            } => {
                run.node_results.insert(*node_id, outputs.clone());
                run.visited.insert(*node_id);
                run.errored.remove(node_id);
            }
            ProcessEvent::NodeError { node_id, error, .. } => {
                run.errored.insert(*node_id, error.clone());
                run.visited.insert(*node_id);
            }
            ProcessEvent::NodeExcluded { node_id, .. } => {
                let mut outputs = Outputs::new();
                outputs.insert(CONTROL_FLOW_EXCLUDED_PORT.into(), DataValue::excluded());
                run.node_results.insert(*node_id, outputs);
                run.visited.insert(*node_id);
            }
            ProcessEvent::NodeOutputsCleared { node_id, .. } => {
                run.node_results.remove(node_id);
                run.visited.remove(node_id);
            }
            ProcessEvent::Done { outputs } => {
                run.outputs = outputs.clone();
            }
            _ => {}
        }
    }
    Ok(run)
}

#[cfg(test)]
mod tests {
    use cascade_core::ProcessId;
    use cascade_graph::{Graph, Node};
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample_project() -> (Project, GraphId, NodeId) {
        let node = Node::new(NodeId::v4(), "demo", "Demo");
        let node_id = node.id;
        let graph = Graph::new("main").with_node(node);
        let graph_id = graph.id;
        (Project::new().with_graph(graph), graph_id, node_id)
    }

    fn recording_with(events: Vec<ProcessEvent>) -> Recording {
        let now = Utc::now();
        Recording {
            recording_id: RecordingId::v4(),
            start_ts: now,
            finish_ts: Some(now),
            events: events
                .into_iter()
                .map(|event| RecordedEvent { ts: now, event })
                .collect(),
        }
    }

    fn finish_event(node_id: NodeId, port: &str, value: DataValue) -> ProcessEvent {
        let mut outputs = Outputs::new();
        outputs.insert(port.into(), value);
        ProcessEvent::NodeFinish {
            node_id,
            process_id: ProcessId::v4(),
            outputs,
        }
    }

    // ---- serialization ----

    #[test]
    fn serialize_roundtrip_preserves_events() {
        let recorder = ExecutionRecorder::new();
        recorder.events.lock().push(RecordedEvent {
            ts: Utc::now(),
            event: ProcessEvent::Pause,
        });

        let json = recorder.serialize().unwrap();
        let recording = ExecutionRecorder::deserialize(&json).unwrap();
        assert_eq!(recording.recording_id, recorder.recording_id());
        assert_eq!(recording.events.len(), 1);
        assert_eq!(recording.events[0].event, ProcessEvent::Pause);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let recorder = ExecutionRecorder::new();
        let json = recorder.serialize().unwrap().replace(
            "\"version\":1",
            "\"version\":2",
        );
        let error = ExecutionRecorder::deserialize(&json).unwrap_err();
        assert!(matches!(error, RecordingError::UnsupportedVersion(2)));
    }

    #[test]
    fn missing_version_reads_as_zero() {
        let error = ExecutionRecorder::deserialize("{}").unwrap_err();
        assert!(matches!(error, RecordingError::UnsupportedVersion(0)));
    }

    // ---- replay ----

    #[test]
    fn replay_rebuilds_final_state() {
        let (project, graph_id, node_id) = sample_project();
        let mut outputs = Outputs::new();
        outputs.insert("answer".into(), DataValue::from(42.0));

        let recording = recording_with(vec![
            ProcessEvent::Start {
                graph_id,
                inputs: Inputs::new(),
                context_values: Inputs::new(),
            },
            ProcessEvent::GraphStart { graph_id },
            finish_event(node_id, "out", DataValue::from("hi")),
            ProcessEvent::GraphFinish {
                graph_id,
                outputs: outputs.clone(),
            },
            ProcessEvent::Done {
                outputs: outputs.clone(),
            },
        ]);

        let run = replay(&recording, &project, None).unwrap();
        assert!(run.visited.contains(&node_id));
        assert_eq!(
            run.node_results[&node_id].get("out"),
            Some(&DataValue::from("hi"))
        );
        assert_eq!(run.outputs, outputs);
    }

    #[test]
    fn replay_applies_loop_clears() {
        let (project, _graph_id, node_id) = sample_project();
        let recording = recording_with(vec![
            finish_event(node_id, "out", DataValue::from(1.0)),
            ProcessEvent::NodeOutputsCleared {
                node_id,
                process_id: None,
            },
        ]);

        let run = replay(&recording, &project, None).unwrap();
        assert!(!run.visited.contains(&node_id));
        assert!(run.node_results.is_empty());
    }

    #[test]
    fn replay_records_exclusions() {
        let (project, _graph_id, node_id) = sample_project();
        let recording = recording_with(vec![ProcessEvent::NodeExcluded {
            node_id,
            process_id: ProcessId::v4(),
        }]);

        let run = replay(&recording, &project, None).unwrap();
        assert!(run.visited.contains(&node_id));
        assert!(
            run.node_results[&node_id]
                .get(CONTROL_FLOW_EXCLUDED_PORT)
                .unwrap()
                .is_excluded()
        );
    }

    #[test]
    fn replay_rejects_unknown_graphs_and_nodes() {
        let (project, _graph_id, _node_id) = sample_project();

        let foreign_graph = GraphId::v4();
        let recording = recording_with(vec![ProcessEvent::GraphStart {
            graph_id: foreign_graph,
        }]);
        assert!(matches!(
            replay(&recording, &project, None),
            Err(RecordingError::GraphMismatch(id)) if id == foreign_graph
        ));

        let foreign_node = NodeId::v4();
        let recording = recording_with(vec![finish_event(
            foreign_node,
            "out",
            DataValue::from(1.0),
        )]);
        assert!(matches!(
            replay(&recording, &project, None),
            Err(RecordingError::NodeMismatch(id)) if id == foreign_node
        ));
    }

    #[tokio::test]
    async fn replay_reemits_on_a_bus() {
        let (project, graph_id, _node_id) = sample_project();
        let recording = recording_with(vec![ProcessEvent::GraphStart { graph_id }]);

        let bus = EventBus::default();
        let mut subscriber = bus.subscribe();
        replay(&recording, &project, Some(&bus)).unwrap();

        let event = subscriber.recv().await.unwrap();
        assert_eq!(event, ProcessEvent::GraphStart { graph_id });
    }
}
