//! Event stream for graph runs.
//!
//! Every observable state change in a run is published as a [`ProcessEvent`]
//! on the processor's [`EventBus`]. Subscribers receive events over a
//! broadcast channel and may lag (slow subscribers skip events rather than
//! block dispatch); taps are invoked synchronously on every event and are
//! the lossless path the recorder uses.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use cascade_core::{GraphId, NodeId, ProcessId};
use cascade_graph::DataValue;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::handler::{Inputs, Outputs};

/// Default broadcast capacity for a processor's event bus.
pub const DEFAULT_EVENT_CAPACITY: usize = 512;

/// A single observable state change during a graph run.
///
/// Graph-scoped events (`GraphStart`, `NodeFinish`, ...) are re-emitted on
/// the parent processor when they originate in a subgraph, so a subscriber
/// on the root sees the whole tree. `Start`, `Done`, `Error`, and `Abort`
/// describe the root run itself and are never forwarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProcessEvent {
    /// A root run was accepted: inputs and context values are fixed.
    Start {
        /// Graph being run.
        graph_id: GraphId,
        /// Values for the graph's input nodes.
        inputs: Inputs,
        /// Host-supplied ambient values visible to every node.
        context_values: Inputs,
    },
    /// A graph (root or subgraph) began processing.
    GraphStart {
        /// Graph that started.
        graph_id: GraphId,
    },
    /// A graph finished and produced its output map.
    GraphFinish {
        /// Graph that finished.
        graph_id: GraphId,
        /// Collected graph outputs.
        outputs: Outputs,
    },
    /// A graph failed; the message aggregates its node errors.
    GraphError {
        /// Graph that failed.
        graph_id: GraphId,
        /// Aggregated error message.
        error: String,
    },
    /// A graph's run was aborted.
    GraphAbort {
        /// Graph that was aborted.
        graph_id: GraphId,
        /// Whether the abort counts as a successful outcome.
        successful: bool,
        /// Host-supplied abort error, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A node invocation began.
    NodeStart {
        /// Node being invoked.
        node_id: NodeId,
        /// Invocation id.
        process_id: ProcessId,
        /// Input values handed to the handler.
        inputs: Inputs,
    },
    /// A node invocation finished.
    NodeFinish {
        /// Node that finished.
        node_id: NodeId,
        /// Invocation id.
        process_id: ProcessId,
        /// Outputs recorded for downstream nodes.
        outputs: Outputs,
    },
    /// A node invocation failed.
    NodeError {
        /// Node that failed.
        node_id: NodeId,
        /// Invocation id.
        process_id: ProcessId,
        /// Failure message.
        error: String,
    },
    /// Control flow skipped a node.
    NodeExcluded {
        /// Node that was skipped.
        node_id: NodeId,
        /// Invocation id the skip was attributed to.
        process_id: ProcessId,
    },
    /// A loop re-arm wiped a member node's recorded outputs.
    NodeOutputsCleared {
        /// Node whose outputs were cleared.
        node_id: NodeId,
        /// Invocation the clear was attributed to, when known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        process_id: Option<ProcessId>,
    },
    /// A user-input node suspended waiting for answers.
    UserInput {
        /// Suspended node.
        node_id: NodeId,
        /// Invocation id.
        process_id: ProcessId,
        /// Questions the host should pose.
        questions: Vec<String>,
    },
    /// A node streamed intermediate outputs before finishing.
    PartialOutput {
        /// Streaming node.
        node_id: NodeId,
        /// Invocation id.
        process_id: ProcessId,
        /// Split branch (or stream chunk) index.
        index: usize,
        /// Intermediate outputs.
        outputs: Outputs,
    },
    /// A global variable was written.
    GlobalSet {
        /// Variable id.
        id: String,
        /// Stored value.
        value: DataValue,
        /// Invocation that performed the write.
        process_id: ProcessId,
    },
    /// A named event was raised from inside the run.
    UserEvent {
        /// Event name.
        name: String,
        /// Optional payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<DataValue>,
    },
    /// Free-form diagnostic line.
    Trace {
        /// Diagnostic text.
        message: String,
    },
    /// Dispatch was paused; in-flight handlers keep running.
    Pause,
    /// Dispatch resumed.
    Resume,
    /// The root run finished successfully.
    Done {
        /// Graph outputs of the root run.
        outputs: Outputs,
    },
    /// The run was aborted.
    Abort {
        /// Whether the abort counts as a successful outcome.
        successful: bool,
        /// Host-supplied abort error, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// The root run failed.
    Error {
        /// Aggregated error message.
        error: String,
    },
}

impl ProcessEvent {
    /// Node this event is about, for node-scoped events.
    #[must_use]
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            Self::NodeStart { node_id, .. }
            | Self::NodeFinish { node_id, .. }
            | Self::NodeError { node_id, .. }
            | Self::NodeExcluded { node_id, .. }
            | Self::NodeOutputsCleared { node_id, .. }
            | Self::UserInput { node_id, .. }
            | Self::PartialOutput { node_id, .. } => Some(*node_id),
            _ => None,
        }
    }

    /// Invocation id attached to this event, if any.
    #[must_use]
    pub fn process_id(&self) -> Option<ProcessId> {
        match self {
            Self::NodeStart { process_id, .. }
            | Self::NodeFinish { process_id, .. }
            | Self::NodeError { process_id, .. }
            | Self::NodeExcluded { process_id, .. }
            | Self::UserInput { process_id, .. }
            | Self::PartialOutput { process_id, .. }
            | Self::GlobalSet { process_id, .. } => Some(*process_id),
            Self::NodeOutputsCleared { process_id, .. } => *process_id,
            _ => None,
        }
    }

    /// Whether this event ends the root run.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Abort { .. } | Self::Error { .. })
    }

    /// Stable name of the event variant, matching its serialized tag.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::GraphStart { .. } => "graph_start",
            Self::GraphFinish { .. } => "graph_finish",
            Self::GraphError { .. } => "graph_error",
            Self::GraphAbort { .. } => "graph_abort",
            Self::NodeStart { .. } => "node_start",
            Self::NodeFinish { .. } => "node_finish",
            Self::NodeError { .. } => "node_error",
            Self::NodeExcluded { .. } => "node_excluded",
            Self::NodeOutputsCleared { .. } => "node_outputs_cleared",
            Self::UserInput { .. } => "user_input",
            Self::PartialOutput { .. } => "partial_output",
            Self::GlobalSet { .. } => "global_set",
            Self::UserEvent { .. } => "user_event",
            Self::Trace { .. } => "trace",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Done { .. } => "done",
            Self::Abort { .. } => "abort",
            Self::Error { .. } => "error",
        }
    }
}

type Tap = Box<dyn Fn(&ProcessEvent) + Send + Sync>;

/// Broadcast hub for [`ProcessEvent`]s.
///
/// Emission never blocks and never fails: events without subscribers are
/// dropped, slow subscribers lag and skip. Taps run synchronously inside
/// [`EventBus::emit`] and see every event exactly once, in emission order.
pub struct EventBus {
    sender: broadcast::Sender<ProcessEvent>,
    taps: RwLock<Vec<Tap>>,
    emitted: AtomicU64,
}

impl EventBus {
    /// Creates a bus whose subscribers buffer up to `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            taps: RwLock::new(Vec::new()),
            emitted: AtomicU64::new(0),
        }
    }

    /// Publishes an event to all taps and subscribers.
    pub fn emit(&self, event: ProcessEvent) {
        self.emitted.fetch_add(1, Ordering::Relaxed);
        for tap in self.taps.read().iter() {
            tap(&event);
        }
        // No subscribers is fine, the event is simply dropped.
        let _ = self.sender.send(event);
    }

    /// Registers a synchronous observer invoked on every emitted event.
    pub fn tap(&self, tap: impl Fn(&ProcessEvent) + Send + Sync + 'static) {
        self.taps.write().push(Box::new(tap));
    }

    /// Creates a new subscriber starting at the current stream position.
    #[must_use]
    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            receiver: self.sender.subscribe(),
        }
    }

    /// Total number of events emitted on this bus.
    #[must_use]
    pub fn total_emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("taps", &self.taps.read().len())
            .field("emitted", &self.total_emitted())
            .finish()
    }
}

/// Receiving end of an [`EventBus`] subscription.
#[derive(Debug)]
pub struct EventSubscriber {
    receiver: broadcast::Receiver<ProcessEvent>,
}

impl EventSubscriber {
    /// Waits for the next event.
    ///
    /// Returns `None` once the bus is dropped. A lagged subscriber skips
    /// the missed events and keeps receiving.
    pub async fn recv(&mut self) -> Option<ProcessEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<ProcessEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn sample_events() -> Vec<ProcessEvent> {
        let graph_id = GraphId::v4();
        let node_id = NodeId::v4();
        let process_id = ProcessId::v4();
        let mut outputs: Outputs = BTreeMap::new();
        outputs.insert("value".into(), DataValue::Number(42.0));

        vec![
            ProcessEvent::Start {
                graph_id,
                inputs: BTreeMap::new(),
                context_values: BTreeMap::new(),
            },
            ProcessEvent::GraphStart { graph_id },
            ProcessEvent::NodeStart {
                node_id,
                process_id,
                inputs: BTreeMap::new(),
            },
            ProcessEvent::NodeFinish {
                node_id,
                process_id,
                outputs: outputs.clone(),
            },
            ProcessEvent::Trace {
                message: "checkpoint".to_string(),
            },
            ProcessEvent::GlobalSet {
                id: "counter".to_string(),
                value: DataValue::Number(1.0),
                process_id,
            },
            ProcessEvent::Abort {
                successful: true,
                error: None,
            },
            ProcessEvent::Done { outputs },
        ]
    }

    // ---- event accessors ----

    #[test]
    fn node_scoped_events_expose_node_id() {
        let node_id = NodeId::v4();
        let process_id = ProcessId::v4();
        let event = ProcessEvent::NodeError {
            node_id,
            process_id,
            error: "boom".to_string(),
        };

        assert_eq!(event.node_id(), Some(node_id));
        assert_eq!(event.process_id(), Some(process_id));
        assert!(!event.is_terminal());
    }

    #[test]
    fn run_scoped_events_have_no_node_id() {
        let event = ProcessEvent::Done {
            outputs: BTreeMap::new(),
        };
        assert_eq!(event.node_id(), None);
        assert!(event.is_terminal());
    }

    #[test]
    fn terminal_events() {
        assert!(ProcessEvent::Abort { successful: false, error: None }.is_terminal());
        assert!(ProcessEvent::Error { error: "x".to_string() }.is_terminal());
        assert!(!ProcessEvent::Pause.is_terminal());
    }

    #[test]
    fn name_matches_serialized_tag() {
        for event in sample_events() {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["event"], event.name());
        }
    }

    // ---- serialization ----

    #[test]
    fn events_roundtrip_through_json() {
        for event in sample_events() {
            let json = serde_json::to_string(&event).unwrap();
            let back: ProcessEvent = serde_json::from_str(&json).unwrap();
            assert_eq!(back, event);
        }
    }

    #[test]
    fn optional_error_is_omitted_when_absent() {
        let json = serde_json::to_value(ProcessEvent::Abort {
            successful: true,
            error: None,
        })
        .unwrap();
        assert!(json.get("error").is_none());
    }

    // ---- bus ----

    #[test]
    fn emit_without_subscribers_does_not_fail() {
        let bus = EventBus::default();
        bus.emit(ProcessEvent::Pause);
        bus.emit(ProcessEvent::Resume);
        assert_eq!(bus.total_emitted(), 2);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn try_recv_drains_buffered_events() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe();

        bus.emit(ProcessEvent::Pause);
        bus.emit(ProcessEvent::Resume);

        assert_eq!(sub.try_recv(), Some(ProcessEvent::Pause));
        assert_eq!(sub.try_recv(), Some(ProcessEvent::Resume));
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn recv_receives_emitted_event() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe();

        bus.emit(ProcessEvent::Trace {
            message: "hello".to_string(),
        });

        let event = sub.recv().await.unwrap();
        assert_eq!(
            event,
            ProcessEvent::Trace {
                message: "hello".to_string()
            }
        );
    }

    #[tokio::test]
    async fn each_subscriber_gets_a_copy() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(ProcessEvent::Pause);

        assert_eq!(first.recv().await, Some(ProcessEvent::Pause));
        assert_eq!(second.recv().await, Some(ProcessEvent::Pause));
    }

    #[test]
    fn subscriber_count_tracks_drops() {
        let bus = EventBus::default();
        let first = bus.subscribe();
        let second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(first);
        assert_eq!(bus.subscriber_count(), 1);
        drop(second);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn taps_see_every_event_without_subscribers() {
        let bus = EventBus::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        bus.tap(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for event in sample_events() {
            bus.emit(event);
        }

        assert_eq!(seen.load(Ordering::SeqCst), sample_events().len());
    }
}
