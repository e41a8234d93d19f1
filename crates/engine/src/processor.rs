//! The graph processor: concurrent scheduling, control flow, and run
//! lifecycle.
//!
//! A run works backwards from the graph's terminal nodes: fetching a node
//! pulls its inputs into the schedule, and a node executes once every
//! gating input source has been visited. All bookkeeping lives in
//! [`RunState`]; tasks run on an unbounded `TaskTracker` whose `wait`
//! doubles as the idle barrier.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use cascade_core::{GraphId, NodeId, PortId, ProcessId};
use cascade_graph::{
    CONTROL_FLOW_EXCLUDED_PORT, DataValue, ExclusionReason, Graph, GraphIndex, Node, NodePorts,
    Project,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::context::NodeContext;
use crate::error::{NodeError, ProcessError};
use crate::event::{EventBus, EventSubscriber, ProcessEvent};
use crate::handler::{Inputs, NodeHandler, Outputs};
use crate::nodes::{self, LOOP_CONTROLLER, RACE_INPUTS};
use crate::registry::HandlerRegistry;
use crate::state::{GlobalStore, LoopInfo, RaceState, RunState, UserEventHub};

/// Node types that consume an excluded input instead of propagating the
/// exclusion downstream.
const EXCLUSION_CONSUMERS: [&str; 5] = [
    nodes::IF,
    nodes::IF_ELSE,
    nodes::COALESCE,
    nodes::GRAPH_OUTPUT,
    nodes::RACE_INPUTS,
];

/// Identity of the subgraph-node invocation driving a subprocessor.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExecutorInfo {
    pub(crate) node_id: NodeId,
    pub(crate) process_id: ProcessId,
    pub(crate) index: usize,
    /// Re-attribute the child's partial outputs to the driving node on the
    /// parent stream.
    pub(crate) graph_partials: bool,
}

/// Executes one graph of a project.
///
/// A processor is built once per graph and can run it repeatedly; run
/// state is wiped between runs while the execution cache and global
/// variables persist. Subgraph nodes build child processors that share
/// those stores and forward their events upwards, so subscribing to the
/// root observes the whole tree.
///
/// Cloning is shallow: clones drive the same underlying processor.
#[derive(Clone)]
pub struct GraphProcessor {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) project: Arc<Project>,
    pub(crate) graph_id: GraphId,
    graph_name: String,
    pub(crate) index: GraphIndex,
    registry: Arc<HandlerRegistry>,
    pub(crate) bus: EventBus,
    pub(crate) state: RunState,
    pub(crate) cache: Arc<DashMap<String, serde_json::Value>>,
    pub(crate) globals: Arc<GlobalStore>,
    pub(crate) user_events: Arc<UserEventHub>,
    plugin_settings: RwLock<HashMap<String, String>>,
    pause: Arc<watch::Sender<bool>>,
    running: AtomicBool,
    parent: Option<Weak<Inner>>,
    children: RwLock<Vec<GraphProcessor>>,
    pub(crate) executor: Option<ExecutorInfo>,
    target_nodes: RwLock<Option<Vec<NodeId>>>,
    abort_link: Option<CancellationToken>,
}

impl GraphProcessor {
    /// Builds a processor for one graph of a project.
    ///
    /// Fails when the graph id is unknown, a node's type tag has no
    /// registered handler, or the graph is structurally invalid.
    pub fn new(
        project: impl Into<Arc<Project>>,
        graph_id: GraphId,
        registry: Arc<HandlerRegistry>,
    ) -> Result<Self, ProcessError> {
        let project = project.into();
        let graph = project
            .graph(graph_id)
            .ok_or(ProcessError::GraphNotFound(graph_id))?;
        let index = build_index(&project, graph, &registry)?;
        let graph_name = graph.name.clone();

        let inner = Arc::new(Inner {
            project,
            graph_id,
            graph_name,
            index,
            registry,
            bus: EventBus::default(),
            state: RunState::new(),
            cache: Arc::new(DashMap::new()),
            globals: Arc::new(GlobalStore::new()),
            user_events: Arc::new(UserEventHub::new()),
            plugin_settings: RwLock::new(HashMap::new()),
            pause: Arc::new(watch::Sender::new(false)),
            running: AtomicBool::new(false),
            parent: None,
            children: RwLock::new(Vec::new()),
            executor: None,
            target_nodes: RwLock::new(None),
            abort_link: None,
        });
        Ok(Self { inner })
    }

    /// Graph this processor executes.
    #[must_use]
    pub fn graph_id(&self) -> GraphId {
        self.inner.graph_id
    }

    /// Whether a run is currently in progress.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Subscribes to the event stream, starting at the current position.
    #[must_use]
    pub fn events(&self) -> EventSubscriber {
        self.inner.bus.subscribe()
    }

    /// Registers a synchronous observer on the event stream.
    pub(crate) fn tap_events(&self, tap: impl Fn(&ProcessEvent) + Send + Sync + 'static) {
        self.inner.bus.tap(tap);
    }

    /// Accumulated cost of the current (or last) run.
    #[must_use]
    pub fn total_cost(&self) -> f64 {
        self.inner.state.total_cost()
    }

    /// Reads a global variable.
    #[must_use]
    pub fn global(&self, id: &str) -> Option<DataValue> {
        self.inner.globals.get(id)
    }

    /// Sets one host setting passed through to handlers.
    pub fn set_plugin_setting(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner
            .plugin_settings
            .write()
            .insert(key.into(), value.into());
    }

    /// Restricts the next run to the given target nodes and their
    /// transitive inputs; `None` restores the default (all terminal
    /// nodes).
    pub fn set_target_nodes(&self, targets: Option<Vec<NodeId>>) {
        *self.inner.target_nodes.write() = targets;
    }

    /// Raises a named event into the run, waking any node waiting on it.
    pub fn raise_event(&self, name: &str, data: Option<DataValue>) {
        self.inner.raise_event(name, data);
    }

    /// Delivers answers to a suspended user-input node, searching
    /// subprocessors as well.
    pub fn answer_user_input(&self, node_id: NodeId, answers: Vec<String>) {
        if let Some((_, sender)) = self.inner.state.pending_user_inputs.remove(&node_id) {
            let _ = sender.send(answers.clone());
        }
        for child in self.inner.children.read().iter() {
            child.answer_user_input(node_id, answers.clone());
        }
    }

    /// Pauses dispatch: no new node starts until [`GraphProcessor::resume`].
    ///
    /// In-flight handlers keep running. Pause state is shared with
    /// subprocessors.
    pub fn pause(&self) {
        let was_paused = self.inner.pause.send_replace(true);
        if !was_paused {
            self.inner.emit(ProcessEvent::Pause);
        }
    }

    /// Resumes dispatch after a pause.
    pub fn resume(&self) {
        let was_paused = self.inner.pause.send_replace(false);
        if was_paused {
            self.inner.emit(ProcessEvent::Resume);
        }
    }

    /// Whether dispatch is currently paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.inner.pause.borrow()
    }

    /// Aborts the run as a successful outcome: the run ends without an
    /// error, keeping the outputs of nodes that already finished.
    ///
    /// Waits until in-flight work has settled. No-op when idle.
    pub async fn abort(&self) {
        self.abort_inner(true, None).await;
    }

    /// Aborts the run as a failure carrying the given message.
    pub async fn abort_with_error(&self, error: impl Into<String>) {
        self.abort_inner(false, Some(error.into())).await;
    }

    async fn abort_inner(&self, successful: bool, error: Option<String>) {
        if !self.inner.begin_abort(successful, error) {
            return;
        }
        self.inner.state.tracker().wait().await;
    }

    /// Runs the graph to completion and returns its outputs.
    ///
    /// `inputs` feed the graph's input nodes; `context_values` are ambient
    /// values shared with every subgraph. The same processor can run again
    /// afterwards; global variables and the execution cache carry over.
    pub async fn run(
        &self,
        inputs: Inputs,
        context_values: Inputs,
    ) -> Result<Outputs, ProcessError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(ProcessError::AlreadyProcessing);
        }
        let result = self.run_inner(inputs, context_values).await;
        self.inner.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_inner(
        &self,
        inputs: Inputs,
        context_values: Inputs,
    ) -> Result<Outputs, ProcessError> {
        let inner = &self.inner;
        inner.state.reset(
            inner.index.node_ids(),
            inner.abort_link.as_ref(),
            inputs.clone(),
            context_values.clone(),
        );
        inner.children.write().clear();

        if inner.parent.is_none() {
            inner.emit(ProcessEvent::Start {
                graph_id: inner.graph_id,
                inputs,
                context_values,
            });
        }
        inner.emit(ProcessEvent::GraphStart {
            graph_id: inner.graph_id,
        });
        inner.wait_until_unpaused().await;

        let tracker = inner.state.tracker();
        let seeds = match inner.target_nodes.read().clone() {
            Some(targets) => targets,
            None => inner.index.terminal_nodes(),
        };
        for node_id in seeds {
            Inner::spawn_fetch(Arc::clone(inner), tracker.clone(), node_id);
        }
        tracker.close();
        tracker.wait().await;

        // Errors on race losers are expected; everything else counts.
        let mut failures: Vec<(NodeId, String)> = inner
            .state
            .errored
            .iter()
            .filter(|entry| !inner.state.race_completed(*entry.key()))
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        failures.sort_by_key(|(id, _)| *id);

        if !failures.is_empty() && !inner.state.abort_successful.load(Ordering::SeqCst) {
            let failures_text = failures
                .iter()
                .map(|(id, message)| {
                    let title = inner
                        .index
                        .node(*id)
                        .map_or_else(|| id.to_string(), |node| node.title.clone());
                    format!("{title} ({id}): {message}")
                })
                .collect::<Vec<_>>()
                .join(", ");
            let abort_error = inner.state.abort_error.lock().clone();
            let error = match abort_error {
                Some(message) => ProcessError::Aborted(message),
                None => ProcessError::GraphFailed {
                    name: inner.graph_name.clone(),
                    graph_id: inner.graph_id,
                    failures: failures_text,
                },
            };
            inner.emit(ProcessEvent::GraphError {
                graph_id: inner.graph_id,
                error: error.to_string(),
            });
            if inner.parent.is_none() {
                inner.emit(ProcessEvent::Error {
                    error: error.to_string(),
                });
            }
            return Err(error);
        }

        let outputs: Outputs = inner
            .state
            .graph_outputs
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        inner.emit(ProcessEvent::GraphFinish {
            graph_id: inner.graph_id,
            outputs: outputs.clone(),
        });
        if inner.parent.is_none() {
            inner.emit(ProcessEvent::Done {
                outputs: outputs.clone(),
            });
        }
        Ok(outputs)
    }
}

impl std::fmt::Debug for GraphProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphProcessor")
            .field("graph_id", &self.inner.graph_id)
            .field("running", &self.is_running())
            .field("paused", &self.is_paused())
            .finish()
    }
}

impl Inner {
    // ---- event plumbing ----

    /// Emits on this processor's bus, re-emitting graph-scoped events on
    /// the parent so root subscribers observe the whole tree.
    pub(crate) fn emit(&self, event: ProcessEvent) {
        match self.parent.as_ref().and_then(Weak::upgrade) {
            Some(parent) if forwards_to_parent(&event) => {
                self.bus.emit(event.clone());
                parent.emit(event);
            }
            _ => self.bus.emit(event),
        }
    }

    pub(crate) fn emit_partial(
        &self,
        node_id: NodeId,
        process_id: ProcessId,
        index: usize,
        outputs: Outputs,
    ) {
        self.emit(ProcessEvent::PartialOutput {
            node_id,
            process_id,
            index,
            outputs: outputs.clone(),
        });
        // A subgraph flagged as graph-partial-output re-attributes its
        // partials to the driving subgraph node on the parent stream.
        if let (Some(executor), Some(parent)) = (
            self.executor.as_ref(),
            self.parent.as_ref().and_then(Weak::upgrade),
        ) {
            if executor.graph_partials {
                parent.emit(ProcessEvent::PartialOutput {
                    node_id: executor.node_id,
                    process_id: executor.process_id,
                    index: executor.index,
                    outputs,
                });
            }
        }
    }

    pub(crate) fn raise_event(&self, name: &str, data: Option<DataValue>) {
        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent.raise_event(name, data);
            return;
        }
        self.emit(ProcessEvent::UserEvent {
            name: name.to_string(),
            data: data.clone(),
        });
        self.user_events.notify(name, data);
    }

    pub(crate) fn plugin_settings(&self) -> HashMap<String, String> {
        self.plugin_settings.read().clone()
    }

    pub(crate) async fn wait_until_unpaused(&self) {
        if !*self.pause.borrow() {
            return;
        }
        let mut receiver = self.pause.subscribe();
        let _ = receiver.wait_for(|paused| !paused).await;
    }

    /// Flags the run as aborted and cancels its token. Returns whether
    /// this call performed the abort.
    pub(crate) fn begin_abort(&self, successful: bool, error: Option<String>) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        if self.state.aborted.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.state
            .abort_successful
            .store(successful, Ordering::SeqCst);
        *self.state.abort_error.lock() = error.clone();
        self.state.run_token().cancel();
        for child in self.children.read().iter() {
            child.inner.begin_abort(true, None);
        }
        self.emit(ProcessEvent::GraphAbort {
            graph_id: self.graph_id,
            successful,
            error: error.clone(),
        });
        self.emit(ProcessEvent::Abort { successful, error });
        true
    }

    /// Builds a child processor sharing this one's stores and pause state.
    pub(crate) fn create_subprocessor(
        self: &Arc<Self>,
        graph_id: GraphId,
        executor: ExecutorInfo,
        abort_link: CancellationToken,
    ) -> Result<GraphProcessor, ProcessError> {
        let graph = self
            .project
            .graph(graph_id)
            .ok_or(ProcessError::GraphNotFound(graph_id))?;
        let index = build_index(&self.project, graph, &self.registry)?;

        let child = GraphProcessor {
            inner: Arc::new(Inner {
                project: Arc::clone(&self.project),
                graph_id,
                graph_name: graph.name.clone(),
                index,
                registry: Arc::clone(&self.registry),
                bus: EventBus::default(),
                state: RunState::new(),
                cache: Arc::clone(&self.cache),
                globals: Arc::clone(&self.globals),
                user_events: Arc::clone(&self.user_events),
                plugin_settings: RwLock::new(self.plugin_settings()),
                pause: Arc::clone(&self.pause),
                running: AtomicBool::new(false),
                parent: Some(Arc::downgrade(self)),
                children: RwLock::new(Vec::new()),
                executor: Some(executor),
                target_nodes: RwLock::new(None),
                abort_link: Some(abort_link),
            }),
        };
        self.children.write().push(child.clone());
        Ok(child)
    }

    // ---- scheduling ----

    fn spawn_fetch(inner: Arc<Self>, tracker: TaskTracker, node_id: NodeId) {
        let handle = tracker.clone();
        tracker.spawn(async move {
            Self::fetch_and_process(inner, handle, node_id).await;
        });
    }

    fn spawn_ready(inner: Arc<Self>, tracker: TaskTracker, node_id: NodeId) {
        let handle = tracker.clone();
        tracker.spawn(async move {
            Self::process_if_ready(inner, handle, node_id).await;
        });
    }

    /// Pulls a node and its transitive inputs into the schedule, then
    /// tries to run it.
    async fn fetch_and_process(inner: Arc<Self>, tracker: TaskTracker, node_id: NodeId) {
        let Some(node) = inner.index.node(node_id) else {
            return;
        };
        let state = &inner.state;
        if state.currently_processing.contains(&node_id)
            || state.queued.contains(&node_id)
            || state.node_results.contains_key(&node_id)
            || state.errored.contains_key(&node_id)
        {
            return;
        }

        let input_node_ids = inner.index.input_nodes(node_id);
        if input_node_ids
            .iter()
            .any(|id| state.errored.contains_key(id))
        {
            return;
        }
        if !inner.required_inputs_wired(node_id) {
            return;
        }

        // Race tagging: every node feeding a race carries the race ids so
        // a win can cancel and freeze the losers.
        let has_races = state
            .attached
            .get(&node_id)
            .is_some_and(|data| data.races.is_some());
        if node.node_type == RACE_INPUTS || has_races {
            let mut race_ids: BTreeSet<String> = state
                .attached
                .get(&node_id)
                .and_then(|data| {
                    data.races
                        .as_ref()
                        .map(|races| races.race_ids.iter().cloned().collect())
                })
                .unwrap_or_default();
            if node.node_type == RACE_INPUTS {
                race_ids.insert(format!("race-{node_id}"));
            }
            for input_id in &input_node_ids {
                let mut entry = state.attached.entry(*input_id).or_default();
                let races = entry.races.get_or_insert_with(RaceState::default);
                races.race_ids.extend(race_ids.iter().cloned());
                races.completed = false;
            }
        }

        state.queued.insert(node_id);
        for input_id in &input_node_ids {
            Self::spawn_fetch(Arc::clone(&inner), tracker.clone(), *input_id);
        }
        Self::process_if_ready(inner, tracker, node_id).await;
    }

    /// Runs a node once all of its gating inputs have been visited, then
    /// wakes its dependents.
    async fn process_if_ready(inner: Arc<Self>, tracker: TaskTracker, node_id: NodeId) {
        let Some(node) = inner.index.node(node_id) else {
            return;
        };
        let state = &inner.state;
        let is_loop_controller = node.node_type == LOOP_CONTROLLER;

        if state.currently_processing.contains(&node_id) {
            return;
        }
        if state.visited.contains(&node_id) && !is_loop_controller {
            return;
        }
        if state.errored.contains_key(&node_id) {
            return;
        }
        let input_node_ids = inner.index.input_nodes(node_id);
        if input_node_ids
            .iter()
            .any(|id| state.errored.contains_key(id))
        {
            return;
        }
        if !inner.required_inputs_wired(node_id) {
            return;
        }

        let inputs = inner.get_input_values(node_id);

        // A loop-not-broken input is never consumed here: the node waits
        // for the loop to finish instead.
        if inner.excluded_due_to_control_flow(
            node,
            &inputs,
            ProcessId::v4(),
            Some(&ExclusionReason::LoopNotBroken),
        ) {
            return;
        }

        let any_input_valid = inputs.values().any(|value| !value.is_excluded());
        let waiting = if node.node_type == RACE_INPUTS {
            // One live, visited input is enough; a race whose every input
            // settled (even all-excluded) stops waiting too.
            let any_visited = input_node_ids.iter().any(|id| state.visited.contains(id));
            let any_unvisited = input_node_ids.iter().any(|id| !state.visited.contains(id));
            any_unvisited && !(any_visited && any_input_valid)
        } else {
            input_node_ids.iter().any(|input_id| {
                // A controller's first activation must not wait on inputs
                // fed back from inside its own cycle.
                if is_loop_controller
                    && !state.loop_controllers_seen.contains(&node_id)
                    && inner.index.same_cycle(node_id, *input_id)
                {
                    false
                } else {
                    !state.visited.contains(input_id)
                }
            })
        };
        if waiting {
            return;
        }

        // Claim point: exactly one task proceeds past here per activation.
        if !state.currently_processing.insert(node_id) {
            return;
        }
        if (state.visited.contains(&node_id) && !is_loop_controller)
            || state.errored.contains_key(&node_id)
        {
            state.currently_processing.remove(&node_id);
            return;
        }

        if is_loop_controller {
            state.loop_controllers_seen.insert(node_id);
        }

        // Register in the surrounding loop so a re-arm resets this node.
        if let Some(info) = state.loop_info_of(node_id) {
            if info.controller_id != node_id {
                info.members.insert(node_id);
            }
        }

        // A lost race freezes the node: the claim above is never released.
        if state.race_completed(node_id) {
            return;
        }

        let process_id = Self::process_node(&inner, node).await;

        state.visited.insert(node_id);
        state.currently_processing.remove(&node_id);
        state.remaining.remove(&node_id);

        if is_loop_controller {
            // No break output, or an errored controller, counts as broken.
            // The errored check matters on later passes, where results from
            // the previous iteration are still present.
            let broke = state.errored.contains_key(&node_id)
                || state
                    .node_results
                    .get(&node_id)
                    .is_none_or(|results| results.get("break").is_none_or(|v| !v.is_excluded()));
            if !broke {
                if let Some(info) = state.loop_info_of(node_id) {
                    let members: Vec<NodeId> = info.members.iter().map(|id| *id).collect();
                    for member in members {
                        state.visited.remove(&member);
                        state.currently_processing.remove(&member);
                        state.remaining.insert(member);
                        state.node_results.remove(&member);
                        inner.emit(ProcessEvent::NodeOutputsCleared {
                            node_id: member,
                            process_id: None,
                        });
                    }
                }

                // Arm the next iteration. Rejecting a foreign controller id
                // here is what forbids nested loops.
                let existing = state.loop_info_of(node_id);
                if let Some(info) = &existing {
                    if info.controller_id != node_id {
                        inner.node_errored(node, &NodeError::NestedLoop, process_id);
                        return;
                    }
                }
                let next = LoopInfo {
                    controller_id: node_id,
                    members: existing
                        .as_ref()
                        .map(|info| Arc::clone(&info.members))
                        .unwrap_or_default(),
                    iteration: existing.as_ref().map_or(0, |info| info.iteration) + 1,
                };
                let max = nodes::configured_max_iterations(node);
                if next.iteration > max {
                    inner.node_errored(
                        node,
                        &NodeError::LoopLimitExceeded {
                            title: node.title.clone(),
                            max,
                        },
                        process_id,
                    );
                    return;
                }
                state.attached.entry(node_id).or_default().loop_info = Some(next);
            }
        }

        if node.node_type == RACE_INPUTS {
            inner.complete_race(node_id);
        }

        // Propagate loop membership to dependents and wake them. Race
        // tags never propagate, and membership stops at the controller's
        // `break` output.
        let current_loop_info = state.loop_info_of(node_id);
        for dependent_id in inner.index.dependent_nodes(node_id) {
            if let Some(info) = &current_loop_info {
                let through_break = info.controller_id == node_id
                    && inner
                        .index
                        .output_connections(node_id)
                        .any(|c| c.input_node == dependent_id && c.output_port == "break");
                if !through_break {
                    state.attached.entry(dependent_id).or_default().loop_info = Some(info.clone());
                }
            }
            Self::spawn_ready(Arc::clone(&inner), tracker.clone(), dependent_id);
        }
    }

    /// Marks a race as won: freeze every node feeding it and cancel their
    /// in-flight invocations.
    fn complete_race(&self, winner: NodeId) {
        let race_id = format!("race-{winner}");
        let mut tagged: Vec<NodeId> = Vec::new();
        for mut entry in self.state.attached.iter_mut() {
            if let Some(races) = entry.races.as_mut() {
                if races.race_ids.contains(&race_id) {
                    races.completed = true;
                    tagged.push(*entry.key());
                }
            }
        }
        for entry in &self.state.node_tokens {
            if tagged.contains(&entry.key().0) {
                entry.value().cancel();
            }
        }
    }

    /// Dispatches one node invocation and returns its process id.
    async fn process_node(inner: &Arc<Self>, node: &Node) -> ProcessId {
        let process_id = ProcessId::v4();
        let state = &inner.state;

        if state.is_aborted() || state.run_token().is_cancelled() {
            inner.node_errored(node, &NodeError::ProcessingAborted, process_id);
            return process_id;
        }

        let blocked: Vec<String> = inner
            .index
            .input_nodes(node.id)
            .into_iter()
            .filter(|id| state.errored.contains_key(id))
            .filter_map(|id| inner.index.node(id))
            .map(|input| format!("{} ({})", input.title, input.id))
            .collect();
        if !blocked.is_empty() {
            inner.node_errored(
                node,
                &NodeError::DependencyFailed {
                    title: node.title.clone(),
                    node_id: node.id,
                    blocked: blocked.join(", "),
                },
                process_id,
            );
            return process_id;
        }

        if node.disabled {
            inner.trace(format!("skipping disabled node {}", node.title));
            inner.mark_excluded(node, process_id);
            return process_id;
        }

        let Some(handler) = inner.registry.get(&node.node_type) else {
            inner.node_errored(
                node,
                &NodeError::UnknownNodeType(node.node_type.clone()),
                process_id,
            );
            return process_id;
        };

        if handler.requires_user_input(node) {
            Self::process_user_input_node(inner, node, handler.as_ref(), process_id).await;
        } else if node.split_run {
            Self::process_split_run_node(inner, node, &handler, process_id).await;
        } else {
            Self::process_normal_node(inner, node, &handler, process_id).await;
        }
        process_id
    }

    async fn process_normal_node(
        inner: &Arc<Self>,
        node: &Node,
        handler: &Arc<dyn NodeHandler>,
        process_id: ProcessId,
    ) {
        let inputs = inner.get_input_values(node.id);
        if inner.excluded_due_to_control_flow(node, &inputs, process_id, None) {
            return;
        }
        inner.emit(ProcessEvent::NodeStart {
            node_id: node.id,
            process_id,
            inputs: inputs.clone(),
        });

        match Self::execute_node(inner, node, handler, inputs, process_id, 0).await {
            Ok(outputs) => {
                inner.accumulate_cost(&outputs);
                inner.state.node_results.insert(node.id, outputs.clone());
                inner.state.visited.insert(node.id);
                inner.emit(ProcessEvent::NodeFinish {
                    node_id: node.id,
                    process_id,
                    outputs,
                });
            }
            Err(error) => inner.node_errored(node, &error, process_id),
        }
    }

    async fn process_split_run_node(
        inner: &Arc<Self>,
        node: &Node,
        handler: &Arc<dyn NodeHandler>,
        process_id: ProcessId,
    ) {
        let inputs = inner.get_input_values(node.id);
        if inner.excluded_due_to_control_flow(node, &inputs, process_id, None) {
            return;
        }
        inner.emit(ProcessEvent::NodeStart {
            node_id: node.id,
            process_id,
            inputs: inputs.clone(),
        });

        let longest = inputs
            .values()
            .map(|value| value.array_len().unwrap_or(1))
            .max()
            .unwrap_or(1);
        let amount = longest.min(node.split_run_max.unwrap_or(10));

        let mut results: Vec<Result<Outputs, NodeError>> = Vec::with_capacity(amount);
        if node.split_sequential {
            for branch_index in 0..amount {
                let branch = split_branch_inputs(&inputs, branch_index);
                results.push(
                    Self::execute_node(
                        inner,
                        node,
                        handler,
                        branch,
                        ProcessId::v4(),
                        branch_index,
                    )
                    .await,
                );
            }
        } else {
            let branches = (0..amount).map(|branch_index| {
                let branch = split_branch_inputs(&inputs, branch_index);
                Self::execute_node(inner, node, handler, branch, ProcessId::v4(), branch_index)
            });
            results = futures::future::join_all(branches).await;
        }

        let mut outputs_per_branch: Vec<Outputs> = Vec::with_capacity(results.len());
        let mut errors: Vec<NodeError> = Vec::new();
        for result in results {
            match result {
                Ok(outputs) => outputs_per_branch.push(outputs),
                Err(error) => errors.push(error),
            }
        }
        if !errors.is_empty() {
            let error = if errors.len() == 1 {
                errors.remove(0)
            } else {
                NodeError::Message(
                    errors
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join("\n"),
                )
            };
            inner.node_errored(node, &error, process_id);
            return;
        }

        for outputs in &outputs_per_branch {
            inner.accumulate_cost(outputs);
        }
        let ports: BTreeSet<PortId> = outputs_per_branch
            .iter()
            .flat_map(|outputs| outputs.keys().cloned())
            .collect();
        let mut aggregated = Outputs::new();
        for port in ports {
            let branches: Vec<Option<DataValue>> = outputs_per_branch
                .iter()
                .map(|outputs| outputs.get(&port).cloned())
                .collect();
            aggregated.insert(port, DataValue::aggregate_split(&branches));
        }

        inner.state.node_results.insert(node.id, aggregated.clone());
        inner.state.visited.insert(node.id);
        inner.emit(ProcessEvent::NodeFinish {
            node_id: node.id,
            process_id,
            outputs: aggregated,
        });
    }

    async fn process_user_input_node(
        inner: &Arc<Self>,
        node: &Node,
        handler: &dyn NodeHandler,
        process_id: ProcessId,
    ) {
        let inputs = inner.get_input_values(node.id);
        if inner.excluded_due_to_control_flow(node, &inputs, process_id, None) {
            return;
        }
        inner.emit(ProcessEvent::NodeStart {
            node_id: node.id,
            process_id,
            inputs: inputs.clone(),
        });

        let (sender, receiver) = oneshot::channel();
        inner.state.pending_user_inputs.insert(node.id, sender);
        inner.emit(ProcessEvent::UserInput {
            node_id: node.id,
            process_id,
            questions: handler.user_input_questions(node, &inputs),
        });

        let run_token = inner.state.run_token();
        let answers = tokio::select! {
            answers = receiver => match answers {
                Ok(answers) => answers,
                Err(_) => {
                    inner.node_errored(node, &NodeError::ProcessingAborted, process_id);
                    return;
                }
            },
            () = run_token.cancelled() => {
                inner.node_errored(node, &NodeError::ProcessingAborted, process_id);
                return;
            }
        };

        match handler.resolve_user_input(node, &inputs, &answers) {
            Ok(outputs) => {
                inner.state.node_results.insert(node.id, outputs.clone());
                inner.state.visited.insert(node.id);
                inner.emit(ProcessEvent::NodeFinish {
                    node_id: node.id,
                    process_id,
                    outputs,
                });
            }
            Err(error) => inner.node_errored(node, &error, process_id),
        }
    }

    /// Runs the handler under a fresh per-invocation token chained to the
    /// run token, gating on pause first.
    async fn execute_node(
        inner: &Arc<Self>,
        node: &Node,
        handler: &Arc<dyn NodeHandler>,
        inputs: Inputs,
        process_id: ProcessId,
        branch_index: usize,
    ) -> Result<Outputs, NodeError> {
        let token = inner.state.run_token().child_token();
        inner
            .state
            .node_tokens
            .insert((node.id, process_id), token.clone());
        let context = NodeContext::new(
            Arc::clone(inner),
            node.id,
            process_id,
            token.clone(),
            branch_index,
        );

        inner.wait_until_unpaused().await;

        let result = tokio::select! {
            result = handler.process(node, &inputs, &context) => result,
            () = token.cancelled() => Err(NodeError::Aborted),
        };
        inner.state.node_tokens.remove(&(node.id, process_id));

        match result {
            Ok(_) if token.is_cancelled() => Err(NodeError::Aborted),
            other => other,
        }
    }

    // ---- input resolution and control flow ----

    fn required_inputs_wired(&self, node_id: NodeId) -> bool {
        self.index
            .input_definitions(node_id)
            .iter()
            .all(|def| !def.required || self.index.connection_to(node_id, &def.id).is_some())
    }

    /// Copies each connected input's recorded source value, plus the
    /// exclusion marker when a source node was itself excluded.
    fn get_input_values(&self, node_id: NodeId) -> Inputs {
        let mut inputs = Inputs::new();
        for def in self.index.input_definitions(node_id) {
            let Some(connection) = self.index.connection_to(node_id, &def.id) else {
                continue;
            };
            let Some(results) = self.state.node_results.get(&connection.output_node) else {
                continue;
            };
            if let Some(value) = results.get(&connection.output_port) {
                inputs.insert(def.id.clone(), value.clone());
            }
            if results.contains_key(CONTROL_FLOW_EXCLUDED_PORT) {
                inputs.insert(CONTROL_FLOW_EXCLUDED_PORT.into(), DataValue::excluded());
            }
        }
        inputs
    }

    /// Decides whether control flow skips this node, and if so records the
    /// exclusion.
    ///
    /// With a `filter`, only exclusions carrying that reason count. The
    /// consumer allow-list lets conditional nodes receive plain exclusions
    /// as ordinary values, but nobody consumes a loop-not-broken input:
    /// the node just keeps waiting (returns true without recording).
    fn excluded_due_to_control_flow(
        &self,
        node: &Node,
        inputs: &Inputs,
        process_id: ProcessId,
        filter: Option<&ExclusionReason>,
    ) -> bool {
        let matches_filter = |value: &DataValue| match filter {
            None => value.is_excluded(),
            Some(reason) => *value == DataValue::ControlFlowExcluded(Some(reason.clone())),
        };

        let excluded_inputs: Vec<&DataValue> = inputs
            .values()
            .filter(|value| value.is_excluded() && matches_filter(value))
            .collect();
        let input_is_excluded = !inputs.is_empty() && !excluded_inputs.is_empty();

        let source_ids = self.index.input_nodes(node.id);
        let any_source_excluded = source_ids.iter().any(|source| {
            self.state.node_results.get(source).is_some_and(|results| {
                results
                    .get(CONTROL_FLOW_EXCLUDED_PORT)
                    .is_some_and(|value| matches_filter(value))
            })
        });

        let allowed_to_consume = EXCLUSION_CONSUMERS.contains(&node.node_type.as_str());
        let waiting_for_loop = excluded_inputs
            .iter()
            .any(|value| value.is_loop_not_broken());

        if (input_is_excluded || any_source_excluded) && (!allowed_to_consume || waiting_for_loop) {
            if !waiting_for_loop {
                self.trace(format!("excluding node {} due to control flow", node.title));
                self.mark_excluded(node, process_id);
            }
            return true;
        }
        false
    }

    /// Records a node as skipped: visited, with the exclusion marker as
    /// its only output so downstream nodes inherit the skip.
    fn mark_excluded(&self, node: &Node, process_id: ProcessId) {
        let mut outputs = Outputs::new();
        outputs.insert(CONTROL_FLOW_EXCLUDED_PORT.into(), DataValue::excluded());
        self.state.node_results.insert(node.id, outputs);
        self.state.visited.insert(node.id);
        self.emit(ProcessEvent::NodeExcluded {
            node_id: node.id,
            process_id,
        });
    }

    fn node_errored(&self, node: &Node, error: &NodeError, process_id: ProcessId) {
        let message = error.to_string();
        tracing::debug!(node = %node.id, title = %node.title, %message, "node errored");
        self.state.errored.insert(node.id, message.clone());
        self.emit(ProcessEvent::NodeError {
            node_id: node.id,
            process_id,
            error: message,
        });
    }

    /// Nodes report spend on a conventional `cost` output port.
    fn accumulate_cost(&self, outputs: &Outputs) {
        if let Some(DataValue::Number(amount)) = outputs.get("cost") {
            self.state.record_cost(*amount);
        }
    }

    fn trace(&self, message: String) {
        tracing::trace!(graph = %self.graph_id, "{message}");
        self.emit(ProcessEvent::Trace { message });
    }
}

/// Events that re-emit on the parent processor, so a root subscriber
/// observes subgraph activity. Run-terminal events stay local.
fn forwards_to_parent(event: &ProcessEvent) -> bool {
    matches!(
        event,
        ProcessEvent::NodeStart { .. }
            | ProcessEvent::NodeFinish { .. }
            | ProcessEvent::NodeError { .. }
            | ProcessEvent::NodeExcluded { .. }
            | ProcessEvent::UserInput { .. }
            | ProcessEvent::PartialOutput { .. }
            | ProcessEvent::GraphStart { .. }
            | ProcessEvent::GraphFinish { .. }
            | ProcessEvent::GraphError { .. }
            | ProcessEvent::GraphAbort { .. }
            | ProcessEvent::GlobalSet { .. }
    )
}

/// Computes every node's ports through its handler and builds the
/// execution index.
fn build_index(
    project: &Project,
    graph: &Graph,
    registry: &HandlerRegistry,
) -> Result<GraphIndex, ProcessError> {
    let mut ports: HashMap<NodeId, NodePorts> = HashMap::with_capacity(graph.nodes.len());
    for node in &graph.nodes {
        let handler = registry
            .get(&node.node_type)
            .ok_or_else(|| ProcessError::UnknownNodeType(node.node_type.clone()))?;
        ports.insert(
            node.id,
            NodePorts::new(
                handler.input_definitions(node, &graph.connections, project),
                handler.output_definitions(node, &graph.connections, project),
            ),
        );
    }
    GraphIndex::build(graph, ports).map_err(Into::into)
}

/// Slices one branch's view of the inputs: array values contribute their
/// element at `index` (or nothing when exhausted), scalars broadcast.
fn split_branch_inputs(inputs: &Inputs, index: usize) -> Inputs {
    let mut branch = Inputs::new();
    for (port, value) in inputs {
        if value.is_array() {
            if let Some(element) = value.arrayize().get(index) {
                branch.insert(port.clone(), element.clone());
            }
        } else {
            branch.insert(port.clone(), value.clone());
        }
    }
    branch
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // ---- split slicing ----

    #[test]
    fn split_branch_slices_arrays_and_broadcasts_scalars() {
        let mut inputs = Inputs::new();
        inputs.insert(
            "items".into(),
            DataValue::StringArray(vec!["a".to_string(), "b".to_string()]),
        );
        inputs.insert("factor".into(), DataValue::Number(2.0));

        let first = split_branch_inputs(&inputs, 0);
        assert_eq!(first.get("items"), Some(&DataValue::from("a")));
        assert_eq!(first.get("factor"), Some(&DataValue::Number(2.0)));

        let second = split_branch_inputs(&inputs, 1);
        assert_eq!(second.get("items"), Some(&DataValue::from("b")));
        assert_eq!(second.get("factor"), Some(&DataValue::Number(2.0)));
    }

    #[test]
    fn split_branch_drops_exhausted_array_ports() {
        let mut inputs = Inputs::new();
        inputs.insert(
            "short".into(),
            DataValue::NumberArray(vec![1.0]),
        );
        inputs.insert(
            "long".into(),
            DataValue::NumberArray(vec![10.0, 20.0]),
        );

        let second = split_branch_inputs(&inputs, 1);
        assert!(second.get("short").is_none());
        assert_eq!(second.get("long"), Some(&DataValue::Number(20.0)));
    }

    // ---- forwarding ----

    #[test]
    fn run_terminal_events_stay_local() {
        assert!(!forwards_to_parent(&ProcessEvent::Done {
            outputs: Outputs::new()
        }));
        assert!(!forwards_to_parent(&ProcessEvent::Abort {
            successful: true,
            error: None
        }));
        assert!(!forwards_to_parent(&ProcessEvent::Pause));

        let graph_id = GraphId::v4();
        assert!(forwards_to_parent(&ProcessEvent::GraphStart { graph_id }));
        assert!(forwards_to_parent(&ProcessEvent::GraphAbort {
            graph_id,
            successful: false,
            error: None
        }));
    }
}
