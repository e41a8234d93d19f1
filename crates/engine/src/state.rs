//! Mutable state of one run, plus the stores that outlive runs.
//!
//! [`RunState`] is wiped by `reset` at the start of every run. The
//! execution cache and [`GlobalStore`] deliberately are not part of it:
//! they persist across runs on the same processor and are shared by
//! reference with subprocessors.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cascade_core::{NodeId, PortId, ProcessId};
use cascade_graph::DataValue;
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::handler::{Inputs, Outputs};

/// Loop bookkeeping attached to every node a loop touches.
///
/// `members` is a shared handle: a member node registering itself on its own
/// copy is visible to the controller at re-arm time. `iteration` counts
/// completed controller activations and is copied, not shared, so each
/// propagation wave carries the count it was created with.
#[derive(Debug, Clone)]
pub(crate) struct LoopInfo {
    /// The loop controller that owns this loop.
    pub(crate) controller_id: NodeId,
    /// Nodes seen inside the loop body so far.
    pub(crate) members: Arc<DashSet<NodeId>>,
    /// Completed controller activations when this copy was created.
    pub(crate) iteration: usize,
}

/// Race bookkeeping attached to nodes feeding a race.
///
/// Race tags never propagate downstream; `completed` flips once some branch
/// wins, freezing the remaining tagged nodes.
#[derive(Debug, Clone, Default)]
pub(crate) struct RaceState {
    /// Ids of the races this node feeds, `race-{race node id}`.
    pub(crate) race_ids: HashSet<String>,
    /// Whether one of those races has already been won.
    pub(crate) completed: bool,
}

/// Control-flow metadata attached to a node during a run.
#[derive(Debug, Clone, Default)]
pub(crate) struct AttachedData {
    /// The loop this node currently belongs to, if any.
    pub(crate) loop_info: Option<LoopInfo>,
    /// The races this node feeds, if any.
    pub(crate) races: Option<RaceState>,
}

/// All per-run mutable state of a processor.
///
/// Every collection is concurrent; node tasks mutate them directly. The
/// claim point for a node is `currently_processing.insert`, whose return
/// value arbitrates between tasks that both saw the node as ready.
#[derive(Debug)]
pub(crate) struct RunState {
    /// Recorded outputs per finished node.
    pub(crate) node_results: DashMap<NodeId, Outputs>,
    /// Failure message per errored node.
    pub(crate) errored: DashMap<NodeId, String>,
    /// Nodes that have finished, errored, or been excluded.
    pub(crate) visited: DashSet<NodeId>,
    /// Nodes currently claimed by a task.
    pub(crate) currently_processing: DashSet<NodeId>,
    /// Nodes already pulled into the schedule.
    pub(crate) queued: DashSet<NodeId>,
    /// Nodes not yet finished this run.
    pub(crate) remaining: DashSet<NodeId>,
    /// Loop controllers that have completed their first activation.
    pub(crate) loop_controllers_seen: DashSet<NodeId>,
    /// Control-flow metadata per node.
    pub(crate) attached: DashMap<NodeId, AttachedData>,
    /// Values written by graph-output nodes, keyed by output id.
    pub(crate) graph_outputs: DashMap<PortId, DataValue>,
    /// Suspended user-input nodes awaiting answers.
    pub(crate) pending_user_inputs: DashMap<NodeId, oneshot::Sender<Vec<String>>>,
    /// Cancellation token per in-flight node invocation.
    pub(crate) node_tokens: DashMap<(NodeId, ProcessId), CancellationToken>,
    /// Whether the run has been aborted.
    pub(crate) aborted: AtomicBool,
    /// Whether the abort counts as a successful outcome.
    pub(crate) abort_successful: AtomicBool,
    /// Host-supplied abort error, if any.
    pub(crate) abort_error: Mutex<Option<String>>,
    graph_inputs: RwLock<Inputs>,
    context_values: RwLock<Inputs>,
    total_cost: Mutex<f64>,
    run_token: RwLock<CancellationToken>,
    tracker: RwLock<TaskTracker>,
}

impl RunState {
    pub(crate) fn new() -> Self {
        Self {
            node_results: DashMap::new(),
            errored: DashMap::new(),
            visited: DashSet::new(),
            currently_processing: DashSet::new(),
            queued: DashSet::new(),
            remaining: DashSet::new(),
            loop_controllers_seen: DashSet::new(),
            attached: DashMap::new(),
            graph_outputs: DashMap::new(),
            pending_user_inputs: DashMap::new(),
            node_tokens: DashMap::new(),
            aborted: AtomicBool::new(false),
            abort_successful: AtomicBool::new(false),
            abort_error: Mutex::new(None),
            graph_inputs: RwLock::new(Inputs::new()),
            context_values: RwLock::new(Inputs::new()),
            total_cost: Mutex::new(0.0),
            run_token: RwLock::new(CancellationToken::new()),
            tracker: RwLock::new(TaskTracker::new()),
        }
    }

    /// Wipes all per-run state and arms a fresh token and task tracker.
    ///
    /// `abort_link` chains the new run token under the driving node's token
    /// when this state belongs to a subprocessor.
    pub(crate) fn reset(
        &self,
        node_ids: impl Iterator<Item = NodeId>,
        abort_link: Option<&CancellationToken>,
        graph_inputs: Inputs,
        context_values: Inputs,
    ) {
        self.node_results.clear();
        self.errored.clear();
        self.visited.clear();
        self.currently_processing.clear();
        self.queued.clear();
        self.remaining.clear();
        self.loop_controllers_seen.clear();
        self.attached.clear();
        self.graph_outputs.clear();
        self.pending_user_inputs.clear();
        self.node_tokens.clear();
        for id in node_ids {
            self.remaining.insert(id);
        }

        self.aborted.store(false, Ordering::SeqCst);
        self.abort_successful.store(false, Ordering::SeqCst);
        *self.abort_error.lock() = None;
        *self.graph_inputs.write() = graph_inputs;
        *self.context_values.write() = context_values;
        *self.total_cost.lock() = 0.0;
        *self.run_token.write() = match abort_link {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        *self.tracker.write() = TaskTracker::new();
    }

    /// Token cancelled when the run is aborted.
    pub(crate) fn run_token(&self) -> CancellationToken {
        self.run_token.read().clone()
    }

    /// Task tracker for the current run's node tasks.
    pub(crate) fn tracker(&self) -> TaskTracker {
        self.tracker.read().clone()
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub(crate) fn graph_inputs(&self) -> Inputs {
        self.graph_inputs.read().clone()
    }

    pub(crate) fn context_values(&self) -> Inputs {
        self.context_values.read().clone()
    }

    pub(crate) fn record_cost(&self, amount: f64) {
        *self.total_cost.lock() += amount;
    }

    pub(crate) fn total_cost(&self) -> f64 {
        *self.total_cost.lock()
    }

    /// Current loop attachment of a node, if any.
    pub(crate) fn loop_info_of(&self, id: NodeId) -> Option<LoopInfo> {
        self.attached.get(&id).and_then(|data| data.loop_info.clone())
    }

    /// Whether the node belongs to a race that has already been won.
    pub(crate) fn race_completed(&self, id: NodeId) -> bool {
        self.attached
            .get(&id)
            .is_some_and(|data| data.races.as_ref().is_some_and(|races| races.completed))
    }
}

/// Shared global variables, visible to every graph in a processor tree.
///
/// Writes wake any node waiting on the written id; reads never block.
/// The store outlives individual runs.
#[derive(Debug, Default)]
pub struct GlobalStore {
    values: DashMap<String, DataValue>,
    waiters: DashMap<String, Arc<tokio::sync::Notify>>,
}

impl GlobalStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a variable.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<DataValue> {
        self.values.get(id).map(|entry| entry.value().clone())
    }

    /// Writes a variable, returning the previous value.
    pub fn set(&self, id: impl Into<String>, value: DataValue) -> Option<DataValue> {
        let id = id.into();
        let previous = self.values.insert(id.clone(), value);
        if let Some(notify) = self.waiters.get(&id) {
            notify.notify_waiters();
        }
        previous
    }

    /// Number of stored variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the store holds no variables.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Waits until the variable exists and returns its value.
    ///
    /// Returns immediately when the variable is already set.
    pub async fn wait_for(&self, id: &str) -> DataValue {
        let notify = self
            .waiters
            .entry(id.to_string())
            .or_default()
            .clone();
        let notified = notify.notified();
        tokio::pin!(notified);
        loop {
            // Arm the waiter before checking so a concurrent set cannot
            // slip between the check and the await.
            notified.as_mut().enable();
            if let Some(value) = self.get(id) {
                return value;
            }
            notified.as_mut().await;
            notified.set(notify.notified());
        }
    }
}

/// Wakeup hub for named user events, shared across a processor tree.
///
/// `raise` on any processor bubbles to the root and lands here exactly once,
/// so a node waiting inside a subgraph hears events raised anywhere.
#[derive(Debug, Default)]
pub(crate) struct UserEventHub {
    channels: DashMap<String, broadcast::Sender<Option<DataValue>>>,
}

impl UserEventHub {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Delivers an event payload to everyone currently waiting on `name`.
    pub(crate) fn notify(&self, name: &str, data: Option<DataValue>) {
        if let Some(sender) = self.channels.get(name) {
            let _ = sender.send(data);
        }
    }

    /// Waits for the next event named `name` and returns its payload.
    pub(crate) async fn wait(&self, name: &str) -> Option<DataValue> {
        let mut receiver = self
            .channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(8).0)
            .clone()
            .subscribe();
        loop {
            match receiver.recv().await {
                Ok(payload) => return payload,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                // The sender sits in the map for the hub's lifetime, so
                // this only fires during teardown.
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
