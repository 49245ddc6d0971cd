// SPDX-License-Identifier: Apache-2.0

//! The engine: cycles, node evaluation, ingestion, and shutdown.
//!
//! A run is a sequence of cycles, each at one strictly increasing
//! [`EngineTime`]. Per cycle the engine drains the push queue once, then
//! evaluates due nodes in rank order, recursing into nested subgraphs
//! behind their map nodes, and finally drains the cleanup queue. Simulation
//! runs advance the clock as fast as work allows; real-time runs pace each
//! cycle against the wall clock, sleeping on the push queue's condvar so an
//! idle engine costs nothing.

use std::any::Any;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::context::RunContext;
use crate::delta::{DictPatch, SetDelta, TsDelta};
use crate::graph::Graph;
use crate::ident::{NodeId, OutputId, SubGraphId, Tag};
use crate::map::MapState;
use crate::node::{FiredTags, NodeCell, NodeError, ScheduleError};
use crate::plan::{GraphPlan, PlanError};
use crate::push::{PushHandle, PushMsg, PushQueue, PushValue, StopHandle, MIN_WAIT};
use crate::reduce::ReduceState;
use crate::reference::TsRef;
use crate::time::EngineTime;
use crate::value::{Key, Value};

/// How the engine relates cycle times to the wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Run as fast as pending work allows; engine time is purely logical.
    #[default]
    Simulation,
    /// Pace each cycle against the wall clock, mapping the run's start time
    /// to the instant the run begins.
    RealTime,
}

/// Run configuration.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Time of the first cycle. Clamped to be after the engine epoch, which
    /// doubles as the never-written stamp.
    pub start: EngineTime,
    /// Inclusive end of the run; cycles past this time never execute.
    pub end: Option<EngineTime>,
    /// Clock mode.
    pub mode: Mode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            start: EngineTime::from_nanos(1),
            end: None,
            mode: Mode::Simulation,
        }
    }
}

/// Errors that end a run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The plan failed validation.
    #[error(transparent)]
    Plan(#[from] PlanError),
    /// A node failed without error capture enabled. Carries the node's
    /// identity, the cycle time, and a snapshot of its input values.
    #[error("node {node:?} failed at {at}: {source} (inputs: {inputs})")]
    Node {
        /// Plan name of the failing node.
        node: Arc<str>,
        /// Cycle time of the failure.
        at: EngineTime,
        /// Rendered input values at the time of failure.
        inputs: String,
        /// The underlying failure.
        source: NodeError,
    },
    /// A handle or state operation named a node the plan does not have.
    #[error("unknown node {0:?}")]
    UnknownNode(String),
    /// A push handle was requested for a node that is not a push node.
    #[error("node {0:?} is not a push node")]
    NotPushNode(String),
}

/// A built engine, ready to run.
pub struct Engine {
    graph: Graph,
    mode: Mode,
    end: Option<EngineTime>,
    queue: Arc<PushQueue>,
    carry: VecDeque<PushMsg>,
    context: RunContext,
    /// Nodes in the order their start hooks ran; stopped in reverse.
    start_order: Vec<NodeId>,
    /// Wall instant corresponding to the run's start time (real-time mode).
    epoch: Option<Instant>,
    /// One-eval-per-cycle guard.
    evaluated: BTreeSet<NodeId>,
    stopping: bool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("mode", &self.mode)
            .field("now", &self.graph.now())
            .field("stopping", &self.stopping)
            .finish_non_exhaustive()
    }
}

/// Validates and instantiates `plan`, runs it to completion, and returns
/// the finished engine for inspection.
///
/// # Errors
/// [`EngineError`] on plan validation failure or uncaptured node failure.
pub fn run(plan: &GraphPlan, config: EngineConfig) -> Result<Engine, EngineError> {
    let mut engine = Engine::new(plan, config)?;
    engine.run()?;
    Ok(engine)
}

impl Engine {
    /// Validates `plan` and builds its top-level graph.
    ///
    /// # Errors
    /// [`EngineError::Plan`] when validation fails.
    pub fn new(plan: &GraphPlan, config: EngineConfig) -> Result<Self, EngineError> {
        plan.validate()?;
        let start = config.start.max(EngineTime::from_nanos(1));
        let mut graph = Graph::new(start);
        plan.instantiate(&mut graph, SubGraphId::ROOT)?;
        // Every top-level node is offered a first turn; wake admission
        // filters out consumers whose inputs have not ticked, so only
        // sources and generators actually run.
        let roots = graph.subgraphs[SubGraphId::ROOT.index()].nodes.clone();
        for node in roots {
            graph.schedule(node, start);
        }
        Ok(Engine {
            graph,
            mode: config.mode,
            end: config.end,
            queue: Arc::new(PushQueue::default()),
            carry: VecDeque::new(),
            context: RunContext::new(),
            start_order: Vec::new(),
            epoch: None,
            evaluated: BTreeSet::new(),
            stopping: false,
        })
    }

    /// The graph, for inspection after (or between) runs.
    #[must_use]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Mutable graph access, for test harnesses.
    #[must_use]
    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    /// The run-scoped resource registry.
    #[must_use]
    pub fn context(&self) -> &RunContext {
        &self.context
    }

    /// Mutable access to the run-scoped resource registry, for seeding
    /// resources before the run.
    pub fn context_mut(&mut self) -> &mut RunContext {
        &mut self.context
    }

    /// A producer handle for the named push node.
    ///
    /// # Errors
    /// [`EngineError::UnknownNode`] or [`EngineError::NotPushNode`].
    pub fn push_handle(&self, node: &str) -> Result<PushHandle, EngineError> {
        let id = self
            .graph
            .node_by_name(node)
            .ok_or_else(|| EngineError::UnknownNode(node.to_owned()))?;
        if !matches!(self.graph.nodes[id.index()].cell, NodeCell::Push(_)) {
            return Err(EngineError::NotPushNode(node.to_owned()));
        }
        Ok(PushHandle::new(id, Arc::clone(&self.queue)))
    }

    /// A handle that requests a graceful stop from any thread.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle::new(Arc::clone(&self.queue))
    }

    /// Seeds a node's recordable state before the run.
    ///
    /// # Errors
    /// [`EngineError::UnknownNode`].
    pub fn restore_state(
        &mut self,
        node: &str,
        state: Box<dyn Any + Send>,
    ) -> Result<(), EngineError> {
        let id = self
            .graph
            .node_by_name(node)
            .ok_or_else(|| EngineError::UnknownNode(node.to_owned()))?;
        self.graph.nodes[id.index()].state = Some(state);
        Ok(())
    }

    /// Takes a node's recordable state, typically after the run.
    pub fn take_state(&mut self, node: &str) -> Option<Box<dyn Any + Send>> {
        let id = self.graph.node_by_name(node)?;
        self.graph.nodes[id.index()].state.take()
    }

    /// Runs cycles until the work runs out, the end time passes, a stop is
    /// requested, or an uncaptured node failure aborts the run. Stop hooks
    /// run in reverse start order on every non-error exit.
    ///
    /// # Errors
    /// [`EngineError::Node`] for uncaptured node failures.
    pub fn run(&mut self) -> Result<(), EngineError> {
        if self.mode == Mode::RealTime && self.epoch.is_none() {
            self.epoch = Some(Instant::now());
        }
        debug!(start = %self.graph.start_time(), mode = ?self.mode, "run starting");
        loop {
            let (msgs, stopped) = self.queue.drain();
            self.carry.extend(msgs);
            if stopped {
                self.stopping = true;
            }
            if self.stopping && self.carry.is_empty() {
                break;
            }

            if self.carry.is_empty() {
                let Some(t) = self.graph.next_time() else {
                    match self.mode {
                        // A simulation with no pending work is complete.
                        Mode::Simulation => break,
                        // A live run idles until a push or stop arrives.
                        Mode::RealTime => {
                            self.queue.wait_until(None);
                            continue;
                        }
                    }
                };
                if self.past_end(t) {
                    break;
                }
                if self.mode == Mode::RealTime {
                    let deadline = self.deadline(t);
                    if deadline.saturating_duration_since(Instant::now()) > MIN_WAIT
                        && !self.queue.has_work()
                    {
                        self.queue.wait_until(Some(deadline));
                        // Re-drain; a push may want an earlier cycle.
                        continue;
                    }
                }
                self.run_cycle(t)?;
            } else {
                let t = self.push_cycle_time();
                if self.past_end(t) {
                    break;
                }
                self.run_cycle(t)?;
            }
        }
        debug!(now = %self.graph.now(), "run stopping");
        self.shutdown()
    }

    /// Executes at most one cycle: drains queued pushes and runs the
    /// earliest pending work. Returns the cycle time, or `None` when
    /// nothing is due. Ignores wall-clock pacing; meant for tests and
    /// harnesses driving the engine by hand.
    ///
    /// # Errors
    /// [`EngineError::Node`] for uncaptured node failures.
    pub fn step(&mut self) -> Result<Option<EngineTime>, EngineError> {
        let (msgs, stopped) = self.queue.drain();
        self.carry.extend(msgs);
        if stopped {
            self.stopping = true;
        }
        let t = if self.carry.is_empty() {
            match self.graph.next_time() {
                Some(t) => t,
                None => return Ok(None),
            }
        } else {
            self.push_cycle_time()
        };
        if self.past_end(t) {
            return Ok(None);
        }
        self.run_cycle(t)?;
        Ok(Some(t))
    }

    fn past_end(&self, t: EngineTime) -> bool {
        self.end.is_some_and(|end| t > end)
    }

    fn deadline(&self, t: EngineTime) -> Instant {
        let epoch = self.epoch.unwrap_or_else(Instant::now);
        epoch + t.since(self.graph.start_time())
    }

    /// Earliest admissible time for a cycle triggered by queued pushes.
    fn push_cycle_time(&self) -> EngineTime {
        let floor = self.graph.start_time().max(self.graph.now().next());
        match self.mode {
            Mode::Simulation => floor,
            Mode::RealTime => {
                let elapsed = self
                    .epoch
                    .map_or(Duration::ZERO, |epoch| epoch.elapsed());
                floor.max(self.graph.start_time().saturating_add(elapsed))
            }
        }
    }

    fn run_cycle(&mut self, now: EngineTime) -> Result<(), EngineError> {
        trace!(at = %now, "cycle");
        self.graph.now = now;
        self.graph.evaluating = None;
        self.evaluated.clear();
        self.apply_pushes()?;
        self.run_subgraph(SubGraphId::ROOT, now)?;
        self.graph.end_cycle();
        self.graph.evaluating = None;
        Ok(())
    }

    /// Applies queued push messages for this cycle. Same-cycle messages for
    /// one node fold together where the delta contract allows (dictionary
    /// patches and set deltas merge; direct values collapse only on elide
    /// nodes); anything that cannot fold carries over to the next cycle.
    fn apply_pushes(&mut self) -> Result<(), EngineError> {
        let pending = std::mem::take(&mut self.carry);
        if pending.is_empty() {
            return Ok(());
        }
        let mut order: Vec<NodeId> = Vec::new();
        let mut folded: FxHashMap<NodeId, PushValue> = FxHashMap::default();
        let mut blocked: FxHashSet<NodeId> = FxHashSet::default();
        let mut deferred: VecDeque<PushMsg> = VecDeque::new();

        for msg in pending {
            let node = msg.node;
            let live = self
                .graph
                .nodes
                .get(node.index())
                .is_some_and(|n| !n.disposed);
            if !live {
                continue;
            }
            if blocked.contains(&node) {
                deferred.push_back(msg);
                continue;
            }
            match folded.get_mut(&node) {
                None => {
                    order.push(node);
                    folded.insert(node, msg.value);
                }
                Some(current) => match (current, msg.value) {
                    (PushValue::Dict(patch), PushValue::Dict(later)) => patch.merge(later),
                    (PushValue::Set(delta), PushValue::Set(later)) => delta.merge(&later),
                    (PushValue::Value(v), PushValue::Value(later)) if self.elides(node) => {
                        *v = later;
                    }
                    (_, value) => {
                        blocked.insert(node);
                        deferred.push_back(PushMsg { node, value });
                    }
                },
            }
        }

        for node in order {
            let Some(value) = folded.remove(&node) else {
                continue;
            };
            let Some(output) = self.graph.node_output(node) else {
                continue;
            };
            if !self.graph.can_apply(output) {
                deferred.push_back(PushMsg { node, value });
                continue;
            }
            let result = match value {
                PushValue::Value(v) => self.graph.apply(output, v),
                PushValue::Dict(p) => self.graph.apply_dict(output, p),
                PushValue::Set(d) => self.graph.apply_set(output, d),
            };
            if let Err(e) = result {
                self.handle_node_error(node, e.into())?;
            }
        }
        self.carry = deferred;
        Ok(())
    }

    fn elides(&self, node: NodeId) -> bool {
        matches!(
            self.graph.nodes.get(node.index()).map(|n| &n.cell),
            Some(NodeCell::Push(state)) if state.elide
        )
    }

    /// Evaluates due nodes of one subgraph in rank order until no more are
    /// due at `now`. Returns whether anything ran.
    fn run_subgraph(&mut self, sub: SubGraphId, now: EngineTime) -> Result<bool, EngineError> {
        let mut ran = false;
        loop {
            let due = self.graph.take_due(sub, now);
            if due.is_empty() {
                return Ok(ran);
            }
            for node in due {
                ran |= self.eval_node(node, false)?;
            }
        }
    }

    /// Runs one node's turn: start hook on first evaluation, then the
    /// behavior behind its cell. Returns whether the node actually ran.
    fn eval_node(&mut self, node: NodeId, force: bool) -> Result<bool, EngineError> {
        let now = self.graph.now();
        {
            let Some(n) = self.graph.nodes.get(node.index()) else {
                return Ok(false);
            };
            if n.disposed || self.evaluated.contains(&node) {
                return Ok(false);
            }
        }
        let fired = FiredTags {
            tags: self.graph.nodes[node.index()].sched.take_due(now),
        };
        // A forced turn (a freshly created nested instance) skips the wake
        // admission but never the gates.
        if !force && !self.wake_due(node, &fired) {
            trace!(node = %self.graph.nodes[node.index()].name, at = %now, "no tick or alarm");
            return Ok(false);
        }
        if !self.gates_pass(node) {
            trace!(node = %self.graph.nodes[node.index()].name, at = %now, "gated");
            return Ok(false);
        }
        self.evaluated.insert(node);
        let rank = self.graph.nodes[node.index()].rank;
        self.graph.evaluating = Some((rank, node));

        // Check the cell out so the behavior can borrow the graph mutably;
        // Vacant doubles as the reentrancy sentinel.
        let cell = std::mem::replace(&mut self.graph.nodes[node.index()].cell, NodeCell::Vacant);
        let mut state = self.graph.nodes[node.index()].state.take();
        let starting = !self.graph.nodes[node.index()].started;

        let (cell, result) = match cell {
            NodeCell::Compute(mut body) => {
                let result = (|| {
                    if starting {
                        let mut ctx = self.ctx(node, &fired, &mut state);
                        body.start(&mut ctx)?;
                    }
                    let mut ctx = self.ctx(node, &fired, &mut state);
                    body.eval(&mut ctx)
                })();
                (NodeCell::Compute(body), result)
            }
            // Push outputs are written during the drain; the turn itself is
            // a no-op.
            NodeCell::Push(s) => (NodeCell::Push(s), Ok(())),
            NodeCell::Map(mut s) => {
                let result = self.eval_map(node, &mut s);
                (NodeCell::Map(s), result)
            }
            NodeCell::Reduce(mut s) => {
                let result = self.eval_reduce(node, &mut s);
                (NodeCell::Reduce(s), result)
            }
            NodeCell::Vacant => (NodeCell::Vacant, Ok(())),
        };

        {
            let n = &mut self.graph.nodes[node.index()];
            n.cell = cell;
            n.state = state;
            if starting {
                n.started = true;
            }
        }
        if starting {
            self.start_order.push(node);
        }
        if let Err(e) = result {
            self.handle_node_error(node, e)?;
        }
        Ok(true)
    }

    /// Wake admission: a node with active time-series inputs only takes a
    /// queued turn when one of them ticked this cycle or one of its own
    /// schedule requests fired. Nodes without active inputs (sources,
    /// generators) always take their turn.
    fn wake_due(&self, node: NodeId, fired: &FiredTags) -> bool {
        if fired.any() {
            return true;
        }
        let n = &self.graph.nodes[node.index()];
        let mut has_active = false;
        for &input in &n.inputs {
            if self.graph.inputs[input.index()].active {
                has_active = true;
                if self.graph.input_ticked(input) {
                    return true;
                }
            }
        }
        !has_active
    }

    /// Evaluation gates: every input marked `require_valid` /
    /// `require_all_valid` must hold before the body runs.
    fn gates_pass(&self, node: NodeId) -> bool {
        let n = &self.graph.nodes[node.index()];
        n.inputs.iter().all(|&input| {
            let slot = &self.graph.inputs[input.index()];
            (!slot.require_valid || self.graph.input_valid(input))
                && (!slot.require_all_valid || self.graph.input_all_valid(input))
        })
    }

    fn ctx<'a>(
        &'a mut self,
        node: NodeId,
        fired: &'a FiredTags,
        state: &'a mut Option<Box<dyn Any + Send>>,
    ) -> EvalCtx<'a> {
        EvalCtx {
            graph: &mut self.graph,
            context: &mut self.context,
            node,
            fired,
            state,
        }
    }

    /// A map node's turn: reconcile instances against the current key
    /// union, run due nested nodes, and copy changed sink values into the
    /// per-key result dictionary.
    fn eval_map(&mut self, node: NodeId, state: &mut MapState) -> Result<(), NodeError> {
        let now = self.graph.now();
        let desired = state.desired_keys(&self.graph, node);
        let (new_keys, gone_keys) = state.diff(&desired);
        let mut patch = DictPatch::new();

        for key in gone_keys {
            if let Some(instance) = state.take_instance(&key) {
                for inst_node in instance.nodes.iter().rev() {
                    self.stop_node(*inst_node)
                        .map_err(|e| NodeError::custom(e.to_string()))?;
                }
                MapState::dispose_instance(&mut self.graph, &instance);
                patch = patch.remove_if_exists(key);
            }
        }

        for key in &new_keys {
            let nodes = state.create_instance(&mut self.graph, node, key)?;
            // New instances evaluate in their creation cycle.
            for inst_node in nodes {
                self.eval_node(inst_node, true)
                    .map_err(|e| NodeError::custom(e.to_string()))?;
            }
        }

        // Drain nested work due this cycle until it settles.
        loop {
            let subs: Vec<SubGraphId> = state.instances.values().map(|i| i.sub).collect();
            let mut ran = false;
            for sub in subs {
                ran |= self
                    .run_subgraph(sub, now)
                    .map_err(|e| NodeError::custom(e.to_string()))?;
            }
            if !ran {
                break;
            }
        }
        let rank = self.graph.nodes[node.index()].rank;
        self.graph.evaluating = Some((rank, node));

        for (key, instance) in &state.instances {
            let fresh = new_keys.contains(key);
            if (fresh || self.graph.modified(instance.sink)) && self.graph.valid(instance.sink) {
                if let Some(value) = self.graph.value(instance.sink) {
                    patch = patch.set(key.clone(), value);
                }
            }
        }

        if !patch.is_empty() {
            let output = self
                .graph
                .node_output(node)
                .ok_or_else(|| NodeError::custom("map node has no output"))?;
            self.graph.apply_dict(output, patch)?;
        }
        Ok(())
    }

    /// A reduce node's turn: fold the input dictionary's delta into the
    /// combine tree (resyncing from a snapshot after a rebind) and publish
    /// the root.
    fn eval_reduce(&mut self, node: NodeId, state: &mut ReduceState) -> Result<(), NodeError> {
        let (input, output) = {
            let n = &self.graph.nodes[node.index()];
            let Some(&input) = n.inputs.first() else {
                return Ok(());
            };
            let Some(output) = n.output else {
                return Ok(());
            };
            (input, output)
        };
        let Some(dict) = self.graph.inputs[input.index()].peer() else {
            return Ok(());
        };
        let mut changed = false;
        if let Some(TsDelta::Dict(delta)) = self.graph.input_delta(input) {
            state.apply_delta(&delta);
            changed = true;
        }
        if self.graph.valid(dict) {
            let keys = self.graph.dict_keys(dict);
            if state.len() != keys.len() {
                // Membership drifted past the delta stream (rebind or first
                // sight of a populated input): rebuild from a snapshot.
                let entries: Vec<(Key, Value)> = keys
                    .into_iter()
                    .filter_map(|key| {
                        let child = self.graph.dict_child_output(dict, &key)?;
                        let value = self.graph.peek_value(child)?;
                        Some((key, value))
                    })
                    .collect();
                state.sync(entries.iter().map(|(k, v)| (k, v)));
                changed = true;
            }
        }
        if changed {
            self.graph.apply(output, state.root())?;
        }
        Ok(())
    }

    /// Captures a node failure into its error output, or aborts the run
    /// with full context when capture is off.
    fn handle_node_error(&mut self, node: NodeId, error: NodeError) -> Result<(), EngineError> {
        let now = self.graph.now();
        let (name, capture, error_output) = {
            let n = &self.graph.nodes[node.index()];
            (Arc::clone(&n.name), n.capture_errors, n.error_output)
        };
        if capture {
            warn!(node = %name, at = %now, error = %error, "node error captured");
            if let Some(out) = error_output {
                if self.graph.can_apply(out) {
                    let _ = self.graph.apply(out, Value::Str(error.to_string().into()));
                }
            }
            return Ok(());
        }
        Err(EngineError::Node {
            node: name,
            at: now,
            inputs: self.inputs_snapshot(node),
            source: error,
        })
    }

    fn inputs_snapshot(&mut self, node: NodeId) -> String {
        let pairs: Vec<(Arc<str>, crate::ident::InputId)> = {
            let n = &self.graph.nodes[node.index()];
            n.input_names
                .iter()
                .cloned()
                .zip(n.inputs.iter().copied())
                .collect()
        };
        let rendered: Vec<String> = pairs
            .into_iter()
            .map(|(name, input)| match self.graph.input_value(input) {
                Some(value) => format!("{name}={value:?}"),
                None => format!("{name}=<none>"),
            })
            .collect();
        rendered.join(", ")
    }

    /// Runs a node's stop hook (compute bodies only).
    fn stop_node(&mut self, node: NodeId) -> Result<(), EngineError> {
        {
            let Some(n) = self.graph.nodes.get(node.index()) else {
                return Ok(());
            };
            if n.disposed || !n.started {
                return Ok(());
            }
        }
        let cell = std::mem::replace(&mut self.graph.nodes[node.index()].cell, NodeCell::Vacant);
        let mut state = self.graph.nodes[node.index()].state.take();
        let fired = FiredTags::default();
        let (cell, result) = match cell {
            NodeCell::Compute(mut body) => {
                let result = {
                    let mut ctx = self.ctx(node, &fired, &mut state);
                    body.stop(&mut ctx)
                };
                (NodeCell::Compute(body), result)
            }
            other => (other, Ok(())),
        };
        {
            let n = &mut self.graph.nodes[node.index()];
            n.cell = cell;
            n.state = state;
        }
        result.map_err(|e| {
            let name = Arc::clone(&self.graph.nodes[node.index()].name);
            EngineError::Node {
                node: name,
                at: self.graph.now(),
                inputs: String::new(),
                source: e,
            }
        })
    }

    /// Two-phase shutdown: stop hooks in reverse start order. Stop-phase
    /// writes land on a fresh cycle time.
    fn shutdown(&mut self) -> Result<(), EngineError> {
        self.graph.now = self.graph.now.next().max(self.graph.start_time());
        self.graph.evaluating = None;
        let order: Vec<NodeId> = self.start_order.iter().rev().copied().collect();
        for node in order {
            self.stop_node(node)?;
        }
        self.graph.end_cycle();
        Ok(())
    }
}

/// A node body's window into the run during its turn.
///
/// Everything a body can observe or effect goes through here: input reads,
/// output writes, self-scheduling, reference plumbing, recordable state,
/// and the run context. The underlying node's cell is checked out while the
/// body runs, so the graph borrow is exclusive and safe.
pub struct EvalCtx<'a> {
    graph: &'a mut Graph,
    context: &'a mut RunContext,
    node: NodeId,
    fired: &'a FiredTags,
    state: &'a mut Option<Box<dyn Any + Send>>,
}

impl EvalCtx<'_> {
    /// The current cycle time.
    #[must_use]
    pub fn now(&self) -> EngineTime {
        self.graph.now()
    }

    /// The run's start time.
    #[must_use]
    pub fn start_time(&self) -> EngineTime {
        self.graph.start_time()
    }

    fn input_id(&self, name: &str) -> Option<crate::ident::InputId> {
        self.graph.nodes[self.node.index()].input_named(name)
    }

    /// The named input's current value.
    #[must_use]
    pub fn input(&mut self, name: &str) -> Option<Value> {
        let input = self.input_id(name)?;
        self.graph.input_value(input)
    }

    /// The named input's delta for this cycle, or `None` if it did not tick.
    #[must_use]
    pub fn input_delta(&mut self, name: &str) -> Option<TsDelta> {
        let input = self.input_id(name)?;
        self.graph.input_delta(input)
    }

    /// True when the named input changed this cycle.
    #[must_use]
    pub fn input_ticked(&self, name: &str) -> bool {
        self.input_id(name)
            .is_some_and(|input| self.graph.input_ticked(input))
    }

    /// True when the named input is bound to a valid output.
    #[must_use]
    pub fn input_valid(&self, name: &str) -> bool {
        self.input_id(name)
            .is_some_and(|input| self.graph.input_valid(input))
    }

    /// Current keys of a dictionary input.
    #[must_use]
    pub fn input_keys(&self, name: &str) -> Vec<Key> {
        self.input_id(name)
            .and_then(|input| self.graph.inputs[input.index()].peer())
            .map(|output| self.graph.dict_keys(output))
            .unwrap_or_default()
    }

    /// A reference capturing the named input's current binding.
    #[must_use]
    pub fn input_ref(&self, name: &str) -> TsRef {
        self.input_id(name)
            .map(|input| self.graph.reference_for_input(input))
            .unwrap_or(TsRef::Empty)
    }

    /// Rebinds the named input per `reference`.
    ///
    /// # Errors
    /// [`NodeError::Bind`] on shape mismatches or gone outputs.
    pub fn bind_ref(&mut self, name: &str, reference: &TsRef) -> Result<(), NodeError> {
        let input = self
            .input_id(name)
            .ok_or_else(|| NodeError::custom(format!("unknown input {name:?}")))?;
        self.graph.bind_reference(input, reference)?;
        Ok(())
    }

    /// Switches the named input between active and passive.
    pub fn set_active(&mut self, name: &str, active: bool) {
        if let Some(input) = self.input_id(name) {
            self.graph.set_input_active(input, active);
        }
    }

    /// The value a reference points at, assembled recursively.
    #[must_use]
    pub fn resolve(&mut self, reference: &TsRef) -> Option<Value> {
        match reference {
            TsRef::Empty => None,
            TsRef::Direct(output) => self.graph.value(*output),
            TsRef::Items(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.resolve(item)?);
                }
                Some(Value::List(values))
            }
        }
    }

    /// The named plan argument.
    #[must_use]
    pub fn arg(&self, name: &str) -> Option<Value> {
        self.graph.nodes[self.node.index()].args.get(name).cloned()
    }

    fn output_id(&self) -> Result<OutputId, NodeError> {
        self.graph
            .node_output(self.node)
            .ok_or_else(|| NodeError::custom("node has no output"))
    }

    /// Applies a value to this node's output.
    ///
    /// # Errors
    /// [`NodeError::Apply`] on type mismatch or reentrant write.
    pub fn apply(&mut self, value: impl Into<Value>) -> Result<(), NodeError> {
        let output = self.output_id()?;
        self.graph.apply(output, value.into())?;
        Ok(())
    }

    /// Applies a keyed patch to this node's dictionary output.
    ///
    /// # Errors
    /// [`NodeError::Apply`].
    pub fn apply_dict(&mut self, patch: DictPatch) -> Result<(), NodeError> {
        let output = self.output_id()?;
        self.graph.apply_dict(output, patch)?;
        Ok(())
    }

    /// Applies a membership delta to this node's set output.
    ///
    /// # Errors
    /// [`NodeError::Apply`].
    pub fn apply_set(&mut self, delta: SetDelta) -> Result<(), NodeError> {
        let output = self.output_id()?;
        self.graph.apply_set(output, delta)?;
        Ok(())
    }

    /// Invalidates this node's output.
    pub fn invalidate(&mut self) {
        if let Some(output) = self.graph.node_output(self.node) {
            self.graph.invalidate(output);
        }
    }

    /// This node's own output value, if valid.
    #[must_use]
    pub fn output(&mut self) -> Option<Value> {
        let output = self.graph.node_output(self.node)?;
        self.graph.value(output)
    }

    /// True when writing this node's output now would succeed.
    #[must_use]
    pub fn can_apply(&self) -> bool {
        self.graph
            .node_output(self.node)
            .is_some_and(|output| self.graph.can_apply(output))
    }

    /// Requests an untagged evaluation at `at`.
    ///
    /// # Errors
    /// [`ScheduleError::NotAfterNow`] unless `at` is strictly in the future.
    pub fn schedule(&mut self, at: EngineTime) -> Result<(), ScheduleError> {
        let now = self.graph.now();
        if at <= now {
            return Err(ScheduleError::NotAfterNow { requested: at, now });
        }
        self.graph.nodes[self.node.index()].sched.request(at);
        self.graph.schedule(self.node, at);
        Ok(())
    }

    /// Requests an untagged evaluation `after` from now.
    ///
    /// # Errors
    /// [`ScheduleError::NotAfterNow`] when `after` rounds to zero.
    pub fn schedule_in(&mut self, after: Duration) -> Result<(), ScheduleError> {
        self.schedule(self.graph.now().saturating_add(after))
    }

    /// Requests a tagged evaluation at `at`; re-requesting a live tag moves
    /// it (last-wins).
    ///
    /// # Errors
    /// [`ScheduleError::NotAfterNow`] unless `at` is strictly in the future.
    pub fn schedule_tagged(&mut self, tag: Tag, at: EngineTime) -> Result<(), ScheduleError> {
        let now = self.graph.now();
        if at <= now {
            return Err(ScheduleError::NotAfterNow { requested: at, now });
        }
        self.graph.nodes[self.node.index()]
            .sched
            .request_tagged(tag, at);
        self.graph.schedule(self.node, at);
        Ok(())
    }

    /// Cancels a tagged request. A stale wake may still occur; it fires no
    /// tags.
    pub fn cancel(&mut self, tag: &Tag) {
        self.graph.nodes[self.node.index()].sched.cancel(tag);
    }

    /// True when any self-schedule request fired this turn.
    #[must_use]
    pub fn fired_any(&self) -> bool {
        self.fired.any()
    }

    /// True when the given tagged request fired this turn.
    #[must_use]
    pub fn fired(&self, tag: &Tag) -> bool {
        self.fired.fired(tag)
    }

    /// Borrows this node's recordable state, if it holds a `T`.
    pub fn state<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.state.as_mut().and_then(|s| s.downcast_mut::<T>())
    }

    /// Replaces this node's recordable state.
    pub fn set_state<T: Any + Send>(&mut self, state: T) {
        *self.state = Some(Box::new(state));
    }

    /// The run-scoped resource registry.
    #[must_use]
    pub fn context(&self) -> &RunContext {
        self.context
    }

    /// Mutable access to the run-scoped resource registry.
    pub fn context_mut(&mut self) -> &mut RunContext {
        self.context
    }
}
