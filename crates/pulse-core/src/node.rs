// SPDX-License-Identifier: Apache-2.0

//! Nodes: the schedulable units of the graph.
//!
//! A node owns at most one output, a bundle of named inputs, scalar
//! arguments, a rank, and a scheduler component tracking its pending
//! self-scheduled times. Node behavior is a closed set of tagged variants
//! ([`NodeCell`]); there is no open subclassing, only one evaluation state
//! machine per tag.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::engine::EvalCtx;
use crate::ident::{InputId, OutputId, SubGraphId, Tag};
use crate::input::BindError;
use crate::map::MapState;
use crate::output::ApplyError;
use crate::push::PushState;
use crate::reduce::ReduceState;
use crate::time::EngineTime;
use crate::value::Value;

/// Errors raised by self-scheduling requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// A started node requested evaluation at or before the current time.
    /// History is never silently reordered.
    #[error("schedule request at {requested} is not after current time {now}")]
    NotAfterNow {
        /// The requested evaluation time.
        requested: EngineTime,
        /// The evaluation clock when the request was made.
        now: EngineTime,
    },
}

/// Error surfaced by a node body during start, evaluation, or stop.
#[derive(Debug, Error)]
pub enum NodeError {
    /// A value application failed.
    #[error(transparent)]
    Apply(#[from] ApplyError),
    /// A reference bind failed.
    #[error(transparent)]
    Bind(#[from] BindError),
    /// A self-schedule request failed.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    /// Domain-specific failure raised by the node body itself.
    #[error("{0}")]
    Custom(String),
}

impl NodeError {
    /// Builds a domain-specific error from any message.
    pub fn custom(msg: impl Into<String>) -> Self {
        NodeError::Custom(msg.into())
    }
}

/// The behavior of a compute node, supplied by the graph plan.
///
/// Bodies must never block; long-running work belongs on an external
/// producer thread pushing results back through a push queue.
pub trait NodeBody: Send {
    /// Called once when the node starts, before its first evaluation.
    ///
    /// # Errors
    /// A start error is treated like an evaluation error: captured or fatal
    /// depending on the node's error-capture setting.
    fn start(&mut self, ctx: &mut EvalCtx<'_>) -> Result<(), NodeError> {
        let _ = ctx;
        Ok(())
    }

    /// Called each time the node's turn comes up in a cycle.
    ///
    /// # Errors
    /// Errors are captured into the node's error output when error capture
    /// is enabled, otherwise they abort the run.
    fn eval(&mut self, ctx: &mut EvalCtx<'_>) -> Result<(), NodeError>;

    /// Called once when the node stops, in reverse start order.
    ///
    /// # Errors
    /// Stop errors abort shutdown and surface from the run.
    fn stop(&mut self, ctx: &mut EvalCtx<'_>) -> Result<(), NodeError> {
        let _ = ctx;
        Ok(())
    }
}

impl<F> NodeBody for F
where
    F: FnMut(&mut EvalCtx<'_>) -> Result<(), NodeError> + Send,
{
    fn eval(&mut self, ctx: &mut EvalCtx<'_>) -> Result<(), NodeError> {
        self(ctx)
    }
}

/// Pending self-scheduled evaluation times for one node, independent of
/// input-driven scheduling.
#[derive(Default)]
pub(crate) struct NodeSched {
    /// Tagged requests: re-requesting a tag replaces the previous time
    /// (last-wins).
    tagged: FxHashMap<Tag, EngineTime>,
    /// Untagged requests, popped in time order, FIFO among equals.
    fifo: BTreeMap<EngineTime, u32>,
}

impl NodeSched {
    /// Records an untagged request.
    pub(crate) fn request(&mut self, at: EngineTime) {
        *self.fifo.entry(at).or_insert(0) += 1;
    }

    /// Records a tagged request, replacing any previous request under the
    /// same tag. Returns the replaced time, if any.
    pub(crate) fn request_tagged(&mut self, tag: Tag, at: EngineTime) -> Option<EngineTime> {
        self.tagged.insert(tag, at)
    }

    /// Cancels a tagged request.
    pub(crate) fn cancel(&mut self, tag: &Tag) -> Option<EngineTime> {
        self.tagged.remove(tag)
    }

    /// Earliest pending time across tagged and untagged requests.
    pub(crate) fn next_due(&self) -> Option<EngineTime> {
        let fifo = self.fifo.keys().next().copied();
        let tagged = self.tagged.values().min().copied();
        match (fifo, tagged) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Removes and returns every request due exactly at `now`. Tags of the
    /// fired tagged requests come back so the body can ask which alarm rang.
    pub(crate) fn take_due(&mut self, now: EngineTime) -> Vec<Option<Tag>> {
        let mut fired = Vec::new();
        if let Some(count) = self.fifo.remove(&now) {
            for _ in 0..count {
                fired.push(None);
            }
        }
        let due: Vec<Tag> = self
            .tagged
            .iter()
            .filter(|(_, at)| **at == now)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in due {
            self.tagged.remove(&tag);
            fired.push(Some(tag));
        }
        fired
    }

    pub(crate) fn clear(&mut self) {
        self.tagged.clear();
        self.fifo.clear();
    }
}

impl fmt::Debug for NodeSched {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSched")
            .field("tagged", &self.tagged.len())
            .field("fifo", &self.fifo.len())
            .finish()
    }
}

/// Closed set of node behaviors, one evaluation state machine per tag.
pub(crate) enum NodeCell {
    /// Plan-supplied body (generators, computes, sinks).
    Compute(Box<dyn NodeBody>),
    /// Target of cross-thread push ingestion; the engine writes its output.
    Push(PushState),
    /// Map-over-keyed-collection: nested subgraph instances per key.
    Map(MapState),
    /// Reduce-over-keyed-collection: flat balanced binary reduction tree.
    Reduce(ReduceState),
    /// Sentinel while the cell is checked out for evaluation.
    Vacant,
}

impl fmt::Debug for NodeCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            NodeCell::Compute(_) => "Compute",
            NodeCell::Push(_) => "Push",
            NodeCell::Map(_) => "Map",
            NodeCell::Reduce(_) => "Reduce",
            NodeCell::Vacant => "Vacant",
        };
        f.write_str(tag)
    }
}

/// One node in the graph arena.
pub(crate) struct Node {
    pub name: Arc<str>,
    pub rank: u32,
    pub subgraph: SubGraphId,
    pub output: Option<OutputId>,
    /// Present when the node was built with error capture.
    pub error_output: Option<OutputId>,
    pub inputs: Vec<InputId>,
    pub input_names: Vec<Arc<str>>,
    pub args: BTreeMap<Arc<str>, Value>,
    pub sched: NodeSched,
    pub capture_errors: bool,
    /// Recordable state slot: restored (if provided) before the first
    /// evaluation, otherwise untouched by the core.
    pub state: Option<Box<dyn Any + Send>>,
    pub started: bool,
    pub disposed: bool,
    pub cell: NodeCell,
}

impl Node {
    /// Looks up an input id by its plan name.
    pub(crate) fn input_named(&self, name: &str) -> Option<InputId> {
        self.input_names
            .iter()
            .position(|n| &**n == name)
            .map(|i| self.inputs[i])
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("rank", &self.rank)
            .field("subgraph", &self.subgraph)
            .field("cell", &self.cell)
            .field("started", &self.started)
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}

/// Per-cycle view of which scheduler requests fired for the evaluating node.
#[derive(Debug, Default)]
pub(crate) struct FiredTags {
    pub tags: Vec<Option<Tag>>,
}

impl FiredTags {
    /// True when any request (tagged or not) fired.
    pub(crate) fn any(&self) -> bool {
        !self.tags.is_empty()
    }

    /// True when the given tag fired.
    pub(crate) fn fired(&self, tag: &Tag) -> bool {
        self.tags.iter().any(|t| t.as_ref() == Some(tag))
    }
}
