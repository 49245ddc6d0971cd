// SPDX-License-Identifier: Apache-2.0

//! Graph plans: the declarative description a run is built from.
//!
//! A plan lists nodes with ranks, output shapes, named inputs wired to
//! producer nodes (or left as stubs for nested instantiation), and per-node
//! behavior. Plans are validated once, then instantiated into the arena --
//! at startup for the top-level graph, and again at runtime for each key of
//! a map node.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::graph::Graph;
use crate::ident::{InputId, NodeId, SubGraphId};
use crate::input::{Binding, InputSlot};
use crate::map::MapState;
use crate::node::{Node, NodeBody, NodeCell, NodeSched};
use crate::push::PushState;
use crate::reduce::{ReduceOp, ReduceState};
use crate::value::{Kind, Value};

/// Declared shape of a node's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSpec {
    /// Single value of one kind.
    Scalar(Kind),
    /// Keyed dictionary of scalar values, with a derived key-set view.
    Dict(Kind),
    /// Set of keys.
    Set,
    /// Fixed-arity list of scalars.
    List {
        /// Number of elements.
        arity: usize,
        /// Element kind.
        elem: Kind,
    },
    /// Rolling window of the last `capacity` samples.
    FixedWindow {
        /// Element kind.
        elem: Kind,
        /// Samples retained.
        capacity: usize,
        /// Samples required before the window reads as valid.
        min_size: usize,
    },
    /// Rolling window bounded by an engine-time duration.
    TimeWindow {
        /// Element kind.
        elem: Kind,
        /// Age bound relative to the current time.
        duration: Duration,
        /// Run time required before the window reads as valid.
        min_window: Duration,
    },
}

/// Where an input gets its producer.
#[derive(Debug, Clone)]
pub enum InputSource {
    /// Left unbound; wired later by the instantiating map node (or by hand
    /// through a reference).
    Stub,
    /// Bound to the named node's output at instantiation.
    Node(String),
    /// Non-peer composite assembled from independently sourced children.
    Parts(Vec<InputSource>),
}

/// One named input of a planned node.
#[derive(Debug, Clone)]
pub struct InputPlan {
    pub(crate) name: Arc<str>,
    pub(crate) source: InputSource,
    pub(crate) active: bool,
    pub(crate) require_valid: bool,
    pub(crate) require_all_valid: bool,
}

impl InputPlan {
    /// An active input bound to the named producer node.
    #[must_use]
    pub fn node(name: &str, producer: &str) -> Self {
        InputPlan {
            name: Arc::from(name),
            source: InputSource::Node(producer.to_owned()),
            active: true,
            require_valid: false,
            require_all_valid: false,
        }
    }

    /// An active stub input, wired at instantiation time.
    #[must_use]
    pub fn stub(name: &str) -> Self {
        InputPlan {
            name: Arc::from(name),
            source: InputSource::Stub,
            active: true,
            require_valid: false,
            require_all_valid: false,
        }
    }

    /// A non-peer composite input assembled from child sources.
    #[must_use]
    pub fn parts(name: &str, parts: Vec<InputSource>) -> Self {
        InputPlan {
            name: Arc::from(name),
            source: InputSource::Parts(parts),
            active: true,
            require_valid: false,
            require_all_valid: false,
        }
    }

    /// Makes the input passive: readable, but it never schedules the owner.
    #[must_use]
    pub fn passive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Gates evaluation on this input being valid.
    #[must_use]
    pub fn require_valid(mut self) -> Self {
        self.require_valid = true;
        self
    }

    /// Gates evaluation on this input and all its structural children being
    /// valid.
    #[must_use]
    pub fn require_all_valid(mut self) -> Self {
        self.require_all_valid = true;
        self
    }
}

/// Behavior of a planned node.
#[derive(Clone)]
pub enum NodeKindPlan {
    /// Plan-supplied body; the factory is called once per instantiation.
    Compute(Arc<dyn Fn() -> Box<dyn NodeBody> + Send + Sync>),
    /// Ingestion target for values pushed from other threads.
    Push {
        /// Collapse multiple queued direct values into the latest per cycle.
        elide: bool,
    },
    /// One nested subgraph instance per key of the dictionary input named
    /// `keys_from`.
    Map {
        /// Plan instantiated per key.
        nested: Arc<GraphPlan>,
        /// Outer input names, in order; each key's instance gets the
        /// matching per-key child output bound to the nested stub of the
        /// same name.
        over: Vec<Arc<str>>,
        /// Value kind of the per-key results dictionary.
        value_kind: Kind,
    },
    /// Incremental reduction over a dictionary input's values.
    Reduce {
        /// Associative combine step.
        op: Arc<ReduceOp>,
        /// Identity element; also the result when the dictionary is empty.
        zero: Value,
    },
}

impl fmt::Debug for NodeKindPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKindPlan::Compute(_) => f.write_str("Compute"),
            NodeKindPlan::Push { elide } => f.debug_struct("Push").field("elide", elide).finish(),
            NodeKindPlan::Map { over, .. } => {
                f.debug_struct("Map").field("over", over).finish_non_exhaustive()
            }
            NodeKindPlan::Reduce { zero, .. } => {
                f.debug_struct("Reduce").field("zero", zero).finish_non_exhaustive()
            }
        }
    }
}

/// One planned node.
#[derive(Debug, Clone)]
pub struct NodePlan {
    pub(crate) name: Arc<str>,
    pub(crate) rank: u32,
    pub(crate) kind: NodeKindPlan,
    pub(crate) output: Option<OutputSpec>,
    pub(crate) inputs: Vec<InputPlan>,
    pub(crate) args: BTreeMap<Arc<str>, Value>,
    pub(crate) capture_errors: bool,
}

impl NodePlan {
    /// A compute node with the given body factory.
    pub fn compute<F, B>(name: &str, rank: u32, body: F) -> Self
    where
        F: Fn() -> B + Send + Sync + 'static,
        B: NodeBody + 'static,
    {
        NodePlan {
            name: Arc::from(name),
            rank,
            kind: NodeKindPlan::Compute(Arc::new(move || Box::new(body()))),
            output: None,
            inputs: Vec::new(),
            args: BTreeMap::new(),
            capture_errors: false,
        }
    }

    /// A push ingestion node with the given output shape.
    #[must_use]
    pub fn push(name: &str, rank: u32, output: OutputSpec) -> Self {
        NodePlan {
            name: Arc::from(name),
            rank,
            kind: NodeKindPlan::Push { elide: false },
            output: Some(output),
            inputs: Vec::new(),
            args: BTreeMap::new(),
            capture_errors: false,
        }
    }

    /// A map node instantiating `nested` per key. The `over` list names this
    /// node's dictionary inputs; the key set is the union of their keys, and
    /// each nested instance gets its same-named stubs bound to that key's
    /// child outputs.
    #[must_use]
    pub fn map(name: &str, rank: u32, nested: Arc<GraphPlan>, over: &[&str], value_kind: Kind) -> Self {
        NodePlan {
            name: Arc::from(name),
            rank,
            kind: NodeKindPlan::Map {
                nested,
                over: over.iter().map(|s| Arc::from(*s)).collect(),
                value_kind,
            },
            output: Some(OutputSpec::Dict(value_kind)),
            inputs: Vec::new(),
            args: BTreeMap::new(),
            capture_errors: false,
        }
    }

    /// A reduce node combining a dictionary input's values with `op`.
    pub fn reduce<F>(name: &str, rank: u32, zero: Value, op: F) -> Self
    where
        F: Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    {
        let kind = zero.kind();
        NodePlan {
            name: Arc::from(name),
            rank,
            kind: NodeKindPlan::Reduce {
                op: Arc::new(op),
                zero,
            },
            output: Some(OutputSpec::Scalar(kind)),
            inputs: Vec::new(),
            args: BTreeMap::new(),
            capture_errors: false,
        }
    }

    /// Declares the node's output shape.
    #[must_use]
    pub fn with_output(mut self, spec: OutputSpec) -> Self {
        self.output = Some(spec);
        self
    }

    /// Adds an input.
    #[must_use]
    pub fn with_input(mut self, input: InputPlan) -> Self {
        self.inputs.push(input);
        self
    }

    /// Sets a named scalar argument, readable by the body at evaluation.
    #[must_use]
    pub fn with_arg(mut self, name: &str, value: Value) -> Self {
        self.args.insert(Arc::from(name), value);
        self
    }

    /// Captures body errors into a string error output instead of aborting
    /// the run.
    #[must_use]
    pub fn capture_errors(mut self) -> Self {
        self.capture_errors = true;
        self
    }

    /// Collapse queued push values to the latest per cycle (push nodes only).
    #[must_use]
    pub fn elide(mut self) -> Self {
        if let NodeKindPlan::Push { elide } = &mut self.kind {
            *elide = true;
        }
        self
    }
}

/// Errors detected when validating a plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// Two nodes share a name.
    #[error("duplicate node name {0:?}")]
    DuplicateNode(String),
    /// An input names a producer that is not in the plan.
    #[error("node {node:?} input {input:?} references unknown producer {producer:?}")]
    UnknownProducer {
        /// Consumer node.
        node: String,
        /// Input name.
        input: String,
        /// Missing producer name.
        producer: String,
    },
    /// The named producer has no output to bind to.
    #[error("node {node:?} input {input:?} references {producer:?}, which has no output")]
    ProducerHasNoOutput {
        /// Consumer node.
        node: String,
        /// Input name.
        input: String,
        /// Producer name.
        producer: String,
    },
    /// An active input's producer does not rank strictly before its consumer.
    #[error("producer {producer:?} (rank {producer_rank}) does not precede consumer {consumer:?} (rank {consumer_rank})")]
    RankOrder {
        /// Producer name.
        producer: String,
        /// Producer rank.
        producer_rank: u32,
        /// Consumer name.
        consumer: String,
        /// Consumer rank.
        consumer_rank: u32,
    },
    /// A nested map plan does not name its result node.
    #[error("map node {0:?} has a nested plan without an output node")]
    NestedOutputMissing(String),
    /// A map's `over` list names an input the node does not declare.
    #[error("map node {node:?} maps over undeclared input {input:?}")]
    MapInputMissing {
        /// Map node name.
        node: String,
        /// Missing input name.
        input: String,
    },
    /// Two stub inputs share a name; nested wiring is by stub name.
    #[error("duplicate stub input name {0:?}")]
    DuplicateStub(String),
}

/// A validated, immutable description of a graph.
#[derive(Debug, Clone, Default)]
pub struct GraphPlan {
    pub(crate) nodes: Vec<NodePlan>,
    /// In nested plans: the node whose output is copied into the map
    /// node's per-key result.
    pub(crate) output_node: Option<Arc<str>>,
}

impl GraphPlan {
    /// Creates an empty plan.
    #[must_use]
    pub fn new() -> Self {
        GraphPlan::default()
    }

    /// Adds a node.
    #[must_use]
    pub fn with_node(mut self, node: NodePlan) -> Self {
        self.nodes.push(node);
        self
    }

    /// Names the result node of a nested plan.
    #[must_use]
    pub fn with_output_node(mut self, name: &str) -> Self {
        self.output_node = Some(Arc::from(name));
        self
    }

    /// Checks internal consistency: unique names, known producers, rank
    /// ordering, map/stub constraints.
    ///
    /// # Errors
    /// The first [`PlanError`] found.
    pub fn validate(&self) -> Result<(), PlanError> {
        let mut by_name: FxHashMap<&str, &NodePlan> = FxHashMap::default();
        for node in &self.nodes {
            if by_name.insert(&node.name, node).is_some() {
                return Err(PlanError::DuplicateNode(node.name.to_string()));
            }
        }
        let mut stubs: FxHashMap<&str, ()> = FxHashMap::default();
        for node in &self.nodes {
            for input in &node.inputs {
                Self::validate_source(&by_name, node, input, &input.source, &mut stubs)?;
            }
            if let NodeKindPlan::Map { nested, over, .. } = &node.kind {
                if nested.output_node.is_none() {
                    return Err(PlanError::NestedOutputMissing(node.name.to_string()));
                }
                nested.validate()?;
                for name in over {
                    if !node.inputs.iter().any(|i| i.name == *name) {
                        return Err(PlanError::MapInputMissing {
                            node: node.name.to_string(),
                            input: name.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_source<'a>(
        by_name: &FxHashMap<&str, &NodePlan>,
        node: &NodePlan,
        input: &'a InputPlan,
        source: &InputSource,
        stubs: &mut FxHashMap<&'a str, ()>,
    ) -> Result<(), PlanError> {
        match source {
            InputSource::Stub => {
                // Only top-level (peer) stubs participate in nested wiring.
                if matches!(input.source, InputSource::Stub)
                    && stubs.insert(&input.name, ()).is_some()
                {
                    return Err(PlanError::DuplicateStub(input.name.to_string()));
                }
                Ok(())
            }
            InputSource::Node(producer) => {
                let Some(p) = by_name.get(producer.as_str()) else {
                    return Err(PlanError::UnknownProducer {
                        node: node.name.to_string(),
                        input: input.name.to_string(),
                        producer: producer.clone(),
                    });
                };
                if p.output.is_none() {
                    return Err(PlanError::ProducerHasNoOutput {
                        node: node.name.to_string(),
                        input: input.name.to_string(),
                        producer: producer.clone(),
                    });
                }
                if input.active && p.rank >= node.rank {
                    return Err(PlanError::RankOrder {
                        producer: producer.clone(),
                        producer_rank: p.rank,
                        consumer: node.name.to_string(),
                        consumer_rank: node.rank,
                    });
                }
                Ok(())
            }
            InputSource::Parts(parts) => {
                for part in parts {
                    Self::validate_source(by_name, node, input, part, stubs)?;
                }
                Ok(())
            }
        }
    }
}

/// Result of instantiating a plan into a subgraph.
#[derive(Debug)]
pub(crate) struct Instantiated {
    /// Node ids by plan name.
    pub nodes: FxHashMap<Arc<str>, NodeId>,
    /// Unbound stub inputs by input name, for nested wiring.
    pub stubs: FxHashMap<Arc<str>, InputId>,
    /// Id of the plan's named output node, when one is declared.
    pub output_node: Option<NodeId>,
}

impl GraphPlan {
    /// Builds the plan's nodes into `subgraph`, creating outputs first and
    /// wiring inputs second so forward references resolve.
    ///
    /// # Errors
    /// [`PlanError`] when a producer lookup fails; callers validate first,
    /// so this is unreachable for validated plans.
    pub(crate) fn instantiate(
        &self,
        graph: &mut Graph,
        subgraph: SubGraphId,
    ) -> Result<Instantiated, PlanError> {
        let mut nodes: FxHashMap<Arc<str>, NodeId> = FxHashMap::default();
        let mut stubs: FxHashMap<Arc<str>, InputId> = FxHashMap::default();

        let mut ordered: Vec<&NodePlan> = self.nodes.iter().collect();
        ordered.sort_by_key(|n| n.rank);

        for plan in &ordered {
            let cell = match &plan.kind {
                NodeKindPlan::Compute(factory) => NodeCell::Compute(factory()),
                NodeKindPlan::Push { elide } => NodeCell::Push(PushState { elide: *elide }),
                NodeKindPlan::Map {
                    nested,
                    over,
                    value_kind,
                } => NodeCell::Map(MapState::new(
                    Arc::clone(nested),
                    over.clone(),
                    *value_kind,
                )),
                NodeKindPlan::Reduce { op, zero } => {
                    NodeCell::Reduce(ReduceState::new(Arc::clone(op), zero.clone()))
                }
            };
            let node_id = graph.add_node(Node {
                name: Arc::clone(&plan.name),
                rank: plan.rank,
                subgraph,
                output: None,
                error_output: None,
                inputs: Vec::new(),
                input_names: Vec::new(),
                args: plan.args.clone(),
                sched: NodeSched::default(),
                capture_errors: plan.capture_errors,
                state: None,
                started: false,
                disposed: false,
                cell,
            });
            if let Some(spec) = &plan.output {
                let output = graph.add_output(node_id, spec);
                graph.nodes[node_id.index()].output = Some(output);
            }
            if plan.capture_errors {
                let error_output = graph.add_output(node_id, &OutputSpec::Scalar(Kind::Str));
                graph.nodes[node_id.index()].error_output = Some(error_output);
            }
            nodes.insert(Arc::clone(&plan.name), node_id);
        }

        for plan in &ordered {
            let node_id = nodes[&plan.name];
            for input_plan in &plan.inputs {
                let input =
                    Self::build_input(graph, node_id, plan, input_plan, &input_plan.source, &nodes)?;
                {
                    let slot = &mut graph.inputs[input.index()];
                    slot.require_valid = input_plan.require_valid;
                    slot.require_all_valid = input_plan.require_all_valid;
                }
                if matches!(input_plan.source, InputSource::Stub) {
                    stubs.insert(Arc::clone(&input_plan.name), input);
                }
                let node = &mut graph.nodes[node_id.index()];
                node.inputs.push(input);
                node.input_names.push(Arc::clone(&input_plan.name));
            }
        }

        let output_node = self
            .output_node
            .as_ref()
            .and_then(|name| nodes.get(name).copied());
        Ok(Instantiated {
            nodes,
            stubs,
            output_node,
        })
    }

    fn build_input(
        graph: &mut Graph,
        owner: NodeId,
        plan: &NodePlan,
        input_plan: &InputPlan,
        source: &InputSource,
        nodes: &FxHashMap<Arc<str>, NodeId>,
    ) -> Result<InputId, PlanError> {
        match source {
            InputSource::Stub => Ok(graph.add_input(InputSlot::new(owner, input_plan.active))),
            InputSource::Node(producer) => {
                let input = graph.add_input(InputSlot::new(owner, input_plan.active));
                let producer_id =
                    nodes
                        .get(producer.as_str())
                        .copied()
                        .ok_or_else(|| PlanError::UnknownProducer {
                            node: plan.name.to_string(),
                            input: input_plan.name.to_string(),
                            producer: producer.clone(),
                        })?;
                let output = graph.node_output(producer_id).ok_or_else(|| {
                    PlanError::ProducerHasNoOutput {
                        node: plan.name.to_string(),
                        input: input_plan.name.to_string(),
                        producer: producer.clone(),
                    }
                })?;
                graph
                    .bind_input(input, output)
                    .map_err(|_| PlanError::UnknownProducer {
                        node: plan.name.to_string(),
                        input: input_plan.name.to_string(),
                        producer: producer.clone(),
                    })?;
                Ok(input)
            }
            InputSource::Parts(parts) => {
                let mut children = Vec::with_capacity(parts.len());
                for part in parts {
                    let child = Self::build_input(graph, owner, plan, input_plan, part, nodes)?;
                    children.push(child);
                }
                let composite = graph.add_input(InputSlot::new(owner, input_plan.active));
                for child in &children {
                    graph.inputs[child.index()].parent = Some(composite);
                }
                graph.inputs[composite.index()].binding = Binding::Children(children);
                Ok(composite)
            }
        }
    }
}
