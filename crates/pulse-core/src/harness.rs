// SPDX-License-Identifier: Apache-2.0

//! Single-node test harness.
//!
//! Wraps one node plan in a minimal graph where every input is fed by a
//! push node, so a body can be exercised cycle by cycle without building a
//! full plan: set inputs, step, inspect the output and its delta.

use crate::delta::{DictPatch, SetDelta, TsDelta};
use crate::engine::{Engine, EngineConfig, EngineError};
use crate::plan::{GraphPlan, InputPlan, InputSource, NodePlan, OutputSpec};
use crate::push::PushHandle;
use crate::time::EngineTime;
use crate::value::Value;

use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Drives a single node under test.
pub struct NodeHarness {
    engine: Engine,
    node: Arc<str>,
    feeds: FxHashMap<Arc<str>, PushHandle>,
}

impl NodeHarness {
    /// Builds a harness for `node`. Each `(input, shape)` pair in `feeds`
    /// becomes a push node wired to the same-named input; inputs not listed
    /// keep their declared sources (stubs stay unbound).
    ///
    /// # Errors
    /// [`EngineError::Plan`] when the assembled graph fails validation.
    pub fn new(node: NodePlan, feeds: &[(&str, OutputSpec)]) -> Result<Self, EngineError> {
        let mut node = node;
        node.rank = node.rank.max(1);
        let mut plan = GraphPlan::new();
        let mut feed_names: Vec<(Arc<str>, String)> = Vec::new();
        for (input, shape) in feeds {
            let feed = format!("{input}.feed");
            plan = plan.with_node(NodePlan::push(&feed, 0, shape.clone()));
            feed_names.push((Arc::from(*input), feed));
        }
        for input in &mut node.inputs {
            if let Some((_, feed)) = feed_names.iter().find(|(name, _)| *name == input.name) {
                input.source = InputSource::Node(feed.clone());
            }
        }
        // Inputs listed as feeds but not declared on the node are added as
        // plain active inputs, so simple closures need no boilerplate.
        for (name, feed) in &feed_names {
            if !node.inputs.iter().any(|i| i.name == *name) {
                node.inputs.push(InputPlan::node(name, feed));
            }
        }
        let name = Arc::clone(&node.name);
        plan = plan.with_node(node);
        let engine = Engine::new(&plan, EngineConfig::default())?;
        let mut handles = FxHashMap::default();
        for (input, feed) in feed_names {
            handles.insert(input, engine.push_handle(&feed)?);
        }
        Ok(NodeHarness {
            engine,
            node: name,
            feeds: handles,
        })
    }

    /// Queues a value on the named input's feed for the next cycle.
    pub fn set_input(&mut self, name: &str, value: impl Into<Value>) {
        if let Some(feed) = self.feeds.get(name) {
            feed.push(value.into());
        }
    }

    /// Queues a dictionary patch on the named input's feed.
    pub fn set_input_dict(&mut self, name: &str, patch: DictPatch) {
        if let Some(feed) = self.feeds.get(name) {
            feed.push_dict(patch);
        }
    }

    /// Queues a set delta on the named input's feed.
    pub fn set_input_set(&mut self, name: &str, delta: SetDelta) {
        if let Some(feed) = self.feeds.get(name) {
            feed.push_set(delta);
        }
    }

    /// Runs one cycle; returns its time, or `None` when nothing was due.
    ///
    /// # Errors
    /// [`EngineError::Node`] for uncaptured node failures.
    pub fn step(&mut self) -> Result<Option<EngineTime>, EngineError> {
        self.engine.step()
    }

    /// Steps until the engine goes idle.
    ///
    /// # Errors
    /// [`EngineError::Node`] for uncaptured node failures.
    pub fn settle(&mut self) -> Result<(), EngineError> {
        while self.engine.step()?.is_some() {}
        Ok(())
    }

    /// The node under test's current output value.
    #[must_use]
    pub fn output_value(&mut self) -> Option<Value> {
        let node = self.engine.graph().node_by_name(&self.node)?;
        let output = self.engine.graph().node_output(node)?;
        self.engine.graph_mut().value(output)
    }

    /// The node under test's delta for the last stepped cycle.
    #[must_use]
    pub fn output_delta(&mut self) -> Option<TsDelta> {
        let node = self.engine.graph().node_by_name(&self.node)?;
        let output = self.engine.graph().node_output(node)?;
        self.engine.graph_mut().delta_value(output)
    }

    /// The node under test's captured error message, if any.
    #[must_use]
    pub fn error_value(&mut self) -> Option<Value> {
        let node = self.engine.graph().node_by_name(&self.node)?;
        let output = self.engine.graph().node_error_output(node)?;
        self.engine.graph_mut().value(output)
    }

    /// The underlying engine, for anything the shortcuts do not cover.
    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }
}
