// SPDX-License-Identifier: Apache-2.0

//! Per-key nested instances behind a map node.
//!
//! A map node watches the key union of its mapped dictionary inputs. Each
//! key owns one instance of the nested plan in its own subgraph: the
//! instance's stubs are bound to that key's child outputs (or to never-valid
//! phantom outputs where a key is absent from some input), its result node
//! feeds the map's per-key output dictionary, and key removal stops and
//! disposes the whole instance. Instance nodes share the top-level arena;
//! only scheduling is partitioned.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::graph::Graph;
use crate::ident::{InputId, NodeId, OutputId, SubGraphId};
use crate::node::NodeError;
use crate::plan::GraphPlan;
use crate::value::{Key, Kind};

/// One live per-key instance.
#[derive(Debug)]
pub(crate) struct MapInstance {
    /// The instance's scheduling partition.
    pub sub: SubGraphId,
    /// Instance nodes in rank order; stopped in reverse.
    pub nodes: Vec<NodeId>,
    /// Output of the nested plan's result node.
    pub sink: OutputId,
    /// Never-valid placeholders created for inputs missing this key.
    pub phantoms: Vec<OutputId>,
}

/// State of a map node.
pub(crate) struct MapState {
    nested: Arc<GraphPlan>,
    /// Outer dictionary input names mapped per key.
    over: Vec<Arc<str>>,
    value_kind: Kind,
    pub(crate) instances: BTreeMap<Key, MapInstance>,
}

impl std::fmt::Debug for MapState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapState")
            .field("over", &self.over)
            .field("instances", &self.instances.len())
            .finish_non_exhaustive()
    }
}

impl MapState {
    pub(crate) fn new(nested: Arc<GraphPlan>, over: Vec<Arc<str>>, value_kind: Kind) -> Self {
        MapState {
            nested,
            over,
            value_kind,
            instances: BTreeMap::new(),
        }
    }

    /// The union of keys across the mapped dictionary inputs, as currently
    /// bound.
    pub(crate) fn desired_keys(&self, graph: &Graph, node: NodeId) -> BTreeSet<Key> {
        let mut keys = BTreeSet::new();
        for name in &self.over {
            let Some(input) = graph.nodes[node.index()].input_named(name) else {
                continue;
            };
            let Some(output) = graph.inputs[input.index()].peer() else {
                continue;
            };
            if !graph.valid(output) {
                continue;
            }
            keys.extend(graph.dict_keys(output));
        }
        keys
    }

    /// Keys whose instances must be created and keys whose instances must
    /// be torn down, against the current instance table.
    pub(crate) fn diff(&self, desired: &BTreeSet<Key>) -> (Vec<Key>, Vec<Key>) {
        let new = desired
            .iter()
            .filter(|k| !self.instances.contains_key(*k))
            .cloned()
            .collect();
        let gone = self
            .instances
            .keys()
            .filter(|k| !desired.contains(*k))
            .cloned()
            .collect();
        (new, gone)
    }

    /// Instantiates the nested plan for `key` in a fresh subgraph and wires
    /// its stubs: mapped inputs get the key's child output (or a phantom
    /// when the key is absent from that input), other stub names matching an
    /// outer input are broadcast the outer producer directly.
    ///
    /// # Errors
    /// [`NodeError`] when stub wiring fails; validated plans only fail here
    /// if an outer input is unexpectedly unbound.
    pub(crate) fn create_instance(
        &mut self,
        graph: &mut Graph,
        node: NodeId,
        key: &Key,
    ) -> Result<Vec<NodeId>, NodeError> {
        let sub = graph.add_subgraph(node);
        let instantiated = self
            .nested
            .instantiate(graph, sub)
            .map_err(|e| NodeError::custom(e.to_string()))?;

        let outer: FxHashMap<Arc<str>, InputId> = {
            let n = &graph.nodes[node.index()];
            n.input_names
                .iter()
                .cloned()
                .zip(n.inputs.iter().copied())
                .collect()
        };

        let mut phantoms = Vec::new();
        for (name, stub) in &instantiated.stubs {
            let Some(&outer_input) = outer.get(name) else {
                continue;
            };
            let Some(outer_output) = graph.inputs[outer_input.index()].peer() else {
                continue;
            };
            let target = if self.over.contains(name) {
                match graph.dict_child_output(outer_output, key) {
                    Some(child) => child,
                    None => {
                        let kind = graph
                            .dict_value_kind(outer_output)
                            .unwrap_or(self.value_kind);
                        let phantom = graph.add_phantom_output(node, kind);
                        phantoms.push(phantom);
                        phantom
                    }
                }
            } else {
                outer_output
            };
            graph.bind_input(*stub, target)?;
        }

        let sink = instantiated
            .output_node
            .and_then(|n| graph.node_output(n))
            .ok_or_else(|| NodeError::custom("nested plan has no result output"))?;

        let mut nodes: Vec<NodeId> = instantiated.nodes.values().copied().collect();
        nodes.sort_by_key(|id| graph.nodes[id.index()].rank);

        self.instances.insert(
            key.clone(),
            MapInstance {
                sub,
                nodes: nodes.clone(),
                sink,
                phantoms,
            },
        );
        Ok(nodes)
    }

    /// Removes the instance table entry for `key`, returning it for
    /// teardown (stop hooks run first, then disposal).
    pub(crate) fn take_instance(&mut self, key: &Key) -> Option<MapInstance> {
        self.instances.remove(key)
    }

    /// Disposes an instance's nodes and phantom outputs. Stop hooks must
    /// already have run, in reverse start order.
    pub(crate) fn dispose_instance(graph: &mut Graph, instance: &MapInstance) {
        for node in instance.nodes.iter().rev() {
            graph.dispose_node(*node);
        }
        for phantom in &instance.phantoms {
            graph.dispose_output(*phantom);
        }
    }
}
