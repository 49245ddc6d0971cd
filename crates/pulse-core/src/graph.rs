// SPDX-License-Identifier: Apache-2.0

//! The graph arena and its mutation/read paths.
//!
//! All outputs, inputs, and nodes live in flat arenas owned by the top-level
//! `Graph` and are addressed by integer ids; composite ownership and nested
//! subgraphs are explicit index fields, never shared pointers. Every value
//! mutation funnels through the apply methods here, which stamp
//! modification, maintain collection deltas, notify subscribers, and
//! propagate child changes one level up per nesting level.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::delta::{DictDelta, DictOp, DictPatch, SetDelta, TsDelta, WindowDelta};
use crate::ident::{InputId, NodeId, OutputId, SubGraphId};
use crate::input::{BindError, Binding, InputSlot};
use crate::node::Node;
use crate::output::{
    ApplyError, ChildSlot, DictPayload, ListPayload, OutputSlot, ParentLink, Payload, SetPayload,
};
use crate::plan::OutputSpec;
use crate::reference::TsRef;
use crate::time::EngineTime;
use crate::value::{Key, Kind, Value};
use crate::window::{FixedWindow, TimeWindow, WindowPayload};

/// One subgraph partition: the top-level graph or a nested per-key instance.
#[derive(Debug, Default)]
pub(crate) struct SubGraph {
    /// Owning map node, for nested instances.
    pub parent: Option<NodeId>,
    /// Member nodes in rank order.
    pub nodes: Vec<NodeId>,
    /// Pending evaluations: time -> (rank, node), drained in rank order.
    pub pending: BTreeMap<EngineTime, BTreeSet<(u32, NodeId)>>,
}

/// The arena of nodes, inputs, and outputs plus the evaluation clock.
#[derive(Debug)]
pub struct Graph {
    pub(crate) outputs: Vec<OutputSlot>,
    pub(crate) inputs: Vec<InputSlot>,
    pub(crate) nodes: Vec<Node>,
    pub(crate) subgraphs: Vec<SubGraph>,
    pub(crate) now: EngineTime,
    pub(crate) start_time: EngineTime,
    /// Outputs with a one-cycle `removed` batch to reset at cycle end.
    pub(crate) cleanup: Vec<OutputId>,
    /// Top-level node names (nested instance nodes are not registered).
    pub(crate) names: FxHashMap<Arc<str>, NodeId>,
    /// Set while a node is being evaluated; used to decide whether a wake
    /// can still land in the current cycle.
    pub(crate) evaluating: Option<(u32, NodeId)>,
}

impl Graph {
    pub(crate) fn new(start_time: EngineTime) -> Self {
        Graph {
            outputs: Vec::new(),
            inputs: Vec::new(),
            nodes: Vec::new(),
            subgraphs: vec![SubGraph::default()],
            now: EngineTime::ZERO,
            start_time,
            cleanup: Vec::new(),
            names: FxHashMap::default(),
            evaluating: None,
        }
    }

    /// Current evaluation time (`EngineTime::ZERO` before the first cycle).
    #[must_use]
    pub fn now(&self) -> EngineTime {
        self.now
    }

    /// The run's start time.
    #[must_use]
    pub fn start_time(&self) -> EngineTime {
        self.start_time
    }

    /// Looks up a top-level node by plan name.
    #[must_use]
    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    /// The node's value output, if it owns one.
    #[must_use]
    pub fn node_output(&self, node: NodeId) -> Option<OutputId> {
        self.nodes.get(node.0 as usize).and_then(|n| n.output)
    }

    /// The node's error output, when it was built with error capture.
    #[must_use]
    pub fn node_error_output(&self, node: NodeId) -> Option<OutputId> {
        self.nodes.get(node.0 as usize).and_then(|n| n.error_output)
    }

    // ------------------------------------------------------------------
    // Arena construction (used by the plan loader and the map machinery)
    // ------------------------------------------------------------------

    pub(crate) fn add_subgraph(&mut self, parent: NodeId) -> SubGraphId {
        let id = SubGraphId(u32::try_from(self.subgraphs.len()).unwrap_or(u32::MAX));
        self.subgraphs.push(SubGraph {
            parent: Some(parent),
            ..SubGraph::default()
        });
        id
    }

    pub(crate) fn add_node(&mut self, node: Node) -> NodeId {
        let id = NodeId(u32::try_from(self.nodes.len()).unwrap_or(u32::MAX));
        let sub = node.subgraph;
        if sub == SubGraphId::ROOT {
            self.names.insert(Arc::clone(&node.name), id);
        }
        self.subgraphs[sub.0 as usize].nodes.push(id);
        self.nodes.push(node);
        id
    }

    pub(crate) fn add_input(&mut self, slot: InputSlot) -> InputId {
        let id = InputId(u32::try_from(self.inputs.len()).unwrap_or(u32::MAX));
        self.inputs.push(slot);
        id
    }

    /// Builds an output (and any derived/child outputs) for `owner` from a
    /// plan-level shape spec.
    pub(crate) fn add_output(&mut self, owner: NodeId, spec: &OutputSpec) -> OutputId {
        match spec {
            OutputSpec::Scalar(kind) => self.push_output(OutputSlot::new(
                owner,
                Payload::Scalar {
                    kind: *kind,
                    value: None,
                },
            )),
            OutputSpec::Dict(value_kind) => {
                let key_set =
                    self.push_output(OutputSlot::new(owner, Payload::Set(SetPayload::default())));
                self.push_output(OutputSlot::new(
                    owner,
                    Payload::Dict(DictPayload::new(*value_kind, key_set)),
                ))
            }
            OutputSpec::Set => {
                self.push_output(OutputSlot::new(owner, Payload::Set(SetPayload::default())))
            }
            OutputSpec::List { arity, elem } => {
                let list = self.push_output(OutputSlot::new(
                    owner,
                    Payload::List(ListPayload {
                        elem: *elem,
                        children: Vec::new(),
                    }),
                ));
                let mut children = Vec::with_capacity(*arity);
                for index in 0..*arity {
                    let child = self.push_output(OutputSlot::new(
                        owner,
                        Payload::Scalar {
                            kind: *elem,
                            value: None,
                        },
                    ));
                    self.outputs[child.0 as usize].parent = Some(ParentLink {
                        parent: list,
                        slot: ChildSlot::Index(index),
                    });
                    children.push(child);
                }
                if let Payload::List(list_payload) = &mut self.outputs[list.0 as usize].payload {
                    list_payload.children = children;
                }
                list
            }
            OutputSpec::FixedWindow {
                elem,
                capacity,
                min_size,
            } => self.push_output(OutputSlot::new(
                owner,
                Payload::Window(WindowPayload::Fixed(FixedWindow::new(
                    *elem, *capacity, *min_size,
                ))),
            )),
            OutputSpec::TimeWindow {
                elem,
                duration,
                min_window,
            } => self.push_output(OutputSlot::new(
                owner,
                Payload::Window(WindowPayload::Timed(TimeWindow::new(
                    *elem,
                    *duration,
                    *min_window,
                ))),
            )),
        }
    }

    fn push_output(&mut self, slot: OutputSlot) -> OutputId {
        let id = OutputId(u32::try_from(self.outputs.len()).unwrap_or(u32::MAX));
        self.outputs.push(slot);
        id
    }

    /// Creates a never-valid placeholder output for keys absent from some
    /// inputs of a map node.
    pub(crate) fn add_phantom_output(&mut self, owner: NodeId, kind: Kind) -> OutputId {
        self.push_output(OutputSlot::new(
            owner,
            Payload::Scalar { kind, value: None },
        ))
    }

    // ------------------------------------------------------------------
    // Binding
    // ------------------------------------------------------------------

    /// Binds `input` to `output`, preserving the input's active/passive
    /// state.
    ///
    /// If the output is currently valid, the input's owner is woken so it
    /// observes the newly visible value.
    ///
    /// # Errors
    /// Returns [`BindError::ShapeMismatch`] for non-peer composite inputs
    /// and [`BindError::OutputGone`] for disposed outputs.
    pub fn bind_input(&mut self, input: InputId, output: OutputId) -> Result<(), BindError> {
        let slot = self
            .inputs
            .get(input.0 as usize)
            .ok_or(BindError::InputGone)?;
        if matches!(slot.binding, Binding::Children(_)) {
            return Err(BindError::ShapeMismatch);
        }
        let out_ok = self
            .outputs
            .get(output.0 as usize)
            .is_some_and(|o| !o.disposed);
        if !out_ok {
            return Err(BindError::OutputGone);
        }
        let active = slot.active;
        if let Binding::Peer(old) = slot.binding {
            // Rebinding to the same output is a no-op, not a fresh wake.
            if old == output {
                return Ok(());
            }
            if active {
                self.outputs[old.0 as usize].unsubscribe(input);
            }
        }
        let slot = &mut self.inputs[input.0 as usize];
        slot.binding = Binding::Peer(output);
        if active {
            self.outputs[output.0 as usize].subscribe(input);
        }
        if self.outputs[output.0 as usize].valid {
            let owner = self.inputs[input.0 as usize].owner;
            self.wake(owner);
        }
        Ok(())
    }

    /// Unbinds `input`. For non-peer composites this recursively unbinds
    /// every child while keeping the composite shape.
    ///
    /// Unbinding a previously valid active input wakes the owner so it
    /// observes the transition to unbound.
    pub fn unbind_input(&mut self, input: InputId) {
        let Some(slot) = self.inputs.get(input.0 as usize) else {
            return;
        };
        match slot.binding.clone() {
            Binding::Unbound => {}
            Binding::Peer(output) => {
                let active = slot.active;
                let owner = slot.owner;
                let was_valid = self
                    .outputs
                    .get(output.0 as usize)
                    .is_some_and(|o| o.valid && !o.disposed);
                if let Some(out) = self.outputs.get_mut(output.0 as usize) {
                    out.unsubscribe(input);
                }
                self.inputs[input.0 as usize].binding = Binding::Unbound;
                if active && was_valid {
                    self.wake(owner);
                }
            }
            Binding::Children(children) => {
                for child in children {
                    self.unbind_input(child);
                }
            }
        }
    }

    /// Switches an input between active and passive, maintaining the bound
    /// output's subscriber list.
    pub fn set_input_active(&mut self, input: InputId, active: bool) {
        let Some(slot) = self.inputs.get(input.0 as usize) else {
            return;
        };
        if slot.active == active {
            return;
        }
        let peer = slot.peer();
        self.inputs[input.0 as usize].active = active;
        if let Some(output) = peer {
            if let Some(out) = self.outputs.get_mut(output.0 as usize) {
                if active {
                    out.subscribe(input);
                } else {
                    out.unsubscribe(input);
                }
            }
        }
    }

    /// Builds a reference describing `input`'s current binding.
    #[must_use]
    pub fn reference_for_input(&self, input: InputId) -> TsRef {
        let Some(slot) = self.inputs.get(input.0 as usize) else {
            return TsRef::Empty;
        };
        match &slot.binding {
            Binding::Unbound => TsRef::Empty,
            Binding::Peer(output) => TsRef::Direct(*output),
            Binding::Children(children) => TsRef::Items(
                children
                    .iter()
                    .map(|c| self.reference_for_input(*c))
                    .collect(),
            ),
        }
    }

    /// Rebinds `target` according to `reference` (see [`TsRef::bind`]).
    ///
    /// # Errors
    /// Returns [`BindError`] on shape mismatches or disposed outputs.
    pub fn bind_reference(&mut self, target: InputId, reference: &TsRef) -> Result<(), BindError> {
        match reference {
            TsRef::Empty => {
                self.unbind_input(target);
                Ok(())
            }
            TsRef::Direct(output) => self.bind_input(target, *output),
            TsRef::Items(items) => {
                let children = match &self
                    .inputs
                    .get(target.0 as usize)
                    .ok_or(BindError::InputGone)?
                    .binding
                {
                    Binding::Children(children) => children.clone(),
                    _ => return Err(BindError::ShapeMismatch),
                };
                if items.len() > children.len() {
                    return Err(BindError::TooManyChildren {
                        expected: children.len(),
                        found: items.len(),
                    });
                }
                for (index, child) in children.iter().enumerate() {
                    if let Some(item) = items.get(index) {
                        self.bind_reference(*child, item)?;
                    } else {
                        self.unbind_input(*child);
                    }
                }
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Apply paths
    // ------------------------------------------------------------------

    /// Pre-check: can `output` accept a direct write this cycle?
    #[must_use]
    pub fn can_apply(&self, output: OutputId) -> bool {
        self.outputs
            .get(output.0 as usize)
            .is_some_and(|o| o.can_apply(self.now))
    }

    /// Applies a value to a scalar, list, or window output.
    ///
    /// # Errors
    /// - [`ApplyError::TypeMismatch`] when the value's kind differs from the
    ///   output's declared kind;
    /// - [`ApplyError::AlreadyModified`] on a second write in one cycle;
    /// - [`ApplyError::WrongPayload`] for dictionary/set outputs, which take
    ///   patches via [`Graph::apply_dict`]/[`Graph::apply_set`].
    pub fn apply(&mut self, output: OutputId, value: Value) -> Result<(), ApplyError> {
        let now = self.now;
        let slot = self
            .outputs
            .get(output.0 as usize)
            .ok_or(ApplyError::Gone)?;
        if slot.disposed {
            return Err(ApplyError::Gone);
        }
        if !slot.can_apply(now) {
            return Err(ApplyError::AlreadyModified);
        }
        match &slot.payload {
            Payload::Scalar { kind, .. } => {
                let kind = *kind;
                if value.kind() != kind {
                    return Err(ApplyError::TypeMismatch {
                        expected: kind,
                        found: value.kind(),
                    });
                }
                let slot = &mut self.outputs[output.0 as usize];
                if let Payload::Scalar { value: stored, .. } = &mut slot.payload {
                    *stored = Some(value);
                }
                slot.written = now;
                self.mark_and_notify(output);
                Ok(())
            }
            Payload::Window(window) => {
                let elem = window.elem_kind();
                if value.kind() != elem {
                    return Err(ApplyError::TypeMismatch {
                        expected: elem,
                        found: value.kind(),
                    });
                }
                let slot = &mut self.outputs[output.0 as usize];
                if let Payload::Window(window) = &mut slot.payload {
                    match window {
                        WindowPayload::Fixed(w) => w.push(value, now),
                        WindowPayload::Timed(w) => w.push(value, now),
                    }
                }
                slot.written = now;
                self.register_cleanup(output);
                self.mark_and_notify(output);
                Ok(())
            }
            Payload::List(list) => {
                let elem = list.elem;
                let children = list.children.clone();
                let Value::List(items) = value else {
                    return Err(ApplyError::TypeMismatch {
                        expected: Kind::List,
                        found: value.kind(),
                    });
                };
                if items.len() != children.len() {
                    return Err(ApplyError::WrongArity {
                        expected: children.len(),
                        found: items.len(),
                    });
                }
                for item in &items {
                    if item.kind() != elem {
                        return Err(ApplyError::TypeMismatch {
                            expected: elem,
                            found: item.kind(),
                        });
                    }
                }
                for (child, item) in children.iter().zip(items) {
                    let child_slot = &mut self.outputs[child.0 as usize];
                    if let Payload::Scalar { value: stored, .. } = &mut child_slot.payload {
                        *stored = Some(item);
                    }
                    child_slot.written = now;
                    self.mark_and_notify(*child);
                }
                self.outputs[output.0 as usize].written = now;
                if children.is_empty() {
                    self.mark_and_notify(output);
                }
                Ok(())
            }
            Payload::Dict(_) => Err(ApplyError::WrongPayload {
                expected: "scalar, list, or window",
            }),
            Payload::Set(_) => Err(ApplyError::WrongPayload {
                expected: "scalar, list, or window",
            }),
        }
    }

    /// Applies a keyed patch to a dictionary output, atomically.
    ///
    /// An empty patch still ticks the output. The patch is validated in full
    /// before any mutation: a type-mismatched `Set` or a strong `Remove` of
    /// an absent key rejects the whole patch.
    ///
    /// # Errors
    /// [`ApplyError::TypeMismatch`], [`ApplyError::MissingKey`],
    /// [`ApplyError::AlreadyModified`], or [`ApplyError::WrongPayload`] for
    /// non-dictionary outputs.
    pub fn apply_dict(&mut self, output: OutputId, patch: DictPatch) -> Result<(), ApplyError> {
        let now = self.now;
        let (owner, value_kind, key_set) = {
            let slot = self
                .outputs
                .get(output.0 as usize)
                .ok_or(ApplyError::Gone)?;
            if slot.disposed {
                return Err(ApplyError::Gone);
            }
            if !slot.can_apply(now) {
                return Err(ApplyError::AlreadyModified);
            }
            let Payload::Dict(dict) = &slot.payload else {
                return Err(ApplyError::WrongPayload {
                    expected: "dictionary",
                });
            };
            for (key, op) in &patch.ops {
                match op {
                    DictOp::Set(value) if value.kind() != dict.value_kind => {
                        return Err(ApplyError::TypeMismatch {
                            expected: dict.value_kind,
                            found: value.kind(),
                        });
                    }
                    DictOp::Remove if !dict.children.contains_key(key) => {
                        return Err(ApplyError::MissingKey(key.clone()));
                    }
                    _ => {}
                }
            }
            (slot.owner, dict.value_kind, dict.key_set)
        };

        let mut key_delta = SetDelta::new();
        for (key, op) in patch.ops {
            match op {
                DictOp::Set(value) => {
                    let existing = self.dict_child(output, &key);
                    if let Some(child) = existing {
                        let child_slot = &mut self.outputs[child.0 as usize];
                        if let Payload::Scalar { value: stored, .. } = &mut child_slot.payload {
                            *stored = Some(value);
                        }
                        child_slot.written = now;
                        self.mark_and_notify(child);
                    } else {
                        let child = self.push_output(OutputSlot::new(
                            owner,
                            Payload::Scalar {
                                kind: value_kind,
                                value: Some(value),
                            },
                        ));
                        {
                            let child_slot = &mut self.outputs[child.0 as usize];
                            child_slot.parent = Some(ParentLink {
                                parent: output,
                                slot: ChildSlot::Key(key.clone()),
                            });
                            child_slot.written = now;
                        }
                        if let Payload::Dict(dict) = &mut self.outputs[output.0 as usize].payload {
                            dict.touch(now);
                            dict.children.insert(key.clone(), child);
                            dict.added.insert(key.clone());
                        }
                        key_delta.added.insert(key);
                        self.mark_and_notify(child);
                    }
                }
                DictOp::Remove | DictOp::RemoveIfExists => {
                    let Some(child) = self.dict_child(output, &key) else {
                        // Validated above: only RemoveIfExists reaches here.
                        continue;
                    };
                    if let Payload::Dict(dict) = &mut self.outputs[output.0 as usize].payload {
                        dict.touch(now);
                        dict.children.remove(&key);
                        if dict.added.remove(&key) {
                            // Added and removed in the same cycle: net nothing.
                            dict.modified.remove(&key);
                        } else {
                            dict.modified.remove(&key);
                            dict.removed.insert(key.clone());
                            key_delta.removed.insert(key);
                        }
                    }
                    self.dispose_output(child);
                }
            }
        }

        let slot = &mut self.outputs[output.0 as usize];
        if let Payload::Dict(dict) = &mut slot.payload {
            dict.touch(now);
        }
        slot.written = now;
        self.mark_and_notify(output);
        if !key_delta.is_empty() {
            self.apply_set(key_set, key_delta)?;
        }
        Ok(())
    }

    /// Applies a membership delta to a set output.
    ///
    /// Removals are netted against current membership: removing an absent
    /// element is a no-op, per the weak-removal contract.
    ///
    /// # Errors
    /// [`ApplyError::AlreadyModified`] or [`ApplyError::WrongPayload`].
    pub fn apply_set(&mut self, output: OutputId, delta: SetDelta) -> Result<(), ApplyError> {
        let now = self.now;
        let slot = self
            .outputs
            .get_mut(output.0 as usize)
            .ok_or(ApplyError::Gone)?;
        if slot.disposed {
            return Err(ApplyError::Gone);
        }
        if !slot.can_apply(now) {
            return Err(ApplyError::AlreadyModified);
        }
        let Payload::Set(set) = &mut slot.payload else {
            return Err(ApplyError::WrongPayload { expected: "set" });
        };
        set.touch(now);
        for key in delta.removed {
            if set.members.remove(&key) {
                set.removed.insert(key);
            }
        }
        for key in delta.added {
            if set.members.insert(key.clone()) {
                set.added.insert(key);
            }
        }
        slot.written = now;
        self.mark_and_notify(output);
        Ok(())
    }

    /// Clears the output's value and validity. Container membership is
    /// dropped too: dictionary keys are disposed and recorded in the
    /// per-cycle delta (mirrored into the key set), set elements are
    /// recorded removed, list children are invalidated recursively, and
    /// window samples are dropped without counting as evictions. The
    /// `ever_valid` history is retained for removal bookkeeping.
    pub fn invalidate(&mut self, output: OutputId) {
        let now = self.now;
        let mut disposed_children: Vec<OutputId> = Vec::new();
        let mut child_invalidations: Vec<OutputId> = Vec::new();
        let mut key_set_removed: Option<(OutputId, BTreeSet<Key>)> = None;
        let subscribers = {
            let Some(slot) = self.outputs.get_mut(output.0 as usize) else {
                return;
            };
            if slot.disposed {
                return;
            }
            slot.valid = false;
            match &mut slot.payload {
                Payload::Scalar { value, .. } => *value = None,
                Payload::Dict(dict) => {
                    dict.touch(now);
                    let mut gone = BTreeSet::new();
                    for (key, child) in std::mem::take(&mut dict.children) {
                        disposed_children.push(child);
                        dict.modified.remove(&key);
                        // A key added and dropped within one cycle nets to
                        // nothing.
                        if !dict.added.remove(&key) {
                            dict.removed.insert(key.clone());
                            gone.insert(key);
                        }
                    }
                    if !gone.is_empty() {
                        key_set_removed = Some((dict.key_set, gone));
                    }
                }
                Payload::Set(set) => {
                    set.touch(now);
                    for key in std::mem::take(&mut set.members) {
                        if !set.added.remove(&key) {
                            set.removed.insert(key);
                        }
                    }
                }
                Payload::List(list) => child_invalidations.clone_from(&list.children),
                Payload::Window(window) => window.clear(),
            }
            slot.last_modified = now;
            slot.subscribers.clone()
        };
        for child in disposed_children {
            self.dispose_output(child);
        }
        for child in child_invalidations {
            self.invalidate(child);
        }
        if let Some((key_set, gone)) = key_set_removed {
            if let Some(ks) = self.outputs.get_mut(key_set.0 as usize) {
                if let Payload::Set(set) = &mut ks.payload {
                    set.touch(now);
                    for key in gone {
                        if set.members.remove(&key) && !set.added.remove(&key) {
                            set.removed.insert(key);
                        }
                    }
                }
            }
            self.mark_and_notify(key_set);
        }
        for input in subscribers {
            if self.inputs[input.0 as usize].active {
                let owner = self.inputs[input.0 as usize].owner;
                self.wake(owner);
            }
        }
    }

    /// Stamps `output` modified at the current time, notifies subscribers,
    /// and climbs the parent chain recording the child change in each
    /// container's delta.
    fn mark_and_notify(&mut self, output: OutputId) {
        let now = self.now;
        let mut current = output;
        loop {
            let slot = &mut self.outputs[current.0 as usize];
            slot.last_modified = now;
            slot.valid = true;
            slot.ever_valid = true;
            let subscribers = slot.subscribers.clone();
            let parent = slot.parent.clone();
            for input in subscribers {
                let input_slot = &self.inputs[input.0 as usize];
                if input_slot.active {
                    let owner = input_slot.owner;
                    self.schedule(owner, now.max(self.start_time));
                }
            }
            let Some(link) = parent else {
                break;
            };
            if let ChildSlot::Key(key) = &link.slot {
                if let Payload::Dict(dict) = &mut self.outputs[link.parent.0 as usize].payload {
                    dict.touch(now);
                    if !dict.added.contains(key) && !dict.removed.contains(key) {
                        dict.modified.insert(key.clone());
                    }
                }
            }
            current = link.parent;
        }
    }

    fn dict_child(&self, output: OutputId, key: &Key) -> Option<OutputId> {
        match &self.outputs.get(output.0 as usize)?.payload {
            Payload::Dict(dict) => dict.children.get(key).copied(),
            _ => None,
        }
    }

    fn register_cleanup(&mut self, output: OutputId) {
        if !self.cleanup.contains(&output) {
            self.cleanup.push(output);
        }
    }

    /// Drains the end-of-cycle cleanup queue, resetting one-cycle window
    /// `removed` batches so each eviction is observed exactly once.
    pub(crate) fn end_cycle(&mut self) {
        let pending = std::mem::take(&mut self.cleanup);
        for output in pending {
            if let Some(slot) = self.outputs.get_mut(output.0 as usize) {
                if let Payload::Window(window) = &mut slot.payload {
                    window.reset_removed();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// The output's current point-in-time value, or `None` if never valid
    /// (or, for windows, below the minimum fill).
    ///
    /// Reading a time-bounded window rolls it against the current time,
    /// which may capture evictions into its one-cycle `removed` batch.
    #[must_use]
    pub fn value(&mut self, output: OutputId) -> Option<Value> {
        self.roll_window(output);
        self.peek_value(output)
    }

    /// Like [`Graph::value`] but without the lazy window roll; expired
    /// time-window entries are filtered from the view instead.
    #[must_use]
    pub fn peek_value(&self, output: OutputId) -> Option<Value> {
        let slot = self.outputs.get(output.0 as usize)?;
        if slot.disposed || !slot.valid {
            return None;
        }
        match &slot.payload {
            Payload::Scalar { value, .. } => value.clone(),
            Payload::Dict(dict) => {
                let mut map = BTreeMap::new();
                for (key, child) in &dict.children {
                    if let Some(value) = self.peek_value(*child) {
                        map.insert(key.clone(), value);
                    }
                }
                Some(Value::Map(map))
            }
            Payload::Set(set) => Some(Value::Set(set.members.clone())),
            Payload::List(list) => {
                let mut items = Vec::with_capacity(list.children.len());
                for child in &list.children {
                    items.push(self.peek_value(*child)?);
                }
                Some(Value::List(items))
            }
            Payload::Window(window) => match window {
                WindowPayload::Fixed(w) => w.view().map(Value::List),
                WindowPayload::Timed(w) => {
                    w.view(self.start_time, self.now).map(Value::List)
                }
            },
        }
    }

    /// The change this output saw in the current cycle, or `None` if it did
    /// not tick.
    #[must_use]
    pub fn delta_value(&mut self, output: OutputId) -> Option<TsDelta> {
        self.roll_window(output);
        let now = self.now;
        let slot = self.outputs.get(output.0 as usize)?;
        if slot.disposed {
            return None;
        }
        match &slot.payload {
            Payload::Scalar { value, .. } => {
                if slot.modified(now) {
                    value.clone().map(TsDelta::Scalar)
                } else {
                    None
                }
            }
            Payload::Dict(dict) => {
                if dict.delta_stamp != now || !slot.modified(now) {
                    return None;
                }
                let mut delta = DictDelta::default();
                for key in &dict.added {
                    if let Some(child) = dict.children.get(key) {
                        if let Some(value) = self.peek_value(*child) {
                            delta.added.insert(key.clone(), value);
                        }
                    }
                }
                for key in &dict.modified {
                    if let Some(child) = dict.children.get(key) {
                        if let Some(value) = self.peek_value(*child) {
                            delta.modified.insert(key.clone(), value);
                        }
                    }
                }
                delta.removed = dict.removed.clone();
                Some(TsDelta::Dict(delta))
            }
            Payload::Set(set) => {
                if set.delta_stamp != now || !slot.modified(now) {
                    return None;
                }
                Some(TsDelta::Set(SetDelta {
                    added: set.added.clone(),
                    removed: set.removed.clone(),
                }))
            }
            Payload::List(list) => {
                if !slot.modified(now) {
                    return None;
                }
                let children = list.children.clone();
                let mut out = Vec::with_capacity(children.len());
                for child in children {
                    let child_slot = &self.outputs[child.0 as usize];
                    if child_slot.modified(now) {
                        if let Payload::Scalar { value, .. } = &child_slot.payload {
                            out.push(value.clone().map(TsDelta::Scalar));
                        } else {
                            out.push(None);
                        }
                    } else {
                        out.push(None);
                    }
                }
                Some(TsDelta::List(out))
            }
            Payload::Window(window) => {
                let (appended, removed) = match window {
                    WindowPayload::Fixed(w) => (w.appended(now), w.removed().to_vec()),
                    WindowPayload::Timed(w) => (w.appended(now), w.removed().to_vec()),
                };
                if appended.is_empty() && removed.is_empty() {
                    None
                } else {
                    Some(TsDelta::Window(WindowDelta { appended, removed }))
                }
            }
        }
    }

    fn roll_window(&mut self, output: OutputId) {
        let now = self.now;
        let Some(slot) = self.outputs.get_mut(output.0 as usize) else {
            return;
        };
        if let Payload::Window(WindowPayload::Timed(w)) = &mut slot.payload {
            w.roll(now);
            if w.has_removed() {
                self.register_cleanup(output);
            }
        }
    }

    /// True when the output changed during the current cycle.
    #[must_use]
    pub fn modified(&self, output: OutputId) -> bool {
        self.outputs
            .get(output.0 as usize)
            .is_some_and(|o| !o.disposed && o.modified(self.now))
    }

    /// True when the output has ever held a value and has not been
    /// invalidated.
    #[must_use]
    pub fn valid(&self, output: OutputId) -> bool {
        self.outputs
            .get(output.0 as usize)
            .is_some_and(|o| !o.disposed && o.valid)
    }

    /// Like [`Graph::valid`], additionally requiring every structural child
    /// to be valid. Used by nodes that must not run on partial collections.
    #[must_use]
    pub fn all_valid(&self, output: OutputId) -> bool {
        let Some(slot) = self.outputs.get(output.0 as usize) else {
            return false;
        };
        if slot.disposed || !slot.valid {
            return false;
        }
        match &slot.payload {
            Payload::Dict(dict) => dict.children.values().all(|c| self.all_valid(*c)),
            Payload::List(list) => list.children.iter().all(|c| self.all_valid(*c)),
            _ => true,
        }
    }

    /// The live key-set view of a dictionary output.
    #[must_use]
    pub fn dict_key_set(&self, output: OutputId) -> Option<OutputId> {
        match &self.outputs.get(output.0 as usize)?.payload {
            Payload::Dict(dict) => Some(dict.key_set),
            _ => None,
        }
    }

    /// The child output backing `key` of a dictionary output.
    #[must_use]
    pub fn dict_child_output(&self, output: OutputId, key: &Key) -> Option<OutputId> {
        self.dict_child(output, key)
    }

    /// The declared value kind of a dictionary output.
    #[must_use]
    pub fn dict_value_kind(&self, output: OutputId) -> Option<Kind> {
        match &self.outputs.get(output.0 as usize)?.payload {
            Payload::Dict(dict) => Some(dict.value_kind),
            _ => None,
        }
    }

    /// The dictionary's current keys, in order.
    #[must_use]
    pub fn dict_keys(&self, output: OutputId) -> Vec<Key> {
        match self.outputs.get(output.0 as usize).map(|o| &o.payload) {
            Some(Payload::Dict(dict)) => dict.children.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Input reads
    // ------------------------------------------------------------------

    /// The input's current value: the bound output's value for peers, an
    /// assembled list for non-peer composites (requiring every child to be
    /// readable), `None` when unbound.
    #[must_use]
    pub fn input_value(&mut self, input: InputId) -> Option<Value> {
        let binding = self.inputs.get(input.0 as usize)?.binding.clone();
        match binding {
            Binding::Unbound => None,
            Binding::Peer(output) => self.value(output),
            Binding::Children(children) => {
                let mut items = Vec::with_capacity(children.len());
                for child in children {
                    items.push(self.input_value(child)?);
                }
                Some(Value::List(items))
            }
        }
    }

    /// The input's delta for the current cycle, or `None` if nothing ticked.
    #[must_use]
    pub fn input_delta(&mut self, input: InputId) -> Option<TsDelta> {
        let binding = self.inputs.get(input.0 as usize)?.binding.clone();
        match binding {
            Binding::Unbound => None,
            Binding::Peer(output) => self.delta_value(output),
            Binding::Children(children) => {
                let mut any = false;
                let mut items = Vec::with_capacity(children.len());
                for child in children {
                    let delta = self.input_delta(child);
                    any |= delta.is_some();
                    items.push(delta);
                }
                any.then_some(TsDelta::List(items))
            }
        }
    }

    /// True when the input's bound output (or any non-peer child) changed
    /// this cycle.
    #[must_use]
    pub fn input_ticked(&self, input: InputId) -> bool {
        let Some(slot) = self.inputs.get(input.0 as usize) else {
            return false;
        };
        match &slot.binding {
            Binding::Unbound => false,
            Binding::Peer(output) => self.modified(*output),
            Binding::Children(children) => children.iter().any(|c| self.input_ticked(*c)),
        }
    }

    /// True when the input is bound and its output is valid (recursing for
    /// non-peer composites).
    #[must_use]
    pub fn input_valid(&self, input: InputId) -> bool {
        let Some(slot) = self.inputs.get(input.0 as usize) else {
            return false;
        };
        match &slot.binding {
            Binding::Unbound => false,
            Binding::Peer(output) => self.valid(*output),
            Binding::Children(children) => children.iter().all(|c| self.input_valid(*c)),
        }
    }

    /// True when the input's output and all its structural children are
    /// valid.
    #[must_use]
    pub fn input_all_valid(&self, input: InputId) -> bool {
        let Some(slot) = self.inputs.get(input.0 as usize) else {
            return false;
        };
        match &slot.binding {
            Binding::Unbound => false,
            Binding::Peer(output) => self.all_valid(*output),
            Binding::Children(children) => children.iter().all(|c| self.input_all_valid(*c)),
        }
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Schedules `node` for evaluation at `at`, escalating through nested
    /// subgraph parents so the root schedule always covers the time.
    ///
    /// Escalation stops as soon as a level already has the time pending,
    /// which is what keeps inner self-schedules from waking the parent for
    /// times it is already going to observe.
    pub(crate) fn schedule(&mut self, node: NodeId, at: EngineTime) {
        let Some(n) = self.nodes.get(node.0 as usize) else {
            return;
        };
        if n.disposed {
            return;
        }
        let rank = n.rank;
        let sub = n.subgraph;
        let inserted = self.subgraphs[sub.0 as usize]
            .pending
            .entry(at)
            .or_default()
            .insert((rank, node));
        if inserted {
            if let Some(parent) = self.subgraphs[sub.0 as usize].parent {
                self.schedule(parent, at);
            }
        }
    }

    /// Wakes `node` as soon as possible: in the current cycle when its turn
    /// has not passed yet, otherwise in the next cycle.
    pub(crate) fn wake(&mut self, node: NodeId) {
        let at = if self.now == EngineTime::ZERO {
            self.start_time
        } else {
            let Some(n) = self.nodes.get(node.0 as usize) else {
                return;
            };
            match self.evaluating {
                Some(current) if (n.rank, node) <= current => self.now.next(),
                _ => self.now,
            }
        };
        self.schedule(node, at);
    }

    /// Earliest pending evaluation time across the whole graph.
    #[must_use]
    pub(crate) fn next_time(&self) -> Option<EngineTime> {
        self.subgraphs[SubGraphId::ROOT.0 as usize]
            .pending
            .keys()
            .next()
            .copied()
    }

    /// Removes and returns the nodes of `sub` due exactly at `now`, in rank
    /// order.
    pub(crate) fn take_due(&mut self, sub: SubGraphId, now: EngineTime) -> Vec<NodeId> {
        self.subgraphs[sub.0 as usize]
            .pending
            .remove(&now)
            .map(|set| set.into_iter().map(|(_, node)| node).collect())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Disposal (map key removal, shutdown)
    // ------------------------------------------------------------------

    /// Disposes an output: unbinds every subscriber (waking their owners so
    /// they observe the transition) and recursively disposes container
    /// children.
    pub(crate) fn dispose_output(&mut self, output: OutputId) {
        let Some(slot) = self.outputs.get_mut(output.0 as usize) else {
            return;
        };
        if slot.disposed {
            return;
        }
        slot.disposed = true;
        slot.valid = false;
        let subscribers = std::mem::take(&mut slot.subscribers);
        let children: Vec<OutputId> = match &slot.payload {
            Payload::Dict(dict) => {
                let mut c: Vec<OutputId> = dict.children.values().copied().collect();
                c.push(dict.key_set);
                c
            }
            Payload::List(list) => list.children.clone(),
            _ => Vec::new(),
        };
        for input in subscribers {
            self.unbind_input(input);
        }
        for child in children {
            self.dispose_output(child);
        }
    }

    /// Disposes a node: clears its schedule, detaches its inputs, and
    /// disposes its outputs. The arena slot is tombstoned; ids are never
    /// reused.
    pub(crate) fn dispose_node(&mut self, node: NodeId) {
        let Some(n) = self.nodes.get_mut(node.0 as usize) else {
            return;
        };
        if n.disposed {
            return;
        }
        n.disposed = true;
        n.sched.clear();
        let sub = n.subgraph;
        let rank = n.rank;
        let inputs = n.inputs.clone();
        let outputs: Vec<OutputId> = n.output.into_iter().chain(n.error_output).collect();
        let subgraph = &mut self.subgraphs[sub.0 as usize];
        subgraph.nodes.retain(|id| *id != node);
        for set in subgraph.pending.values_mut() {
            set.remove(&(rank, node));
        }
        subgraph.pending.retain(|_, set| !set.is_empty());
        for input in inputs {
            self.detach_input(input);
        }
        for output in outputs {
            self.dispose_output(output);
        }
    }

    /// Unbinds an input without waking its (disposed) owner.
    fn detach_input(&mut self, input: InputId) {
        let Some(slot) = self.inputs.get(input.0 as usize) else {
            return;
        };
        match slot.binding.clone() {
            Binding::Unbound => {}
            Binding::Peer(output) => {
                if let Some(out) = self.outputs.get_mut(output.0 as usize) {
                    out.unsubscribe(input);
                }
                self.inputs[input.0 as usize].binding = Binding::Unbound;
            }
            Binding::Children(children) => {
                for child in children {
                    self.detach_input(child);
                }
            }
        }
    }
}
