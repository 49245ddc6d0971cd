// SPDX-License-Identifier: Apache-2.0

//! Per-cycle deltas for collection time series.
//!
//! A collection's `delta_value` is a patch, not the whole container. The
//! merge laws here are the contract for same-cycle composition (e.g. batched
//! push-queue messages): adds win over removes in either order, and removals
//! only count against current membership when applied.

use std::collections::{BTreeMap, BTreeSet};

use crate::value::{Key, Value};

/// One dictionary key operation inside a [`DictPatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum DictOp {
    /// Insert or overwrite the key's value.
    Set(Value),
    /// Remove the key. Removing an absent key is an error.
    Remove,
    /// Remove the key if present; absent keys are a no-op.
    RemoveIfExists,
}

/// A batch of keyed operations applied to a dictionary output in one cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DictPatch {
    /// Operations by key, applied atomically.
    pub ops: BTreeMap<Key, DictOp>,
}

impl DictPatch {
    /// Creates an empty patch. Applying an empty patch still ticks the
    /// output.
    #[must_use]
    pub fn new() -> Self {
        DictPatch::default()
    }

    /// Adds a `Set` operation, returning `self` for chaining.
    #[must_use]
    pub fn set(mut self, key: impl Into<Key>, value: impl Into<Value>) -> Self {
        self.ops.insert(key.into(), DictOp::Set(value.into()));
        self
    }

    /// Adds a `Remove` operation, returning `self` for chaining.
    #[must_use]
    pub fn remove(mut self, key: impl Into<Key>) -> Self {
        self.ops.insert(key.into(), DictOp::Remove);
        self
    }

    /// Adds a `RemoveIfExists` operation, returning `self` for chaining.
    #[must_use]
    pub fn remove_if_exists(mut self, key: impl Into<Key>) -> Self {
        self.ops.insert(key.into(), DictOp::RemoveIfExists);
        self
    }

    /// Merges a later patch into this one, per key.
    ///
    /// The later operation wins, with two exceptions. A strong `Remove`
    /// overwritten by `RemoveIfExists` stays strong. A `Remove` landing on
    /// a same-batch `Set` folds to `RemoveIfExists`: the key it deletes may
    /// only exist because of that `Set`, and the merged batch must not fail
    /// against pre-batch membership where the sequential patches would not.
    pub fn merge(&mut self, later: DictPatch) {
        for (key, op) in later.ops {
            match (self.ops.get(&key), op) {
                (Some(DictOp::Remove), DictOp::RemoveIfExists) => {}
                (Some(DictOp::Set(_)), DictOp::Remove) => {
                    self.ops.insert(key, DictOp::RemoveIfExists);
                }
                (_, op) => {
                    self.ops.insert(key, op);
                }
            }
        }
    }

    /// True when the patch carries no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// The change a dictionary output saw in one cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DictDelta {
    /// Keys added this cycle, with their values.
    pub added: BTreeMap<Key, Value>,
    /// Pre-existing keys whose value changed this cycle.
    pub modified: BTreeMap<Key, Value>,
    /// Keys removed this cycle.
    pub removed: BTreeSet<Key>,
}

impl DictDelta {
    /// True when nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

/// The change a set output saw in one cycle, or a batch to apply to one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetDelta {
    /// Elements added this cycle.
    pub added: BTreeSet<Key>,
    /// Elements removed this cycle.
    pub removed: BTreeSet<Key>,
}

impl SetDelta {
    /// Creates an empty delta.
    #[must_use]
    pub fn new() -> Self {
        SetDelta::default()
    }

    /// Adds an element, returning `self` for chaining.
    #[must_use]
    pub fn add(mut self, key: impl Into<Key>) -> Self {
        self.added.insert(key.into());
        self
    }

    /// Removes an element, returning `self` for chaining.
    #[must_use]
    pub fn drop(mut self, key: impl Into<Key>) -> Self {
        self.removed.insert(key.into());
        self
    }

    /// Merges a later same-cycle delta into this one.
    ///
    /// Net-effect contract: an element both added and removed within the
    /// cycle (in either order) merges to a net add; removals that survive
    /// the merge are true removals to be applied against current membership
    /// only.
    pub fn merge(&mut self, later: &SetDelta) {
        for key in &later.added {
            self.removed.remove(key);
            self.added.insert(key.clone());
        }
        for key in &later.removed {
            if !self.added.contains(key) {
                self.removed.insert(key.clone());
            }
        }
    }

    /// True when nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// The change a window output saw in one cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowDelta {
    /// Values appended this cycle.
    pub appended: Vec<Value>,
    /// Values evicted by the roll this cycle; each evicted value is
    /// reported through this channel exactly once.
    pub removed: Vec<Value>,
}

/// The change any output saw in the current cycle.
///
/// `None` from a delta read means the output did not tick this cycle; this
/// enum is only produced for outputs that did.
#[derive(Debug, Clone, PartialEq)]
pub enum TsDelta {
    /// A scalar output's new value.
    Scalar(Value),
    /// A dictionary output's keyed patch.
    Dict(DictDelta),
    /// A set output's membership change.
    Set(SetDelta),
    /// A list output's per-slot deltas (`None` for slots that did not tick).
    List(Vec<Option<TsDelta>>),
    /// A window output's appends and evictions.
    Window(WindowDelta),
}
