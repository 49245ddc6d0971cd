// SPDX-License-Identifier: Apache-2.0

//! Output slots: the mutable end of every time series.
//!
//! An output owns its current value, a last-modified stamp, validity flags,
//! and its subscriber fan-out list. Mutation happens exclusively through the
//! [`crate::Graph`] apply methods during the owning node's turn; everything
//! here is the slot data plus slot-local invariant helpers.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::ident::{InputId, NodeId, OutputId};
use crate::time::EngineTime;
use crate::value::{Key, Kind};
use crate::window::WindowPayload;

/// Errors raised when applying a value to an output.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApplyError {
    /// The applied value's kind does not match the output's declared kind.
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Kind the output was declared with.
        expected: Kind,
        /// Kind of the value that was applied.
        found: Kind,
    },
    /// The output was already written this cycle by another producer.
    #[error("output already modified this cycle")]
    AlreadyModified,
    /// A strong `Remove` targeted a key that is not present.
    #[error("remove of missing key {0}")]
    MissingKey(Key),
    /// A list apply carried the wrong number of elements.
    #[error("list arity mismatch: expected {expected}, found {found}")]
    WrongArity {
        /// Declared arity of the list output.
        expected: usize,
        /// Number of elements in the applied value.
        found: usize,
    },
    /// The apply used an operation the output's payload does not support
    /// (e.g. a dictionary patch against a scalar output).
    #[error("output is not a {expected} time series")]
    WrongPayload {
        /// The payload shape the operation requires.
        expected: &'static str,
    },
    /// The output id does not exist or has been disposed.
    #[error("output is disposed or unknown")]
    Gone,
}

/// Where a child output hangs off its composite parent.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ChildSlot {
    /// Dictionary child, addressed by key.
    Key(Key),
    /// List child, addressed by position.
    Index(usize),
}

/// Explicit parent link of a composite child (arena index, no back pointer).
#[derive(Debug, Clone)]
pub(crate) struct ParentLink {
    pub parent: OutputId,
    pub slot: ChildSlot,
}

/// Payload of a dictionary output: child outputs by key plus the per-cycle
/// key delta and the derived live key-set output.
#[derive(Debug, Clone)]
pub(crate) struct DictPayload {
    pub value_kind: Kind,
    pub children: BTreeMap<Key, OutputId>,
    /// Derived set output mirroring the live key set.
    pub key_set: OutputId,
    /// Cycle the delta sets below belong to; stale sets read as empty.
    pub delta_stamp: EngineTime,
    pub added: BTreeSet<Key>,
    pub modified: BTreeSet<Key>,
    pub removed: BTreeSet<Key>,
}

impl DictPayload {
    pub(crate) fn new(value_kind: Kind, key_set: OutputId) -> Self {
        DictPayload {
            value_kind,
            children: BTreeMap::new(),
            key_set,
            delta_stamp: EngineTime::ZERO,
            added: BTreeSet::new(),
            modified: BTreeSet::new(),
            removed: BTreeSet::new(),
        }
    }

    /// Clears the delta sets when entering a new cycle.
    pub(crate) fn touch(&mut self, now: EngineTime) {
        if self.delta_stamp != now {
            self.delta_stamp = now;
            self.added.clear();
            self.modified.clear();
            self.removed.clear();
        }
    }
}

/// Payload of a set output: steady membership plus the per-cycle delta.
#[derive(Debug, Clone, Default)]
pub(crate) struct SetPayload {
    pub members: BTreeSet<Key>,
    pub delta_stamp: EngineTime,
    pub added: BTreeSet<Key>,
    pub removed: BTreeSet<Key>,
}

impl SetPayload {
    pub(crate) fn touch(&mut self, now: EngineTime) {
        if self.delta_stamp != now {
            self.delta_stamp = now;
            self.added.clear();
            self.removed.clear();
        }
    }
}

/// Payload of a fixed-arity list output.
#[derive(Debug, Clone)]
pub(crate) struct ListPayload {
    pub elem: Kind,
    pub children: Vec<OutputId>,
}

/// The value store of an output slot.
#[derive(Debug, Clone)]
pub(crate) enum Payload {
    Scalar {
        kind: Kind,
        value: Option<crate::value::Value>,
    },
    Dict(DictPayload),
    Set(SetPayload),
    List(ListPayload),
    Window(WindowPayload),
}

/// One output slot in the graph arena.
#[derive(Debug, Clone)]
pub(crate) struct OutputSlot {
    /// Node whose turn may mutate this output.
    pub owner: NodeId,
    /// Composite parent, when this output is a container child.
    pub parent: Option<ParentLink>,
    pub payload: Payload,
    /// Stamp of the last direct apply; the reentrant-write check.
    pub written: EngineTime,
    /// Stamp of the last change, including child propagation.
    pub last_modified: EngineTime,
    pub valid: bool,
    /// Sticky: survives invalidation, used for removal bookkeeping.
    pub ever_valid: bool,
    /// Active inputs currently bound to this output.
    pub subscribers: Vec<InputId>,
    pub disposed: bool,
}

impl OutputSlot {
    pub(crate) fn new(owner: NodeId, payload: Payload) -> Self {
        OutputSlot {
            owner,
            parent: None,
            payload,
            written: EngineTime::ZERO,
            last_modified: EngineTime::ZERO,
            valid: false,
            ever_valid: false,
            subscribers: Vec::new(),
            disposed: false,
        }
    }

    /// True when this output changed during the cycle at `now`.
    ///
    /// Monotonic within a cycle by construction: the stamp only ever moves
    /// forward, and the next cycle carries a strictly greater `now`.
    pub(crate) fn modified(&self, now: EngineTime) -> bool {
        now != EngineTime::ZERO && self.last_modified == now
    }

    /// Pre-check for the at-most-one-write-per-cycle invariant.
    pub(crate) fn can_apply(&self, now: EngineTime) -> bool {
        !self.disposed && self.written != now
    }

    pub(crate) fn subscribe(&mut self, input: InputId) {
        if !self.subscribers.contains(&input) {
            self.subscribers.push(input);
        }
    }

    pub(crate) fn unsubscribe(&mut self, input: InputId) {
        self.subscribers.retain(|i| *i != input);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modified_is_a_stamp_comparison() {
        let mut slot = OutputSlot::new(
            NodeId(0),
            Payload::Scalar {
                kind: Kind::Int,
                value: None,
            },
        );
        let t1 = EngineTime::from_nanos(10);
        assert!(!slot.modified(t1));
        slot.last_modified = t1;
        assert!(slot.modified(t1));
        assert!(!slot.modified(t1.next()), "next cycle resets modified");
    }

    #[test]
    fn subscribe_is_idempotent() {
        let mut slot = OutputSlot::new(
            NodeId(0),
            Payload::Scalar {
                kind: Kind::Int,
                value: None,
            },
        );
        slot.subscribe(InputId(3));
        slot.subscribe(InputId(3));
        assert_eq!(slot.subscribers, vec![InputId(3)]);
        slot.unsubscribe(InputId(3));
        assert!(slot.subscribers.is_empty());
    }
}
