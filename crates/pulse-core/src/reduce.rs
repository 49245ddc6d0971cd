// SPDX-License-Identifier: Apache-2.0

//! Incremental reduction over a keyed collection.
//!
//! The combine tree is a flat balanced binary tree in one array: `leaves`
//! leaf slots preceded by `leaves - 1` internal nodes, heap indexing, no
//! pointers. Occupied leaves are packed into a contiguous left prefix, so a
//! key update recomputes exactly one root path (`O(log n)`), and removal
//! swaps the last occupied leaf into the hole. The leaf tier doubles when
//! full and halves when three quarters of the halved tree would still be
//! free.

use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::delta::DictDelta;
use crate::value::{Key, Value};

/// Associative combine step of a reduce node.
pub type ReduceOp = dyn Fn(&Value, &Value) -> Value + Send + Sync;

/// State of a reduce node: the combine tree plus key-to-leaf bookkeeping.
pub(crate) struct ReduceState {
    op: Arc<ReduceOp>,
    zero: Value,
    /// Heap array of length `2 * leaves - 1`; internal nodes first.
    arr: Vec<Option<Value>>,
    leaves: usize,
    occupied: usize,
    key_to_leaf: FxHashMap<Key, usize>,
    /// Key held by each leaf slot; `None` past the occupied prefix.
    leaf_keys: Vec<Option<Key>>,
}

impl std::fmt::Debug for ReduceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReduceState")
            .field("leaves", &self.leaves)
            .field("occupied", &self.occupied)
            .finish_non_exhaustive()
    }
}

impl ReduceState {
    pub(crate) fn new(op: Arc<ReduceOp>, zero: Value) -> Self {
        ReduceState {
            op,
            zero,
            arr: vec![None],
            leaves: 1,
            occupied: 0,
            key_to_leaf: FxHashMap::default(),
            leaf_keys: vec![None],
        }
    }

    /// The current reduction: the tree root, or the identity when empty.
    pub(crate) fn root(&self) -> Value {
        self.arr
            .first()
            .and_then(Clone::clone)
            .unwrap_or_else(|| self.zero.clone())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// Number of keys currently contributing.
    pub(crate) fn len(&self) -> usize {
        self.occupied
    }

    /// Applies a dictionary delta: removals first so a key that moved
    /// between collections in one cycle nets to its final state.
    pub(crate) fn apply_delta(&mut self, delta: &DictDelta) {
        for key in &delta.removed {
            self.remove(key);
        }
        for (key, value) in &delta.added {
            self.insert(key.clone(), value.clone());
        }
        for (key, value) in &delta.modified {
            self.insert(key.clone(), value.clone());
        }
    }

    /// Rebuilds from a full snapshot, discarding incremental state. Used
    /// when the input first becomes readable with pre-existing keys.
    pub(crate) fn sync<'a, I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (&'a Key, &'a Value)>,
    {
        let pairs: Vec<(Key, Value)> = entries
            .into_iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut leaves = 1usize;
        while leaves < pairs.len() {
            leaves *= 2;
        }
        self.rebuild(pairs, leaves);
    }

    /// Inserts or updates one key's contribution.
    pub(crate) fn insert(&mut self, key: Key, value: Value) {
        if let Some(&slot) = self.key_to_leaf.get(&key) {
            let leaf = self.leaf_index(slot);
            self.arr[leaf] = Some(value);
            self.recompute_path(slot);
            return;
        }
        if self.occupied == self.leaves {
            self.grow();
        }
        let slot = self.occupied;
        let leaf = self.leaf_index(slot);
        self.arr[leaf] = Some(value);
        self.leaf_keys[slot] = Some(key.clone());
        self.key_to_leaf.insert(key, slot);
        self.occupied += 1;
        self.recompute_path(slot);
    }

    /// Removes one key's contribution; unknown keys are a no-op.
    pub(crate) fn remove(&mut self, key: &Key) {
        let Some(slot) = self.key_to_leaf.remove(key) else {
            return;
        };
        let last = self.occupied - 1;
        let slot_leaf = self.leaf_index(slot);
        let last_leaf = self.leaf_index(last);
        if slot != last {
            // Keep the occupied prefix contiguous: move the last leaf into
            // the hole.
            let moved_value = self.arr[last_leaf].take();
            let moved_key = self.leaf_keys[last].take();
            self.arr[slot_leaf] = moved_value;
            self.leaf_keys[slot].clone_from(&moved_key);
            if let Some(k) = moved_key {
                self.key_to_leaf.insert(k, slot);
            }
            self.arr[last_leaf] = None;
            self.leaf_keys[last] = None;
        } else {
            self.arr[slot_leaf] = None;
            self.leaf_keys[slot] = None;
        }
        self.occupied -= 1;
        self.recompute_path(slot);
        if slot != last {
            self.recompute_path(last);
        }
        // Halve when the halved tree would still be three quarters free.
        if self.leaves > 1 && self.occupied * 8 < self.leaves {
            let pairs = self.snapshot();
            let mut leaves = self.leaves;
            while leaves > 1 && self.occupied * 8 < leaves {
                leaves /= 2;
            }
            self.rebuild(pairs, leaves.max(1));
        }
    }

    fn snapshot(&self) -> Vec<(Key, Value)> {
        (0..self.occupied)
            .filter_map(|slot| {
                let key = self.leaf_keys[slot].clone()?;
                let value = self.arr[self.leaf_index(slot)].clone()?;
                Some((key, value))
            })
            .collect()
    }

    fn grow(&mut self) {
        let pairs = self.snapshot();
        let leaves = self.leaves * 2;
        self.rebuild(pairs, leaves);
    }

    fn rebuild(&mut self, pairs: Vec<(Key, Value)>, leaves: usize) {
        debug_assert!(leaves >= pairs.len(), "leaf tier must fit all keys");
        self.leaves = leaves;
        self.arr = vec![None; 2 * leaves - 1];
        self.leaf_keys = vec![None; leaves];
        self.key_to_leaf.clear();
        self.occupied = pairs.len();
        for (slot, (key, value)) in pairs.into_iter().enumerate() {
            self.arr[leaves - 1 + slot] = Some(value);
            self.leaf_keys[slot] = Some(key.clone());
            self.key_to_leaf.insert(key, slot);
        }
        // Bottom-up pass over the internal tier.
        for i in (0..leaves.saturating_sub(1)).rev() {
            self.arr[i] = self.combine_children(i);
        }
    }

    fn leaf_index(&self, slot: usize) -> usize {
        self.leaves - 1 + slot
    }

    fn combine_children(&self, index: usize) -> Option<Value> {
        let left = self.arr.get(2 * index + 1).and_then(Clone::clone);
        let right = self.arr.get(2 * index + 2).and_then(Clone::clone);
        match (left, right) {
            (Some(a), Some(b)) => Some((self.op)(&a, &b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    fn recompute_path(&mut self, slot: usize) {
        let mut index = self.leaf_index(slot);
        while index > 0 {
            index = (index - 1) / 2;
            self.arr[index] = self.combine_children(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sum_state() -> ReduceState {
        ReduceState::new(
            Arc::new(|a: &Value, b: &Value| {
                Value::Int(a.as_int().unwrap_or(0) + b.as_int().unwrap_or(0))
            }),
            Value::Int(0),
        )
    }

    fn k(s: &str) -> Key {
        Key::Str(s.into())
    }

    #[test]
    fn empty_tree_reduces_to_zero() {
        let state = sum_state();
        assert!(state.is_empty());
        assert_eq!(state.root(), Value::Int(0));
    }

    #[test]
    fn insert_update_remove_track_the_sum() {
        let mut state = sum_state();
        state.insert(k("a"), Value::Int(1));
        state.insert(k("b"), Value::Int(2));
        state.insert(k("c"), Value::Int(4));
        assert_eq!(state.root(), Value::Int(7));
        state.insert(k("b"), Value::Int(10));
        assert_eq!(state.root(), Value::Int(15));
        state.remove(&k("a"));
        assert_eq!(state.root(), Value::Int(14));
        state.remove(&k("b"));
        state.remove(&k("c"));
        assert_eq!(state.root(), Value::Int(0), "emptied tree is the identity");
    }

    #[test]
    fn removing_unknown_key_is_a_noop() {
        let mut state = sum_state();
        state.insert(k("a"), Value::Int(1));
        state.remove(&k("ghost"));
        assert_eq!(state.root(), Value::Int(1));
    }

    #[test]
    fn growth_doubles_the_leaf_tier() {
        let mut state = sum_state();
        for i in 0..5 {
            state.insert(Key::Int(i), Value::Int(1));
        }
        assert_eq!(state.leaves, 8);
        assert_eq!(state.arr.len(), 15);
        assert_eq!(state.root(), Value::Int(5));
    }

    #[test]
    fn shrink_waits_for_three_quarters_free_after_halving() {
        let mut state = sum_state();
        for i in 0..32 {
            state.insert(Key::Int(i), Value::Int(1));
        }
        assert_eq!(state.leaves, 32);
        // 4 of 32 occupied: halved tree (16) would be 25% full, keep.
        for i in 4..32 {
            state.remove(&Key::Int(i));
        }
        assert_eq!(state.leaves, 32);
        // 3 of 32: shrink kicks in and settles where occupancy fits.
        state.remove(&Key::Int(3));
        assert!(state.leaves < 32);
        assert_eq!(state.root(), Value::Int(3));
    }

    #[test]
    fn sync_rebuilds_from_snapshot() {
        let mut state = sum_state();
        let entries = vec![
            (k("a"), Value::Int(5)),
            (k("b"), Value::Int(6)),
            (k("c"), Value::Int(7)),
        ];
        state.sync(entries.iter().map(|(k, v)| (k, v)));
        assert_eq!(state.occupied, 3);
        assert_eq!(state.root(), Value::Int(18));
    }

    proptest! {
        #[test]
        fn tree_invariants_hold_under_random_ops(ops in proptest::collection::vec(
            (0u8..3, 0i64..16, 1i64..100), 1..200,
        )) {
            let mut state = sum_state();
            let mut model = std::collections::BTreeMap::new();
            for (op, key, value) in ops {
                match op {
                    0 | 1 => {
                        state.insert(Key::Int(key), Value::Int(value));
                        model.insert(key, value);
                    }
                    _ => {
                        state.remove(&Key::Int(key));
                        model.remove(&key);
                    }
                }
                // Occupied prefix is contiguous.
                for slot in 0..state.occupied {
                    prop_assert!(state.leaf_keys[slot].is_some());
                    prop_assert!(state.arr[state.leaf_index(slot)].is_some());
                }
                for slot in state.occupied..state.leaves {
                    prop_assert!(state.leaf_keys[slot].is_none());
                }
                prop_assert_eq!(state.occupied, model.len());
                let expected: i64 = model.values().sum();
                prop_assert_eq!(state.root(), Value::Int(expected));
            }
        }
    }
}
