// SPDX-License-Identifier: Apache-2.0

//! Run-scoped shared context.
//!
//! Anything a run needs beyond the graph itself (connection pools, lookup
//! tables, clocks for tests) is registered here explicitly and threaded
//! through to node bodies via the evaluation context. There is no ambient
//! global state; two runs in one process never share anything by accident.

use std::any::{Any, TypeId};

use rustc_hash::FxHashMap;

/// Typed bag of run-wide resources, keyed by type.
///
/// One value per type; registering a second value of the same type replaces
/// the first.
#[derive(Debug, Default)]
pub struct RunContext {
    entries: FxHashMap<TypeId, Box<dyn Any + Send>>,
}

impl RunContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        RunContext::default()
    }

    /// Registers a resource, replacing any previous value of the same type.
    pub fn insert<T: Any + Send>(&mut self, value: T) {
        self.entries.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Borrows a registered resource.
    #[must_use]
    pub fn get<T: Any + Send>(&self) -> Option<&T> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }

    /// Mutably borrows a registered resource.
    pub fn get_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.entries
            .get_mut(&TypeId::of::<T>())
            .and_then(|v| v.downcast_mut::<T>())
    }

    /// Removes and returns a registered resource.
    pub fn remove<T: Any + Send>(&mut self) -> Option<T> {
        self.entries
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Pool(Vec<u32>);

    #[test]
    fn one_value_per_type_last_wins() {
        let mut ctx = RunContext::new();
        ctx.insert(Pool(vec![1]));
        ctx.insert(Pool(vec![2]));
        assert_eq!(ctx.get::<Pool>(), Some(&Pool(vec![2])));
        if let Some(pool) = ctx.get_mut::<Pool>() {
            pool.0.push(3);
        }
        assert_eq!(ctx.remove::<Pool>(), Some(Pool(vec![2, 3])));
        assert!(ctx.get::<Pool>().is_none());
    }
}
