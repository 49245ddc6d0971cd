// SPDX-License-Identifier: Apache-2.0

//! Reference indirection: a value denoting "a time-series output".
//!
//! A [`TsRef`] can be stored, compared, and carried through outputs like any
//! other value, without subscribing anything. Binding it to an input is an
//! explicit, reversible step that preserves the input's active/passive state.
//! This is the rebinding mechanism dynamic topology (switch/map/service
//! dispatch) uses instead of scheduler special cases.

use crate::graph::Graph;
use crate::ident::{InputId, OutputId};
use crate::input::BindError;

/// An indirect, reboundable pointer-like time-series value.
///
/// Structural equality: two `Direct` references are equal iff they denote the
/// same output; `Items` references are equal iff all children are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TsRef {
    /// Denotes nothing; binding it unbinds the target.
    Empty,
    /// Denotes one bound output.
    Direct(OutputId),
    /// An ordered collection of nested references, mirroring a non-peer
    /// input's shape.
    Items(Vec<TsRef>),
}

impl TsRef {
    /// Builds a direct reference to an output.
    #[must_use]
    pub fn for_output(output: OutputId) -> TsRef {
        TsRef::Direct(output)
    }

    /// Builds a reference describing an input's current binding.
    ///
    /// A peered input yields a `Direct` reference to its bound output; a
    /// non-peer input yields `Items` with one entry per child; an unbound
    /// input yields `Empty`.
    #[must_use]
    pub fn for_input(graph: &Graph, input: InputId) -> TsRef {
        graph.reference_for_input(input)
    }

    /// Builds a structural reference from child references.
    #[must_use]
    pub fn from_items(items: Vec<TsRef>) -> TsRef {
        TsRef::Items(items)
    }

    /// True when the reference denotes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, TsRef::Empty)
    }

    /// Binds `target` according to this reference.
    ///
    /// `Empty` unbinds the target; `Direct` binds it to the referenced
    /// output; `Items` recursively binds each positional child and unbinds
    /// target children with no counterpart. The target's prior
    /// active/passive state is preserved throughout.
    ///
    /// # Errors
    /// Returns [`BindError`] when the reference shape does not match the
    /// target input's shape, or when a referenced output no longer exists.
    pub fn bind(&self, graph: &mut Graph, target: InputId) -> Result<(), BindError> {
        graph.bind_reference(target, self)
    }
}
