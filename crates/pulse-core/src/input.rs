// SPDX-License-Identifier: Apache-2.0

//! Input slots: the read-only end of every time series.
//!
//! An input is either peered to exactly one output or assembled from
//! independently bound child inputs (non-peer composites). Active inputs
//! schedule their owner when the bound output ticks; passive inputs are
//! readable but never drive scheduling. Binding is explicit and reversible.

use thiserror::Error;

use crate::ident::{InputId, NodeId, OutputId};

/// Errors raised when binding or rebinding an input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindError {
    /// A structural reference was bound to a peer (non-composite) input, or
    /// vice versa.
    #[error("reference shape does not match input shape")]
    ShapeMismatch,
    /// A structural reference carried more children than the target input.
    #[error("reference has {found} children but input has {expected}")]
    TooManyChildren {
        /// Child inputs available on the target.
        expected: usize,
        /// Children carried by the reference.
        found: usize,
    },
    /// The referenced output no longer exists.
    #[error("referenced output is disposed or unknown")]
    OutputGone,
    /// The input id does not exist.
    #[error("input is unknown")]
    InputGone,
}

/// What an input is currently wired to.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Binding {
    /// Not wired; reads as empty and never ticks.
    Unbound,
    /// Peered to one output.
    Peer(OutputId),
    /// Non-peer composite: independently bound child inputs.
    Children(Vec<InputId>),
}

/// One input slot in the graph arena.
#[derive(Debug, Clone)]
pub(crate) struct InputSlot {
    /// Node scheduled when this input ticks (if active).
    pub owner: NodeId,
    /// Active inputs drive scheduling; passive inputs only read.
    pub active: bool,
    pub binding: Binding,
    /// Set on child inputs of a non-peer composite.
    pub parent: Option<InputId>,
    /// Gate: the owner only evaluates when this input is valid.
    pub require_valid: bool,
    /// Gate: the owner only evaluates when this input and every structural
    /// child are valid.
    pub require_all_valid: bool,
}

impl InputSlot {
    pub(crate) fn new(owner: NodeId, active: bool) -> Self {
        InputSlot {
            owner,
            active,
            binding: Binding::Unbound,
            parent: None,
            require_valid: false,
            require_all_valid: false,
        }
    }

    /// True when the input is directly peered to an output.
    pub(crate) fn peer(&self) -> Option<OutputId> {
        match self.binding {
            Binding::Peer(out) => Some(out),
            _ => None,
        }
    }
}
