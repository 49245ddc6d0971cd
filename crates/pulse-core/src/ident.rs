// SPDX-License-Identifier: Apache-2.0

//! Arena identifier types.
//!
//! Every runtime object lives in an arena owned by the top-level
//! [`crate::Graph`] and is addressed by a `u32` index. Parent/child and
//! producer/consumer relationships are stored as explicit id fields rather
//! than shared pointers, so the ownership graph stays acyclic.

use std::fmt;
use std::sync::Arc;

/// Index of an output slot in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OutputId(pub(crate) u32);

/// Index of an input slot in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InputId(pub(crate) u32);

/// Index of a node in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) u32);

/// Index of a subgraph partition (0 is always the top-level graph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubGraphId(pub(crate) u32);

impl OutputId {
    /// Returns the raw arena index.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl InputId {
    /// Returns the raw arena index.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl NodeId {
    /// Returns the raw arena index.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl SubGraphId {
    /// The top-level subgraph.
    pub const ROOT: SubGraphId = SubGraphId(0);

    /// Returns the raw arena index.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Label for a tagged self-schedule request.
///
/// Re-requesting the same tag replaces the previous request (last-wins), so a
/// node can keep exactly one alarm alive per concern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag(Arc<str>);

impl Tag {
    /// Creates a tag from any string-like value.
    pub fn new(name: impl AsRef<str>) -> Self {
        Tag(Arc::from(name.as_ref()))
    }

    /// Returns the tag label.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Tag {
    fn from(s: &str) -> Self {
        Tag::new(s)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_compare_by_label() {
        let a = Tag::new("roll");
        let b = Tag::from("roll");
        assert_eq!(a, b);
        assert_ne!(a, Tag::new("poll"));
    }
}
