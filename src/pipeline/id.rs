//! Handles into the dispatch graph's storage.
//!
//! Nodes are never removed, so a `NodeId` is just the position of its node.
//! Edge positions are recycled after `unsubscribe`; an `EdgeId` also carries
//! the generation of its position, and a stale handle never names a newer
//! subscription.

use std::fmt;

/// A registered source or consumer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Handle of the node stored at `position`.
    pub(crate) fn at(position: usize) -> Self {
        NodeId(position as u32)
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One subscription. Goes stale after `unsubscribe`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId {
    index: u32,
    generation: u32,
}

impl EdgeId {
    pub(crate) fn new(position: usize, generation: u32) -> Self {
        Self {
            index: position as u32,
            generation,
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        self.index as usize
    }

    /// How many subscriptions held this position before this one.
    #[inline]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "edge#{}.{}", self.index, self.generation)
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
