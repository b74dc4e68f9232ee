//! Work deferred to the next tick boundary
//!
//! Scheduling the same item several times before the boundary runs it once.

use crate::group::GroupId;

/// Deferred scheduler work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Deferred {
    /// Rewrite the version manifest
    PersistVersions,
    /// Recompute a group's aggregate progress
    RecomputeGroup(GroupId),
}

#[derive(Debug, Default)]
pub(crate) struct NextTick {
    queue: Vec<Deferred>,
}

impl NextTick {
    /// Schedule an item; returns false if it was already scheduled
    pub fn schedule(&mut self, item: Deferred) -> bool {
        if self.queue.contains(&item) {
            return false;
        }
        self.queue.push(item);
        true
    }

    /// Take everything scheduled so far, in scheduling order
    pub fn drain(&mut self) -> Vec<Deferred> {
        std::mem::take(&mut self.queue)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}
