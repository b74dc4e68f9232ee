//! Request groups
//!
//! A group tracks an ordered batch of requests. Its aggregate state is
//! recomputed at a tick boundary after any member changed, and its
//! completion callback fires once when every member is terminal.

use std::fmt;

use crate::payload::PayloadType;
use crate::request::{FetchRequest, RequestId};

/// Identifier of a request group
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group#{}", self.0)
    }
}

type CompleteCallback = Box<dyn FnOnce(&GroupView<'_>)>;

/// Aggregate state of a batch of requests
pub struct RequestGroup {
    id: GroupId,
    members: Vec<RequestId>,
    progress: f32,
    loading: usize,
    succeeded: usize,
    failed: usize,
    on_complete: Option<CompleteCallback>,
}

impl RequestGroup {
    pub(crate) fn new(id: GroupId) -> Self {
        Self {
            id,
            members: Vec::new(),
            progress: 0.0,
            loading: 0,
            succeeded: 0,
            failed: 0,
            on_complete: None,
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    /// Member ids in insertion order
    pub fn members(&self) -> &[RequestId] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Mean member progress as of the last recompute
    pub fn progress(&self) -> f32 {
        self.progress
    }

    pub fn loading_count(&self) -> usize {
        self.loading
    }

    pub fn succeeded_count(&self) -> usize {
        self.succeeded
    }

    pub fn failed_count(&self) -> usize {
        self.failed
    }

    /// Every member is terminal
    pub fn is_done(&self) -> bool {
        !self.members.is_empty() && self.succeeded + self.failed == self.members.len()
    }

    /// Every member succeeded
    pub fn is_success(&self) -> bool {
        !self.members.is_empty() && self.succeeded == self.members.len()
    }

    pub(crate) fn push(&mut self, id: RequestId) {
        self.members.push(id);
    }

    pub(crate) fn set_on_complete(&mut self, callback: CompleteCallback) {
        if self.on_complete.replace(callback).is_some() {
            log::warn!("{}: completion callback replaced", self.id);
        }
    }

    /// Recount members. `resolved` holds the members currently known to the
    /// scheduler, in member order; members still waiting in the inbox are
    /// absent and count as idle. Fires the completion callback when the
    /// group is done, at most once over the group's lifetime.
    pub(crate) fn recompute(&mut self, resolved: &[&FetchRequest]) {
        if self.members.is_empty() {
            return;
        }

        let mut sum = 0.0;
        self.loading = 0;
        self.succeeded = 0;
        self.failed = 0;

        for request in resolved {
            sum += request.progress();
            if request.is_loading() {
                self.loading += 1;
            }
            if request.is_success() {
                self.succeeded += 1;
            } else if request.is_failed() {
                self.failed += 1;
            }
        }

        self.progress = sum / self.members.len() as f32;
        log::debug!(
            "{}: progress {:.2}, {} loading, {} succeeded, {} failed of {}",
            self.id,
            self.progress,
            self.loading,
            self.succeeded,
            self.failed,
            self.members.len()
        );

        if !self.is_done() {
            return;
        }

        if let Some(callback) = self.on_complete.take() {
            let view = GroupView {
                id: self.id,
                requests: resolved.to_vec(),
            };
            callback(&view);
        }
    }
}

impl fmt::Debug for RequestGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestGroup")
            .field("id", &self.id)
            .field("members", &self.members)
            .field("progress", &self.progress)
            .field("loading", &self.loading)
            .field("succeeded", &self.succeeded)
            .field("failed", &self.failed)
            .field("has_on_complete", &self.on_complete.is_some())
            .finish()
    }
}

/// Read-only view of a group's members, in member order
pub struct GroupView<'a> {
    id: GroupId,
    requests: Vec<&'a FetchRequest>,
}

impl<'a> GroupView<'a> {
    pub(crate) fn new(id: GroupId, requests: Vec<&'a FetchRequest>) -> Self {
        Self { id, requests }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn request(&self, index: usize) -> Option<&'a FetchRequest> {
        self.requests.get(index).copied()
    }

    pub fn requests(&self) -> impl Iterator<Item = &'a FetchRequest> + '_ {
        self.requests.iter().copied()
    }

    /// Typed result of the member at `index`
    pub fn result<T: PayloadType + ?Sized>(&self, index: usize) -> Option<&'a T> {
        self.request(index)?.result::<T>()
    }

    /// Typed results of every member, `None` where a member failed
    pub fn results<T: PayloadType + ?Sized>(&self) -> Vec<Option<&'a T>> {
        self.requests.iter().map(|r| r.result::<T>()).collect()
    }

    pub fn succeeded(&self) -> usize {
        self.requests.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.requests.iter().filter(|r| r.is_failed()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::PayloadKind;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_recompute_counts_idle_members() {
        let mut group = RequestGroup::new(GroupId(1));
        group.push(RequestId(1));
        group.push(RequestId(2));

        let a = FetchRequest::new("http://host/a", PayloadKind::Bytes);
        group.recompute(&[&a]);

        assert_eq!(group.progress(), 0.0);
        assert_eq!(group.loading_count(), 0);
        assert!(!group.is_done());
    }

    #[test]
    fn test_empty_group_never_completes() {
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();

        let mut group = RequestGroup::new(GroupId(7));
        group.set_on_complete(Box::new(move |_| flag.set(true)));
        group.recompute(&[]);

        assert!(!group.is_done());
        assert!(!fired.get());
    }
}
