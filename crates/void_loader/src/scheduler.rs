//! Request scheduler
//!
//! The host owns a [`RequestScheduler`] and calls [`RequestScheduler::tick`]
//! once per frame. A tick:
//!
//! 1. Loads the version manifest on first use and runs deferred work
//!    (manifest persist, group recomputes).
//! 2. Merges the inbox into the live queue.
//! 3. Runs the status pass: local checks for new requests, polls for running
//!    ones, delivery for finished ones.
//! 4. Runs the admission pass: cache hits first, then network fetches, each
//!    within its budget. Requests over budget wait for a later tick.
//! 5. Keeps requests enqueued during the tick for the next one and schedules
//!    a manifest persist if the version store changed.
//!
//! Callbacks may enqueue through an [`Enqueuer`] while a tick is running.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use crate::config::LoaderConfig;
use crate::error::{LoaderError, LoaderResult};
use crate::group::{GroupId, GroupView, RequestGroup};
use crate::next_tick::{Deferred, NextTick};
use crate::payload::{MediaDecoder, PayloadType, StandardDecoder};
use crate::request::{
    FetchRequest, LoadEnv, LocalCheck, Phase, RequestEvent, RequestId, SubscriptionId,
};
use crate::storage::{CacheLayout, DiskStore, FileStore};
use crate::transport::Transport;
use crate::version::VersionStore;

#[derive(Default)]
struct Inbox {
    next_id: Cell<u64>,
    pending: RefCell<Vec<FetchRequest>>,
}

impl Inbox {
    fn push(&self, mut request: FetchRequest) -> LoaderResult<RequestId> {
        if request.locator().is_empty() {
            log::warn!("Rejected request with an empty locator");
            return Err(LoaderError::EmptyLocator);
        }

        if request.id() == RequestId::UNASSIGNED {
            let id = self.next_id.get() + 1;
            self.next_id.set(id);
            request.assign_id(RequestId(id));
        }

        let id = request.id();
        log::debug!("Enqueued {} {}", id, request.locator());
        self.pending.borrow_mut().push(request);
        Ok(id)
    }

    fn take(&self) -> Vec<FetchRequest> {
        std::mem::take(&mut *self.pending.borrow_mut())
    }

    fn len(&self) -> usize {
        self.pending.borrow().len()
    }
}

/// Cloneable handle for enqueueing from callbacks. Requests land in the
/// scheduler's inbox and are picked up by the next tick.
#[derive(Clone)]
pub struct Enqueuer {
    inbox: Rc<Inbox>,
}

impl Enqueuer {
    pub fn enqueue(&self, request: FetchRequest) -> LoaderResult<RequestId> {
        self.inbox.push(request)
    }
}

/// Scheduler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderStats {
    /// Local checks that found a usable cached copy
    pub cache_hits: u64,
    /// Local checks with no usable cached file
    pub cache_misses: u64,
    /// Local checks that found an outdated cached copy
    pub stale: u64,
    /// Network fetches started
    pub network_fetches: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Raw bytes received by successful network fetches
    pub bytes_fetched: u64,
}

impl LoaderStats {
    fn record_check(&mut self, check: LocalCheck) {
        match check {
            LocalCheck::Hit { .. } => self.cache_hits += 1,
            LocalCheck::Stale { .. } => self.stale += 1,
            LocalCheck::Miss | LocalCheck::Missing | LocalCheck::Empty => self.cache_misses += 1,
            LocalCheck::Disabled | LocalCheck::Skipped => {}
        }
    }

    fn record_done(&mut self, request: &FetchRequest) {
        if request.is_success() {
            self.succeeded += 1;
            if request.is_from_network() {
                self.bytes_fetched += request.bytes_received() as u64;
            }
        } else {
            self.failed += 1;
        }
    }
}

/// Per-tick driver of fetch requests
pub struct RequestScheduler {
    config: LoaderConfig,
    layout: CacheLayout,
    files: Box<dyn FileStore>,
    transport: Box<dyn Transport>,
    decoder: Box<dyn MediaDecoder>,
    versions: VersionStore,

    inbox: Rc<Inbox>,
    live: Vec<FetchRequest>,
    settled: HashMap<RequestId, FetchRequest>,
    groups: BTreeMap<GroupId, RequestGroup>,
    next_group: u64,
    next_tick: NextTick,

    in_flight: usize,
    frame: u64,
    stats: LoaderStats,
}

impl RequestScheduler {
    /// Create a scheduler over the local filesystem with the standard codecs
    pub fn new(config: LoaderConfig, transport: impl Transport + 'static) -> LoaderResult<Self> {
        config.validate()?;

        let layout = CacheLayout::new(&config.cache_root);
        let versions = VersionStore::new(layout.manifest_path());
        log::info!(
            "Request scheduler at {:?} (network budget {}, disk budget {})",
            layout.root(),
            config.max_concurrent_network,
            config.max_disk_ops_per_tick
        );

        Ok(Self {
            config,
            layout,
            files: Box::new(DiskStore),
            transport: Box::new(transport),
            decoder: Box::new(StandardDecoder),
            versions,
            inbox: Rc::new(Inbox::default()),
            live: Vec::new(),
            settled: HashMap::new(),
            groups: BTreeMap::new(),
            next_group: 0,
            next_tick: NextTick::default(),
            in_flight: 0,
            frame: 0,
            stats: LoaderStats::default(),
        })
    }

    /// Replace the file store
    pub fn with_store(mut self, files: impl FileStore + 'static) -> Self {
        self.files = Box::new(files);
        self
    }

    /// Replace the media decoder
    pub fn with_decoder(mut self, decoder: impl MediaDecoder + 'static) -> Self {
        self.decoder = Box::new(decoder);
        self
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn version_store(&self) -> &VersionStore {
        &self.versions
    }

    pub fn stats(&self) -> &LoaderStats {
        &self.stats
    }

    /// Number of ticks run so far
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Requests running on the transport after the last tick
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Requests not yet delivered (live and waiting in the inbox)
    pub fn pending_count(&self) -> usize {
        self.live.len() + self.inbox.len()
    }

    /// Handle for enqueueing from callbacks
    pub fn enqueuer(&self) -> Enqueuer {
        Enqueuer {
            inbox: self.inbox.clone(),
        }
    }

    /// Queue a request for the next tick
    pub fn enqueue(&mut self, request: FetchRequest) -> LoaderResult<RequestId> {
        self.inbox.push(request)
    }

    /// Queue a typed load; `on_loaded` runs once the payload is available.
    /// The request is dropped after delivery.
    pub fn load<T>(
        &mut self,
        locator: impl Into<String>,
        mut on_loaded: impl FnMut(&T) + 'static,
    ) -> LoaderResult<RequestId>
    where
        T: PayloadType + ?Sized + 'static,
    {
        let request = FetchRequest::of::<T>(locator).on_success(move |request| {
            if let Some(value) = request.result::<T>() {
                on_loaded(value);
            }
        });
        self.enqueue(request)
    }

    /// Look up a live or settled request. Requests not marked
    /// [`FetchRequest::retain`] are gone once delivered.
    pub fn get(&self, id: RequestId) -> Option<&FetchRequest> {
        find_request(&self.live, &self.settled, id)
    }

    /// Typed payload of a finished request
    pub fn payload<T: PayloadType + ?Sized>(&self, id: RequestId) -> Option<&T> {
        self.settled.get(&id)?.result::<T>()
    }

    /// Take ownership of a settled request. Group members stay with their
    /// group.
    pub fn take(&mut self, id: RequestId) -> Option<FetchRequest> {
        let request = self.settled.get(&id)?;
        if let Some(group) = request.group() {
            log::warn!("{} belongs to {}; release the group instead", id, group);
            return None;
        }
        self.settled.remove(&id)
    }

    /// Drop a settled request
    pub fn release(&mut self, id: RequestId) -> bool {
        self.take(id).is_some()
    }

    /// Retry a failed request. Returns `Ok(false)` when the request has not
    /// failed.
    pub fn retry(&mut self, id: RequestId) -> LoaderResult<bool> {
        if let Some(request) = self.live.iter_mut().find(|r| r.id() == id) {
            return Ok(request.retry());
        }

        let request = self
            .settled
            .get_mut(&id)
            .ok_or(LoaderError::UnknownRequest(id.0))?;
        if !request.retry() {
            return Ok(false);
        }

        if let Some(request) = self.settled.remove(&id) {
            if let Some(group) = request.group() {
                self.next_tick.schedule(Deferred::RecomputeGroup(group));
            }
            self.inbox.push(request)?;
        }
        Ok(true)
    }

    /// Cancel an undelivered request. It is delivered as failed on the next
    /// tick. Returns `Ok(false)` when it already finished.
    pub fn cancel(&mut self, id: RequestId) -> LoaderResult<bool> {
        let cancelled = self
            .with_request_mut(id, |request| request.cancel())
            .ok_or(LoaderError::UnknownRequest(id.0))?;
        if cancelled {
            log::info!("Cancelled {}", id);
        }
        Ok(cancelled)
    }

    /// Add a listener to a request
    pub fn subscribe(
        &mut self,
        id: RequestId,
        event: RequestEvent,
        listener: impl FnMut(&FetchRequest) + 'static,
    ) -> LoaderResult<SubscriptionId> {
        self.with_request_mut(id, move |request| request.subscribe(event, listener))
            .ok_or(LoaderError::UnknownRequest(id.0))
    }

    /// Remove a listener; returns whether it was registered
    pub fn unsubscribe(&mut self, id: RequestId, subscription: SubscriptionId) -> bool {
        self.with_request_mut(id, |request| request.unsubscribe(subscription))
            .unwrap_or(false)
    }

    fn with_request_mut<R>(
        &mut self,
        id: RequestId,
        f: impl FnOnce(&mut FetchRequest) -> R,
    ) -> Option<R> {
        if let Some(request) = self.live.iter_mut().find(|r| r.id() == id) {
            return Some(f(request));
        }
        if let Some(request) = self.settled.get_mut(&id) {
            return Some(f(request));
        }

        self.inbox
            .pending
            .borrow_mut()
            .iter_mut()
            .find(|r| r.id() == id)
            .map(f)
    }

    /// Persist the version manifest now if it has unsaved changes
    pub fn flush(&mut self) -> LoaderResult<()> {
        if self.versions.is_dirty() {
            self.versions.save(self.files.as_ref())?;
        }
        Ok(())
    }

    /// Advance every request by one step
    pub fn tick(&mut self) {
        self.frame += 1;

        if !self.versions.is_loaded() {
            self.versions.load(self.files.as_ref());
        }
        self.run_deferred();

        let mut working = std::mem::take(&mut self.live);
        working.append(&mut self.inbox.take());

        let mut env = LoadEnv {
            layout: &self.layout,
            files: self.files.as_ref(),
            transport: self.transport.as_ref(),
            decoder: self.decoder.as_ref(),
            versions: &mut self.versions,
            default_timeout: self.config.default_timeout(),
        };

        // Status pass
        let mut in_flight = 0;
        let mut remaining = Vec::with_capacity(working.len());
        for mut request in working {
            if request.needs_local_check() {
                let check = request.check_local(&env);
                self.stats.record_check(check);
            } else if request.is_loading() {
                request.update(&mut env);
                if let Some(group) = request.group() {
                    self.next_tick.schedule(Deferred::RecomputeGroup(group));
                }
            }

            if request.is_done() {
                request.deliver();
                self.stats.record_done(&request);
                if let Some(group) = request.group() {
                    self.next_tick.schedule(Deferred::RecomputeGroup(group));
                }
                log::debug!(
                    "Delivered {} {} ({})",
                    request.id(),
                    request.locator(),
                    if request.is_success() { "ok" } else { "failed" }
                );
                if request.is_retained() {
                    self.settled.insert(request.id(), request);
                }
                continue;
            }

            if request.is_loading() {
                in_flight += 1;
            }
            remaining.push(request);
        }

        // Admission pass
        let mut network_budget = self.config.max_concurrent_network.saturating_sub(in_flight);
        let mut disk_budget = self.config.max_disk_ops_per_tick;

        for request in remaining.iter_mut() {
            if request.local_phase() != Phase::CacheHit {
                continue;
            }

            let budget = if request.kind().reads_directly() {
                &mut disk_budget
            } else {
                &mut network_budget
            };
            if *budget == 0 {
                continue;
            }
            *budget -= 1;
            request.load_local(&env);
        }

        for request in remaining.iter_mut() {
            if network_budget == 0 {
                break;
            }
            if request.will_check_network() {
                request.load_network(&env);
                network_budget -= 1;
                self.stats.network_fetches += 1;
            }
        }

        // Requests enqueued by callbacks during this tick
        remaining.append(&mut self.inbox.take());

        self.in_flight = remaining.iter().filter(|r| r.is_loading()).count();
        self.live = remaining;

        if self.versions.is_dirty() {
            self.next_tick.schedule(Deferred::PersistVersions);
        }
    }

    fn run_deferred(&mut self) {
        for item in self.next_tick.drain() {
            match item {
                Deferred::PersistVersions => {
                    if !self.versions.is_dirty() {
                        continue;
                    }
                    if let Err(e) = self.versions.save(self.files.as_ref()) {
                        log::warn!("Failed to persist version manifest: {}", e);
                    }
                }
                Deferred::RecomputeGroup(id) => self.recompute_group(id),
            }
        }
    }

    fn recompute_group(&mut self, id: GroupId) {
        let Some(group) = self.groups.get_mut(&id) else {
            return;
        };

        let resolved: Vec<&FetchRequest> = group
            .members()
            .iter()
            .filter_map(|member| find_request(&self.live, &self.settled, *member))
            .collect();
        group.recompute(&resolved);
    }

    /// Create an empty group
    pub fn create_group(&mut self) -> GroupId {
        self.next_group += 1;
        let id = GroupId(self.next_group);
        self.groups.insert(id, RequestGroup::new(id));
        id
    }

    /// Create a group loading `locators` as `T`, with a completion callback
    pub fn create_group_with<T, I, S>(
        &mut self,
        locators: I,
        on_complete: impl FnOnce(&GroupView<'_>) + 'static,
    ) -> LoaderResult<GroupId>
    where
        T: PayloadType + ?Sized,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = self.create_group();
        self.on_group_complete(id, on_complete)?;
        for locator in locators {
            self.group_load::<T>(id, locator)?;
        }
        Ok(id)
    }

    /// Set the callback fired once every member of the group is terminal
    pub fn on_group_complete(
        &mut self,
        id: GroupId,
        on_complete: impl FnOnce(&GroupView<'_>) + 'static,
    ) -> LoaderResult<()> {
        let group = self
            .groups
            .get_mut(&id)
            .ok_or(LoaderError::UnknownGroup(id.0))?;
        group.set_on_complete(Box::new(on_complete));
        Ok(())
    }

    /// Enqueue a request as a member of a group
    pub fn group_add(&mut self, id: GroupId, mut request: FetchRequest) -> LoaderResult<RequestId> {
        let group = self
            .groups
            .get_mut(&id)
            .ok_or(LoaderError::UnknownGroup(id.0))?;

        request.group = Some(id);
        let member = self.inbox.push(request)?;
        group.push(member);
        Ok(member)
    }

    /// Enqueue a typed load as a member of a group
    pub fn group_load<T: PayloadType + ?Sized>(
        &mut self,
        id: GroupId,
        locator: impl Into<String>,
    ) -> LoaderResult<RequestId> {
        self.group_add(id, FetchRequest::of::<T>(locator))
    }

    pub fn group(&self, id: GroupId) -> Option<&RequestGroup> {
        self.groups.get(&id)
    }

    /// View of a group's members that have been picked up by a tick
    pub fn group_view(&self, id: GroupId) -> Option<GroupView<'_>> {
        let group = self.groups.get(&id)?;
        let requests = group
            .members()
            .iter()
            .filter_map(|member| find_request(&self.live, &self.settled, *member))
            .collect();
        Some(GroupView::new(id, requests))
    }

    /// Typed result of the member at `index`
    pub fn group_result<T: PayloadType + ?Sized>(&self, id: GroupId, index: usize) -> Option<&T> {
        let member = *self.groups.get(&id)?.members().get(index)?;
        self.payload::<T>(member)
    }

    /// Typed results of every member in order
    pub fn group_results<T: PayloadType + ?Sized>(&self, id: GroupId) -> Vec<Option<&T>> {
        let Some(group) = self.groups.get(&id) else {
            return Vec::new();
        };
        group
            .members()
            .iter()
            .map(|member| self.payload::<T>(*member))
            .collect()
    }

    /// Retry every failed member; returns how many were retried
    pub fn retry_group(&mut self, id: GroupId) -> LoaderResult<usize> {
        let members = self
            .groups
            .get(&id)
            .ok_or(LoaderError::UnknownGroup(id.0))?
            .members()
            .to_vec();

        let mut retried = 0;
        for member in members {
            let failed = self.get(member).is_some_and(|r| r.is_failed());
            if failed && self.retry(member)? {
                retried += 1;
            }
        }
        Ok(retried)
    }

    /// Remove a group and drop its members, finished or not. Returns the
    /// number of members released.
    pub fn remove_group(&mut self, id: GroupId) -> LoaderResult<usize> {
        let group = self
            .groups
            .remove(&id)
            .ok_or(LoaderError::UnknownGroup(id.0))?;

        let before = self.live.len() + self.settled.len() + self.inbox.len();
        self.settled.retain(|_, r| r.group() != Some(id));
        self.live.retain(|r| r.group() != Some(id));
        self.inbox.pending.borrow_mut().retain(|r| r.group() != Some(id));
        let released = before - (self.live.len() + self.settled.len() + self.inbox.len());

        log::debug!("Removed {} ({} of {} members released)", id, released, group.len());
        Ok(released)
    }
}

impl Drop for RequestScheduler {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::warn!("Failed to persist version manifest on shutdown: {}", e);
        }
    }
}

fn find_request<'a>(
    live: &'a [FetchRequest],
    settled: &'a HashMap<RequestId, FetchRequest>,
    id: RequestId,
) -> Option<&'a FetchRequest> {
    settled
        .get(&id)
        .or_else(|| live.iter().find(|r| r.id() == id))
}
