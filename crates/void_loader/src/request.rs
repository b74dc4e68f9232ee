//! Fetch requests
//!
//! A request runs two phase machines side by side:
//!
//! - local: `Idle -> {Failed | CacheHit}` on the cache check, then
//!   `CacheHit -> Running -> {Succeeded | Failed}` when the cached copy is
//!   loaded.
//! - network: `Idle -> Running -> {Succeeded | Failed}`, only once the local
//!   phase has failed.
//!
//! A failed local phase is never terminal; the request falls through to the
//! network. A failed network phase is.

use std::fmt;
use std::time::Duration;

use crate::cache_key::{derive_id, is_safe_id};
use crate::error::{DecodeError, LoaderError, TransportError};
use crate::group::GroupId;
use crate::payload::{MediaDecoder, Payload, PayloadKind, PayloadType};
use crate::storage::{file_locator, CacheLayout, FileStore};
use crate::transport::{FetchHandle, FetchPoll, FetchSpec, Transport};
use crate::version::VersionStore;

/// Share of the progress bar owned by the local phase
pub const LOCAL_WEIGHT: f32 = 0.2;
/// Share of the progress bar owned by the network phase
pub const NETWORK_WEIGHT: f32 = 1.0 - LOCAL_WEIGHT;

/// Identifier assigned to a request when it is enqueued
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

impl RequestId {
    pub const UNASSIGNED: Self = Self(0);
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// State of one phase machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// A fresh cached copy exists (local phase only)
    CacheHit,
    Running,
    Failed,
    Succeeded,
}

/// Outcome of a local cache check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalCheck {
    /// Caching is disabled for the request
    Disabled,
    /// The version store has no entry
    Miss,
    /// The manifest has an entry but the file is gone
    Missing,
    /// The cached file is empty
    Empty,
    /// The cached copy is older than requested
    Stale { stored: u32, expected: u32 },
    /// A usable cached copy
    Hit { version: u32 },
    /// The local phase was not idle
    Skipped,
}

impl LocalCheck {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit { .. })
    }
}

/// Events a listener can subscribe to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestEvent {
    /// Fired on every poll while a phase is running
    Progress,
    /// Fired once when the request succeeds
    Success,
    /// Fired once when the request fails
    Failure,
}

/// Token returned by [`FetchRequest::subscribe`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

type Listener = Box<dyn FnMut(&FetchRequest)>;

/// Collaborators a request needs to advance
pub(crate) struct LoadEnv<'a> {
    pub layout: &'a CacheLayout,
    pub files: &'a dyn FileStore,
    pub transport: &'a dyn Transport,
    pub decoder: &'a dyn MediaDecoder,
    pub versions: &'a mut VersionStore,
    pub default_timeout: Option<Duration>,
}

/// One logical fetch
pub struct FetchRequest {
    id: RequestId,
    locator: String,
    kind: PayloadKind,
    cache_id: Option<String>,
    expected_version: u32,
    timeout: Option<Duration>,

    local: Phase,
    network: Phase,
    progress: f32,
    payload: Option<Payload>,
    error: Option<LoaderError>,
    bytes_received: usize,

    local_fetch: Option<Box<dyn FetchHandle>>,
    network_fetch: Option<Box<dyn FetchHandle>>,

    listeners: Vec<(SubscriptionId, RequestEvent, Listener)>,
    next_subscription: u64,
    retain: bool,
    pub(crate) group: Option<GroupId>,
}

impl FetchRequest {
    /// Create a request; the cache id is derived from the locator
    pub fn new(locator: impl Into<String>, kind: PayloadKind) -> Self {
        let locator = locator.into().replace('\\', "/");
        let cache_id = (!locator.is_empty())
            .then(|| derive_id(&locator))
            .filter(|id| {
                let safe = is_safe_id(id);
                if !safe {
                    log::warn!("No usable cache id for {}, caching disabled", locator);
                }
                safe
            });

        Self {
            id: RequestId::UNASSIGNED,
            locator,
            kind,
            cache_id,
            expected_version: 0,
            timeout: None,
            local: Phase::Idle,
            network: Phase::Idle,
            progress: 0.0,
            payload: None,
            error: None,
            bytes_received: 0,
            local_fetch: None,
            network_fetch: None,
            listeners: Vec::new(),
            next_subscription: 1,
            retain: false,
            group: None,
        }
    }

    /// Create a request producing `T`
    pub fn of<T: PayloadType + ?Sized>(locator: impl Into<String>) -> Self {
        Self::new(locator, T::KIND)
    }

    /// Minimum acceptable cached version
    pub fn expected_version(mut self, version: u32) -> Self {
        self.expected_version = version;
        self
    }

    /// Per-request timeout; 0 disables it
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = Some(Duration::from_secs(secs));
        self
    }

    /// Never read or write the local cache
    pub fn disable_local_cache(mut self) -> Self {
        if self.local != Phase::Idle {
            log::warn!("disable_local_cache on {} in local phase {:?}", self.locator, self.local);
        }
        self.cache_id = None;
        self
    }

    /// Cache under an explicit id instead of the derived one
    ///
    /// The id must name a single file; anything that could resolve outside
    /// the data directory disables caching for this request.
    pub fn local_cache_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if is_safe_id(&id) {
            self.cache_id = Some(id);
        } else {
            log::warn!("Rejected cache id {:?} for {}, caching disabled", id, self.locator);
            self.cache_id = None;
        }
        self
    }

    /// Keep the request in the scheduler after delivery, so its result stays
    /// reachable through `get`/`payload` until taken or released
    pub fn retain(mut self) -> Self {
        self.retain = true;
        self
    }

    pub fn on_progress(mut self, listener: impl FnMut(&FetchRequest) + 'static) -> Self {
        self.subscribe(RequestEvent::Progress, listener);
        self
    }

    pub fn on_success(mut self, listener: impl FnMut(&FetchRequest) + 'static) -> Self {
        self.subscribe(RequestEvent::Success, listener);
        self
    }

    pub fn on_failure(mut self, listener: impl FnMut(&FetchRequest) + 'static) -> Self {
        self.subscribe(RequestEvent::Failure, listener);
        self
    }

    /// Register a listener; the token removes exactly this listener
    pub fn subscribe(
        &mut self,
        event: RequestEvent,
        listener: impl FnMut(&FetchRequest) + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.listeners.push((id, event, Box::new(listener)));
        id
    }

    /// Remove a listener; returns whether it was registered
    pub fn unsubscribe(&mut self, subscription: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(id, _, _)| *id != subscription);
        self.listeners.len() != before
    }

    /// Whether the scheduler keeps this request after delivery; group
    /// members are always kept
    pub fn is_retained(&self) -> bool {
        self.retain || self.group.is_some()
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn kind(&self) -> PayloadKind {
        self.kind
    }

    /// Cache id, `None` when caching is disabled
    pub fn cache_id(&self) -> Option<&str> {
        self.cache_id.as_deref()
    }

    pub fn version(&self) -> u32 {
        self.expected_version
    }

    pub fn local_phase(&self) -> Phase {
        self.local
    }

    pub fn network_phase(&self) -> Phase {
        self.network
    }

    /// Weighted progress in [0, 1]
    pub fn progress(&self) -> f32 {
        self.progress
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    /// Typed view of the payload
    pub fn result<T: PayloadType + ?Sized>(&self) -> Option<&T> {
        self.payload.as_ref()?.get::<T>()
    }

    pub fn take_payload(&mut self) -> Option<Payload> {
        self.payload.take()
    }

    pub fn error(&self) -> Option<&LoaderError> {
        self.error.as_ref()
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.to_string())
    }

    /// Group the request belongs to
    pub fn group(&self) -> Option<GroupId> {
        self.group
    }

    /// Raw bytes received from the network
    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    pub fn is_success(&self) -> bool {
        self.local == Phase::Succeeded || self.network == Phase::Succeeded
    }

    /// Only a failed network phase fails the request
    pub fn is_failed(&self) -> bool {
        self.network == Phase::Failed
    }

    pub fn is_done(&self) -> bool {
        self.is_success() || self.is_failed()
    }

    pub fn is_loading(&self) -> bool {
        self.local == Phase::Running || self.network == Phase::Running
    }

    pub fn is_from_cache(&self) -> bool {
        self.local == Phase::Succeeded
    }

    pub fn is_from_network(&self) -> bool {
        self.network == Phase::Succeeded
    }

    pub fn needs_local_check(&self) -> bool {
        self.local == Phase::Idle
    }

    /// Eligible for a network fetch
    pub fn will_check_network(&self) -> bool {
        self.local == Phase::Failed && self.network == Phase::Idle
    }

    pub(crate) fn assign_id(&mut self, id: RequestId) {
        self.id = id;
    }

    fn effective_timeout(&self, default: Option<Duration>) -> Option<Duration> {
        match self.timeout {
            Some(timeout) if timeout.is_zero() => None,
            Some(timeout) => Some(timeout),
            None => default,
        }
    }

    /// Resolve the local phase against the version store and the cached file
    pub(crate) fn check_local(&mut self, env: &LoadEnv<'_>) -> LocalCheck {
        if self.local != Phase::Idle {
            log::warn!("Skip local check for {}: local phase is {:?}", self.locator, self.local);
            return LocalCheck::Skipped;
        }

        self.local = Phase::Failed;

        let Some(id) = self.cache_id.as_deref() else {
            log::debug!("Local cache disabled for {}", self.locator);
            return LocalCheck::Disabled;
        };

        let Some(stored) = env.versions.get(id) else {
            log::debug!("No cache found for <{}> ({})", id, self.locator);
            return LocalCheck::Miss;
        };

        let path = env.layout.data_path(id);
        match env.files.size(&path) {
            Err(e) => {
                log::debug!("Cached v{} of <{}> is unreadable at {:?}: {}", stored, id, path, e);
                return LocalCheck::Missing;
            }
            Ok(0) => {
                log::debug!("Invalid cached v{} of <{}> (length = 0)", stored, id);
                return LocalCheck::Empty;
            }
            Ok(_) => {}
        }

        if stored >= self.expected_version {
            log::debug!("Cached v{} of <{}> found at {:?}", stored, id, path);
            self.local = Phase::CacheHit;
            LocalCheck::Hit { version: stored }
        } else {
            log::debug!(
                "Cached <{}> is stale: v{} < v{}",
                id,
                stored,
                self.expected_version
            );
            LocalCheck::Stale {
                stored,
                expected: self.expected_version,
            }
        }
    }

    /// Start loading the cached copy. Direct-read kinds finish immediately;
    /// media kinds go through the transport and finish on a later poll.
    pub(crate) fn load_local(&mut self, env: &LoadEnv<'_>) {
        if self.local != Phase::CacheHit {
            log::warn!("load_local on {}: local phase is {:?}", self.locator, self.local);
            return;
        }

        let Some(id) = self.cache_id.as_deref() else {
            self.local = Phase::Failed;
            return;
        };
        let path = env.layout.data_path(id);
        self.local = Phase::Running;

        if self.kind.reads_directly() {
            match env.files.read(&path) {
                Ok(data) => {
                    let decoded = self.kind.decode(data, env.decoder);
                    self.finish_local(decoded);
                }
                Err(source) => {
                    let err = LoaderError::LocalRead { path, source };
                    log::warn!("{}; falling back to network for {}", err, self.locator);
                    self.local = Phase::Failed;
                }
            }
            return;
        }

        let spec = FetchSpec::new(file_locator(&path))
            .with_timeout(self.effective_timeout(env.default_timeout));
        self.local_fetch = Some(env.transport.fetch(spec));
    }

    fn finish_local(&mut self, decoded: Result<Payload, DecodeError>) {
        match decoded {
            Ok(payload) => {
                self.payload = Some(payload);
                self.local = Phase::Succeeded;
                self.progress = 1.0;
            }
            Err(e) => {
                log::warn!("Corrupt cache for {}: {}; falling back to network", self.locator, e);
                self.local = Phase::Failed;
                self.progress = 0.0;
            }
        }
    }

    /// Start the network fetch
    pub(crate) fn load_network(&mut self, env: &LoadEnv<'_>) {
        if !self.will_check_network() {
            log::warn!(
                "load_network on {}: network phase is {:?}, local phase is {:?}",
                self.locator,
                self.network,
                self.local
            );
            return;
        }

        self.network = Phase::Running;
        let spec = FetchSpec::new(self.locator.clone())
            .with_timeout(self.effective_timeout(env.default_timeout));
        self.network_fetch = Some(env.transport.fetch(spec));
    }

    /// Poll whichever phase is running
    pub(crate) fn update(&mut self, env: &mut LoadEnv<'_>) {
        if self.local == Phase::Running {
            self.update_local(env);
            return;
        }

        if self.network == Phase::Running {
            self.update_network(env);
            return;
        }

        log::warn!(
            "update on {} with nothing running: local {:?}, network {:?}",
            self.locator,
            self.local,
            self.network
        );
    }

    fn update_local(&mut self, env: &LoadEnv<'_>) {
        let Some(handle) = self.local_fetch.as_mut() else {
            log::warn!("Local phase of {} is running without a fetch", self.locator);
            self.local = Phase::Failed;
            return;
        };

        match handle.poll() {
            FetchPoll::Pending(sub) => {
                self.progress = LOCAL_WEIGHT * sub.clamp(0.0, 1.0);
                self.emit(RequestEvent::Progress);
            }
            FetchPoll::Done(Ok(data)) => {
                self.local_fetch = None;
                let decoded = self.kind.decode(data, env.decoder);
                self.finish_local(decoded);
            }
            FetchPoll::Done(Err(e)) => {
                self.local_fetch = None;
                log::warn!("Local load of {} failed: {}; falling back to network", self.locator, e);
                self.local = Phase::Failed;
                self.progress = 0.0;
            }
        }
    }

    fn update_network(&mut self, env: &mut LoadEnv<'_>) {
        let Some(handle) = self.network_fetch.as_mut() else {
            log::warn!("Network phase of {} is running without a fetch", self.locator);
            self.fail(LoaderError::Transport(TransportError::Network(
                "fetch handle missing".to_string(),
            )));
            return;
        };

        match handle.poll() {
            FetchPoll::Pending(sub) => {
                self.progress = LOCAL_WEIGHT + NETWORK_WEIGHT * sub.clamp(0.0, 1.0);
                self.emit(RequestEvent::Progress);
            }
            FetchPoll::Done(Ok(data)) => {
                self.network_fetch = None;
                self.bytes_received = data.len();

                let raw = self.cache_id.is_some().then(|| data.clone());
                match self.kind.decode(data, env.decoder) {
                    Ok(payload) => {
                        self.payload = Some(payload);
                        self.network = Phase::Succeeded;
                        self.progress = 1.0;
                        if let Some(raw) = raw {
                            self.write_cache(env, &raw);
                        }
                    }
                    Err(e) => {
                        log::warn!("Load error: {}\n{}", self.locator, e);
                        self.fail(e.into());
                    }
                }
            }
            FetchPoll::Done(Err(e)) => {
                self.network_fetch = None;
                log::warn!("Load error: {}\n{}", self.locator, e);
                self.fail(e.into());
            }
        }
    }

    fn fail(&mut self, error: LoaderError) {
        self.network = Phase::Failed;
        self.progress = 0.0;
        self.error = Some(error);
    }

    /// Best effort: a failed cache write never fails the request
    fn write_cache(&self, env: &mut LoadEnv<'_>, raw: &[u8]) {
        let Some(id) = self.cache_id.as_deref() else {
            return;
        };
        let path = env.layout.data_path(id);
        log::debug!("Writing cache: {:?} -> <{}> v{}", path, id, self.expected_version);

        if let Err(source) = env.files.write(&path, raw) {
            let err = LoaderError::Persist { path, source };
            log::warn!("Write cache error for {}: {}", self.locator, err);
            return;
        }

        if let Err(e) = env.versions.write(id, self.expected_version) {
            log::debug!("Version not recorded for {}: {}", id, e);
        }
    }

    /// Fire the terminal listeners
    pub(crate) fn deliver(&mut self) {
        if self.is_success() {
            self.progress = 1.0;
            self.emit(RequestEvent::Success);
        } else if self.is_failed() {
            self.progress = 0.0;
            self.emit(RequestEvent::Failure);
        } else {
            log::warn!("deliver on unfinished request {}", self.locator);
        }
    }

    fn emit(&mut self, event: RequestEvent) {
        let mut listeners = std::mem::take(&mut self.listeners);
        for (_, kind, listener) in listeners.iter_mut() {
            if *kind == event {
                listener(self);
            }
        }
        self.listeners = listeners;
    }

    /// Reset a failed request so it can be enqueued again. Only legal after
    /// the network phase failed; otherwise a logged no-op.
    pub fn retry(&mut self) -> bool {
        if self.network != Phase::Failed {
            log::warn!(
                "Retry ignored for {}: network phase must be Failed, is {:?}",
                self.locator,
                self.network
            );
            return false;
        }

        self.local = Phase::Idle;
        self.network = Phase::Idle;
        self.progress = 0.0;
        self.payload = None;
        self.error = None;
        self.bytes_received = 0;
        self.local_fetch = None;
        self.network_fetch = None;

        log::info!("Retrying: {}", self.locator);
        true
    }

    /// Abandon in-flight work and fail the request
    pub(crate) fn cancel(&mut self) -> bool {
        if self.is_done() {
            return false;
        }

        self.local_fetch = None;
        self.network_fetch = None;
        if self.local != Phase::Succeeded {
            self.local = Phase::Failed;
        }
        self.fail(TransportError::Cancelled.into());
        true
    }
}

impl fmt::Debug for FetchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchRequest")
            .field("id", &self.id)
            .field("locator", &self.locator)
            .field("kind", &self.kind)
            .field("cache_id", &self.cache_id)
            .field("expected_version", &self.expected_version)
            .field("local", &self.local)
            .field("network", &self.network)
            .field("progress", &self.progress)
            .field("error", &self.error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::StandardDecoder;
    use crate::storage::DiskStore;
    use crate::transport::MemoryTransport;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Fixture {
        _dir: tempfile::TempDir,
        layout: CacheLayout,
        versions: VersionStore,
        transport: MemoryTransport,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let layout = CacheLayout::new(dir.path());
            let versions = VersionStore::new(layout.manifest_path());
            Self {
                _dir: dir,
                layout,
                versions,
                transport: MemoryTransport::new(),
            }
        }

        fn env(&mut self) -> LoadEnv<'_> {
            LoadEnv {
                layout: &self.layout,
                files: &DiskStore,
                transport: &self.transport,
                decoder: &StandardDecoder,
                versions: &mut self.versions,
                default_timeout: None,
            }
        }

        fn seed(&mut self, id: &str, version: u32, data: &[u8]) {
            DiskStore.write(&self.layout.data_path(id), data).unwrap();
            self.versions.write(id, version).unwrap();
        }
    }

    #[test]
    fn test_disabled_cache_fails_immediately() {
        let mut fx = Fixture::new();
        let mut req = FetchRequest::new("http://host/a.txt", PayloadKind::Text).disable_local_cache();
        fx.seed(&derive_id("http://host/a.txt"), 1, b"cached");

        assert_eq!(req.check_local(&fx.env()), LocalCheck::Disabled);
        assert_eq!(req.local_phase(), Phase::Failed);
        assert!(req.will_check_network());
        assert!(!req.is_failed());
    }

    #[test]
    fn test_escaping_cache_id_disables_cache() {
        let mut fx = Fixture::new();
        let mut req = FetchRequest::new("http://host/x.txt", PayloadKind::Text)
            .local_cache_id("../../escaped.txt")
            .expected_version(1);

        assert_eq!(req.cache_id(), None);
        assert_eq!(req.check_local(&fx.env()), LocalCheck::Disabled);
        assert!(req.will_check_network());

        let absolute = FetchRequest::new("http://host/x.txt", PayloadKind::Text).local_cache_id("/tmp/x");
        assert_eq!(absolute.cache_id(), None);

        let dotted = FetchRequest::new("..", PayloadKind::Bytes);
        assert_eq!(dotted.cache_id(), None);
    }

    #[test]
    fn test_check_local_outcomes() {
        let mut fx = Fixture::new();

        let mut miss = FetchRequest::new("http://host/miss", PayloadKind::Bytes);
        assert_eq!(miss.check_local(&fx.env()), LocalCheck::Miss);

        fx.versions.write("gone", 1).unwrap();
        let mut missing = FetchRequest::new("http://host/gone", PayloadKind::Bytes).local_cache_id("gone");
        assert_eq!(missing.check_local(&fx.env()), LocalCheck::Missing);

        fx.seed("empty", 1, b"");
        let mut empty = FetchRequest::new("http://host/empty", PayloadKind::Bytes).local_cache_id("empty");
        assert_eq!(empty.check_local(&fx.env()), LocalCheck::Empty);

        fx.seed("old", 1, b"v1");
        let mut stale = FetchRequest::new("http://host/old", PayloadKind::Bytes)
            .local_cache_id("old")
            .expected_version(2);
        assert_eq!(
            stale.check_local(&fx.env()),
            LocalCheck::Stale { stored: 1, expected: 2 }
        );
        assert_eq!(stale.local_phase(), Phase::Failed);

        let mut hit = FetchRequest::new("http://host/old", PayloadKind::Bytes)
            .local_cache_id("old")
            .expected_version(1);
        assert_eq!(hit.check_local(&fx.env()), LocalCheck::Hit { version: 1 });
        assert_eq!(hit.local_phase(), Phase::CacheHit);

        assert_eq!(hit.check_local(&fx.env()), LocalCheck::Skipped);
    }

    #[test]
    fn test_load_local_direct_read() {
        let mut fx = Fixture::new();
        fx.seed("greeting", 3, b"hello");

        let mut req = FetchRequest::of::<str>("http://host/greeting").local_cache_id("greeting");
        assert!(req.check_local(&fx.env()).is_hit());
        req.load_local(&fx.env());

        assert_eq!(req.local_phase(), Phase::Succeeded);
        assert!(req.is_success() && req.is_from_cache());
        assert_eq!(req.result::<str>(), Some("hello"));
        assert_eq!(req.progress(), 1.0);
        assert!(fx.transport.fetched().is_empty());
    }

    #[test]
    fn test_load_local_vanished_file_falls_back() {
        let mut fx = Fixture::new();
        fx.seed("flaky", 1, b"data");

        let mut req = FetchRequest::new("http://host/flaky", PayloadKind::Bytes).local_cache_id("flaky");
        assert!(req.check_local(&fx.env()).is_hit());
        DiskStore.remove(&fx.layout.data_path("flaky")).unwrap();

        req.load_local(&fx.env());
        assert_eq!(req.local_phase(), Phase::Failed);
        assert!(req.will_check_network());
        assert!(req.error().is_none());
    }

    #[test]
    fn test_load_local_media_uses_transport() {
        let mut fx = Fixture::new();
        let png = crate::payload::ImageData {
            width: 1,
            height: 1,
            pixels: vec![1, 2, 3, 255],
        }
        .encode_png()
        .unwrap();
        fx.seed("icon", 1, &png);

        let mut req = FetchRequest::new("http://host/icon.png", PayloadKind::Image).local_cache_id("icon");
        assert!(req.check_local(&fx.env()).is_hit());
        req.load_local(&fx.env());
        assert_eq!(req.local_phase(), Phase::Running);
        assert!(req.is_loading());

        req.update(&mut fx.env());
        assert_eq!(req.local_phase(), Phase::Succeeded);
        assert_eq!(req.result::<crate::payload::ImageData>().unwrap().pixels, vec![1, 2, 3, 255]);
        assert!(fx.transport.fetched()[0].starts_with("file://"));
    }

    #[test]
    fn test_network_success_writes_cache() {
        let mut fx = Fixture::new();
        fx.transport.serve("http://host/data.bin", b"remote".to_vec());

        let mut req = FetchRequest::new("http://host/data.bin", PayloadKind::Bytes).expected_version(4);
        req.check_local(&fx.env());
        req.load_network(&fx.env());
        assert_eq!(req.network_phase(), Phase::Running);

        req.update(&mut fx.env());
        assert!(req.is_from_network());
        assert_eq!(req.result::<[u8]>(), Some(&b"remote"[..]));
        assert_eq!(req.bytes_received(), 6);

        let id = req.cache_id().unwrap().to_string();
        assert_eq!(fx.versions.get(&id), Some(4));
        assert_eq!(DiskStore.read(&fx.layout.data_path(&id)).unwrap(), b"remote");
    }

    #[test]
    fn test_network_without_cache_writes_nothing() {
        let mut fx = Fixture::new();
        fx.transport.serve("http://host/live", b"fresh".to_vec());

        let mut req = FetchRequest::new("http://host/live", PayloadKind::Bytes).disable_local_cache();
        req.check_local(&fx.env());
        req.load_network(&fx.env());
        req.update(&mut fx.env());

        assert!(req.is_success());
        assert!(fx.versions.is_empty());
    }

    #[test]
    fn test_transport_failure_sets_error() {
        let mut fx = Fixture::new();
        fx.transport.fail("http://host/down", TransportError::Network("refused".to_string()));

        let mut req = FetchRequest::new("http://host/down", PayloadKind::Bytes);
        req.check_local(&fx.env());
        req.load_network(&fx.env());
        req.update(&mut fx.env());

        assert!(req.is_failed() && req.is_done());
        assert_eq!(req.progress(), 0.0);
        assert!(req.error_message().unwrap().contains("refused"));
    }

    #[test]
    fn test_network_requires_failed_local() {
        let mut fx = Fixture::new();
        let mut req = FetchRequest::new("http://host/x", PayloadKind::Bytes);

        req.load_network(&fx.env());
        assert_eq!(req.network_phase(), Phase::Idle);
        assert!(fx.transport.fetched().is_empty());
    }

    #[test]
    fn test_progress_weights() {
        let mut fx = Fixture::new();
        fx.transport.serve_after("http://host/slow", b"x".to_vec(), 3);

        let mut req = FetchRequest::new("http://host/slow", PayloadKind::Bytes);
        req.check_local(&fx.env());
        req.load_network(&fx.env());

        let mut last = 0.0;
        for _ in 0..3 {
            req.update(&mut fx.env());
            assert!(req.progress() >= LOCAL_WEIGHT);
            assert!(req.progress() > last && req.progress() < 1.0);
            last = req.progress();
        }
        req.update(&mut fx.env());
        assert_eq!(req.progress(), 1.0);
    }

    #[test]
    fn test_retry_only_after_network_failure() {
        let mut fx = Fixture::new();
        let mut req = FetchRequest::new("http://host/missing", PayloadKind::Bytes);

        assert!(!req.retry());
        assert_eq!(req.local_phase(), Phase::Idle);

        req.check_local(&fx.env());
        assert!(!req.retry());
        assert_eq!(req.local_phase(), Phase::Failed);

        req.load_network(&fx.env());
        req.update(&mut fx.env());
        assert!(req.is_failed());

        assert!(req.retry());
        assert_eq!(req.local_phase(), Phase::Idle);
        assert_eq!(req.network_phase(), Phase::Idle);
        assert!(req.error().is_none());
    }

    #[test]
    fn test_listeners_and_unsubscribe() {
        let successes = Rc::new(Cell::new(0));
        let failures = Rc::new(Cell::new(0));

        let s = successes.clone();
        let f = failures.clone();
        let mut req = FetchRequest::new("http://host/x", PayloadKind::Bytes)
            .on_success(move |_| s.set(s.get() + 1))
            .on_failure(move |r| {
                assert!(r.is_failed());
                f.set(f.get() + 1)
            });

        let extra = successes.clone();
        let token = req.subscribe(RequestEvent::Success, move |_| extra.set(extra.get() + 10));
        assert!(req.unsubscribe(token));
        assert!(!req.unsubscribe(token));

        let mut fx = Fixture::new();
        req.check_local(&fx.env());
        req.load_network(&fx.env());
        req.update(&mut fx.env());
        req.deliver();

        assert_eq!(successes.get(), 0);
        assert_eq!(failures.get(), 1);
    }

    #[test]
    fn test_cancel() {
        let mut fx = Fixture::new();
        fx.transport.serve_after("http://host/slow", b"x".to_vec(), 10);

        let mut req = FetchRequest::new("http://host/slow", PayloadKind::Bytes);
        req.check_local(&fx.env());
        req.load_network(&fx.env());

        assert!(req.cancel());
        assert!(req.is_failed());
        assert!(!req.is_loading());
        assert!(matches!(
            req.error(),
            Some(LoaderError::Transport(TransportError::Cancelled))
        ));
        assert!(!req.cancel());
    }

    #[test]
    fn test_backslashes_normalised() {
        let req = FetchRequest::new("http://host\\dir\\file.txt", PayloadKind::Text);
        assert_eq!(req.locator(), "http://host/dir/file.txt");
        assert_eq!(req.cache_id(), Some("host_dir_file.txt"));
    }
}
