//! Transport abstraction
//!
//! A transport starts fetches and hands back a [`FetchHandle`] that the
//! scheduler polls once per tick. Polling never blocks.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::TransportError;
use crate::storage::locator_path;

/// What to fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSpec {
    pub locator: String,
    pub timeout: Option<Duration>,
}

impl FetchSpec {
    pub fn new(locator: impl Into<String>) -> Self {
        Self {
            locator: locator.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Result of polling a fetch
#[derive(Debug, Clone, PartialEq)]
pub enum FetchPoll {
    /// Still running, with download progress in [0, 1]
    Pending(f32),
    /// Finished; raw bytes or the transport error
    Done(Result<Vec<u8>, TransportError>),
}

/// An in-flight fetch. Dropping the handle abandons the fetch.
pub trait FetchHandle {
    fn poll(&mut self) -> FetchPoll;
}

/// Starts fetches
pub trait Transport {
    fn fetch(&self, spec: FetchSpec) -> Box<dyn FetchHandle>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn fetch(&self, spec: FetchSpec) -> Box<dyn FetchHandle> {
        (**self).fetch(spec)
    }
}

#[derive(Debug, Clone)]
struct Route {
    response: Result<Vec<u8>, TransportError>,
    polls: u32,
}

#[derive(Debug, Default)]
struct MemoryState {
    routes: HashMap<String, Route>,
    fetched: Vec<String>,
}

/// Transport serving registered responses from memory.
///
/// `file://` locators are read from disk. Unknown locators fail with
/// HTTP 404. Clones share their routes and fetch log.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve bytes on the first poll
    pub fn serve(&self, locator: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.serve_after(locator, data, 0);
    }

    /// Serve bytes after the handle reported `Pending` for `polls` polls
    pub fn serve_after(&self, locator: impl Into<String>, data: impl Into<Vec<u8>>, polls: u32) {
        self.state.lock().routes.insert(
            locator.into(),
            Route {
                response: Ok(data.into()),
                polls,
            },
        );
    }

    /// Fail fetches of a locator
    pub fn fail(&self, locator: impl Into<String>, error: TransportError) {
        self.state.lock().routes.insert(
            locator.into(),
            Route {
                response: Err(error),
                polls: 0,
            },
        );
    }

    /// Forget a route; later fetches 404
    pub fn remove(&self, locator: &str) {
        self.state.lock().routes.remove(locator);
    }

    /// Every locator fetched so far, in order
    pub fn fetched(&self) -> Vec<String> {
        self.state.lock().fetched.clone()
    }

    /// How many times a locator was fetched
    pub fn fetch_count(&self, locator: &str) -> usize {
        self.state
            .lock()
            .fetched
            .iter()
            .filter(|l| l.as_str() == locator)
            .count()
    }
}

impl Transport for MemoryTransport {
    fn fetch(&self, spec: FetchSpec) -> Box<dyn FetchHandle> {
        let mut state = self.state.lock();
        state.fetched.push(spec.locator.clone());

        let route = match locator_path(&spec.locator) {
            Some(path) => Route {
                response: std::fs::read(&path).map_err(|e| TransportError::Network(e.to_string())),
                polls: 0,
            },
            None => state.routes.get(&spec.locator).cloned().unwrap_or(Route {
                response: Err(TransportError::Http {
                    status: 404,
                    reason: "Not Found".to_string(),
                }),
                polls: 0,
            }),
        };

        Box::new(MemoryFetch {
            total: route.polls,
            remaining: route.polls,
            response: Some(route.response),
        })
    }
}

struct MemoryFetch {
    total: u32,
    remaining: u32,
    response: Option<Result<Vec<u8>, TransportError>>,
}

impl FetchHandle for MemoryFetch {
    fn poll(&mut self) -> FetchPoll {
        if self.remaining > 0 {
            self.remaining -= 1;
            let done = self.total - self.remaining;
            return FetchPoll::Pending(done as f32 / (self.total + 1) as f32);
        }

        FetchPoll::Done(self.response.take().unwrap_or_else(|| {
            Err(TransportError::Network("fetch already completed".to_string()))
        }))
    }
}
