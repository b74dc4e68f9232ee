//! HTTP and file transport
//!
//! Fetches run on a private tokio runtime and report into a shared slot
//! that the handle polls. Plain `http://` is spoken directly over a
//! `TcpStream` (HTTP/1.0, so responses are never chunked); `file://` is read
//! with `tokio::fs`. HTTPS and redirects are not supported.

use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use url::{Host, Url};

use crate::error::TransportError;
use crate::storage::locator_path;
use crate::transport::{FetchHandle, FetchPoll, FetchSpec, Transport};

const READ_CHUNK: usize = 16 * 1024;

#[derive(Default)]
struct Slot {
    progress: f32,
    result: Option<Result<Vec<u8>, TransportError>>,
}

/// Transport for `http://` and `file://` locators
pub struct HttpTransport {
    runtime: Option<tokio::runtime::Runtime>,
}

impl HttpTransport {
    /// Create a transport with two worker threads
    pub fn new() -> Result<Self, TransportError> {
        Self::with_worker_threads(2)
    }

    pub fn with_worker_threads(threads: usize) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name("void-loader-http")
            .enable_all()
            .build()
            .map_err(|e| TransportError::Network(format!("Failed to create runtime: {}", e)))?;

        Ok(Self {
            runtime: Some(runtime),
        })
    }
}

impl Transport for HttpTransport {
    fn fetch(&self, spec: FetchSpec) -> Box<dyn FetchHandle> {
        let slot = Arc::new(Mutex::new(Slot::default()));

        let Some(runtime) = self.runtime.as_ref() else {
            slot.lock().result = Some(Err(TransportError::Network("transport shut down".to_string())));
            return Box::new(HttpFetch { slot, task: None });
        };

        let task_slot = slot.clone();
        let task = runtime.spawn(async move {
            let result = match spec.timeout {
                Some(timeout) => {
                    match tokio::time::timeout(timeout, run_fetch(&spec.locator, &task_slot)).await {
                        Ok(result) => result,
                        Err(_) => Err(TransportError::Timeout(timeout.as_secs())),
                    }
                }
                None => run_fetch(&spec.locator, &task_slot).await,
            };

            if let Err(e) = &result {
                log::debug!("Fetch failed: {} ({})", spec.locator, e);
            }
            task_slot.lock().result = Some(result);
        });

        Box::new(HttpFetch {
            slot,
            task: Some(task),
        })
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

struct HttpFetch {
    slot: Arc<Mutex<Slot>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl FetchHandle for HttpFetch {
    fn poll(&mut self) -> FetchPoll {
        let mut slot = self.slot.lock();
        match slot.result.take() {
            Some(result) => FetchPoll::Done(result),
            None => FetchPoll::Pending(slot.progress),
        }
    }
}

impl Drop for HttpFetch {
    fn drop(&mut self) {
        // Abandoned fetches stop downloading
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_fetch(locator: &str, slot: &Mutex<Slot>) -> Result<Vec<u8>, TransportError> {
    if let Some(path) = locator_path(locator) {
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| TransportError::Network(format!("{}: {}", path.display(), e)))?;
        slot.lock().progress = 1.0;
        return Ok(data);
    }

    let url = Url::parse(locator)
        .map_err(|e| TransportError::InvalidLocator(format!("{}: {}", locator, e)))?;
    if url.scheme() != "http" {
        return Err(TransportError::UnsupportedScheme(url.scheme().to_string()));
    }

    let host = url
        .host()
        .ok_or_else(|| TransportError::InvalidLocator(format!("No host in {}", locator)))?;
    let port = url.port_or_known_default().unwrap_or(80);
    let query = url.query().map(|q| format!("?{}", q)).unwrap_or_default();
    // host_str keeps IPv6 brackets, as the Host header needs
    let host_header = match url.port() {
        Some(port) => format!("{}:{}", url.host_str().unwrap_or_default(), port),
        None => url.host_str().unwrap_or_default().to_string(),
    };

    let connected = match host {
        Host::Domain(domain) => TcpStream::connect((domain, port)).await,
        Host::Ipv4(addr) => TcpStream::connect((IpAddr::V4(addr), port)).await,
        Host::Ipv6(addr) => TcpStream::connect((IpAddr::V6(addr), port)).await,
    };
    let mut stream =
        connected.map_err(|e| TransportError::Network(format!("Connection failed: {}", e)))?;

    let request = format!(
        "GET {}{} HTTP/1.0\r\nHost: {}\r\nConnection: close\r\n\r\n",
        url.path(),
        query,
        host_header
    );
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| TransportError::Network(format!("Write failed: {}", e)))?;

    let mut response = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut body_start = None;
    let mut content_length = None;

    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| TransportError::Network(format!("Read failed: {}", e)))?;
        if n == 0 {
            break;
        }
        response.extend_from_slice(&chunk[..n]);

        if body_start.is_none() {
            if let Some(end) = find_header_end(&response) {
                let head = String::from_utf8_lossy(&response[..end]);
                content_length = parse_head(&head)?;
                body_start = Some(end + 4);
            }
        }

        if let (Some(start), Some(total)) = (body_start, content_length) {
            if total > 0 {
                let received = response.len() - start;
                slot.lock().progress = (received as f32 / total as f32).min(1.0);
            }
        }
    }

    let start = body_start
        .ok_or_else(|| TransportError::Network("Invalid HTTP response".to_string()))?;
    let mut body = response.split_off(start);
    if let Some(total) = content_length {
        if body.len() < total {
            return Err(TransportError::Network(format!(
                "Truncated body: received {} of {} bytes",
                body.len(),
                total
            )));
        }
        body.truncate(total);
    }

    slot.lock().progress = 1.0;
    Ok(body)
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Check the status line and pull out Content-Length
fn parse_head(head: &str) -> Result<Option<usize>, TransportError> {
    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();

    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next();
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TransportError::Network(format!("Malformed status line: {}", status_line)))?;
    let reason = parts.next().unwrap_or_default().trim().to_string();

    if !(200..300).contains(&status) {
        return Err(TransportError::Http { status, reason });
    }

    let content_length = lines.find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    });

    Ok(content_length)
}
