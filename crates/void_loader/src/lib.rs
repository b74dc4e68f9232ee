//! # void_loader - Versioned, Disk-Cached Fetch Pipeline
//!
//! Fetches remote or local payloads with:
//! - A versioned local cache (`<root>/data/<id>` + `<root>/sys/version.json`)
//! - Per-tick scheduling under network and disk budgets
//! - Typed payloads (bytes, text, images, audio, LZ4 bundles)
//! - Request groups with aggregate progress
//! - A companion image cache keyed by URL
//!
//! ## Example
//!
//! ```ignore
//! use void_loader::prelude::*;
//!
//! let transport = HttpTransport::new()?;
//! let mut scheduler = RequestScheduler::new(LoaderConfig::development(), transport)?;
//!
//! let id = scheduler.enqueue(
//!     FetchRequest::of::<str>("http://example.com/motd.txt")
//!         .expected_version(3)
//!         .retain()
//!         .on_success(|r| println!("{}", r.result::<str>().unwrap_or_default())),
//! )?;
//!
//! // Once per frame
//! scheduler.tick();
//!
//! if let Some(text) = scheduler.payload::<str>(id) {
//!     // Use the text
//! }
//! ```

pub mod cache_key;
pub mod config;
pub mod error;
pub mod group;
pub mod image_cache;
mod next_tick;
pub mod payload;
pub mod request;
pub mod scheduler;
pub mod storage;
pub mod transport;
pub mod version;

#[cfg(feature = "http")]
pub mod http;

pub use cache_key::{derive_id, hashed_id, is_safe_id, MAX_CACHE_ID_LEN};
pub use config::LoaderConfig;
pub use error::{DecodeError, LoaderError, LoaderResult, TransportError};
pub use group::{GroupId, GroupView, RequestGroup};
pub use image_cache::{ImageCatalog, ImageLoader};
pub use payload::{
    Archive, AudioClip, ImageData, MediaDecoder, Payload, PayloadKind, PayloadType, StandardDecoder,
};
pub use request::{
    FetchRequest, LocalCheck, Phase, RequestEvent, RequestId, SubscriptionId, LOCAL_WEIGHT,
    NETWORK_WEIGHT,
};
pub use scheduler::{Enqueuer, LoaderStats, RequestScheduler};
pub use storage::{CacheLayout, DiskStore, FileStore};
pub use transport::{FetchHandle, FetchPoll, FetchSpec, MemoryTransport, Transport};
pub use version::{VersionRecord, VersionStore};

#[cfg(feature = "http")]
pub use http::HttpTransport;

/// Prelude - commonly used types
pub mod prelude {
    pub use crate::config::LoaderConfig;
    pub use crate::error::{LoaderError, LoaderResult, TransportError};
    pub use crate::group::{GroupId, GroupView};
    pub use crate::image_cache::ImageLoader;
    pub use crate::payload::{Archive, AudioClip, ImageData, PayloadKind};
    pub use crate::request::{FetchRequest, Phase, RequestEvent, RequestId};
    pub use crate::scheduler::{Enqueuer, RequestScheduler};
    pub use crate::transport::{MemoryTransport, Transport};

    #[cfg(feature = "http")]
    pub use crate::http::HttpTransport;
}
