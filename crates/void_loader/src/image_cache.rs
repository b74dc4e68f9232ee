//! Image cache
//!
//! [`ImageLoader`] maps URLs to decoded images. Concurrent loads of one URL
//! share a single fetch, and every fetched image is written as a PNG into
//! an on-disk [`ImageCatalog`] so later sessions skip the network.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LoaderConfig;
use crate::error::{LoaderError, LoaderResult};
use crate::payload::{ImageData, MediaDecoder, StandardDecoder};
use crate::request::SubscriptionId;
use crate::storage::{CacheLayout, DiskStore, FileStore};
use crate::transport::{FetchHandle, FetchPoll, FetchSpec, Transport};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogEntry {
    url: String,
    file_name: String,
    #[serde(skip)]
    image: Option<Arc<ImageData>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    entries: Vec<CatalogEntry>,
}

/// Persisted index of images written to disk
#[derive(Debug)]
pub struct ImageCatalog {
    layout: CacheLayout,
    entries: Vec<CatalogEntry>,
    loaded: bool,
    dirty: bool,
}

impl ImageCatalog {
    pub fn new(layout: CacheLayout) -> Self {
        Self {
            layout,
            entries: Vec::new(),
            loaded: false,
            dirty: false,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.entries.iter().any(|e| e.url == url)
    }

    /// File name used for a URL's image
    pub fn file_name(url: &str) -> String {
        format!("{}.png", blake3::hash(url.as_bytes()).to_hex())
    }

    /// Path of a URL's image, if cataloged
    pub fn path(&self, url: &str) -> Option<PathBuf> {
        let entry = self.entries.iter().find(|e| e.url == url)?;
        Some(self.layout.image_path(&entry.file_name))
    }

    fn ensure_loaded(&mut self, files: &dyn FileStore) {
        if self.loaded {
            return;
        }
        self.loaded = true;

        let path = self.layout.image_catalog_path();
        let data = match files.read(&path) {
            Ok(data) => data,
            Err(e) => {
                log::debug!("No image catalog at {:?}: {}", path, e);
                return;
            }
        };

        match serde_json::from_slice::<CatalogFile>(&data) {
            Ok(catalog) => {
                self.entries = catalog.entries;
                log::info!("Loaded image catalog: {} entries", self.entries.len());
            }
            Err(e) => log::warn!("Invalid image catalog {:?}: {}", path, e),
        }
    }

    /// Decoded image for a URL, reading the PNG from disk if needed. An
    /// entry whose file vanished or no longer decodes is dropped.
    pub(crate) fn load_from_disk(
        &mut self,
        url: &str,
        files: &dyn FileStore,
        decoder: &dyn MediaDecoder,
    ) -> Option<Arc<ImageData>> {
        self.ensure_loaded(files);

        let index = self.entries.iter().position(|e| e.url == url)?;
        if let Some(image) = &self.entries[index].image {
            return Some(image.clone());
        }

        let path = self.layout.image_path(&self.entries[index].file_name);
        let decoded = files
            .read(&path)
            .map_err(|source| LoaderError::LocalRead {
                path: path.clone(),
                source,
            })
            .and_then(|data| decoder.decode_image(&data).map_err(LoaderError::from));

        match decoded {
            Ok(image) => {
                let image = Arc::new(image);
                self.entries[index].image = Some(image.clone());
                Some(image)
            }
            Err(e) => {
                log::warn!("Dropping image cache entry for {}: {}", url, e);
                self.entries.remove(index);
                self.dirty = true;
                None
            }
        }
    }

    /// Write an image to disk and catalog it. Returns false when the URL
    /// is already cataloged.
    pub(crate) fn add(
        &mut self,
        url: &str,
        image: Arc<ImageData>,
        files: &dyn FileStore,
    ) -> LoaderResult<bool> {
        self.ensure_loaded(files);
        if self.contains(url) {
            return Ok(false);
        }

        let file_name = Self::file_name(url);
        let path = self.layout.image_path(&file_name);
        let png = image.encode_png()?;
        files
            .write(&path, &png)
            .map_err(|source| LoaderError::Persist { path, source })?;

        self.entries.push(CatalogEntry {
            url: url.to_string(),
            file_name,
            image: Some(image),
        });
        self.dirty = true;
        Ok(true)
    }

    /// Forget decoded images; files stay on disk
    pub fn release_memory(&mut self) {
        for entry in &mut self.entries {
            entry.image = None;
        }
    }

    /// Write the catalog and clear the dirty flag
    pub fn save(&mut self, files: &dyn FileStore) -> LoaderResult<()> {
        let catalog = CatalogFile {
            entries: self.entries.clone(),
        };
        let json = serde_json::to_vec_pretty(&catalog)?;
        let path = self.layout.image_catalog_path();
        files
            .write(&path, &json)
            .map_err(|source| LoaderError::Persist { path, source })?;

        self.dirty = false;
        log::debug!("Saved image catalog: {} entries", self.entries.len());
        Ok(())
    }
}

type ImageCallback = Box<dyn FnOnce(Arc<ImageData>)>;

struct PendingImage {
    fetch: Box<dyn FetchHandle>,
    listeners: Vec<(SubscriptionId, ImageCallback)>,
}

/// URL to decoded image loader backed by the image catalog
pub struct ImageLoader {
    files: Box<dyn FileStore>,
    transport: Box<dyn Transport>,
    decoder: Box<dyn MediaDecoder>,
    catalog: ImageCatalog,
    loaded: HashMap<String, Arc<ImageData>>,
    loading: HashMap<String, PendingImage>,
    timeout: Option<Duration>,
    save_delay: u64,
    save_countdown: Option<u64>,
    next_subscription: u64,
}

impl ImageLoader {
    pub fn new(config: &LoaderConfig, transport: impl Transport + 'static) -> Self {
        Self {
            files: Box::new(DiskStore),
            transport: Box::new(transport),
            decoder: Box::new(StandardDecoder),
            catalog: ImageCatalog::new(CacheLayout::new(&config.cache_root)),
            loaded: HashMap::new(),
            loading: HashMap::new(),
            timeout: config.default_timeout(),
            save_delay: config.image_catalog_save_delay_ticks,
            save_countdown: None,
            next_subscription: 1,
        }
    }

    pub fn with_store(mut self, files: impl FileStore + 'static) -> Self {
        self.files = Box::new(files);
        self
    }

    pub fn with_decoder(mut self, decoder: impl MediaDecoder + 'static) -> Self {
        self.decoder = Box::new(decoder);
        self
    }

    pub fn catalog(&self) -> &ImageCatalog {
        &self.catalog
    }

    pub fn is_loading(&self, url: &str) -> bool {
        self.loading.contains_key(url)
    }

    pub fn pending_count(&self) -> usize {
        self.loading.len()
    }

    /// Decoded image already in memory
    pub fn cached(&self, url: &str) -> Option<Arc<ImageData>> {
        self.loaded.get(url).cloned()
    }

    /// Load an image. Runs `on_complete` immediately when the image is in
    /// memory or on disk and returns `None`; otherwise returns a token for
    /// [`ImageLoader::cancel`] and runs `on_complete` from a later
    /// [`ImageLoader::tick`]. Failed loads drop their callbacks.
    pub fn load(
        &mut self,
        url: &str,
        on_complete: impl FnOnce(Arc<ImageData>) + 'static,
    ) -> Option<SubscriptionId> {
        if url.is_empty() {
            log::warn!("Can not load an image from an empty url");
            return None;
        }

        if let Some(image) = self.loaded.get(url) {
            on_complete(image.clone());
            return None;
        }

        let id = SubscriptionId(self.next_subscription);
        if let Some(pending) = self.loading.get_mut(url) {
            self.next_subscription += 1;
            pending.listeners.push((id, Box::new(on_complete)));
            return Some(id);
        }

        let from_disk = self
            .catalog
            .load_from_disk(url, self.files.as_ref(), self.decoder.as_ref());
        if self.catalog.is_dirty() {
            self.schedule_save();
        }
        if let Some(image) = from_disk {
            log::debug!("Image cache hit: {}", url);
            self.loaded.insert(url.to_string(), image.clone());
            on_complete(image);
            return None;
        }

        log::debug!("Fetching image: {}", url);
        self.next_subscription += 1;
        let fetch = self
            .transport
            .fetch(FetchSpec::new(url).with_timeout(self.timeout));
        self.loading.insert(
            url.to_string(),
            PendingImage {
                fetch,
                listeners: vec![(id, Box::new(on_complete))],
            },
        );
        Some(id)
    }

    /// Remove one pending callback; the fetch itself keeps running
    pub fn cancel(&mut self, url: &str, subscription: SubscriptionId) -> bool {
        let Some(pending) = self.loading.get_mut(url) else {
            return false;
        };
        let before = pending.listeners.len();
        pending.listeners.retain(|(id, _)| *id != subscription);
        pending.listeners.len() != before
    }

    /// Poll pending fetches and run the delayed catalog save
    pub fn tick(&mut self) {
        let mut finished = Vec::new();
        for (url, pending) in self.loading.iter_mut() {
            if let FetchPoll::Done(result) = pending.fetch.poll() {
                finished.push((url.clone(), result));
            }
        }

        for (url, result) in finished {
            let Some(pending) = self.loading.remove(&url) else {
                continue;
            };

            let image = match result {
                Ok(data) => match self.decoder.decode_image(&data) {
                    Ok(image) => Arc::new(image),
                    Err(e) => {
                        log::warn!("Image load error: {}\n{}", url, e);
                        continue;
                    }
                },
                Err(e) => {
                    log::warn!("Image load error: {}\n{}", url, e);
                    continue;
                }
            };

            match self.catalog.add(&url, image.clone(), self.files.as_ref()) {
                Ok(true) => self.schedule_save(),
                Ok(false) => {}
                Err(e) => log::warn!("Failed to cache image {}: {}", url, e),
            }

            self.loaded.insert(url, image.clone());
            for (_, listener) in pending.listeners {
                listener(image.clone());
            }
        }

        self.run_delayed_save();
    }

    /// Drop every decoded image held in memory
    pub fn release_memory(&mut self) {
        self.loaded.clear();
        self.catalog.release_memory();
    }

    /// Save the catalog now if it has unsaved changes
    pub fn flush(&mut self) -> LoaderResult<()> {
        self.save_countdown = None;
        if self.catalog.is_dirty() {
            self.catalog.save(self.files.as_ref())?;
        }
        Ok(())
    }

    fn schedule_save(&mut self) {
        if self.save_countdown.is_none() {
            self.save_countdown = Some(self.save_delay);
        }
    }

    fn run_delayed_save(&mut self) {
        let Some(remaining) = self.save_countdown else {
            return;
        };

        if remaining > 0 {
            self.save_countdown = Some(remaining - 1);
            return;
        }

        if let Err(e) = self.flush() {
            log::warn!("Failed to save image catalog: {}", e);
        }
    }
}
