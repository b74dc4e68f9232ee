//! File storage primitive and on-disk cache layout
//!
//! Everything the loader persists goes through [`FileStore`] so hosts can
//! redirect it (sandboxed storage, in-memory tests). [`DiskStore`] writes
//! atomically: data lands in a temp file that is renamed over the target.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Byte-level file access used by the loader
pub trait FileStore {
    /// Read a whole file
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Write a whole file, creating parent directories as needed
    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;

    /// Size of a file in bytes
    fn size(&self, path: &Path) -> io::Result<u64>;

    /// Remove a file
    fn remove(&self, path: &Path) -> io::Result<()>;

    /// Check whether a file exists
    fn exists(&self, path: &Path) -> bool {
        self.size(path).is_ok()
    }
}

/// [`FileStore`] backed by the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskStore;

impl FileStore for DiskStore {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = path.with_file_name(format!(".{}.tmp", file_name));

        {
            let file = File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(data)?;
            writer.flush()?;
        }

        fs::rename(&temp_path, path)
    }

    fn size(&self, path: &Path) -> io::Result<u64> {
        let metadata = fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "not a file"));
        }
        Ok(metadata.len())
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}

/// Paths of everything the loader keeps under its cache root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    /// Directory holding cached payloads
    pub const DATA_DIR: &'static str = "data";
    /// Directory holding loader bookkeeping
    pub const SYS_DIR: &'static str = "sys";
    /// Version manifest file name
    pub const MANIFEST_FILE: &'static str = "version.json";
    /// Directory holding cached images
    pub const IMAGE_DIR: &'static str = "images";
    /// Image catalog file name
    pub const IMAGE_CATALOG_FILE: &'static str = "image_catalog.json";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cached payload for a cache id; overwritten on every refresh. Requests
    /// only pass ids accepted by [`is_safe_id`](crate::cache_key::is_safe_id).
    pub fn data_path(&self, cache_id: &str) -> PathBuf {
        self.root.join(Self::DATA_DIR).join(cache_id)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(Self::SYS_DIR).join(Self::MANIFEST_FILE)
    }

    pub fn image_path(&self, file_name: &str) -> PathBuf {
        self.root.join(Self::IMAGE_DIR).join(file_name)
    }

    pub fn image_catalog_path(&self) -> PathBuf {
        self.root.join(Self::IMAGE_CATALOG_FILE)
    }
}

/// `file://` locator for a local path, used to route local media through
/// the transport's decode path
pub fn file_locator(path: &Path) -> String {
    let path = path.to_string_lossy().replace('\\', "/");
    if path.starts_with('/') {
        format!("file://{}", path)
    } else {
        format!("file:///{}", path)
    }
}

/// Local path of a `file://` locator
pub fn locator_path(locator: &str) -> Option<PathBuf> {
    let rest = locator.strip_prefix("file://")?;
    // `file:///C:/dir` on Windows
    let rest = match rest.as_bytes() {
        [b'/', _, b':', ..] => &rest[1..],
        _ => rest,
    };
    Some(PathBuf::from(rest))
}
