//! Persistent request/response cache stores
//!
//! Named caches of [`StoredAsset`]s keyed by request URL. Entries are
//! indexed by their query-stripped URL, so a store never holds two entries
//! that differ only in query string; exact matching compares the full key
//! stored alongside the entry.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use super::storage::StoreError;

/// Metadata header carrying the instant an entry was stored
pub const CACHED_AT_HEADER: &str = "x-cached-at";

/// A cached response
#[derive(Debug, Clone, PartialEq)]
pub struct StoredAsset {
    /// Request URL the entry was stored under
    pub key: String,
    /// HTTP status of the stored response
    pub status: u16,
    /// Response headers, lower-cased names
    pub headers: BTreeMap<String, String>,
    /// Response body
    pub body: Bytes,
}

impl StoredAsset {
    /// The `cachedAt` marker, if present and parseable
    pub fn cached_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.headers.get(CACHED_AT_HEADER)?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Lookup options for [`ResponseCache::match_entry`]
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchOptions {
    /// Compare URLs without their query string
    pub ignore_query: bool,
}

impl MatchOptions {
    /// Options matching regardless of query string
    pub fn ignoring_query() -> Self {
        Self { ignore_query: true }
    }
}

/// Strip the query string (and fragment) from a URL
pub fn strip_query(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    &url[..end]
}

/// Whether a stored key satisfies a lookup
fn key_matches(stored: &str, lookup: &str, options: MatchOptions) -> bool {
    if options.ignore_query {
        strip_query(stored) == strip_query(lookup)
    } else {
        stored == lookup
    }
}

/// A single named cache
pub trait ResponseCache: Send + Sync {
    /// Find the entry stored for `key`
    fn match_entry(&self, key: &str, options: MatchOptions)
        -> Result<Option<StoredAsset>, StoreError>;

    /// Store an entry, replacing any entry with the same query-stripped key
    fn put(&self, entry: StoredAsset) -> Result<(), StoreError>;

    /// Keys of all stored entries
    fn keys(&self) -> Result<Vec<String>, StoreError>;
}

/// A collection of named caches
pub trait CacheStorage: Send + Sync {
    /// Open a cache, creating it if missing
    fn open(&self, name: &str) -> Result<Arc<dyn ResponseCache>, StoreError>;

    /// Delete a whole cache; `Ok(false)` if it did not exist
    fn delete(&self, name: &str) -> Result<bool, StoreError>;

    /// Names of all existing caches
    fn names(&self) -> Result<Vec<String>, StoreError>;
}

/// In-memory cache backed by Moka
pub struct MemoryResponseCache {
    /// Entries by query-stripped key
    entries: Cache<String, StoredAsset>,
}

impl MemoryResponseCache {
    /// Create a cache holding at most `max_entries` responses
    pub fn new(max_entries: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_entries)
            .name("asset_response_cache")
            .build();
        Self { entries }
    }
}

impl ResponseCache for MemoryResponseCache {
    fn match_entry(
        &self,
        key: &str,
        options: MatchOptions,
    ) -> Result<Option<StoredAsset>, StoreError> {
        Ok(self
            .entries
            .get(strip_query(key))
            .filter(|entry| key_matches(&entry.key, key, options)))
    }

    fn put(&self, entry: StoredAsset) -> Result<(), StoreError> {
        self.entries.insert(strip_query(&entry.key).to_string(), entry);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries.iter().map(|(_, entry)| entry.key).collect())
    }
}

/// In-memory collection of named caches
pub struct MemoryCacheStorage {
    caches: RwLock<HashMap<String, Arc<MemoryResponseCache>>>,
    max_entries: u64,
}

impl MemoryCacheStorage {
    /// Default per-cache capacity
    pub const DEFAULT_MAX_ENTRIES: u64 = 10_000;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_MAX_ENTRIES)
    }

    /// Create storage whose caches each hold at most `max_entries`
    pub fn with_capacity(max_entries: u64) -> Self {
        Self {
            caches: RwLock::new(HashMap::new()),
            max_entries,
        }
    }
}

impl Default for MemoryCacheStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStorage for MemoryCacheStorage {
    fn open(&self, name: &str) -> Result<Arc<dyn ResponseCache>, StoreError> {
        let mut caches = self.caches.write().unwrap_or_else(|e| e.into_inner());
        let cache = caches
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryResponseCache::new(self.max_entries)));
        Ok(cache.clone())
    }

    fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let mut caches = self.caches.write().unwrap_or_else(|e| e.into_inner());
        Ok(caches.remove(name).is_some())
    }

    fn names(&self) -> Result<Vec<String>, StoreError> {
        let caches = self.caches.read().unwrap_or_else(|e| e.into_inner());
        Ok(caches.keys().cloned().collect())
    }
}

/// Metadata written next to each body file
#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    key: String,
    status: u16,
    headers: BTreeMap<String, String>,
}

/// A named cache stored as files in one directory.
///
/// Each entry is `<sha1>.body` plus `<sha1>.meta.json`, where the hash is
/// taken over the query-stripped key. The metadata file is written last and
/// acts as the commit marker.
pub struct DiskResponseCache {
    dir: PathBuf,
}

impl DiskResponseCache {
    fn open(dir: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn stem(key: &str) -> String {
        let mut hasher = Sha1::new();
        hasher.update(strip_query(key).as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn meta_path(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{}.meta.json", stem))
    }

    fn body_path(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{}.body", stem))
    }

    /// Write `data` to `path` through a temp file in the same directory
    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), StoreError> {
        let mut tmp = tempfile::Builder::new()
            .suffix(".tmp")
            .tempfile_in(&self.dir)?;
        tmp.write_all(data)?;
        tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }

    fn read_meta(path: &Path) -> Result<Option<EntryMeta>, StoreError> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| StoreError::Corrupt(format!("{}: {}", path.display(), e)))
    }

    /// Remove temp files left behind by interrupted writes. Only safe while
    /// no writer is active in `dir`.
    fn cleanup(dir: &Path) {
        if let Ok(read_dir) = fs::read_dir(dir) {
            for entry in read_dir.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    debug!(path = %path.display(), "Removing stale temp file");
                    let _ = fs::remove_file(&path);
                }
            }
        }
    }
}

impl ResponseCache for DiskResponseCache {
    fn match_entry(
        &self,
        key: &str,
        options: MatchOptions,
    ) -> Result<Option<StoredAsset>, StoreError> {
        let stem = Self::stem(key);
        let Some(meta) = Self::read_meta(&self.meta_path(&stem))? else {
            return Ok(None);
        };
        if !key_matches(&meta.key, key, options) {
            return Ok(None);
        }

        let body = match fs::read(self.body_path(&stem)) {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::Corrupt(format!("missing body for {}", meta.key)));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Some(StoredAsset {
            key: meta.key,
            status: meta.status,
            headers: meta.headers,
            body: Bytes::from(body),
        }))
    }

    fn put(&self, entry: StoredAsset) -> Result<(), StoreError> {
        let stem = Self::stem(&entry.key);
        let meta = EntryMeta {
            key: entry.key,
            status: entry.status,
            headers: entry.headers,
        };
        let meta_json = serde_json::to_vec(&meta)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        self.write_atomic(&self.body_path(&stem), &entry.body)?;
        self.write_atomic(&self.meta_path(&stem), &meta_json)?;

        debug!(
            key = %meta.key,
            size = entry.body.len(),
            "Stored asset on disk"
        );
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)?.flatten() {
            let path = entry.path();
            let is_meta = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".meta.json"));
            if !is_meta {
                continue;
            }
            match Self::read_meta(&path) {
                Ok(Some(meta)) => keys.push(meta.key),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Skipping unreadable cache entry"),
            }
        }
        Ok(keys)
    }
}

/// Named caches as subdirectories of a root directory
pub struct DiskCacheStorage {
    root: PathBuf,
}

impl DiskCacheStorage {
    /// Open storage rooted at `root`, creating it if needed, and remove temp
    /// files left in any cache by a previous run
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        for entry in fs::read_dir(&root)?.flatten() {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                DiskResponseCache::cleanup(&entry.path());
            }
        }

        info!(root = %root.display(), "Asset cache storage opened");
        Ok(Self { root })
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn cache_dir(&self, name: &str) -> PathBuf {
        let safe = name.replace(['/', '\\', ':'], "_");
        self.root.join(safe)
    }
}

impl CacheStorage for DiskCacheStorage {
    fn open(&self, name: &str) -> Result<Arc<dyn ResponseCache>, StoreError> {
        Ok(Arc::new(DiskResponseCache::open(self.cache_dir(name))?))
    }

    fn delete(&self, name: &str) -> Result<bool, StoreError> {
        match fs::remove_dir_all(self.cache_dir(name)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn names(&self) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)?.flatten() {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        Ok(names)
    }
}
