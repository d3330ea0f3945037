//! Image Asset Cache
//!
//! Sits between the app and the remote image storage. Requests for the
//! storage host are answered from a persistent response cache when the
//! stored copy is fresh, fetched and stored otherwise, and answered with a
//! stale copy when a refresh fails. Requests for any other host pass
//! straight through to the network.
//!
//! Signed storage URLs carry a volatile token in the query string, so
//! entries are keyed by origin + path only.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use super::response_store::{
    CacheStorage, MatchOptions, ResponseCache, StoredAsset, CACHED_AT_HEADER,
};
use crate::clock::Clock;
use crate::fetch::{AssetRequest, AssetResponse, FetchError, Fetcher};

/// Age after which a stored asset is refreshed
pub const MAX_AGE: Duration = Duration::days(7);

/// Default remote storage host
pub const DEFAULT_STORAGE_HOST: &str = "firebasestorage.googleapis.com";

/// Name of the short-lived runtime cache kept across generations
pub const RUNTIME_CACHE_NAME: &str = "krysztalkowo-runtime";

/// Content cache name for a cache generation
pub fn asset_cache_name(version: &str) -> String {
    format!("krysztalkowo-images-{}", version)
}

/// When the stored copy is written relative to answering the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistMode {
    /// Store in the background; the response may be served before it is cached
    #[default]
    Background,
    /// Finish storing before the response is returned
    Await,
}

/// Asset cache settings
#[derive(Debug, Clone)]
pub struct AssetCacheConfig {
    /// Host whose requests are intercepted
    pub storage_host: String,
    /// Name of the content cache for the current generation
    pub cache_name: String,
    /// Name of the runtime cache spared by [`AssetCache::activate`]
    pub runtime_cache_name: String,
    /// Age after which entries are refreshed
    pub max_age: Duration,
    /// Upper bound on a single network fetch
    pub fetch_timeout: std::time::Duration,
    pub persist: PersistMode,
}

impl Default for AssetCacheConfig {
    fn default() -> Self {
        Self {
            storage_host: DEFAULT_STORAGE_HOST.to_string(),
            cache_name: asset_cache_name("v1"),
            runtime_cache_name: RUNTIME_CACHE_NAME.to_string(),
            max_age: MAX_AGE,
            fetch_timeout: crate::fetch::client::REQUEST_TIMEOUT,
            persist: PersistMode::default(),
        }
    }
}

/// What to do with an intercepted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDecision {
    /// Not ours: forward to the network untouched
    PassThrough,
    /// Answer from the stored copy
    ServeCached,
    /// Nothing stored: fetch, store, answer
    FetchAndStore,
    /// Stored copy expired: refetch, fall back to the stale copy on failure
    RefreshOrServeStale,
}

/// Where a served response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssetSource {
    /// Forwarded without cache involvement
    PassThrough,
    /// Fresh network response
    Network,
    /// Stored copy
    Cache,
    /// Expired stored copy, served because the refresh failed
    StaleCache,
}

/// A response together with its provenance
#[derive(Debug, Clone)]
pub struct Served {
    pub response: AssetResponse,
    pub source: AssetSource,
}

/// Maintenance messages accepted by the asset cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Delete the whole content cache
    ClearCache,
    /// Report the number of stored entries
    GetCacheSize,
}

/// Reply to a [`ControlMessage`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

/// Cache key for a request URL: origin + path, no query or fragment
pub fn cache_key(url: &url::Url) -> String {
    format!("{}{}", url.origin().ascii_serialization(), url.path())
}

/// Whether a request targets the storage host and may be cached
pub fn intercepts(storage_host: &str, request: &AssetRequest) -> bool {
    if !request.is_get() {
        return false;
    }
    match request.parsed_url() {
        Ok(url) => url
            .host_str()
            .is_some_and(|host| host.eq_ignore_ascii_case(storage_host)),
        Err(_) => false,
    }
}

/// Decide how to answer a request given what is stored for it.
///
/// Entries without a readable `cachedAt` marker were not written by this
/// cache and are served as they are.
pub fn decide(
    storage_host: &str,
    request: &AssetRequest,
    stored: Option<&StoredAsset>,
    now: DateTime<Utc>,
    max_age: Duration,
) -> CacheDecision {
    if !intercepts(storage_host, request) {
        return CacheDecision::PassThrough;
    }

    let Some(entry) = stored else {
        return CacheDecision::FetchAndStore;
    };

    match entry.cached_at() {
        Some(cached_at) if now - cached_at > max_age => CacheDecision::RefreshOrServeStale,
        _ => CacheDecision::ServeCached,
    }
}

fn open_cache(storage: &dyn CacheStorage, name: &str) -> Option<Arc<dyn ResponseCache>> {
    match storage.open(name) {
        Ok(cache) => Some(cache),
        Err(e) => {
            warn!(cache = %name, error = %e, "Failed to open asset cache");
            None
        }
    }
}

fn lookup(cache: &dyn ResponseCache, key: &str) -> Option<StoredAsset> {
    match cache.match_entry(key, MatchOptions::ignoring_query()) {
        Ok(entry) => entry,
        Err(e) => {
            warn!(key = key, error = %e, "Asset cache lookup failed");
            None
        }
    }
}

/// The asset cache
pub struct AssetCache {
    config: AssetCacheConfig,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
}

impl AssetCache {
    pub fn new(
        config: AssetCacheConfig,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            storage,
            fetcher,
            clock,
        }
    }

    pub fn config(&self) -> &AssetCacheConfig {
        &self.config
    }

    /// Answer a request.
    ///
    /// Cache I/O failures never fail the request; they degrade to a plain
    /// network fetch. A network failure is returned only when no stored
    /// copy can stand in.
    pub async fn handle(&self, request: &AssetRequest) -> Result<Served, FetchError> {
        if !intercepts(&self.config.storage_host, request) {
            trace!(url = %request.url, "Passing request through");
            let response = self.fetch(request).await?;
            return Ok(Served {
                response,
                source: AssetSource::PassThrough,
            });
        }

        let key = cache_key(&request.parsed_url()?);
        let (cache, stored) = self.load(&key).await;

        let decision = decide(
            &self.config.storage_host,
            request,
            stored.as_ref(),
            self.clock.now(),
            self.config.max_age,
        );

        match (decision, stored) {
            (CacheDecision::ServeCached, Some(entry)) => {
                debug!(key = %key, "Asset cache HIT");
                Ok(Served {
                    response: entry.into(),
                    source: AssetSource::Cache,
                })
            }
            (CacheDecision::RefreshOrServeStale, Some(entry)) => {
                debug!(key = %key, "Asset cache entry expired, refreshing");
                match self.fetch_and_store(request, &key, cache).await {
                    Ok(served) if served.response.is_ok() => Ok(served),
                    Ok(served) => {
                        warn!(
                            key = %key,
                            status = served.response.status,
                            "Refresh returned an error status, serving stale copy"
                        );
                        Ok(Self::stale(entry))
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Refresh failed, serving stale copy");
                        Ok(Self::stale(entry))
                    }
                }
            }
            _ => {
                debug!(key = %key, "Asset cache MISS");
                self.fetch_and_store(request, &key, cache).await
            }
        }
    }

    fn stale(entry: StoredAsset) -> Served {
        Served {
            response: entry.into(),
            source: AssetSource::StaleCache,
        }
    }

    /// Open the content cache and look up `key` on the blocking pool
    async fn load(&self, key: &str) -> (Option<Arc<dyn ResponseCache>>, Option<StoredAsset>) {
        let storage = Arc::clone(&self.storage);
        let cache_name = self.config.cache_name.clone();
        let key = key.to_string();

        let task = tokio::task::spawn_blocking(move || {
            let cache = open_cache(storage.as_ref(), &cache_name);
            let stored = cache.as_ref().and_then(|cache| lookup(cache.as_ref(), &key));
            (cache, stored)
        });

        match task.await {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(error = %e, "Asset cache lookup task failed");
                (None, None)
            }
        }
    }

    async fn fetch(&self, request: &AssetRequest) -> Result<AssetResponse, FetchError> {
        match tokio::time::timeout(self.config.fetch_timeout, self.fetcher.fetch(request)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout),
        }
    }

    /// Fetch from the network and store a stamped copy of a 200 response
    async fn fetch_and_store(
        &self,
        request: &AssetRequest,
        key: &str,
        cache: Option<Arc<dyn ResponseCache>>,
    ) -> Result<Served, FetchError> {
        let response = self.fetch(request).await?;

        if !response.is_ok() {
            debug!(key = key, status = response.status, "Not caching unsuccessful response");
            return Ok(Served {
                response,
                source: AssetSource::Network,
            });
        }

        if let Some(cache) = cache {
            let mut stored = response.to_stored(key);
            stored
                .headers
                .insert(CACHED_AT_HEADER.to_string(), self.clock.now().to_rfc3339());
            self.persist(cache, stored).await;
        }

        Ok(Served {
            response,
            source: AssetSource::Network,
        })
    }

    async fn persist(&self, cache: Arc<dyn ResponseCache>, entry: StoredAsset) {
        let key = entry.key.clone();
        let task = tokio::task::spawn_blocking(move || {
            let key = entry.key.clone();
            let size = entry.body.len();
            match cache.put(entry) {
                Ok(()) => debug!(key = %key, size = size, "Cached asset"),
                Err(e) => warn!(key = %key, error = %e, "Failed to cache asset"),
            }
        });

        if self.config.persist == PersistMode::Await {
            if let Err(e) = task.await {
                warn!(key = %key, error = %e, "Asset store task failed");
            }
        }
    }

    /// Start a new cache generation: delete every cache except the current
    /// content cache and the runtime cache. Returns the deleted names.
    pub fn activate(&self) -> Vec<String> {
        let names = match self.storage.names() {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "Failed to list caches during activation");
                return Vec::new();
            }
        };

        let mut deleted = Vec::new();
        for name in names {
            if name == self.config.cache_name || name == self.config.runtime_cache_name {
                continue;
            }
            match self.storage.delete(&name) {
                Ok(_) => {
                    info!(cache = %name, "Deleted old cache generation");
                    deleted.push(name);
                }
                Err(e) => warn!(cache = %name, error = %e, "Failed to delete old cache"),
            }
        }

        info!(
            cache = %self.config.cache_name,
            removed = deleted.len(),
            "Asset cache activated"
        );
        deleted
    }

    /// Handle a maintenance message
    pub fn handle_control(&self, message: ControlMessage) -> ControlReply {
        match message {
            ControlMessage::ClearCache => match self.storage.delete(&self.config.cache_name) {
                Ok(existed) => {
                    info!(cache = %self.config.cache_name, existed = existed, "Asset cache cleared");
                    ControlReply {
                        success: true,
                        count: None,
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to clear asset cache");
                    ControlReply {
                        success: false,
                        count: None,
                    }
                }
            },
            ControlMessage::GetCacheSize => {
                let keys = self
                    .storage
                    .open(&self.config.cache_name)
                    .and_then(|cache| cache.keys());
                match keys {
                    Ok(keys) => ControlReply {
                        success: true,
                        count: Some(keys.len()),
                    },
                    Err(e) => {
                        warn!(error = %e, "Failed to count asset cache entries");
                        ControlReply {
                            success: false,
                            count: Some(0),
                        }
                    }
                }
            }
        }
    }
}
