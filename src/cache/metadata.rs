//! Gallery Metadata Cache
//!
//! Keeps the gallery's image-metadata list in a persistent local store so
//! the gallery can render without another round trip to the backend.
//!
//! Two independent mechanisms bound staleness:
//! - content expiry: an envelope older than [`CACHE_DURATION`] is purged on read
//! - a persistent version counter bumped by [`MetadataCache::invalidate`], which
//!   lets writers force every reader to refetch without waiting for expiry
//!
//! Every storage failure is logged and swallowed. Losing the cache only costs
//! a refetch.

use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::storage::LocalStore;
use crate::clock::Clock;

/// How long an envelope stays valid after it was written
pub const CACHE_DURATION: Duration = Duration::hours(24);

/// Store key holding the serialized envelope
pub const CACHE_KEY: &str = "krysztalkowo_gallery_cache";

/// Store key holding the invalidation counter
pub const VERSION_KEY: &str = "krysztalkowo_gallery_cache_version";

/// Persisted metadata cache record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEnvelope {
    /// Creation instant, epoch milliseconds
    pub timestamp: i64,
    /// Image metadata records, opaque to the cache
    pub images: Vec<Value>,
    /// Total byte size of all cached image payloads
    pub total_size: u64,
    /// Number of entries
    pub count: u64,
}

/// Read-only view of the cache state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub exists: bool,
    /// Envelope age in milliseconds
    pub age: u64,
    pub count: u64,
    pub size: u64,
    pub age_formatted: String,
}

/// Metadata cache over an injected local store
pub struct MetadataCache {
    store: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
}

impl MetadataCache {
    /// Create a cache writing through `store`
    pub fn new(store: Arc<dyn LocalStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Return the cached envelope if present, well-formed and unexpired.
    ///
    /// Expired or unparseable records are purged as a side effect.
    pub fn read(&self) -> Option<CacheEnvelope> {
        let raw = match self.store.get(CACHE_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                trace!("Metadata cache MISS");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read metadata cache");
                return None;
            }
        };

        let envelope: CacheEnvelope = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Corrupt metadata cache, purging");
                self.clear();
                return None;
            }
        };

        let age = self.clock.now_millis() - envelope.timestamp;
        if age > CACHE_DURATION.num_milliseconds() {
            debug!(age_ms = age, "Metadata cache expired, purging");
            self.clear();
            return None;
        }

        trace!(count = envelope.count, age_ms = age, "Metadata cache HIT");
        Some(envelope)
    }

    /// Persist a fresh envelope stamped with the current time.
    ///
    /// A quota rejection clears the cache instead of leaving a stale
    /// envelope behind. No failure reaches the caller.
    pub fn write(&self, images: Vec<Value>, total_size: u64, count: u64) {
        let envelope = CacheEnvelope {
            timestamp: self.clock.now_millis(),
            images,
            total_size,
            count,
        };

        let raw = match serde_json::to_string(&envelope) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Failed to serialize metadata cache");
                return;
            }
        };

        match self.store.set(CACHE_KEY, &raw) {
            Ok(()) => {
                debug!(
                    count = envelope.count,
                    total_size = envelope.total_size,
                    "Cached gallery metadata"
                );
            }
            Err(e) if e.is_quota() => {
                warn!(error = %e, "Metadata cache over quota, clearing");
                self.clear();
            }
            Err(e) => {
                warn!(error = %e, "Failed to write metadata cache");
            }
        }
    }

    /// Remove the envelope; a missing or broken store is tolerated
    pub fn clear(&self) {
        if let Err(e) = self.store.remove(CACHE_KEY) {
            warn!(error = %e, "Failed to clear metadata cache");
            return;
        }
        debug!("Cleared metadata cache");
    }

    /// Clear the envelope and bump the version counter by one
    pub fn invalidate(&self) {
        self.clear();

        let next = self.version() + 1;
        if let Err(e) = self.store.set(VERSION_KEY, &next.to_string()) {
            warn!(error = %e, "Failed to bump metadata cache version");
            return;
        }
        debug!(version = next, "Invalidated metadata cache");
    }

    /// Current invalidation counter, 0 if never invalidated
    pub fn version(&self) -> u64 {
        match self.store.get(VERSION_KEY) {
            Ok(Some(raw)) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(raw = %raw, "Unreadable metadata cache version, treating as 0");
                0
            }),
            Ok(None) => 0,
            Err(e) => {
                warn!(error = %e, "Failed to read metadata cache version");
                0
            }
        }
    }

    /// Whether a usable envelope is cached
    pub fn is_valid(&self) -> bool {
        self.read().is_some()
    }

    /// Derived statistics for the current envelope
    pub fn stats(&self) -> CacheStats {
        match self.read() {
            Some(envelope) => {
                let age = (self.clock.now_millis() - envelope.timestamp).max(0) as u64;
                CacheStats {
                    exists: true,
                    age,
                    count: envelope.count,
                    size: envelope.total_size,
                    age_formatted: format_age(age),
                }
            }
            None => CacheStats {
                exists: false,
                age: 0,
                count: 0,
                size: 0,
                age_formatted: format_age(0),
            },
        }
    }
}

/// Render an age using its two largest units: "2h 5m", "5m 30s", "12s"
pub fn format_age(age_ms: u64) -> String {
    let total_secs = age_ms / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::storage::{MemoryLocalStore, StoreError};
    use crate::clock::ManualClock;
    use serde_json::json;

    const T0: i64 = 1_700_000_000_000;

    fn setup() -> (Arc<MemoryLocalStore>, Arc<ManualClock>, MetadataCache) {
        let store = Arc::new(MemoryLocalStore::new());
        let clock = Arc::new(ManualClock::at_millis(T0));
        let cache = MetadataCache::new(store.clone(), clock.clone());
        (store, clock, cache)
    }

    fn images() -> Vec<Value> {
        vec![
            json!({"id": "a", "name": "Ametyst", "size": 1200}),
            json!({"id": "b", "name": "Kwarc", "size": 800}),
        ]
    }

    /// Store whose every operation fails
    struct BrokenStore;

    impl LocalStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("disabled".to_string()))
        }
        fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disabled".to_string()))
        }
        fn remove(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disabled".to_string()))
        }
    }

    #[test]
    fn test_write_then_read() {
        let (_, clock, cache) = setup();
        assert!(cache.read().is_none());

        cache.write(images(), 2000, 2);
        clock.advance(Duration::minutes(10));

        let envelope = cache.read().unwrap();
        assert_eq!(envelope.timestamp, T0);
        assert_eq!(envelope.images, images());
        assert_eq!(envelope.total_size, 2000);
        assert_eq!(envelope.count, 2);
        assert!(cache.is_valid());
    }

    #[test]
    fn test_envelope_valid_at_exact_boundary() {
        let (_, clock, cache) = setup();
        cache.write(images(), 2000, 2);

        clock.advance(CACHE_DURATION);
        assert!(cache.read().is_some());
    }

    #[test]
    fn test_expired_envelope_is_purged() {
        let (store, clock, cache) = setup();
        cache.write(images(), 2000, 2);

        clock.advance(CACHE_DURATION + Duration::milliseconds(1));
        assert!(cache.read().is_none());
        assert_eq!(store.get(CACHE_KEY).unwrap(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_expired_envelopes_of_any_age_are_purged() {
        for extra_hours in [1, 5, 48, 24 * 30] {
            let (store, clock, cache) = setup();
            cache.write(images(), 2000, 2);
            clock.advance(CACHE_DURATION + Duration::hours(extra_hours));

            assert!(cache.read().is_none());
            assert!(store.is_empty(), "store not purged after {}h", extra_hours);
        }
    }

    #[test]
    fn test_corrupt_envelope_is_purged() {
        let (store, _, cache) = setup();
        store.set(CACHE_KEY, "{not json").unwrap();

        assert!(cache.read().is_none());
        assert_eq!(store.get(CACHE_KEY).unwrap(), None);
    }

    #[test]
    fn test_non_sequence_images_is_invalid() {
        let (store, _, cache) = setup();
        let raw = json!({"timestamp": T0, "images": "nope", "totalSize": 0, "count": 0});
        store.set(CACHE_KEY, &raw.to_string()).unwrap();

        assert!(!cache.is_valid());
        assert_eq!(store.get(CACHE_KEY).unwrap(), None);
    }

    #[test]
    fn test_quota_rejection_clears_cache() {
        let store = Arc::new(MemoryLocalStore::with_quota(200));
        let clock = Arc::new(ManualClock::at_millis(T0));
        let cache = MetadataCache::new(store.clone(), clock);

        cache.write(images(), 2000, 2);
        assert!(cache.read().is_some());

        let huge: Vec<Value> = (0..100).map(|i| json!({"id": i})).collect();
        cache.write(huge, 1_000_000, 100);

        assert!(cache.read().is_none());
        assert_eq!(store.get(CACHE_KEY).unwrap(), None);
    }

    #[test]
    fn test_invalidate_bumps_version_by_one() {
        let (store, _, cache) = setup();
        assert_eq!(cache.version(), 0);

        // No envelope exists yet, invalidate still counts
        cache.invalidate();
        assert_eq!(cache.version(), 1);

        cache.write(images(), 2000, 2);
        cache.invalidate();
        assert_eq!(cache.version(), 2);
        assert_eq!(store.get(CACHE_KEY).unwrap(), None);

        cache.invalidate();
        cache.invalidate();
        assert_eq!(cache.version(), 4);
    }

    #[test]
    fn test_version_survives_expiry_and_clear() {
        let (_, clock, cache) = setup();
        cache.invalidate();
        cache.write(images(), 2000, 2);

        clock.advance(Duration::days(3));
        assert!(cache.read().is_none());
        cache.clear();
        assert_eq!(cache.version(), 1);
    }

    #[test]
    fn test_broken_store_never_raises() {
        let cache = MetadataCache::new(
            Arc::new(BrokenStore),
            Arc::new(ManualClock::at_millis(T0)),
        );

        cache.write(images(), 2000, 2);
        cache.clear();
        cache.invalidate();
        assert!(cache.read().is_none());
        assert_eq!(cache.version(), 0);
        assert!(!cache.stats().exists);
    }

    #[test]
    fn test_shared_store_last_writer_wins() {
        // Two independent caches (e.g. two tabs) over the same store
        let store = Arc::new(MemoryLocalStore::new());
        let clock = Arc::new(ManualClock::at_millis(T0));
        let tab_a = MetadataCache::new(store.clone(), clock.clone());
        let tab_b = MetadataCache::new(store.clone(), clock.clone());

        tab_a.write(images(), 2000, 2);
        tab_b.write(vec![json!({"id": "z"})], 10, 1);

        let seen_by_a = tab_a.read().unwrap();
        assert_eq!(seen_by_a.images, vec![json!({"id": "z"})]);
        assert_eq!(seen_by_a.count, 1);
        assert_eq!(seen_by_a.total_size, 10);
    }

    #[test]
    fn test_stats() {
        let (_, clock, cache) = setup();
        let empty = cache.stats();
        assert!(!empty.exists);
        assert_eq!(empty.age_formatted, "0s");

        cache.write(images(), 2000, 2);
        clock.advance(Duration::minutes(125) + Duration::seconds(7));

        let stats = cache.stats();
        assert!(stats.exists);
        assert_eq!(stats.count, 2);
        assert_eq!(stats.size, 2000);
        assert_eq!(stats.age, (125 * 60 + 7) * 1000);
        assert_eq!(stats.age_formatted, "2h 5m");
    }

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(0), "0s");
        assert_eq!(format_age(12_000), "12s");
        assert_eq!(format_age(12_999), "12s");
        assert_eq!(format_age(330_000), "5m 30s");
        assert_eq!(format_age(7_500_000), "2h 5m");
        assert_eq!(format_age(3_600_000), "1h 0m");
    }
}
