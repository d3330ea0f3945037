//! Caching layers
//!
//! `asset` keeps fetched image responses in named content caches,
//! `metadata` keeps the gallery listing in a single time-limited envelope.
//! Both sit on the storage backends in `storage` and `response_store`.

pub mod asset;
pub mod metadata;
pub mod response_store;
pub mod storage;

pub use asset::{AssetCache, AssetCacheConfig, AssetSource, ControlMessage, ControlReply};
pub use metadata::{CacheEnvelope, CacheStats, MetadataCache};
pub use response_store::{CacheStorage, DiskCacheStorage, MemoryCacheStorage, ResponseCache};
pub use storage::{FileLocalStore, LocalStore, MemoryLocalStore, StoreError};
