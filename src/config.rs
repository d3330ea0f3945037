//! Daemon configuration from environment variables

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::activation::service::SWEEP_INTERVAL;
use crate::activation::{MailConfig, MailCredentials};
use crate::cache::asset::{
    asset_cache_name, AssetCacheConfig, PersistMode, DEFAULT_STORAGE_HOST, MAX_AGE,
    RUNTIME_CACHE_NAME,
};

/// Default IPC socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/krysztalkowo.sock";

/// Default metadata store quota, in line with browser local storage
pub const DEFAULT_METADATA_QUOTA: u64 = 5 * 1024 * 1024;

/// Everything the daemon needs to start
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub asset: AssetCacheConfig,
    /// Root for the asset cache and metadata store
    pub cache_dir: PathBuf,
    pub socket_path: PathBuf,
    pub metadata_quota: u64,
    pub sweep_interval: Duration,
    pub mail: MailConfig,
}

impl DaemonConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read configuration through `lookup`, which returns a variable's value
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let version = lookup("KRYSZTALKOWO_CACHE_VERSION").unwrap_or_else(|| "v1".to_string());

        let persist = match lookup("KRYSZTALKOWO_PERSIST").as_deref() {
            None | Some("background") => PersistMode::Background,
            Some("await") => PersistMode::Await,
            Some(other) => {
                return Err(anyhow!(
                    "KRYSZTALKOWO_PERSIST must be 'background' or 'await', got '{}'",
                    other
                ))
            }
        };

        let fetch_timeout = parse_u64(&lookup, "KRYSZTALKOWO_FETCH_TIMEOUT_SECS", 30)?;
        let sweep_secs = parse_u64(
            &lookup,
            "KRYSZTALKOWO_SWEEP_INTERVAL_SECS",
            SWEEP_INTERVAL.as_secs(),
        )?;
        let metadata_quota = parse_u64(
            &lookup,
            "KRYSZTALKOWO_METADATA_QUOTA_BYTES",
            DEFAULT_METADATA_QUOTA,
        )?;

        let cache_dir = lookup("KRYSZTALKOWO_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::cache_dir()
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join("krysztalkowo")
            });

        let credentials = match (lookup("EMAIL_USER"), lookup("EMAIL_PASSWORD")) {
            (Some(user), Some(password)) if !user.is_empty() && !password.is_empty() => {
                Some(MailCredentials { user, password })
            }
            _ => None,
        };

        Ok(Self {
            asset: AssetCacheConfig {
                storage_host: lookup("KRYSZTALKOWO_STORAGE_HOST")
                    .unwrap_or_else(|| DEFAULT_STORAGE_HOST.to_string()),
                cache_name: asset_cache_name(&version),
                runtime_cache_name: RUNTIME_CACHE_NAME.to_string(),
                max_age: MAX_AGE,
                fetch_timeout: Duration::from_secs(fetch_timeout),
                persist,
            },
            cache_dir,
            socket_path: lookup("KRYSZTALKOWO_SOCKET")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH)),
            metadata_quota,
            sweep_interval: Duration::from_secs(sweep_secs.max(60)),
            mail: MailConfig {
                api_url: lookup("MAIL_API_URL").unwrap_or_default(),
                from: lookup("MAIL_FROM")
                    .unwrap_or_else(|| "Kryształkowo <noreply@krysztalkowo.pl>".to_string()),
                credentials,
            },
        })
    }

    /// Directory holding named asset caches
    pub fn asset_dir(&self) -> PathBuf {
        self.cache_dir.join("assets")
    }

    /// Directory holding the metadata store
    pub fn metadata_dir(&self) -> PathBuf {
        self.cache_dir.join("metadata")
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<u64> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a non-negative integer, got '{}'", key, raw)),
        None => Ok(default),
    }
}
