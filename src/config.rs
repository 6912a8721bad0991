use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chunk::Quality;
use crate::error::{Error, Result};

pub const CACHE_DIR: &str = "video_cache";
pub const DEFAULT_CAPACITY: usize = 16;
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;
pub const INDEX_FILE_NAME: &str = "cache_index.json";

// 默认超时时间（10秒）
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_RETRIES: u32 = 3;
pub const MAX_RETRIES_LIMIT: u32 = 10;
// 重试延迟（基础值，会随重试次数增加）
pub const RETRY_DELAY: Duration = Duration::from_millis(500);

const DEFAULT_USER_AGENT: &str = concat!("video_cache/", env!("CARGO_PKG_VERSION"));

/// Top-level configuration for a [`VideoCache`](crate::VideoCache).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoCacheConfig {
    pub cache: CacheConfig,
    pub chunk: ChunkConfig,
    pub fetch: FetchConfig,
}

impl VideoCacheConfig {
    /// Load a JSON configuration file. Missing fields fall back to defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.chunk.validate()?;
        self.fetch.validate()
    }
}

/// Settings for the on-disk LRU store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding cached files and the persisted index
    pub cache_dir: PathBuf,
    /// Maximum number of cached assets
    pub capacity: usize,
    /// Download permits shared by normal and low priority puts
    pub max_concurrent_downloads: usize,
    pub index_file_name: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join(CACHE_DIR),
            capacity: DEFAULT_CAPACITY,
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            index_file_name: INDEX_FILE_NAME.to_owned(),
        }
    }
}

impl CacheConfig {
    pub fn with_dir(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::Config("cache capacity must be at least 1".into()));
        }
        if self.max_concurrent_downloads == 0 {
            return Err(Error::Config(
                "max_concurrent_downloads must be at least 1".into(),
            ));
        }
        if self.index_file_name.is_empty() {
            return Err(Error::Config("index_file_name must not be empty".into()));
        }
        Ok(())
    }
}

/// Settings for chunked streaming sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Length of one chunk in seconds
    pub chunk_duration_secs: f64,
    /// Chunks kept loaded ahead of the cursor, the requested one included
    pub preload_chunks: usize,
    /// Loaded chunks farther than this from the cursor are released
    pub eviction_distance: usize,
    /// Run an eviction pass every n-th cursor update
    pub eviction_interval: u64,
    /// Hard bound on chunks holding a payload per session
    pub max_memory_chunks: usize,
    pub default_quality: Quality,
    /// Used to estimate duration when the source does not report one
    pub assumed_bitrate_bps: u64,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_duration_secs: 0.5,
            preload_chunks: 3,
            eviction_distance: 5,
            eviction_interval: 5,
            max_memory_chunks: 12,
            default_quality: Quality::default(),
            assumed_bitrate_bps: 2_000_000,
        }
    }
}

impl ChunkConfig {
    pub fn chunk_duration(&self) -> Duration {
        Duration::from_secs_f64(self.chunk_duration_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.chunk_duration_secs.is_finite() && self.chunk_duration_secs > 0.0) {
            return Err(Error::Config("chunk_duration_secs must be positive".into()));
        }
        if self.preload_chunks == 0 {
            return Err(Error::Config("preload_chunks must be at least 1".into()));
        }
        if self.eviction_interval == 0 {
            return Err(Error::Config("eviction_interval must be at least 1".into()));
        }
        if self.max_memory_chunks < self.preload_chunks {
            return Err(Error::Config(
                "max_memory_chunks must be at least preload_chunks".into(),
            ));
        }
        if self.assumed_bitrate_bps == 0 {
            return Err(Error::Config("assumed_bitrate_bps must be positive".into()));
        }
        Ok(())
    }
}

/// HTTP transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: REQUEST_TIMEOUT.as_millis() as u64,
            max_retries: MAX_RETRIES,
            retry_delay_ms: RETRY_DELAY.as_millis() as u64,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        }
    }
}

impl FetchConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(Error::Config("request_timeout_ms must be positive".into()));
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(Error::Config(format!(
                "max_retries must be at most {MAX_RETRIES_LIMIT}"
            )));
        }
        Ok(())
    }
}
