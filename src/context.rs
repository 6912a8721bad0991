use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::CacheStore;
use crate::chunk::ChunkEngine;
use crate::config::VideoCacheConfig;
use crate::error::Result;
use crate::fetch::{Fetcher, HttpFetcher};
use crate::metrics::CacheMetrics;
use crate::resolver::{ProxyStats, StreamResolver};

/// Point-in-time view over every component.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceMetrics {
    pub cache: CacheMetrics,
    pub resolver: ProxyStats,
    pub chunk_memory_bytes: u64,
    pub active_sessions: usize,
}

/// Owns the store, resolver and chunk engine for the lifetime of the
/// application. Nothing here is global; build one with [`VideoCache::init`]
/// and pass it where it is needed.
pub struct VideoCache {
    config: VideoCacheConfig,
    store: CacheStore,
    resolver: StreamResolver,
    engine: ChunkEngine,
    shutdown: CancellationToken,
}

impl VideoCache {
    pub async fn init(config: VideoCacheConfig) -> Result<Self> {
        config.validate()?;
        let fetcher = Arc::new(HttpFetcher::new(&config.fetch));
        Self::with_fetcher(config, fetcher).await
    }

    /// Build on a caller-provided transport.
    pub async fn with_fetcher(config: VideoCacheConfig, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
        let shutdown = CancellationToken::new();
        let store = CacheStore::open(
            config.cache.clone(),
            fetcher.clone(),
            shutdown.child_token(),
        )
        .await?;
        let engine = ChunkEngine::new(config.chunk.clone(), fetcher, shutdown.child_token());
        let resolver = StreamResolver::new(store.clone());

        info!(
            cache_dir = %store.cache_dir().display(),
            entries = store.len(),
            capacity = store.capacity(),
            "Video cache ready"
        );

        Ok(Self {
            config,
            store,
            resolver,
            engine,
            shutdown,
        })
    }

    pub fn config(&self) -> &VideoCacheConfig {
        &self.config
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn resolver(&self) -> &StreamResolver {
        &self.resolver
    }

    pub fn engine(&self) -> &ChunkEngine {
        &self.engine
    }

    pub fn performance_metrics(&self) -> PerformanceMetrics {
        PerformanceMetrics {
            cache: self.store.metrics(),
            resolver: self.resolver.stats(),
            chunk_memory_bytes: self.engine.memory_usage(),
            active_sessions: self.engine.session_count(),
        }
    }

    /// Cancel all outstanding work and persist the index.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.engine.shutdown().await;
        self.store.shutdown().await;
        info!("Video cache shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Quality;
    use crate::config::CacheConfig;
    use crate::test_util::{init_tracing, MockFetcher};

    const CLIP: &str = "http://cdn.test/clips/intro.mp4";

    fn config(dir: &std::path::Path) -> VideoCacheConfig {
        VideoCacheConfig {
            cache: CacheConfig::with_dir(dir).with_capacity(4),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn components_share_one_store() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        fetcher.add_video(CLIP, 20_000, 10.0);
        let cache = VideoCache::with_fetcher(config(dir.path()), Arc::new(fetcher.clone()))
            .await
            .unwrap();

        assert!(!cache.resolver().resolve(CLIP).await.cached);
        cache.store().flush().await;
        assert!(cache.resolver().resolve(CLIP).await.cached);

        cache
            .engine()
            .initialize_stream("intro", CLIP, Quality::P720)
            .await
            .unwrap();
        cache.engine().flush().await;

        let metrics = cache.performance_metrics();
        assert_eq!(metrics.cache.entries, 1);
        assert_eq!(metrics.cache.capacity, 4);
        assert_eq!(metrics.cache.counters.hits, 1);
        assert_eq!(metrics.resolver.served_from_cache, 1);
        assert_eq!(metrics.active_sessions, 1);
        assert!(metrics.chunk_memory_bytes > 0);

        cache.shutdown().await;
    }

    #[tokio::test]
    async fn init_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.cache.capacity = 0;
        assert!(VideoCache::init(config).await.is_err());
    }

    #[tokio::test]
    async fn index_outlives_the_context() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = MockFetcher::new();
        fetcher.add(CLIP, vec![1u8; 512]);

        let first = VideoCache::with_fetcher(config(dir.path()), Arc::new(fetcher.clone()))
            .await
            .unwrap();
        first.store().put(CLIP, Default::default()).await.unwrap();
        first.shutdown().await;

        let second = VideoCache::with_fetcher(config(dir.path()), Arc::new(fetcher.clone()))
            .await
            .unwrap();
        assert!(second.store().has(CLIP).await);
        assert_eq!(fetcher.request_count(), 1);
    }
}
