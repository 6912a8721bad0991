//! Cache-or-network decision for a single playback request.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::{CacheStore, Priority};
use crate::error::CacheError;

/// What the player should open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaybackSource {
    pub uri: String,
    pub cached: bool,
}

impl PlaybackSource {
    fn local(path: &Path) -> Self {
        Self {
            uri: path.to_string_lossy().into_owned(),
            cached: true,
        }
    }

    fn network(locator: &str) -> Self {
        Self {
            uri: locator.to_owned(),
            cached: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProxyStats {
    pub served_from_cache: u64,
    pub served_from_network: u64,
    pub hit_rate: f64,
}

/// Serves cached copies and populates the cache in the background on a
/// miss. Playback never waits for a download.
pub struct StreamResolver {
    store: CacheStore,
    served_from_cache: AtomicU64,
    served_from_network: AtomicU64,
}

impl StreamResolver {
    pub fn new(store: CacheStore) -> Self {
        Self {
            store,
            served_from_cache: AtomicU64::new(0),
            served_from_network: AtomicU64::new(0),
        }
    }

    pub async fn resolve(&self, locator: &str) -> PlaybackSource {
        if let Some(path) = self.store.get(locator).await {
            self.served_from_cache.fetch_add(1, Ordering::Relaxed);
            debug!(url = %locator, path = %path.display(), "Serving from cache");
            return PlaybackSource::local(&path);
        }

        self.served_from_network.fetch_add(1, Ordering::Relaxed);
        debug!(url = %locator, "Serving from network, caching in background");

        let store = self.store.clone();
        let owned = locator.to_owned();
        self.store.tracker().spawn(async move {
            match store.put(&owned, Priority::High).await {
                Ok(_) => {}
                Err(CacheError::UnsupportedFormat(_)) => {
                    debug!(url = %owned, "Not caching manifest source")
                }
                Err(CacheError::Cancelled) => debug!(url = %owned, "Background cache cancelled"),
                Err(e) => warn!(url = %owned, error = %e, "Background cache failed"),
            }
        });

        PlaybackSource::network(locator)
    }

    pub fn stats(&self) -> ProxyStats {
        let cache = self.served_from_cache.load(Ordering::Relaxed);
        let network = self.served_from_network.load(Ordering::Relaxed);
        let total = cache + network;
        ProxyStats {
            served_from_cache: cache,
            served_from_network: network,
            hit_rate: if total == 0 {
                0.0
            } else {
                cache as f64 / total as f64
            },
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }
}
