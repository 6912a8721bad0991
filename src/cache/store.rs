use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures_util::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::{
    file_extension, is_manifest, CacheEntry, CacheIndex, CacheKey, DiskCache, PersistedIndex,
    Priority,
};
use crate::config::CacheConfig;
use crate::error::{CacheError, Error};
use crate::fetch::Fetcher;
use crate::metrics::{CacheMetrics, MetricsCollector};

type SharedDownload = Shared<BoxFuture<'static, Result<PathBuf, CacheError>>>;

struct State {
    index: CacheIndex,
    metrics: MetricsCollector,
}

struct Inner {
    config: CacheConfig,
    disk: DiskCache,
    fetcher: Arc<dyn Fetcher>,
    state: Mutex<State>,
    in_flight: Mutex<HashMap<CacheKey, SharedDownload>>,
    download_permits: Semaphore,
    persist_lock: AsyncMutex<()>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Inner {
    // The std mutexes are never held across an await.
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<CacheKey, SharedDownload>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Downloaded {
    path: PathBuf,
    size: u64,
    elapsed_ms: u64,
}

fn io_failed(e: std::io::Error) -> CacheError {
    CacheError::DownloadFailed(e.to_string())
}

/// Persistent, capacity-bounded LRU cache of whole video files.
///
/// Cloning is cheap and every clone shares the same index. All index
/// mutations happen under a short critical section with no suspension in
/// between, so they are totally ordered; network and disk I/O happen
/// outside it.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<Inner>,
}

impl CacheStore {
    /// Open the store: load the persisted index and drop every entry whose
    /// file is gone before accepting requests.
    pub async fn open(
        config: CacheConfig,
        fetcher: Arc<dyn Fetcher>,
        shutdown: CancellationToken,
    ) -> Result<Self, Error> {
        config.validate()?;
        let disk = DiskCache::new(config.cache_dir.clone(), &config.index_file_name).await?;

        let record = match disk.load_index().await {
            Ok(record) => record.unwrap_or_default(),
            Err(e) => {
                warn!(path = %disk.index_path().display(), error = %e, "Discarding unreadable cache index");
                PersistedIndex::default()
            }
        };
        let metrics = MetricsCollector::from_metrics(record.metrics);
        let (mut index, overflow) = CacheIndex::from_record(record, config.capacity);

        for entry in &overflow {
            if let Err(e) = disk.remove_file(&entry.local_path).await {
                warn!(key = %entry.key, error = %e, "Failed to remove entry beyond capacity");
            }
        }

        let mut missing = 0;
        for entry in index.entries() {
            if !disk.exists(&entry.local_path).await {
                warn!(key = %entry.key, path = %entry.local_path.display(), "Cached file missing, dropping entry");
                index.remove(&entry.key);
                missing += 1;
            }
        }

        let keep: HashSet<PathBuf> = index.entries().into_iter().map(|e| e.local_path).collect();
        let orphans = disk.remove_unreferenced(&keep).await.unwrap_or_else(|e| {
            warn!(dir = %disk.cache_dir().display(), error = %e, "Failed to sweep cache directory");
            0
        });

        info!(
            dir = %disk.cache_dir().display(),
            entries = index.len(),
            capacity = index.capacity(),
            missing,
            overflow = overflow.len(),
            orphans,
            "Cache store opened"
        );

        let store = Self {
            inner: Arc::new(Inner {
                download_permits: Semaphore::new(config.max_concurrent_downloads),
                config,
                disk,
                fetcher,
                state: Mutex::new(State { index, metrics }),
                in_flight: Mutex::new(HashMap::new()),
                persist_lock: AsyncMutex::new(()),
                shutdown,
                tracker: TaskTracker::new(),
            }),
        };
        store.persist().await;
        Ok(store)
    }

    /// True iff the locator is indexed and its file is still on disk. A
    /// stale entry is dropped on the way.
    pub async fn has(&self, locator: &str) -> bool {
        let key = CacheKey::from_locator(locator);
        let Some(path) = self.cached_path(&key) else {
            return false;
        };
        if self.inner.disk.exists(&path).await {
            return true;
        }
        if self.drop_stale(&key, &path) {
            self.persist().await;
        }
        false
    }

    /// Local path for a cached locator. A hit moves the entry to the MRU end
    /// and never touches the network.
    pub async fn get(&self, locator: &str) -> Option<PathBuf> {
        let key = CacheKey::from_locator(locator);
        let Some(path) = self.cached_path(&key) else {
            self.inner.state().metrics.record_miss();
            debug!(%key, url = %locator, "Cache miss");
            self.persist().await;
            return None;
        };

        let exists = self.inner.disk.exists(&path).await;
        let hit = {
            let mut state = self.inner.state();
            let touched = if exists {
                state.index.touch(&key).map(|entry| entry.size_bytes)
            } else {
                None
            };
            match touched {
                Some(size) => {
                    state.metrics.record_hit(size);
                    true
                }
                None => {
                    if !exists && state.index.peek(&key).is_some_and(|e| e.local_path == path) {
                        warn!(%key, path = %path.display(), "Cached file missing, dropping stale entry");
                        state.index.remove(&key);
                    }
                    state.metrics.record_miss();
                    false
                }
            }
        };
        self.persist().await;

        if hit {
            debug!(%key, "Cache hit");
            Some(path)
        } else {
            None
        }
    }

    /// Download `locator` into the cache, or return the existing copy.
    pub async fn put(&self, locator: &str, priority: Priority) -> Result<PathBuf, CacheError> {
        self.put_with_cancel(locator, priority, CancellationToken::new())
            .await
    }

    /// Like [`put`](Self::put), but the download is aborted when `cancel`
    /// fires. Callers joining the same in-flight download share its outcome.
    pub async fn put_with_cancel(
        &self,
        locator: &str,
        priority: Priority,
        cancel: CancellationToken,
    ) -> Result<PathBuf, CacheError> {
        if is_manifest(locator) {
            return Err(CacheError::UnsupportedFormat(locator.to_owned()));
        }

        let key = CacheKey::from_locator(locator);
        if self.inner.state().index.contains(&key) {
            if let Some(path) = self.get(locator).await {
                return Ok(path);
            }
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        self.join_or_start(key, locator, priority, cancel).await
    }

    fn join_or_start(
        &self,
        key: CacheKey,
        locator: &str,
        priority: Priority,
        cancel: CancellationToken,
    ) -> SharedDownload {
        let mut in_flight = self.inner.in_flight();
        if let Some(download) = in_flight.get(&key) {
            debug!(%key, "Joining in-flight download");
            return download.clone();
        }

        let store = self.clone();
        let task_key = key.clone();
        let locator = locator.to_owned();
        let handle = self
            .inner
            .tracker
            .spawn(async move { store.download(task_key, locator, priority, cancel).await });

        let download = async move {
            handle.await.unwrap_or_else(|e| {
                Err(CacheError::DownloadFailed(format!("download task failed: {e}")))
            })
        }
        .boxed()
        .shared();

        in_flight.insert(key, download.clone());
        download
    }

    async fn download(
        self,
        key: CacheKey,
        locator: String,
        priority: Priority,
        cancel: CancellationToken,
    ) -> Result<PathBuf, CacheError> {
        let extension = file_extension(&locator);
        let part_path = self.inner.disk.part_path(&key, &extension);
        let final_path = self.inner.disk.entry_path(&key, &extension);

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CacheError::Cancelled),
            _ = self.inner.shutdown.cancelled() => Err(CacheError::Cancelled),
            result = self.fetch_to_disk(&locator, priority, &part_path, &final_path) => result,
        };

        let result = match fetched {
            Ok(downloaded) => self.insert_entry(key.clone(), locator.clone(), downloaded).await,
            Err(e) => {
                if let Err(rm) = self.inner.disk.remove_file(&part_path).await {
                    warn!(path = %part_path.display(), error = %rm, "Failed to remove partial download");
                }
                Err(e)
            }
        };
        self.inner.in_flight().remove(&key);

        match &result {
            Err(CacheError::Cancelled) => debug!(%key, url = %locator, "Download cancelled"),
            Err(e) => warn!(%key, url = %locator, error = %e, "Download failed"),
            Ok(_) => {}
        }
        result
    }

    async fn fetch_to_disk(
        &self,
        locator: &str,
        priority: Priority,
        part_path: &Path,
        final_path: &Path,
    ) -> Result<Downloaded, CacheError> {
        // 高优先级（正在播放）不排队
        let _permit = if priority == Priority::High {
            None
        } else {
            Some(
                self.inner
                    .download_permits
                    .acquire()
                    .await
                    .map_err(|_| CacheError::Cancelled)?,
            )
        };

        let started = Instant::now();
        let mut stream = self.inner.fetcher.open(locator, None).await?;
        let mut file = fs::File::create(part_path).await.map_err(io_failed)?;
        let mut size = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await.map_err(io_failed)?;
            size += chunk.len() as u64;
        }
        file.flush().await.map_err(io_failed)?;
        drop(file);

        fs::rename(part_path, final_path).await.map_err(io_failed)?;

        Ok(Downloaded {
            path: final_path.to_path_buf(),
            size,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Evict from the LRU head until there is room, then append at the MRU end.
    async fn insert_entry(
        &self,
        key: CacheKey,
        locator: String,
        downloaded: Downloaded,
    ) -> Result<PathBuf, CacheError> {
        let now = Utc::now();
        let entry = CacheEntry {
            key: key.clone(),
            locator,
            local_path: downloaded.path.clone(),
            size_bytes: downloaded.size,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            download_duration_ms: downloaded.elapsed_ms,
        };

        let (evicted, inserted) = {
            let mut guard = self.inner.state();
            let state = &mut *guard;
            let mut evicted = Vec::new();
            if !state.index.contains(&key) {
                while state.index.is_full() {
                    let Some(victim) = state.index.pop_lru() else {
                        break;
                    };
                    state.metrics.record_eviction(victim.size_bytes);
                    evicted.push(victim);
                }
            }
            (evicted, state.index.insert(entry))
        };

        for victim in &evicted {
            info!(key = %victim.key, size = victim.size_bytes, "Evicted least recently used entry");
            if let Err(e) = self.inner.disk.remove_file(&victim.local_path).await {
                warn!(key = %victim.key, error = %e, "Failed to delete evicted file");
            }
        }

        if let Err(e) = inserted {
            error!(%key, error = %e, "Cache capacity invariant violated");
            let _ = self.inner.disk.remove_file(&downloaded.path).await;
            self.persist().await;
            return Err(e);
        }

        debug!(
            %key,
            size = downloaded.size,
            elapsed_ms = downloaded.elapsed_ms,
            "Cached new entry"
        );
        self.persist().await;
        Ok(downloaded.path)
    }

    /// Fire-and-forget warm-up of upcoming items. At most `concurrency_hint`
    /// of this batch run at once, and all low-priority downloads together
    /// never exceed the store's download pool.
    pub fn preload<I>(&self, locators: I, concurrency_hint: usize)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let locators: Vec<String> = locators.into_iter().map(Into::into).collect();
        if locators.is_empty() {
            return;
        }
        let limit = concurrency_hint.clamp(1, self.inner.config.max_concurrent_downloads);
        let store = self.clone();

        self.inner.tracker.spawn(async move {
            futures::stream::iter(locators)
                .for_each_concurrent(limit, |locator| {
                    let store = store.clone();
                    async move {
                        if is_manifest(&locator) {
                            debug!(url = %locator, "Skipping manifest in preload");
                            return;
                        }
                        if store.has(&locator).await {
                            return;
                        }
                        match store.put(&locator, Priority::Low).await {
                            Ok(path) => debug!(url = %locator, path = %path.display(), "Preloaded"),
                            Err(CacheError::Cancelled) => debug!(url = %locator, "Preload cancelled"),
                            Err(e) => warn!(url = %locator, error = %e, "Preload failed"),
                        }
                    }
                })
                .await;
        });
    }

    /// Drop one entry and its file. `NotFound` if the locator is not cached.
    pub async fn remove(&self, locator: &str) -> Result<PathBuf, CacheError> {
        let key = CacheKey::from_locator(locator);
        let Some(entry) = self.inner.state().index.remove(&key) else {
            return Err(CacheError::NotFound(locator.to_owned()));
        };
        if let Err(e) = self.inner.disk.remove_file(&entry.local_path).await {
            warn!(%key, error = %e, "Failed to delete cached file");
        }
        debug!(%key, url = %locator, "Removed cache entry");
        self.persist().await;
        Ok(entry.local_path)
    }

    /// Delete every cached file, empty the index and reset the metrics.
    pub async fn clear(&self) {
        let drained = {
            let mut state = self.inner.state();
            state.metrics.reset();
            state.index.drain()
        };

        for entry in &drained {
            if let Err(e) = self.inner.disk.remove_file(&entry.local_path).await {
                warn!(key = %entry.key, error = %e, "Failed to delete cached file");
            }
        }
        info!(removed = drained.len(), "Cache cleared");
        self.persist().await;
    }

    /// Wait until every background download and preload has finished.
    pub async fn flush(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    /// Abort outstanding downloads, wait for them to unwind and write the
    /// index a final time.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.persist().await;
        info!("Cache store shut down");
    }

    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.inner.tracker
    }

    pub fn metrics(&self) -> CacheMetrics {
        let state = self.inner.state();
        state
            .metrics
            .snapshot(state.index.len(), state.index.capacity(), state.index.total_bytes())
    }

    /// Entries from least to most recently used.
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.inner.state().index.entries()
    }

    pub fn len(&self) -> usize {
        self.inner.state().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state().index.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.capacity
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.state().index.total_bytes()
    }

    pub fn cache_dir(&self) -> &Path {
        self.inner.disk.cache_dir()
    }

    fn cached_path(&self, key: &CacheKey) -> Option<PathBuf> {
        self.inner
            .state()
            .index
            .peek(key)
            .map(|entry| entry.local_path.clone())
    }

    /// Remove `key` only if it still points at `path`. True when removed.
    fn drop_stale(&self, key: &CacheKey, path: &Path) -> bool {
        let mut state = self.inner.state();
        if state.index.peek(key).is_some_and(|e| e.local_path == path) {
            warn!(%key, path = %path.display(), "Cached file missing, dropping stale entry");
            state.index.remove(key);
            true
        } else {
            false
        }
    }

    /// Write the whole index. Failures are logged, never surfaced.
    async fn persist(&self) {
        let _guard = self.inner.persist_lock.lock().await;
        let record = {
            let state = self.inner.state();
            state.index.to_record(state.metrics.metrics())
        };
        if let Err(e) = self.inner.disk.save_index(&record).await {
            warn!(path = %self.inner.disk.index_path().display(), error = %e, "Failed to persist cache index");
        }
    }
}
