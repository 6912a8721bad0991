use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::{chunk_count, Chunk, Quality, SessionInfo, SessionState, StreamSession};
use crate::config::ChunkConfig;
use crate::error::{FetchError, StreamError};
use crate::fetch::{fetch_bytes, ByteRange, Fetcher};

type ChunkResult = Result<Option<Chunk>, StreamError>;
type SharedLoad = Shared<BoxFuture<'static, ChunkResult>>;

/// Session generation and chunk index of a fetch in progress.
type LoadKey = (u64, usize);

#[derive(Default)]
struct EngineState {
    sessions: HashMap<String, StreamSession>,
    /// Bytes of chunk payload resident across all sessions
    memory_usage: u64,
    next_generation: u64,
    in_flight: HashMap<LoadKey, SharedLoad>,
}

enum Load {
    Ready(Chunk),
    Pending(SharedLoad),
}

struct ChunkFetch {
    video_id: String,
    index: usize,
    url: String,
    range: ByteRange,
    generation: u64,
    cancel: CancellationToken,
}

impl EngineState {
    fn apply(&mut self, delta: i64) {
        self.memory_usage = self.memory_usage.saturating_add_signed(delta);
    }
}

struct EngineInner {
    config: ChunkConfig,
    fetcher: Arc<dyn Fetcher>,
    state: Mutex<EngineState>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl EngineInner {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Splits sources into short time slices so playback can start after the
/// first chunk and memory stays bounded while it continues.
#[derive(Clone)]
pub struct ChunkEngine {
    inner: Arc<EngineInner>,
}

impl ChunkEngine {
    pub fn new(config: ChunkConfig, fetcher: Arc<dyn Fetcher>, shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                fetcher,
                state: Mutex::new(EngineState::default()),
                shutdown,
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Probe the source, build the chunk table, load chunk 0 before
    /// returning and prefetch the rest of the first window in the background.
    ///
    /// A failed probe creates no session. A failed first chunk leaves the
    /// session in place so the caller can retry with [`get_chunk`](Self::get_chunk).
    pub async fn initialize_stream(
        &self,
        video_id: &str,
        source_url: &str,
        quality: Quality,
    ) -> Result<SessionInfo, StreamError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        let cancel = self.inner.shutdown.child_token();

        let resource = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StreamError::Cancelled),
            r = self.inner.fetcher.probe(source_url) => r?,
        };
        let content_length = resource
            .content_length
            .filter(|len| *len > 0)
            .ok_or(FetchError::MissingContentLength)?;
        let chunk_duration = self.inner.config.chunk_duration_secs;
        // 没有时长信息时按码率估算
        let estimate = content_length as f64 * 8.0 / self.inner.config.assumed_bitrate_bps as f64;
        let duration = match resource.duration_secs {
            Some(reported) if chunk_count(reported, chunk_duration) as u64 > content_length => {
                warn!(
                    video_id,
                    reported,
                    content_length,
                    estimate,
                    "Reported duration does not fit the content length, using estimate"
                );
                estimate
            }
            Some(reported) => reported,
            None => estimate,
        };

        let mut session = StreamSession::new(
            video_id.to_owned(),
            source_url.to_owned(),
            quality,
            duration,
            content_length,
            chunk_duration,
            cancel,
        );
        info!(
            video_id,
            url = %source_url,
            %quality,
            duration,
            total_chunks = session.total_chunks,
            "Initializing stream"
        );

        let replaced = {
            let mut state = self.inner.state();
            state.next_generation += 1;
            session.generation = state.next_generation;
            state.sessions.insert(video_id.to_owned(), session)
        };
        if let Some(old) = replaced {
            self.discard(old);
        }

        let first = self.load_chunk(video_id, 0).await;

        let info = {
            let mut state = self.inner.state();
            let Some(session) = state.sessions.get_mut(video_id) else {
                return Err(StreamError::Cancelled);
            };
            session.state = SessionState::Playing;
            session.info()
        };
        first?;

        self.prefetch_after(video_id, 0);
        Ok(info)
    }

    /// Chunk `index` of a session, loading it first if needed. `Ok(None)` for
    /// an unknown session or index.
    pub async fn get_chunk(&self, video_id: &str, index: usize) -> Result<Option<Chunk>, StreamError> {
        let resident = {
            let state = self.inner.state();
            let Some(chunk) = state
                .sessions
                .get(video_id)
                .and_then(|s| s.chunks.get(&index))
            else {
                return Ok(None);
            };
            chunk.loaded.then(|| chunk.clone())
        };

        let chunk = match resident {
            Some(chunk) => Some(chunk),
            None => self.load_chunk(video_id, index).await?,
        };
        if chunk.is_some() {
            self.prefetch_after(video_id, index);
        }
        Ok(chunk)
    }

    /// Move the playback cursor. Every n-th update runs an eviction pass.
    /// False for an unknown session.
    pub fn update_current_chunk(&self, video_id: &str, index: usize) -> bool {
        let mut state = self.inner.state();
        let Some(session) = state.sessions.get_mut(video_id) else {
            return false;
        };
        session.current_chunk_index = index.min(session.total_chunks.saturating_sub(1));
        session.updates += 1;
        if session.updates % self.inner.config.eviction_interval != 0 {
            return true;
        }

        let (released, freed) = session.evict_distant(self.inner.config.eviction_distance);
        let cursor = session.current_chunk_index;
        state.apply(-(freed as i64));
        if released > 0 {
            debug!(video_id, cursor, released, freed, "Evicted distant chunks");
        }
        true
    }

    /// Always the session's pinned quality; bandwidth is only logged.
    /// `None` for an unknown session.
    pub fn adapt_quality(&self, video_id: &str, measured_bandwidth_bps: u64) -> Option<Quality> {
        let mut state = self.inner.state();
        let session = state.sessions.get_mut(video_id)?;
        if session.reaffirm_quality() {
            warn!(video_id, quality = %session.quality, "Session quality drifted, restored pinned quality");
        }
        debug!(
            video_id,
            measured_bandwidth_bps,
            quality = %session.quality,
            "Keeping pinned quality"
        );
        Some(session.quality)
    }

    /// Release every payload, abort outstanding fetches and drop the session.
    pub fn cleanup_stream(&self, video_id: &str) -> Option<SessionInfo> {
        let session = self.inner.state().sessions.remove(video_id)?;
        Some(self.discard(session))
    }

    fn discard(&self, mut session: StreamSession) -> SessionInfo {
        session.cancel.cancel();
        let freed = session.release_all();
        session.state = SessionState::Cleaned;
        {
            let mut state = self.inner.state();
            state.apply(-(freed as i64));
            state.in_flight.retain(|(generation, _), _| *generation != session.generation);
        }
        debug!(video_id = %session.video_id, freed, "Stream cleaned up");
        session.info()
    }

    pub fn session_info(&self, video_id: &str) -> Option<SessionInfo> {
        self.inner.state().sessions.get(video_id).map(StreamSession::info)
    }

    /// Payload bytes currently held across all sessions.
    pub fn memory_usage(&self) -> u64 {
        self.inner.state().memory_usage
    }

    pub fn session_count(&self) -> usize {
        self.inner.state().sessions.len()
    }

    /// Wait for outstanding prefetches.
    pub async fn flush(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let sessions: Vec<StreamSession> = self.inner.state().sessions.drain().map(|(_, s)| s).collect();
        for session in sessions {
            self.discard(session);
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("Chunk engine shut down");
    }

    /// Load one chunk, joining a fetch already running for it.
    async fn load_chunk(&self, video_id: &str, index: usize) -> ChunkResult {
        let load = {
            let mut state = self.inner.state();
            self.begin_load(&mut state, video_id, index)
        };
        match load {
            Some(Load::Ready(chunk)) => Ok(Some(chunk)),
            Some(Load::Pending(pending)) => pending.await,
            None => Ok(None),
        }
    }

    /// Resolve a chunk under the state lock: the resident copy, the fetch in
    /// progress, or a newly started fetch. `None` for an unknown session or
    /// index.
    fn begin_load(&self, state: &mut EngineState, video_id: &str, index: usize) -> Option<Load> {
        let session = state.sessions.get(video_id)?;
        let chunk = session.chunks.get(&index)?;
        if chunk.loaded {
            return Some(Load::Ready(chunk.clone()));
        }
        let key = (session.generation, index);
        if let Some(pending) = state.in_flight.get(&key) {
            debug!(video_id, index, "Joining chunk fetch in progress");
            return Some(Load::Pending(pending.clone()));
        }

        let fetch = ChunkFetch {
            video_id: video_id.to_owned(),
            index,
            url: session.source_url.clone(),
            range: chunk.byte_range,
            generation: session.generation,
            cancel: session.cancel.clone(),
        };
        let engine = self.clone();
        let handle = self.inner.tracker.spawn(async move { engine.fetch_chunk(fetch).await });
        let pending = async move {
            handle.await.unwrap_or_else(|e| {
                Err(StreamError::from(FetchError::Network(format!(
                    "chunk task failed: {e}"
                ))))
            })
        }
        .boxed()
        .shared();

        state.in_flight.insert(key, pending.clone());
        Some(Load::Pending(pending))
    }

    async fn fetch_chunk(self, fetch: ChunkFetch) -> ChunkResult {
        let fetched = tokio::select! {
            biased;
            _ = fetch.cancel.cancelled() => Err(StreamError::Cancelled),
            r = fetch_bytes(self.inner.fetcher.as_ref(), &fetch.url, Some(fetch.range)) => {
                r.map_err(StreamError::from)
            }
        };

        let result = self.store_fetched(&fetch, fetched);
        match &result {
            Err(StreamError::Cancelled) => {
                debug!(video_id = %fetch.video_id, index = fetch.index, "Chunk fetch cancelled")
            }
            Err(e) => warn!(video_id = %fetch.video_id, index = fetch.index, error = %e, "Chunk fetch failed"),
            Ok(_) => {}
        }
        result
    }

    fn store_fetched(&self, fetch: &ChunkFetch, fetched: Result<Bytes, StreamError>) -> ChunkResult {
        let mut state = self.inner.state();
        state.in_flight.remove(&(fetch.generation, fetch.index));
        let payload = fetched?;

        // 会话可能已在加载期间被清理或替换
        let max_resident = self.inner.config.max_memory_chunks;
        let Some(session) = state
            .sessions
            .get_mut(&fetch.video_id)
            .filter(|s| s.generation == fetch.generation && !s.cancel.is_cancelled())
        else {
            return Err(StreamError::Cancelled);
        };
        let Some((chunk, delta)) = session.store_payload(fetch.index, payload, max_resident) else {
            return Ok(None);
        };
        state.apply(delta);
        debug!(
            video_id = %fetch.video_id,
            index = fetch.index,
            bytes = chunk.payload_len(),
            "Chunk loaded"
        );
        Ok(Some(chunk))
    }

    /// Start background loads for the window after `index`. Chunks already
    /// resident or being fetched are skipped; failures are only logged.
    fn prefetch_after(&self, video_id: &str, index: usize) {
        let window = self.inner.config.preload_chunks.saturating_sub(1);
        if window == 0 {
            return;
        }

        let mut state = self.inner.state();
        if state
            .sessions
            .get(video_id)
            .map_or(true, |s| s.cancel.is_cancelled())
        {
            return;
        }
        for next in index + 1..=index + window {
            if self.begin_load(&mut state, video_id, next).is_none() {
                break;
            }
        }
    }
}
