use std::collections::BTreeMap;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::Quality;
use crate::fetch::ByteRange;

/// Lifecycle of a stream session. A session that was never initialized
/// simply does not exist in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Playing,
    Cleaned,
}

/// One time slice of a source. The descriptor outlives its payload.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: usize,
    /// Start of the slice in seconds
    pub start_offset: f64,
    /// End of the slice in seconds
    pub end_offset: f64,
    pub byte_range: ByteRange,
    pub loaded: bool,
    /// Present only while resident in memory
    pub payload: Option<Bytes>,
}

impl Chunk {
    pub fn payload_len(&self) -> u64 {
        self.payload.as_ref().map_or(0, |p| p.len() as u64)
    }

    fn release(&mut self) -> u64 {
        let freed = self.payload_len();
        self.payload = None;
        self.loaded = false;
        freed
    }
}

/// Number of chunks covering `duration` seconds. An exact multiple does not
/// get a trailing empty chunk.
pub fn chunk_count(duration: f64, chunk_duration: f64) -> usize {
    let raw = duration / chunk_duration;
    let rounded = raw.round();
    let count = if (raw - rounded).abs() < 1e-9 {
        rounded
    } else {
        raw.ceil()
    };
    (count as usize).max(1)
}

/// Build the descriptor table: time slices mapped onto byte ranges
/// proportionally, the last chunk ending at the last byte. Never more
/// chunks than bytes.
pub fn build_chunks(duration: f64, chunk_duration: f64, content_length: u64) -> Vec<Chunk> {
    let max_chunks = usize::try_from(content_length.max(1)).unwrap_or(usize::MAX);
    let total = chunk_count(duration, chunk_duration).min(max_chunks);
    let last_byte = content_length.saturating_sub(1);
    let byte_at = |secs: f64| -> u64 { (secs * content_length as f64 / duration).floor() as u64 };

    (0..total)
        .map(|index| {
            let start_offset = index as f64 * chunk_duration;
            let end_offset = if index + 1 == total {
                duration
            } else {
                ((index + 1) as f64 * chunk_duration).min(duration)
            };
            let start = byte_at(start_offset).min(last_byte);
            let end = if index + 1 == total {
                last_byte
            } else {
                byte_at(end_offset).saturating_sub(1).clamp(start, last_byte)
            };
            Chunk {
                index,
                start_offset,
                end_offset,
                byte_range: ByteRange::new(start, end),
                loaded: false,
                payload: None,
            }
        })
        .collect()
}

/// Chunked playback state for one video, owned by the engine.
#[derive(Debug)]
pub struct StreamSession {
    pub video_id: String,
    pub source_url: String,
    pub quality: Quality,
    pinned_quality: Quality,
    pub chunks: BTreeMap<usize, Chunk>,
    pub current_chunk_index: usize,
    pub total_chunks: usize,
    pub duration_secs: f64,
    pub content_length: u64,
    pub state: SessionState,
    pub(crate) updates: u64,
    /// Distinguishes a session from a later one reusing its video id
    pub(crate) generation: u64,
    pub(crate) cancel: CancellationToken,
}

impl StreamSession {
    pub fn new(
        video_id: String,
        source_url: String,
        quality: Quality,
        duration_secs: f64,
        content_length: u64,
        chunk_duration: f64,
        cancel: CancellationToken,
    ) -> Self {
        let chunks: BTreeMap<usize, Chunk> = build_chunks(duration_secs, chunk_duration, content_length)
            .into_iter()
            .map(|c| (c.index, c))
            .collect();
        Self {
            video_id,
            source_url,
            quality,
            pinned_quality: quality,
            total_chunks: chunks.len(),
            chunks,
            current_chunk_index: 0,
            duration_secs,
            content_length,
            state: SessionState::Initializing,
            updates: 0,
            generation: 0,
            cancel,
        }
    }

    pub fn pinned_quality(&self) -> Quality {
        self.pinned_quality
    }

    /// Put the session back on its pinned quality. True if it had drifted.
    pub(crate) fn reaffirm_quality(&mut self) -> bool {
        let drifted = self.quality != self.pinned_quality;
        self.quality = self.pinned_quality;
        drifted
    }

    pub fn resident_count(&self) -> usize {
        self.chunks.values().filter(|c| c.payload.is_some()).count()
    }

    pub fn resident_bytes(&self) -> u64 {
        self.chunks.values().map(Chunk::payload_len).sum()
    }

    /// Store a fetched payload and enforce `max_resident`. Returns a copy of
    /// the stored chunk and the net change in resident bytes.
    pub(crate) fn store_payload(
        &mut self,
        index: usize,
        payload: Bytes,
        max_resident: usize,
    ) -> Option<(Chunk, i64)> {
        let chunk = self.chunks.get_mut(&index)?;
        let mut delta = 0i64;
        if !chunk.loaded {
            delta += payload.len() as i64;
            chunk.payload = Some(payload);
            chunk.loaded = true;
        }
        let stored = chunk.clone();
        delta -= self.enforce_memory_bound(max_resident) as i64;
        Some((stored, delta))
    }

    /// Release payloads farthest from the cursor until at most
    /// `max_resident` remain. Returns bytes freed.
    pub(crate) fn enforce_memory_bound(&mut self, max_resident: usize) -> u64 {
        let mut freed = 0;
        while self.resident_count() > max_resident {
            let cursor = self.current_chunk_index;
            let farthest = self
                .chunks
                .values()
                .filter(|c| c.payload.is_some())
                .max_by_key(|c| (c.index.abs_diff(cursor), c.index))
                .map(|c| c.index);
            match farthest.and_then(|i| self.chunks.get_mut(&i)) {
                Some(chunk) => freed += chunk.release(),
                None => break,
            }
        }
        freed
    }

    /// Release every loaded chunk more than `distance` away from the cursor.
    pub(crate) fn evict_distant(&mut self, distance: usize) -> (usize, u64) {
        let cursor = self.current_chunk_index;
        let mut released = 0;
        let mut freed = 0;
        for chunk in self.chunks.values_mut() {
            if chunk.loaded && chunk.index.abs_diff(cursor) > distance {
                freed += chunk.release();
                released += 1;
            }
        }
        (released, freed)
    }

    pub(crate) fn release_all(&mut self) -> u64 {
        self.chunks.values_mut().map(Chunk::release).sum()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            video_id: self.video_id.clone(),
            state: self.state,
            quality: self.quality,
            current_chunk_index: self.current_chunk_index,
            total_chunks: self.total_chunks,
            resident_chunks: self.resident_count(),
            resident_bytes: self.resident_bytes(),
            duration_secs: self.duration_secs,
        }
    }
}

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub video_id: String,
    pub state: SessionState,
    pub quality: Quality,
    pub current_chunk_index: usize,
    pub total_chunks: usize,
    pub resident_chunks: usize,
    pub resident_bytes: u64,
    pub duration_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(duration: f64, len: u64) -> StreamSession {
        StreamSession::new(
            "v1".into(),
            "http://cdn.test/v1.mp4".into(),
            Quality::P720,
            duration,
            len,
            0.5,
            CancellationToken::new(),
        )
    }

    fn load(session: &mut StreamSession, index: usize, max: usize) {
        session.store_payload(index, Bytes::from(vec![0u8; 10]), max);
    }

    #[test]
    fn thirty_seconds_in_half_second_chunks() {
        assert_eq!(chunk_count(30.0, 0.5), 60);
        assert_eq!(chunk_count(30.1, 0.5), 61);
        assert_eq!(chunk_count(0.2, 0.5), 1);
        assert_eq!(session(30.0, 60_000).total_chunks, 60);
    }

    #[test]
    fn byte_ranges_tile_the_source() {
        let chunks = build_chunks(10.0, 0.5, 10_007);
        assert_eq!(chunks.len(), 20);
        assert_eq!(chunks[0].byte_range.start, 0);
        assert_eq!(chunks.last().unwrap().byte_range.end, 10_006);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].byte_range.end + 1, pair[1].byte_range.start);
            assert_eq!(pair[0].end_offset, pair[1].start_offset);
        }
        assert_eq!(chunks.last().unwrap().end_offset, 10.0);
    }

    #[test]
    fn chunk_table_never_outgrows_the_content() {
        let chunks = build_chunks(1_000_000.0, 0.5, 1_000);
        assert_eq!(chunks.len(), 1_000);
        assert_eq!(chunks.last().unwrap().end_offset, 1_000_000.0);
        assert_eq!(chunks.last().unwrap().byte_range.end, 999);
    }

    #[test]
    fn eviction_keeps_descriptors() {
        let mut s = session(10.0, 1000);
        for i in 0..10 {
            load(&mut s, i, 100);
        }
        s.current_chunk_index = 7;

        let (released, freed) = s.evict_distant(5);
        assert_eq!(released, 2);
        assert_eq!(freed, 20);
        assert!(!s.chunks[&0].loaded && s.chunks[&0].payload.is_none());
        assert!(!s.chunks[&1].loaded);
        assert!(s.chunks[&2].loaded);
        assert_eq!(s.total_chunks, 20);
        assert_eq!(s.chunks.len(), 20);
    }

    #[test]
    fn memory_bound_drops_farthest_first() {
        let mut s = session(10.0, 1000);
        s.current_chunk_index = 5;
        for i in [0, 4, 5, 6, 12] {
            load(&mut s, i, 3);
        }
        assert_eq!(s.resident_count(), 3);
        assert!(s.chunks[&4].loaded && s.chunks[&5].loaded && s.chunks[&6].loaded);
    }

    #[test]
    fn storing_twice_counts_once() {
        let mut s = session(10.0, 1000);
        let (_, first) = s.store_payload(3, Bytes::from_static(b"abc"), 10).unwrap();
        let (_, second) = s.store_payload(3, Bytes::from_static(b"abc"), 10).unwrap();
        assert_eq!((first, second), (3, 0));
        assert!(s.store_payload(99, Bytes::new(), 10).is_none());
    }

    #[test]
    fn quality_is_reaffirmed() {
        let mut s = session(10.0, 1000);
        assert!(!s.reaffirm_quality());
        s.quality = Quality::P360;
        assert!(s.reaffirm_quality());
        assert_eq!(s.quality, Quality::P720);
    }
}
