//! In-memory fetcher for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use hyper::StatusCode;

use crate::error::FetchError;
use crate::fetch::{ByteRange, ByteStream, Fetcher, ResourceInfo};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
struct Inner {
    bodies: HashMap<String, Bytes>,
    durations: HashMap<String, f64>,
    failing: HashSet<String>,
    log: Vec<(String, Option<ByteRange>)>,
}

/// Serves registered bodies and counts every `open` call.
#[derive(Clone, Default)]
pub struct MockFetcher {
    inner: Arc<Mutex<Inner>>,
    opens: Arc<AtomicUsize>,
    probes: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    delay: Arc<Mutex<Option<Duration>>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, url: &str, body: impl Into<Bytes>) {
        self.inner
            .lock()
            .unwrap()
            .bodies
            .insert(url.to_owned(), body.into());
    }

    pub fn add_video(&self, url: &str, size: usize, duration_secs: f64) {
        let body: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        self.add(url, body);
        self.inner
            .lock()
            .unwrap()
            .durations
            .insert(url.to_owned(), duration_secs);
    }

    pub fn fail(&self, url: &str) {
        self.inner.lock().unwrap().failing.insert(url.to_owned());
    }

    pub fn recover(&self, url: &str) {
        self.inner.lock().unwrap().failing.remove(url);
    }

    /// Hold every `open` for this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn request_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Highest number of `open` calls that were waiting at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn requests_for(&self, url: &str) -> Vec<Option<ByteRange>> {
        self.inner
            .lock()
            .unwrap()
            .log
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, r)| *r)
            .collect()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn probe(&self, url: &str) -> Result<ResourceInfo, FetchError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock().unwrap();
        if inner.failing.contains(url) {
            return Err(FetchError::Status(StatusCode::BAD_GATEWAY));
        }
        let body = inner
            .bodies
            .get(url)
            .ok_or(FetchError::Status(StatusCode::NOT_FOUND))?;
        Ok(ResourceInfo {
            content_length: Some(body.len() as u64),
            content_type: Some("video/mp4".to_owned()),
            duration_secs: inner.durations.get(url).copied(),
        })
    }

    async fn open(&self, url: &str, range: Option<ByteRange>) -> Result<ByteStream, FetchError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let body = {
            let mut inner = self.inner.lock().unwrap();
            inner.log.push((url.to_owned(), range));
            if inner.failing.contains(url) {
                return Err(FetchError::Status(StatusCode::BAD_GATEWAY));
            }
            inner
                .bodies
                .get(url)
                .cloned()
                .ok_or(FetchError::Status(StatusCode::NOT_FOUND))?
        };

        let body = match range {
            Some(r) => {
                let end = (r.end as usize + 1).min(body.len());
                body.slice((r.start as usize).min(end)..end)
            }
            None => body,
        };

        // 分成小块模拟网络传输
        let pieces: Vec<Result<Bytes, FetchError>> = body
            .chunks(64)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(futures::stream::iter(pieces).boxed())
    }
}
