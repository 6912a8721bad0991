mod client;

pub use client::*;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::future;
use futures::stream::BoxStream;
use futures_util::StreamExt;

use crate::error::FetchError;

pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// Inclusive byte range, rendered as `Range: bytes=start-end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// What a HEAD request tells us about a source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceInfo {
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    /// Duration in seconds, when the server advertises one
    pub duration_secs: Option<f64>,
}

/// Network access used by the cache store and the chunk engine.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    /// Fetch headers only.
    async fn probe(&self, url: &str) -> Result<ResourceInfo, FetchError>;

    /// Open a body stream for the whole resource or one byte range of it.
    /// A ranged stream starts at `range.start` but may run past `range.end`.
    async fn open(&self, url: &str, range: Option<ByteRange>) -> Result<ByteStream, FetchError>;
}

/// Read a whole body (or range) into memory.
pub async fn fetch_bytes(
    fetcher: &dyn Fetcher,
    url: &str,
    range: Option<ByteRange>,
) -> Result<Bytes, FetchError> {
    let mut stream = fetcher.open(url, range).await?;
    let mut body = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        body.extend_from_slice(&chunk?);
        if let Some(range) = range {
            if body.len() as u64 >= range.len() {
                body.truncate(range.len() as usize);
                break;
            }
        }
    }
    Ok(body.freeze())
}

/// Drop the first `n` bytes of a body stream.
pub fn skip_prefix(stream: ByteStream, n: u64) -> ByteStream {
    if n == 0 {
        return stream;
    }
    let mut remaining = n;
    stream
        .filter_map(move |chunk| {
            let chunk = match chunk {
                Ok(bytes) if remaining > 0 => {
                    let skip = remaining.min(bytes.len() as u64) as usize;
                    remaining -= skip as u64;
                    Some(bytes.slice(skip..)).filter(|rest| !rest.is_empty()).map(Ok)
                }
                other => Some(other),
            };
            future::ready(chunk)
        })
        .boxed()
}
