use hyper::StatusCode;

/// Transport-level failures raised by a [`Fetcher`](crate::fetch::Fetcher).
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("server returned status code {0}")]
    Status(StatusCode),

    #[error("source did not report a content length")]
    MissingContentLength,

    #[error("request cancelled")]
    Cancelled,
}

impl From<hyper::Error> for FetchError {
    fn from(err: hyper::Error) -> Self {
        FetchError::Network(err.to_string())
    }
}

impl From<hyper_util::client::legacy::Error> for FetchError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        FetchError::Network(err.to_string())
    }
}

/// Errors surfaced by the [`CacheStore`](crate::cache::CacheStore).
///
/// `Clone` because a single in-flight download result is handed to every
/// caller waiting on the same key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("unsupported format, manifest sources cannot be cached: {0}")]
    UnsupportedFormat(String),

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("cache entry not found: {0}")]
    NotFound(String),

    #[error("cache index holds {len} entries, capacity is {capacity}")]
    CapacityInvariantViolation { len: usize, capacity: usize },

    #[error("download cancelled")]
    Cancelled,
}

impl From<FetchError> for CacheError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Cancelled => CacheError::Cancelled,
            other => CacheError::DownloadFailed(other.to_string()),
        }
    }
}

/// Per-chunk failures raised by the [`ChunkEngine`](crate::chunk::ChunkEngine).
///
/// `Clone` because every caller waiting on the same chunk gets the result.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    #[error("chunk download failed: {0}")]
    DownloadFailed(FetchError),

    #[error("stream session cancelled")]
    Cancelled,
}

impl From<FetchError> for StreamError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Cancelled => StreamError::Cancelled,
            other => StreamError::DownloadFailed(other),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
