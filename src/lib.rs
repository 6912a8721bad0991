//! Persistent video cache and chunked streaming.
//!
//! [`VideoCache`] ties the pieces together: a [`CacheStore`] of whole
//! files on disk, a [`StreamResolver`] choosing between a cached copy and
//! the network, and a [`ChunkEngine`] serving short time slices with
//! prefetch and a memory bound.

pub mod cache;
pub mod chunk;
pub mod config;
pub mod context;
pub mod error;
pub mod fetch;
pub mod metrics;
pub mod resolver;

#[cfg(test)]
mod test_util;

pub use cache::{CacheStore, Priority};
pub use chunk::{ChunkEngine, Quality};
pub use config::VideoCacheConfig;
pub use context::{PerformanceMetrics, VideoCache};
pub use error::{Error, Result};
pub use resolver::{PlaybackSource, StreamResolver};
