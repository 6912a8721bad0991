use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use video_cache::config::{CacheConfig, FetchConfig};
use video_cache::error::FetchError;
use video_cache::fetch::{fetch_bytes, ByteRange, Fetcher, HttpFetcher, X_CONTENT_DURATION};
use video_cache::{VideoCache, VideoCacheConfig};

const CLIP_LEN: usize = 1000;

fn clip() -> Bytes {
    (0..CLIP_LEN).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
}

#[derive(Default)]
struct Counters {
    flaky: AtomicUsize,
    missing: AtomicUsize,
}

fn parse_range(req: &Request<Incoming>) -> Option<(usize, usize)> {
    let raw = req.headers().get(RANGE)?.to_str().ok()?;
    let (start, end) = raw.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

async fn handle(
    req: Request<Incoming>,
    counters: Arc<Counters>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let body = clip();
    let response = match req.uri().path() {
        "/clip.mp4" => match (req.method(), parse_range(&req)) {
            (&Method::GET, Some((start, end))) => {
                let end = end.min(CLIP_LEN - 1);
                Response::builder()
                    .status(StatusCode::PARTIAL_CONTENT)
                    .header(CONTENT_RANGE, format!("bytes {start}-{end}/{CLIP_LEN}"))
                    .body(Full::new(body.slice(start..=end)))
            }
            _ => Response::builder()
                .header(CONTENT_TYPE, "video/mp4")
                .header(CONTENT_LENGTH, CLIP_LEN)
                .header(X_CONTENT_DURATION, "5.0")
                .body(Full::new(body)),
        },
        // Answers every GET with the whole body, whatever the Range header says.
        "/no-range.mp4" => Response::builder()
            .header(CONTENT_LENGTH, CLIP_LEN)
            .body(Full::new(body)),
        "/flaky.mp4" => {
            if counters.flaky.fetch_add(1, Ordering::SeqCst) == 0 {
                Response::builder()
                    .status(StatusCode::SERVICE_UNAVAILABLE)
                    .body(Full::new(Bytes::new()))
            } else {
                Response::builder().body(Full::new(body))
            }
        }
        _ => {
            counters.missing.fetch_add(1, Ordering::SeqCst);
            Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::new()))
        }
    };
    Ok(response.unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))))
}

async fn serve() -> (SocketAddr, Arc<Counters>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let counters = Arc::new(Counters::default());
    let shared = counters.clone();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let counters = shared.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| handle(req, counters.clone()));
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, counters)
}

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(&FetchConfig {
        retry_delay_ms: 10,
        ..Default::default()
    })
}

#[tokio::test]
async fn probe_reads_length_type_and_duration() {
    let (addr, _) = serve().await;
    let info = fetcher()
        .probe(&format!("http://{addr}/clip.mp4"))
        .await
        .unwrap();

    assert_eq!(info.content_length, Some(CLIP_LEN as u64));
    assert_eq!(info.content_type.as_deref(), Some("video/mp4"));
    assert_eq!(info.duration_secs, Some(5.0));
}

#[tokio::test]
async fn range_request_returns_the_slice() {
    let (addr, _) = serve().await;
    let fetcher = fetcher();
    let url = format!("http://{addr}/clip.mp4");

    let bytes = fetch_bytes(&fetcher, &url, Some(ByteRange::new(200, 299)))
        .await
        .unwrap();
    assert_eq!(bytes, clip().slice(200..300));
}

#[tokio::test]
async fn ignored_range_still_yields_the_slice() {
    let (addr, _) = serve().await;
    let fetcher = fetcher();
    let url = format!("http://{addr}/no-range.mp4");

    let middle = fetch_bytes(&fetcher, &url, Some(ByteRange::new(200, 299)))
        .await
        .unwrap();
    assert_eq!(middle, clip().slice(200..300));

    let head = fetch_bytes(&fetcher, &url, Some(ByteRange::new(0, 9)))
        .await
        .unwrap();
    assert_eq!(head, clip().slice(0..10));
}

#[tokio::test]
async fn server_errors_are_retried() {
    let (addr, counters) = serve().await;
    let bytes = fetch_bytes(&fetcher(), &format!("http://{addr}/flaky.mp4"), None)
        .await
        .unwrap();

    assert_eq!(bytes.len(), CLIP_LEN);
    assert_eq!(counters.flaky.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let (addr, counters) = serve().await;
    let err = fetcher()
        .open(&format!("http://{addr}/gone.mp4"), None)
        .await
        .err()
        .unwrap();

    assert!(matches!(err, FetchError::Status(StatusCode::NOT_FOUND)));
    assert_eq!(counters.missing.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn resolver_caches_over_http() {
    let (addr, _) = serve().await;
    let dir = tempfile::tempdir().unwrap();
    let config = VideoCacheConfig {
        cache: CacheConfig::with_dir(dir.path()),
        ..Default::default()
    };
    let cache = VideoCache::init(config).await.unwrap();
    let url = format!("http://{addr}/clip.mp4");

    assert!(!cache.resolver().resolve(&url).await.cached);
    cache.store().flush().await;

    let source = cache.resolver().resolve(&url).await;
    assert!(source.cached);
    assert_eq!(std::fs::read(&source.uri).unwrap(), clip().to_vec());

    cache.shutdown().await;
}
