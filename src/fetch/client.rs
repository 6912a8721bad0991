use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use http::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, RANGE, USER_AGENT};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{skip_prefix, ByteRange, ByteStream, Fetcher, ResourceInfo};
use crate::config::FetchConfig;
use crate::error::FetchError;

/// Servers that know the media duration send it here (seconds, fractional).
pub const X_CONTENT_DURATION: &str = "x-content-duration";

/// Longest wait between two attempts.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

type HttpClient = Client<HttpConnector, Empty<Bytes>>;

/// [`Fetcher`] over a pooled hyper client with timeout and retry.
#[derive(Clone)]
pub struct HttpFetcher {
    client: HttpClient,
    request_timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
    user_agent: HeaderValue,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        let user_agent = HeaderValue::from_str(&config.user_agent)
            .unwrap_or_else(|_| HeaderValue::from_static("video_cache"));

        Self {
            client,
            request_timeout: config.request_timeout(),
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            user_agent,
        }
    }

    fn create_request(
        &self,
        method: &Method,
        uri: &Uri,
        range: Option<ByteRange>,
    ) -> Result<Request<Empty<Bytes>>, FetchError> {
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(uri.clone())
            .header(USER_AGENT, self.user_agent.clone());

        if let Some(range) = range {
            builder = builder.header(RANGE, range.header_value());
        }

        builder
            .body(Empty::new())
            .map_err(|e| FetchError::InvalidUrl(e.to_string()))
    }

    async fn fetch_with_retry(
        &self,
        method: Method,
        url: &str,
        range: Option<ByteRange>,
    ) -> Result<Response<Incoming>, FetchError> {
        let uri: Uri = url
            .parse()
            .map_err(|e: http::uri::InvalidUri| FetchError::InvalidUrl(format!("{url}: {e}")))?;

        let mut current_retry = 0;
        let mut last_error = None;

        while current_retry <= self.max_retries {
            if current_retry > 0 {
                let delay = backoff(self.retry_delay, current_retry);
                tokio::time::sleep(delay).await;
                debug!(%uri, attempt = current_retry, max = self.max_retries, "Retrying request");
            }

            let req = self.create_request(&method, &uri, range)?;

            match timeout(self.request_timeout, self.client.request(req)).await {
                Ok(Ok(response)) => {
                    let status = response.status();
                    if status.is_success() || status == StatusCode::PARTIAL_CONTENT {
                        return Ok(response);
                    }
                    // 4xx 不会因为重试而改变
                    if status.is_client_error() {
                        return Err(FetchError::Status(status));
                    }
                    last_error = Some(FetchError::Status(status));
                }
                Ok(Err(e)) => last_error = Some(FetchError::from(e)),
                Err(_) => last_error = Some(FetchError::Timeout),
            }

            current_retry += 1;
        }

        let err = last_error.unwrap_or(FetchError::Timeout);
        warn!(%uri, error = %err, "Request failed after retries");
        Err(err)
    }
}

/// Exponential delay before retry `attempt` (1-based), capped at
/// [`MAX_RETRY_DELAY`].
fn backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(MAX_RETRY_DELAY)
}

fn header_str<'a>(
    response: &'a Response<Incoming>,
    name: impl http::header::AsHeaderName,
) -> Option<&'a str> {
    response.headers().get(name).and_then(|h| h.to_str().ok())
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn probe(&self, url: &str) -> Result<ResourceInfo, FetchError> {
        let response = self.fetch_with_retry(Method::HEAD, url, None).await?;

        Ok(ResourceInfo {
            content_length: header_str(&response, CONTENT_LENGTH).and_then(|s| s.parse().ok()),
            content_type: header_str(&response, CONTENT_TYPE).map(str::to_owned),
            duration_secs: header_str(&response, X_CONTENT_DURATION)
                .and_then(|s| s.trim().parse::<f64>().ok())
                .filter(|d| d.is_finite() && *d > 0.0),
        })
    }

    async fn open(&self, url: &str, range: Option<ByteRange>) -> Result<ByteStream, FetchError> {
        let response = self.fetch_with_retry(Method::GET, url, range).await?;
        let status = response.status();

        let stream = response
            .into_body()
            .into_data_stream()
            .map(|chunk| chunk.map_err(FetchError::from))
            .boxed();

        match range {
            // 服务器忽略了 Range，返回的是完整内容
            Some(range) if status != StatusCode::PARTIAL_CONTENT && range.start > 0 => {
                debug!(url, %status, skip = range.start, "Range ignored by server, skipping prefix");
                Ok(skip_prefix(stream, range.start))
            }
            _ => Ok(stream),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff(base, 1), Duration::from_millis(500));
        assert_eq!(backoff(base, 3), Duration::from_secs(2));
        assert_eq!(backoff(base, 40), MAX_RETRY_DELAY);
        assert_eq!(backoff(Duration::MAX, 2), MAX_RETRY_DELAY);
    }
}
