//! The tile server seam.
//!
//! The fetcher only ever talks to a [`TileSource`]. Production uses
//! [`HttpTileSource`] over a shared `reqwest` client; tests plug in scripted
//! sources.

use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use reqwest::header::{
    HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, RETRY_AFTER, USER_AGENT,
};
use std::{fmt, future::Future, time::Duration};
use tracing::trace;

use crate::config::HttpConfig;
use crate::error::{ConfigError, FailureReason};

/// Status, selected headers and the still-unread body of a tile response.
pub struct TileResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub retry_after: Option<Duration>,
    pub body: BoxStream<'static, Result<Bytes, FailureReason>>,
}

impl TileResponse {
    /// A response with the whole body in one chunk.
    pub fn from_bytes(status: u16, content_type: Option<&str>, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self {
            status,
            content_type: content_type.map(str::to_owned),
            retry_after: None,
            body: futures::stream::once(async move { Ok(body) }).boxed(),
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

impl fmt::Debug for TileResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("retry_after", &self.retry_after)
            .finish_non_exhaustive()
    }
}

/// Something tiles can be requested from.
pub trait TileSource: Send + Sync {
    /// Issues one GET. Only failures to get a response at all are errors;
    /// every HTTP status is returned as a response.
    fn get(&self, url: &str) -> impl Future<Output = Result<TileResponse, FailureReason>> + Send;
}

/// Fixed browser identity some planning portals insist on.
pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// [`TileSource`] backed by a shared `reqwest` client.
///
/// Compression (`Accept-Encoding: gzip, deflate, br`) is negotiated by the
/// client itself; bodies arrive decoded.
#[derive(Clone, Debug)]
pub struct HttpTileSource {
    client: reqwest::Client,
}

impl HttpTileSource {
    pub fn new(cfg: &HttpConfig) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("image/*"));
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("vi-VN,vi;q=0.9,en-US;q=0.8,en;q=0.7"),
        );
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&cfg.user_agent)
                .map_err(|e| ConfigError::HttpClient(e.to_string()))?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(cfg.connect_timeout)
            .timeout(cfg.request_timeout)
            .pool_max_idle_per_host(cfg.pool_max_idle_per_host)
            .tcp_keepalive(Some(cfg.keepalive))
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        Ok(Self { client })
    }
}

impl TileSource for HttpTileSource {
    async fn get(&self, url: &str) -> Result<TileResponse, FailureReason> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(FailureReason::transport)?;

        let status = response.status().as_u16();
        let headers = response.headers();
        let content_type = header_str(headers, CONTENT_TYPE.as_str()).map(str::to_owned);
        let retry_after = header_str(headers, RETRY_AFTER.as_str()).and_then(parse_retry_after);
        trace!(url, status, ?content_type, "tile response");

        Ok(TileResponse {
            status,
            content_type,
            retry_after,
            body: response
                .bytes_stream()
                .map_err(FailureReason::transport)
                .boxed(),
        })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `Retry-After` in delta-seconds form; HTTP dates are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_seconds_only() {
        assert_eq!(parse_retry_after("3"), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after(" 120 "), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[tokio::test]
    async fn in_memory_body() {
        let mut response = TileResponse::from_bytes(200, Some("image/png"), &b"abc"[..]);
        let chunk = response.body.next().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"abc");
        assert!(response.body.next().await.is_none());
    }

    #[test]
    fn builds_client() {
        assert!(HttpTileSource::new(&HttpConfig::default()).is_ok());
    }
}
