//! Fragment fetcher: downloads one fragment into its temp file, with retries.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use indicatif::ProgressStyle;
use reqwest::{Client, header::RANGE};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, instrument, trace};
use tracing_indicatif::span_ext::IndicatifSpanExt;
use url::Url;

use super::descriptor::FragmentDescriptor;
use super::retry::{RetryAction, retry_with_backoff};
use crate::client::create_client;
use crate::config::{DownloaderConfig, FragmentConfig};
use crate::error::DownloadError;

/// Source of fragment bytes and decryption keys.
#[async_trait]
pub trait FragmentFetcher: Send + Sync {
    /// Download `fragment` into `dest`, replacing any previous content.
    /// `on_progress` receives the bytes written so far. Returns the total.
    async fn fetch(
        &self,
        fragment: &FragmentDescriptor,
        dest: &Path,
        token: &CancellationToken,
        on_progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<u64, DownloadError>;

    async fn fetch_key(&self, url: &str, token: &CancellationToken) -> Result<Bytes, DownloadError>;
}

/// [`FragmentFetcher`] over HTTP(S).
pub struct HttpFragmentFetcher {
    client: Client,
    config: FragmentConfig,
    params: Vec<(String, String)>,
}

impl HttpFragmentFetcher {
    pub fn new(client: Client, config: FragmentConfig) -> Self {
        Self {
            client,
            config,
            params: Vec::new(),
        }
    }

    /// Build the HTTP client from `downloader` and carry over its query parameters.
    pub fn from_config(
        downloader: &DownloaderConfig,
        config: FragmentConfig,
    ) -> Result<Self, DownloadError> {
        Ok(Self {
            client: create_client(downloader)?,
            config,
            params: downloader.params.clone(),
        })
    }

    async fn fetch_once(
        &self,
        fragment: &FragmentDescriptor,
        url: &Url,
        dest: &Path,
        token: &CancellationToken,
        span: &Span,
        on_progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<u64, DownloadError> {
        let mut request = self
            .client
            .get(url.clone())
            .query(&self.params)
            .timeout(self.config.fragment_timeout);
        if let Some(range) = fragment.byte_range {
            request = request.header(RANGE, range.header_value());
        }

        let response = tokio::select! {
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            response = request.send() => {
                response.map_err(|e| DownloadError::request(e, url.as_str()))?
            }
        };
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(status, url.as_str(), "fragment download"));
        }
        trace!(version = ?response.version(), "Fragment response received");
        if let Some(len) = response.content_length() {
            span.pb_set_length(len);
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        loop {
            let chunk = tokio::select! {
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk.map_err(|e| DownloadError::request(e, url.as_str()))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            span.pb_set_position(written);
            on_progress(written);
        }
        file.flush().await?;
        Ok(written)
    }
}

#[async_trait]
impl FragmentFetcher for HttpFragmentFetcher {
    #[instrument(skip(self, fragment, dest, token, on_progress), fields(index = fragment.index))]
    async fn fetch(
        &self,
        fragment: &FragmentDescriptor,
        dest: &Path,
        token: &CancellationToken,
        on_progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<u64, DownloadError> {
        let label = format!("Fragment #{}", fragment.index);
        let span = Span::current();
        if let Ok(style) = ProgressStyle::default_bar().template(
            "{span_child_prefix}{spinner:.yellow} [{bar:20.yellow/white}] {bytes}/{total_bytes} {msg}",
        ) {
            span.pb_set_style(&style.progress_chars("=> "));
        }
        span.pb_set_message(&label);

        let url = Url::parse(&fragment.url)
            .map_err(|e| DownloadError::invalid_url(&fragment.url, e.to_string()))?;

        let result = retry_with_backoff(&self.config.fragment_retry, token, |attempt| {
            let (url, span) = (&url, &span);
            async move {
                if attempt > 0 {
                    debug!(attempt, "Retrying fragment");
                }
                RetryAction::from_result(
                    self.fetch_once(fragment, url, dest, token, span, on_progress)
                        .await,
                )
            }
        })
        .await;

        match &result {
            Ok(bytes) => {
                debug!(bytes, "Downloaded fragment");
                span.pb_set_finish_message(&label);
            }
            Err(e) => span.pb_set_finish_message(&format!("{label} failed: {e}")),
        }
        result
    }

    #[instrument(skip(self, token))]
    async fn fetch_key(&self, url: &str, token: &CancellationToken) -> Result<Bytes, DownloadError> {
        retry_with_backoff(&self.config.key_retry, token, |_| async move {
            let response = tokio::select! {
                _ = token.cancelled() => return RetryAction::Fail(DownloadError::Cancelled),
                response = self.client.get(url).timeout(self.config.key_timeout).send() => response,
            };
            let result = match response {
                Ok(r) if r.status().is_success() => {
                    r.bytes().await.map_err(|e| DownloadError::request(e, url))
                }
                Ok(r) => Err(DownloadError::http_status(r.status(), url, "key download")),
                Err(e) => Err(DownloadError::request(e, url)),
            };
            RetryAction::from_result(result)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::retry::RetryPolicy;
    use crate::testing::TestHttpServer;
    use axum::Router;
    use axum::extract::{Path as UrlPath, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::get;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const BODY: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    fn router(flaky_hits: Arc<AtomicU32>) -> Router {
        Router::new()
            .route("/frag/{n}", get(|UrlPath(n): UrlPath<u32>| async move { format!("fragment-{n}") }))
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
            .route(
                "/flaky",
                get(|State(hits): State<Arc<AtomicU32>>| async move {
                    if hits.fetch_add(1, Ordering::Relaxed) < 2 {
                        (StatusCode::SERVICE_UNAVAILABLE, Vec::new())
                    } else {
                        (StatusCode::OK, b"finally".to_vec())
                    }
                }),
            )
            .route(
                "/ranged",
                get(|headers: HeaderMap| async move {
                    let range = headers
                        .get("range")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.strip_prefix("bytes="))
                        .and_then(|v| v.split_once('-'))
                        .and_then(|(a, b)| Some((a.parse::<usize>().ok()?, b.parse::<usize>().ok()?)));
                    match range {
                        Some((start, end)) => (StatusCode::PARTIAL_CONTENT, BODY[start..=end].to_vec()),
                        None => (StatusCode::OK, BODY.to_vec()),
                    }
                }),
            )
            .route("/key", get(|| async { vec![3u8; 16] }))
            .route(
                "/stalled",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "too late"
                }),
            )
            .with_state(flaky_hits)
    }

    fn fetcher() -> HttpFragmentFetcher {
        let config = FragmentConfig {
            fragment_retry: RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                jitter: false,
            },
            ..Default::default()
        };
        let downloader = DownloaderConfig {
            use_system_proxy: false,
            ..Default::default()
        };
        HttpFragmentFetcher::from_config(&downloader, config).unwrap()
    }

    #[tokio::test]
    async fn downloads_into_destination() {
        let server = TestHttpServer::new(router(Arc::default())).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.part-Frag0");
        let token = CancellationToken::new();
        let last = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&last);

        let fragment = FragmentDescriptor::new(0, server.url("/frag/7"));
        let bytes = fetcher()
            .fetch(&fragment, &dest, &token, &move |n| {
                seen.store(n as u32, Ordering::Relaxed);
            })
            .await
            .unwrap();

        assert_eq!(bytes, 10);
        assert_eq!(last.load(Ordering::Relaxed), 10);
        assert_eq!(std::fs::read(&dest).unwrap(), b"fragment-7");
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let server = TestHttpServer::new(router(Arc::default())).await;
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let fragment = FragmentDescriptor::new(3, server.url("/missing"));
        let err = fetcher()
            .fetch(&fragment, &dir.path().join("f"), &token, &|_| {})
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let hits = Arc::new(AtomicU32::new(0));
        let server = TestHttpServer::new(router(Arc::clone(&hits))).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("f");
        let token = CancellationToken::new();
        let fragment = FragmentDescriptor::new(1, server.url("/flaky"));
        fetcher().fetch(&fragment, &dest, &token, &|_| {}).await.unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 3);
        assert_eq!(std::fs::read(&dest).unwrap(), b"finally");
    }

    #[tokio::test]
    async fn byte_range_is_requested() {
        let server = TestHttpServer::new(router(Arc::default())).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("f");
        let token = CancellationToken::new();
        let fragment = FragmentDescriptor::new(0, server.url("/ranged")).with_byte_range(10, 20);
        fetcher().fetch(&fragment, &dest, &token, &|_| {}).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"abcdefghij");
    }

    #[tokio::test]
    async fn fetches_key() {
        let server = TestHttpServer::new(router(Arc::default())).await;
        let token = CancellationToken::new();
        let key = fetcher().fetch_key(&server.url("/key"), &token).await.unwrap();
        assert_eq!(key.as_ref(), &[3u8; 16]);
    }

    #[tokio::test]
    async fn invalid_url_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let fragment = FragmentDescriptor::new(0, "not a url");
        let err = fetcher()
            .fetch(&fragment, &dir.path().join("f"), &token, &|_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn stalled_request_times_out() {
        let server = TestHttpServer::new(router(Arc::default())).await;
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let config = FragmentConfig {
            fragment_timeout: Duration::from_millis(50),
            fragment_retry: RetryPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                jitter: false,
            },
            ..Default::default()
        };
        let downloader = DownloaderConfig {
            use_system_proxy: false,
            ..Default::default()
        };
        let fragment = FragmentDescriptor::new(0, server.url("/stalled"));
        let err = HttpFragmentFetcher::from_config(&downloader, config)
            .unwrap()
            .fetch(&fragment, &dir.path().join("f"), &token, &|_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Timeout { .. }), "{err}");
        assert!(err.is_retryable());
    }
}
