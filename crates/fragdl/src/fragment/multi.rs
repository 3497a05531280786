//! Several fragment streams downloaded side by side, e.g. separate video and audio.

use std::sync::Arc;

use futures::stream::{BoxStream, Stream, StreamExt};
use tracing::{debug, error};

use super::context::FragmentContext;
use super::descriptor::FragmentDescriptor;
use super::orchestrator::{DownloadOutcome, FatalPredicate, FragmentDownloader};
use crate::error::DownloadError;

/// One stream of a multi-stream download.
pub struct StreamDownload {
    pub ctx: FragmentContext,
    pub fragments: BoxStream<'static, FragmentDescriptor>,
    pub is_fatal: Arc<FatalPredicate>,
}

impl StreamDownload {
    pub fn new<S>(ctx: FragmentContext, fragments: S) -> Self
    where
        S: Stream<Item = FragmentDescriptor> + Send + 'static,
    {
        Self {
            ctx,
            fragments: fragments.boxed(),
            is_fatal: Arc::new(|_: u64| false),
        }
    }

    pub fn with_fatal<F>(mut self, is_fatal: F) -> Self
    where
        F: Fn(u64) -> bool + Send + Sync + 'static,
    {
        self.is_fatal = Arc::new(is_fatal);
        self
    }
}

impl FragmentDownloader {
    /// Download every stream on its own task, sharing the worker budget and
    /// the cancellation token.
    ///
    /// The result holds one slot per input stream, in input order. A stream
    /// stopped by an interrupt before finishing leaves its slot `None`. When no
    /// stream is live an interrupt fails the whole call with `Cancelled`.
    pub async fn download_and_append_fragments_multiple(
        &self,
        streams: Vec<StreamDownload>,
    ) -> Result<Vec<Option<DownloadOutcome>>, DownloadError> {
        if streams.is_empty() {
            return Ok(Vec::new());
        }

        let workers = self
            .config
            .concurrent_fragment_downloads
            .max(1)
            .div_ceil(streams.len());
        let mut downloader = self.clone();
        downloader.config.concurrent_fragment_downloads = workers;
        let is_live = streams.iter().any(|s| s.ctx.live);
        debug!(streams = streams.len(), workers, "Starting multi-stream fragment download");

        let handles: Vec<_> = streams
            .into_iter()
            .enumerate()
            .map(|(progress_idx, stream)| {
                let downloader = downloader.clone();
                let StreamDownload {
                    mut ctx,
                    fragments,
                    is_fatal,
                } = stream;
                ctx.progress_idx = progress_idx;
                tokio::spawn(async move {
                    downloader
                        .download_and_append_fragments(&mut ctx, fragments, is_fatal.as_ref())
                        .await
                })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        let mut failure = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(outcome)) => outcomes.push(Some(outcome)),
                Ok(Err(DownloadError::Cancelled)) => outcomes.push(None),
                Ok(Err(e)) => {
                    outcomes.push(None);
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "Fragment stream task failed");
                    outcomes.push(None);
                    failure.get_or_insert(DownloadError::internal(format!(
                        "Fragment stream task failed: {e}"
                    )));
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        if self.cancellation_token().is_cancelled() && !is_live {
            return Err(DownloadError::Cancelled);
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FragmentConfig;
    use crate::fragment::fetcher::FragmentFetcher;
    use crate::fragment::orchestrator::tests::{
        MockFetcher, descriptors, expected, serving, url,
    };
    use std::time::Duration;

    fn two_streams(fetcher: MockFetcher) -> MockFetcher {
        (0..4).fold(fetcher, |mock, i| {
            mock.with_body(url("a", i), format!("<a fragment {i}>"))
                .with_delay(url("v", i), Duration::from_millis(20 * (4 - i)))
        })
    }

    #[tokio::test]
    async fn streams_are_downloaded_in_parallel() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("video.mp4");
        let audio = dir.path().join("audio.m4a");
        let fetcher: Arc<dyn FragmentFetcher> = Arc::new(two_streams(serving("v", 4, &[])));
        let config = FragmentConfig {
            concurrent_fragment_downloads: 3,
            ..Default::default()
        };

        let outcomes = FragmentDownloader::new(fetcher, config)
            .download_and_append_fragments_multiple(vec![
                StreamDownload::new(
                    FragmentContext::new(&video),
                    futures::stream::iter(descriptors("v", 4)),
                ),
                StreamDownload::new(
                    FragmentContext::new(&audio),
                    futures::stream::iter(descriptors("a", 4)),
                ),
            ])
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].as_ref().unwrap().filename, video);
        assert_eq!(outcomes[1].as_ref().unwrap().filename, audio);
        assert_eq!(std::fs::read(&video).unwrap(), expected("v", 0..4));
        assert_eq!(std::fs::read(&audio).unwrap(), expected("a", 0..4));
    }

    #[tokio::test]
    async fn interrupt_stops_every_stream() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("video.mp4");
        let audio = dir.path().join("audio.m4a");
        let fetcher: Arc<dyn FragmentFetcher> =
            Arc::new(two_streams(serving("v", 4, &[])).cancel_at(url("a", 1)));

        let err = FragmentDownloader::new(fetcher, FragmentConfig::default())
            .download_and_append_fragments_multiple(vec![
                StreamDownload::new(
                    FragmentContext::new(&video),
                    futures::stream::iter(descriptors("v", 4)),
                ),
                StreamDownload::new(
                    FragmentContext::new(&audio),
                    futures::stream::iter(descriptors("a", 4)),
                ),
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Cancelled));
        assert!(!video.exists());
        assert!(!audio.exists());
    }

    #[tokio::test]
    async fn fatal_stream_error_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher: Arc<dyn FragmentFetcher> = Arc::new(two_streams(serving("v", 4, &[2])));

        let err = FragmentDownloader::new(fetcher, FragmentConfig::default())
            .download_and_append_fragments_multiple(vec![
                StreamDownload::new(
                    FragmentContext::new(dir.path().join("video.mp4")),
                    futures::stream::iter(descriptors("v", 4)),
                )
                .with_fatal(|index| index == 2),
                StreamDownload::new(
                    FragmentContext::new(dir.path().join("audio.m4a")),
                    futures::stream::iter(descriptors("a", 4)),
                ),
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::FragmentUnavailable { index: 2 }));
        assert_eq!(
            std::fs::read(dir.path().join("audio.m4a")).unwrap(),
            expected("a", 0..4)
        );
    }

    #[tokio::test]
    async fn live_interrupt_keeps_partial_streams() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("video.mp4");
        let fetcher: Arc<dyn FragmentFetcher> =
            Arc::new(serving("v", 5, &[]).cancel_at(url("v", 2)));

        let outcomes = FragmentDownloader::new(fetcher, FragmentConfig::default())
            .download_and_append_fragments_multiple(vec![StreamDownload::new(
                FragmentContext::new(&video).with_live(true),
                futures::stream::iter(descriptors("v", 5)),
            )])
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].as_ref().unwrap().interrupted);
        assert_eq!(std::fs::read(&video).unwrap(), expected("v", 0..2));
    }

    #[tokio::test]
    async fn interrupted_stream_keeps_its_slot() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("video.mp4");
        let audio = dir.path().join("audio.m4a");
        let fetcher: Arc<dyn FragmentFetcher> =
            Arc::new(two_streams(serving("v", 4, &[])).cancel_at(url("v", 2)));

        let outcomes = FragmentDownloader::new(fetcher, FragmentConfig::default())
            .download_and_append_fragments_multiple(vec![
                StreamDownload::new(
                    FragmentContext::new(&video),
                    futures::stream::iter(descriptors("v", 4)),
                ),
                StreamDownload::new(
                    FragmentContext::new(&audio).with_live(true),
                    futures::stream::iter(descriptors("a", 4)),
                ),
            ])
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].is_none());
        assert!(!video.exists());
        let audio_outcome = outcomes[1].as_ref().unwrap();
        assert_eq!(audio_outcome.filename, audio);
        assert!(audio.exists());
    }
}
