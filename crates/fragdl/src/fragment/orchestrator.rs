//! Fragment orchestrator.
//!
//! Fragments are fetched by a bounded, ordered pool of workers. Each worker
//! downloads into its own `<file>.part-Frag<N>` file; the coordinating task
//! reads the results back in index order, decrypts them and appends them to
//! the destination. Only the coordinating task touches the destination and the
//! bookkeeping file, so appends are strictly ordered no matter which fetch
//! completes first.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::{Stream, StreamExt, future};
use humansize::{BINARY, format_size};
use tokio::io::BufWriter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::bookkeeping::Bookkeeping;
use super::context::{Destination, FragmentContext, FragmentJob};
use super::decryption::Decrypter;
use super::descriptor::FragmentDescriptor;
use super::fetcher::FragmentFetcher;
use crate::config::FragmentConfig;
use crate::error::DownloadError;
use crate::paths::{
    bookkeeping_name, filesize_or_zero, fragment_name, temp_name, try_remove, try_rename,
};
use crate::progress::{
    ProgressCalculator, ProgressEvent, ProgressHook, ProgressReporter, ProgressStatus,
};

/// Decides whether a missing fragment aborts the download.
pub type FatalPredicate = dyn Fn(u64) -> bool + Send + Sync;

/// Result of a finished fragmented download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub filename: PathBuf,
    pub downloaded_bytes: u64,
    pub skipped_fragments: Vec<u64>,
    /// The download was stopped early; only possible for live downloads.
    pub interrupted: bool,
}

/// What one [`FragmentDownloader::append_fragments`] call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendReport {
    pub appended: u64,
    pub skipped: u64,
    pub interrupted: bool,
}

enum FetchOutcome {
    Downloaded(FragmentJob),
    Failed(FragmentJob, DownloadError),
    Interrupted(FragmentJob),
}

#[derive(Clone)]
pub struct FragmentDownloader {
    fetcher: Arc<dyn FragmentFetcher>,
    pub(crate) config: FragmentConfig,
    hook: Option<ProgressHook>,
    key_uri_override: Option<String>,
    token: CancellationToken,
}

impl FragmentDownloader {
    pub fn new(fetcher: Arc<dyn FragmentFetcher>, config: FragmentConfig) -> Self {
        Self {
            fetcher,
            config,
            hook: None,
            key_uri_override: None,
            token: CancellationToken::new(),
        }
    }

    pub fn with_progress_hook(mut self, hook: ProgressHook) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Fetch every AES-128 key from `uri` instead of the fragment's own key URI.
    pub fn with_key_uri(mut self, uri: impl Into<String>) -> Self {
        self.key_uri_override = Some(uri.into());
        self
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Cancelling this token interrupts the download before the next fetch.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn config(&self) -> &FragmentConfig {
        &self.config
    }

    fn uses_bookkeeping(&self, ctx: &FragmentContext) -> bool {
        !ctx.live && !ctx.is_stdout() && !self.config.disable_bookkeeping
    }

    async fn write_bookkeeping(&self, ctx: &FragmentContext) -> Result<(), DownloadError> {
        if !self.uses_bookkeeping(ctx) {
            return Ok(());
        }
        Bookkeeping {
            fragment_index: ctx.fragment_index,
            fragment_count: ctx.fragment_count,
            extra_state: ctx.extra_state.clone(),
        }
        .write(&bookkeeping_name(&ctx.filename))
        .await
    }

    /// Restore the resume cursor and open the destination.
    pub async fn prepare(&self, ctx: &mut FragmentContext) -> Result<(), DownloadError> {
        let total = if ctx.live {
            "unknown (live)".to_string()
        } else {
            ctx.fragment_count
                .map_or_else(|| "unknown".to_string(), |count| count.to_string())
        };
        info!(filename = %ctx.filename.display(), "Total fragments: {total}");

        ctx.tmpfilename = temp_name(&ctx.filename);
        let mut resume_len = if ctx.is_stdout() {
            0
        } else {
            filesize_or_zero(&ctx.tmpfilename)
        };
        ctx.fragment_index = 0;

        if self.uses_bookkeeping(ctx) {
            let path = bookkeeping_name(&ctx.filename);
            if self.config.continue_download && path.is_file() {
                let problem = match Bookkeeping::read(&path).await {
                    Ok(state) => {
                        ctx.fragment_index = state.fragment_index;
                        if state.extra_state.is_some() {
                            ctx.extra_state = state.extra_state;
                        }
                        if ctx.fragment_count.is_none() {
                            ctx.fragment_count = state.fragment_count;
                        }
                        (state.fragment_index > 0 && resume_len == 0)
                            .then(|| "Inconsistent state of incomplete fragment download".to_string())
                    }
                    Err(e) => Some(format!("Cannot parse fragment bookkeeping file: {e}")),
                };
                if let Some(problem) = problem {
                    warn!(path = %path.display(), "{problem}. Restarting from the beginning");
                    ctx.fragment_index = 0;
                    self.write_bookkeeping(ctx).await?;
                }
            } else {
                self.write_bookkeeping(ctx).await?;
            }
        }
        // Bytes past the last recorded fragment cannot be trusted.
        if ctx.fragment_index == 0 {
            resume_len = 0;
        }

        let dest = if ctx.is_stdout() {
            Destination::Stdout(tokio::io::stdout())
        } else {
            if let Some(parent) = ctx.tmpfilename.parent()
                && !parent.as_os_str().is_empty()
            {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut options = tokio::fs::OpenOptions::new();
            options.create(true);
            if resume_len > 0 {
                options.append(true);
            } else {
                options.write(true).truncate(true);
            }
            Destination::File(BufWriter::new(options.open(&ctx.tmpfilename).await?))
        };

        if resume_len > 0 {
            info!(
                index = ctx.fragment_index,
                size = %format_size(resume_len, BINARY),
                "Resuming fragment download"
            );
        }
        ctx.complete_frags_downloaded_bytes = resume_len;
        ctx.started = Some(Instant::now());
        ctx.dest = Some(dest);
        Ok(())
    }

    /// Download every fragment of `fragments`, append them in order and finalize the output.
    pub async fn download_and_append_fragments<S>(
        &self,
        ctx: &mut FragmentContext,
        fragments: S,
        is_fatal: &FatalPredicate,
    ) -> Result<DownloadOutcome, DownloadError>
    where
        S: Stream<Item = FragmentDescriptor> + Send,
    {
        let report = match self.append_fragments(ctx, fragments, is_fatal).await {
            Ok(report) => report,
            Err(e) => {
                if let Err(close) = ctx.close_dest().await {
                    warn!(error = %close, "Failed to close fragment destination");
                }
                return Err(e);
            }
        };

        if report.interrupted && !ctx.live {
            ctx.close_dest().await?;
            info!(
                index = ctx.fragment_index,
                filename = %ctx.filename.display(),
                "Fragment download interrupted"
            );
            return Err(DownloadError::Cancelled);
        }

        let mut outcome = self.finish(ctx).await?;
        outcome.interrupted = report.interrupted;
        Ok(outcome)
    }

    /// Download and append fragments without finalizing, so a live download
    /// can be continued with fragments that became available later.
    pub async fn append_fragments<S>(
        &self,
        ctx: &mut FragmentContext,
        fragments: S,
        is_fatal: &FatalPredicate,
    ) -> Result<AppendReport, DownloadError>
    where
        S: Stream<Item = FragmentDescriptor> + Send,
    {
        if !ctx.is_prepared() {
            self.prepare(ctx).await?;
        }

        let workers = self.config.concurrent_fragment_downloads.max(1);
        let cursor = ctx.fragment_index;
        let tmpfilename = ctx.tmpfilename.clone();
        let filename = ctx.filename.clone();
        let progress_idx = ctx.progress_idx;
        let fragment_count = ctx.fragment_count;

        let progress = Arc::new(ProgressCalculator::new(ctx.complete_frags_downloaded_bytes));
        let reporter = Arc::new(ProgressReporter::new(
            self.hook.clone(),
            self.config.progress_interval,
        ));

        let mut decrypter = ctx
            .decrypter
            .take()
            .unwrap_or_else(|| Decrypter::new(self.key_uri_override.clone()));
        let mut submitted = Vec::new();
        let result = {
            let fetches = fragments
                .filter_map(move |fragment| {
                    future::ready((fragment.index >= cursor).then_some(fragment))
                })
                .map(|fragment| {
                    submitted.push(fragment.index);
                    let mut job = FragmentJob::new(fragment, &tmpfilename, &filename, progress_idx);
                    job.fragment_count = job.fragment_count.or(fragment_count);
                    self.fetch_job(job, Arc::clone(&progress), Arc::clone(&reporter))
                })
                .buffered(workers);
            let mut fetches = std::pin::pin!(fetches);
            self.drain(ctx, &mut fetches, &mut decrypter, &progress, is_fatal)
                .await
        };
        ctx.decrypter = Some(decrypter);

        let stopped_early = match &result {
            Ok(report) => report.interrupted,
            Err(_) => true,
        };
        if stopped_early {
            let pending = submitted.into_iter().filter(|&index| index >= ctx.fragment_index);
            discard_pending_fragments(&tmpfilename, pending);
        }
        result
    }

    async fn drain<F>(
        &self,
        ctx: &mut FragmentContext,
        fetches: &mut F,
        decrypter: &mut Decrypter,
        progress: &ProgressCalculator,
        is_fatal: &FatalPredicate,
    ) -> Result<AppendReport, DownloadError>
    where
        F: Stream<Item = FetchOutcome> + Unpin,
    {
        let mut report = AppendReport::default();
        while let Some(outcome) = fetches.next().await {
            let (job, content) = match outcome {
                FetchOutcome::Interrupted(job) => {
                    debug!(index = job.index(), "Fragment download interrupted");
                    report.interrupted = true;
                    break;
                }
                FetchOutcome::Failed(job, e) => (job, Err(e)),
                FetchOutcome::Downloaded(job) => {
                    let content = match tokio::fs::read(&job.path).await {
                        Ok(data) if data.is_empty() => {
                            Err(DownloadError::not_found(job.fragment.url.clone()))
                        }
                        Ok(data) => Ok(Bytes::from(data)),
                        Err(e) => Err(e.into()),
                    };
                    (job, content)
                }
            };
            let index = job.index();

            match content {
                Ok(data) => {
                    let data = decrypter
                        .decrypt_fragment(&job.fragment, data, self.fetcher.as_ref(), &self.token)
                        .await?;
                    self.append_fragment(ctx, &job, &data).await?;
                    report.appended += 1;
                }
                Err(e) => {
                    let fatal = if ctx.live && e.is_not_found() {
                        false
                    } else {
                        index == 0 || !self.config.skip_unavailable_fragments || is_fatal(index)
                    };
                    if fatal {
                        ctx.close_dest().await?;
                        error!(index, error = %e, "Fragment download failed");
                        return Err(DownloadError::FragmentUnavailable { index });
                    }
                    warn!(error = %e, "Skipping fragment {index}");
                    ctx.skipped_fragments.push(index);
                    ctx.fragment_index = index + 1;
                    self.write_bookkeeping(ctx).await?;
                    self.discard_fragment_file(&job).await?;
                    report.skipped += 1;
                }
            }

            if let Some(count) = job.fragment_count
                && ctx.fragment_index > 0
            {
                let estimate = ctx.complete_frags_downloaded_bytes / ctx.fragment_index * count;
                progress.set_total(Some(estimate));
            }
        }
        Ok(report)
    }

    async fn fetch_job(
        &self,
        job: FragmentJob,
        progress: Arc<ProgressCalculator>,
        reporter: Arc<ProgressReporter>,
    ) -> FetchOutcome {
        if !self.config.fragment_interval.is_zero() {
            tokio::select! {
                _ = self.token.cancelled() => return FetchOutcome::Interrupted(job),
                _ = tokio::time::sleep(self.config.fragment_interval) => {}
            }
        }
        if self.token.is_cancelled() {
            return FetchOutcome::Interrupted(job);
        }

        let contributor = job.index() as usize;
        progress.reset_contributor(contributor);
        let on_progress = |bytes: u64| {
            progress.update(contributor, bytes);
            let snapshot = progress.snapshot();
            reporter.report(&ProgressEvent {
                status: ProgressStatus::Downloading,
                filename: job.filename.clone(),
                downloaded_bytes: snapshot.downloaded,
                total_bytes: None,
                total_bytes_estimate: snapshot.total,
                eta: snapshot.eta,
                speed: snapshot.speed,
                elapsed: snapshot.elapsed,
                fragment_index: Some(job.index()),
                fragment_count: job.fragment_count,
                progress_idx: job.progress_idx,
            });
        };
        let result = self
            .fetcher
            .fetch(&job.fragment, &job.path, &self.token, &on_progress)
            .await;
        progress.remove_contributor(contributor);

        match result {
            Ok(bytes) => {
                trace!(index = job.index(), bytes, "Fragment fetched");
                FetchOutcome::Downloaded(job)
            }
            Err(DownloadError::Cancelled) => FetchOutcome::Interrupted(job),
            Err(e) => FetchOutcome::Failed(job, e),
        }
    }

    async fn append_fragment(
        &self,
        ctx: &mut FragmentContext,
        job: &FragmentJob,
        data: &[u8],
    ) -> Result<(), DownloadError> {
        let dest = ctx
            .dest
            .as_mut()
            .ok_or_else(|| DownloadError::internal("Fragment destination is not open"))?;
        dest.append(data).await?;
        ctx.fragment_index = job.index() + 1;
        ctx.complete_frags_downloaded_bytes += data.len() as u64;
        self.write_bookkeeping(ctx).await?;
        self.discard_fragment_file(job).await?;
        trace!(index = job.index(), bytes = data.len(), "Fragment appended");
        Ok(())
    }

    async fn discard_fragment_file(&self, job: &FragmentJob) -> Result<(), DownloadError> {
        if self.config.keep_fragments {
            return Ok(());
        }
        match tokio::fs::remove_file(&job.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Append trailing bytes, close the destination and move it to its final name.
    pub async fn finish(&self, ctx: &mut FragmentContext) -> Result<DownloadOutcome, DownloadError> {
        if let Some(bytes) = ctx.finish_bytes.take()
            && let Some(dest) = ctx.dest.as_mut()
        {
            dest.append(&bytes).await?;
            ctx.complete_frags_downloaded_bytes += bytes.len() as u64;
        }
        ctx.close_dest().await?;

        if self.uses_bookkeeping(ctx) {
            try_remove(&bookkeeping_name(&ctx.filename))?;
        }

        let to_file = !ctx.is_stdout();
        let downloaded = if to_file {
            filesize_or_zero(&ctx.tmpfilename)
        } else {
            ctx.complete_frags_downloaded_bytes
        };
        if downloaded == 0 {
            if to_file {
                try_remove(&ctx.tmpfilename)?;
            }
            error!(filename = %ctx.filename.display(), "The downloaded file is empty");
            return Err(DownloadError::EmptyOutput);
        }
        if to_file {
            try_rename(&ctx.tmpfilename, &ctx.filename)?;
        }

        let elapsed = ctx.started.map(|s| s.elapsed()).unwrap_or_default();
        ProgressReporter::new(self.hook.clone(), self.config.progress_interval).report(
            &ProgressEvent {
                status: ProgressStatus::Finished,
                filename: ctx.filename.clone(),
                downloaded_bytes: downloaded,
                total_bytes: Some(downloaded),
                total_bytes_estimate: None,
                eta: None,
                speed: None,
                elapsed,
                fragment_index: Some(ctx.fragment_index),
                fragment_count: ctx.fragment_count,
                progress_idx: ctx.progress_idx,
            },
        );
        info!(
            filename = %ctx.filename.display(),
            size = %format_size(downloaded, BINARY),
            skipped = ctx.skipped_fragments.len(),
            elapsed = ?elapsed,
            "Fragment download finished"
        );

        Ok(DownloadOutcome {
            filename: ctx.filename.clone(),
            downloaded_bytes: downloaded,
            skipped_fragments: ctx.skipped_fragments.clone(),
            interrupted: false,
        })
    }
}

/// Remove fragment files fetched ahead of the cursor that will never be
/// appended because the download stopped early.
fn discard_pending_fragments(tmpfilename: &Path, pending: impl Iterator<Item = u64>) {
    for index in pending {
        let path = fragment_name(tmpfilename, index);
        if let Err(e) = try_remove(&path) {
            warn!(path = %path.display(), error = %e, "Failed to remove fragment file");
        }
    }
}
