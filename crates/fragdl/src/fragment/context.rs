use std::path::{Path, PathBuf};
use std::time::Instant;

use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::io::{AsyncWriteExt, BufWriter};

use super::decryption::Decrypter;
use super::descriptor::FragmentDescriptor;
use crate::error::DownloadError;
use crate::paths::{fragment_name, is_stdout, temp_name};

/// Open output of a fragmented download.
pub(crate) enum Destination {
    File(BufWriter<tokio::fs::File>),
    Stdout(tokio::io::Stdout),
}

impl Destination {
    pub(crate) async fn append(&mut self, data: &[u8]) -> Result<(), DownloadError> {
        match self {
            Self::File(file) => {
                file.write_all(data).await?;
                file.flush().await?;
            }
            Self::Stdout(out) => {
                out.write_all(data).await?;
                out.flush().await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn close(self) -> Result<(), DownloadError> {
        match self {
            Self::File(mut file) => {
                file.flush().await?;
                file.into_inner().sync_all().await?;
            }
            Self::Stdout(mut out) => out.flush().await?,
        }
        Ok(())
    }
}

/// State of one fragmented download, owned by the coordinating task.
pub struct FragmentContext {
    pub filename: PathBuf,
    pub tmpfilename: PathBuf,
    pub(crate) dest: Option<Destination>,
    /// Number of fragments already consumed; the durable resume cursor.
    pub fragment_index: u64,
    pub fragment_count: Option<u64>,
    pub complete_frags_downloaded_bytes: u64,
    pub live: bool,
    /// Opaque producer state kept in the bookkeeping file across resumes.
    pub extra_state: Option<Map<String, Value>>,
    pub skipped_fragments: Vec<u64>,
    pub progress_idx: usize,
    /// Appended after the last fragment, before the output is finalized.
    pub finish_bytes: Option<Bytes>,
    pub started: Option<Instant>,
    /// Keys fetched so far, kept across live re-invocations.
    pub(crate) decrypter: Option<Decrypter>,
}

impl FragmentContext {
    pub fn new(filename: impl Into<PathBuf>) -> Self {
        let filename = filename.into();
        Self {
            tmpfilename: temp_name(&filename),
            filename,
            dest: None,
            fragment_index: 0,
            fragment_count: None,
            complete_frags_downloaded_bytes: 0,
            live: false,
            extra_state: None,
            skipped_fragments: Vec::new(),
            progress_idx: 0,
            finish_bytes: None,
            started: None,
            decrypter: None,
        }
    }

    pub fn with_live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    pub fn with_fragment_count(mut self, count: u64) -> Self {
        self.fragment_count = Some(count);
        self
    }

    pub fn with_extra_state(mut self, extra_state: Map<String, Value>) -> Self {
        self.extra_state = Some(extra_state);
        self
    }

    pub fn with_progress_idx(mut self, progress_idx: usize) -> Self {
        self.progress_idx = progress_idx;
        self
    }

    pub fn with_finish_bytes(mut self, finish_bytes: Bytes) -> Self {
        self.finish_bytes = Some(finish_bytes);
        self
    }

    pub fn is_stdout(&self) -> bool {
        is_stdout(&self.tmpfilename)
    }

    /// Whether the destination stream is open.
    pub fn is_prepared(&self) -> bool {
        self.dest.is_some()
    }

    pub(crate) async fn close_dest(&mut self) -> Result<(), DownloadError> {
        match self.dest.take() {
            Some(dest) => dest.close().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for FragmentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentContext")
            .field("filename", &self.filename)
            .field("tmpfilename", &self.tmpfilename)
            .field("prepared", &self.dest.is_some())
            .field("fragment_index", &self.fragment_index)
            .field("fragment_count", &self.fragment_count)
            .field("complete_frags_downloaded_bytes", &self.complete_frags_downloaded_bytes)
            .field("live", &self.live)
            .field("skipped_fragments", &self.skipped_fragments)
            .field("progress_idx", &self.progress_idx)
            .finish_non_exhaustive()
    }
}

/// What a worker needs to fetch one fragment, copied out of the context.
#[derive(Debug, Clone)]
pub(crate) struct FragmentJob {
    pub fragment: FragmentDescriptor,
    pub path: PathBuf,
    pub filename: PathBuf,
    pub fragment_count: Option<u64>,
    pub progress_idx: usize,
}

impl FragmentJob {
    pub(crate) fn new(
        fragment: FragmentDescriptor,
        tmpfilename: &Path,
        filename: &Path,
        progress_idx: usize,
    ) -> Self {
        Self {
            path: fragment_name(tmpfilename, fragment.index),
            fragment_count: fragment.fragment_count,
            fragment,
            filename: filename.to_path_buf(),
            progress_idx,
        }
    }

    pub(crate) fn index(&self) -> u64 {
        self.fragment.index
    }
}
