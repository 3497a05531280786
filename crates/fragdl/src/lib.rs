//! Download engine for media delivered in pieces.
//!
//! Two independent pipelines share the storage, progress and error layers:
//!
//! - [`fragment`] downloads an ordered stream of fragment descriptors (HLS or
//!   DASH style), decrypts AES-128 fragments and appends them to one output,
//!   with bookkeeping so an interrupted download resumes where it stopped.
//! - [`assembly`] receives segment init/data/end events in arbitrary order and
//!   assembles them into per-sequence files, persisting enough state to resume
//!   after a crash.

pub mod assembly;
pub mod client;
pub mod config;
pub mod error;
pub mod fragment;
pub mod io;
pub mod paths;
pub mod progress;
pub mod proxy;

#[cfg(test)]
mod testing;

pub use assembly::{FormatWriter, SegmentData, SegmentEnd, SegmentInit};
pub use config::{AssemblyConfig, DownloaderConfig, FragmentConfig};
pub use error::DownloadError;
pub use fragment::{
    DownloadOutcome, FragmentContext, FragmentDescriptor, FragmentDownloader, FragmentFetcher,
    HttpFragmentFetcher, StreamDownload,
};
pub use progress::{ProgressEvent, ProgressHook, ProgressStatus};
pub use proxy::{ProxyConfig, ProxyType};
