//! Fragment orchestrator: downloads fragment descriptors into one output file.

pub mod bookkeeping;
mod context;
pub mod decryption;
pub mod descriptor;
pub mod fetcher;
mod multi;
mod orchestrator;
pub mod retry;

pub use bookkeeping::Bookkeeping;
pub use context::FragmentContext;
pub use decryption::{Decrypter, KeyCache};
pub use descriptor::{ByteRange, DecryptInfo, FragmentDescriptor};
pub use fetcher::{FragmentFetcher, HttpFragmentFetcher};
pub use multi::StreamDownload;
pub use orchestrator::{AppendReport, DownloadOutcome, FatalPredicate, FragmentDownloader};
pub use retry::{RetryAction, RetryPolicy, retry_with_backoff};
