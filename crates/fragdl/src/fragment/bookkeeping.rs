//! JSON resume file kept next to a fragmented download:
//!
//! ```json
//! {"downloader": {"current_fragment": {"index": 3}, "fragment_count": 10, "extra_state": {}}}
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::trace;

use crate::error::DownloadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct CurrentFragment {
    index: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DownloaderState {
    current_fragment: CurrentFragment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fragment_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    extra_state: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Document {
    downloader: DownloaderState,
}

/// Decoded bookkeeping file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bookkeeping {
    /// Fragments already appended to the output.
    pub fragment_index: u64,
    pub fragment_count: Option<u64>,
    pub extra_state: Option<Map<String, Value>>,
}

impl Bookkeeping {
    pub fn decode(text: &str) -> Result<Self, DownloadError> {
        let document: Document = serde_json::from_str(text)?;
        Ok(Self {
            fragment_index: document.downloader.current_fragment.index,
            fragment_count: document.downloader.fragment_count,
            extra_state: document.downloader.extra_state,
        })
    }

    pub fn encode(&self) -> Result<String, DownloadError> {
        let document = Document {
            downloader: DownloaderState {
                current_fragment: CurrentFragment {
                    index: self.fragment_index,
                },
                fragment_count: self.fragment_count,
                extra_state: self.extra_state.clone(),
            },
        };
        Ok(serde_json::to_string(&document)?)
    }

    pub async fn read(path: &Path) -> Result<Self, DownloadError> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::decode(&text)
    }

    pub async fn write(&self, path: &Path) -> Result<(), DownloadError> {
        tokio::fs::write(path, self.encode()?).await?;
        trace!(path = %path.display(), index = self.fragment_index, "Bookkeeping updated");
        Ok(())
    }
}
