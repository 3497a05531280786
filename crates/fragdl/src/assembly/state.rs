//! Durable snapshot of a [`FormatWriter`](super::FormatWriter), written after
//! every finalized segment. Only metadata is stored; the bytes live in the
//! sequence files.

use std::io::Write;
use std::path::{Path, PathBuf};

use prost::Message;
use tempfile::NamedTempFile;
use tracing::trace;

use crate::error::DownloadError;
use crate::paths;

#[derive(Clone, PartialEq, Message)]
pub struct StateSegment {
    #[prost(uint64, tag = "1")]
    pub sequence_number: u64,
    #[prost(uint64, optional, tag = "2")]
    pub start_time_ms: Option<u64>,
    #[prost(uint64, optional, tag = "3")]
    pub duration_ms: Option<u64>,
    #[prost(bool, tag = "4")]
    pub duration_estimated: bool,
    #[prost(uint64, tag = "5")]
    pub content_length: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct StateInitSegment {
    #[prost(uint64, tag = "1")]
    pub content_length: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct StateSequence {
    #[prost(uint64, tag = "1")]
    pub sequence_start_number: u64,
    #[prost(uint64, tag = "2")]
    pub sequence_content_length: u64,
    #[prost(message, optional, tag = "3")]
    pub first_segment: Option<StateSegment>,
    #[prost(message, optional, tag = "4")]
    pub last_segment: Option<StateSegment>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AssemblyState {
    #[prost(string, tag = "1")]
    pub format_id: String,
    #[prost(message, optional, tag = "2")]
    pub init_segment: Option<StateInitSegment>,
    #[prost(message, repeated, tag = "3")]
    pub sequences: Vec<StateSequence>,
}

impl AssemblyState {
    pub fn empty(format_id: impl Into<String>) -> Self {
        Self {
            format_id: format_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn retrieve(&self) -> Result<AssemblyState, DownloadError> {
        let bytes = std::fs::read(&self.path)?;
        Ok(AssemblyState::decode(bytes.as_slice())?)
    }

    /// Replace the state file atomically: write a sibling temp file, fsync it,
    /// then rename it over the old one.
    pub fn update(&self, state: &AssemblyState) -> Result<(), DownloadError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&state.encode_to_vec())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| DownloadError::state_file(format!("failed to persist state: {}", e.error)))?;
        trace!(path = %self.path.display(), sequences = state.sequences.len(), "State file updated");
        Ok(())
    }

    pub fn remove(&self) -> Result<(), DownloadError> {
        paths::try_remove(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AssemblyState {
        let segment = |n| StateSegment {
            sequence_number: n,
            start_time_ms: Some(n * 5_000),
            duration_ms: Some(5_000),
            duration_estimated: false,
            content_length: 2048,
        };
        AssemblyState {
            format_id: "251".to_string(),
            init_segment: Some(StateInitSegment { content_length: 100 }),
            sequences: vec![StateSequence {
                sequence_start_number: 1,
                sequence_content_length: 4096,
                first_segment: Some(segment(1)),
                last_segment: Some(segment(2)),
            }],
        }
    }

    #[test]
    fn update_then_retrieve() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::new(dir.path().join("out.segstate"));
        assert!(!file.exists());

        file.update(&AssemblyState::empty("251")).unwrap();
        file.update(&sample()).unwrap();
        assert_eq!(file.retrieve().unwrap(), sample());

        // No temp files left behind by the atomic write.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        file.remove().unwrap();
        assert!(!file.exists());
        file.remove().unwrap();
    }

    #[test]
    fn corrupt_state_is_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.segstate");
        std::fs::write(&path, [0xff, 0xff, 0xff]).unwrap();
        let err = StateFile::new(path).retrieve().unwrap_err();
        assert!(err.is_resume_recoverable());
    }
}
