use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::segment::{Segment, SegmentFile};
use crate::config::AssemblyConfig;
use crate::error::DownloadError;
use crate::io::IoBackend;
use crate::paths;

/// An ordered run of finalized segments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sequence {
    pub sequence_id: String,
    pub sequence_content_length: u64,
    pub first_segment: Option<Segment>,
    pub last_segment: Option<Segment>,
}

impl Sequence {
    pub fn new(sequence_id: impl Into<String>) -> Self {
        Self {
            sequence_id: sequence_id.into(),
            ..Default::default()
        }
    }

    /// Number of segments merged so far.
    pub fn segment_count(&self) -> u64 {
        match (&self.first_segment, &self.last_segment) {
            (Some(first), Some(last)) => match (first.sequence_number, last.sequence_number) {
                (Some(a), Some(b)) => b.saturating_sub(a) + 1,
                _ => 1,
            },
            _ => 0,
        }
    }
}

/// A [`Sequence`] plus the disk file its segments are appended to.
///
/// Holds at most one segment in progress. A segment is accepted only as the
/// direct successor of the last finalized one; a sequence holding the init
/// segment accepts nothing further.
#[derive(Debug)]
pub struct SequenceFile {
    sequence: Sequence,
    format_path: PathBuf,
    backend: IoBackend,
    current_segment: Option<SegmentFile>,
    config: AssemblyConfig,
}

impl SequenceFile {
    pub fn new(
        format_path: &Path,
        sequence: Sequence,
        config: &AssemblyConfig,
        resume: bool,
    ) -> Result<Self, DownloadError> {
        let mut backend = IoBackend::disk(
            &paths::sequence_name(format_path, &sequence.sequence_id),
            &config.sanitizer,
            config.copy_buffer_size,
        );
        let id = &sequence.sequence_id;

        match &sequence.last_segment {
            None => {
                if backend.exists() {
                    debug!(sequence = %id, "Removing stale sequence file");
                    backend.remove()?;
                }
            }
            Some(_) if !resume || !backend.exists() => {
                return Err(DownloadError::invalid_resume_state(format!(
                    "Cannot find existing sequence {id} file"
                )));
            }
            Some(_) => {
                if !backend.validate_length(sequence.sequence_content_length) {
                    warn!(
                        sequence = %id,
                        expected = sequence.sequence_content_length,
                        actual = backend.current_length(),
                        "Existing sequence file has an unexpected length"
                    );
                    backend.remove()?;
                    return Err(DownloadError::invalid_resume_state(format!(
                        "Existing sequence {id} file is not valid; removing"
                    )));
                }
            }
        }

        Ok(Self {
            sequence,
            format_path: format_path.to_path_buf(),
            backend,
            current_segment: None,
            config: config.clone(),
        })
    }

    pub fn sequence(&self) -> &Sequence {
        &self.sequence
    }

    pub fn backend(&self) -> &IoBackend {
        &self.backend
    }

    pub fn current_segment(&self) -> Option<&Segment> {
        self.current_segment.as_ref().map(SegmentFile::segment)
    }

    pub fn is_current_segment(&self, segment_id: &str) -> bool {
        self.current_segment
            .as_ref()
            .is_some_and(|s| s.segment_id() == segment_id)
    }

    pub fn is_next_segment(&self, segment: &Segment) -> bool {
        if self.current_segment.is_some() {
            return false;
        }
        let Some(last) = &self.sequence.last_segment else {
            return true;
        };
        if last.is_init_segment || segment.is_init_segment {
            return false;
        }
        if let Some(max) = self.config.max_segments_per_sequence
            && self.sequence.segment_count() >= max
        {
            return false;
        }
        match (last.sequence_number, segment.sequence_number) {
            (Some(last), Some(next)) => last + 1 == next,
            _ => false,
        }
    }

    pub fn initialize_segment(&mut self, segment: Segment) -> Result<(), DownloadError> {
        if let Some(current) = self.current_segment.as_mut() {
            if current.segment_id() != segment.segment_id {
                return Err(DownloadError::segment_state(
                    "Cannot reinitialize a segment that does not match the current segment",
                ));
            }
            debug!(segment = %segment.segment_id, "Reinitializing segment, discarding partial data");
            current.remove()?;
            self.current_segment = None;
        } else if !self.is_next_segment(&segment) {
            return Err(DownloadError::segment_state(
                "Cannot initialize a segment that does not match the next segment",
            ));
        }

        self.current_segment = Some(SegmentFile::new(
            &self.format_path,
            segment,
            &self.config,
        )?);
        Ok(())
    }

    pub fn write_segment_data(&mut self, data: &[u8], segment_id: &str) -> Result<usize, DownloadError> {
        match self.current_segment.as_mut() {
            Some(current) if current.segment_id() == segment_id => current.write(data),
            _ => Err(DownloadError::segment_state(
                "Cannot write to a segment that does not match the current segment",
            )),
        }
    }

    pub fn end_segment(&mut self, segment_id: &str) -> Result<(), DownloadError> {
        if !self.is_current_segment(segment_id) {
            return Err(DownloadError::segment_state(
                "Cannot end a segment that does not exist",
            ));
        }
        let Some(mut current) = self.current_segment.take() else {
            return Err(DownloadError::segment_state(
                "Cannot end a segment that does not exist",
            ));
        };

        current.finish_write()?;
        let actual = current.current_length();
        let declared = current.segment();
        if let Some(expected) = declared.content_length
            && expected != 0
            && !declared.content_length_estimated
            && expected != actual
        {
            let err = DownloadError::LengthMismatch {
                segment_id: declared.segment_id.clone(),
                expected,
                actual,
            };
            self.current_segment = Some(current);
            return Err(err);
        }

        if self.backend.mode().is_none() {
            self.backend.initialize_writer(true)?;
        }
        current.read_into(&mut self.backend)?;

        let mut segment = current.segment().clone();
        segment.content_length = Some(actual);
        segment.content_length_estimated = false;

        self.sequence.sequence_content_length += actual;
        if self.sequence.first_segment.is_none() {
            self.sequence.first_segment = Some(segment.clone());
        }
        self.sequence.last_segment = Some(segment);
        current.remove()?;
        Ok(())
    }

    /// Finalized bytes plus bytes of the segment in progress.
    pub fn current_length(&self) -> u64 {
        self.sequence.sequence_content_length
            + self
                .current_segment
                .as_ref()
                .map_or(0, SegmentFile::current_length)
    }

    pub fn read_into(&mut self, dest: &mut IoBackend) -> Result<u64, DownloadError> {
        self.backend.close()?;
        if !self.backend.exists() {
            return Ok(0);
        }
        self.backend.initialize_reader()?;
        let copied = self.backend.read_into(dest);
        self.backend.close()?;
        copied
    }

    pub fn close(&mut self) -> Result<(), DownloadError> {
        if let Some(current) = self.current_segment.as_mut() {
            current.close()?;
        }
        self.backend.close()
    }

    pub fn remove(&mut self) -> Result<(), DownloadError> {
        if let Some(mut current) = self.current_segment.take() {
            current.remove()?;
        }
        self.backend.remove()
    }
}
