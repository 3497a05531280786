use std::path::Path;

use crate::config::AssemblyConfig;
use crate::error::DownloadError;
use crate::io::IoBackend;
use crate::paths;

/// Identifier of the init segment, which carries format headers and precedes
/// every media segment in the output.
pub const INIT_SEGMENT_ID: &str = "i";

/// Metadata of one contiguous chunk of a sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Segment {
    pub segment_id: String,
    pub content_length: Option<u64>,
    pub content_length_estimated: bool,
    pub is_init_segment: bool,
    pub sequence_number: Option<u64>,
    pub start_time_ms: Option<u64>,
    pub duration_ms: Option<u64>,
    pub duration_estimated: bool,
}

impl Segment {
    pub fn init(content_length: Option<u64>) -> Self {
        Self {
            segment_id: INIT_SEGMENT_ID.to_string(),
            content_length,
            is_init_segment: true,
            ..Default::default()
        }
    }

    /// A media segment; its id is the decimal sequence number.
    pub fn media(sequence_number: u64, content_length: Option<u64>) -> Self {
        Self {
            segment_id: sequence_number.to_string(),
            content_length,
            sequence_number: Some(sequence_number),
            ..Default::default()
        }
    }

    /// Declared length used for the memory/disk decision; unknown counts as 0.
    pub fn declared_length(&self) -> u64 {
        self.content_length.unwrap_or(0)
    }
}

/// A [`Segment`] being written, plus the backend holding its bytes.
///
/// The backend is memory when the declared length is at or under the
/// configured limit and disk otherwise. The writer is opened lazily on the
/// first write.
#[derive(Debug)]
pub struct SegmentFile {
    segment: Segment,
    backend: IoBackend,
}

impl SegmentFile {
    pub fn new(
        format_path: &Path,
        segment: Segment,
        config: &AssemblyConfig,
    ) -> Result<Self, DownloadError> {
        let mut backend = if segment.declared_length() <= config.segment_memory_limit {
            IoBackend::memory(config.copy_buffer_size)
        } else {
            IoBackend::disk(
                &paths::segment_name(format_path, &segment.segment_id),
                &config.sanitizer,
                config.copy_buffer_size,
            )
        };
        // Leftovers from an earlier attempt are never resumed.
        if backend.exists() {
            backend.remove()?;
        }
        Ok(Self { segment, backend })
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    pub fn segment_id(&self) -> &str {
        &self.segment.segment_id
    }

    pub fn backend(&self) -> &IoBackend {
        &self.backend
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize, DownloadError> {
        if self.backend.mode().is_none() {
            self.backend.initialize_writer(false)?;
        }
        self.backend.write(data)
    }

    pub fn current_length(&self) -> u64 {
        self.backend.current_length()
    }

    pub fn finish_write(&mut self) -> Result<(), DownloadError> {
        self.backend.close()
    }

    /// Stream every byte of the segment into `dest`, which must be writing.
    pub fn read_into(&mut self, dest: &mut IoBackend) -> Result<u64, DownloadError> {
        self.backend.close()?;
        if !self.backend.exists() {
            // Nothing was ever written, e.g. a zero-length segment.
            return Ok(0);
        }
        self.backend.initialize_reader()?;
        let copied = self.backend.read_into(dest);
        self.backend.close()?;
        copied
    }

    pub fn close(&mut self) -> Result<(), DownloadError> {
        self.backend.close()
    }

    pub fn remove(&mut self) -> Result<(), DownloadError> {
        self.backend.remove()
    }
}
