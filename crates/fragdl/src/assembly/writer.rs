use std::path::{Path, PathBuf};

use bytes::Bytes;
use humansize::{BINARY, format_size};
use tracing::{debug, info, warn};

use super::segment::{INIT_SEGMENT_ID, Segment};
use super::sequence::{Sequence, SequenceFile};
use super::state::{AssemblyState, StateFile, StateInitSegment, StateSegment, StateSequence};
use crate::config::AssemblyConfig;
use crate::error::DownloadError;
use crate::io::IoBackend;
use crate::paths;
use crate::progress::{
    ProgressCalculator, ProgressEvent, ProgressHook, ProgressReporter, ProgressStatus,
};

/// Start of a segment.
#[derive(Debug, Clone, Default)]
pub struct SegmentInit {
    pub is_init_segment: bool,
    pub sequence_number: Option<u64>,
    pub content_length: Option<u64>,
    pub content_length_estimated: bool,
    pub start_time_ms: Option<u64>,
    pub duration_ms: Option<u64>,
    pub duration_estimated: bool,
    /// Bytes already downloaded for this format before the segment started.
    pub start_bytes: u64,
}

/// A chunk of segment payload.
#[derive(Debug, Clone, Default)]
pub struct SegmentData {
    pub is_init_segment: bool,
    pub sequence_number: Option<u64>,
    pub data: Bytes,
    pub total_segments: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct SegmentEnd {
    pub is_init_segment: bool,
    pub sequence_number: Option<u64>,
}

/// Snapshot of what a [`FormatWriter`] holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatState {
    pub format_id: Option<String>,
    pub init_sequence: Option<Sequence>,
    pub sequences: Vec<Sequence>,
}

fn media_segment_id(is_init: bool, sequence_number: Option<u64>) -> Result<String, DownloadError> {
    if is_init {
        return Ok(INIT_SEGMENT_ID.to_string());
    }
    sequence_number
        .map(|n| n.to_string())
        .ok_or_else(|| DownloadError::segment_state("Media segment is missing a sequence number"))
}

fn unknown_segment() -> DownloadError {
    DownloadError::segment_state(
        "Unable to find sequence file for segment. Was the segment initialized?",
    )
}

/// Assembles one output format from segment init/data/end events.
///
/// Segments are routed to the sequence that has them in progress or accepts
/// them as the next segment. A new sequence is opened when none does. The
/// durable state is rewritten after every finalized segment, and
/// [`finish`](Self::finish) concatenates the init sequence followed by the data
/// sequences in ascending order into the final file.
pub struct FormatWriter {
    filename: PathBuf,
    output: Option<IoBackend>,
    state_file: StateFile,
    format_id: Option<String>,
    init_sequence: Option<SequenceFile>,
    sequence_files: Vec<SequenceFile>,
    config: AssemblyConfig,
    progress: Option<ProgressCalculator>,
    reporter: ProgressReporter,
    progress_idx: usize,
    total_bytes: Option<u64>,
    last_event: Option<ProgressEvent>,
}

impl FormatWriter {
    pub fn new(filename: impl Into<PathBuf>, config: AssemblyConfig) -> Self {
        let filename = filename.into();
        let output = IoBackend::disk(
            &paths::temp_name(&filename),
            &config.sanitizer,
            config.copy_buffer_size,
        );
        let state_file = StateFile::new(config.sanitizer.apply(&paths::state_name(&filename)));
        let reporter = ProgressReporter::new(None, config.progress_interval);
        Self {
            filename,
            output: Some(output),
            state_file,
            format_id: None,
            init_sequence: None,
            sequence_files: Vec::new(),
            config,
            progress: None,
            reporter,
            progress_idx: 0,
            total_bytes: None,
            last_event: None,
        }
    }

    pub fn with_progress_hook(mut self, hook: ProgressHook, progress_idx: usize) -> Self {
        self.reporter = ProgressReporter::new(Some(hook), self.config.progress_interval);
        self.progress_idx = progress_idx;
        self
    }

    /// Expected size of the finished file, when the caller knows it.
    pub fn with_total_bytes(mut self, total_bytes: Option<u64>) -> Self {
        self.total_bytes = total_bytes;
        self
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    pub fn initialized(&self) -> bool {
        self.format_id.is_some()
    }

    pub fn state(&self) -> FormatState {
        FormatState {
            format_id: self.format_id.clone(),
            init_sequence: self.init_sequence.as_ref().map(|sf| sf.sequence().clone()),
            sequences: self
                .sequence_files
                .iter()
                .map(|sf| sf.sequence().clone())
                .collect(),
        }
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.sequence_files
            .iter()
            .map(SequenceFile::current_length)
            .sum::<u64>()
            + self
                .init_sequence
                .as_ref()
                .map_or(0, SequenceFile::current_length)
    }

    pub fn initialize_format(&mut self, format_id: impl Into<String>) -> Result<(), DownloadError> {
        if self.format_id.is_some() {
            return Err(DownloadError::segment_state("Already initialized"));
        }
        let format_id = format_id.into();
        self.format_id = Some(format_id.clone());

        if !self.config.resume {
            if self.state_file.exists() {
                self.state_file.remove()?;
            }
            return Ok(());
        }

        let document = self.load_state(&format_id);

        if let Some(init) = &document.init_segment {
            let segment = Segment::init(Some(init.content_length));
            let sequence = Sequence {
                sequence_id: INIT_SEGMENT_ID.to_string(),
                sequence_content_length: init.content_length,
                first_segment: Some(segment.clone()),
                last_segment: Some(segment),
            };
            match SequenceFile::new(&self.filename, sequence, &self.config, true) {
                Ok(sf) => self.init_sequence = Some(sf),
                Err(e) => warn!(format = %format_id, error = %e, "Failed to resume init segment"),
            }
        }

        for stored in &document.sequences {
            let (Some(first), Some(last)) = (&stored.first_segment, &stored.last_segment) else {
                continue;
            };
            let sequence = Sequence {
                sequence_id: stored.sequence_start_number.to_string(),
                sequence_content_length: stored.sequence_content_length,
                first_segment: Some(segment_from_state(first)),
                last_segment: Some(segment_from_state(last)),
            };
            match SequenceFile::new(&self.filename, sequence, &self.config, true) {
                Ok(sf) => self.sequence_files.push(sf),
                Err(e) => warn!(
                    format = %format_id,
                    sequence = stored.sequence_start_number,
                    error = %e,
                    "Failed to resume sequence"
                ),
            }
        }

        if !self.sequence_files.is_empty() || self.init_sequence.is_some() {
            info!(
                format = %format_id,
                sequences = self.sequence_files.len(),
                resumed = %format_size(self.downloaded_bytes(), BINARY),
                "Resuming format download"
            );
        }
        Ok(())
    }

    fn load_state(&self, format_id: &str) -> AssemblyState {
        let mut document = None;
        if self.state_file.exists() {
            match self.state_file.retrieve() {
                Ok(state) => document = Some(state),
                Err(e) => warn!(
                    format = %format_id,
                    error = %e,
                    "Corrupted state file, restarting download"
                ),
            }
        }
        if let Some(state) = &document
            && state.format_id != format_id
        {
            warn!(
                format = %format_id,
                stored = %state.format_id,
                "Format ID mismatch in state file, restarting download"
            );
            document = None;
        }
        document.unwrap_or_else(|| AssemblyState::empty(format_id))
    }

    fn find_sequence_file<F>(&self, segment_id: &str, predicate: F) -> Result<Option<usize>, DownloadError>
    where
        F: Fn(&SequenceFile) -> bool,
    {
        let mut found = None;
        for (i, sf) in self.sequence_files.iter().enumerate() {
            if predicate(sf) {
                if found.is_some() {
                    return Err(DownloadError::AmbiguousSequence {
                        segment_id: segment_id.to_string(),
                    });
                }
                found = Some(i);
            }
        }
        Ok(found)
    }

    fn find_current_sequence_file(&self, segment_id: &str) -> Result<Option<usize>, DownloadError> {
        self.find_sequence_file(segment_id, |sf| sf.is_current_segment(segment_id))
    }

    fn find_next_sequence_file(&self, segment: &Segment) -> Result<Option<usize>, DownloadError> {
        self.find_sequence_file(&segment.segment_id, |sf| sf.is_next_segment(segment))
    }

    fn ensure_initialized(&self) -> Result<(), DownloadError> {
        if self.format_id.is_none() {
            return Err(DownloadError::segment_state("Format writer not initialized"));
        }
        Ok(())
    }

    pub fn initialize_segment(&mut self, part: &SegmentInit) -> Result<(), DownloadError> {
        self.ensure_initialized()?;
        if self.progress.is_none() {
            self.progress = Some(ProgressCalculator::new(part.start_bytes));
        }

        if part.is_init_segment {
            if self.init_sequence.is_none() {
                self.init_sequence = Some(SequenceFile::new(
                    &self.filename,
                    Sequence::new(INIT_SEGMENT_ID),
                    &self.config,
                    false,
                )?);
            }
            let mut segment = Segment::init(part.content_length);
            segment.content_length_estimated = part.content_length_estimated;
            if let Some(init) = self.init_sequence.as_mut() {
                init.initialize_segment(segment)?;
            }
            return Ok(());
        }

        let segment_id = media_segment_id(false, part.sequence_number)?;
        let segment = Segment {
            segment_id: segment_id.clone(),
            content_length: part.content_length,
            content_length_estimated: part.content_length_estimated,
            is_init_segment: false,
            sequence_number: part.sequence_number,
            start_time_ms: part.start_time_ms,
            duration_ms: part.duration_ms,
            duration_estimated: part.duration_estimated,
        };

        let index = match self.find_current_sequence_file(&segment_id)? {
            Some(i) => i,
            None => match self.find_next_sequence_file(&segment)? {
                Some(i) => i,
                None => {
                    debug!(segment = %segment_id, "Starting new sequence");
                    self.sequence_files.push(SequenceFile::new(
                        &self.filename,
                        Sequence::new(segment_id.clone()),
                        &self.config,
                        false,
                    )?);
                    self.sequence_files.len() - 1
                }
            },
        };
        self.sequence_files[index].initialize_segment(segment)
    }

    fn sequence_for_segment(
        &mut self,
        is_init: bool,
        sequence_number: Option<u64>,
    ) -> Result<(&mut SequenceFile, String), DownloadError> {
        let segment_id = media_segment_id(is_init, sequence_number)?;
        if is_init {
            let sf = self.init_sequence.as_mut().ok_or_else(unknown_segment)?;
            return Ok((sf, segment_id));
        }
        let index = self
            .find_current_sequence_file(&segment_id)?
            .ok_or_else(unknown_segment)?;
        Ok((&mut self.sequence_files[index], segment_id))
    }

    pub fn write_segment_data(&mut self, part: &SegmentData) -> Result<(), DownloadError> {
        let (sf, segment_id) = self.sequence_for_segment(part.is_init_segment, part.sequence_number)?;
        sf.write_segment_data(&part.data, &segment_id)?;

        let downloaded = self.downloaded_bytes();
        let progress = self
            .progress
            .get_or_insert_with(|| ProgressCalculator::new(0));
        progress.set_total(self.total_bytes);
        progress.update(0, downloaded);
        let snapshot = progress.snapshot();

        let event = ProgressEvent {
            status: ProgressStatus::Downloading,
            filename: self.filename.clone(),
            downloaded_bytes: downloaded,
            total_bytes: self.total_bytes,
            total_bytes_estimate: None,
            eta: snapshot.eta,
            speed: snapshot.speed,
            elapsed: snapshot.elapsed,
            fragment_index: part.sequence_number,
            fragment_count: part.total_segments,
            progress_idx: self.progress_idx,
        };
        self.reporter.report(&event);
        self.last_event = Some(event);
        Ok(())
    }

    pub fn end_segment(&mut self, part: &SegmentEnd) -> Result<(), DownloadError> {
        let (sf, segment_id) = self.sequence_for_segment(part.is_init_segment, part.sequence_number)?;
        sf.end_segment(&segment_id)?;
        self.write_state()
    }

    fn write_state(&self) -> Result<(), DownloadError> {
        let mut state = AssemblyState::empty(self.format_id.clone().unwrap_or_default());

        state.init_segment = self
            .init_sequence
            .as_ref()
            .filter(|sf| sf.sequence().last_segment.is_some())
            .map(|sf| StateInitSegment {
                content_length: sf.sequence().sequence_content_length,
            });

        for sf in &self.sequence_files {
            let sequence = sf.sequence();
            let (Some(first), Some(last)) = (&sequence.first_segment, &sequence.last_segment) else {
                continue;
            };
            state.sequences.push(StateSequence {
                sequence_start_number: first.sequence_number.unwrap_or_default(),
                sequence_content_length: sequence.sequence_content_length,
                first_segment: Some(segment_to_state(first)),
                last_segment: Some(segment_to_state(last)),
            });
        }

        self.state_file.update(&state)
    }

    /// Merge every sequence into the final file and clean up all temporary
    /// artifacts. Returns the final path.
    pub fn finish(&mut self) -> Result<PathBuf, DownloadError> {
        let finished = match self.last_event.clone() {
            Some(mut event) => {
                event.status = ProgressStatus::Finished;
                event
            }
            None => ProgressEvent {
                status: ProgressStatus::Finished,
                filename: self.filename.clone(),
                downloaded_bytes: self.downloaded_bytes(),
                total_bytes: self.total_bytes,
                total_bytes_estimate: None,
                eta: None,
                speed: None,
                elapsed: std::time::Duration::ZERO,
                fragment_index: None,
                fragment_count: None,
                progress_idx: self.progress_idx,
            },
        };

        for sf in &mut self.sequence_files {
            sf.close()?;
        }
        if let Some(init) = self.init_sequence.as_mut() {
            init.close()?;
        }

        let output = self
            .output
            .as_mut()
            .ok_or_else(|| DownloadError::segment_state("Already closed"))?;
        output.initialize_writer(false)?;

        if let Some(init) = self.init_sequence.as_mut() {
            init.read_into(output)?;
            init.close()?;
        }

        self.sequence_files.sort_by_key(|sf| {
            sf.sequence()
                .first_segment
                .as_ref()
                .and_then(|s| s.sequence_number)
        });
        let mut previous: Option<u64> = None;
        for sf in self
            .sequence_files
            .iter_mut()
            .filter(|sf| sf.sequence().first_segment.is_some())
        {
            let sequence = sf.sequence();
            let first = sequence.first_segment.as_ref().and_then(|s| s.sequence_number);
            if let (Some(prev), Some(first)) = (previous, first)
                && prev + 1 != first
            {
                warn!(
                    format = ?self.format_id,
                    after = prev,
                    next = first,
                    "Disjointed sequences found"
                );
            }
            previous = sequence.last_segment.as_ref().and_then(|s| s.sequence_number);
            sf.read_into(output)?;
            sf.close()?;
        }

        output.close()?;
        let temp = output
            .path()
            .map(Path::to_path_buf)
            .ok_or_else(|| DownloadError::internal("format output is not disk backed"))?;
        let final_path = paths::undo_temp_name(&temp);
        paths::try_rename(&temp, &final_path)?;
        info!(
            path = %final_path.display(),
            size = %format_size(paths::filesize_or_zero(&final_path), BINARY),
            "Format assembled"
        );

        self.state_file.remove()?;
        for sf in &mut self.sequence_files {
            sf.remove()?;
        }
        if let Some(init) = self.init_sequence.as_mut() {
            init.remove()?;
        }
        self.close()?;
        self.last_event = None;
        self.reporter.report(&finished);
        Ok(final_path)
    }

    pub fn close(&mut self) -> Result<(), DownloadError> {
        let mut output = self
            .output
            .take()
            .ok_or_else(|| DownloadError::segment_state("Already closed"))?;
        for sf in &mut self.sequence_files {
            sf.close()?;
        }
        self.sequence_files.clear();
        if let Some(mut init) = self.init_sequence.take() {
            init.close()?;
        }
        output.close()
    }
}

impl std::fmt::Debug for FormatWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatWriter")
            .field("filename", &self.filename)
            .field("format_id", &self.format_id)
            .field("sequences", &self.sequence_files.len())
            .field("has_init_sequence", &self.init_sequence.is_some())
            .finish_non_exhaustive()
    }
}

fn segment_from_state(s: &StateSegment) -> Segment {
    Segment {
        segment_id: s.sequence_number.to_string(),
        content_length: Some(s.content_length),
        content_length_estimated: false,
        is_init_segment: false,
        sequence_number: Some(s.sequence_number),
        start_time_ms: s.start_time_ms,
        duration_ms: s.duration_ms,
        duration_estimated: s.duration_estimated,
    }
}

fn segment_to_state(s: &Segment) -> StateSegment {
    StateSegment {
        sequence_number: s.sequence_number.unwrap_or_default(),
        start_time_ms: s.start_time_ms,
        duration_ms: s.duration_ms,
        duration_estimated: s.duration_estimated,
        content_length: s.content_length.unwrap_or_default(),
    }
}
