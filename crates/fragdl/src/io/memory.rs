use std::io::Read;

use super::BackendMode;
use crate::error::DownloadError;

/// Growable in-memory store.
///
/// Closing keeps the bytes; only a new writer opened without `resume` resets
/// them, and `remove` drops them.
#[derive(Debug)]
pub struct MemoryBackend {
    buffer: Vec<u8>,
    position: usize,
    mode: Option<BackendMode>,
    chunk_size: usize,
}

impl MemoryBackend {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            position: 0,
            mode: None,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn mode(&self) -> Option<BackendMode> {
        self.mode
    }

    pub fn initialize_writer(&mut self, resume: bool) -> Result<(), DownloadError> {
        if self.mode.is_some() {
            return Err(DownloadError::backend("Backend already initialized"));
        }
        if !resume {
            self.buffer.clear();
        }
        self.position = self.buffer.len();
        self.mode = Some(BackendMode::Write);
        Ok(())
    }

    pub fn initialize_reader(&mut self) -> Result<(), DownloadError> {
        if self.mode.is_some() {
            return Err(DownloadError::backend("Backend already initialized"));
        }
        self.position = 0;
        self.mode = Some(BackendMode::Read);
        Ok(())
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize, DownloadError> {
        if self.mode != Some(BackendMode::Write) {
            return Err(DownloadError::backend("Backend writer not initialized"));
        }
        self.buffer.truncate(self.position);
        self.buffer.extend_from_slice(data);
        self.position = self.buffer.len();
        Ok(data.len())
    }

    pub fn write_from<R: Read>(&mut self, reader: &mut R) -> Result<usize, DownloadError> {
        if self.mode != Some(BackendMode::Write) {
            return Err(DownloadError::backend("Backend writer not initialized"));
        }
        let mut chunk = vec![0u8; self.chunk_size];
        let mut total = 0;
        loop {
            let n = reader.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            total += self.write(&chunk[..n])?;
        }
        Ok(total)
    }

    /// Copy up to `buf.len()` unread bytes into `buf`.
    pub(super) fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, DownloadError> {
        if self.mode != Some(BackendMode::Read) {
            return Err(DownloadError::backend("Backend reader not initialized"));
        }
        let remaining = &self.buffer[self.position.min(self.buffer.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        Ok(n)
    }

    pub(super) fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn current_length(&self) -> u64 {
        self.buffer.len() as u64
    }

    pub fn exists(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn close(&mut self) {
        self.mode = None;
        self.position = 0;
    }

    pub fn remove(&mut self) {
        self.close();
        self.buffer = Vec::new();
    }
}
