//! Scoped read/write storage used by segments, sequences and the final output.
//!
//! An [`IoBackend`] is either reading or writing, never both. Every write is
//! flushed before returning so lengths observed through [`IoBackend::current_length`]
//! always reflect what was written.

mod disk;
mod memory;

use std::io::Read;
use std::path::Path;

pub use disk::DiskBackend;
pub use memory::MemoryBackend;

use crate::error::DownloadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    Write,
    Read,
}

#[derive(Debug)]
pub enum IoBackend {
    Memory(MemoryBackend),
    Disk(DiskBackend),
}

impl IoBackend {
    pub fn memory(chunk_size: usize) -> Self {
        Self::Memory(MemoryBackend::new(chunk_size))
    }

    pub fn disk(path: &Path, sanitizer: &crate::paths::PathSanitizer, chunk_size: usize) -> Self {
        Self::Disk(DiskBackend::new(path, sanitizer, chunk_size))
    }

    pub fn mode(&self) -> Option<BackendMode> {
        match self {
            Self::Memory(b) => b.mode(),
            Self::Disk(b) => b.mode(),
        }
    }

    /// Path on disk, `None` for memory backends.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Memory(_) => None,
            Self::Disk(b) => Some(b.path()),
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, Self::Memory(_))
    }

    pub fn initialize_writer(&mut self, resume: bool) -> Result<(), DownloadError> {
        match self {
            Self::Memory(b) => b.initialize_writer(resume),
            Self::Disk(b) => b.initialize_writer(resume),
        }
    }

    pub fn initialize_reader(&mut self) -> Result<(), DownloadError> {
        match self {
            Self::Memory(b) => b.initialize_reader(),
            Self::Disk(b) => b.initialize_reader(),
        }
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize, DownloadError> {
        match self {
            Self::Memory(b) => b.write(data),
            Self::Disk(b) => b.write(data),
        }
    }

    /// Stream everything `reader` yields into this backend.
    pub fn write_from<R: Read>(&mut self, reader: &mut R) -> Result<usize, DownloadError> {
        match self {
            Self::Memory(b) => b.write_from(reader),
            Self::Disk(b) => b.write_from(reader),
        }
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, DownloadError> {
        match self {
            Self::Memory(b) => b.read_chunk(buf),
            Self::Disk(b) => b.read_chunk(buf),
        }
    }

    fn chunk_size(&self) -> usize {
        match self {
            Self::Memory(b) => b.chunk_size(),
            Self::Disk(b) => b.chunk_size(),
        }
    }

    /// Copy all remaining bytes of this reader into `dest`, which must be writing.
    pub fn read_into(&mut self, dest: &mut IoBackend) -> Result<u64, DownloadError> {
        if self.mode() != Some(BackendMode::Read) {
            return Err(DownloadError::backend("Backend reader not initialized"));
        }
        if dest.mode() != Some(BackendMode::Write) {
            return Err(DownloadError::backend(
                "Destination backend writer not initialized",
            ));
        }
        let mut chunk = vec![0u8; self.chunk_size()];
        let mut total = 0u64;
        loop {
            let n = self.read_chunk(&mut chunk)?;
            if n == 0 {
                break;
            }
            dest.write(&chunk[..n])?;
            total += n as u64;
        }
        Ok(total)
    }

    pub fn current_length(&self) -> u64 {
        match self {
            Self::Memory(b) => b.current_length(),
            Self::Disk(b) => b.current_length(),
        }
    }

    pub fn validate_length(&self, expected: u64) -> bool {
        self.current_length() == expected
    }

    pub fn exists(&self) -> bool {
        match self {
            Self::Memory(b) => b.exists(),
            Self::Disk(b) => b.exists(),
        }
    }

    pub fn close(&mut self) -> Result<(), DownloadError> {
        match self {
            Self::Memory(b) => {
                b.close();
                Ok(())
            }
            Self::Disk(b) => b.close(),
        }
    }

    pub fn remove(&mut self) -> Result<(), DownloadError> {
        match self {
            Self::Memory(b) => {
                b.remove();
                Ok(())
            }
            Self::Disk(b) => b.remove(),
        }
    }
}
