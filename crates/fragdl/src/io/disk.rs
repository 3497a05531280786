use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::trace;

use super::BackendMode;
use crate::error::DownloadError;
use crate::paths::{self, PathSanitizer};

#[derive(Debug)]
enum Handle {
    Writer(BufWriter<File>),
    Reader(BufReader<File>),
}

/// File-backed store. The path is sanitized once at construction.
#[derive(Debug)]
pub struct DiskBackend {
    path: PathBuf,
    handle: Option<Handle>,
    chunk_size: usize,
}

impl DiskBackend {
    pub fn new(path: &Path, sanitizer: &PathSanitizer, chunk_size: usize) -> Self {
        Self {
            path: sanitizer.apply(path),
            handle: None,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> Option<BackendMode> {
        match self.handle {
            Some(Handle::Writer(_)) => Some(BackendMode::Write),
            Some(Handle::Reader(_)) => Some(BackendMode::Read),
            None => None,
        }
    }

    pub fn initialize_writer(&mut self, resume: bool) -> Result<(), DownloadError> {
        if self.handle.is_some() {
            return Err(DownloadError::backend("Backend already initialized"));
        }
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = if resume {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?
        } else {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?
        };
        trace!(path = %self.path.display(), resume, "Opened disk backend for writing");
        self.handle = Some(Handle::Writer(BufWriter::with_capacity(
            self.chunk_size,
            file,
        )));
        Ok(())
    }

    pub fn initialize_reader(&mut self) -> Result<(), DownloadError> {
        if self.handle.is_some() {
            return Err(DownloadError::backend("Backend already initialized"));
        }
        let file = File::open(&self.path)?;
        self.handle = Some(Handle::Reader(BufReader::with_capacity(
            self.chunk_size,
            file,
        )));
        Ok(())
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize, DownloadError> {
        let Some(Handle::Writer(writer)) = self.handle.as_mut() else {
            return Err(DownloadError::backend("Backend writer not initialized"));
        };
        writer.write_all(data)?;
        writer.flush()?;
        Ok(data.len())
    }

    pub fn write_from<R: Read>(&mut self, reader: &mut R) -> Result<usize, DownloadError> {
        let chunk_size = self.chunk_size;
        let Some(Handle::Writer(writer)) = self.handle.as_mut() else {
            return Err(DownloadError::backend("Backend writer not initialized"));
        };
        let mut chunk = vec![0u8; chunk_size];
        let mut total = 0;
        loop {
            let n = reader.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            writer.write_all(&chunk[..n])?;
            total += n;
        }
        writer.flush()?;
        Ok(total)
    }

    pub(super) fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, DownloadError> {
        let Some(Handle::Reader(reader)) = self.handle.as_mut() else {
            return Err(DownloadError::backend("Backend reader not initialized"));
        };
        Ok(reader.read(buf)?)
    }

    pub(super) fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn current_length(&self) -> u64 {
        paths::filesize_or_zero(&self.path)
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn close(&mut self) -> Result<(), DownloadError> {
        if let Some(Handle::Writer(mut writer)) = self.handle.take() {
            writer.flush()?;
        }
        Ok(())
    }

    pub fn remove(&mut self) -> Result<(), DownloadError> {
        self.close()?;
        paths::try_remove(&self.path)?;
        Ok(())
    }
}
