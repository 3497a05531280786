//! On-disk naming for every temporary artifact the engine produces.
//!
//! Each artifact kind has its own suffix so leftovers from a crashed process can
//! be told apart and either resumed or cleaned up:
//!
//! | artifact            | name                              |
//! |---------------------|-----------------------------------|
//! | output temp         | `<file>.part`                     |
//! | fragment temp       | `<file>.part-Frag<N>`             |
//! | bookkeeping         | `<file>.fragdl`                   |
//! | segment temp        | `<file>.sg<id>.seg.part`          |
//! | sequence temp       | `<file>.sq<id>.seq.part`          |
//! | assembly state      | `<file>.segstate`                 |

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

const PART_SUFFIX: &str = ".part";
const BOOKKEEPING_SUFFIX: &str = ".fragdl";
const STATE_SUFFIX: &str = ".segstate";

/// Hook applied to every path before it is opened on disk.
///
/// Platform-safe filename rules belong to the caller; the default hook keeps
/// paths untouched.
#[derive(Clone)]
pub struct PathSanitizer(Arc<dyn Fn(&Path) -> PathBuf + Send + Sync>);

impl PathSanitizer {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Path) -> PathBuf + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn apply(&self, path: &Path) -> PathBuf {
        (self.0)(path)
    }
}

impl Default for PathSanitizer {
    fn default() -> Self {
        Self::new(Path::to_path_buf)
    }
}

impl fmt::Debug for PathSanitizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PathSanitizer")
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// `-` means the output goes to stdout; no temp files are used for it.
pub fn is_stdout(path: &Path) -> bool {
    path.as_os_str() == "-"
}

pub fn temp_name(path: &Path) -> PathBuf {
    if is_stdout(path) || (path.exists() && !path.is_file()) {
        return path.to_path_buf();
    }
    with_suffix(path, PART_SUFFIX)
}

pub fn undo_temp_name(path: &Path) -> PathBuf {
    match path.to_str().and_then(|s| s.strip_suffix(PART_SUFFIX)) {
        Some(stripped) => PathBuf::from(stripped),
        None => path.to_path_buf(),
    }
}

pub fn bookkeeping_name(path: &Path) -> PathBuf {
    with_suffix(path, BOOKKEEPING_SUFFIX)
}

pub fn fragment_name(temp_path: &Path, index: u64) -> PathBuf {
    with_suffix(temp_path, &format!("-Frag{index}"))
}

pub fn segment_name(format_path: &Path, segment_id: &str) -> PathBuf {
    with_suffix(format_path, &format!(".sg{segment_id}.seg{PART_SUFFIX}"))
}

pub fn sequence_name(format_path: &Path, sequence_id: &str) -> PathBuf {
    with_suffix(format_path, &format!(".sq{sequence_id}.seq{PART_SUFFIX}"))
}

pub fn state_name(format_path: &Path) -> PathBuf {
    with_suffix(format_path, STATE_SUFFIX)
}

/// Size of a file, or 0 when it does not exist.
pub fn filesize_or_zero(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

pub fn try_remove(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "Removed file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

pub fn try_rename(from: &Path, to: &Path) -> std::io::Result<()> {
    if from == to {
        return Ok(());
    }
    std::fs::rename(from, to)
}
