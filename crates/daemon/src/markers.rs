//! Sentinel marker module.
//!
//! Markers are the only persisted state. They live next to the media file:
//!
//! - `<name>.converting` - job lock. Empty while a job holds it, `interrupted`
//!   once the job stopped without a verdict and may be retried.
//! - `.<name>.processed` - the file has been through an encode; holds the
//!   size in bytes of whatever now sits at the path.
//! - `<name>.processed` - older, visible spelling of the above, migrated on sight.
//! - `<dir>/.transcodeignore` - opt the whole directory out.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Suffix of the job lock marker.
pub const CONVERTING_SUFFIX: &str = ".converting";
/// Suffix of the rejected-evaluation marker.
pub const PROCESSED_SUFFIX: &str = ".processed";
/// Directory-scoped opt-out marker.
pub const IGNORE_MARKER: &str = ".transcodeignore";
/// Content of a lock left behind for retry.
const RETRYABLE: &str = "interrupted";

/// Error type for marker operations.
#[derive(Debug, Error)]
pub enum MarkerError {
    /// Another job holds the lock.
    #[error("{0} is already locked by another job")]
    AlreadyLocked(PathBuf),

    /// Filesystem error on a marker file.
    #[error("marker {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl MarkerError {
    fn io(path: &Path, source: io::Error) -> Self {
        MarkerError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// State of the `.converting` marker for a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// No marker.
    Free,
    /// A job is (or was, before a crash) running.
    Held,
    /// A previous job was interrupted; the file may be picked up again.
    Retryable,
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut out = path.as_os_str().to_owned();
    out.push(suffix);
    PathBuf::from(out)
}

/// `/media/film.mkv` -> `/media/film.mkv.converting`
pub fn converting_path(media: &Path) -> PathBuf {
    with_suffix(media, CONVERTING_SUFFIX)
}

/// `/media/film.mkv` -> `/media/.film.mkv.processed`
pub fn processed_path(media: &Path) -> PathBuf {
    let name = media
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let hidden = format!(".{}{}", name, PROCESSED_SUFFIX);
    match media.parent() {
        Some(dir) => dir.join(hidden),
        None => PathBuf::from(hidden),
    }
}

/// `/media/film.mkv` -> `/media/film.mkv.processed`
pub fn legacy_processed_path(media: &Path) -> PathBuf {
    with_suffix(media, PROCESSED_SUFFIX)
}

/// `/media/shows` -> `/media/shows/.transcodeignore`
pub fn ignore_path(dir: &Path) -> PathBuf {
    dir.join(IGNORE_MARKER)
}

/// Whether `dir` carries an ignore marker.
pub fn has_ignore_marker(dir: &Path) -> bool {
    ignore_path(dir).is_file()
}

/// Whether a hidden `.processed` marker exists.
pub fn has_processed_marker(media: &Path) -> bool {
    processed_path(media).is_file()
}

/// Whether a file name belongs to a sentinel rather than to media.
pub fn is_marker_name(name: &str) -> bool {
    name == IGNORE_MARKER || name.ends_with(CONVERTING_SUFFIX) || name.ends_with(PROCESSED_SUFFIX)
}

/// Inspects the `.converting` marker.
pub fn lock_state(media: &Path) -> LockState {
    let path = converting_path(media);
    match fs::read_to_string(&path) {
        Ok(content) if content.trim() == RETRYABLE => LockState::Retryable,
        Ok(_) => LockState::Held,
        Err(e) if e.kind() == io::ErrorKind::NotFound => LockState::Free,
        // Present but unreadable: treat as held
        Err(_) if path.exists() => LockState::Held,
        Err(_) => LockState::Free,
    }
}

/// Takes the job lock.
///
/// A free lock is created exclusively; a retryable one is reclaimed by
/// truncating it. A held lock is an error.
pub fn acquire_converting(media: &Path) -> Result<(), MarkerError> {
    let path = converting_path(media);
    match OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            if lock_state(media) == LockState::Retryable {
                File::create(&path).map_err(|e| MarkerError::io(&path, e))?;
                Ok(())
            } else {
                Err(MarkerError::AlreadyLocked(media.to_path_buf()))
            }
        }
        Err(e) => Err(MarkerError::io(&path, e)),
    }
}

/// Leaves the lock in place but flags it for retry on the next run.
pub fn mark_retryable(media: &Path) -> Result<(), MarkerError> {
    let path = converting_path(media);
    let mut file = File::create(&path).map_err(|e| MarkerError::io(&path, e))?;
    writeln!(file, "{}", RETRYABLE).map_err(|e| MarkerError::io(&path, e))?;
    Ok(())
}

/// Removes the lock. A missing lock is not an error.
pub fn release_converting(media: &Path) -> Result<(), MarkerError> {
    let path = converting_path(media);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(MarkerError::io(&path, e)),
    }
}

/// Records a finished evaluation with the size of the file left in place.
pub fn write_processed(media: &Path, size_bytes: u64) -> Result<(), MarkerError> {
    let path = processed_path(media);
    fs::write(&path, size_bytes.to_string()).map_err(|e| MarkerError::io(&path, e))
}

/// Moves a visible `<name>.processed` marker to the hidden spelling.
///
/// Returns `true` if a marker was migrated.
pub fn migrate_legacy_processed(media: &Path) -> Result<bool, MarkerError> {
    let legacy = legacy_processed_path(media);
    if !legacy.is_file() {
        return Ok(false);
    }
    let target = processed_path(media);
    fs::rename(&legacy, &target).map_err(|e| MarkerError::io(&legacy, e))?;
    Ok(true)
}
