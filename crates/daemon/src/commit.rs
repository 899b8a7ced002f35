//! Commit module deciding which file ends up at the original path.
//!
//! After a finished encode the produced file is compared against the
//! original. A smaller, plausibly complete output replaces the original in a
//! single rename; anything else leaves the original untouched.

use crate::markers::{self, MarkerError};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while committing a job.
#[derive(Debug, Error)]
pub enum CommitError {
    /// Produced file could not be inspected.
    #[error("cannot inspect {path}: {source}")]
    Inspect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Produced file could not be removed.
    #[error("cannot remove {path}: {source}")]
    RemoveProduced {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Produced file could not be moved over the original.
    #[error("cannot replace {path}: {source}")]
    Rename {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The path does not hold the expected file after replacement.
    #[error("replacement of {0} could not be verified")]
    Verify(PathBuf),

    /// Marker update failed.
    #[error(transparent)]
    Marker(#[from] MarkerError),
}

/// Final state of one file after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// The produced file now lives at the original path.
    Replaced,
    /// The original was kept; a `.processed` marker records the decision.
    KeptOriginal,
    /// No verdict; the job lock is left for a retry.
    Interrupted,
    /// The job failed; the original is untouched.
    Failed,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Replaced => "replaced",
            OutcomeKind::KeptOriginal => "kept original",
            OutcomeKind::Interrupted => "interrupted",
            OutcomeKind::Failed => "failed",
        }
    }
}

/// Sizes and verdict for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommitOutcome {
    pub original_size: u64,
    /// Size of the produced file, when one was measured.
    pub resulting_size: Option<u64>,
    pub kind: OutcomeKind,
}

impl CommitOutcome {
    fn new(original_size: u64, resulting_size: Option<u64>, kind: OutcomeKind) -> Self {
        Self {
            original_size,
            resulting_size,
            kind,
        }
    }
}

/// Result of comparing produced and original sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeVerdict {
    /// Smaller and at least the minimum viable size.
    Replace,
    /// Not smaller than the original.
    NotSmaller,
    /// Smaller, but too small to be a complete encode.
    TooSmall,
}

/// Compares sizes.
///
/// `produced >= original` is `NotSmaller`, `produced < min_viable` is
/// `TooSmall`, everything else is `Replace`.
pub fn check_size(original: u64, produced: u64, min_viable: u64) -> SizeVerdict {
    if produced >= original {
        SizeVerdict::NotSmaller
    } else if produced < min_viable {
        SizeVerdict::TooSmall
    } else {
        SizeVerdict::Replace
    }
}

fn remove_produced(produced: &Path) -> Result<(), CommitError> {
    match fs::remove_file(produced) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(CommitError::RemoveProduced {
            path: produced.to_path_buf(),
            source,
        }),
    }
}

/// Commits a completed encode.
///
/// Both a replacement and a kept original end with a `.processed` marker:
/// the produced size after a replace, the original size otherwise. The caller holds the `.converting` lock for `media`.
pub fn commit(
    media: &Path,
    produced: &Path,
    original_size: u64,
    min_viable: u64,
) -> Result<CommitOutcome, CommitError> {
    let produced_size = fs::metadata(produced)
        .map_err(|source| CommitError::Inspect {
            path: produced.to_path_buf(),
            source,
        })?
        .len();

    match check_size(original_size, produced_size, min_viable) {
        SizeVerdict::NotSmaller => {
            remove_produced(produced)?;
            markers::write_processed(media, original_size)?;
            markers::release_converting(media)?;
            Ok(CommitOutcome::new(
                original_size,
                Some(produced_size),
                OutcomeKind::KeptOriginal,
            ))
        }
        SizeVerdict::TooSmall => {
            remove_produced(produced)?;
            markers::mark_retryable(media)?;
            Ok(CommitOutcome::new(
                original_size,
                Some(produced_size),
                OutcomeKind::Interrupted,
            ))
        }
        SizeVerdict::Replace => {
            // rename(2) swaps the directory entry atomically; the path is never empty
            fs::rename(produced, media).map_err(|source| CommitError::Rename {
                path: media.to_path_buf(),
                source,
            })?;

            let in_place = fs::metadata(media).map(|m| m.len()).ok();
            if in_place != Some(produced_size) {
                return Err(CommitError::Verify(media.to_path_buf()));
            }

            // the replacement may still be a current codec above the bitrate limit
            markers::write_processed(media, produced_size)?;
            markers::release_converting(media)?;
            Ok(CommitOutcome::new(
                original_size,
                Some(produced_size),
                OutcomeKind::Replaced,
            ))
        }
    }
}

/// Cleans up after an operator-requested stop. The lock stays, flagged
/// for retry.
pub fn discard_interrupted(
    media: &Path,
    produced: &Path,
    original_size: u64,
) -> Result<CommitOutcome, CommitError> {
    remove_produced(produced)?;
    markers::mark_retryable(media)?;
    Ok(CommitOutcome::new(original_size, None, OutcomeKind::Interrupted))
}

/// Cleans up after the output outgrew the original mid-encode. Recorded
/// like a rejected commit so later runs skip the file.
pub fn discard_grown(
    media: &Path,
    produced: &Path,
    original_size: u64,
    sampled_size: u64,
) -> Result<CommitOutcome, CommitError> {
    remove_produced(produced)?;
    markers::write_processed(media, original_size)?;
    markers::release_converting(media)?;
    Ok(CommitOutcome::new(
        original_size,
        Some(sampled_size),
        OutcomeKind::KeptOriginal,
    ))
}

/// Cleans up after an encoder failure. The file is retried on the next run.
pub fn discard_failed(
    media: &Path,
    produced: &Path,
    original_size: u64,
) -> Result<CommitOutcome, CommitError> {
    remove_produced(produced)?;
    markers::release_converting(media)?;
    Ok(CommitOutcome::new(original_size, None, OutcomeKind::Failed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markers::LockState;
    use proptest::prelude::*;
    use std::fs::File;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        media: PathBuf,
        produced: PathBuf,
    }

    fn fixture(original: &[u8], produced: &[u8]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let media = dir.path().join("film.mkv");
        let produced_path = dir.path().join("film.mkv.new.mkv");
        fs::write(&media, original).unwrap();
        fs::write(&produced_path, produced).unwrap();
        markers::acquire_converting(&media).unwrap();
        Fixture {
            _dir: dir,
            media,
            produced: produced_path,
        }
    }

    fn sparse_fixture(original: u64, produced: u64) -> Fixture {
        let dir = TempDir::new().unwrap();
        let media = dir.path().join("film.mkv");
        let produced_path = dir.path().join("film.mkv.new.mkv");
        File::create(&media).unwrap().set_len(original).unwrap();
        File::create(&produced_path).unwrap().set_len(produced).unwrap();
        markers::acquire_converting(&media).unwrap();
        Fixture {
            _dir: dir,
            media,
            produced: produced_path,
        }
    }

    #[test]
    fn test_smaller_output_replaces_original() {
        let f = fixture(&[1u8; 1000], &[2u8; 600]);

        let outcome = commit(&f.media, &f.produced, 1000, 100).unwrap();

        assert_eq!(outcome.kind, OutcomeKind::Replaced);
        assert_eq!(outcome.resulting_size, Some(600));
        assert_eq!(fs::read(&f.media).unwrap(), vec![2u8; 600]);
        assert!(!f.produced.exists());
        assert_eq!(markers::lock_state(&f.media), LockState::Free);
        assert_eq!(
            fs::read_to_string(markers::processed_path(&f.media)).unwrap(),
            "600"
        );
    }

    #[test]
    fn test_larger_output_keeps_original() {
        let f = fixture(&[1u8; 500], &[2u8; 520]);

        let outcome = commit(&f.media, &f.produced, 500, 100).unwrap();

        assert_eq!(outcome.kind, OutcomeKind::KeptOriginal);
        assert_eq!(fs::read(&f.media).unwrap(), vec![1u8; 500]);
        assert!(!f.produced.exists());
        assert_eq!(markers::lock_state(&f.media), LockState::Free);
        assert_eq!(
            fs::read_to_string(markers::processed_path(&f.media)).unwrap(),
            "500"
        );
    }

    #[test]
    fn test_equal_size_keeps_original() {
        let f = fixture(&[1u8; 500], &[2u8; 500]);
        let outcome = commit(&f.media, &f.produced, 500, 100).unwrap();
        assert_eq!(outcome.kind, OutcomeKind::KeptOriginal);
        assert_eq!(fs::read(&f.media).unwrap(), vec![1u8; 500]);
    }

    #[test]
    fn test_truncated_output_is_interrupted() {
        let f = fixture(&[1u8; 1000], &[2u8; 10]);

        let outcome = commit(&f.media, &f.produced, 1000, 100).unwrap();

        assert_eq!(outcome.kind, OutcomeKind::Interrupted);
        assert_eq!(fs::read(&f.media).unwrap(), vec![1u8; 1000]);
        assert_eq!(markers::lock_state(&f.media), LockState::Retryable);
        assert!(!markers::has_processed_marker(&f.media));
    }

    #[test]
    fn test_missing_output_is_an_error() {
        let f = fixture(&[1u8; 1000], &[]);
        fs::remove_file(&f.produced).unwrap();

        let result = commit(&f.media, &f.produced, 1000, 100);

        assert!(matches!(result, Err(CommitError::Inspect { .. })));
        assert_eq!(fs::read(&f.media).unwrap(), vec![1u8; 1000]);
    }

    #[test]
    fn test_scenario_one_gigabyte_to_six_hundred_megabytes() {
        let f = sparse_fixture(1_000_000_000, 600_000_000);

        let outcome = commit(&f.media, &f.produced, 1_000_000_000, 1_000_000).unwrap();

        assert_eq!(outcome.kind, OutcomeKind::Replaced);
        assert_eq!(fs::metadata(&f.media).unwrap().len(), 600_000_000);
        assert!(!markers::converting_path(&f.media).exists());
        assert!(!f.produced.exists());
    }

    #[test]
    fn test_scenario_five_hundred_megabytes_grows() {
        let f = sparse_fixture(500_000_000, 520_000_000);

        let outcome = commit(&f.media, &f.produced, 500_000_000, 1_000_000).unwrap();

        assert_eq!(outcome.kind, OutcomeKind::KeptOriginal);
        assert_eq!(fs::metadata(&f.media).unwrap().len(), 500_000_000);
        assert_eq!(
            fs::read_to_string(markers::processed_path(&f.media)).unwrap(),
            "500000000"
        );
    }

    #[test]
    fn test_discard_interrupted_leaves_retryable_lock() {
        let f = fixture(&[1u8; 100], &[2u8; 40]);

        let outcome = discard_interrupted(&f.media, &f.produced, 100).unwrap();

        assert_eq!(outcome.kind, OutcomeKind::Interrupted);
        assert!(!f.produced.exists());
        assert_eq!(fs::read(&f.media).unwrap(), vec![1u8; 100]);
        assert_eq!(markers::lock_state(&f.media), LockState::Retryable);
    }

    #[test]
    fn test_discard_grown_records_processed() {
        let f = fixture(&[1u8; 100], &[2u8; 140]);

        let outcome = discard_grown(&f.media, &f.produced, 100, 140).unwrap();

        assert_eq!(outcome.kind, OutcomeKind::KeptOriginal);
        assert_eq!(outcome.resulting_size, Some(140));
        assert!(!f.produced.exists());
        assert_eq!(markers::lock_state(&f.media), LockState::Free);
        assert!(markers::has_processed_marker(&f.media));
    }

    #[test]
    fn test_discard_failed_allows_retry() {
        let f = fixture(&[1u8; 100], &[2u8; 10]);

        let outcome = discard_failed(&f.media, &f.produced, 100).unwrap();

        assert_eq!(outcome.kind, OutcomeKind::Failed);
        assert!(!f.produced.exists());
        assert_eq!(markers::lock_state(&f.media), LockState::Free);
        assert!(!markers::has_processed_marker(&f.media));
    }

    #[test]
    fn test_discard_tolerates_missing_output() {
        let f = fixture(&[1u8; 100], &[]);
        fs::remove_file(&f.produced).unwrap();
        assert!(discard_failed(&f.media, &f.produced, 100).is_ok());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_size_verdict(
            original in 0u64..=u64::MAX / 2,
            produced in 0u64..=u64::MAX / 2,
            min_viable in 0u64..1_000_000_000,
        ) {
            match check_size(original, produced, min_viable) {
                SizeVerdict::NotSmaller => prop_assert!(produced >= original),
                SizeVerdict::TooSmall => {
                    prop_assert!(produced < original);
                    prop_assert!(produced < min_viable);
                }
                SizeVerdict::Replace => {
                    prop_assert!(produced < original);
                    prop_assert!(produced >= min_viable);
                }
            }
        }
    }
}
