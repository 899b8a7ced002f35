//! Run summary
//!
//! Aggregate counters for one sweep, serialisable to JSON for `--json`.

use crate::commit::{CommitOutcome, OutcomeKind};
use humansize::{format_size, WINDOWS};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Counters collected over one walk of the library
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub directories_seen: u64,
    pub directories_ignored: u64,
    pub files_seen: u64,
    pub skipped: u64,
    pub probe_failures: u64,
    pub replaced: u64,
    pub kept_original: u64,
    pub interrupted: u64,
    pub failed: u64,
    /// Original bytes of replaced files
    pub bytes_before: u64,
    /// Resulting bytes of replaced files
    pub bytes_after: u64,
    /// The walk ended on a stop request
    pub stopped_early: bool,
}

impl RunSummary {
    pub fn record_outcome(&mut self, outcome: &CommitOutcome) {
        match outcome.kind {
            OutcomeKind::Replaced => {
                self.replaced += 1;
                self.bytes_before += outcome.original_size;
                self.bytes_after += outcome.resulting_size.unwrap_or(0);
            }
            OutcomeKind::KeptOriginal => self.kept_original += 1,
            OutcomeKind::Interrupted => self.interrupted += 1,
            OutcomeKind::Failed => self.failed += 1,
        }
    }

    /// Number of files an encoder was started for
    pub fn encodes(&self) -> u64 {
        self.replaced + self.kept_original + self.interrupted + self.failed
    }

    /// Bytes freed by replacements
    pub fn bytes_saved(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} files in {} directories ({} ignored): {} replaced, {} kept, {} interrupted, {} failed, {} skipped, {} unreadable; saved {}",
            self.files_seen,
            self.directories_seen,
            self.directories_ignored,
            self.replaced,
            self.kept_original,
            self.interrupted,
            self.failed,
            self.skipped,
            self.probe_failures,
            format_size(self.bytes_saved(), WINDOWS)
        )
    }
}
