//! Eligibility module deciding whether a probed file should be re-encoded.
//!
//! Rules run in a fixed order and the first match wins: stream presence,
//! codec/bitrate signal, partial download, job lock, processed marker,
//! directory opt-out, and finally open handles from other processes.

use crate::markers::{self, LockState};
use crate::probe::MediaDescriptor;
use crate::config::{EligibilityConfig, ProbeConfig};
use log::{debug, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

const BYTES_PER_MB: f64 = 1_000_000.0;
const SECS_PER_HOUR: f64 = 3600.0;

/// Why a file will be re-encoded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EligibleBy {
    /// A stream uses a legacy codec.
    LegacyCodec,
    /// Already in the current codec but unusually large for its duration.
    Bitrate { mb_per_hour: f64 },
}

/// Why a file is left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoStreams,
    WrongCodec,
    BelowThreshold,
    PartialDownload,
    AlreadyConverting,
    AlreadyProcessed,
    Ignored,
    InUse,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            SkipReason::NoStreams => "no streams",
            SkipReason::WrongCodec => "wrong codec",
            SkipReason::BelowThreshold => "below threshold",
            SkipReason::PartialDownload => "partial download",
            SkipReason::AlreadyConverting => "already converting",
            SkipReason::AlreadyProcessed => "already processed",
            SkipReason::Ignored => "ignored",
            SkipReason::InUse => "in use",
        };
        f.write_str(text)
    }
}

/// Outcome of the filter for one file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EligibilityDecision {
    Eligible(EligibleBy),
    Skip(SkipReason),
}

impl EligibilityDecision {
    pub fn is_eligible(&self) -> bool {
        matches!(self, EligibilityDecision::Eligible(_))
    }
}

/// Detects other processes holding a file open.
pub trait AccessorCheck: Send + Sync {
    fn has_accessors(&self, path: &Path) -> bool;
}

/// Runs `lsof` and looks for the path in its output.
///
/// A tool that cannot start, or that fails without listing anything,
/// reports the file as in use.
#[derive(Debug, Clone)]
pub struct LsofAccessors {
    lsof_bin: PathBuf,
}

impl LsofAccessors {
    pub fn new(lsof_bin: PathBuf) -> Self {
        Self { lsof_bin }
    }
}

impl AccessorCheck for LsofAccessors {
    fn has_accessors(&self, path: &Path) -> bool {
        let output = match Command::new(&self.lsof_bin)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
        {
            Ok(output) => output,
            Err(e) => {
                warn!("open-files check unavailable ({}): {}", self.lsof_bin.display(), e);
                return true;
            }
        };
        // lsof exits non-zero on some unreadable entries but still lists the rest
        if !output.status.success() && output.stdout.is_empty() {
            warn!("{} exited with {} and listed nothing", self.lsof_bin.display(), output.status);
            return true;
        }
        let needle = path.to_string_lossy();
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .any(|line| line.contains(needle.as_ref()))
    }
}

/// Applies the eligibility rules.
pub struct EligibilityFilter {
    rules: EligibilityConfig,
    partial_suffix: String,
    accessors: Box<dyn AccessorCheck>,
}

impl EligibilityFilter {
    pub fn new(
        rules: EligibilityConfig,
        partial_suffix: String,
        accessors: Box<dyn AccessorCheck>,
    ) -> Self {
        Self {
            rules,
            partial_suffix,
            accessors,
        }
    }

    /// Filter backed by the real open-files tool.
    pub fn with_lsof(rules: EligibilityConfig, partial_suffix: String, probe: &ProbeConfig) -> Self {
        Self::new(
            rules,
            partial_suffix,
            Box::new(LsofAccessors::new(probe.lsof_bin.clone())),
        )
    }

    /// Decides whether `path` is a candidate. Total: never fails.
    pub fn decide(&self, path: &Path, descriptor: &MediaDescriptor) -> EligibilityDecision {
        use EligibilityDecision::Skip;

        if descriptor.streams.is_empty() {
            return Skip(SkipReason::NoStreams);
        }

        let eligible_by = match self.codec_signal(path, descriptor) {
            Ok(by) => by,
            Err(reason) => return Skip(reason),
        };

        if path.to_string_lossy().ends_with(&self.partial_suffix) {
            return Skip(SkipReason::PartialDownload);
        }

        if markers::lock_state(path) == LockState::Held {
            return Skip(SkipReason::AlreadyConverting);
        }

        match markers::migrate_legacy_processed(path) {
            Ok(true) => debug!("migrated processed marker for {}", path.display()),
            Ok(false) => {}
            Err(e) => warn!("could not migrate processed marker: {}", e),
        }

        if markers::has_processed_marker(path) {
            return Skip(SkipReason::AlreadyProcessed);
        }

        if path.parent().map(markers::has_ignore_marker).unwrap_or(false) {
            return Skip(SkipReason::Ignored);
        }

        if self.accessors.has_accessors(path) {
            return Skip(SkipReason::InUse);
        }

        EligibilityDecision::Eligible(eligible_by)
    }

    fn codec_signal(&self, path: &Path, descriptor: &MediaDescriptor) -> Result<EligibleBy, SkipReason> {
        if descriptor.has_codec(&self.rules.legacy_codecs) {
            return Ok(EligibleBy::LegacyCodec);
        }

        if !descriptor.has_codec(&self.rules.current_codecs) {
            return Err(SkipReason::WrongCodec);
        }

        if !self.rules.reencode_current {
            return Err(SkipReason::BelowThreshold);
        }

        let size_bytes = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        match megabytes_per_hour(size_bytes, descriptor.format.duration_secs) {
            Some(mb_per_hour) if mb_per_hour > self.rules.current_max_mb_per_hour => {
                Ok(EligibleBy::Bitrate { mb_per_hour })
            }
            _ => Err(SkipReason::BelowThreshold),
        }
    }
}

/// File size in MB divided by duration in hours. `None` for unknown or
/// zero duration.
pub fn megabytes_per_hour(size_bytes: u64, duration_secs: Option<f64>) -> Option<f64> {
    let duration = duration_secs.filter(|d| *d > 0.0)?;
    Some((size_bytes as f64 / BYTES_PER_MB) / (duration / SECS_PER_HOUR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{FormatInfo, StreamInfo};
    use proptest::prelude::*;
    use std::fs::{self, File};
    use tempfile::TempDir;

    struct NoAccessors;

    impl AccessorCheck for NoAccessors {
        fn has_accessors(&self, _path: &Path) -> bool {
            false
        }
    }

    struct AlwaysInUse;

    impl AccessorCheck for AlwaysInUse {
        fn has_accessors(&self, _path: &Path) -> bool {
            true
        }
    }

    fn make_descriptor(codecs: &[&str], duration_secs: Option<f64>) -> MediaDescriptor {
        MediaDescriptor {
            streams: codecs
                .iter()
                .enumerate()
                .map(|(index, codec)| StreamInfo {
                    index,
                    codec_name: Some(codec.to_string()),
                    codec_type: None,
                    frame_count: None,
                    frame_rate: None,
                })
                .collect(),
            format: FormatInfo { duration_secs },
        }
    }

    fn make_filter(accessors: Box<dyn AccessorCheck>) -> EligibilityFilter {
        EligibilityFilter::new(EligibilityConfig::default(), "partial~".to_string(), accessors)
    }

    fn make_media(dir: &TempDir, name: &str, size: u64) -> PathBuf {
        let path = dir.path().join(name);
        let file = File::create(&path).unwrap();
        file.set_len(size).unwrap();
        path
    }

    #[test]
    fn test_no_streams() {
        let temp_dir = TempDir::new().unwrap();
        let media = make_media(&temp_dir, "film.mkv", 10);
        let decision = make_filter(Box::new(NoAccessors)).decide(&media, &make_descriptor(&[], None));
        assert_eq!(decision, EligibilityDecision::Skip(SkipReason::NoStreams));
    }

    #[test]
    fn test_legacy_codec_is_eligible() {
        let temp_dir = TempDir::new().unwrap();
        let media = make_media(&temp_dir, "film.mkv", 10);
        let decision = make_filter(Box::new(NoAccessors))
            .decide(&media, &make_descriptor(&["h264", "aac"], Some(60.0)));
        assert_eq!(decision, EligibilityDecision::Eligible(EligibleBy::LegacyCodec));
    }

    #[test]
    fn test_other_codec_is_wrong_codec() {
        let temp_dir = TempDir::new().unwrap();
        let media = make_media(&temp_dir, "film.mkv", 10);
        let decision = make_filter(Box::new(NoAccessors))
            .decide(&media, &make_descriptor(&["av1", "opus"], Some(60.0)));
        assert_eq!(decision, EligibilityDecision::Skip(SkipReason::WrongCodec));
    }

    #[test]
    fn test_current_codec_bitrate_rule() {
        let temp_dir = TempDir::new().unwrap();
        // 2 MB over 6 seconds = 1200 MB/h
        let big = make_media(&temp_dir, "big.mkv", 2_000_000);
        // 1 MB over 6 seconds = 600 MB/h
        let small = make_media(&temp_dir, "small.mkv", 1_000_000);
        let filter = make_filter(Box::new(NoAccessors));
        let descriptor = make_descriptor(&["hevc"], Some(6.0));

        match filter.decide(&big, &descriptor) {
            EligibilityDecision::Eligible(EligibleBy::Bitrate { mb_per_hour }) => {
                assert!((mb_per_hour - 1200.0).abs() < 1e-6)
            }
            other => panic!("expected bitrate eligibility, got {:?}", other),
        }
        assert_eq!(
            filter.decide(&small, &descriptor),
            EligibilityDecision::Skip(SkipReason::BelowThreshold)
        );
    }

    #[test]
    fn test_current_codec_unknown_duration_is_below_threshold() {
        let temp_dir = TempDir::new().unwrap();
        let media = make_media(&temp_dir, "film.mkv", 50_000_000);
        let decision = make_filter(Box::new(NoAccessors)).decide(&media, &make_descriptor(&["h265"], None));
        assert_eq!(decision, EligibilityDecision::Skip(SkipReason::BelowThreshold));
    }

    #[test]
    fn test_current_codec_rule_disabled() {
        let temp_dir = TempDir::new().unwrap();
        let media = make_media(&temp_dir, "film.mkv", 50_000_000);
        let rules = EligibilityConfig {
            reencode_current: false,
            ..EligibilityConfig::default()
        };
        let filter = EligibilityFilter::new(rules, "partial~".to_string(), Box::new(NoAccessors));
        assert_eq!(
            filter.decide(&media, &make_descriptor(&["hevc"], Some(1.0))),
            EligibilityDecision::Skip(SkipReason::BelowThreshold)
        );
    }

    #[test]
    fn test_partial_download() {
        let temp_dir = TempDir::new().unwrap();
        let media = make_media(&temp_dir, "film.mkv.partial~", 10);
        let decision = make_filter(Box::new(NoAccessors)).decide(&media, &make_descriptor(&["h264"], None));
        assert_eq!(decision, EligibilityDecision::Skip(SkipReason::PartialDownload));
    }

    #[test]
    fn test_held_lock_blocks_but_retryable_does_not() {
        let temp_dir = TempDir::new().unwrap();
        let media = make_media(&temp_dir, "film.mkv", 10);
        let filter = make_filter(Box::new(NoAccessors));
        let descriptor = make_descriptor(&["h264"], None);

        markers::acquire_converting(&media).unwrap();
        assert_eq!(
            filter.decide(&media, &descriptor),
            EligibilityDecision::Skip(SkipReason::AlreadyConverting)
        );

        markers::mark_retryable(&media).unwrap();
        assert!(filter.decide(&media, &descriptor).is_eligible());
    }

    #[test]
    fn test_processed_marker_blocks_and_legacy_is_migrated() {
        let temp_dir = TempDir::new().unwrap();
        let media = make_media(&temp_dir, "film.mkv", 10);
        fs::write(markers::legacy_processed_path(&media), "10").unwrap();

        let decision = make_filter(Box::new(NoAccessors)).decide(&media, &make_descriptor(&["h264"], None));

        assert_eq!(decision, EligibilityDecision::Skip(SkipReason::AlreadyProcessed));
        assert!(!markers::legacy_processed_path(&media).exists());
        assert!(markers::processed_path(&media).exists());
    }

    #[test]
    fn test_ignore_marker() {
        let temp_dir = TempDir::new().unwrap();
        let media = make_media(&temp_dir, "film.mkv", 10);
        File::create(markers::ignore_path(temp_dir.path())).unwrap();

        let decision = make_filter(Box::new(NoAccessors)).decide(&media, &make_descriptor(&["h264"], None));
        assert_eq!(decision, EligibilityDecision::Skip(SkipReason::Ignored));
    }

    #[test]
    fn test_in_use() {
        let temp_dir = TempDir::new().unwrap();
        let media = make_media(&temp_dir, "film.mkv", 10);
        let decision = make_filter(Box::new(AlwaysInUse)).decide(&media, &make_descriptor(&["h264"], None));
        assert_eq!(decision, EligibilityDecision::Skip(SkipReason::InUse));
    }

    #[test]
    fn test_unavailable_lsof_means_in_use() {
        let temp_dir = TempDir::new().unwrap();
        let media = make_media(&temp_dir, "film.mkv", 10);
        let lsof = LsofAccessors::new(temp_dir.path().join("no-such-lsof"));

        assert!(lsof.has_accessors(&media));
        let decision = make_filter(Box::new(lsof)).decide(&media, &make_descriptor(&["h264"], None));
        assert_eq!(decision, EligibilityDecision::Skip(SkipReason::InUse));
    }

    #[cfg(unix)]
    #[test]
    fn test_lsof_output_is_searched_for_the_path() {
        use crate::testutil::write_script;

        let temp_dir = TempDir::new().unwrap();
        let media = make_media(&temp_dir, "film.mkv", 10);
        let listing = format!("echo 'vlc 4242 user 12r REG 8,1 10 99 {}'\n", media.display());
        let holding = write_script(temp_dir.path(), "lsof-holding", &listing);
        let idle = write_script(temp_dir.path(), "lsof-idle", "echo 'sshd 1 root cwd DIR 8,1 4096 2 /'\n");
        let broken = write_script(temp_dir.path(), "lsof-broken", "exit 1\n");

        assert!(LsofAccessors::new(holding).has_accessors(&media));
        assert!(!LsofAccessors::new(idle).has_accessors(&media));
        assert!(LsofAccessors::new(broken).has_accessors(&media));
    }

    #[test]
    fn test_codec_rule_runs_before_marker_rules() {
        let temp_dir = TempDir::new().unwrap();
        let media = make_media(&temp_dir, "film.mkv", 10);
        markers::acquire_converting(&media).unwrap();

        let decision = make_filter(Box::new(NoAccessors)).decide(&media, &make_descriptor(&["vp9"], None));
        assert_eq!(decision, EligibilityDecision::Skip(SkipReason::WrongCodec));
    }

    #[test]
    fn test_megabytes_per_hour() {
        assert_eq!(megabytes_per_hour(1_000_000_000, Some(3600.0)), Some(1000.0));
        assert_eq!(megabytes_per_hour(1_000_000_000, Some(0.0)), None);
        assert_eq!(megabytes_per_hour(1_000_000_000, None), None);
    }

    // A pre-existing held lock or processed marker always blocks an otherwise eligible file.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(30))]

        #[test]
        fn prop_markers_always_block(
            name in "[a-zA-Z0-9_-]{1,16}",
            use_lock in proptest::bool::ANY,
        ) {
            let temp_dir = TempDir::new().unwrap();
            let media = make_media(&temp_dir, &format!("{}.mkv", name), 10);
            if use_lock {
                markers::acquire_converting(&media).unwrap();
            } else {
                markers::write_processed(&media, 10).unwrap();
            }

            let decision = make_filter(Box::new(NoAccessors)).decide(&media, &make_descriptor(&["h264"], None));
            prop_assert!(!decision.is_eligible());
        }
    }
}
