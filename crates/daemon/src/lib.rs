//! Library Transcoder
//!
//! Walks a media library, picks files worth re-encoding, supervises one
//! ffmpeg process at a time and commits the result only when it is smaller.
//! All persisted state lives in sentinel files next to the media.

pub mod cancel;
pub mod commit;
pub mod daemon;
pub mod eligibility;
pub mod encode;
pub mod markers;
pub mod notify;
pub mod probe;
pub mod startup;
pub mod summary;
pub mod supervisor;
pub mod walker;

#[cfg(all(test, unix))]
pub(crate) mod testutil;

pub use library_transcoder_config as config;
pub use library_transcoder_config::Config;
pub use cancel::{install_termination_handler, StopSignal};
pub use commit::{check_size, CommitError, CommitOutcome, OutcomeKind, SizeVerdict};
pub use daemon::{Daemon, DaemonError, FileReport};
pub use eligibility::{
    AccessorCheck, EligibilityDecision, EligibilityFilter, EligibleBy, LsofAccessors, SkipReason,
};
pub use encode::{build_ffmpeg_command, output_path_for, EncodeParams};
pub use markers::{LockState, MarkerError};
pub use notify::{sink_from_config, NotificationSink, NotifyError, NullSink, TelegramSink};
pub use probe::{probe_file, MediaDescriptor, ProbeError};
pub use startup::{run_startup_checks, StartupError};
pub use summary::RunSummary;
pub use supervisor::{EncodeEnd, EncodeError, JobState, Supervisor, TranscodeJob};
pub use walker::{TreeWalk, Visit};
