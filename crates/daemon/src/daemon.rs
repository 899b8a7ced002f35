//! Sweep orchestration
//!
//! Consumes the walker's visit events and runs each file through
//! probe -> eligibility -> supervisor -> commit, one file at a time.
//! Per-file failures become a [`FileReport`]; only an unreadable root ends
//! the sweep with an error.

use crate::cancel::StopSignal;
use crate::commit::{self, CommitOutcome, OutcomeKind};
use crate::config::Config;
use crate::eligibility::{EligibilityDecision, EligibilityFilter, SkipReason};
use crate::markers::MarkerError;
use crate::notify::{self, human_size, size_percent, NotificationSink};
use crate::probe::{probe_file, MediaDescriptor, ProbeError};
use crate::startup::{run_startup_checks, StartupError};
use crate::summary::RunSummary;
use crate::supervisor::{EncodeEnd, EncodeError, Supervisor};
use crate::walker::{TreeWalk, Visit};
use log::{debug, error, info, warn};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The library root cannot be listed
    #[error("cannot read library root {path}: {source}")]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),
}

/// What happened to one file during a sweep
#[derive(Debug, Clone, PartialEq)]
pub enum FileReport {
    /// Not a candidate
    Skipped(SkipReason),
    /// The prober could not describe the file
    ProbeFailed(String),
    /// An encode ran and reached an outcome
    Processed(CommitOutcome),
    /// The commit step failed; the file is left for the operator
    Error(String),
}

/// Runs sweeps over the configured library
pub struct Daemon {
    config: Arc<Config>,
    filter: Arc<EligibilityFilter>,
    supervisor: Supervisor,
    sink: Arc<dyn NotificationSink>,
    stop: StopSignal,
}

impl Daemon {
    /// Runs startup checks, then builds the daemon from `config`.
    pub fn new(config: Config, stop: StopSignal) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        Ok(Self::new_without_checks(config, stop))
    }

    /// Builds the daemon without touching the external tools.
    pub fn new_without_checks(config: Config, stop: StopSignal) -> Self {
        let filter = EligibilityFilter::with_lsof(
            config.eligibility.clone(),
            config.library.partial_suffix.clone(),
            &config.probe,
        );
        let sink: Arc<dyn NotificationSink> = Arc::from(notify::sink_from_config(&config.notify));
        Self::with_parts(config, filter, sink, stop)
    }

    /// Builds the daemon from explicit collaborators.
    pub fn with_parts(
        config: Config,
        filter: EligibilityFilter,
        sink: Arc<dyn NotificationSink>,
        stop: StopSignal,
    ) -> Self {
        let supervisor = Supervisor::new(config.encoder.clone(), stop.clone());
        Self {
            config: Arc::new(config),
            filter: Arc::new(filter),
            supervisor,
            sink,
            stop,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Walks the library once.
    pub async fn run(&self) -> Result<RunSummary, DaemonError> {
        let root = self.config.library.root_path.clone();
        let walk = TreeWalk::new(&root)
            .map_err(|source| DaemonError::RootUnreadable {
                path: root.clone(),
                source,
            })?
            .with_stop(self.stop.clone());

        info!("scanning {}", root.display());
        self.post(&notify::started_message()).await;

        let mut summary = RunSummary::default();
        for visit in walk {
            match visit {
                Visit::Directory { path, depth, ignored } => {
                    summary.directories_seen += 1;
                    if ignored {
                        summary.directories_ignored += 1;
                        info!("{} [ignored]", path.display());
                    } else {
                        debug!("entering {} (depth {})", path.display(), depth);
                    }
                }
                Visit::File { path, .. } => {
                    summary.files_seen += 1;
                    let report = self.process_file(&path).await;
                    tally(&mut summary, &report);
                }
            }
        }

        summary.stopped_early = self.stop.is_stopping();
        if summary.stopped_early {
            info!("sweep stopped early");
        }
        info!("{}", summary);
        self.post(&notify::stopped_message(&summary)).await;
        Ok(summary)
    }

    /// Probes a file off the async runtime.
    pub async fn probe(&self, path: &Path) -> Result<MediaDescriptor, ProbeError> {
        let ffprobe = self.config.probe.ffprobe_bin.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || probe_file(&ffprobe, &path))
            .await
            .map_err(|e| ProbeError::Failed(format!("probe task failed: {}", e)))?
    }

    /// Probes a file and applies the eligibility rules without encoding.
    pub async fn check(&self, path: &Path) -> Result<EligibilityDecision, ProbeError> {
        let descriptor = self.probe(path).await?;
        Ok(self.decide(path, descriptor).await)
    }

    async fn decide(&self, path: &Path, descriptor: MediaDescriptor) -> EligibilityDecision {
        let filter = self.filter.clone();
        let owned = path.to_path_buf();
        match tokio::task::spawn_blocking(move || filter.decide(&owned, &descriptor)).await {
            Ok(decision) => decision,
            Err(e) => {
                // lsof or a marker read panicked; skipping is the safe answer
                error!("eligibility check for {} failed: {}", path.display(), e);
                EligibilityDecision::Skip(SkipReason::InUse)
            }
        }
    }

    /// Runs one file through the whole pipeline.
    pub async fn process_file(&self, path: &Path) -> FileReport {
        let descriptor = match self.probe(path).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!("{}: {}", path.display(), e);
                return FileReport::ProbeFailed(e.to_string());
            }
        };
        let frame_target = descriptor.frame_target();

        let by = match self.decide(path, descriptor).await {
            EligibilityDecision::Eligible(by) => by,
            EligibilityDecision::Skip(reason) => {
                debug!("{}: {}", path.display(), reason);
                return FileReport::Skipped(reason);
            }
        };

        let name = display_name(path);
        info!("{}: converting ({:?})", path.display(), by);
        let start_percent = frame_target.map(|_| 0.0);
        self.post(&notify::progress_message(&name, start_percent)).await;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let sink = self.sink.clone();
        let updater = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(e) = sink.update(&text).await {
                    warn!("progress notification failed: {}", e);
                }
            }
        });

        let mut job = self.supervisor.job_for(path, frame_target);
        let progress_name = name.clone();
        let ended = self
            .supervisor
            .run(&mut job, |job, percent| {
                info!("job {} at {:.0}% ({} frames)", job.id, percent, job.progress.frames_done());
                let _ = tx.send(notify::progress_message(&progress_name, Some(percent)));
            })
            .await;
        drop(tx);
        if let Err(e) = updater.await {
            warn!("progress notifier ended abnormally: {}", e);
        }

        let committed = match ended {
            Ok(EncodeEnd::Completed) => commit::commit(
                path,
                &job.output_path,
                job.original_size,
                self.config.encoder.min_output_bytes,
            ),
            Ok(EncodeEnd::Grown { sampled_size }) => {
                commit::discard_grown(path, &job.output_path, job.original_size, sampled_size)
            }
            Ok(EncodeEnd::Interrupted) => {
                commit::discard_interrupted(path, &job.output_path, job.original_size)
            }
            Err(EncodeError::Lock(MarkerError::AlreadyLocked(_))) => {
                warn!("{}: locked by another job", path.display());
                let reason = SkipReason::AlreadyConverting;
                self.update(&notify::skipped_message(&name, reason)).await;
                return FileReport::Skipped(reason);
            }
            Err(EncodeError::Lock(e)) => {
                // the lock was never ours, so there is nothing to clean up
                error!("{}: {}", path.display(), e);
                self.update(&notify::failed_message(&name, &e)).await;
                return FileReport::Error(e.to_string());
            }
            Err(e) => {
                error!("{}: {}", path.display(), e);
                commit::discard_failed(path, &job.output_path, job.original_size)
            }
        };

        match committed {
            Ok(outcome) => {
                log_outcome(path, &outcome);
                self.update(&notify::outcome_message(&name, &outcome)).await;
                FileReport::Processed(outcome)
            }
            Err(e) => {
                error!("{}: commit failed: {}", path.display(), e);
                self.update(&notify::failed_message(&name, &e)).await;
                FileReport::Error(e.to_string())
            }
        }
    }

    async fn post(&self, text: &str) {
        if let Err(e) = self.sink.post(text).await {
            warn!("notification failed: {}", e);
        }
    }

    async fn update(&self, text: &str) {
        if let Err(e) = self.sink.update(text).await {
            warn!("notification failed: {}", e);
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn log_outcome(path: &Path, outcome: &CommitOutcome) {
    match (outcome.kind, outcome.resulting_size) {
        (OutcomeKind::Replaced | OutcomeKind::KeptOriginal, Some(resulting)) => info!(
            "{}: {} -> {} ({}%) {}",
            path.display(),
            human_size(outcome.original_size),
            human_size(resulting),
            size_percent(outcome.original_size, resulting),
            outcome.kind.as_str()
        ),
        _ => info!("{}: {}", path.display(), outcome.kind.as_str()),
    }
}

fn tally(summary: &mut RunSummary, report: &FileReport) {
    match report {
        FileReport::Skipped(_) => summary.skipped += 1,
        FileReport::ProbeFailed(_) => summary.probe_failures += 1,
        FileReport::Processed(outcome) => summary.record_outcome(outcome),
        FileReport::Error(_) => summary.failed += 1,
    }
}
