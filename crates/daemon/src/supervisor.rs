//! Encode supervisor
//!
//! Runs one encoder process per job and drives the job through
//! `Pending -> Converting -> {Committing | Aborted | Interrupted}`.
//! The supervisor only decides how the encode ended; which file survives is
//! up to [`crate::commit`].

use crate::cancel::StopSignal;
use crate::config::EncoderConfig;
use crate::encode::{build_ffmpeg_command, parse_frame_line, EncodeParams, OutputLines, ProgressTracker};
use crate::markers::{self, MarkerError};
use log::{debug, info, trace, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use uuid::Uuid;

/// Error type for encoder supervision
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The job lock could not be taken
    #[error("cannot lock job: {0}")]
    Lock(#[from] MarkerError),

    /// The input could not be inspected
    #[error("cannot read size of {path}: {source}")]
    Inspect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Output left by an earlier run could not be removed
    #[error("cannot remove stale output {path}: {source}")]
    StaleOutput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The encoder could not be started
    #[error("failed to spawn encoder: {0}")]
    Spawn(#[source] io::Error),

    /// Reading the progress stream or waiting on the process failed
    #[error("encoder I/O failed: {0}")]
    Stream(#[source] io::Error),

    /// The encoder exited unsuccessfully
    #[error("encoder exited with {}", .0.map(|c| c.to_string()).unwrap_or_else(|| "a signal".into()))]
    EncoderFailed(Option<i32>),

    /// The encoder exited cleanly without producing output
    #[error("encoder produced no output at {0}")]
    OutputMissing(PathBuf),
}

/// Job state in the supervisor state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Created, lock not yet taken
    Pending,
    /// Encoder running
    Converting,
    /// Encoder finished; ready for the commit decision
    Committing,
    /// Stopped by the supervisor itself (growth or failure)
    Aborted,
    /// Stopped on operator request
    Interrupted,
}

impl JobState {
    pub fn as_str(&self) -> &str {
        match self {
            JobState::Pending => "pending",
            JobState::Converting => "converting",
            JobState::Committing => "committing",
            JobState::Aborted => "aborted",
            JobState::Interrupted => "interrupted",
        }
    }
}

/// One encode of one file, alive for a single supervisor call
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    /// Unique job identifier, used in log lines
    pub id: Uuid,
    /// Path to the original media file
    pub input_path: PathBuf,
    /// Sibling path the encoder writes to
    pub output_path: PathBuf,
    /// Original size in bytes, recorded when the job starts converting
    pub original_size: u64,
    /// Expected number of frames, if the probe could tell
    pub frame_target: Option<u64>,
    /// Frames encoded so far
    pub progress: ProgressTracker,
    /// Current state of the job
    pub state: JobState,
}

impl TranscodeJob {
    pub fn new(input_path: PathBuf, output_path: PathBuf, frame_target: Option<u64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            input_path,
            output_path,
            original_size: 0,
            frame_target,
            progress: ProgressTracker::new(),
            state: JobState::Pending,
        }
    }

    /// Completion percentage, when the frame target is known
    pub fn percent(&self) -> Option<f64> {
        self.progress.percent_of(self.frame_target)
    }
}

/// How an encode that did not error ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeEnd {
    /// Encoder exited successfully and the output exists
    Completed,
    /// Output outgrew the original; encoder was killed
    Grown { sampled_size: u64 },
    /// Stop requested; encoder was killed
    Interrupted,
}

/// Supervises encoder processes, one job at a time
pub struct Supervisor {
    encoder: EncoderConfig,
    stop: StopSignal,
}

impl Supervisor {
    pub fn new(encoder: EncoderConfig, stop: StopSignal) -> Self {
        Self { encoder, stop }
    }

    /// Creates a job for `input` writing to the configured container.
    pub fn job_for(&self, input: &Path, frame_target: Option<u64>) -> TranscodeJob {
        let params = EncodeParams::new(input.to_path_buf(), self.encoder.clone());
        TranscodeJob::new(params.input_path, params.output_path, frame_target)
    }

    /// Runs the encoder for `job`.
    ///
    /// `on_progress` is called with the completion percentage every time it
    /// crosses another `progress_step_percent`. On return the job is in
    /// `Committing`, `Aborted` or `Interrupted`; the `.converting` lock is
    /// held unless taking it failed.
    pub async fn run<F>(&self, job: &mut TranscodeJob, mut on_progress: F) -> Result<EncodeEnd, EncodeError>
    where
        F: FnMut(&TranscodeJob, f64),
    {
        markers::acquire_converting(&job.input_path)?;

        let result = self.convert(job, &mut on_progress).await;
        match &result {
            Ok(EncodeEnd::Completed) => job.state = JobState::Committing,
            Ok(EncodeEnd::Interrupted) => job.state = JobState::Interrupted,
            Ok(EncodeEnd::Grown { .. }) | Err(_) => job.state = JobState::Aborted,
        }
        debug!("job {} finished in state {}", job.id, job.state.as_str());
        result
    }

    async fn convert<F>(&self, job: &mut TranscodeJob, on_progress: &mut F) -> Result<EncodeEnd, EncodeError>
    where
        F: FnMut(&TranscodeJob, f64),
    {
        job.original_size = fs::metadata(&job.input_path)
            .map_err(|source| EncodeError::Inspect {
                path: job.input_path.clone(),
                source,
            })?
            .len();

        // a crashed run may have left output behind; the growth check must not see it
        match fs::remove_file(&job.output_path) {
            Ok(()) => info!("job {} removed stale {}", job.id, job.output_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(EncodeError::StaleOutput {
                    path: job.output_path.clone(),
                    source,
                })
            }
        }

        let params = EncodeParams {
            input_path: job.input_path.clone(),
            output_path: job.output_path.clone(),
            encoder: self.encoder.clone(),
        };
        let mut cmd = Command::from(build_ffmpeg_command(&params));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(EncodeError::Spawn)?;
        job.state = JobState::Converting;
        info!("job {} converting {}", job.id, job.input_path.display());

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EncodeError::Spawn(io::Error::other("encoder stderr not captured")))?;
        let mut lines = OutputLines::new(stderr);

        let interval = u64::from(self.encoder.size_check_interval.max(1));
        let step = f64::from(self.encoder.progress_step_percent.max(1));
        let mut next_report = step;

        loop {
            let line = tokio::select! {
                biased;
                _ = self.stop.stopped() => {
                    info!("job {} interrupted", job.id);
                    self.kill_and_drain(&mut child, &mut lines).await;
                    return Ok(EncodeEnd::Interrupted);
                }
                line = lines.next_line() => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    self.kill_and_drain(&mut child, &mut lines).await;
                    return Err(EncodeError::Stream(e));
                }
            };

            let Some(cumulative) = parse_frame_line(&line) else {
                trace!("encoder: {}", line);
                continue;
            };
            job.progress.observe(cumulative);

            if job.progress.samples() % interval == 0 {
                let sampled = output_size(&job.output_path);
                if sampled > job.original_size {
                    warn!(
                        "job {} output is {} bytes, larger than the original {} bytes; aborting",
                        job.id, sampled, job.original_size
                    );
                    self.kill_and_drain(&mut child, &mut lines).await;
                    return Ok(EncodeEnd::Grown { sampled_size: sampled });
                }
            }

            if let Some(percent) = job.percent() {
                if percent >= next_report {
                    on_progress(job, percent);
                    next_report = ((percent / step).floor() + 1.0) * step;
                }
            }
        }

        let status = child.wait().await.map_err(EncodeError::Stream)?;
        if !status.success() {
            return Err(EncodeError::EncoderFailed(status.code()));
        }
        if !job.output_path.is_file() {
            return Err(EncodeError::OutputMissing(job.output_path.clone()));
        }
        Ok(EncodeEnd::Completed)
    }

    /// Kills the encoder and collects what is left of its output, giving up
    /// after the configured drain timeout.
    async fn kill_and_drain<R>(&self, child: &mut Child, lines: &mut OutputLines<R>)
    where
        R: AsyncRead + Unpin,
    {
        if let Err(e) = child.start_kill() {
            debug!("encoder kill: {}", e);
        }
        let drain = async {
            while let Ok(Some(line)) = lines.next_line().await {
                trace!("encoder (draining): {}", line);
            }
            child.wait().await
        };
        let limit = Duration::from_secs(self.encoder.drain_timeout_secs);
        match tokio::time::timeout(limit, drain).await {
            Ok(Ok(status)) => debug!("encoder exited with {}", status),
            Ok(Err(e)) => warn!("waiting for encoder failed: {}", e),
            Err(_) => warn!("encoder did not exit within {:?}", limit),
        }
    }
}

/// Size of the in-progress output; zero before the encoder has created it
fn output_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}
