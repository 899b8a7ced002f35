//! Startup checks
//!
//! Preflight checks run before a sweep:
//! - the encoder and the prober must run (`-version`)
//! - the configured encoders should be built into ffmpeg (warning only)
//! - the open-files tool must run, or every file would look in use

use crate::config::Config;
use log::{info, warn};
use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("ffmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("ffprobe not available: {0}")]
    FfprobeUnavailable(String),

    #[error("lsof not available: {0}")]
    LsofUnavailable(String),
}

/// Parse the version token from `<tool> -version` output
///
/// Handles release (`6.1.1`), n-prefixed (`n7.0-...`) and git builds
/// (`N-112233-g...`). Returns the token with any leading `n` removed.
pub fn parse_tool_version(version_output: &str, tool: &str) -> Option<String> {
    let marker = format!("{} version", tool);
    let line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains(&marker))?;

    let token = line
        .to_lowercase()
        .split(&marker)
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let trimmed = token.strip_prefix('n').unwrap_or(&token);
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_string())
}

/// Runs `<bin> -version` and returns its stdout
fn run_version(bin: &Path) -> Result<String, String> {
    let output = Command::new(bin)
        .arg("-version")
        .output()
        .map_err(|e| format!("{} -version failed; is it installed and in PATH? Error: {}", bin.display(), e))?;

    if !output.status.success() {
        return Err(format!("{} -version exited with {}", bin.display(), output.status));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Check that ffmpeg runs
pub fn check_ffmpeg(bin: &Path) -> Result<(), StartupError> {
    let stdout = run_version(bin).map_err(StartupError::FfmpegUnavailable)?;
    match parse_tool_version(&stdout, "ffmpeg") {
        Some(version) => info!("using ffmpeg {}", version),
        None => warn!("could not parse ffmpeg version"),
    }
    Ok(())
}

/// Check that ffprobe runs
pub fn check_ffprobe(bin: &Path) -> Result<(), StartupError> {
    let stdout = run_version(bin).map_err(StartupError::FfprobeUnavailable)?;
    if let Some(version) = parse_tool_version(&stdout, "ffprobe") {
        info!("using ffprobe {}", version);
    }
    Ok(())
}

/// Encoder names from `ffmpeg -encoders` that are missing from the build
pub fn missing_encoders(encoders_output: &str, wanted: &[&str]) -> Vec<String> {
    let available: Vec<&str> = encoders_output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .collect();
    wanted
        .iter()
        .filter(|name| !available.contains(name))
        .map(|name| name.to_string())
        .collect()
}

fn warn_missing_encoders(cfg: &Config) {
    let output = match Command::new(&cfg.encoder.ffmpeg_bin)
        .args(["-hide_banner", "-encoders"])
        .output()
    {
        Ok(output) if output.status.success() => output,
        _ => {
            warn!("could not list ffmpeg encoders");
            return;
        }
    };
    let listing = String::from_utf8_lossy(&output.stdout);
    let wanted = [cfg.encoder.video_codec.as_str(), cfg.encoder.audio_codec.as_str()];
    for name in missing_encoders(&listing, &wanted) {
        warn!("ffmpeg has no encoder named {}; encodes will fail", name);
    }
}

/// Check that the open-files tool can be started
pub fn check_lsof(bin: &Path) -> Result<(), StartupError> {
    Command::new(bin)
        .arg("-v")
        .output()
        .map(|_| ())
        .map_err(|e| StartupError::LsofUnavailable(format!("{}: {}", bin.display(), e)))
}

/// Run all startup checks in order
///
/// 1. ffmpeg runs
/// 2. ffprobe runs
/// 3. configured encoders exist (warning)
/// 4. lsof starts
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_ffmpeg(&cfg.encoder.ffmpeg_bin)?;
    check_ffprobe(&cfg.probe.ffprobe_bin)?;
    warn_missing_encoders(cfg);
    check_lsof(&cfg.probe.lsof_bin)?;
    Ok(())
}
