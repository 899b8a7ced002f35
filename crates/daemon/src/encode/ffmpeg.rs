//! FFmpeg encoder invocation
//!
//! Builds the re-encode command: every stream is mapped and copied, the
//! video is re-encoded to the target codec at a fixed CRF, and audio is
//! re-encoded at a fixed bitrate.

use crate::config::EncoderConfig;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Parameters for one encode
#[derive(Debug, Clone)]
pub struct EncodeParams {
    /// Path to the input media file
    pub input_path: PathBuf,
    /// Path the encoder writes to, beside the input
    pub output_path: PathBuf,
    /// Encoder settings
    pub encoder: EncoderConfig,
}

impl EncodeParams {
    /// Parameters writing to the conventional sibling output path
    pub fn new(input_path: PathBuf, encoder: EncoderConfig) -> Self {
        let output_path = output_path_for(&input_path, &encoder.container);
        Self {
            input_path,
            output_path,
            encoder,
        }
    }
}

/// `/media/film.mp4` -> `/media/film.mp4.new.mkv`
pub fn output_path_for(input: &Path, container: &str) -> PathBuf {
    let mut out = input.as_os_str().to_owned();
    out.push(format!(".new.{}", container));
    PathBuf::from(out)
}

/// Build an FFmpeg command with all required encoding flags
///
/// Progress is reported on stderr as `frame=  123 fps=...` status lines.
pub fn build_ffmpeg_command(params: &EncodeParams) -> Command {
    let enc = &params.encoder;
    let mut cmd = Command::new(&enc.ffmpeg_bin);

    cmd.arg("-nostdin").arg("-y");
    cmd.arg("-i").arg(&params.input_path);

    // Keep every stream, copy by default
    cmd.args(["-map", "0", "-c", "copy"]);

    cmd.arg("-c:v").arg(&enc.video_codec);
    cmd.arg("-preset").arg(&enc.preset);
    cmd.arg("-crf").arg(enc.crf.to_string());

    cmd.arg("-c:a").arg(&enc.audio_codec);
    cmd.args(["-strict", "-2"]);
    cmd.arg("-b:a").arg(&enc.audio_bitrate);

    cmd.arg(&params.output_path);

    cmd
}
