//! Probe module for describing media files.
//!
//! Runs ffprobe in its default stanza output mode and parses the
//! `[STREAM]` / `[FORMAT]` sections into a [`MediaDescriptor`].

use serde::Serialize;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Token ffprobe emits for a value it cannot determine.
const UNAVAILABLE: &str = "N/A";

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The file to probe does not exist or cannot be read.
    #[error("cannot read {0}")]
    Unreadable(String),

    /// ffprobe could not be started.
    #[error("ffprobe unavailable: {0}")]
    Unavailable(std::io::Error),

    /// ffprobe exited with a failure status.
    #[error("ffprobe failed: {0}")]
    Failed(String),

    /// ffprobe output did not follow the stanza format.
    #[error("malformed ffprobe output: {0}")]
    Malformed(String),
}

/// A frame rate expressed as `numerator/denominator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameRate {
    pub num: u64,
    pub den: u64,
}

impl FrameRate {
    /// Frames per second.
    pub fn fps(&self) -> f64 {
        self.num as f64 / self.den as f64
    }
}

/// One elementary stream, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamInfo {
    /// Position in the probe output, starting at 0.
    pub index: usize,
    pub codec_name: Option<String>,
    pub codec_type: Option<String>,
    /// `nb_frames`, when the container records it.
    pub frame_count: Option<u64>,
    /// `r_frame_rate`, falling back to `avg_frame_rate`.
    pub frame_rate: Option<FrameRate>,
}

/// Container-level information.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatInfo {
    pub duration_secs: Option<f64>,
}

/// Everything the orchestrator needs to know about one media file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaDescriptor {
    pub streams: Vec<StreamInfo>,
    pub format: FormatInfo,
}

impl MediaDescriptor {
    /// Whether any stream uses one of `codecs` (case-insensitive).
    pub fn has_codec(&self, codecs: &[String]) -> bool {
        self.streams.iter().any(|s| {
            s.codec_name
                .as_deref()
                .map(|name| codecs.iter().any(|c| c.eq_ignore_ascii_case(name)))
                .unwrap_or(false)
        })
    }

    /// First frame rate any stream reports.
    pub fn frame_rate(&self) -> Option<FrameRate> {
        self.streams.iter().find_map(|s| s.frame_rate)
    }

    /// Expected number of frames the encoder will report.
    ///
    /// Uses the first recorded stream frame count, otherwise estimates
    /// `fps * duration`. `None` when neither is known.
    pub fn frame_target(&self) -> Option<u64> {
        if let Some(count) = self
            .streams
            .iter()
            .filter_map(|s| s.frame_count)
            .find(|&c| c > 0)
        {
            return Some(count);
        }

        let fps = self.frame_rate()?.fps();
        let duration = self.format.duration_secs?;
        let estimate = (fps * duration).round();
        if estimate >= 1.0 {
            Some(estimate as u64)
        } else {
            None
        }
    }
}

/// Probes a media file with ffprobe.
///
/// Runs `ffprobe -v 0 -show_format -show_streams <path>` and parses the
/// default stanza output.
pub fn probe_file(ffprobe_bin: &Path, path: &Path) -> Result<MediaDescriptor, ProbeError> {
    if std::fs::metadata(path).is_err() {
        return Err(ProbeError::Unreadable(path.display().to_string()));
    }

    let output = Command::new(ffprobe_bin)
        .args(["-v", "0", "-show_format", "-show_streams"])
        .arg(path)
        .output()
        .map_err(ProbeError::Unavailable)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::Failed(format!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_probe_output(&stdout)
}

/// Section currently being filled while parsing.
enum Section {
    Stream(RawFields),
    Format(RawFields),
    Other,
}

type RawFields = Vec<(String, String)>;

/// Parses ffprobe stanza output into a [`MediaDescriptor`].
///
/// `[TAG]` opens a section and `[/TAG]` closes it. Nested sections such as
/// `[SIDE_DATA]` are skipped. Inside `STREAM` and `FORMAT`, every line is a
/// `key=value` pair.
pub fn parse_probe_output(text: &str) -> Result<MediaDescriptor, ProbeError> {
    let mut streams = Vec::new();
    let mut format: Option<FormatInfo> = None;
    let mut current: Option<Section> = None;
    let mut nested_depth = 0usize;

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim_end();
        if line.is_empty() {
            continue;
        }

        if line.starts_with("[/") && line.ends_with(']') {
            if nested_depth > 0 {
                nested_depth -= 1;
                continue;
            }
            match current.take() {
                Some(Section::Stream(fields)) => {
                    let index = streams.len();
                    streams.push(build_stream(index, &fields)?);
                }
                Some(Section::Format(fields)) => format = Some(build_format(&fields)?),
                Some(Section::Other) => {}
                None => {
                    return Err(ProbeError::Malformed(format!(
                        "line {}: closing {} without an open section",
                        lineno + 1,
                        line
                    )))
                }
            }
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') {
            if current.is_some() {
                nested_depth += 1;
                continue;
            }
            let tag = line[1..line.len() - 1].to_ascii_lowercase();
            current = Some(match tag.as_str() {
                "stream" => Section::Stream(Vec::new()),
                "format" => Section::Format(Vec::new()),
                _ => Section::Other,
            });
            continue;
        }

        if nested_depth > 0 {
            continue;
        }

        let fields = match current.as_mut() {
            Some(Section::Stream(fields)) | Some(Section::Format(fields)) => fields,
            Some(Section::Other) => continue,
            None => {
                return Err(ProbeError::Malformed(format!(
                    "line {}: data outside of any section",
                    lineno + 1
                )))
            }
        };

        let (key, value) = line.split_once('=').ok_or_else(|| {
            ProbeError::Malformed(format!("line {}: expected key=value, got {:?}", lineno + 1, line))
        })?;
        fields.push((key.to_string(), value.to_string()));
    }

    if current.is_some() {
        return Err(ProbeError::Malformed("unterminated section".to_string()));
    }

    let format =
        format.ok_or_else(|| ProbeError::Malformed("missing format section".to_string()))?;

    Ok(MediaDescriptor { streams, format })
}

fn field<'a>(fields: &'a RawFields, key: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
        .filter(|v| *v != UNAVAILABLE && !v.is_empty())
}

fn build_stream(index: usize, fields: &RawFields) -> Result<StreamInfo, ProbeError> {
    let frame_count = field(fields, "nb_frames")
        .map(|v| {
            v.parse::<u64>()
                .map_err(|_| ProbeError::Malformed(format!("stream {}: nb_frames={}", index, v)))
        })
        .transpose()?;

    let frame_rate = match field(fields, "r_frame_rate").map(parse_frame_rate).transpose()? {
        Some(Some(rate)) => Some(rate),
        _ => field(fields, "avg_frame_rate")
            .map(parse_frame_rate)
            .transpose()?
            .flatten(),
    };

    Ok(StreamInfo {
        index,
        codec_name: field(fields, "codec_name").map(str::to_string),
        codec_type: field(fields, "codec_type").map(str::to_string),
        frame_count,
        frame_rate,
    })
}

fn build_format(fields: &RawFields) -> Result<FormatInfo, ProbeError> {
    let duration_secs = field(fields, "duration")
        .map(|v| {
            v.parse::<f64>()
                .map_err(|_| ProbeError::Malformed(format!("format: duration={}", v)))
        })
        .transpose()?;

    Ok(FormatInfo { duration_secs })
}

/// Parses `N/D`. A zero denominator means "unavailable", not an error.
pub fn parse_frame_rate(value: &str) -> Result<Option<FrameRate>, ProbeError> {
    let malformed = || ProbeError::Malformed(format!("frame rate {:?}", value));
    let (num, den) = value.split_once('/').ok_or_else(malformed)?;
    let num = num.trim().parse::<u64>().map_err(|_| malformed())?;
    let den = den.trim().parse::<u64>().map_err(|_| malformed())?;
    if den == 0 {
        return Ok(None);
    }
    Ok(Some(FrameRate { num, den }))
}
