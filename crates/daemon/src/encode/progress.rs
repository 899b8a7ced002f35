//! Encoder progress parsing
//!
//! FFmpeg rewrites its status line with carriage returns, so output is split
//! on both `\r` and `\n`. Each status line carries the cumulative number of
//! frames written so far.

use regex::Regex;
use std::io;
use std::sync::OnceLock;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

fn frame_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"frame=\s*(\d+)").expect("frame pattern is valid"))
}

/// Extracts the cumulative frame count from a status line.
pub fn parse_frame_line(line: &str) -> Option<u64> {
    frame_pattern()
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Monotonic progress counter fed with cumulative frame reports.
///
/// Reports that go backwards or repeat contribute nothing, so overlapping
/// or out-of-order status lines never inflate the total.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    last_cumulative: u64,
    frames_done: u64,
    samples: u64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a cumulative report and returns the frames it added.
    pub fn observe(&mut self, cumulative: u64) -> u64 {
        self.samples += 1;
        if cumulative <= self.last_cumulative {
            return 0;
        }
        let delta = cumulative - self.last_cumulative;
        self.last_cumulative = cumulative;
        self.frames_done += delta;
        delta
    }

    pub fn frames_done(&self) -> u64 {
        self.frames_done
    }

    /// Number of progress lines seen, including ones that added nothing.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Completion in percent of `target`, capped at 100.
    pub fn percent_of(&self, target: Option<u64>) -> Option<f64> {
        let target = target.filter(|t| *t > 0)?;
        Some((self.frames_done as f64 / target as f64 * 100.0).min(100.0))
    }
}

/// Splits a byte stream into lines on `\r` or `\n`.
///
/// `next_line` is cancel-safe: bytes are moved into the internal buffer
/// before the reader is advanced, so dropping the future loses nothing.
pub struct OutputLines<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
}

impl<R: AsyncRead + Unpin> OutputLines<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            pending: Vec::new(),
        }
    }

    /// Next non-empty line, or `None` at end of stream.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take_pending()));
            }

            match available.iter().position(|b| *b == b'\r' || *b == b'\n') {
                Some(pos) => {
                    self.pending.extend_from_slice(&available[..pos]);
                    self.reader.consume(pos + 1);
                    if !self.pending.is_empty() {
                        return Ok(Some(self.take_pending()));
                    }
                }
                None => {
                    let len = available.len();
                    self.pending.extend_from_slice(available);
                    self.reader.consume(len);
                }
            }
        }
    }

    fn take_pending(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        line
    }
}
