//! Encoding modules for the library transcoder

pub mod ffmpeg;
pub mod progress;

pub use ffmpeg::{build_ffmpeg_command, output_path_for, EncodeParams};
pub use progress::{parse_frame_line, OutputLines, ProgressTracker};
