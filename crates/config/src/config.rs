//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value is outside its accepted range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Library location and file naming
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LibraryConfig {
    /// Root of the tree to sweep
    #[serde(default = "default_root_path")]
    pub root_path: PathBuf,
    /// Filename suffix of downloads that are still being fetched
    #[serde(default = "default_partial_suffix")]
    pub partial_suffix: String,
}

fn default_root_path() -> PathBuf {
    PathBuf::from("/media")
}

fn default_partial_suffix() -> String {
    "partial~".to_string()
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            root_path: default_root_path(),
            partial_suffix: default_partial_suffix(),
        }
    }
}

/// External inspection tools
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeConfig {
    /// Media prober binary
    #[serde(default = "default_ffprobe_bin")]
    pub ffprobe_bin: PathBuf,
    /// Open-files listing binary
    #[serde(default = "default_lsof_bin")]
    pub lsof_bin: PathBuf,
}

fn default_ffprobe_bin() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_lsof_bin() -> PathBuf {
    PathBuf::from("lsof")
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ffprobe_bin: default_ffprobe_bin(),
            lsof_bin: default_lsof_bin(),
        }
    }
}

/// Encoder invocation and supervision settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Encoder binary
    #[serde(default = "default_ffmpeg_bin")]
    pub ffmpeg_bin: PathBuf,
    /// Constant rate factor passed to the video encoder (0-51, default 16)
    #[serde(default = "default_crf")]
    pub crf: u8,
    /// Encoder speed preset
    #[serde(default = "default_preset")]
    pub preset: String,
    /// Target video encoder
    #[serde(default = "default_video_codec")]
    pub video_codec: String,
    /// Audio encoder
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
    /// Audio bitrate, in encoder notation (e.g. "256k")
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
    /// Output container extension; output goes to `<path>.new.<container>`
    #[serde(default = "default_container")]
    pub container: String,
    /// Sample the in-progress output size every N progress lines
    #[serde(default = "default_size_check_interval")]
    pub size_check_interval: u32,
    /// Seconds to wait for a killed encoder to exit
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    /// Smaller outputs are treated as truncated rather than as a win
    #[serde(default = "default_min_output_bytes")]
    pub min_output_bytes: u64,
    /// Progress notification granularity in percent
    #[serde(default = "default_progress_step_percent")]
    pub progress_step_percent: u8,
}

fn default_ffmpeg_bin() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_crf() -> u8 {
    16
}

fn default_preset() -> String {
    "ultrafast".to_string()
}

fn default_video_codec() -> String {
    "libx265".to_string()
}

fn default_audio_codec() -> String {
    "libfdk_aac".to_string()
}

fn default_audio_bitrate() -> String {
    "256k".to_string()
}

fn default_container() -> String {
    "mkv".to_string()
}

fn default_size_check_interval() -> u32 {
    50
}

fn default_drain_timeout_secs() -> u64 {
    5
}

fn default_min_output_bytes() -> u64 {
    1_000_000
}

fn default_progress_step_percent() -> u8 {
    10
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_bin: default_ffmpeg_bin(),
            crf: default_crf(),
            preset: default_preset(),
            video_codec: default_video_codec(),
            audio_codec: default_audio_codec(),
            audio_bitrate: default_audio_bitrate(),
            container: default_container(),
            size_check_interval: default_size_check_interval(),
            drain_timeout_secs: default_drain_timeout_secs(),
            min_output_bytes: default_min_output_bytes(),
            progress_step_percent: default_progress_step_percent(),
        }
    }
}

/// Codec rules deciding which files are worth re-encoding
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EligibilityConfig {
    /// Codecs that are always re-encoded
    #[serde(default = "default_legacy_codecs")]
    pub legacy_codecs: Vec<String>,
    /// Codecs already in the target format
    #[serde(default = "default_current_codecs")]
    pub current_codecs: Vec<String>,
    /// Re-encode current-codec files whose bitrate exceeds the threshold
    #[serde(default = "default_reencode_current")]
    pub reencode_current: bool,
    /// Megabytes per hour above which a current-codec file is re-encoded
    #[serde(default = "default_current_max_mb_per_hour")]
    pub current_max_mb_per_hour: f64,
}

fn default_legacy_codecs() -> Vec<String> {
    vec!["h264".to_string()]
}

fn default_current_codecs() -> Vec<String> {
    vec!["hevc".to_string(), "h265".to_string()]
}

fn default_reencode_current() -> bool {
    true
}

fn default_current_max_mb_per_hour() -> f64 {
    1000.0
}

impl Default for EligibilityConfig {
    fn default() -> Self {
        Self {
            legacy_codecs: default_legacy_codecs(),
            current_codecs: default_current_codecs(),
            reencode_current: default_reencode_current(),
            current_max_mb_per_hour: default_current_max_mb_per_hour(),
        }
    }
}

/// Chat notification transport
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotifyConfig {
    /// Bot token; notifications are disabled when empty
    #[serde(default)]
    pub bot_token: String,
    /// Destination chat; notifications are disabled when empty
    #[serde(default)]
    pub chat_id: String,
    /// Host label appended to every message when non-empty
    #[serde(default)]
    pub host: String,
    /// Bot API endpoint
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            chat_id: String::new(),
            host: String::new(),
            api_base: default_api_base(),
        }
    }
}

impl NotifyConfig {
    /// Whether both credentials are present
    pub fn is_enabled(&self) -> bool {
        !self.bot_token.is_empty() && !self.chat_id.is_empty()
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub library: LibraryConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub eligibility: EligibilityConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - ROOT_PATH -> library.root_path
    /// - CRF -> encoder.crf
    /// - H265_TRANSCODE -> eligibility.reencode_current
    /// - H265_MB_H -> eligibility.current_max_mb_per_hour (empty disables reencode_current)
    /// - BOT_KEY, CHAT_ID, HOST -> notify.*
    /// - FFMPEG_BIN, FFPROBE_BIN, LSOF_BIN -> tool paths
    /// - MIN_OUTPUT_BYTES -> encoder.min_output_bytes
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("ROOT_PATH") {
            if !val.is_empty() {
                self.library.root_path = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("CRF") {
            if let Ok(crf) = val.trim().parse::<u8>() {
                self.encoder.crf = crf;
            }
        }

        if let Ok(val) = env::var("H265_TRANSCODE") {
            if let Some(flag) = parse_bool(&val) {
                self.eligibility.reencode_current = flag;
            }
        }

        // An empty H265_MB_H switches the bitrate rule off entirely
        if let Ok(val) = env::var("H265_MB_H") {
            if val.trim().is_empty() {
                self.eligibility.reencode_current = false;
            } else if let Ok(mb_h) = val.trim().parse::<f64>() {
                self.eligibility.current_max_mb_per_hour = mb_h;
            }
        }

        if let Ok(val) = env::var("BOT_KEY") {
            self.notify.bot_token = val;
        }

        if let Ok(val) = env::var("CHAT_ID") {
            self.notify.chat_id = val;
        }

        if let Ok(val) = env::var("HOST") {
            self.notify.host = val;
        }

        if let Ok(val) = env::var("FFMPEG_BIN") {
            if !val.is_empty() {
                self.encoder.ffmpeg_bin = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("FFPROBE_BIN") {
            if !val.is_empty() {
                self.probe.ffprobe_bin = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("LSOF_BIN") {
            if !val.is_empty() {
                self.probe.lsof_bin = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("MIN_OUTPUT_BYTES") {
            if let Ok(bytes) = val.trim().parse::<u64>() {
                self.encoder.min_output_bytes = bytes;
            }
        }
    }

    /// Check that every value is inside its accepted range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.encoder.crf > 51 {
            return Err(ConfigError::Invalid(format!(
                "encoder.crf must be within 0-51, got {}",
                self.encoder.crf
            )));
        }
        if self.encoder.size_check_interval == 0 {
            return Err(ConfigError::Invalid(
                "encoder.size_check_interval must be at least 1".to_string(),
            ));
        }
        if self.encoder.drain_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "encoder.drain_timeout_secs must be at least 1".to_string(),
            ));
        }
        if !(1..=100).contains(&self.encoder.progress_step_percent) {
            return Err(ConfigError::Invalid(format!(
                "encoder.progress_step_percent must be within 1-100, got {}",
                self.encoder.progress_step_percent
            )));
        }
        let threshold = self.eligibility.current_max_mb_per_hour;
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "eligibility.current_max_mb_per_hour must be a non-negative number, got {}",
                threshold
            )));
        }
        if self.eligibility.legacy_codecs.is_empty() {
            return Err(ConfigError::Invalid(
                "eligibility.legacy_codecs must name at least one codec".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from an optional file, falling back to defaults, then apply
    /// environment overrides
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::load_from_file(p)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

/// Accept "true", "1", "yes", "t" as true; "false", "0", "no", "f" as false
fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "t" => Some(true),
        "false" | "0" | "no" | "f" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        for key in [
            "ROOT_PATH",
            "CRF",
            "H265_TRANSCODE",
            "H265_MB_H",
            "BOT_KEY",
            "CHAT_ID",
            "HOST",
            "FFMPEG_BIN",
            "FFPROBE_BIN",
            "LSOF_BIN",
            "MIN_OUTPUT_BYTES",
        ] {
            env::remove_var(key);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            crf in 0u8..=51,
            interval in 1u32..500,
            min_output in 0u64..10_000_000,
            reencode in proptest::bool::ANY,
            mb_h in 1u32..10_000,
        ) {
            let toml_str = format!(
                r#"
[library]
root_path = "/srv/media"

[encoder]
crf = {}
size_check_interval = {}
min_output_bytes = {}

[eligibility]
reencode_current = {}
current_max_mb_per_hour = {}.0

[notify]
host = "nas"
"#,
                crf, interval, min_output, reencode, mb_h
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(&config.library.root_path, &PathBuf::from("/srv/media"));
            prop_assert_eq!(config.encoder.crf, crf);
            prop_assert_eq!(config.encoder.size_check_interval, interval);
            prop_assert_eq!(config.encoder.min_output_bytes, min_output);
            prop_assert_eq!(config.eligibility.reencode_current, reencode);
            prop_assert!((config.eligibility.current_max_mb_per_hour - mb_h as f64).abs() < 1e-9);
            prop_assert_eq!(config.notify.host.as_str(), "nas");
            prop_assert!(config.validate().is_ok());
        }

        #[test]
        fn prop_env_overrides_crf(initial in 0u8..=51, override_crf in 0u8..=51) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let mut config = Config::parse_toml(&format!("[encoder]\ncrf = {}\n", initial))
                .expect("Valid TOML");

            env::set_var("CRF", override_crf.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.encoder.crf, override_crf);
        }

        #[test]
        fn prop_env_overrides_mb_per_hour(override_mb_h in 1u32..100_000) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let mut config = Config::default();
            env::set_var("H265_MB_H", override_mb_h.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert!(config.eligibility.reencode_current);
            prop_assert!((config.eligibility.current_max_mb_per_hour - override_mb_h as f64).abs() < 1e-9);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.library.root_path, PathBuf::from("/media"));
        assert_eq!(config.library.partial_suffix, "partial~");
        assert_eq!(config.encoder.crf, 16);
        assert_eq!(config.encoder.preset, "ultrafast");
        assert_eq!(config.encoder.video_codec, "libx265");
        assert_eq!(config.encoder.audio_codec, "libfdk_aac");
        assert_eq!(config.encoder.audio_bitrate, "256k");
        assert_eq!(config.encoder.container, "mkv");
        assert_eq!(config.eligibility.legacy_codecs, vec!["h264"]);
        assert_eq!(config.eligibility.current_codecs, vec!["hevc", "h265"]);
        assert!(config.eligibility.reencode_current);
        assert!(!config.notify.is_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[encoder]
crf = 22
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");

        assert_eq!(config.encoder.crf, 22);
        assert_eq!(config.encoder.preset, "ultrafast"); // default
        assert_eq!(config.encoder.size_check_interval, 50); // default
        assert_eq!(config.library, LibraryConfig::default());
    }

    #[test]
    fn test_empty_mb_per_hour_disables_current_codec_rule() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("H265_MB_H", "");
        config.apply_env_overrides();
        clear_env_vars();

        assert!(!config.eligibility.reencode_current);
    }

    #[test]
    fn test_env_overrides_notification_credentials() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("BOT_KEY", "123:abc");
        env::set_var("CHAT_ID", "42");
        env::set_var("HOST", "basement-nas");
        env::set_var("H265_TRANSCODE", "no");
        config.apply_env_overrides();
        clear_env_vars();

        assert!(config.notify.is_enabled());
        assert_eq!(config.notify.host, "basement-nas");
        assert!(!config.eligibility.reencode_current);
    }

    #[test]
    fn test_unparsable_env_value_keeps_previous() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("CRF", "high");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.encoder.crf, 16);
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        let mut config = Config::default();
        config.encoder.crf = 60;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.encoder.size_check_interval = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.eligibility.current_max_mb_per_hour = f64::NAN;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.eligibility.legacy_codecs.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_or_default_without_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        env::set_var("ROOT_PATH", "/data/tv");
        let config = Config::load_or_default(None).expect("defaults are valid");
        clear_env_vars();

        assert_eq!(config.library.root_path, PathBuf::from("/data/tv"));
    }
}
