//! Application configuration
//!
//! Loaded from a TOML file; every section falls back to defaults so a
//! partial file is valid.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
    pub transport: TransportConfig,
    pub session: SessionConfig,
}

/// Microphone capture settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    /// Input device name, `None` for the system default
    pub device: Option<String>,
    /// Outbound sample rate after resampling
    pub sample_rate: u32,
    /// Outbound channel count after downmix
    pub channels: u16,
    /// Samples per channel in each delivered frame
    pub block_size: usize,
    /// Frames held between the capture callback and the sender before dropping
    pub queue_frames: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: CAPTURE_SAMPLE_RATE,
            channels: CAPTURE_CHANNELS,
            block_size: CAPTURE_BLOCK_SIZE,
            queue_frames: CAPTURE_QUEUE_FRAMES,
        }
    }
}

/// Speaker playback settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackConfig {
    pub device: Option<String>,
    /// Rate of the agent's inbound audio
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            device: None,
            sample_rate: PLAYBACK_SAMPLE_RATE,
            channels: PLAYBACK_CHANNELS,
        }
    }
}

/// Agent channel settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    pub url: String,
    /// Encoded chunks queued for the socket writer before dropping
    pub outbound_queue: usize,
    pub connect_timeout_ms: u64,
    pub close_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_AGENT_URL.to_string(),
            outbound_queue: OUTBOUND_QUEUE_CHUNKS,
            connect_timeout_ms: 10_000,
            close_timeout_ms: 2_000,
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// Session controller settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound on cleanup during `disconnect()`
    pub shutdown_timeout_ms: u64,
    /// Interval between stats log lines, 0 disables them
    pub stats_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_ms: 3_000,
            stats_interval_secs: 5,
        }
    }
}

impl SessionConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl AppConfig {
    /// Default config file location (`<config dir>/duplex-voice/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "duplex-voice")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, using defaults only when the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Write configuration as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Apply environment variable overrides
    ///
    /// - `DUPLEX_VOICE_URL` → transport.url
    /// - `DUPLEX_VOICE_INPUT_DEVICE` → capture.device
    /// - `DUPLEX_VOICE_OUTPUT_DEVICE` → playback.device
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(url) = non_empty_var("DUPLEX_VOICE_URL") {
            self.transport.url = url;
        }
        if let Some(device) = non_empty_var("DUPLEX_VOICE_INPUT_DEVICE") {
            self.capture.device = Some(device);
        }
        if let Some(device) = non_empty_var("DUPLEX_VOICE_OUTPUT_DEVICE") {
            self.playback.device = Some(device);
        }
        self
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.capture.sample_rate == 0 || self.playback.sample_rate == 0 {
            return Err(Error::Config("sample rates must be non-zero".into()));
        }
        for channels in [self.capture.channels, self.playback.channels] {
            if !(1..=2).contains(&channels) {
                return Err(Error::Config(format!("unsupported channel count {}", channels)));
            }
        }
        if self.capture.block_size == 0 {
            return Err(Error::Config("capture.block_size must be non-zero".into()));
        }
        if self.capture.queue_frames == 0 || self.transport.outbound_queue == 0 {
            return Err(Error::Config("queue sizes must be non-zero".into()));
        }
        Ok(())
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_wire_format() {
        let config = AppConfig::default();
        assert_eq!(config.capture.sample_rate, 16_000);
        assert_eq!(config.capture.channels, 1);
        assert_eq!(config.capture.block_size, 4096);
        assert_eq!(config.playback.sample_rate, 24_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[transport]\nurl = \"ws://agent.local/live\"\n").unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.transport.url, "ws://agent.local/live");
        assert_eq!(config.transport.outbound_queue, OUTBOUND_QUEUE_CHUNKS);
        assert_eq!(config.capture, CaptureConfig::default());
    }

    #[test]
    fn test_missing_file_is_default_invalid_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert_eq!(AppConfig::load_or_default(&missing).unwrap(), AppConfig::default());

        let broken = dir.path().join("broken.toml");
        fs::write(&broken, "[capture\nsample_rate = ").unwrap();
        assert!(matches!(AppConfig::load_or_default(&broken), Err(Error::Config(_))));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = AppConfig::default();
        config.capture.device = Some("USB Mic".into());
        config.save(&path).unwrap();

        assert_eq!(AppConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects_bad_channels() {
        let mut config = AppConfig::default();
        config.playback.channels = 6;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.capture.queue_frames = 0;
        assert!(config.validate().is_err());
    }
}
