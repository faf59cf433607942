//! Application configuration
//!
//! Loaded from a TOML file; every section falls back to the defaults in
//! [`crate::constants`] so a partial file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::ChunkLayout;
use crate::constants::*;
use crate::error::{Error, Result};

/// Root configuration shared by sender and receiver
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub stream: StreamConfig,
    pub network: NetworkConfig,
    pub rate_limit: RateLimitConfig,
    pub pipeline: PipelineConfig,
    pub output: OutputConfig,
}

/// Chunking and transform parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub sample_rate: u32,
    pub chunk_size: usize,
    pub overlap_size: usize,
    /// Quality parameter handed to the transform
    pub num_streams: u32,
    /// Sleep `chunk_size / sample_rate` seconds between chunks
    pub realtime: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap_size: DEFAULT_OVERLAP_SIZE,
            num_streams: DEFAULT_NUM_STREAMS,
            realtime: false,
        }
    }
}

impl StreamConfig {
    pub fn layout(&self) -> Result<ChunkLayout> {
        Ok(ChunkLayout::new(self.chunk_size, self.overlap_size)?)
    }

    /// Wall-clock duration of one chunk at `sample_rate`
    pub fn chunk_duration(&self, sample_rate: u32) -> Duration {
        Duration::from_secs_f64(self.chunk_size as f64 / sample_rate.max(1) as f64)
    }
}

/// Socket settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    /// Kernel send/receive buffer size in bytes
    pub socket_buffer_size: usize,
    pub nodelay: bool,
    pub connect_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            socket_buffer_size: DEFAULT_SOCKET_BUFFER_SIZE,
            nodelay: true,
            connect_timeout_ms: 5_000,
        }
    }
}

impl NetworkConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Outbound throttling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub bytes_per_second: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bytes_per_second: DEFAULT_RATE_LIMIT_BPS,
        }
    }
}

/// Queue capacities and polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub encode_queue_capacity: usize,
    pub send_queue_capacity: usize,
    pub decode_queue_capacity: usize,
    pub poll_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            encode_queue_capacity: DEFAULT_ENCODE_QUEUE_CAPACITY,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            decode_queue_capacity: DEFAULT_DECODE_QUEUE_CAPACITY,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Receiver-side output handling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub save_path: PathBuf,
    /// Keep every reconstructed chunk separately
    pub save_chunks: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            save_path: PathBuf::from("./output"),
            save_chunks: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file at the default location, or fall back to defaults
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Write configuration as TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Platform config location, e.g. `~/.config/overlap-streamer/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "overlap-streamer")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        self.stream.layout()?;
        if self.stream.sample_rate == 0 {
            return Err(Error::Config("sample_rate must be positive".into()));
        }
        if self.rate_limit.enabled && self.rate_limit.bytes_per_second == 0 {
            return Err(Error::Config("rate limit budget must be positive".into()));
        }
        let p = &self.pipeline;
        if p.encode_queue_capacity == 0 || p.send_queue_capacity == 0 || p.decode_queue_capacity == 0 {
            return Err(Error::Config("queue capacities must be positive".into()));
        }
        if p.poll_interval_ms == 0 || p.poll_interval_ms >= 1_000 {
            return Err(Error::Config("poll interval must be between 1 and 999 ms".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_cli() {
        let config = AppConfig::default();
        assert_eq!(config.stream.sample_rate, 16000);
        assert_eq!(config.stream.chunk_size, 16000);
        assert_eq!(config.stream.overlap_size, 1600);
        assert_eq!(config.stream.num_streams, 6);
        assert_eq!(config.network.port, 8888);
        assert_eq!(config.rate_limit.bytes_per_second, 375);
        assert!(!config.rate_limit.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [stream]
            chunk_size = 8000
            overlap_size = 800

            [rate_limit]
            enabled = true
            "#,
        )
        .unwrap();
        assert_eq!(config.stream.chunk_size, 8000);
        assert_eq!(config.stream.sample_rate, 16000);
        assert_eq!(config.rate_limit.bytes_per_second, 375);
        assert_eq!(config.stream.layout().unwrap().hop_size(), 7200);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.network.port = 9999;
        config.output.save_chunks = true;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_overlap_rejected() {
        let mut config = AppConfig::default();
        config.stream.overlap_size = config.stream.chunk_size;
        assert!(matches!(config.validate(), Err(Error::Audio(_))));

        let mut config = AppConfig::default();
        config.pipeline.poll_interval_ms = 1_500;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_chunk_duration() {
        let config = StreamConfig::default();
        assert_eq!(config.chunk_duration(16000), Duration::from_secs(1));
        assert_eq!(config.chunk_duration(32000), Duration::from_millis(500));
    }
}
