use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no sources configured")]
    NoSources,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub url: String,
}

fn default_gop_min_duration() -> u64 {
    4000
}

fn default_decode_duration() -> u64 {
    2000
}

fn default_resolve_tolerance() -> u64 {
    2000
}

fn default_debounce() -> u64 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_gop_min_duration")]
    pub gop_min_duration_ms: u64,
    #[serde(default = "default_decode_duration")]
    pub decode_duration_ms: u64,
    #[serde(default = "default_resolve_tolerance")]
    pub resolve_tolerance_ms: u64,
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,
}

impl CacheConfig {
    pub fn gop_min_duration_us(&self) -> i64 {
        ms_to_us(self.gop_min_duration_ms)
    }

    pub fn decode_duration_us(&self) -> i64 {
        ms_to_us(self.decode_duration_ms)
    }

    pub fn resolve_tolerance_us(&self) -> i64 {
        ms_to_us(self.resolve_tolerance_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            gop_min_duration_ms: default_gop_min_duration(),
            decode_duration_ms: default_decode_duration(),
            resolve_tolerance_ms: default_resolve_tolerance(),
            debounce_ms: default_debounce(),
        }
    }
}

fn default_block_size() -> u64 {
    1024 * 1024
}

fn default_user_agent() -> String {
    format!("gopcache/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Clone, Deserialize)]
pub struct RangeConfig {
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for RangeConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            cache_dir: None,
            user_agent: default_user_agent(),
        }
    }
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    360
}

fn default_sample_rate() -> u32 {
    48000
}

fn default_channels() -> u16 {
    2
}

#[derive(Debug, Clone, Deserialize)]
pub struct DecodeConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            width: default_width(),
            height: default_height(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub range: RangeConfig,
    #[serde(default)]
    pub decode: DecodeConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;

        if config.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }

        Ok(config)
    }
}

fn ms_to_us(ms: u64) -> i64 {
    i64::try_from(ms.saturating_mul(1000)).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = Config::parse(
            r#"
            [[sources]]
            id = "intro"
            url = "http://localhost/intro.ts"
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.gop_min_duration_ms, 4000);
        assert_eq!(config.cache.decode_duration_us(), 2_000_000);
        assert_eq!(config.cache.debounce(), Duration::from_millis(100));
        assert_eq!(config.range.block_size, 1024 * 1024);
        assert!(config.range.cache_dir.is_none());
        assert_eq!(config.decode.ffmpeg_path, "ffmpeg");
        assert_eq!(config.sources.len(), 1);
    }

    #[test]
    fn test_overrides() {
        let config = Config::parse(
            r#"
            [cache]
            gop_min_duration_ms = 500
            debounce_ms = 20

            [range]
            block_size = 4096
            cache_dir = "/tmp/gopcache"

            [[sources]]
            id = "a"
            url = "http://localhost/a.ts"
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.gop_min_duration_us(), 500_000);
        assert_eq!(config.cache.decode_duration_ms, 2000);
        assert_eq!(config.range.block_size, 4096);
        assert_eq!(
            config.range.cache_dir.as_deref(),
            Some(Path::new("/tmp/gopcache"))
        );
    }

    #[test]
    fn test_no_sources() {
        assert!(matches!(
            Config::parse("[cache]\ndebounce_ms = 5\n"),
            Err(ConfigError::NoSources)
        ));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            Config::parse("[cache\n"),
            Err(ConfigError::Parse(_))
        ));
    }
}
