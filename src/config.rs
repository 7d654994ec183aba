//! Configuration loading helpers.

use std::env;
use std::fs;
use std::path::Path;

use serde::Deserialize;

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Runtime tunables for a log device instance.
#[derive(Debug, Clone)]
pub struct LogDevConfig {
    /// Pending append bytes that trigger a flush.
    pub flush_data_threshold_size: u64,
    /// Maximum time pending appends may wait before a flush, in microseconds.
    pub max_time_between_flush_us: u64,
    /// Period of the background flush timer, in microseconds.
    pub flush_timer_frequency_us: u64,
    /// Aligned blocks probed past the apparent end of the log during
    /// recovery to tell a clean tail from a corrupted one.
    pub recovery_max_blks_read_for_additional_check: u32,
    /// Bytes read by the first positional read of a group.
    pub initial_read_size: usize,
    /// Device DMA boundary used when constructing file-backed devices.
    pub dma_boundary: usize,
    /// Hard cap on the padded size of a single log group.
    pub max_group_size: u32,
    /// Maximum I/O vector entries per group write.
    pub max_iovecs: usize,
    /// Payloads below this size are copied into the inline region.
    pub inline_data_threshold: u32,
    /// Maximum number of store ids that can be reserved at once.
    pub max_stores: u32,
}

impl Default for LogDevConfig {
    fn default() -> Self {
        Self {
            flush_data_threshold_size: 64 * 1024,
            max_time_between_flush_us: 300,
            flush_timer_frequency_us: 500,
            recovery_max_blks_read_for_additional_check: 20,
            initial_read_size: 4096,
            dma_boundary: 512,
            max_group_size: 8 * 1024 * 1024,
            max_iovecs: 256,
            inline_data_threshold: 512,
            max_stores: 1024,
        }
    }
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OxilogConfig {
    /// Log device tunables.
    pub logdev: Option<LogDevSection>,
}

/// Optional overrides for [`LogDevConfig`], as read from a file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogDevSection {
    /// See [`LogDevConfig::flush_data_threshold_size`].
    pub flush_data_threshold_size: Option<u64>,
    /// See [`LogDevConfig::max_time_between_flush_us`].
    pub max_time_between_flush_us: Option<u64>,
    /// See [`LogDevConfig::flush_timer_frequency_us`].
    pub flush_timer_frequency_us: Option<u64>,
    /// See [`LogDevConfig::recovery_max_blks_read_for_additional_check`].
    pub recovery_max_blks_read_for_additional_check: Option<u32>,
    /// See [`LogDevConfig::initial_read_size`].
    pub initial_read_size: Option<usize>,
    /// See [`LogDevConfig::dma_boundary`].
    pub dma_boundary: Option<usize>,
    /// See [`LogDevConfig::max_group_size`].
    pub max_group_size: Option<u32>,
    /// See [`LogDevConfig::max_iovecs`].
    pub max_iovecs: Option<usize>,
    /// See [`LogDevConfig::inline_data_threshold`].
    pub inline_data_threshold: Option<u32>,
    /// See [`LogDevConfig::max_stores`].
    pub max_stores: Option<u32>,
}

impl OxilogConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `OXILOG_CONFIG` env var (if set),
    /// then apply `OXILOG__logdev__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let config_path = env::var("OXILOG_CONFIG").ok();
        let mut config = match config_path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("OXILOG__") {
                continue;
            }
            let path = key["OXILOG__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            let section = self.logdev.get_or_insert_with(LogDevSection::default);
            match parts.as_slice() {
                ["logdev", "flush_data_threshold_size"] => {
                    section.flush_data_threshold_size = Some(parse_value(&key, &value)?);
                }
                ["logdev", "max_time_between_flush_us"] => {
                    section.max_time_between_flush_us = Some(parse_value(&key, &value)?);
                }
                ["logdev", "flush_timer_frequency_us"] => {
                    section.flush_timer_frequency_us = Some(parse_value(&key, &value)?);
                }
                ["logdev", "recovery_max_blks_read_for_additional_check"] => {
                    section.recovery_max_blks_read_for_additional_check =
                        Some(parse_value(&key, &value)?);
                }
                ["logdev", "initial_read_size"] => {
                    section.initial_read_size = Some(parse_value(&key, &value)?);
                }
                ["logdev", "dma_boundary"] => {
                    section.dma_boundary = Some(parse_value(&key, &value)?);
                }
                ["logdev", "max_group_size"] => {
                    section.max_group_size = Some(parse_value(&key, &value)?);
                }
                ["logdev", "max_iovecs"] => {
                    section.max_iovecs = Some(parse_value(&key, &value)?);
                }
                ["logdev", "inline_data_threshold"] => {
                    section.inline_data_threshold = Some(parse_value(&key, &value)?);
                }
                ["logdev", "max_stores"] => {
                    section.max_stores = Some(parse_value(&key, &value)?);
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }
        Ok(())
    }

    /// Resolve the final [`LogDevConfig`], applying overrides over defaults.
    pub fn logdev_config(&self) -> LogDevConfig {
        let mut cfg = LogDevConfig::default();
        if let Some(section) = &self.logdev {
            if let Some(v) = section.flush_data_threshold_size {
                cfg.flush_data_threshold_size = v;
            }
            if let Some(v) = section.max_time_between_flush_us {
                cfg.max_time_between_flush_us = v;
            }
            if let Some(v) = section.flush_timer_frequency_us {
                cfg.flush_timer_frequency_us = v;
            }
            if let Some(v) = section.recovery_max_blks_read_for_additional_check {
                cfg.recovery_max_blks_read_for_additional_check = v;
            }
            if let Some(v) = section.initial_read_size {
                cfg.initial_read_size = v;
            }
            if let Some(v) = section.dma_boundary {
                cfg.dma_boundary = v;
            }
            if let Some(v) = section.max_group_size {
                cfg.max_group_size = v;
            }
            if let Some(v) = section.max_iovecs {
                cfg.max_iovecs = v;
            }
            if let Some(v) = section.inline_data_threshold {
                cfg.inline_data_threshold = v;
            }
            if let Some(v) = section.max_stores {
                cfg.max_stores = v;
            }
        }
        cfg
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
