//! Configuration for Sluice streams.
//!
//! `StreamConfig` is what a single stream is built from. `SluiceConfig`
//! holds process-wide defaults and is resolved: environment variables →
//! config file → defaults.
//!
//! Config file location:
//!   1. $SLUICE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/sluice/config.toml
//!   3. ~/.config/sluice/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::chunk::Mode;

pub const DEFAULT_BYTE_HIGH_WATER_MARK: usize = 16 * 1024;
pub const DEFAULT_OBJECT_HIGH_WATER_MARK: usize = 16;

// ── Per-stream ────────────────────────────────────────────────────────────────

/// Construction parameters for one sink or source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Shows up in log fields and pipeline errors.
    pub name: String,
    /// Backpressure threshold, in bytes (byte mode) or chunks (object mode).
    pub high_water_mark: usize,
    pub mode: Mode,
}

impl StreamConfig {
    pub fn bytes() -> Self {
        Self {
            name: String::from("stream"),
            high_water_mark: DEFAULT_BYTE_HIGH_WATER_MARK,
            mode: Mode::Bytes,
        }
    }

    pub fn objects() -> Self {
        Self {
            name: String::from("stream"),
            high_water_mark: DEFAULT_OBJECT_HIGH_WATER_MARK,
            mode: Mode::Objects,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::bytes()
    }
}

// ── Process-wide defaults ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SluiceConfig {
    pub streams: StreamDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamDefaults {
    /// Default high-water-mark for byte-mode streams, in bytes.
    pub byte_high_water_mark: usize,
    /// Default high-water-mark for object-mode streams, in chunks.
    pub object_high_water_mark: usize,
}

impl Default for StreamDefaults {
    fn default() -> Self {
        Self {
            byte_high_water_mark: DEFAULT_BYTE_HIGH_WATER_MARK,
            object_high_water_mark: DEFAULT_OBJECT_HIGH_WATER_MARK,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("sluice")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("{0} must be greater than zero")]
    ZeroHighWaterMark(&'static str),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SluiceConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            SluiceConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a specific file, without env overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SLUICE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.streams.byte_high_water_mark == 0 {
            return Err(ConfigError::ZeroHighWaterMark("streams.byte_high_water_mark"));
        }
        if self.streams.object_high_water_mark == 0 {
            return Err(ConfigError::ZeroHighWaterMark(
                "streams.object_high_water_mark",
            ));
        }
        Ok(())
    }

    /// A `StreamConfig` for `mode` using these defaults.
    pub fn stream(&self, mode: Mode) -> StreamConfig {
        let high_water_mark = match mode {
            Mode::Bytes => self.streams.byte_high_water_mark,
            Mode::Objects => self.streams.object_high_water_mark,
        };
        StreamConfig {
            name: String::from("stream"),
            high_water_mark,
            mode,
        }
    }

    /// Apply SLUICE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SLUICE_STREAMS__BYTE_HIGH_WATER_MARK") {
            if let Ok(n) = v.parse() {
                self.streams.byte_high_water_mark = n;
            }
        }
        if let Ok(v) = std::env::var("SLUICE_STREAMS__OBJECT_HIGH_WATER_MARK") {
            if let Ok(n) = v.parse() {
                self.streams.object_high_water_mark = n;
            }
        }
    }
}
