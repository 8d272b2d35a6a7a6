//! Runtime configuration.
//!
//! Every field has a default, so an empty JSON object (or no file at all)
//! yields the production values.  Unknown keys are rejected to catch typos.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::settings::{ChunkSettings, GeometryError};

/// Block size handed to the CBT collaborator when paging file extents.
pub const DEFAULT_INDEX_BLOCK_SIZE: u64 = 4096;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid chunk geometry: {0}")]
    Geometry(#[from] GeometryError),
    #[error("Invalid queue settings: {0}")]
    Queue(String),
}

// ── QueueSettings ─────────────────────────────────────────────────────────────

/// Tuning for the restore download queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueSettings {
    /// Producers block while the weighted queue size exceeds this.
    pub high_water_mark:  usize,
    pub full_weight:      usize,
    pub chunked_weight:   usize,
    /// Producer re-check interval while blocked on the high water mark.
    pub poll_interval_ms: u64,
    /// Extra attempts after a hash mismatch.
    pub hash_retries:     u32,
    /// Buffer used to zero a range when punching a hole is not possible.
    pub zero_buffer_size: usize,
    /// Reproduce source holes with `fallocate` before falling back to zeros.
    pub punch_holes:      bool,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            high_water_mark:  500,
            full_weight:      1,
            chunked_weight:   4,
            poll_interval_ms: 1000,
            hash_retries:     5,
            zero_buffer_size: 32 * 1024,
            punch_holes:      true,
        }
    }
}

impl QueueSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ── Config ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub chunk:               ChunkSettings,
    pub queue:               QueueSettings,
    pub index_block_size:    u64,
    /// Retry a failed destination open under `name_0`, `name_1`, ...
    pub rename_on_collision: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk:               ChunkSettings::default(),
            queue:               QueueSettings::default(),
            index_block_size:    DEFAULT_INDEX_BLOCK_SIZE,
            rename_on_collision: cfg!(windows),
        }
    }
}

impl Config {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = serde_json::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let cfg = Self::from_json(&text)?;
        tracing::debug!(path = %path.display(), "loaded configuration");
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.chunk.validate()?;
        if self.queue.zero_buffer_size == 0 {
            return Err(ConfigError::Queue("zero_buffer_size must be non-zero".into()));
        }
        if self.queue.full_weight == 0 || self.queue.chunked_weight == 0 {
            return Err(ConfigError::Queue("item weights must be non-zero".into()));
        }
        if self.index_block_size == 0 {
            return Err(ConfigError::Queue("index_block_size must be non-zero".into()));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let cfg = Config::from_json("{}").unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.queue.high_water_mark, 500);
        assert_eq!(cfg.queue.chunked_weight, 4);
    }

    #[test]
    fn partial_override() {
        let cfg = Config::from_json(r#"{"queue": {"high_water_mark": 8, "poll_interval_ms": 5}}"#).unwrap();
        assert_eq!(cfg.queue.high_water_mark, 8);
        assert_eq!(cfg.queue.poll_interval(), Duration::from_millis(5));
        assert_eq!(cfg.queue.hash_retries, 5);
    }

    #[test]
    fn rejects_bad_geometry_and_unknown_keys() {
        assert!(matches!(
            Config::from_json(r#"{"chunk": {"checkpoint_size": 1000, "small_block_size": 512}}"#),
            Err(ConfigError::Geometry(_))
        ));
        assert!(matches!(Config::from_json(r#"{"bogus": 1}"#), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn json_roundtrip() {
        let cfg = Config::default();
        assert_eq!(Config::from_json(&cfg.to_json().unwrap()).unwrap(), cfg);
    }
}
