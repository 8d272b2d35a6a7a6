//! Explicit context object handed to hashers and restore sessions.
//!
//! Settings are loaded once and shared as an `Arc<Config>`.  Holders keep
//! whatever snapshot they were given; `invalidate()` only affects the next
//! `get()`, which reloads from the backing file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::{Config, ConfigError};
use crate::index::IndexGeneration;

/// Reference-counted, explicitly invalidated configuration cache.
#[derive(Debug)]
pub struct SettingsCache {
    source: Source,
    entry:  RwLock<Option<Arc<Config>>>,
}

#[derive(Debug)]
enum Source {
    File(PathBuf),
    Fixed(Arc<Config>),
}

impl SettingsCache {
    /// Cache backed by a JSON file, loaded lazily.
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self { source: Source::File(path.into()), entry: RwLock::new(None) }
    }

    /// Cache pinned to an in-memory configuration.
    pub fn fixed(config: Config) -> Self {
        Self { source: Source::Fixed(Arc::new(config)), entry: RwLock::new(None) }
    }

    pub fn source_path(&self) -> Option<&Path> {
        match &self.source {
            Source::File(path) => Some(path),
            Source::Fixed(_)   => None,
        }
    }

    pub fn get(&self) -> Result<Arc<Config>, ConfigError> {
        if let Some(cfg) = self.entry.read().as_ref() {
            return Ok(Arc::clone(cfg));
        }
        let mut slot = self.entry.write();
        if let Some(cfg) = slot.as_ref() {
            return Ok(Arc::clone(cfg));
        }
        let cfg = match &self.source {
            Source::File(path) => Arc::new(Config::load(path)?),
            Source::Fixed(cfg) => Arc::clone(cfg),
        };
        *slot = Some(Arc::clone(&cfg));
        Ok(cfg)
    }

    /// Drop the cached entry so the next `get()` reloads it.
    pub fn invalidate(&self) {
        tracing::debug!(source = ?self.source_path(), "settings cache invalidated");
        *self.entry.write() = None;
    }
}

/// Everything a hasher or restore session needs from its surroundings.
#[derive(Debug, Clone)]
pub struct SyncContext {
    pub settings:   Arc<SettingsCache>,
    pub generation: IndexGeneration,
}

impl SyncContext {
    pub fn new(settings: SettingsCache) -> Self {
        Self { settings: Arc::new(settings), generation: IndexGeneration::new() }
    }

    pub fn with_config(config: Config) -> Self {
        Self::new(SettingsCache::fixed(config))
    }

    pub fn config(&self) -> Result<Arc<Config>, ConfigError> {
        self.settings.get()
    }
}

impl Default for SyncContext {
    fn default() -> Self {
        Self::with_config(Config::default())
    }
}
