use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::preview::{
    DEFAULT_BATCH_SIZE, DEFAULT_CACHE_BYTE_BUDGET, DEFAULT_CACHE_ENTRY_CAP, DEFAULT_JPEG_QUALITY,
    DEFAULT_LONG_DELAY, DEFAULT_MAX_DIMENSION, DEFAULT_POOL_CAPACITY, DEFAULT_RANGE_BUFFER,
    DEFAULT_RENDER_SCALE, DEFAULT_SHORT_DELAY, DEFAULT_SWEEP_CONCURRENCY, LoaderConfig,
    RenderOptions, SchedulerConfig,
};

const SETTINGS_FILENAME: &str = "config.yaml";
const APP_NAME: &str = "folio";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,

    #[serde(default = "default_cache_byte_budget")]
    pub cache_byte_budget: usize,

    #[serde(default = "default_cache_entry_cap")]
    pub cache_entry_cap: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Debounce while only early pages are queued
    #[serde(default = "default_short_delay_ms")]
    pub short_delay_ms: u64,

    #[serde(default = "default_long_delay_ms")]
    pub long_delay_ms: u64,

    #[serde(default = "default_render_scale")]
    pub render_scale: f32,

    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,

    /// Pages loaded on each side of the visible range
    #[serde(default = "default_range_buffer")]
    pub range_buffer: usize,

    #[serde(default = "default_sweep_concurrency")]
    pub sweep_concurrency: usize,
}

fn default_pool_capacity() -> usize {
    DEFAULT_POOL_CAPACITY
}

fn default_cache_byte_budget() -> usize {
    DEFAULT_CACHE_BYTE_BUDGET
}

fn default_cache_entry_cap() -> usize {
    DEFAULT_CACHE_ENTRY_CAP
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_short_delay_ms() -> u64 {
    DEFAULT_SHORT_DELAY.as_millis() as u64
}

fn default_long_delay_ms() -> u64 {
    DEFAULT_LONG_DELAY.as_millis() as u64
}

fn default_render_scale() -> f32 {
    DEFAULT_RENDER_SCALE
}

fn default_jpeg_quality() -> u8 {
    DEFAULT_JPEG_QUALITY
}

fn default_max_dimension() -> u32 {
    DEFAULT_MAX_DIMENSION
}

fn default_range_buffer() -> usize {
    DEFAULT_RANGE_BUFFER
}

fn default_sweep_concurrency() -> usize {
    DEFAULT_SWEEP_CONCURRENCY
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pool_capacity: default_pool_capacity(),
            cache_byte_budget: default_cache_byte_budget(),
            cache_entry_cap: default_cache_entry_cap(),
            batch_size: default_batch_size(),
            short_delay_ms: default_short_delay_ms(),
            long_delay_ms: default_long_delay_ms(),
            render_scale: default_render_scale(),
            jpeg_quality: default_jpeg_quality(),
            max_dimension: default_max_dimension(),
            range_buffer: default_range_buffer(),
            sweep_concurrency: default_sweep_concurrency(),
        }
    }
}

/// `<config dir>/folio/config.yaml`
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|config| config.join(APP_NAME).join(SETTINGS_FILENAME))
}

impl Settings {
    /// Load from `explicit`, or from the default location if it exists.
    ///
    /// Never fails: unreadable or malformed files are logged and the
    /// defaults used instead.
    #[must_use]
    pub fn load(explicit: Option<&Path>) -> Self {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match default_config_path() {
                Some(path) if path.exists() => path,
                Some(path) => {
                    info!("Settings file not found at {path:?}, using defaults");
                    return Self::default();
                }
                None => {
                    warn!("Could not determine config directory, using default settings");
                    return Self::default();
                }
            },
        };

        match Self::read_from(&path) {
            Ok(settings) => {
                debug!("Loaded settings from {path:?}");
                settings.sanitized()
            }
            Err(e) => {
                error!("{e}");
                Self::default()
            }
        }
    }

    pub fn read_from(path: &Path) -> Result<Self, SettingsError> {
        let content = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(content: &str) -> Result<Self, serde_yaml::Error> {
        // An empty file deserializes to unit, not to a mapping
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Clamp values that would stall the scheduler
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        self.pool_capacity = self.pool_capacity.max(1);
        self.cache_entry_cap = self.cache_entry_cap.max(1);
        self.batch_size = self.batch_size.max(1);
        self.sweep_concurrency = self.sweep_concurrency.max(1);
        self.jpeg_quality = self.jpeg_quality.clamp(1, 100);
        if !(self.render_scale.is_finite() && self.render_scale > 0.0) {
            warn!(
                "Invalid render_scale {}, using {}",
                self.render_scale, DEFAULT_RENDER_SCALE
            );
            self.render_scale = DEFAULT_RENDER_SCALE;
        }
        self
    }

    #[must_use]
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            pool_capacity: self.pool_capacity,
            cache_byte_budget: self.cache_byte_budget,
            cache_entry_cap: self.cache_entry_cap,
            batch_size: self.batch_size,
            short_delay: Duration::from_millis(self.short_delay_ms),
            long_delay: Duration::from_millis(self.long_delay_ms),
            render: RenderOptions {
                scale: self.render_scale,
                quality: self.jpeg_quality,
                max_dimension: self.max_dimension,
            },
        }
    }

    #[must_use]
    pub fn loader_config(&self) -> LoaderConfig {
        LoaderConfig {
            batch_size: self.batch_size,
            buffer: self.range_buffer,
            max_concurrent: self.sweep_concurrency,
        }
    }
}
