//! Configuration for GridVault
//!
//! Centralized configuration with sensible defaults. Values are validated
//! once, when the config is built; nothing downstream re-checks them.

use std::path::PathBuf;

use crate::error::{GridError, Result};
use crate::page::PAGE_HEADER_SIZE;
use crate::wal::{SEGMENT_HEADER_SIZE, SEGMENT_TRAILER_SIZE};

/// Smallest accepted page size
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest accepted page size
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

/// Main configuration for a GridVault node
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── store/part-NNNNN.bin   (one page store per partition)
    ///     ├── wal/NNNN...NNNN.wal    (active and full segments)
    ///     ├── wal/archive/           (archived segments)
    ///     └── checkpoint.marker      (last complete checkpoint hint)
    pub data_dir: PathBuf,

    /// Size of every page in bytes (power of two)
    pub page_size: usize,

    // -------------------------------------------------------------------------
    // WAL Configuration
    // -------------------------------------------------------------------------
    /// Maximum size of one WAL segment file (in bytes)
    pub wal_segment_size: u64,

    /// Sync strategy: when appended records are fsynced
    pub wal_sync_strategy: WalSyncStrategy,

    /// Number of completed checkpoints whose WAL is retained
    pub wal_history_size: usize,

    // -------------------------------------------------------------------------
    // Checkpoint Configuration
    // -------------------------------------------------------------------------
    /// Time-based trigger: checkpoint when this long has passed since the last one
    pub checkpoint_frequency_ms: u64,

    /// Dirty-page trigger (0 disables)
    pub checkpoint_dirty_pages_threshold: usize,

    /// WAL-size trigger in bytes appended since the last checkpoint (0 disables)
    pub checkpoint_wal_bytes_threshold: u64,

    // -------------------------------------------------------------------------
    // Metrics Configuration
    // -------------------------------------------------------------------------
    /// Collect persistence metrics
    pub metrics_enabled: bool,

    /// Sliding window length for rate metrics (milliseconds)
    pub rate_time_interval_ms: u64,

    /// Number of buckets the rate window is split into
    pub sub_intervals: usize,
}

/// WAL sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalSyncStrategy {
    /// fsync after every append (safest, slowest)
    EveryWrite,

    /// Background flusher fsyncs every `interval_ms`
    Background { interval_ms: u64 },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./gridvault_data"),
            page_size: 4096,
            wal_segment_size: 16 * 1024 * 1024, // 16 MB
            wal_sync_strategy: WalSyncStrategy::Background { interval_ms: 20 },
            wal_history_size: 1,
            checkpoint_frequency_ms: 180_000,
            checkpoint_dirty_pages_threshold: 0,
            checkpoint_wal_bytes_threshold: 0,
            metrics_enabled: false,
            rate_time_interval_ms: 60_000,
            sub_intervals: 5,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Directory holding the per-partition page stores
    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    /// Directory holding active and full WAL segments
    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }

    /// Directory holding archived WAL segments
    pub fn wal_archive_dir(&self) -> PathBuf {
        self.wal_dir().join("archive")
    }

    /// Path of the last-complete-checkpoint marker
    pub fn marker_path(&self) -> PathBuf {
        self.data_dir.join("checkpoint.marker")
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(GridError::Config(format!(
                "page_size must be a power of two in {}..={}, got {}",
                MIN_PAGE_SIZE, MAX_PAGE_SIZE, self.page_size
            )));
        }

        // A segment must fit at least one full-page delta next to its header and trailer
        let min_segment = (SEGMENT_HEADER_SIZE + SEGMENT_TRAILER_SIZE) as u64
            + 2 * (self.page_size + PAGE_HEADER_SIZE) as u64;
        if self.wal_segment_size < min_segment {
            return Err(GridError::Config(format!(
                "wal_segment_size must be at least {} bytes for page_size {}, got {}",
                min_segment, self.page_size, self.wal_segment_size
            )));
        }

        if let WalSyncStrategy::Background { interval_ms } = self.wal_sync_strategy {
            if interval_ms == 0 {
                return Err(GridError::Config(
                    "background WAL flush interval must be non-zero".to_string(),
                ));
            }
        }

        if self.wal_history_size == 0 {
            return Err(GridError::Config(
                "wal_history_size must be at least 1".to_string(),
            ));
        }

        if self.checkpoint_frequency_ms == 0 {
            return Err(GridError::Config(
                "checkpoint_frequency_ms must be non-zero".to_string(),
            ));
        }

        validate_rate_window(self.rate_time_interval_ms, self.sub_intervals)
    }
}

/// Check a rate window / bucket count pair
///
/// Shared by config validation and runtime reconfiguration of the metrics.
pub fn validate_rate_window(rate_time_interval_ms: u64, sub_intervals: usize) -> Result<()> {
    if rate_time_interval_ms == 0 {
        return Err(GridError::Config(
            "rate_time_interval_ms must be non-zero".to_string(),
        ));
    }
    if sub_intervals == 0 {
        return Err(GridError::Config("sub_intervals must be non-zero".to_string()));
    }
    if rate_time_interval_ms < sub_intervals as u64 {
        return Err(GridError::Config(format!(
            "rate_time_interval_ms ({}) must be at least sub_intervals ({})",
            rate_time_interval_ms, sub_intervals
        )));
    }
    Ok(())
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the page size (in bytes)
    pub fn page_size(mut self, size: usize) -> Self {
        self.config.page_size = size;
        self
    }

    /// Set the WAL segment size (in bytes)
    pub fn wal_segment_size(mut self, size: u64) -> Self {
        self.config.wal_segment_size = size;
        self
    }

    /// Set the WAL sync strategy
    pub fn wal_sync_strategy(mut self, strategy: WalSyncStrategy) -> Self {
        self.config.wal_sync_strategy = strategy;
        self
    }

    /// Set how many completed checkpoints keep their WAL
    pub fn wal_history_size(mut self, count: usize) -> Self {
        self.config.wal_history_size = count;
        self
    }

    /// Set the time-based checkpoint trigger (in milliseconds)
    pub fn checkpoint_frequency_ms(mut self, ms: u64) -> Self {
        self.config.checkpoint_frequency_ms = ms;
        self
    }

    /// Set the dirty-page checkpoint trigger
    pub fn checkpoint_dirty_pages_threshold(mut self, pages: usize) -> Self {
        self.config.checkpoint_dirty_pages_threshold = pages;
        self
    }

    /// Set the WAL-size checkpoint trigger (in bytes)
    pub fn checkpoint_wal_bytes_threshold(mut self, bytes: u64) -> Self {
        self.config.checkpoint_wal_bytes_threshold = bytes;
        self
    }

    /// Enable or disable metrics collection
    pub fn metrics_enabled(mut self, enabled: bool) -> Self {
        self.config.metrics_enabled = enabled;
        self
    }

    /// Set the rate metrics window (in milliseconds)
    pub fn rate_time_interval_ms(mut self, ms: u64) -> Self {
        self.config.rate_time_interval_ms = ms;
        self
    }

    /// Set the number of rate metrics buckets
    pub fn sub_intervals(mut self, count: usize) -> Self {
        self.config.sub_intervals = count;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
