//! Persistence metrics
//!
//! Polled read surface over WAL throughput and the last completed
//! checkpoint. Every getter returns 0 while collection is disabled, and
//! every recording hook is a no-op then.

use std::fmt;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::config::{validate_rate_window, Config};
use crate::error::Result;

use super::rate::HitRateCounter;

/// The window-based counters; replaced as a unit on reconfiguration
struct RateSet {
    interval_ms: u64,
    sub_intervals: usize,
    /// Records appended
    wal_logging: HitRateCounter,
    /// Frame bytes appended
    wal_writing: HitRateCounter,
    wal_fsync_count: HitRateCounter,
    wal_fsync_micros: HitRateCounter,
}

impl RateSet {
    fn new(interval_ms: u64, sub_intervals: usize) -> Result<Self> {
        Ok(Self {
            interval_ms,
            sub_intervals,
            wal_logging: HitRateCounter::new(interval_ms, sub_intervals)?,
            wal_writing: HitRateCounter::new(interval_ms, sub_intervals)?,
            wal_fsync_count: HitRateCounter::new(interval_ms, sub_intervals)?,
            wal_fsync_micros: HitRateCounter::new(interval_ms, sub_intervals)?,
        })
    }

    fn per_second(&self, sum: u64) -> f32 {
        (sum as f64 * 1000.0 / self.interval_ms as f64) as f32
    }
}

// Field order inside `LastCheckpoint::fields`
const CP_DURATION: usize = 0;
const CP_FSYNC: usize = 1;
const CP_TOTAL: usize = 2;
const CP_DATA: usize = 3;
const CP_INDEX: usize = 4;
const CP_COW: usize = 5;
const CP_FIELDS: usize = 6;

/// Last completed checkpoint, published under a sequence lock
///
/// Readers retry while `seq` is odd or changed during the read, so they
/// never observe values from two different checkpoints.
struct LastCheckpoint {
    seq: AtomicU64,
    fields: [AtomicU64; CP_FIELDS],
    writer: Mutex<()>,
}

impl LastCheckpoint {
    fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            fields: Default::default(),
            writer: Mutex::new(()),
        }
    }

    fn publish(&self, values: [u64; CP_FIELDS]) {
        let _writer = self.writer.lock();
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq + 1, Ordering::Relaxed);
        fence(Ordering::Release);
        for (field, value) in self.fields.iter().zip(values) {
            field.store(value, Ordering::Relaxed);
        }
        self.seq.store(seq + 2, Ordering::Release);
    }

    fn read(&self) -> [u64; CP_FIELDS] {
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let mut values = [0u64; CP_FIELDS];
            for (value, field) in values.iter_mut().zip(&self.fields) {
                *value = field.load(Ordering::Relaxed);
            }
            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == before {
                return values;
            }
        }
    }

    fn get(&self, field: usize) -> u64 {
        self.read()[field]
    }
}

/// Persistence metrics owned by the engine and shared with the WAL manager
/// and checkpoint coordinator
pub struct PersistenceMetrics {
    enabled: AtomicBool,
    origin: Instant,
    rates: RwLock<RateSet>,
    wal_archive_segments: AtomicU64,
    last_checkpoint: LastCheckpoint,
}

impl PersistenceMetrics {
    pub fn new(enabled: bool, rate_time_interval_ms: u64, sub_intervals: usize) -> Result<Self> {
        Ok(Self {
            enabled: AtomicBool::new(enabled),
            origin: Instant::now(),
            rates: RwLock::new(RateSet::new(rate_time_interval_ms, sub_intervals)?),
            wal_archive_segments: AtomicU64::new(0),
            last_checkpoint: LastCheckpoint::new(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.metrics_enabled,
            config.rate_time_interval_ms,
            config.sub_intervals,
        )
    }

    // =========================================================================
    // Control
    // =========================================================================

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Change the rate window; drops every count collected so far
    pub fn set_rate_time_interval(&self, rate_time_interval_ms: u64) -> Result<()> {
        let mut rates = self.rates.write();
        validate_rate_window(rate_time_interval_ms, rates.sub_intervals)?;
        *rates = RateSet::new(rate_time_interval_ms, rates.sub_intervals)?;
        Ok(())
    }

    /// Change the bucket count; drops every count collected so far
    pub fn set_sub_intervals(&self, sub_intervals: usize) -> Result<()> {
        let mut rates = self.rates.write();
        validate_rate_window(rates.interval_ms, sub_intervals)?;
        *rates = RateSet::new(rates.interval_ms, sub_intervals)?;
        Ok(())
    }

    pub fn rate_time_interval_ms(&self) -> u64 {
        self.rates.read().interval_ms
    }

    pub fn sub_intervals(&self) -> usize {
        self.rates.read().sub_intervals
    }

    /// Zero all window counters without changing their shape
    pub fn reset_rates(&self) {
        let rates = self.rates.read();
        rates.wal_logging.reset();
        rates.wal_writing.reset();
        rates.wal_fsync_count.reset();
        rates.wal_fsync_micros.reset();
    }

    // =========================================================================
    // Recording Hooks
    // =========================================================================

    /// One record of `bytes` frame bytes was appended
    pub fn on_wal_record(&self, bytes: u64) {
        if !self.is_enabled() {
            return;
        }
        let now = self.now_ms();
        let rates = self.rates.read();
        rates.wal_logging.add_at(now, 1);
        rates.wal_writing.add_at(now, bytes);
    }

    /// A WAL fsync completed after `elapsed`
    pub fn on_wal_fsync(&self, elapsed: Duration) {
        if !self.is_enabled() {
            return;
        }
        let now = self.now_ms();
        let rates = self.rates.read();
        rates.wal_fsync_count.add_at(now, 1);
        rates.wal_fsync_micros.add_at(now, elapsed.as_micros() as u64);
    }

    /// Archived segment count changed
    pub fn set_wal_archive_segments(&self, count: u64) {
        self.wal_archive_segments.store(count, Ordering::Relaxed);
    }

    /// A checkpoint completed
    pub fn on_checkpoint(
        &self,
        duration: Duration,
        fsync_duration: Duration,
        total_pages: u64,
        data_pages: u64,
        index_pages: u64,
        cow_pages: u64,
    ) {
        if !self.is_enabled() {
            return;
        }
        let mut values = [0u64; CP_FIELDS];
        values[CP_DURATION] = duration.as_millis() as u64;
        values[CP_FSYNC] = fsync_duration.as_millis() as u64;
        values[CP_TOTAL] = total_pages;
        values[CP_DATA] = data_pages;
        values[CP_INDEX] = index_pages;
        values[CP_COW] = cow_pages;
        self.last_checkpoint.publish(values);
    }

    // =========================================================================
    // Getters
    // =========================================================================

    /// Records appended per second over the window
    pub fn wal_logging_rate(&self) -> f32 {
        if !self.is_enabled() {
            return 0.0;
        }
        let now = self.now_ms();
        let rates = self.rates.read();
        rates.per_second(rates.wal_logging.rate_at(now))
    }

    /// Bytes appended per second over the window
    pub fn wal_writing_rate(&self) -> f32 {
        if !self.is_enabled() {
            return 0.0;
        }
        let now = self.now_ms();
        let rates = self.rates.read();
        rates.per_second(rates.wal_writing.rate_at(now))
    }

    /// Archived segments not yet reclaimed
    pub fn wal_archive_segments(&self) -> u64 {
        if !self.is_enabled() {
            return 0;
        }
        self.wal_archive_segments.load(Ordering::Relaxed)
    }

    /// Average WAL fsync time in microseconds over the window
    pub fn wal_fsync_time_average(&self) -> f32 {
        if !self.is_enabled() {
            return 0.0;
        }
        let now = self.now_ms();
        let rates = self.rates.read();
        let count = rates.wal_fsync_count.rate_at(now);
        if count == 0 {
            return 0.0;
        }
        rates.wal_fsync_micros.rate_at(now) as f32 / count as f32
    }

    /// Wall time of the last checkpoint in milliseconds
    pub fn last_checkpointing_duration(&self) -> u64 {
        self.checkpoint_field(CP_DURATION)
    }

    /// Page store fsync time of the last checkpoint in milliseconds
    pub fn last_checkpoint_fsync_duration(&self) -> u64 {
        self.checkpoint_field(CP_FSYNC)
    }

    pub fn last_checkpoint_total_pages_number(&self) -> u64 {
        self.checkpoint_field(CP_TOTAL)
    }

    pub fn last_checkpoint_data_pages_number(&self) -> u64 {
        self.checkpoint_field(CP_DATA)
    }

    pub fn last_checkpoint_index_pages_number(&self) -> u64 {
        self.checkpoint_field(CP_INDEX)
    }

    pub fn last_checkpoint_copied_on_write_pages_number(&self) -> u64 {
        self.checkpoint_field(CP_COW)
    }

    /// All getters at once; the checkpoint fields come from one checkpoint
    pub fn snapshot(&self) -> PersistenceMetricsSnapshot {
        if !self.is_enabled() {
            return PersistenceMetricsSnapshot::default();
        }
        let cp = self.last_checkpoint.read();
        PersistenceMetricsSnapshot {
            wal_logging_rate: self.wal_logging_rate(),
            wal_writing_rate: self.wal_writing_rate(),
            wal_archive_segments: self.wal_archive_segments(),
            wal_fsync_time_average: self.wal_fsync_time_average(),
            last_checkpointing_duration: cp[CP_DURATION],
            last_checkpoint_fsync_duration: cp[CP_FSYNC],
            last_checkpoint_total_pages: cp[CP_TOTAL],
            last_checkpoint_data_pages: cp[CP_DATA],
            last_checkpoint_index_pages: cp[CP_INDEX],
            last_checkpoint_cow_pages: cp[CP_COW],
        }
    }

    fn checkpoint_field(&self, field: usize) -> u64 {
        if !self.is_enabled() {
            return 0;
        }
        self.last_checkpoint.get(field)
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

impl fmt::Debug for PersistenceMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceMetrics")
            .field("enabled", &self.is_enabled())
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Point-in-time copy of every persistence metric
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PersistenceMetricsSnapshot {
    pub wal_logging_rate: f32,
    pub wal_writing_rate: f32,
    pub wal_archive_segments: u64,
    pub wal_fsync_time_average: f32,
    pub last_checkpointing_duration: u64,
    pub last_checkpoint_fsync_duration: u64,
    pub last_checkpoint_total_pages: u64,
    pub last_checkpoint_data_pages: u64,
    pub last_checkpoint_index_pages: u64,
    pub last_checkpoint_cow_pages: u64,
}

impl fmt::Display for PersistenceMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "wal_logging_rate={:.2}/s wal_writing_rate={:.2}B/s wal_archive_segments={} \
             wal_fsync_avg_us={:.1} last_cp_ms={} last_cp_fsync_ms={} last_cp_pages={} \
             (data={} index={} cow={})",
            self.wal_logging_rate,
            self.wal_writing_rate,
            self.wal_archive_segments,
            self.wal_fsync_time_average,
            self.last_checkpointing_duration,
            self.last_checkpoint_fsync_duration,
            self.last_checkpoint_total_pages,
            self.last_checkpoint_data_pages,
            self.last_checkpoint_index_pages,
            self.last_checkpoint_cow_pages,
        )
    }
}
