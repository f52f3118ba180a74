//! Sliding-window hit counter
//!
//! The window is split into `sub_intervals` buckets of equal width. Each
//! bucket is a pair of atomics: the full epoch it belongs to and its count.
//!
//! ```text
//! bucket i: ┌──────────────────────┐ ┌──────────────────────┐
//!           │ epoch (u64)          │ │ count (u64)          │
//!           └──────────────────────┘ └──────────────────────┘
//! ```
//!
//! Epoch `e` covers `[e * width, (e + 1) * width)` milliseconds since the
//! counter's origin and maps to bucket `e % sub_intervals`. A writer that
//! finds a bucket stamped with an older epoch claims it with one
//! compare-and-swap on the epoch and subtracts the count it saw before the
//! claim (lazy eviction); otherwise it adds. Epochs are never truncated, so
//! a bucket left alone for any length of time still reads as stale.
//!
//! Adds racing a claim land in the claimed epoch. Counts are statistics, so
//! that slack at bucket edges is accepted; nothing is ever counted twice.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::config::validate_rate_window;
use crate::error::Result;

#[derive(Default)]
struct Bucket {
    epoch: AtomicU64,
    count: AtomicU64,
}

/// Lock-free sliding-window event counter
pub struct HitRateCounter {
    window_ms: u64,
    bucket_ms: u64,
    buckets: Box<[Bucket]>,
    origin: Instant,
}

impl HitRateCounter {
    /// Counter over `window_ms` split into `sub_intervals` buckets
    pub fn new(window_ms: u64, sub_intervals: usize) -> Result<Self> {
        validate_rate_window(window_ms, sub_intervals)?;
        Ok(Self::with_origin(window_ms, sub_intervals, Instant::now()))
    }

    fn with_origin(window_ms: u64, sub_intervals: usize, origin: Instant) -> Self {
        let buckets = (0..sub_intervals)
            .map(|_| Bucket::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            window_ms,
            bucket_ms: window_ms / sub_intervals as u64,
            buckets,
            origin,
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn sub_intervals(&self) -> usize {
        self.buckets.len()
    }

    /// Milliseconds since this counter was created
    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    pub fn increment(&self) {
        self.add_at(self.now_ms(), 1);
    }

    pub fn add(&self, delta: u64) {
        self.add_at(self.now_ms(), delta);
    }

    /// Events counted in the window ending now
    pub fn rate(&self) -> u64 {
        self.rate_at(self.now_ms())
    }

    /// Add `delta` at `now_ms` milliseconds past the origin
    pub fn add_at(&self, now_ms: u64, delta: u64) {
        let epoch = now_ms / self.bucket_ms;
        let bucket = &self.buckets[(epoch % self.buckets.len() as u64) as usize];

        loop {
            let stamped = bucket.epoch.load(Ordering::Acquire);
            if stamped >= epoch {
                // Same epoch, or a faster writer already moved the bucket on
                bucket.count.fetch_add(delta, Ordering::AcqRel);
                return;
            }

            // Read before the claim: adds made after it belong to the new epoch
            let stale = bucket.count.load(Ordering::Acquire);
            if bucket
                .epoch
                .compare_exchange(stamped, epoch, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let _ = bucket
                    .count
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                        Some(count.saturating_sub(stale).saturating_add(delta))
                    });
                return;
            }
        }
    }

    /// Sum of buckets whose epoch lies within the window ending at `now_ms`
    pub fn rate_at(&self, now_ms: u64) -> u64 {
        let epoch = now_ms / self.bucket_ms;
        let span = self.buckets.len() as u64;
        self.buckets
            .iter()
            .map(|bucket| {
                let stamped = bucket.epoch.load(Ordering::Acquire);
                if stamped <= epoch && epoch - stamped < span {
                    bucket.count.load(Ordering::Acquire)
                } else {
                    0
                }
            })
            .sum()
    }

    /// Zero every bucket
    pub fn reset(&self) {
        for bucket in self.buckets.iter() {
            bucket.epoch.store(0, Ordering::Release);
            bucket.count.store(0, Ordering::Release);
        }
    }

    /// Change the window; all counts are dropped
    pub fn reconfigure(&mut self, window_ms: u64, sub_intervals: usize) -> Result<()> {
        validate_rate_window(window_ms, sub_intervals)?;
        *self = Self::with_origin(window_ms, sub_intervals, self.origin);
        Ok(())
    }
}

impl std::fmt::Debug for HitRateCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HitRateCounter")
            .field("window_ms", &self.window_ms)
            .field("sub_intervals", &self.buckets.len())
            .field("rate", &self.rate())
            .finish()
    }
}
