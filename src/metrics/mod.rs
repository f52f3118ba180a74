//! Metrics Module
//!
//! ## Components
//! - [`HitRateCounter`]: lock-free sliding-window counter
//! - [`PersistenceMetrics`]: WAL and checkpoint getters built on it
//!
//! ```text
//!  WalManager ──on_wal_record/on_wal_fsync──┐
//!                                           ▼
//!  CheckpointCoordinator ──on_checkpoint──► PersistenceMetrics ──snapshot()──► pollers
//! ```

mod persistence;
mod rate;

pub use persistence::{PersistenceMetrics, PersistenceMetricsSnapshot};
pub use rate::HitRateCounter;
