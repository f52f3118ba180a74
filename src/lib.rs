//! # GridVault
//!
//! Crash-consistent page storage for one node of a partitioned in-memory
//! data grid:
//! - Segmented Write-Ahead Log (WAL) with archiving and reclamation
//! - Fuzzy checkpoints with copy-on-write page snapshots
//! - Crash recovery with torn-tail truncation
//! - Lock-free sliding-window persistence metrics
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                              │
//! │        (allocate / write / read / tx markers / close)       │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                     Page Memory                             │
//! │        (per-page locks, dirty generations, COW)             │
//! └──────────┬──────────────────────────────────┬───────────────┘
//!            │ append before apply              │ dirty snapshot
//!            ▼                                  ▼
//!   ┌─────────────────┐              ┌──────────────────────┐
//!   │   WAL Manager   │◄─────────────│ Checkpoint Coordinator│
//!   │   (segments)    │ begin / end  │  (checkpointer thread)│
//!   └────────┬────────┘              └──────────┬───────────┘
//!            │                                  │ page writes
//!            ▼                                  ▼
//!   ┌─────────────────┐              ┌──────────────────────┐
//!   │  wal/*.wal      │              │  store/part-*.bin    │
//!   └─────────────────┘              └──────────────────────┘
//!
//!   Recovery Manager: store pages + WAL replay ─► Page Memory (at startup)
//!   PersistenceMetrics: fed by the WAL manager and the coordinator
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod io;

pub mod page;
pub mod wal;
pub mod checkpoint;
pub mod recovery;
pub mod metrics;
pub mod topology;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{GridError, Result};
pub use config::{Config, WalSyncStrategy};
pub use engine::Engine;
pub use page::{PageId, PageKind};
pub use checkpoint::{Checkpoint, CheckpointReason, CheckpointState};
pub use metrics::{HitRateCounter, PersistenceMetrics, PersistenceMetricsSnapshot};
pub use recovery::RecoveredState;
pub use topology::{CacheContext, NoopTopology, TopologyValidator};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of GridVault
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
