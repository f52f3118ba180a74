//! Checkpoint Module
//!
//! Moves dirty pages from page memory into the page stores and records the
//! point recovery may start from.
//!
//! ## State Machine
//! ```text
//!            ┌──────────────────────────────────────────────────────┐
//!            ▼                                                      │
//!  Idle ─► CollectingDirtyPages ─► WritingPages ─► FsyncingData     │
//!                                       │               │           │
//!                                       │               ▼           │
//!                                       │      WritingCheckpointEnd │
//!                                       │               │           │
//!                                       │               ▼           │
//!                                       │          FsyncingWal ─────┘
//!                                       ▼ (any I/O failure)
//!                                    Aborted ─► next attempt retries the same pages
//! ```
//!
//! A checkpoint is complete once the WAL fsync covering its
//! `CheckpointEnd` record returns; the page writes alone prove nothing.

mod checkpointer;
mod coordinator;
mod marker;

use std::fmt;
use std::time::Duration;

use crate::wal::Lsn;

pub use checkpointer::Checkpointer;
pub use coordinator::CheckpointCoordinator;
pub use marker::{marker_size, CheckpointMarker, MarkerEntry};

/// Summary of a completed checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub id: u64,
    /// LSN of the `CheckpointBegin` record; page images reflect exactly the
    /// records up to here
    pub start_lsn: Lsn,
    /// LSN of the `CheckpointEnd` record
    pub end_lsn: Lsn,
    pub topology_version: u64,
    pub total_pages: u64,
    pub data_pages: u64,
    pub index_pages: u64,
    pub cow_pages: u64,
    /// Zero for checkpoints rediscovered by recovery
    pub duration: Duration,
    /// Zero for checkpoints rediscovered by recovery
    pub fsync_duration: Duration,
}

impl Checkpoint {
    pub fn marker_entry(&self) -> MarkerEntry {
        MarkerEntry {
            checkpoint_id: self.id,
            start_lsn: self.start_lsn,
            end_lsn: self.end_lsn,
        }
    }
}

/// Coordinator state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CheckpointState {
    Idle = 0,
    CollectingDirtyPages = 1,
    WritingPages = 2,
    FsyncingData = 3,
    WritingCheckpointEnd = 4,
    FsyncingWal = 5,
    Aborted = 6,
}

impl CheckpointState {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Idle),
            1 => Some(Self::CollectingDirtyPages),
            2 => Some(Self::WritingPages),
            3 => Some(Self::FsyncingData),
            4 => Some(Self::WritingCheckpointEnd),
            5 => Some(Self::FsyncingWal),
            6 => Some(Self::Aborted),
            _ => None,
        }
    }
}

/// Why a checkpoint was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointReason {
    Timer,
    DirtyPages,
    WalSize,
    Manual,
    Shutdown,
}

impl fmt::Display for CheckpointReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckpointReason::Timer => "timer",
            CheckpointReason::DirtyPages => "dirty_pages",
            CheckpointReason::WalSize => "wal_size",
            CheckpointReason::Manual => "manual",
            CheckpointReason::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}
