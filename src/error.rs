//! Error types for GridVault
//!
//! Provides a unified error type for all durability operations.
//!
//! ## Failure classes
//! - `IoFailure`: fatal to persistence. The WAL latches it and refuses
//!   every later append/fsync until the node restarts into recovery.
//! - `CorruptRecord`: checksum/length mismatch in the WAL. A torn tail is
//!   truncated during recovery; mid-stream corruption is fatal.
//! - `CheckpointAborted`: an I/O failure during a checkpoint. Dirty pages
//!   are preserved and retried by the next checkpoint.
//! - `Config`: rejected at configuration time.

use thiserror::Error;

use crate::page::PageId;

/// Result type alias using GridError
pub type Result<T> = std::result::Result<T, GridError>;

/// Unified error type for GridVault operations
#[derive(Debug, Error)]
pub enum GridError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Persistence failure (node must restart into recovery): {0}")]
    IoFailure(String),

    // -------------------------------------------------------------------------
    // WAL Errors
    // -------------------------------------------------------------------------
    #[error("Corrupt WAL record in segment {segment} at offset {offset}: {reason}")]
    CorruptRecord {
        segment: u64,
        offset: u64,
        reason: String,
    },

    // -------------------------------------------------------------------------
    // Checkpoint Errors
    // -------------------------------------------------------------------------
    #[error("Checkpoint {checkpoint_id} aborted: {reason}")]
    CheckpointAborted { checkpoint_id: u64, reason: String },

    // -------------------------------------------------------------------------
    // Page Errors
    // -------------------------------------------------------------------------
    #[error("Page store for partition {partition} is corrupt: {reason}")]
    CorruptStore { partition: u32, reason: String },

    #[error("Page store for partition {0} is missing")]
    MissingPartitionStore(u32),

    #[error("Page not found: {0}")]
    PageNotFound(PageId),

    #[error("Write of {len} bytes at offset {offset} exceeds page payload of {capacity} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    // -------------------------------------------------------------------------
    // Collaborator / Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Topology validation failed: {0}")]
    Topology(String),

    #[error("Transaction {0} is not open")]
    UnknownTransaction(u64),

    #[error("Engine is shut down")]
    Shutdown,
}

impl GridError {
    /// True for errors after which the durability subsystem must not accept
    /// further mutations.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GridError::IoFailure(_) | GridError::Io(_))
    }
}

impl From<bincode::Error> for GridError {
    fn from(err: bincode::Error) -> Self {
        GridError::Serialization(err.to_string())
    }
}
