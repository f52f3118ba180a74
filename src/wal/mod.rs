//! Write-Ahead Log (WAL) Module
//!
//! Provides durability guarantees through append-only logging.
//!
//! ## Responsibilities
//! - Append a record before the mutation it describes is applied
//! - CRC32 checksums for corruption and torn-write detection
//! - Gapless Log Sequence Numbers (LSN) for ordering
//! - Segment rotation, archiving and reclamation
//!
//! ## Directory Layout
//! ```text
//! wal/
//! ├── 0000000000000007.wal   Full (sealed by a trailer)
//! ├── 0000000000000008.wal   Active
//! └── archive/
//!     ├── 0000000000000005.wal   Archived (needed by retained checkpoints)
//!     └── 0000000000000006.wal   Reclaimable once older than retention
//! ```
//!
//! ## Frame Format
//! ```text
//! ┌─────────┬─────────┬─────────┬──────────────────┐
//! │ Len (4) │ CRC (4) │ LSN (8) │ Body (bincode)   │
//! └─────────┴─────────┴─────────┴──────────────────┘
//! ```

mod flusher;
mod manager;
mod reader;
mod record;
mod segment;

pub use flusher::WalFlusher;
pub use manager::{SegmentInfo, WalManager};
pub use reader::{
    inspect_segments, locate_segments, SegmentLocation, SegmentReport, TornTail, WalReader,
};
pub use record::{
    decode_frame, encode_frame, FrameDecode, LoggedRecord, Lsn, TxMarkerKind, WalRecord,
    FRAME_HEADER_SIZE, MAX_RECORD_BODY, SEAL_MARKER,
};
pub use segment::{
    decode_trailer, encode_trailer, list_segments, parse_segment_ordinal, segment_file_name,
    SegmentHeader, SegmentMeta, SegmentState, SEGMENT_HEADER_SIZE, SEGMENT_TRAILER_SIZE,
};
