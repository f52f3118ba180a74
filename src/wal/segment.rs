//! WAL Segments
//!
//! A segment is a bounded file holding a contiguous LSN range.
//!
//! ## Segment Format
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │ Header (32)                                               │
//! │ ┌─────────┬────────┬──────┬─────────────┬─────────────┬──┐│
//! │ │Magic (4)│Ver (2) │ (2)  │ Ordinal (8) │First LSN (8)│CRC││
//! │ └─────────┴────────┴──────┴─────────────┴─────────────┴──┘│
//! ├───────────────────────────────────────────────────────────┤
//! │ Frame 1 .. Frame N                                        │
//! ├───────────────────────────────────────────────────────────┤
//! │ Trailer (16, written on rotation)                         │
//! │ ┌──────────────────┬───────────────┬──────────┐           │
//! │ │ SEAL_MARKER (4)  │ Last LSN (8)  │ CRC (4)  │           │
//! │ └──────────────────┴───────────────┴──────────┘           │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Lifecycle: `Active → Full → Archived → Reclaimable`.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

use super::record::{Lsn, SEAL_MARKER};

pub const SEGMENT_HEADER_SIZE: usize = 32;
pub const SEGMENT_TRAILER_SIZE: usize = 16;

const SEGMENT_MAGIC: [u8; 4] = *b"GVWL";
const SEGMENT_VERSION: u16 = 1;
const SEGMENT_EXTENSION: &str = "wal";

/// Where a segment is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Currently appendable (exactly one per node)
    Active,
    /// Sealed or left over from a previous run, still in the WAL directory
    Full,
    /// Moved to the archive directory
    Archived,
    /// Archived and entirely older than the retention point
    Reclaimable,
}

/// Decoded segment header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub ordinal: u64,
    pub first_lsn: Lsn,
}

impl SegmentHeader {
    pub fn encode(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE];
        buf[0..4].copy_from_slice(&SEGMENT_MAGIC);
        buf[4..6].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.ordinal.to_le_bytes());
        buf[16..24].copy_from_slice(&self.first_lsn.to_le_bytes());
        let crc = crc32fast::hash(&buf[..24]);
        buf[24..28].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decode a header, returning a reason on any mismatch
    pub fn decode(buf: &[u8]) -> std::result::Result<Self, String> {
        if buf.len() < SEGMENT_HEADER_SIZE {
            return Err(format!("segment header truncated ({} bytes)", buf.len()));
        }
        if buf[0..4] != SEGMENT_MAGIC {
            return Err("segment magic mismatch".to_string());
        }
        let stored_crc = u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]);
        if crc32fast::hash(&buf[..24]) != stored_crc {
            return Err("segment header checksum mismatch".to_string());
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != SEGMENT_VERSION {
            return Err(format!("unsupported segment version {}", version));
        }
        Ok(Self {
            ordinal: read_u64(buf, 8),
            first_lsn: read_u64(buf, 16),
        })
    }
}

pub fn encode_trailer(last_lsn: Lsn) -> [u8; SEGMENT_TRAILER_SIZE] {
    let mut buf = [0u8; SEGMENT_TRAILER_SIZE];
    buf[0..4].copy_from_slice(&SEAL_MARKER.to_le_bytes());
    buf[4..12].copy_from_slice(&last_lsn.to_le_bytes());
    let crc = crc32fast::hash(&buf[..12]);
    buf[12..16].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// Decode a trailer; `None` if torn or corrupt
pub fn decode_trailer(buf: &[u8]) -> Option<Lsn> {
    if buf.len() < SEGMENT_TRAILER_SIZE {
        return None;
    }
    if buf[0..4] != SEAL_MARKER.to_le_bytes() {
        return None;
    }
    let stored_crc = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
    if crc32fast::hash(&buf[..12]) != stored_crc {
        return None;
    }
    Some(read_u64(buf, 4))
}

/// Metadata of a segment that is no longer active
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentMeta {
    pub ordinal: u64,
    pub path: PathBuf,
    pub first_lsn: Lsn,
    /// Last LSN held; `first_lsn - 1` for a segment without records
    pub last_lsn: Lsn,
    pub archived: bool,
}

impl SegmentMeta {
    pub fn is_empty(&self) -> bool {
        self.last_lsn < self.first_lsn
    }
}

/// Segment file name for an ordinal: "0000000000000042.wal"
pub fn segment_file_name(ordinal: u64) -> String {
    format!("{:016}.{}", ordinal, SEGMENT_EXTENSION)
}

/// "0000000000000042.wal" → Some(42)
pub fn parse_segment_ordinal(path: &Path) -> Option<u64> {
    if path.extension()? != SEGMENT_EXTENSION {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

/// Segment files in `dir` sorted by ordinal (missing directory → empty)
pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            if let Some(ordinal) = parse_segment_ordinal(&path) {
                segments.push((ordinal, path));
            }
        }
    }
    segments.sort_by_key(|(ordinal, _)| *ordinal);
    Ok(segments)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}
