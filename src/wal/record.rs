//! WAL Record definitions
//!
//! Defines the closed set of records and their on-disk framing.
//!
//! ## Frame Format
//! ```text
//! ┌──────────┬──────────┬──────────┬──────────────────────┐
//! │ Len (4)  │ CRC (4)  │ LSN (8)  │ Body (bincode)       │
//! └──────────┴──────────┴──────────┴──────────────────────┘
//! ```
//! `Len` is the body length; the CRC covers LSN + body. A `Len` of
//! [`SEAL_MARKER`] introduces the segment trailer instead of a record.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::page::{PageId, PageKind};

/// Log Sequence Number - strictly increasing, gapless
pub type Lsn = u64;

/// Frame header: len (4) + crc (4) + lsn (8)
pub const FRAME_HEADER_SIZE: usize = 16;

/// `Len` value that marks the segment trailer
pub const SEAL_MARKER: u32 = u32::MAX;

/// Upper bound on a single record body; anything larger is treated as garbage
pub const MAX_RECORD_BODY: usize = 64 * 1024 * 1024;

/// A single logged mutation or control record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalRecord {
    /// A page was allocated with the given kind
    PageAlloc { page_id: PageId, kind: PageKind },

    /// Absolute overwrite of `data` at payload `offset`; idempotent on replay
    PageDelta {
        page_id: PageId,
        offset: u32,
        data: Vec<u8>,
        tx: Option<u64>,
    },

    /// Dirty-set snapshot taken; logged under the page memory barrier
    CheckpointBegin { checkpoint_id: u64, dirty_pages: u64 },

    /// Checkpoint pages are durable. The record's own LSN is the checkpoint's
    /// `end_lsn`; the checkpoint is complete once this record is fsynced.
    CheckpointEnd {
        checkpoint_id: u64,
        start_lsn: Lsn,
        topology_version: u64,
        total_pages: u64,
        data_pages: u64,
        index_pages: u64,
        cow_pages: u64,
    },

    /// Boundary of a multi-record unit driven by an external coordinator
    TxMarker { tx_id: u64, kind: TxMarkerKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxMarkerKind {
    Begin,
    Commit,
    Rollback,
}

impl WalRecord {
    /// Short name for logs and tooling
    pub fn kind_name(&self) -> &'static str {
        match self {
            WalRecord::PageAlloc { .. } => "page_alloc",
            WalRecord::PageDelta { .. } => "page_delta",
            WalRecord::CheckpointBegin { .. } => "checkpoint_begin",
            WalRecord::CheckpointEnd { .. } => "checkpoint_end",
            WalRecord::TxMarker { .. } => "tx_marker",
        }
    }

    /// Serialize the record body (no framing)
    pub fn encode_body(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode_body(body: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(body)?)
    }
}

/// A record together with the LSN it was assigned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedRecord {
    pub lsn: Lsn,
    pub record: WalRecord,
}

/// Append one frame for an already-encoded body
pub fn put_frame(buf: &mut BytesMut, lsn: Lsn, body: &[u8]) {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&lsn.to_le_bytes());
    hasher.update(body);

    buf.reserve(FRAME_HEADER_SIZE + body.len());
    buf.put_u32_le(body.len() as u32);
    buf.put_u32_le(hasher.finalize());
    buf.put_u64_le(lsn);
    buf.put_slice(body);
}

/// Encode a complete frame into a fresh buffer
pub fn encode_frame(lsn: Lsn, record: &WalRecord) -> Result<BytesMut> {
    let body = record.encode_body()?;
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + body.len());
    put_frame(&mut buf, lsn, &body);
    Ok(buf)
}

/// Outcome of decoding the bytes at one frame position
#[derive(Debug)]
pub enum FrameDecode {
    /// A valid record occupying `len` bytes
    Record { record: LoggedRecord, len: usize },
    /// The segment trailer starts here
    Trailer,
    /// No bytes left
    End,
    /// Partial or corrupt frame
    Corrupt(String),
}

/// Decode the frame at the start of `buf`
pub fn decode_frame(buf: &[u8]) -> FrameDecode {
    if buf.is_empty() {
        return FrameDecode::End;
    }
    if buf.len() < 4 {
        return FrameDecode::Corrupt(format!("truncated frame header ({} bytes)", buf.len()));
    }
    let body_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if body_len == SEAL_MARKER {
        return FrameDecode::Trailer;
    }
    if buf.len() < FRAME_HEADER_SIZE {
        return FrameDecode::Corrupt(format!("truncated frame header ({} bytes)", buf.len()));
    }
    let body_len = body_len as usize;
    if body_len == 0 {
        // Preallocated or zeroed space, never a real record
        return FrameDecode::Corrupt("zero-length frame".to_string());
    }
    if body_len > MAX_RECORD_BODY {
        return FrameDecode::Corrupt(format!("frame length {} out of range", body_len));
    }
    let total = FRAME_HEADER_SIZE + body_len;
    if buf.len() < total {
        return FrameDecode::Corrupt(format!(
            "truncated frame: need {} bytes, have {}",
            total,
            buf.len()
        ));
    }

    let stored_crc = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let computed_crc = crc32fast::hash(&buf[8..total]);
    if stored_crc != computed_crc {
        return FrameDecode::Corrupt("frame checksum mismatch".to_string());
    }

    let mut raw_lsn = [0u8; 8];
    raw_lsn.copy_from_slice(&buf[8..16]);
    let lsn = u64::from_le_bytes(raw_lsn);

    match WalRecord::decode_body(&buf[FRAME_HEADER_SIZE..total]) {
        Ok(record) => FrameDecode::Record {
            record: LoggedRecord { lsn, record },
            len: total,
        },
        Err(e) => FrameDecode::Corrupt(format!("undecodable body: {}", e)),
    }
}
