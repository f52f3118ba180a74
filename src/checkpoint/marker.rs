//! Checkpoint marker
//!
//! A small file naming the retained complete checkpoints, newest last, so
//! recovery can find its start point without reading every `CheckpointEnd`
//! in the WAL and the coordinator gets its full retention history back even
//! when the segments holding older end records are skipped. The WAL stays
//! authoritative: the marker is only written after the checkpoint's end
//! record is durable, and a missing or corrupt marker falls back to a full
//! scan.
//!
//! ```text
//! ┌─────────┬────────┬──────────┬───────────────────────────────┬─────────┐
//! │Magic (4)│Ver (2) │Count (2) │ Entry × Count                 │ CRC (4) │
//! └─────────┴────────┴──────────┴───────────────────────────────┴─────────┘
//!
//! Entry: ┌──────────┬──────────────┬────────────┐
//!        │ CP id (8)│ Start LSN (8)│ End LSN (8)│
//!        └──────────┴──────────────┴────────────┘
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use tracing::warn;

use crate::error::Result;
use crate::io::{sync_dir, IoFactory};
use crate::wal::Lsn;

const MARKER_MAGIC: [u8; 4] = *b"GVCK";
const MARKER_VERSION: u16 = 2;
const HEADER_SIZE: usize = 8;
const ENTRY_SIZE: usize = 24;
const CRC_SIZE: usize = 4;

/// One retained checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerEntry {
    pub checkpoint_id: u64,
    pub start_lsn: Lsn,
    pub end_lsn: Lsn,
}

/// Retained checkpoints, oldest first; never empty
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointMarker {
    entries: Vec<MarkerEntry>,
}

/// Encoded size of a marker holding `entries` checkpoints
pub fn marker_size(entries: usize) -> usize {
    HEADER_SIZE + entries * ENTRY_SIZE + CRC_SIZE
}

impl CheckpointMarker {
    /// `None` when `entries` is empty or too long to encode
    pub fn new(entries: Vec<MarkerEntry>) -> Option<Self> {
        if entries.is_empty() || entries.len() > u16::MAX as usize {
            return None;
        }
        Some(Self { entries })
    }

    /// Newest checkpoint
    pub fn latest(&self) -> MarkerEntry {
        self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> &[MarkerEntry] {
        &self.entries
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(marker_size(self.entries.len()));
        buf.extend_from_slice(&MARKER_MAGIC);
        buf.extend_from_slice(&MARKER_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.entries.len() as u16).to_le_bytes());
        for entry in &self.entries {
            buf.extend_from_slice(&entry.checkpoint_id.to_le_bytes());
            buf.extend_from_slice(&entry.start_lsn.to_le_bytes());
            buf.extend_from_slice(&entry.end_lsn.to_le_bytes());
        }
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < marker_size(1) || buf[0..4] != MARKER_MAGIC {
            return None;
        }
        let count = u16::from_le_bytes([buf[6], buf[7]]) as usize;
        if buf.len() != marker_size(count) {
            return None;
        }
        let body = buf.len() - CRC_SIZE;
        let stored_crc =
            u32::from_le_bytes([buf[body], buf[body + 1], buf[body + 2], buf[body + 3]]);
        if crc32fast::hash(&buf[..body]) != stored_crc {
            return None;
        }
        if u16::from_le_bytes([buf[4], buf[5]]) != MARKER_VERSION {
            return None;
        }
        let entries = buf[HEADER_SIZE..body]
            .chunks_exact(ENTRY_SIZE)
            .map(|raw| MarkerEntry {
                checkpoint_id: read_u64(raw, 0),
                start_lsn: read_u64(raw, 8),
                end_lsn: read_u64(raw, 16),
            })
            .collect();
        Self::new(entries)
    }

    /// Read the marker; `None` if it does not exist or fails validation
    pub fn read(io: &dyn IoFactory, path: &Path) -> Result<Option<Self>> {
        let file = match io.open(path, false) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut raw = vec![0u8; file.len()? as usize];
        file.read_at(0, &mut raw)?;

        let marker = Self::decode(&raw);
        if marker.is_none() {
            warn!(path = %path.display(), "ignoring corrupt checkpoint marker");
        }
        Ok(marker)
    }

    /// Atomically replace the marker at `path` (temp file + rename)
    pub fn persist(&self, io: &dyn IoFactory, path: &Path) -> Result<()> {
        let mut tmp = path.to_path_buf();
        tmp.set_extension("tmp");
        {
            let file = io.open(&tmp, true)?;
            file.set_len(0)?;
            file.write_at(0, &self.encode())?;
            file.sync()?;
        }
        fs::rename(&tmp, path)?;
        if let Some(parent) = path.parent() {
            sync_dir(parent)?;
        }
        Ok(())
    }
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}
