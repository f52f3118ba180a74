//! WAL Reader
//!
//! Reads records from one segment, stopping at the trailer, the end of the
//! data, or the first frame that fails validation (torn tail).

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::io::{FileIo, IoFactory};

use super::record::{decode_frame, FrameDecode, LoggedRecord, Lsn};
use super::segment::{
    decode_trailer, list_segments, SegmentHeader, SEGMENT_HEADER_SIZE, SEGMENT_TRAILER_SIZE,
};

/// Where and why a segment stopped being readable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TornTail {
    pub segment: u64,
    pub offset: u64,
    pub reason: String,
}

/// Sequential reader over one segment
pub struct WalReader {
    ordinal: u64,
    header: Option<SegmentHeader>,
    data: Vec<u8>,
    offset: usize,
    expected_lsn: Lsn,
    last_lsn: Option<Lsn>,
    sealed: Option<Lsn>,
    torn: Option<TornTail>,
    done: bool,
}

impl WalReader {
    /// Load segment `ordinal` from `io`
    pub fn open(io: &dyn FileIo, ordinal: u64) -> Result<Self> {
        let len = io.len()? as usize;
        let mut data = vec![0u8; len];
        if len > 0 {
            io.read_at(0, &mut data)?;
        }
        Ok(Self::from_bytes(ordinal, data))
    }

    /// Build a reader over raw segment bytes
    pub fn from_bytes(ordinal: u64, data: Vec<u8>) -> Self {
        let mut reader = Self {
            ordinal,
            header: None,
            data,
            offset: 0,
            expected_lsn: 0,
            last_lsn: None,
            sealed: None,
            torn: None,
            done: false,
        };

        match SegmentHeader::decode(&reader.data) {
            Ok(header) if header.ordinal == ordinal => {
                reader.expected_lsn = header.first_lsn;
                reader.header = Some(header);
                reader.offset = SEGMENT_HEADER_SIZE;
            }
            Ok(header) => {
                reader.mark_torn(format!(
                    "header names ordinal {}, file is {}",
                    header.ordinal, ordinal
                ));
            }
            Err(reason) => reader.mark_torn(reason),
        }
        reader
    }

    /// Next valid record, or `None` once the segment is exhausted
    pub fn next_record(&mut self) -> Option<LoggedRecord> {
        if self.done {
            return None;
        }

        match decode_frame(&self.data[self.offset..]) {
            FrameDecode::Record { record, len } => {
                if record.lsn != self.expected_lsn {
                    self.mark_torn(format!(
                        "lsn gap: expected {}, found {}",
                        self.expected_lsn, record.lsn
                    ));
                    return None;
                }
                self.offset += len;
                self.expected_lsn += 1;
                self.last_lsn = Some(record.lsn);
                Some(record)
            }
            FrameDecode::Trailer => {
                let expected_last = self.expected_lsn.saturating_sub(1);
                match decode_trailer(&self.data[self.offset..]) {
                    Some(last) if last == expected_last => {
                        self.sealed = Some(last);
                        self.offset += SEGMENT_TRAILER_SIZE;
                        self.done = true;
                    }
                    Some(last) => self.mark_torn(format!(
                        "trailer claims last lsn {}, read up to {}",
                        last, expected_last
                    )),
                    None => self.mark_torn("trailer corrupt".to_string()),
                }
                None
            }
            FrameDecode::End => {
                self.done = true;
                None
            }
            FrameDecode::Corrupt(reason) => {
                self.mark_torn(reason);
                None
            }
        }
    }

    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    pub fn header(&self) -> Option<&SegmentHeader> {
        self.header.as_ref()
    }

    /// Last LSN recorded in a valid trailer
    pub fn sealed_lsn(&self) -> Option<Lsn> {
        self.sealed
    }

    /// The last bytes of the segment form a valid trailer, even when a
    /// frame before them failed to read
    pub fn ends_with_trailer(&self) -> bool {
        let len = self.data.len();
        len >= SEGMENT_HEADER_SIZE + SEGMENT_TRAILER_SIZE
            && decode_trailer(&self.data[len - SEGMENT_TRAILER_SIZE..]).is_some()
    }

    pub fn torn(&self) -> Option<&TornTail> {
        self.torn.as_ref()
    }

    /// Last record returned so far
    pub fn last_lsn(&self) -> Option<Lsn> {
        self.last_lsn
    }

    /// Bytes covered by the header, valid frames and (if present) the trailer
    pub fn valid_len(&self) -> u64 {
        self.offset as u64
    }

    fn mark_torn(&mut self, reason: String) {
        self.torn = Some(TornTail {
            segment: self.ordinal,
            offset: self.offset as u64,
            reason,
        });
        self.done = true;
    }
}

impl Iterator for WalReader {
    type Item = LoggedRecord;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record()
    }
}

// =============================================================================
// Directory Inspection
// =============================================================================

/// A segment file and whether it lives in the archive
#[derive(Debug, Clone)]
pub struct SegmentLocation {
    pub ordinal: u64,
    pub path: PathBuf,
    pub archived: bool,
}

/// Archived and live segments merged in ordinal order
pub fn locate_segments(wal_dir: &Path, archive_dir: &Path) -> Result<Vec<SegmentLocation>> {
    let mut all: Vec<SegmentLocation> = list_segments(archive_dir)?
        .into_iter()
        .map(|(ordinal, path)| SegmentLocation {
            ordinal,
            path,
            archived: true,
        })
        .chain(
            list_segments(wal_dir)?
                .into_iter()
                .map(|(ordinal, path)| SegmentLocation {
                    ordinal,
                    path,
                    archived: false,
                }),
        )
        .collect();
    all.sort_by_key(|s| s.ordinal);
    Ok(all)
}

/// Summary of one segment for verification tooling
#[derive(Debug, Clone)]
pub struct SegmentReport {
    pub ordinal: u64,
    pub archived: bool,
    pub first_lsn: Option<Lsn>,
    pub last_lsn: Option<Lsn>,
    pub records: u64,
    pub sealed: bool,
    pub torn: Option<TornTail>,
}

/// Read every segment without modifying anything
pub fn inspect_segments(
    io: &dyn IoFactory,
    wal_dir: &Path,
    archive_dir: &Path,
) -> Result<Vec<SegmentReport>> {
    let mut reports = Vec::new();
    for location in locate_segments(wal_dir, archive_dir)? {
        let file = io.open(&location.path, false)?;
        let mut reader = WalReader::open(file.as_ref(), location.ordinal)?;
        let mut records = 0u64;
        while reader.next_record().is_some() {
            records += 1;
        }
        reports.push(SegmentReport {
            ordinal: location.ordinal,
            archived: location.archived,
            first_lsn: reader.header().map(|h| h.first_lsn),
            last_lsn: reader.last_lsn(),
            records,
            sealed: reader.sealed_lsn().is_some(),
            torn: reader.torn().cloned(),
        });
    }
    Ok(reports)
}
