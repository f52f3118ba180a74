//! Crash Recovery
//!
//! Rebuilds page memory from the page stores and the WAL before the node
//! accepts mutations.
//!
//! ## Steps
//! 1. Scan WAL segments (archived, then live) in ordinal order, keeping only
//!    records newer than the newest `CheckpointEnd.start_lsn` seen so far.
//!    The checkpoint marker, when valid, lets whole segments before its
//!    `start_lsn` be skipped without reading them; the retained checkpoints
//!    whose end records lie in skipped segments come from the marker.
//! 2. Repair the tail: a torn last segment is truncated to its last valid
//!    frame, and trailing segments without a valid header are set aside as
//!    `*.wal.discarded`.
//! 3. Load every page image from the page stores.
//! 4. Replay `PageAlloc`/`PageDelta` records with `lsn > start_lsn` in LSN
//!    order, skipping deltas the page already reflects (`lsn <= page LSN`)
//!    and deltas of transactions without a commit marker.
//!
//! Rotation seals and fsyncs a segment before its successor is created, so
//! a crash can only tear the end of the log. Corruption in a sealed segment,
//! or with a valid segment after it, is mid-stream and fatal, as is a tear
//! hiding records the last complete checkpoint depends on.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointMarker, MarkerEntry};
use crate::config::Config;
use crate::error::{GridError, Result};
use crate::io::{sync_dir, IoFactory};
use crate::page::{page_kind, PageId, PageMemory, PageStoreSet, FIRST_PAGE_INDEX};
use crate::wal::{
    locate_segments, LoggedRecord, Lsn, SegmentHeader, SegmentLocation, SegmentMeta, TornTail,
    TxMarkerKind, WalReader, WalRecord, SEGMENT_HEADER_SIZE,
};

/// Outcome of recovery, handed to the WAL manager and the coordinator
#[derive(Debug, Clone, Default)]
pub struct RecoveredState {
    /// Newest complete checkpoint, if any
    pub checkpoint: Option<Checkpoint>,
    /// Complete checkpoints whose WAL is still retained, oldest first, at
    /// most `wal_history_size`; ends with `checkpoint`
    pub history: Vec<Checkpoint>,
    /// LSN the next append receives
    pub next_lsn: Lsn,
    /// Valid segments left on disk, in ordinal order
    pub segments: Vec<SegmentMeta>,
    pub records_scanned: u64,
    /// Allocations and deltas applied to page memory
    pub records_replayed: u64,
    /// Deltas the loaded page image already reflected
    pub records_skipped: u64,
    /// Deltas of transactions that never committed
    pub records_discarded: u64,
    pub pages_loaded: u64,
    pub torn_tail: Option<TornTail>,
    /// Ordinals of segments set aside after the torn tail
    pub discarded_segments: Vec<u64>,
    /// The checkpoint marker was valid and used to skip segments
    pub used_marker: bool,
}

/// Records gathered by the WAL scan
#[derive(Default)]
struct WalScan {
    /// Every `CheckpointEnd` read, in LSN order
    checkpoints: Vec<Checkpoint>,
    /// Records newer than `checkpoint.start_lsn`, in LSN order
    records: Vec<LoggedRecord>,
    segments: Vec<SegmentMeta>,
    records_scanned: u64,
    last_lsn: Option<Lsn>,
    torn_tail: Option<TornTail>,
    discarded_segments: Vec<u64>,
    used_marker: bool,
}

/// Runs recovery once, at startup
pub struct RecoveryManager<'a> {
    config: &'a Config,
    io: Arc<dyn IoFactory>,
}

impl<'a> RecoveryManager<'a> {
    pub fn new(config: &'a Config, io: Arc<dyn IoFactory>) -> Self {
        Self { config, io }
    }

    /// Recover `memory` from `stores` and the WAL
    pub fn recover(&self, stores: &PageStoreSet, memory: &PageMemory) -> Result<RecoveredState> {
        let started = Instant::now();

        let marker = CheckpointMarker::read(self.io.as_ref(), &self.config.marker_path())?;
        let scan = self.scan_wal(marker.as_ref().map(CheckpointMarker::latest))?;
        let history = retained_history(
            marker.as_ref(),
            &scan.checkpoints,
            self.config.wal_history_size,
        );
        let pages_loaded = load_pages(stores, memory)?;

        let mut state = RecoveredState {
            checkpoint: scan.checkpoints.last().cloned(),
            history,
            next_lsn: scan
                .segments
                .last()
                .map_or(1, |segment| segment.last_lsn + 1),
            segments: scan.segments,
            records_scanned: scan.records_scanned,
            pages_loaded,
            torn_tail: scan.torn_tail,
            discarded_segments: scan.discarded_segments,
            used_marker: scan.used_marker,
            ..RecoveredState::default()
        };
        if let Some(last) = scan.last_lsn {
            state.next_lsn = state.next_lsn.max(last + 1);
        }

        replay(&scan.records, stores, memory, &mut state)?;

        info!(
            checkpoint_id = state.checkpoint.as_ref().map(|cp| cp.id),
            start_lsn = state.checkpoint.as_ref().map(|cp| cp.start_lsn),
            pages_loaded = state.pages_loaded,
            scanned = state.records_scanned,
            replayed = state.records_replayed,
            skipped = state.records_skipped,
            discarded = state.records_discarded,
            next_lsn = state.next_lsn,
            torn_tail = state.torn_tail.is_some(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "recovery complete"
        );
        Ok(state)
    }

    // =========================================================================
    // WAL Scan
    // =========================================================================

    fn scan_wal(&self, marker: Option<MarkerEntry>) -> Result<WalScan> {
        let locations = locate_segments(&self.config.wal_dir(), &self.config.wal_archive_dir())?;
        let headers = locations
            .iter()
            .map(|location| self.read_header(&location.path))
            .collect::<Result<Vec<_>>>()?;

        let mut scan = WalScan::default();
        // Records at or below this LSN are already reflected in the page stores
        let mut cutoff = marker.map_or(0, |m| m.start_lsn);
        let mut expected_first: Option<Lsn> = None;

        for (i, location) in locations.iter().enumerate() {
            // Skip segments the marker proves are entirely before its start
            if let (Some(m), Some(Some(header)), Some(Some(next))) =
                (marker, headers.get(i), headers.get(i + 1))
            {
                let contiguous = expected_first.map_or(true, |e| e == header.first_lsn);
                if next.first_lsn <= m.start_lsn + 1 && contiguous {
                    debug!(
                        ordinal = location.ordinal,
                        "segment precedes checkpoint marker; skipped"
                    );
                    scan.used_marker = true;
                    scan.segments.push(SegmentMeta {
                        ordinal: location.ordinal,
                        path: location.path.clone(),
                        first_lsn: header.first_lsn,
                        last_lsn: next.first_lsn - 1,
                        archived: location.archived,
                    });
                    expected_first = Some(next.first_lsn);
                    continue;
                }
            }

            let file = self.io.open(&location.path, false)?;
            let mut reader = WalReader::open(file.as_ref(), location.ordinal)?;

            if let (Some(expected), Some(header)) = (expected_first, reader.header()) {
                if header.first_lsn != expected {
                    return Err(GridError::CorruptRecord {
                        segment: location.ordinal,
                        offset: 0,
                        reason: format!(
                            "segment starts at lsn {}, expected {}",
                            header.first_lsn, expected
                        ),
                    });
                }
            }

            while let Some(logged) = reader.next_record() {
                scan.records_scanned += 1;
                scan.last_lsn = Some(logged.lsn);
                if let WalRecord::CheckpointEnd {
                    checkpoint_id,
                    start_lsn,
                    topology_version,
                    total_pages,
                    data_pages,
                    index_pages,
                    cow_pages,
                } = logged.record
                {
                    scan.checkpoints.push(Checkpoint {
                        id: checkpoint_id,
                        start_lsn,
                        end_lsn: logged.lsn,
                        topology_version,
                        total_pages,
                        data_pages,
                        index_pages,
                        cow_pages,
                        duration: Duration::ZERO,
                        fsync_duration: Duration::ZERO,
                    });
                    if start_lsn > cutoff {
                        cutoff = start_lsn;
                        scan.records.retain(|r| r.lsn > cutoff);
                    }
                    continue;
                }
                if logged.lsn > cutoff && needed_for_replay(&logged.record) {
                    scan.records.push(logged);
                }
            }

            let header = reader.header().copied();
            if let Some(torn) = reader.torn().cloned() {
                check_log_end(
                    &torn,
                    reader.ends_with_trailer(),
                    &locations[i + 1..],
                    &headers[i + 1..],
                )?;
                let last_valid = reader
                    .last_lsn()
                    .or_else(|| header.map(|h| h.first_lsn.saturating_sub(1)))
                    .or(expected_first.map(|e| e.saturating_sub(1)))
                    .unwrap_or(0);
                check_tear(&torn, last_valid, marker)?;

                warn!(
                    segment = torn.segment,
                    offset = torn.offset,
                    reason = %torn.reason,
                    "torn WAL tail; truncating"
                );
                match header {
                    Some(header) => {
                        file.set_len(reader.valid_len())?;
                        file.sync()?;
                        scan.segments.push(SegmentMeta {
                            ordinal: location.ordinal,
                            path: location.path.clone(),
                            first_lsn: header.first_lsn,
                            last_lsn: reader.last_lsn().unwrap_or(header.first_lsn - 1),
                            archived: location.archived,
                        });
                        self.discard_from(&locations[i + 1..], &mut scan)?;
                    }
                    // Not even the header made it to disk
                    None => self.discard_from(&locations[i..], &mut scan)?,
                }
                scan.torn_tail = Some(torn);
                break;
            }

            if let Some(header) = header {
                let last_lsn = reader.last_lsn().unwrap_or(header.first_lsn - 1);
                scan.segments.push(SegmentMeta {
                    ordinal: location.ordinal,
                    path: location.path.clone(),
                    first_lsn: header.first_lsn,
                    last_lsn,
                    archived: location.archived,
                });
                expected_first = Some(last_lsn + 1);
            }
        }

        if let Some(m) = marker {
            let found = scan.checkpoints.last().map_or(0, |cp| cp.end_lsn);
            if found < m.end_lsn {
                return Err(GridError::CorruptRecord {
                    segment: scan.segments.last().map_or(0, |s| s.ordinal),
                    offset: 0,
                    reason: format!(
                        "checkpoint {} ends at lsn {} but the WAL holds no such record",
                        m.checkpoint_id, m.end_lsn
                    ),
                });
            }
        }

        Ok(scan)
    }

    /// Set aside `locations` so they are never read again
    fn discard_from(&self, locations: &[SegmentLocation], scan: &mut WalScan) -> Result<()> {
        for location in locations {
            let mut name = location.path.clone().into_os_string();
            name.push(".discarded");
            fs::rename(&location.path, PathBuf::from(name))?;
            warn!(ordinal = location.ordinal, "WAL segment after torn tail discarded");
            scan.discarded_segments.push(location.ordinal);
            if let Some(parent) = location.path.parent() {
                sync_dir(parent)?;
            }
        }
        Ok(())
    }

    fn read_header(&self, path: &Path) -> Result<Option<SegmentHeader>> {
        let file = self.io.open(path, false)?;
        if file.len()? < SEGMENT_HEADER_SIZE as u64 {
            return Ok(None);
        }
        let mut raw = [0u8; SEGMENT_HEADER_SIZE];
        file.read_at(0, &mut raw)?;
        Ok(SegmentHeader::decode(&raw).ok())
    }
}

/// A tear is a crash artifact only at the real end of the log
fn check_log_end(
    torn: &TornTail,
    sealed: bool,
    later: &[SegmentLocation],
    later_headers: &[Option<SegmentHeader>],
) -> Result<()> {
    let reason = if sealed {
        Some(format!("{} in a sealed segment", torn.reason))
    } else {
        later
            .iter()
            .zip(later_headers)
            .find(|(_, header)| header.is_some())
            .map(|(location, _)| {
                format!("{}; segment {} follows it", torn.reason, location.ordinal)
            })
    };
    match reason {
        Some(reason) => Err(GridError::CorruptRecord {
            segment: torn.segment,
            offset: torn.offset,
            reason,
        }),
        None => Ok(()),
    }
}

/// A tear hiding records up to the marker's `end_lsn` cannot be repaired
fn check_tear(torn: &TornTail, last_valid: Lsn, marker: Option<MarkerEntry>) -> Result<()> {
    if let Some(m) = marker {
        if last_valid < m.end_lsn {
            return Err(GridError::CorruptRecord {
                segment: torn.segment,
                offset: torn.offset,
                reason: format!(
                    "{} (checkpoint {} needs records up to lsn {})",
                    torn.reason, m.checkpoint_id, m.end_lsn
                ),
            });
        }
    }
    Ok(())
}

/// Checkpoints whose WAL stays retained, oldest first
///
/// End records inside segments the marker let the scan skip are known only
/// from the marker; everything read from the WAL takes precedence.
fn retained_history(
    marker: Option<&CheckpointMarker>,
    scanned: &[Checkpoint],
    keep: usize,
) -> Vec<Checkpoint> {
    let mut by_id: BTreeMap<u64, Checkpoint> = BTreeMap::new();
    for entry in marker.map_or(&[][..], CheckpointMarker::entries) {
        by_id.insert(
            entry.checkpoint_id,
            Checkpoint {
                id: entry.checkpoint_id,
                start_lsn: entry.start_lsn,
                end_lsn: entry.end_lsn,
                topology_version: 0,
                total_pages: 0,
                data_pages: 0,
                index_pages: 0,
                cow_pages: 0,
                duration: Duration::ZERO,
                fsync_duration: Duration::ZERO,
            },
        );
    }
    for checkpoint in scanned {
        by_id.insert(checkpoint.id, checkpoint.clone());
    }
    let skip = by_id.len().saturating_sub(keep);
    by_id.into_values().skip(skip).collect()
}

fn needed_for_replay(record: &WalRecord) -> bool {
    matches!(
        record,
        WalRecord::PageAlloc { .. }
            | WalRecord::PageDelta { .. }
            | WalRecord::TxMarker {
                kind: TxMarkerKind::Commit,
                ..
            }
    )
}

// =============================================================================
// Page Load / Replay
// =============================================================================

fn load_pages(stores: &PageStoreSet, memory: &PageMemory) -> Result<u64> {
    let mut loaded = 0;
    let mut buf = vec![0u8; stores.page_size()];
    for partition in stores.partitions() {
        let store = stores.get(partition)?;
        for index in FIRST_PAGE_INDEX..=store.page_count() {
            store.read(index, &mut buf)?;
            // Never written by a checkpoint; the WAL recreates it
            if page_kind(&buf).is_none() {
                continue;
            }
            memory.load_page(PageId::new(partition, index), buf.clone())?;
            loaded += 1;
        }
    }
    Ok(loaded)
}

fn replay(
    records: &[LoggedRecord],
    stores: &PageStoreSet,
    memory: &PageMemory,
    state: &mut RecoveredState,
) -> Result<()> {
    let committed: HashSet<u64> = records
        .iter()
        .filter_map(|r| match r.record {
            WalRecord::TxMarker {
                tx_id,
                kind: TxMarkerKind::Commit,
            } => Some(tx_id),
            _ => None,
        })
        .collect();

    for logged in records {
        match &logged.record {
            WalRecord::PageAlloc { page_id, kind } => {
                require_store(stores, *page_id)?;
                if memory.replay_alloc(*page_id, *kind, logged.lsn) {
                    state.records_replayed += 1;
                } else {
                    state.records_skipped += 1;
                }
            }
            WalRecord::PageDelta {
                page_id,
                offset,
                data,
                tx,
            } => {
                if let Some(tx_id) = tx {
                    if !committed.contains(tx_id) {
                        state.records_discarded += 1;
                        continue;
                    }
                }
                require_store(stores, *page_id)?;
                if memory.replay_delta(*page_id, *offset as usize, data, logged.lsn)? {
                    state.records_replayed += 1;
                } else {
                    state.records_skipped += 1;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn require_store(stores: &PageStoreSet, page_id: PageId) -> Result<()> {
    if !stores.contains(page_id.partition) {
        return Err(GridError::MissingPartitionStore(page_id.partition));
    }
    Ok(())
}
