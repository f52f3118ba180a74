//! WAL Manager
//!
//! Owns the active segment and hands out LSNs.
//!
//! ## Append Path
//! ```text
//! append(record)
//!   │  encode body (no lock)
//!   ▼
//! ┌─────────────── state lock ───────────────┐
//! │ rotate if the frame does not fit         │
//! │ assign LSN, frame into buffer            │
//! │ write buffer out once it reaches 1 MiB   │
//! └──────────────────────────────────────────┘
//!   │
//!   ▼  EveryWrite → fsync(lsn)
//! ```
//!
//! ## Concurrency:
//! - `state`: Mutex (LSN assignment and segment writes are serialized)
//! - `segments`: Mutex over sealed segment metadata, taken after `state`
//! - `durable_lsn`: raised only after a completed sync
//! - The fsync itself runs outside `state`, so appends proceed while a
//!   sync is in flight.
//!
//! Any write or sync error latches the manager into a failed state; every
//! later append and fsync returns [`GridError::IoFailure`].

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{Config, WalSyncStrategy};
use crate::error::{GridError, Result};
use crate::io::{sync_dir, FileIo, IoFactory};
use crate::metrics::PersistenceMetrics;

use super::reader::{locate_segments, WalReader};
use super::record::{put_frame, Lsn, WalRecord, FRAME_HEADER_SIZE};
use super::segment::{
    encode_trailer, segment_file_name, SegmentHeader, SegmentMeta, SegmentState,
    SEGMENT_HEADER_SIZE, SEGMENT_TRAILER_SIZE,
};

/// Buffered frames are written to the segment once they reach this size
const WRITE_BUFFER_THRESHOLD: usize = 1024 * 1024;

/// A segment as reported to tooling and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub ordinal: u64,
    pub first_lsn: Lsn,
    pub last_lsn: Lsn,
    pub state: SegmentState,
}

struct ActiveSegment {
    ordinal: u64,
    path: PathBuf,
    io: Arc<dyn FileIo>,
    first_lsn: Lsn,
    /// File offset where the next buffered write lands
    written: u64,
    /// Last LSN framed into this segment; `first_lsn - 1` when empty
    last_lsn: Lsn,
}

struct AppendState {
    next_lsn: Lsn,
    buffer: BytesMut,
    active: ActiveSegment,
}

impl AppendState {
    fn end_offset(&self) -> u64 {
        self.active.written + self.buffer.len() as u64
    }
}

#[derive(Default)]
struct SegmentTable {
    full: VecDeque<SegmentMeta>,
    archived: VecDeque<SegmentMeta>,
}

/// Segmented write-ahead log
pub struct WalManager {
    dir: PathBuf,
    archive_dir: PathBuf,
    io: Arc<dyn IoFactory>,
    segment_size: u64,
    sync_strategy: WalSyncStrategy,
    state: Mutex<AppendState>,
    segments: Mutex<SegmentTable>,
    durable_lsn: AtomicU64,
    bytes_appended: AtomicU64,
    failed: AtomicBool,
    failure: Mutex<Option<String>>,
    metrics: Arc<PersistenceMetrics>,
}

impl WalManager {
    /// Open the WAL in `config.wal_dir()`, scanning existing segments
    ///
    /// Existing segments must end cleanly; a torn tail is repaired by
    /// recovery, which then calls [`WalManager::resume`] directly.
    pub fn open(
        config: &Config,
        io: Arc<dyn IoFactory>,
        metrics: Arc<PersistenceMetrics>,
    ) -> Result<Self> {
        let wal_dir = config.wal_dir();
        let archive_dir = config.wal_archive_dir();

        let mut segments = Vec::new();
        for location in locate_segments(&wal_dir, &archive_dir)? {
            let file = io.open(&location.path, false)?;
            let mut reader = WalReader::open(file.as_ref(), location.ordinal)?;
            while reader.next_record().is_some() {}
            if let Some(torn) = reader.torn() {
                return Err(GridError::CorruptRecord {
                    segment: torn.segment,
                    offset: torn.offset,
                    reason: format!("unrepaired WAL tail: {}", torn.reason),
                });
            }
            // A header is guaranteed once the segment is not torn
            let first_lsn = reader.header().map_or(1, |h| h.first_lsn);
            segments.push(SegmentMeta {
                ordinal: location.ordinal,
                path: location.path,
                first_lsn,
                last_lsn: reader.last_lsn().unwrap_or(first_lsn - 1),
                archived: location.archived,
            });
        }

        let next_lsn = segments.last().map_or(1, |s| s.last_lsn + 1);
        Self::resume(config, io, metrics, segments, next_lsn)
    }

    /// Open a new active segment after already-validated `segments`
    ///
    /// `next_lsn` is one past the last valid record found on disk.
    pub fn resume(
        config: &Config,
        io: Arc<dyn IoFactory>,
        metrics: Arc<PersistenceMetrics>,
        segments: Vec<SegmentMeta>,
        next_lsn: Lsn,
    ) -> Result<Self> {
        let dir = config.wal_dir();
        let archive_dir = config.wal_archive_dir();
        fs::create_dir_all(&archive_dir)?;

        let ordinal = segments.iter().map(|s| s.ordinal + 1).max().unwrap_or(0);
        let active = create_segment(io.as_ref(), &dir, ordinal, next_lsn)?;

        let mut table = SegmentTable::default();
        for meta in segments {
            if meta.archived {
                table.archived.push_back(meta);
            } else {
                table.full.push_back(meta);
            }
        }
        metrics.set_wal_archive_segments(table.archived.len() as u64);

        info!(
            dir = %dir.display(),
            active_segment = ordinal,
            next_lsn,
            full = table.full.len(),
            archived = table.archived.len(),
            "WAL opened"
        );

        Ok(Self {
            dir,
            archive_dir,
            io,
            segment_size: config.wal_segment_size,
            sync_strategy: config.wal_sync_strategy,
            state: Mutex::new(AppendState {
                next_lsn,
                buffer: BytesMut::with_capacity(WRITE_BUFFER_THRESHOLD),
                active,
            }),
            segments: Mutex::new(table),
            durable_lsn: AtomicU64::new(next_lsn - 1),
            bytes_appended: AtomicU64::new(0),
            failed: AtomicBool::new(false),
            failure: Mutex::new(None),
            metrics,
        })
    }

    // =========================================================================
    // Append / Durability
    // =========================================================================

    /// Append a record and return its LSN
    ///
    /// The record is durable only once [`WalManager::fsync`] covers the LSN
    /// (or immediately, under [`WalSyncStrategy::EveryWrite`]).
    pub fn append(&self, record: &WalRecord) -> Result<Lsn> {
        self.check_failed()?;
        let body = record.encode_body()?;
        let frame_len = (FRAME_HEADER_SIZE + body.len()) as u64;

        let lsn = {
            let mut state = self.state.lock();
            self.check_failed()?;

            let capacity = self.segment_size - (SEGMENT_HEADER_SIZE + SEGMENT_TRAILER_SIZE) as u64;
            if frame_len > capacity {
                return Err(GridError::OutOfBounds {
                    offset: 0,
                    len: frame_len as usize,
                    capacity: capacity as usize,
                });
            }
            if state.end_offset() + frame_len + SEGMENT_TRAILER_SIZE as u64 > self.segment_size {
                self.rotate_locked(&mut state)?;
            }

            let lsn = state.next_lsn;
            put_frame(&mut state.buffer, lsn, &body);
            state.next_lsn += 1;
            state.active.last_lsn = lsn;

            if state.buffer.len() >= WRITE_BUFFER_THRESHOLD {
                self.write_buffer_locked(&mut state)?;
            }
            lsn
        };

        self.bytes_appended.fetch_add(frame_len, Ordering::Relaxed);
        self.metrics.on_wal_record(frame_len);

        if self.sync_strategy == WalSyncStrategy::EveryWrite {
            self.fsync(lsn)?;
        }
        Ok(lsn)
    }

    /// Make every record up to and including `up_to` durable
    pub fn fsync(&self, up_to: Lsn) -> Result<()> {
        if self.durable_lsn() >= up_to {
            return Ok(());
        }
        self.check_failed()?;

        let (file, target) = {
            let mut state = self.state.lock();
            self.check_failed()?;
            self.write_buffer_locked(&mut state)?;
            (Arc::clone(&state.active.io), state.next_lsn - 1)
        };

        let started = Instant::now();
        file.sync()
            .map_err(|e| self.fail("WAL fsync failed", e))?;
        self.durable_lsn.fetch_max(target, Ordering::AcqRel);
        self.metrics.on_wal_fsync(started.elapsed());
        Ok(())
    }

    /// Make everything appended so far durable
    pub fn flush(&self) -> Result<()> {
        self.fsync(self.last_lsn())
    }

    // =========================================================================
    // Segment Lifecycle
    // =========================================================================

    /// Move every full segment into the archive directory
    pub fn archive_segments(&self) -> Result<usize> {
        let mut table = self.segments.lock();
        let mut moved = 0;
        while let Some(mut meta) = table.full.pop_front() {
            let target = self.archive_dir.join(segment_file_name(meta.ordinal));
            if let Err(e) = fs::rename(&meta.path, &target) {
                table.full.push_front(meta);
                return Err(e.into());
            }
            meta.path = target;
            meta.archived = true;
            debug!(ordinal = meta.ordinal, last_lsn = meta.last_lsn, "WAL segment archived");
            table.archived.push_back(meta);
            moved += 1;
        }
        if moved > 0 {
            sync_dir(&self.dir)?;
            sync_dir(&self.archive_dir)?;
        }
        self.metrics
            .set_wal_archive_segments(table.archived.len() as u64);
        Ok(moved)
    }

    /// Delete archived segments lying entirely before `retention_lsn`
    pub fn purge_reclaimable(&self, retention_lsn: Lsn) -> Result<usize> {
        let mut table = self.segments.lock();
        let mut purged = 0;
        while let Some(meta) = table.archived.front() {
            if meta.last_lsn >= retention_lsn {
                break;
            }
            fs::remove_file(&meta.path)?;
            debug!(ordinal = meta.ordinal, last_lsn = meta.last_lsn, "WAL segment reclaimed");
            table.archived.pop_front();
            purged += 1;
        }
        if purged > 0 {
            sync_dir(&self.archive_dir)?;
            info!(purged, retention_lsn, "reclaimed archived WAL segments");
        }
        self.metrics
            .set_wal_archive_segments(table.archived.len() as u64);
        Ok(purged)
    }

    /// Every segment in ordinal order, classified against `retention_lsn`
    pub fn segments(&self, retention_lsn: Lsn) -> Vec<SegmentInfo> {
        let state = self.state.lock();
        let table = self.segments.lock();

        let mut infos: Vec<SegmentInfo> = table
            .archived
            .iter()
            .map(|meta| SegmentInfo {
                ordinal: meta.ordinal,
                first_lsn: meta.first_lsn,
                last_lsn: meta.last_lsn,
                state: if meta.last_lsn < retention_lsn {
                    SegmentState::Reclaimable
                } else {
                    SegmentState::Archived
                },
            })
            .chain(table.full.iter().map(|meta| SegmentInfo {
                ordinal: meta.ordinal,
                first_lsn: meta.first_lsn,
                last_lsn: meta.last_lsn,
                state: SegmentState::Full,
            }))
            .collect();
        infos.push(SegmentInfo {
            ordinal: state.active.ordinal,
            first_lsn: state.active.first_lsn,
            last_lsn: state.active.last_lsn,
            state: SegmentState::Active,
        });
        infos.sort_by_key(|info| info.ordinal);
        infos
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// LSN the next append will receive
    pub fn next_lsn(&self) -> Lsn {
        self.state.lock().next_lsn
    }

    /// Last LSN handed out (0 when the log is empty)
    pub fn last_lsn(&self) -> Lsn {
        self.next_lsn() - 1
    }

    /// Highest LSN known to be durable
    pub fn durable_lsn(&self) -> Lsn {
        self.durable_lsn.load(Ordering::Acquire)
    }

    /// Frame bytes appended since this manager was opened
    pub fn bytes_appended(&self) -> u64 {
        self.bytes_appended.load(Ordering::Relaxed)
    }

    pub fn active_ordinal(&self) -> u64 {
        self.state.lock().active.ordinal
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn write_buffer_locked(&self, state: &mut AppendState) -> Result<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        state
            .active
            .io
            .write_at(state.active.written, &state.buffer)
            .map_err(|e| self.fail("WAL write failed", e))?;
        state.active.written += state.buffer.len() as u64;
        state.buffer.clear();
        Ok(())
    }

    /// Seal the active segment and open the next one
    fn rotate_locked(&self, state: &mut AppendState) -> Result<()> {
        self.write_buffer_locked(state)?;

        let last_lsn = state.next_lsn - 1;
        let trailer = encode_trailer(last_lsn);
        state
            .active
            .io
            .write_at(state.active.written, &trailer)
            .and_then(|_| state.active.io.sync())
            .map_err(|e| self.fail("WAL segment seal failed", e))?;
        state.active.written += trailer.len() as u64;
        self.durable_lsn.fetch_max(last_lsn, Ordering::AcqRel);

        let next_ordinal = state.active.ordinal + 1;
        let next = create_segment(self.io.as_ref(), &self.dir, next_ordinal, state.next_lsn)
            .map_err(|e| match e {
                GridError::Io(io_err) => self.fail("WAL segment create failed", io_err),
                other => other,
            })?;
        let sealed = std::mem::replace(&mut state.active, next);

        debug!(
            sealed = sealed.ordinal,
            first_lsn = sealed.first_lsn,
            last_lsn = sealed.last_lsn,
            active = next_ordinal,
            "WAL segment rotated"
        );
        self.segments.lock().full.push_back(SegmentMeta {
            ordinal: sealed.ordinal,
            path: sealed.path,
            first_lsn: sealed.first_lsn,
            last_lsn: sealed.last_lsn,
            archived: false,
        });
        Ok(())
    }

    /// Latch the failure and build the error returned to the caller
    fn fail(&self, context: &str, err: io::Error) -> GridError {
        let message = format!("{}: {}", context, err);
        error!(error = %err, "{}; WAL is now unusable", context);
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(message.clone());
        }
        self.failed.store(true, Ordering::Release);
        GridError::IoFailure(message)
    }

    fn check_failed(&self) -> Result<()> {
        if self.failed.load(Ordering::Acquire) {
            let message = self
                .failure
                .lock()
                .clone()
                .unwrap_or_else(|| "WAL failed".to_string());
            return Err(GridError::IoFailure(message));
        }
        Ok(())
    }
}

impl Drop for WalManager {
    fn drop(&mut self) {
        if self.is_failed() {
            return;
        }
        // Buffered frames are written but not synced; durability needs fsync
        let mut state = self.state.lock();
        if !state.buffer.is_empty() {
            if let Err(e) = state.active.io.write_at(state.active.written, &state.buffer) {
                warn!(error = %e, "failed to write buffered WAL frames on drop");
            }
            state.buffer.clear();
        }
    }
}

/// Create a segment file holding only its header, durably
fn create_segment(
    io: &dyn IoFactory,
    dir: &Path,
    ordinal: u64,
    first_lsn: Lsn,
) -> Result<ActiveSegment> {
    fs::create_dir_all(dir)?;
    let path = dir.join(segment_file_name(ordinal));
    let file = io.open(&path, true)?;
    file.set_len(0)?;
    let header = SegmentHeader { ordinal, first_lsn }.encode();
    file.write_at(0, &header)?;
    file.sync()?;
    sync_dir(dir)?;

    Ok(ActiveSegment {
        ordinal,
        path,
        io: file,
        first_lsn,
        written: SEGMENT_HEADER_SIZE as u64,
        last_lsn: first_lsn - 1,
    })
}
