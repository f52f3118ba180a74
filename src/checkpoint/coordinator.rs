//! Checkpoint Coordinator
//!
//! Runs one checkpoint at a time through the state machine described in
//! the module docs.
//!
//! ## Ordering per checkpoint
//! 1. `CheckpointBegin` is logged under the page memory barrier; its LSN is
//!    the checkpoint's `start_lsn`
//! 2. the WAL is fsynced up to `start_lsn` before the first page write
//! 3. pages are written in ascending `(partition, index)` order, then every
//!    touched store is fsynced
//! 4. `CheckpointEnd` is logged and the WAL fsynced up to it
//!
//! Only after step 4 is the checkpoint recorded, reported to metrics and
//! used to move the WAL retention point.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{GridError, Result};
use crate::io::IoFactory;
use crate::metrics::PersistenceMetrics;
use crate::page::{DirtySnapshot, PageId, PageKind, PageMemory, PageStore, PageStoreSet};
use crate::topology::TopologyValidator;
use crate::wal::{Lsn, WalManager, WalRecord};

use super::{Checkpoint, CheckpointMarker, CheckpointReason, CheckpointState};

/// Drives checkpoints over page memory, the page stores and the WAL
pub struct CheckpointCoordinator {
    memory: Arc<PageMemory>,
    stores: Arc<PageStoreSet>,
    wal: Arc<WalManager>,
    metrics: Arc<PersistenceMetrics>,
    topology: Arc<dyn TopologyValidator>,
    io: Arc<dyn IoFactory>,
    marker_path: PathBuf,

    frequency: Duration,
    dirty_pages_threshold: usize,
    wal_bytes_threshold: u64,
    history_size: usize,

    state: AtomicU8,
    /// At most one checkpoint runs at a time
    run_lock: Mutex<()>,
    next_id: AtomicU64,
    /// Completed checkpoints, oldest first, at most `history_size`
    history: Mutex<VecDeque<Checkpoint>>,
    last_finished: Mutex<Instant>,
    wal_bytes_at_last: AtomicU64,
}

impl CheckpointCoordinator {
    /// `recovered` holds the complete checkpoints found by recovery, oldest
    /// first; the newest `wal_history_size` of them keep their WAL retained
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        memory: Arc<PageMemory>,
        stores: Arc<PageStoreSet>,
        wal: Arc<WalManager>,
        metrics: Arc<PersistenceMetrics>,
        topology: Arc<dyn TopologyValidator>,
        io: Arc<dyn IoFactory>,
        recovered: Vec<Checkpoint>,
    ) -> Self {
        let next_id = recovered.last().map_or(1, |cp| cp.id + 1);
        let skip = recovered.len().saturating_sub(config.wal_history_size);
        let history: VecDeque<Checkpoint> = recovered.into_iter().skip(skip).collect();
        let wal_bytes_at_last = wal.bytes_appended();

        Self {
            memory,
            stores,
            wal,
            metrics,
            topology,
            io,
            marker_path: config.marker_path(),
            frequency: Duration::from_millis(config.checkpoint_frequency_ms),
            dirty_pages_threshold: config.checkpoint_dirty_pages_threshold,
            wal_bytes_threshold: config.checkpoint_wal_bytes_threshold,
            history_size: config.wal_history_size,
            state: AtomicU8::new(CheckpointState::Idle as u8),
            run_lock: Mutex::new(()),
            next_id: AtomicU64::new(next_id),
            history: Mutex::new(history),
            last_finished: Mutex::new(Instant::now()),
            wal_bytes_at_last: AtomicU64::new(wal_bytes_at_last),
        }
    }

    // =========================================================================
    // Running Checkpoints
    // =========================================================================

    /// Run a checkpoint, waiting for any in-flight one to finish first
    pub fn checkpoint(&self, reason: CheckpointReason) -> Result<Checkpoint> {
        let _run = self.run_lock.lock();
        self.run(reason)
    }

    /// Run a checkpoint unless one is already in flight
    pub fn try_checkpoint(&self, reason: CheckpointReason) -> Option<Result<Checkpoint>> {
        let _run = self.run_lock.try_lock()?;
        Some(self.run(reason))
    }

    /// Trigger policy: elapsed time, dirty-page count, WAL growth
    pub fn should_trigger(&self) -> Option<CheckpointReason> {
        if self.wal.is_failed() {
            return None;
        }
        let dirty = self.memory.dirty_page_count();
        let wal_growth = self
            .wal
            .bytes_appended()
            .saturating_sub(self.wal_bytes_at_last.load(Ordering::Relaxed));

        if self.last_finished.lock().elapsed() >= self.frequency && (dirty > 0 || wal_growth > 0) {
            return Some(CheckpointReason::Timer);
        }
        if self.dirty_pages_threshold > 0 && dirty >= self.dirty_pages_threshold {
            return Some(CheckpointReason::DirtyPages);
        }
        if self.wal_bytes_threshold > 0 && wal_growth >= self.wal_bytes_threshold {
            return Some(CheckpointReason::WalSize);
        }
        None
    }

    fn run(&self, reason: CheckpointReason) -> Result<Checkpoint> {
        let started = Instant::now();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.set_state(CheckpointState::CollectingDirtyPages);
        let topology_version = self.topology.topology_version();
        let snapshot = match self.memory.collect_dirty(|dirty_pages| {
            self.wal.append(&WalRecord::CheckpointBegin {
                checkpoint_id: id,
                dirty_pages: dirty_pages as u64,
            })
        }) {
            Ok(snapshot) => snapshot,
            // Collection restores the dirty set itself
            Err(e) => return Err(self.abort(id, &[], e)),
        };

        info!(
            checkpoint_id = id,
            %reason,
            dirty_pages = snapshot.pages.len(),
            start_lsn = snapshot.start_lsn,
            topology_version,
            "checkpoint started"
        );

        let page_ids = snapshot.page_ids();
        let checkpoint = match self.write_out(id, snapshot, topology_version, started) {
            Ok(checkpoint) => checkpoint,
            Err(e) => return Err(self.abort(id, &page_ids, e)),
        };

        self.set_state(CheckpointState::Idle);
        self.finish(&checkpoint);
        Ok(checkpoint)
    }

    fn write_out(
        &self,
        id: u64,
        snapshot: DirtySnapshot,
        topology_version: u64,
        started: Instant,
    ) -> Result<Checkpoint> {
        let start_lsn = snapshot.start_lsn;

        self.set_state(CheckpointState::WritingPages);
        // WAL-before-page: every record reflected in the images is durable first
        self.wal.fsync(start_lsn)?;

        let mut touched: BTreeMap<u32, Arc<PageStore>> = BTreeMap::new();
        let mut data_pages = 0u64;
        let mut index_pages = 0u64;
        for page in snapshot.pages {
            let store = self.store_for(&mut touched, page.id)?;
            store.write(page.id.index, &page.image)?;
            match page.kind {
                PageKind::Data => data_pages += 1,
                PageKind::Index => index_pages += 1,
            }
            // `page` drops here, releasing the snapshot's reference to the image
        }

        self.set_state(CheckpointState::FsyncingData);
        let fsync_started = Instant::now();
        for store in touched.values() {
            store.fsync()?;
        }
        let fsync_duration = fsync_started.elapsed();

        self.set_state(CheckpointState::WritingCheckpointEnd);
        let total_pages = data_pages + index_pages;
        let cow_pages = self.memory.cow_pages();
        let end_lsn = self.wal.append(&WalRecord::CheckpointEnd {
            checkpoint_id: id,
            start_lsn,
            topology_version,
            total_pages,
            data_pages,
            index_pages,
            cow_pages,
        })?;

        self.set_state(CheckpointState::FsyncingWal);
        self.wal.fsync(end_lsn)?;

        Ok(Checkpoint {
            id,
            start_lsn,
            end_lsn,
            topology_version,
            total_pages,
            data_pages,
            index_pages,
            cow_pages,
            duration: started.elapsed(),
            fsync_duration,
        })
    }

    /// Bookkeeping after the checkpoint became durable; failures only warn
    fn finish(&self, checkpoint: &Checkpoint) {
        let (retention_lsn, entries) = {
            let mut history = self.history.lock();
            history.push_back(checkpoint.clone());
            while history.len() > self.history_size {
                history.pop_front();
            }
            (
                history.front().map_or(checkpoint.start_lsn, |oldest| oldest.start_lsn),
                history.iter().map(Checkpoint::marker_entry).collect::<Vec<_>>(),
            )
        };

        if let Some(marker) = CheckpointMarker::new(entries) {
            if let Err(e) = marker.persist(self.io.as_ref(), &self.marker_path) {
                warn!(
                    checkpoint_id = checkpoint.id,
                    error = %e,
                    "failed to persist checkpoint marker"
                );
            }
        }

        self.metrics.on_checkpoint(
            checkpoint.duration,
            checkpoint.fsync_duration,
            checkpoint.total_pages,
            checkpoint.data_pages,
            checkpoint.index_pages,
            checkpoint.cow_pages,
        );
        self.wal_bytes_at_last
            .store(self.wal.bytes_appended(), Ordering::Relaxed);
        *self.last_finished.lock() = Instant::now();

        info!(
            checkpoint_id = checkpoint.id,
            start_lsn = checkpoint.start_lsn,
            end_lsn = checkpoint.end_lsn,
            total_pages = checkpoint.total_pages,
            data_pages = checkpoint.data_pages,
            index_pages = checkpoint.index_pages,
            cow_pages = checkpoint.cow_pages,
            duration_ms = checkpoint.duration.as_millis() as u64,
            fsync_ms = checkpoint.fsync_duration.as_millis() as u64,
            "checkpoint finished"
        );

        match self.wal.archive_segments() {
            Ok(0) => {}
            Ok(archived) => debug!(archived, "archived full WAL segments"),
            Err(e) => warn!(error = %e, "failed to archive WAL segments"),
        }
        if let Err(e) = self.wal.purge_reclaimable(retention_lsn) {
            warn!(retention_lsn, error = %e, "failed to reclaim WAL segments");
        }
    }

    fn abort(&self, id: u64, page_ids: &[PageId], cause: GridError) -> GridError {
        self.set_state(CheckpointState::Aborted);
        self.memory.restore_dirty(page_ids);
        warn!(
            checkpoint_id = id,
            pages = page_ids.len(),
            error = %cause,
            "checkpoint aborted; pages stay dirty for the next attempt"
        );
        GridError::CheckpointAborted {
            checkpoint_id: id,
            reason: cause.to_string(),
        }
    }

    fn store_for(
        &self,
        touched: &mut BTreeMap<u32, Arc<PageStore>>,
        page_id: PageId,
    ) -> Result<Arc<PageStore>> {
        if let Some(store) = touched.get(&page_id.partition) {
            return Ok(Arc::clone(store));
        }
        let store = self.stores.get(page_id.partition)?;
        touched.insert(page_id.partition, Arc::clone(&store));
        Ok(store)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn state(&self) -> CheckpointState {
        CheckpointState::from_u8(self.state.load(Ordering::Acquire))
            .unwrap_or(CheckpointState::Idle)
    }

    /// Newest complete checkpoint
    pub fn last_checkpoint(&self) -> Option<Checkpoint> {
        self.history.lock().back().cloned()
    }

    /// Retained checkpoints, oldest first
    pub fn history(&self) -> Vec<Checkpoint> {
        self.history.lock().iter().cloned().collect()
    }

    /// WAL records from this LSN on are needed by a retained checkpoint
    pub fn retention_lsn(&self) -> Option<Lsn> {
        self.history.lock().front().map(|cp| cp.start_lsn)
    }

    /// Id the next checkpoint will get
    pub fn next_checkpoint_id(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: CheckpointState) {
        self.state.store(state as u8, Ordering::Release);
    }
}
