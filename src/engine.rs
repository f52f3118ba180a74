//! Engine Module
//!
//! The durability engine that coordinates all components.
//!
//! ## Responsibilities
//! - Run recovery before accepting mutations
//! - Route page mutations through the WAL (WAL-before-page)
//! - Own the WAL flusher and checkpointer threads
//! - Drain dirty pages with a final checkpoint on close
//!
//! ## Startup Order
//! ```text
//! PageStoreSet::open ─► RecoveryManager::recover ─► WalManager::resume
//!        ─► CheckpointCoordinator (seeded with the recovered history)
//!        ─► WalFlusher + Checkpointer threads
//! ```

use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::checkpoint::{
    Checkpoint, CheckpointCoordinator, CheckpointReason, CheckpointState, Checkpointer,
};
use crate::config::{Config, WalSyncStrategy};
use crate::error::{GridError, Result};
use crate::io::{IoFactory, StdIoFactory};
use crate::metrics::PersistenceMetrics;
use crate::page::{PageId, PageKind, PageMemory, PageStoreSet, PendingWrite};
use crate::recovery::{RecoveredState, RecoveryManager};
use crate::topology::{CacheContext, NoopTopology, TopologyValidator};
use crate::wal::{Lsn, TxMarkerKind, WalFlusher, WalManager, WalRecord};

/// Upper bound on how long a trigger condition waits to be noticed
const MAX_CHECKPOINT_TICK_MS: u64 = 100;

/// The main durability engine
///
/// ## Concurrency Model
///
/// - **Mutations** (`allocate_page`, `write*`): run concurrently; page memory
///   serializes per page and the WAL serializes LSN assignment.
/// - **Transactions**: writes are buffered per transaction and reach page
///   memory and the WAL together at commit; reads never see them before.
/// - **Reads**: take only the page's own lock.
/// - **Checkpoints**: run on the checkpointer thread; `checkpoint()` asks
///   it and waits for the outcome.
///
/// Dropping an engine without [`Engine::close`] stops the threads but
/// skips the final checkpoint; the next open recovers from the WAL.
pub struct Engine {
    config: Config,
    stores: Arc<PageStoreSet>,
    memory: Arc<PageMemory>,
    wal: Arc<WalManager>,
    metrics: Arc<PersistenceMetrics>,
    topology: Arc<dyn TopologyValidator>,
    coordinator: Arc<CheckpointCoordinator>,
    flusher: Option<WalFlusher>,
    checkpointer: Option<Checkpointer>,
    recovered: RecoveredState,
    next_tx: AtomicU64,
    /// Buffered writes of open transactions
    transactions: Mutex<HashMap<u64, Vec<PendingWrite>>>,
}

impl Engine {
    /// Open or create an engine on the local filesystem
    pub fn open(config: Config) -> Result<Self> {
        Self::open_with(config, Arc::new(StdIoFactory), Arc::new(NoopTopology))
    }

    /// Open with explicit I/O and topology collaborators
    pub fn open_with(
        config: Config,
        io: Arc<dyn IoFactory>,
        topology: Arc<dyn TopologyValidator>,
    ) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;

        let metrics = Arc::new(PersistenceMetrics::from_config(&config)?);
        let stores = Arc::new(PageStoreSet::open(
            &config.store_dir(),
            config.page_size,
            Arc::clone(&io),
        )?);
        let memory = Arc::new(PageMemory::new(config.page_size));

        let recovered = RecoveryManager::new(&config, Arc::clone(&io)).recover(&stores, &memory)?;

        let wal = Arc::new(WalManager::resume(
            &config,
            Arc::clone(&io),
            Arc::clone(&metrics),
            recovered.segments.clone(),
            recovered.next_lsn,
        )?);

        let coordinator = Arc::new(CheckpointCoordinator::new(
            &config,
            Arc::clone(&memory),
            Arc::clone(&stores),
            Arc::clone(&wal),
            Arc::clone(&metrics),
            Arc::clone(&topology),
            Arc::clone(&io),
            recovered.history.clone(),
        ));

        let flusher = match config.wal_sync_strategy {
            WalSyncStrategy::Background { interval_ms } => Some(WalFlusher::start(
                Arc::clone(&wal),
                Duration::from_millis(interval_ms),
            )?),
            WalSyncStrategy::EveryWrite => None,
        };
        let tick =
            Duration::from_millis(config.checkpoint_frequency_ms.min(MAX_CHECKPOINT_TICK_MS));
        let checkpointer = Checkpointer::start(Arc::clone(&coordinator), tick)?;

        info!(
            data_dir = %config.data_dir.display(),
            partitions = stores.partitions().len(),
            pages = memory.page_count(),
            next_lsn = recovered.next_lsn,
            "engine opened"
        );

        Ok(Self {
            config,
            stores,
            memory,
            wal,
            metrics,
            topology,
            coordinator,
            flusher,
            checkpointer: Some(checkpointer),
            next_tx: AtomicU64::new(recovered.next_lsn),
            transactions: Mutex::new(HashMap::new()),
            recovered,
        })
    }

    // =========================================================================
    // Page Operations
    // =========================================================================

    /// Allocate a page in `partition`, creating the partition store if needed
    pub fn allocate_page(&self, partition: u32, kind: PageKind) -> Result<PageId> {
        self.stores.ensure(partition)?;
        self.memory.allocate(partition, kind, &self.wal)
    }

    /// Overwrite `data` at payload `offset`; returns the record's LSN
    pub fn write(&self, page_id: PageId, offset: usize, data: &[u8]) -> Result<Lsn> {
        self.memory.write(page_id, offset, data, None, &self.wal)
    }

    /// Copy of the page payload
    pub fn read(&self, page_id: PageId) -> Result<Vec<u8>> {
        self.memory.read(page_id)
    }

    /// Read after the topology layer approved the operation
    pub fn read_validated(
        &self,
        page_id: PageId,
        ctx: &CacheContext<'_>,
        key: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        if let Some(reason) = self.topology.validate_cache(ctx, false, true, key, &[]) {
            return Err(GridError::Topology(reason));
        }
        self.memory.read(page_id)
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Start a unit of writes
    ///
    /// Ids start at the first LSN of this run, so they never repeat an id
    /// still present in the WAL.
    pub fn begin_tx(&self) -> Result<u64> {
        let tx_id = self.next_tx.fetch_add(1, Ordering::Relaxed);
        self.wal.append(&WalRecord::TxMarker {
            tx_id,
            kind: TxMarkerKind::Begin,
        })?;
        self.transactions.lock().insert(tx_id, Vec::new());
        Ok(tx_id)
    }

    /// Buffer a write in `tx`; nothing is logged or visible until commit
    pub fn write_in_tx(&self, tx: u64, page_id: PageId, offset: usize, data: &[u8]) -> Result<()> {
        self.memory.check_write(page_id, offset, data.len())?;
        let mut transactions = self.transactions.lock();
        let writes = transactions
            .get_mut(&tx)
            .ok_or(GridError::UnknownTransaction(tx))?;
        writes.push(PendingWrite {
            page_id,
            offset,
            data: data.to_vec(),
        });
        Ok(())
    }

    /// Apply the buffered writes, log the commit marker and make it durable
    pub fn commit_tx(&self, tx: u64) -> Result<Lsn> {
        let writes = self
            .transactions
            .lock()
            .remove(&tx)
            .ok_or(GridError::UnknownTransaction(tx))?;
        let commit = WalRecord::TxMarker {
            tx_id: tx,
            kind: TxMarkerKind::Commit,
        };
        let lsn = self.memory.write_all(&writes, tx, &commit, &self.wal)?;
        self.wal.fsync(lsn)?;
        Ok(lsn)
    }

    /// Drop the buffered writes and log the rollback marker
    pub fn rollback_tx(&self, tx: u64) -> Result<Lsn> {
        self.transactions
            .lock()
            .remove(&tx)
            .ok_or(GridError::UnknownTransaction(tx))?;
        self.wal.append(&WalRecord::TxMarker {
            tx_id: tx,
            kind: TxMarkerKind::Rollback,
        })
    }

    /// Transactions begun but neither committed nor rolled back
    pub fn open_transactions(&self) -> usize {
        self.transactions.lock().len()
    }

    // =========================================================================
    // Durability
    // =========================================================================

    /// Make every record appended so far durable
    pub fn sync(&self) -> Result<()> {
        self.wal.flush()
    }

    /// Run a checkpoint on the checkpointer thread and wait for it
    pub fn checkpoint(&self) -> Result<Checkpoint> {
        self.checkpointer
            .as_ref()
            .ok_or(GridError::Shutdown)?
            .request(CheckpointReason::Manual)
    }

    /// Stop the threads, drain dirty pages, and make the WAL durable
    pub fn close(mut self) -> Result<()> {
        self.stop_threads();

        let abandoned = self.open_transactions();
        if abandoned > 0 {
            warn!(abandoned, "closing with open transactions; their writes are dropped");
        }

        let checkpoint = if self.wal.is_failed() {
            Err(GridError::IoFailure(
                "WAL failed; skipping shutdown checkpoint".to_string(),
            ))
        } else {
            self.coordinator.checkpoint(CheckpointReason::Shutdown)
        };
        let flushed = self.wal.flush();

        match (&checkpoint, &flushed) {
            (Ok(cp), Ok(())) => info!(checkpoint_id = cp.id, "engine closed"),
            _ => warn!("engine closed with errors"),
        }
        checkpoint?;
        flushed
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &PersistenceMetrics {
        &self.metrics
    }

    /// What recovery found when this engine was opened
    pub fn recovered_state(&self) -> &RecoveredState {
        &self.recovered
    }

    pub fn last_checkpoint(&self) -> Option<Checkpoint> {
        self.coordinator.last_checkpoint()
    }

    /// Checkpoints whose WAL is retained, oldest first
    pub fn checkpoint_history(&self) -> Vec<Checkpoint> {
        self.coordinator.history()
    }

    pub fn checkpoint_state(&self) -> CheckpointState {
        self.coordinator.state()
    }

    pub fn wal(&self) -> &WalManager {
        &self.wal
    }

    pub fn page_ids(&self) -> Vec<PageId> {
        self.memory.page_ids()
    }

    pub fn dirty_page_count(&self) -> usize {
        self.memory.dirty_page_count()
    }

    /// Bytes writable per page
    pub fn payload_size(&self) -> usize {
        self.memory.payload_size()
    }

    fn stop_threads(&mut self) {
        if let Some(mut checkpointer) = self.checkpointer.take() {
            checkpointer.stop();
        }
        if let Some(mut flusher) = self.flusher.take() {
            flusher.stop();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop_threads();
    }
}
