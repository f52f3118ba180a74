//! Page Memory
//!
//! In-memory buffer pool holding every page of the node.
//!
//! ## Concurrency Model
//!
//! - `barrier`: RwLock. Mutators hold it shared for "append WAL record +
//!   apply to page"; dirty-set collection holds it exclusively for the
//!   O(dirty-pages) snapshot only, never across I/O.
//! - Each page has its own mutex. The WAL record is appended while the page
//!   lock is held, so per-page LSN order equals application order.
//! - `dirty`: the accepting generation's dirty list. Collection swaps it out
//!   (double-buffering): generation N goes to the checkpoint while N+1
//!   starts empty.
//!
//! ## Transactions
//! A transaction's writes reach page memory only at commit, through
//! [`PageMemory::write_all`]. It holds the barrier shared from the first
//! delta to the commit record, so a checkpoint snapshot contains either none
//! of the transaction or all of it with the commit before `start_lsn`.
//!
//! ## Copy-on-write
//! Page bytes live in an `Arc`. Collection hands the checkpoint a clone of
//! that `Arc` (a reference, not a copy). A mutator finding the `Arc` shared
//! copies the image into a fresh buffer and mutates that, leaving the
//! checkpoint's pre-mutation image untouched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{GridError, Result};
use crate::wal::{Lsn, WalManager, WalRecord};

use super::{
    init_page, page_kind, page_lsn, set_page_lsn, PageId, PageKind, FIRST_PAGE_INDEX,
    PAGE_HEADER_SIZE,
};

struct PageSlot {
    state: Mutex<SlotState>,
}

struct SlotState {
    /// Full page image (header + payload)
    data: Arc<Vec<u8>>,
    kind: PageKind,
    /// Dirty in the accepting generation
    dirty: bool,
}

impl PageSlot {
    fn new(data: Vec<u8>, kind: PageKind, dirty: bool) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState {
                data: Arc::new(data),
                kind,
                dirty,
            }),
        })
    }
}

/// One buffered write of an open transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub page_id: PageId,
    pub offset: usize,
    pub data: Vec<u8>,
}

/// One page handed to a checkpoint
pub struct CheckpointPage {
    pub id: PageId,
    pub kind: PageKind,
    /// Image as of the snapshot; shared with page memory until dropped
    pub image: Arc<Vec<u8>>,
}

/// Result of dirty-set collection
pub struct DirtySnapshot {
    /// Generation the pages were assigned to
    pub generation: u64,
    /// LSN of the record logged under the barrier; every page image reflects
    /// exactly the records up to this LSN
    pub start_lsn: Lsn,
    /// Pages in ascending `(partition, index)` order
    pub pages: Vec<CheckpointPage>,
}

impl DirtySnapshot {
    pub fn page_ids(&self) -> Vec<PageId> {
        self.pages.iter().map(|p| p.id).collect()
    }
}

/// Buffer pool with dirty tracking and copy-on-write
pub struct PageMemory {
    page_size: usize,
    pages: RwLock<HashMap<PageId, Arc<PageSlot>>>,
    next_index: Mutex<HashMap<u32, u32>>,
    dirty: Mutex<Vec<PageId>>,
    barrier: RwLock<()>,
    generation: AtomicU64,
    cow_pages: AtomicU64,
}

impl PageMemory {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            pages: RwLock::new(HashMap::new()),
            next_index: Mutex::new(HashMap::new()),
            dirty: Mutex::new(Vec::new()),
            barrier: RwLock::new(()),
            generation: AtomicU64::new(0),
            cow_pages: AtomicU64::new(0),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Bytes available to callers in each page
    pub fn payload_size(&self) -> usize {
        self.page_size - PAGE_HEADER_SIZE
    }

    // =========================================================================
    // Mutations (WAL-before-page)
    // =========================================================================

    /// Allocate a new page in `partition`, logging a `PageAlloc` record first
    pub fn allocate(&self, partition: u32, kind: PageKind, wal: &WalManager) -> Result<PageId> {
        let _barrier = self.barrier.read();

        let mut next = self.next_index.lock();
        let index = *next.get(&partition).unwrap_or(&FIRST_PAGE_INDEX);
        let id = PageId::new(partition, index);

        let lsn = wal.append(&WalRecord::PageAlloc { page_id: id, kind })?;

        let mut data = vec![0u8; self.page_size];
        init_page(&mut data, kind, lsn);
        self.pages.write().insert(id, PageSlot::new(data, kind, true));
        self.dirty.lock().push(id);
        next.insert(partition, index + 1);
        Ok(id)
    }

    /// Overwrite `data` at payload `offset` of `page_id`, logging first
    pub fn write(
        &self,
        page_id: PageId,
        offset: usize,
        data: &[u8],
        tx: Option<u64>,
        wal: &WalManager,
    ) -> Result<Lsn> {
        self.check_bounds(offset, data.len())?;
        let _barrier = self.barrier.read();
        let slot = self.slot(page_id)?;
        let mut state = slot.state.lock();

        let lsn = wal.append(&WalRecord::PageDelta {
            page_id,
            offset: offset as u32,
            data: data.to_vec(),
            tx,
        })?;

        self.apply_locked(&mut state, page_id, offset, data, lsn);
        Ok(lsn)
    }

    /// Apply a committed transaction's writes, then log `commit`
    ///
    /// Every write is validated before anything is logged. Returns the LSN
    /// of the commit record.
    pub fn write_all(
        &self,
        writes: &[PendingWrite],
        tx: u64,
        commit: &WalRecord,
        wal: &WalManager,
    ) -> Result<Lsn> {
        for write in writes {
            self.check_write(write.page_id, write.offset, write.data.len())?;
        }

        let _barrier = self.barrier.read();
        for write in writes {
            let slot = self.slot(write.page_id)?;
            let mut state = slot.state.lock();
            let lsn = wal.append(&WalRecord::PageDelta {
                page_id: write.page_id,
                offset: write.offset as u32,
                data: write.data.clone(),
                tx: Some(tx),
            })?;
            self.apply_locked(&mut state, write.page_id, write.offset, &write.data, lsn);
        }
        wal.append(commit)
    }

    /// Fails the way `write` would, without logging anything
    pub fn check_write(&self, page_id: PageId, offset: usize, len: usize) -> Result<()> {
        self.check_bounds(offset, len)?;
        self.slot(page_id).map(|_| ())
    }

    fn apply_locked(
        &self,
        state: &mut SlotState,
        page_id: PageId,
        offset: usize,
        data: &[u8],
        lsn: Lsn,
    ) {
        if Arc::get_mut(&mut state.data).is_none() {
            // The in-flight checkpoint still references this image
            self.cow_pages.fetch_add(1, Ordering::Relaxed);
            state.data = Arc::new(state.data.as_ref().clone());
        }
        let page = Arc::make_mut(&mut state.data);
        let start = PAGE_HEADER_SIZE + offset;
        page[start..start + data.len()].copy_from_slice(data);
        set_page_lsn(page, lsn);

        if !state.dirty {
            state.dirty = true;
            self.dirty.lock().push(page_id);
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Copy of the page payload
    pub fn read(&self, page_id: PageId) -> Result<Vec<u8>> {
        self.read_with(page_id, |payload| payload.to_vec())
    }

    /// Run `f` over the page payload without copying it
    pub fn read_with<R>(&self, page_id: PageId, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let slot = self.slot(page_id)?;
        let state = slot.state.lock();
        Ok(f(&state.data[PAGE_HEADER_SIZE..]))
    }

    pub fn page_kind(&self, page_id: PageId) -> Result<PageKind> {
        let slot = self.slot(page_id)?;
        let kind = slot.state.lock().kind;
        Ok(kind)
    }

    /// LSN of the last record applied to the page (its version)
    pub fn page_lsn(&self, page_id: PageId) -> Result<Lsn> {
        let slot = self.slot(page_id)?;
        let lsn = page_lsn(&slot.state.lock().data);
        Ok(lsn)
    }

    pub fn is_dirty(&self, page_id: PageId) -> Result<bool> {
        let slot = self.slot(page_id)?;
        let dirty = slot.state.lock().dirty;
        Ok(dirty)
    }

    pub fn contains(&self, page_id: PageId) -> bool {
        self.pages.read().contains_key(&page_id)
    }

    pub fn page_count(&self) -> usize {
        self.pages.read().len()
    }

    /// Pages dirtied in the accepting generation
    pub fn dirty_page_count(&self) -> usize {
        self.dirty.lock().len()
    }

    /// All resident page ids in ascending order
    pub fn page_ids(&self) -> Vec<PageId> {
        let mut ids: Vec<PageId> = self.pages.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    // =========================================================================
    // Checkpoint Support
    // =========================================================================

    /// Snapshot the dirty set under the exclusive barrier
    ///
    /// `log_begin` runs while mutators are excluded and receives the number
    /// of collected pages; the LSN it returns becomes the snapshot's
    /// `start_lsn`. Every collected page moves to the new generation and
    /// stops being dirty in the accepting one.
    pub fn collect_dirty(
        &self,
        log_begin: impl FnOnce(usize) -> Result<Lsn>,
    ) -> Result<DirtySnapshot> {
        let _barrier = self.barrier.write();

        let mut ids = std::mem::take(&mut *self.dirty.lock());
        ids.sort_unstable();
        ids.dedup();

        let start_lsn = match log_begin(ids.len()) {
            Ok(lsn) => lsn,
            Err(e) => {
                // Nothing was handed out; put the generation back untouched
                *self.dirty.lock() = ids;
                return Err(e);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.cow_pages.store(0, Ordering::Relaxed);

        let pages = self.pages.read();
        let mut collected = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(slot) = pages.get(&id) {
                let mut state = slot.state.lock();
                state.dirty = false;
                collected.push(CheckpointPage {
                    id,
                    kind: state.kind,
                    image: Arc::clone(&state.data),
                });
            }
        }

        Ok(DirtySnapshot {
            generation,
            start_lsn,
            pages: collected,
        })
    }

    /// Re-mark pages of an aborted checkpoint as dirty
    pub fn restore_dirty(&self, ids: &[PageId]) {
        let pages = self.pages.read();
        let mut restored = Vec::new();
        for id in ids {
            if let Some(slot) = pages.get(id) {
                let mut state = slot.state.lock();
                if !state.dirty {
                    state.dirty = true;
                    restored.push(*id);
                }
            }
        }
        // Page locks are always taken before the dirty list lock
        self.dirty.lock().extend(restored);
    }

    /// Pages copied on write since the last collection
    pub fn cow_pages(&self) -> u64 {
        self.cow_pages.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Recovery Support
    // =========================================================================

    /// Install a clean page image read from a page store
    pub fn load_page(&self, page_id: PageId, image: Vec<u8>) -> Result<()> {
        if image.len() != self.page_size {
            return Err(GridError::OutOfBounds {
                offset: 0,
                len: image.len(),
                capacity: self.page_size,
            });
        }
        let kind = page_kind(&image).ok_or_else(|| GridError::CorruptStore {
            partition: page_id.partition,
            reason: format!("page {} has no valid kind tag", page_id),
        })?;
        self.pages.write().insert(page_id, PageSlot::new(image, kind, false));
        self.bump_next_index(page_id);
        Ok(())
    }

    /// Replay a `PageAlloc`; returns false if the page already reflects it
    pub fn replay_alloc(&self, page_id: PageId, kind: PageKind, lsn: Lsn) -> bool {
        if self.contains(page_id) {
            return false;
        }
        let mut data = vec![0u8; self.page_size];
        init_page(&mut data, kind, lsn);
        self.pages.write().insert(page_id, PageSlot::new(data, kind, true));
        self.dirty.lock().push(page_id);
        self.bump_next_index(page_id);
        true
    }

    /// Replay a `PageDelta`; returns false if the page already reflects it
    pub fn replay_delta(
        &self,
        page_id: PageId,
        offset: usize,
        data: &[u8],
        lsn: Lsn,
    ) -> Result<bool> {
        self.check_bounds(offset, data.len())?;
        let slot = self.slot(page_id)?;
        let mut state = slot.state.lock();
        if lsn <= page_lsn(&state.data) {
            return Ok(false);
        }
        self.apply_locked(&mut state, page_id, offset, data, lsn);
        Ok(true)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn slot(&self, page_id: PageId) -> Result<Arc<PageSlot>> {
        self.pages
            .read()
            .get(&page_id)
            .cloned()
            .ok_or(GridError::PageNotFound(page_id))
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<()> {
        let capacity = self.payload_size();
        if offset.checked_add(len).map_or(true, |end| end > capacity) {
            return Err(GridError::OutOfBounds {
                offset,
                len,
                capacity,
            });
        }
        Ok(())
    }

    fn bump_next_index(&self, page_id: PageId) {
        let mut next = self.next_index.lock();
        let entry = next.entry(page_id.partition).or_insert(FIRST_PAGE_INDEX);
        if *entry <= page_id.index {
            *entry = page_id.index + 1;
        }
    }
}
