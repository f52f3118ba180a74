//! Page Store
//!
//! One append-capable, fixed-page-size file per partition.
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Page 0: Store Header                                         │
//! │ ┌─────────┬─────────┬──────────┬───────────┬───────┬───────┐ │
//! │ │Magic (4)│Ver (2)  │PageSz (4)│Partition 4│Count 4│Free 4 │ │
//! │ └─────────┴─────────┴──────────┴───────────┴───────┴───────┘ │
//! │                                               CRC32 (4)      │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Page 1 .. Page N (page_size bytes each)                      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Concurrency: the checkpoint thread is the only writer; recovery and
//! tooling read.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{GridError, Result};
use crate::io::{sync_dir, FileIo, IoFactory};

use super::FIRST_PAGE_INDEX;

/// Bytes of page 0 actually used by the header
pub const STORE_HEADER_SIZE: usize = 28;

const STORE_MAGIC: [u8; 4] = *b"GVPS";
const STORE_VERSION: u16 = 1;

/// Mutable header state, persisted on fsync
#[derive(Debug, Clone, Copy)]
struct StoreHeader {
    page_count: u32,
    free_list_head: u32,
}

struct StoreState {
    header: StoreHeader,
    header_dirty: bool,
}

/// Fixed-size page file for one partition
pub struct PageStore {
    partition: u32,
    page_size: usize,
    io: Arc<dyn FileIo>,
    state: Mutex<StoreState>,
}

impl PageStore {
    /// Initialize a new store file and make its header durable
    pub fn create(io: Arc<dyn FileIo>, partition: u32, page_size: usize) -> Result<Self> {
        let store = Self {
            partition,
            page_size,
            io,
            state: Mutex::new(StoreState {
                header: StoreHeader {
                    page_count: 0,
                    free_list_head: 0,
                },
                header_dirty: true,
            }),
        };
        store.io.set_len(page_size as u64)?;
        store.fsync()?;
        Ok(store)
    }

    /// Open an existing store file and validate its header
    pub fn open(io: Arc<dyn FileIo>, partition: u32, page_size: usize) -> Result<Self> {
        let mut raw = [0u8; STORE_HEADER_SIZE];
        io.read_at(0, &mut raw).map_err(|e| GridError::CorruptStore {
            partition,
            reason: format!("header unreadable: {}", e),
        })?;
        let header = decode_header(&raw, partition, page_size)?;

        // Pages beyond the recorded count may exist if a checkpoint wrote them
        // but crashed before the header fsync; they are covered by WAL replay.
        let len = io.len()?;
        let on_disk = (len / page_size as u64).saturating_sub(1) as u32;
        if on_disk > header.page_count {
            debug!(
                partition,
                recorded = header.page_count,
                on_disk,
                "page store holds pages beyond its header count"
            );
        }

        Ok(Self {
            partition,
            page_size,
            io,
            state: Mutex::new(StoreState {
                header,
                header_dirty: false,
            }),
        })
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages (excluding the header page)
    pub fn page_count(&self) -> u32 {
        self.state.lock().header.page_count
    }

    /// Read page `index` into `buf`
    pub fn read(&self, index: u32, buf: &mut [u8]) -> Result<()> {
        self.check_buffer(buf.len())?;
        if index < FIRST_PAGE_INDEX || index > self.page_count() {
            return Err(GridError::PageNotFound(super::PageId::new(
                self.partition,
                index,
            )));
        }
        self.io.read_at(self.offset(index), buf)?;
        Ok(())
    }

    /// Write a full page image; extends the store when `index` is past the end
    pub fn write(&self, index: u32, page: &[u8]) -> Result<()> {
        self.check_buffer(page.len())?;
        if index < FIRST_PAGE_INDEX {
            return Err(GridError::PageNotFound(super::PageId::new(
                self.partition,
                index,
            )));
        }
        self.io.write_at(self.offset(index), page)?;

        let mut state = self.state.lock();
        if index > state.header.page_count {
            state.header.page_count = index;
            state.header_dirty = true;
        }
        Ok(())
    }

    /// Reserve the next page index and extend the file with a zeroed page
    pub fn allocate(&self) -> Result<u32> {
        let mut state = self.state.lock();
        let index = state.header.page_count + 1;
        self.io.set_len(self.offset(index) + self.page_size as u64)?;
        state.header.page_count = index;
        state.header_dirty = true;
        Ok(index)
    }

    /// Persist the header if it changed, then issue the durability barrier
    pub fn fsync(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.header_dirty {
            let raw = encode_header(&state.header, self.partition, self.page_size);
            self.io.write_at(0, &raw)?;
        }
        self.io.sync()?;
        state.header_dirty = false;
        Ok(())
    }

    fn offset(&self, index: u32) -> u64 {
        index as u64 * self.page_size as u64
    }

    fn check_buffer(&self, len: usize) -> Result<()> {
        if len != self.page_size {
            return Err(GridError::OutOfBounds {
                offset: 0,
                len,
                capacity: self.page_size,
            });
        }
        Ok(())
    }
}

fn encode_header(
    header: &StoreHeader,
    partition: u32,
    page_size: usize,
) -> [u8; STORE_HEADER_SIZE] {
    let mut raw = [0u8; STORE_HEADER_SIZE];
    raw[0..4].copy_from_slice(&STORE_MAGIC);
    raw[4..6].copy_from_slice(&STORE_VERSION.to_le_bytes());
    raw[8..12].copy_from_slice(&(page_size as u32).to_le_bytes());
    raw[12..16].copy_from_slice(&partition.to_le_bytes());
    raw[16..20].copy_from_slice(&header.page_count.to_le_bytes());
    raw[20..24].copy_from_slice(&header.free_list_head.to_le_bytes());
    let crc = crc32fast::hash(&raw[..24]);
    raw[24..28].copy_from_slice(&crc.to_le_bytes());
    raw
}

fn decode_header(
    raw: &[u8; STORE_HEADER_SIZE],
    partition: u32,
    page_size: usize,
) -> Result<StoreHeader> {
    let corrupt = |reason: String| GridError::CorruptStore { partition, reason };

    if raw[0..4] != STORE_MAGIC {
        return Err(corrupt("bad magic".to_string()));
    }
    let stored_crc = read_u32(raw, 24);
    if crc32fast::hash(&raw[..24]) != stored_crc {
        return Err(corrupt("header checksum mismatch".to_string()));
    }
    let version = u16::from_le_bytes([raw[4], raw[5]]);
    if version != STORE_VERSION {
        return Err(corrupt(format!("unsupported version {}", version)));
    }
    let stored_page_size = read_u32(raw, 8) as usize;
    if stored_page_size != page_size {
        return Err(GridError::Config(format!(
            "partition {} was created with page_size {}, configured {}",
            partition, stored_page_size, page_size
        )));
    }
    let stored_partition = read_u32(raw, 12);
    if stored_partition != partition {
        return Err(corrupt(format!(
            "file belongs to partition {}",
            stored_partition
        )));
    }
    Ok(StoreHeader {
        page_count: read_u32(raw, 16),
        free_list_head: read_u32(raw, 20),
    })
}

fn read_u32(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

// =============================================================================
// Store Set
// =============================================================================

/// All page stores of a node, keyed by partition
///
/// ## Concurrency:
/// - `stores`: RwLock (lookups are shared, creating a partition is exclusive)
/// - Each `PageStore` serializes its own header updates
pub struct PageStoreSet {
    dir: PathBuf,
    page_size: usize,
    io: Arc<dyn IoFactory>,
    stores: RwLock<BTreeMap<u32, Arc<PageStore>>>,
}

impl PageStoreSet {
    /// Open every `part-NNNNN.bin` file found in `dir`
    pub fn open(dir: &Path, page_size: usize, io: Arc<dyn IoFactory>) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let mut partitions = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() {
                if let Some(partition) = Self::parse_partition(&path) {
                    partitions.push(partition);
                }
            }
        }
        partitions.sort_unstable();

        let mut stores = BTreeMap::new();
        for partition in partitions {
            let file = io.open(&Self::store_path_with_dir(dir, partition), false)?;
            let store = PageStore::open(file, partition, page_size)?;
            stores.insert(partition, Arc::new(store));
        }

        if !stores.is_empty() {
            info!(partitions = stores.len(), "page stores opened");
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            page_size,
            io,
            stores: RwLock::new(stores),
        })
    }

    /// Store for `partition`, failing if it was never created
    pub fn get(&self, partition: u32) -> Result<Arc<PageStore>> {
        self.stores
            .read()
            .get(&partition)
            .cloned()
            .ok_or(GridError::MissingPartitionStore(partition))
    }

    /// Store for `partition`, creating and syncing the file on first use
    pub fn ensure(&self, partition: u32) -> Result<Arc<PageStore>> {
        if let Some(store) = self.stores.read().get(&partition) {
            return Ok(Arc::clone(store));
        }

        let mut stores = self.stores.write();
        if let Some(store) = stores.get(&partition) {
            return Ok(Arc::clone(store));
        }
        let path = self.store_path(partition);
        let file = self.io.open(&path, true)?;
        let store = Arc::new(PageStore::create(file, partition, self.page_size)?);
        sync_dir(&self.dir)?;
        stores.insert(partition, Arc::clone(&store));
        debug!(partition, path = %path.display(), "page store created");
        Ok(store)
    }

    pub fn contains(&self, partition: u32) -> bool {
        self.stores.read().contains_key(&partition)
    }

    /// Known partitions in ascending order
    pub fn partitions(&self) -> Vec<u32> {
        self.stores.read().keys().copied().collect()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn store_path(&self, partition: u32) -> PathBuf {
        Self::store_path_with_dir(&self.dir, partition)
    }

    fn store_path_with_dir(dir: &Path, partition: u32) -> PathBuf {
        dir.join(format!("part-{:05}.bin", partition))
    }

    /// "part-00042.bin" → Some(42)
    fn parse_partition(path: &Path) -> Option<u32> {
        if path.extension()? != "bin" {
            return None;
        }
        let name = path.file_stem()?.to_string_lossy();
        name.strip_prefix("part-")?.parse().ok()
    }
}
