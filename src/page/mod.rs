//! Page Module
//!
//! Fixed-size pages, their on-disk stores and the in-memory buffer pool.
//!
//! ## Responsibilities
//! - Identify pages by `(partition, index)`
//! - Persist pages in one store file per partition (`PageStore`)
//! - Serve reads/writes from memory and track the dirty set (`PageMemory`)
//! - Shield pages under checkpoint with copy-on-write
//!
//! ## Page Layout
//! ```text
//! ┌──────────┬──────────────┬──────────────┬──────────────────────────┐
//! │ Kind (1) │ Reserved (7) │ Page LSN (8) │        Payload           │
//! └──────────┴──────────────┴──────────────┴──────────────────────────┘
//! ```
//! Index 0 of every store file is the store header, so page indexes start at 1.

mod memory;
mod store;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::wal::Lsn;

pub use memory::{CheckpointPage, DirtySnapshot, PageMemory, PendingWrite};
pub use store::{PageStore, PageStoreSet, STORE_HEADER_SIZE};

/// Size of the per-page header in bytes
pub const PAGE_HEADER_SIZE: usize = 16;

/// First usable page index in a store (index 0 is the store header)
pub const FIRST_PAGE_INDEX: u32 = 1;

const KIND_OFFSET: usize = 0;
const LSN_OFFSET: usize = 8;

/// Identifies a page across the whole node
///
/// Ordering is `(partition, index)`, which is the order checkpoints write in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId {
    pub partition: u32,
    pub index: u32,
}

impl PageId {
    pub fn new(partition: u32, index: u32) -> Self {
        Self { partition, index }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.partition, self.index)
    }
}

/// Page classification used for checkpoint accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageKind {
    Data,
    Index,
}

impl PageKind {
    /// On-disk tag stored in the first header byte
    pub fn tag(self) -> u8 {
        match self {
            PageKind::Data => 1,
            PageKind::Index => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(PageKind::Data),
            2 => Some(PageKind::Index),
            _ => None,
        }
    }
}

// =============================================================================
// Header Accessors
// =============================================================================

/// Write a fresh header into `page` (payload is left untouched)
pub fn init_page(page: &mut [u8], kind: PageKind, lsn: Lsn) {
    page[..PAGE_HEADER_SIZE].fill(0);
    page[KIND_OFFSET] = kind.tag();
    set_page_lsn(page, lsn);
}

/// Kind recorded in the page header, `None` for a never-initialized page
pub fn page_kind(page: &[u8]) -> Option<PageKind> {
    PageKind::from_tag(page[KIND_OFFSET])
}

/// LSN of the last WAL record applied to this page
pub fn page_lsn(page: &[u8]) -> Lsn {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&page[LSN_OFFSET..LSN_OFFSET + 8]);
    u64::from_le_bytes(raw)
}

pub fn set_page_lsn(page: &mut [u8], lsn: Lsn) {
    page[LSN_OFFSET..LSN_OFFSET + 8].copy_from_slice(&lsn.to_le_bytes());
}
