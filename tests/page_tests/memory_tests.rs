//! Tests for page memory
//!
//! These tests verify:
//! - Allocation, writes and reads under WAL-before-page
//! - Dirty tracking and dirty-set collection
//! - Copy-on-write for pages held by a checkpoint
//! - Committed transactions applied as one unit
//! - Recovery helpers (page loading and idempotent replay)

#[path = "../common/mod.rs"]
mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use gridvault::io::StdIoFactory;
use gridvault::page::{init_page, page_lsn, PageMemory, PendingWrite, PAGE_HEADER_SIZE};
use gridvault::wal::{TxMarkerKind, WalManager, WalRecord};
use gridvault::{Config, GridError, PageId, PageKind, PersistenceMetrics, WalSyncStrategy};
use tempfile::TempDir;

use common::{test_config, test_config_builder, FaultyIoFactory};

// =============================================================================
// Helper Functions
// =============================================================================

fn setup(config: &Config) -> (PageMemory, WalManager) {
    let metrics = Arc::new(PersistenceMetrics::from_config(config).unwrap());
    let wal = WalManager::open(config, Arc::new(StdIoFactory), metrics).unwrap();
    (PageMemory::new(config.page_size), wal)
}

/// Log a begin marker the way the checkpoint coordinator does
fn log_begin(wal: &WalManager) -> impl FnOnce(usize) -> gridvault::Result<u64> + '_ {
    move |dirty| {
        wal.append(&WalRecord::CheckpointBegin {
            checkpoint_id: 1,
            dirty_pages: dirty as u64,
        })
    }
}

// =============================================================================
// Allocation / Write Tests
// =============================================================================

#[test]
fn test_allocate_assigns_indexes_per_partition() {
    let dir = TempDir::new().unwrap();
    let (memory, wal) = setup(&test_config(dir.path()));

    let a = memory.allocate(0, PageKind::Data, &wal).unwrap();
    let b = memory.allocate(0, PageKind::Index, &wal).unwrap();
    let c = memory.allocate(3, PageKind::Data, &wal).unwrap();

    assert_eq!(a, PageId::new(0, 1));
    assert_eq!(b, PageId::new(0, 2));
    assert_eq!(c, PageId::new(3, 1));
    assert_eq!(memory.page_kind(b).unwrap(), PageKind::Index);
    assert_eq!(memory.page_lsn(c).unwrap(), 3);
    assert_eq!(memory.page_count(), 3);
    assert_eq!(memory.dirty_page_count(), 3);
    assert_eq!(memory.page_ids(), vec![a, b, c]);
}

#[test]
fn test_write_then_read() {
    let dir = TempDir::new().unwrap();
    let (memory, wal) = setup(&test_config(dir.path()));
    let page = memory.allocate(0, PageKind::Data, &wal).unwrap();

    let lsn = memory.write(page, 100, b"hello", None, &wal).unwrap();
    assert_eq!(lsn, 2);
    assert_eq!(memory.page_lsn(page).unwrap(), lsn);

    let payload = memory.read(page).unwrap();
    assert_eq!(payload.len(), memory.payload_size());
    assert_eq!(&payload[100..105], b"hello");

    let first = memory.read_with(page, |p| p[100]).unwrap();
    assert_eq!(first, b'h');
}

#[test]
fn test_write_bounds_and_unknown_pages() {
    let dir = TempDir::new().unwrap();
    let (memory, wal) = setup(&test_config(dir.path()));
    let page = memory.allocate(0, PageKind::Data, &wal).unwrap();
    let payload = memory.payload_size();

    assert!(memory.write(page, payload - 4, &[1; 4], None, &wal).is_ok());
    assert!(matches!(
        memory.write(page, payload - 3, &[1; 4], None, &wal),
        Err(GridError::OutOfBounds { .. })
    ));
    assert!(matches!(
        memory.write(page, usize::MAX, &[1], None, &wal),
        Err(GridError::OutOfBounds { .. })
    ));
    assert!(matches!(
        memory.write(PageId::new(9, 9), 0, &[1], None, &wal),
        Err(GridError::PageNotFound(_))
    ));

    // Rejected writes never reach the log
    assert_eq!(wal.last_lsn(), 2);
}

#[test]
fn test_failed_log_append_leaves_page_untouched() {
    let dir = TempDir::new().unwrap();
    let config = test_config_builder(dir.path())
        .wal_sync_strategy(WalSyncStrategy::EveryWrite)
        .build()
        .unwrap();
    let (io, faults) = FaultyIoFactory::new();
    let metrics = Arc::new(PersistenceMetrics::from_config(&config).unwrap());
    let wal = WalManager::open(&config, io, metrics).unwrap();
    let memory = PageMemory::new(config.page_size);

    let page = memory.allocate(0, PageKind::Data, &wal).unwrap();
    memory.write(page, 0, &[7; 8], None, &wal).unwrap();
    let lsn_before = memory.page_lsn(page).unwrap();

    faults.fail_sync_on(".wal");
    assert!(memory.write(page, 0, &[9; 8], None, &wal).is_err());

    assert_eq!(&memory.read(page).unwrap()[..8], &[7; 8]);
    assert_eq!(memory.page_lsn(page).unwrap(), lsn_before);
}

#[test]
fn test_write_all_applies_then_logs_commit() {
    let dir = TempDir::new().unwrap();
    let (memory, wal) = setup(&test_config(dir.path()));
    let a = memory.allocate(0, PageKind::Data, &wal).unwrap();
    let b = memory.allocate(1, PageKind::Data, &wal).unwrap();

    let writes = vec![
        PendingWrite {
            page_id: a,
            offset: 0,
            data: b"left".to_vec(),
        },
        PendingWrite {
            page_id: b,
            offset: 4,
            data: b"right".to_vec(),
        },
    ];
    let commit = WalRecord::TxMarker {
        tx_id: 9,
        kind: TxMarkerKind::Commit,
    };
    let lsn = memory.write_all(&writes, 9, &commit, &wal).unwrap();

    // Two allocations, two deltas, then the commit
    assert_eq!(lsn, 5);
    assert_eq!(memory.page_lsn(a).unwrap(), 3);
    assert_eq!(memory.page_lsn(b).unwrap(), 4);
    assert_eq!(&memory.read(a).unwrap()[..4], b"left");
    assert_eq!(&memory.read(b).unwrap()[4..9], b"right");
}

#[test]
fn test_write_all_rejects_before_logging() {
    let dir = TempDir::new().unwrap();
    let (memory, wal) = setup(&test_config(dir.path()));
    let page = memory.allocate(0, PageKind::Data, &wal).unwrap();
    let next = wal.next_lsn();

    let writes = vec![
        PendingWrite {
            page_id: page,
            offset: 0,
            data: b"fine".to_vec(),
        },
        PendingWrite {
            page_id: PageId::new(0, 42),
            offset: 0,
            data: b"missing".to_vec(),
        },
    ];
    let commit = WalRecord::TxMarker {
        tx_id: 1,
        kind: TxMarkerKind::Commit,
    };
    assert!(matches!(
        memory.write_all(&writes, 1, &commit, &wal),
        Err(GridError::PageNotFound(_))
    ));

    assert_eq!(wal.next_lsn(), next);
    assert_eq!(&memory.read(page).unwrap()[..4], &[0; 4]);
}

// =============================================================================
// Dirty Set Tests
// =============================================================================

#[test]
fn test_collect_dirty_snapshots_in_page_order() {
    let dir = TempDir::new().unwrap();
    let (memory, wal) = setup(&test_config(dir.path()));

    let mut ids = Vec::new();
    for partition in [2, 0, 1] {
        ids.push(memory.allocate(partition, PageKind::Data, &wal).unwrap());
    }
    // Repeated writes keep a single dirty entry
    for _ in 0..5 {
        memory.write(ids[0], 0, &[1; 4], None, &wal).unwrap();
    }

    let snapshot = memory.collect_dirty(log_begin(&wal)).unwrap();
    assert_eq!(snapshot.generation, 1);
    assert_eq!(snapshot.start_lsn, wal.last_lsn());
    assert_eq!(
        snapshot.page_ids(),
        vec![PageId::new(0, 1), PageId::new(1, 1), PageId::new(2, 1)]
    );

    assert_eq!(memory.dirty_page_count(), 0);
    assert!(!memory.is_dirty(ids[0]).unwrap());
    assert_eq!(memory.generation(), 1);

    memory.write(ids[1], 0, &[2; 4], None, &wal).unwrap();
    assert_eq!(memory.dirty_page_count(), 1);
    assert!(memory.is_dirty(ids[1]).unwrap());
}

#[test]
fn test_failed_collection_keeps_dirty_set() {
    let dir = TempDir::new().unwrap();
    let (memory, wal) = setup(&test_config(dir.path()));
    memory.allocate(0, PageKind::Data, &wal).unwrap();
    memory.allocate(0, PageKind::Data, &wal).unwrap();

    let result = memory.collect_dirty(|_| Err(GridError::IoFailure("injected".to_string())));
    assert!(result.is_err());
    assert_eq!(memory.dirty_page_count(), 2);
    assert_eq!(memory.generation(), 0);
}

#[test]
fn test_restore_dirty_after_abort() {
    let dir = TempDir::new().unwrap();
    let (memory, wal) = setup(&test_config(dir.path()));
    for _ in 0..4 {
        memory.allocate(1, PageKind::Data, &wal).unwrap();
    }

    let snapshot = memory.collect_dirty(log_begin(&wal)).unwrap();
    let ids = snapshot.page_ids();
    drop(snapshot);

    // One page is re-dirtied before the abort is handled
    memory.write(ids[0], 0, &[1], None, &wal).unwrap();
    memory.restore_dirty(&ids);

    assert_eq!(memory.dirty_page_count(), 4);
    assert!(ids.iter().all(|id| memory.is_dirty(*id).unwrap()));
}

// =============================================================================
// Copy-on-Write Tests
// =============================================================================

#[test]
fn test_write_during_checkpoint_copies_page() {
    let dir = TempDir::new().unwrap();
    let (memory, wal) = setup(&test_config(dir.path()));
    let page = memory.allocate(0, PageKind::Data, &wal).unwrap();
    let other = memory.allocate(0, PageKind::Data, &wal).unwrap();
    memory.write(page, 0, b"before", None, &wal).unwrap();

    let snapshot = memory.collect_dirty(log_begin(&wal)).unwrap();
    assert_eq!(memory.cow_pages(), 0);

    memory.write(page, 0, b"after!", None, &wal).unwrap();
    memory.write(page, 8, b"again", None, &wal).unwrap();
    assert_eq!(memory.cow_pages(), 1);

    // The checkpoint still sees the pre-mutation image
    let image = &snapshot.pages[0].image;
    assert_eq!(&image[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + 6], b"before");
    assert!(page_lsn(image) < snapshot.start_lsn);

    assert_eq!(&memory.read(page).unwrap()[..6], b"after!");
    assert!(memory.is_dirty(page).unwrap());

    // Once the checkpoint releases its images, writes go in place
    drop(snapshot);
    memory.write(other, 0, b"x", None, &wal).unwrap();
    assert_eq!(memory.cow_pages(), 1);
}

#[test]
fn test_snapshot_images_never_include_later_records() {
    let dir = TempDir::new().unwrap();
    let (memory, wal) = setup(&test_config(dir.path()));
    let memory = Arc::new(memory);
    let wal = Arc::new(wal);

    let pages: Vec<PageId> = (0..8)
        .map(|p| memory.allocate(p, PageKind::Data, &wal).unwrap())
        .collect();
    let stop = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = pages
        .iter()
        .map(|&page| {
            let memory = Arc::clone(&memory);
            let wal = Arc::clone(&wal);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut n = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    memory
                        .write(page, 0, &n.to_le_bytes(), None, &wal)
                        .unwrap();
                    n += 1;
                }
            })
        })
        .collect();

    for _ in 0..20 {
        let snapshot = memory.collect_dirty(log_begin(&wal)).unwrap();
        for page in &snapshot.pages {
            assert!(page_lsn(&page.image) < snapshot.start_lsn);
        }
    }

    stop.store(true, Ordering::Relaxed);
    for writer in writers {
        writer.join().unwrap();
    }
}

// =============================================================================
// Recovery Support Tests
// =============================================================================

#[test]
fn test_load_page_and_replay_is_idempotent() {
    let memory = PageMemory::new(1024);
    let id = PageId::new(2, 4);

    let mut image = vec![0u8; 1024];
    init_page(&mut image, PageKind::Index, 50);
    memory.load_page(id, image).unwrap();
    assert!(!memory.is_dirty(id).unwrap());
    assert_eq!(memory.page_kind(id).unwrap(), PageKind::Index);

    // Already reflected
    assert!(!memory.replay_delta(id, 0, &[1, 2, 3], 50).unwrap());
    assert!(!memory.replay_delta(id, 0, &[1, 2, 3], 10).unwrap());
    assert_eq!(&memory.read(id).unwrap()[..3], &[0, 0, 0]);

    assert!(memory.replay_delta(id, 0, &[1, 2, 3], 51).unwrap());
    assert_eq!(&memory.read(id).unwrap()[..3], &[1, 2, 3]);
    assert_eq!(memory.page_lsn(id).unwrap(), 51);
    assert!(memory.is_dirty(id).unwrap());

    // Allocation after load continues past the loaded index
    assert!(!memory.replay_alloc(id, PageKind::Index, 60));
    assert!(memory.replay_alloc(PageId::new(2, 5), PageKind::Data, 61));
    assert_eq!(memory.page_count(), 2);
}

#[test]
fn test_load_page_rejects_bad_images() {
    let memory = PageMemory::new(1024);

    assert!(matches!(
        memory.load_page(PageId::new(0, 1), vec![0u8; 512]),
        Err(GridError::OutOfBounds { .. })
    ));
    assert!(matches!(
        memory.load_page(PageId::new(0, 1), vec![0u8; 1024]),
        Err(GridError::CorruptStore { partition: 0, .. })
    ));
}
