//! Tests for crash recovery
//!
//! These tests verify:
//! - Clean shutdown and crash restarts rebuild the same pages
//! - Replay starts after the last complete checkpoint
//! - Torn tails are truncated; corruption the checkpoint needs is fatal
//! - Damage before the end of the log is fatal, never truncated
//! - Transactions without a commit marker are discarded
//! - The checkpoint marker is a hint, never a requirement

#[path = "../common/mod.rs"]
mod common;

use std::fs;
use std::sync::Arc;

use gridvault::io::StdIoFactory;
use gridvault::page::{PageMemory, PageStoreSet};
use gridvault::recovery::RecoveryManager;
use gridvault::wal::{
    list_segments, segment_file_name, TxMarkerKind, WalRecord, SEGMENT_HEADER_SIZE,
};
use gridvault::{Config, Engine, GridError, NoopTopology, PageId, PageKind, WalSyncStrategy};
use tempfile::TempDir;

use common::{
    append_bytes, chop_bytes, file_len, flip_byte, last_live_segment, small_segment_config,
    test_config, test_config_builder, FaultyIoFactory,
};

// =============================================================================
// Helper Functions
// =============================================================================

fn open(config: &Config) -> Engine {
    Engine::open(config.clone()).unwrap()
}

/// Allocate `count` pages over `partitions` and stamp each with its number
fn stamp_pages(engine: &Engine, count: u32, partitions: u32) -> Vec<PageId> {
    (0..count)
        .map(|i| {
            let page = engine.allocate_page(i % partitions, PageKind::Data).unwrap();
            engine.write(page, 0, &u64::from(i).to_le_bytes()).unwrap();
            page
        })
        .collect()
}

fn read_u64(engine: &Engine, page: PageId, offset: usize) -> u64 {
    let payload = engine.read(page).unwrap();
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&payload[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

fn assert_stamped(engine: &Engine, pages: &[PageId]) {
    for (i, page) in pages.iter().enumerate() {
        assert_eq!(read_u64(engine, *page, 0), i as u64, "page {}", page);
    }
}

// =============================================================================
// Restart Tests
// =============================================================================

#[test]
fn test_clean_close_needs_no_replay() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    let pages = {
        let engine = open(&config);
        let pages = stamp_pages(&engine, 20, 3);
        engine.close().unwrap();
        pages
    };

    let engine = open(&config);
    let state = engine.recovered_state();
    assert_eq!(state.records_replayed, 0);
    assert_eq!(state.pages_loaded, 20);
    assert!(state.checkpoint.is_some());
    assert!(state.torn_tail.is_none());
    let mut sorted = pages.clone();
    sorted.sort();
    assert_eq!(engine.page_ids(), sorted);
    assert_eq!(engine.dirty_page_count(), 0);
    assert_stamped(&engine, &pages);
}

#[test]
fn test_crash_without_checkpoint_replays_everything() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    let (pages, last_lsn) = {
        let engine = open(&config);
        let pages = stamp_pages(&engine, 10, 2);
        engine.sync().unwrap();
        let last_lsn = engine.wal().last_lsn();
        (pages, last_lsn)
        // Dropped without close: no shutdown checkpoint
    };

    let engine = open(&config);
    let state = engine.recovered_state();
    assert!(state.checkpoint.is_none());
    assert_eq!(state.pages_loaded, 0);
    assert_eq!(state.records_replayed, 20);
    assert_eq!(state.next_lsn, last_lsn + 1);
    assert_eq!(engine.wal().next_lsn(), last_lsn + 1);
    assert_stamped(&engine, &pages);

    // Replayed pages are dirty until the next checkpoint
    assert_eq!(engine.dirty_page_count(), 10);
}

#[test]
fn test_crash_right_after_checkpoint_replays_nothing() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    let (pages, cp) = {
        let engine = open(&config);
        let pages = stamp_pages(&engine, 10, 2);
        let cp = engine.checkpoint().unwrap();
        (pages, cp)
    };

    let engine = open(&config);
    let state = engine.recovered_state();
    assert_eq!(state.records_replayed, 0);
    assert_eq!(state.pages_loaded, 10);
    let recovered = state.checkpoint.as_ref().unwrap();
    assert_eq!(recovered.id, cp.id);
    assert_eq!(recovered.start_lsn, cp.start_lsn);
    assert_eq!(recovered.end_lsn, cp.end_lsn);
    assert_eq!(recovered.total_pages, 10);
    assert_stamped(&engine, &pages);

    // Checkpoint ids continue across restarts
    assert_eq!(engine.checkpoint().unwrap().id, cp.id + 1);
}

#[test]
fn test_only_records_after_checkpoint_are_replayed() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    let pages = {
        let engine = open(&config);
        let pages = stamp_pages(&engine, 10, 2);
        engine.checkpoint().unwrap();
        for page in &pages[..4] {
            engine.write(*page, 8, &99u64.to_le_bytes()).unwrap();
        }
        engine.sync().unwrap();
        pages
    };

    let engine = open(&config);
    assert_eq!(engine.recovered_state().records_replayed, 4);
    assert_stamped(&engine, &pages);
    for (i, page) in pages.iter().enumerate() {
        let expected = if i < 4 { 99 } else { 0 };
        assert_eq!(read_u64(&engine, *page, 8), expected);
    }
}

#[test]
fn test_repeated_crashes_converge() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    let page = {
        let engine = open(&config);
        let page = engine.allocate_page(0, PageKind::Data).unwrap();
        engine.write(page, 0, &1u64.to_le_bytes()).unwrap();
        engine.sync().unwrap();
        page
    };
    for round in 2..5u64 {
        let engine = open(&config);
        assert_eq!(read_u64(&engine, page, 0), round - 1);
        engine.write(page, 0, &round.to_le_bytes()).unwrap();
        if round == 3 {
            engine.checkpoint().unwrap();
        }
        engine.sync().unwrap();
    }

    let engine = open(&config);
    assert_eq!(read_u64(&engine, page, 0), 4);
}

// =============================================================================
// Torn Tail / Corruption Tests
// =============================================================================

#[test]
fn test_garbage_tail_is_truncated() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    let pages = {
        let engine = open(&config);
        let pages = stamp_pages(&engine, 5, 1);
        engine.sync().unwrap();
        pages
    };
    let segment = last_live_segment(&config);
    let clean_len = file_len(&segment);
    append_bytes(&segment, &[0xC3; 37]);

    {
        let engine = open(&config);
        let state = engine.recovered_state();
        let torn = state.torn_tail.as_ref().unwrap();
        assert_eq!(torn.offset, clean_len);
        assert_eq!(file_len(&segment), clean_len);
        assert_stamped(&engine, &pages);

        // The engine keeps going after the repair
        engine.write(pages[0], 16, b"after").unwrap();
        engine.sync().unwrap();
    }

    let engine = open(&config);
    assert!(engine.recovered_state().torn_tail.is_none());
    assert_eq!(&engine.read(pages[0]).unwrap()[16..21], b"after");
}

#[test]
fn test_truncated_last_record_is_dropped() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    let page = {
        let engine = open(&config);
        let page = engine.allocate_page(0, PageKind::Data).unwrap();
        for value in 1..=10u64 {
            engine.write(page, 0, &value.to_le_bytes()).unwrap();
        }
        engine.sync().unwrap();
        page
    };
    chop_bytes(&last_live_segment(&config), 5);

    let engine = open(&config);
    assert!(engine.recovered_state().torn_tail.is_some());
    assert_eq!(read_u64(&engine, page, 0), 9);
    assert_eq!(engine.wal().next_lsn(), 11);
}

#[test]
fn test_corruption_before_checkpoint_end_is_fatal() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    {
        let engine = open(&config);
        stamp_pages(&engine, 5, 1);
        engine.checkpoint().unwrap();
        stamp_pages(&engine, 5, 1);
        engine.sync().unwrap();
    }
    // Damage the body of the very first record
    flip_byte(&last_live_segment(&config), SEGMENT_HEADER_SIZE + 20);

    let result = Engine::open(config.clone());
    assert!(matches!(result, Err(GridError::CorruptRecord { segment: 0, .. })));
}

#[test]
fn test_corruption_without_checkpoint_truncates() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    {
        let engine = open(&config);
        stamp_pages(&engine, 5, 1);
        engine.sync().unwrap();
    }
    // Third record onwards becomes unreadable
    let segment = last_live_segment(&config);
    let data = fs::read(&segment).unwrap();
    let first_len = u32::from_le_bytes([data[32], data[33], data[34], data[35]]) as usize + 16;
    let second_len = u32::from_le_bytes([
        data[32 + first_len],
        data[33 + first_len],
        data[34 + first_len],
        data[35 + first_len],
    ]) as usize
        + 16;
    flip_byte(&segment, SEGMENT_HEADER_SIZE + first_len + second_len + 20);

    let engine = open(&config);
    let state = engine.recovered_state();
    assert!(state.torn_tail.is_some());
    assert_eq!(state.records_replayed, 2);
    assert_eq!(engine.page_ids(), vec![PageId::new(0, 1)]);
    assert_eq!(read_u64(&engine, PageId::new(0, 1), 0), 0);
}

#[test]
fn test_headerless_trailing_segment_is_discarded() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    let pages = {
        let engine = open(&config);
        let pages = stamp_pages(&engine, 4, 2);
        engine.sync().unwrap();
        pages
    };
    let stray = config.wal_dir().join(segment_file_name(7));
    fs::write(&stray, b"GVW").unwrap();

    let engine = open(&config);
    let state = engine.recovered_state();
    assert_eq!(state.discarded_segments, vec![7]);
    assert!(!stray.exists());
    assert!(config
        .wal_dir()
        .join(format!("{}.discarded", segment_file_name(7)))
        .exists());
    assert_stamped(&engine, &pages);
}

/// 1,200 durable writes over roughly eight 16 KiB segments
fn write_many_segments(config: &Config) -> Vec<(u64, std::path::PathBuf)> {
    let engine = open(config);
    let page = engine.allocate_page(0, PageKind::Data).unwrap();
    for i in 0..1200u32 {
        engine.write(page, 0, &[i as u8; 64]).unwrap();
    }
    drop(engine);

    let segments = list_segments(&config.wal_dir()).unwrap();
    assert!(segments.len() >= 4, "only {} segments", segments.len());
    segments
}

fn assert_log_untouched(config: &Config, segments: &[(u64, std::path::PathBuf)]) {
    assert_eq!(list_segments(&config.wal_dir()).unwrap(), segments.to_vec());
    let discarded = fs::read_dir(config.wal_dir())
        .unwrap()
        .filter(|entry| {
            entry
                .as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .ends_with(".discarded")
        })
        .count();
    assert_eq!(discarded, 0);
}

fn every_write_config(dir: &std::path::Path) -> Config {
    test_config_builder(dir)
        .page_size(512)
        .wal_segment_size(16 * 1024)
        .wal_sync_strategy(WalSyncStrategy::EveryWrite)
        .build()
        .unwrap()
}

#[test]
fn test_corrupt_sealed_segment_is_fatal() {
    let dir = TempDir::new().unwrap();
    let config = every_write_config(dir.path());
    let segments = write_many_segments(&config);

    let (ordinal, path) = &segments[1];
    let len = file_len(path);
    flip_byte(path, SEGMENT_HEADER_SIZE + 20);

    let result = Engine::open(config.clone());
    match result {
        Err(GridError::CorruptRecord { segment, .. }) => assert_eq!(segment, *ordinal),
        other => panic!("expected corrupt record, got {:?}", other.map(|_| ())),
    }
    // Nothing was truncated or set aside
    assert_eq!(file_len(path), len);
    assert_log_untouched(&config, &segments);
}

#[test]
fn test_tear_followed_by_segment_is_fatal() {
    let dir = TempDir::new().unwrap();
    let config = every_write_config(dir.path());
    let segments = write_many_segments(&config);

    // Lose the trailer and part of the last frame of a middle segment
    let (ordinal, path) = &segments[2];
    chop_bytes(path, 20);

    let result = Engine::open(config.clone());
    match result {
        Err(GridError::CorruptRecord { segment, reason, .. }) => {
            assert_eq!(segment, *ordinal);
            assert!(reason.contains("follows it"), "{}", reason);
        }
        other => panic!("expected corrupt record, got {:?}", other.map(|_| ())),
    }
    assert_log_untouched(&config, &segments);
}

#[test]
fn test_tear_in_last_segment_still_truncates() {
    let dir = TempDir::new().unwrap();
    let config = every_write_config(dir.path());
    let segments = write_many_segments(&config);

    let (_, last) = segments.last().unwrap();
    append_bytes(last, &[0xAB; 7]);

    let engine = open(&config);
    let state = engine.recovered_state();
    assert!(state.torn_tail.is_some());
    assert!(state.discarded_segments.is_empty());
    assert_eq!(engine.read(engine.page_ids()[0]).unwrap()[0], 1199u32 as u8);
}

#[test]
fn test_missing_partition_store_is_fatal() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    {
        let engine = open(&config);
        stamp_pages(&engine, 8, 4);
        engine.sync().unwrap();
    }
    fs::remove_file(config.store_dir().join("part-00003.bin")).unwrap();

    let result = Engine::open(config.clone());
    assert!(matches!(result, Err(GridError::MissingPartitionStore(3))));
}

// =============================================================================
// Transaction Tests
// =============================================================================

#[test]
fn test_uncommitted_transactions_are_discarded() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    let (page, committed) = {
        let engine = open(&config);
        let page = engine.allocate_page(0, PageKind::Data).unwrap();

        let committed = engine.begin_tx().unwrap();
        engine.write_in_tx(committed, page, 0, b"committed").unwrap();
        engine.commit_tx(committed).unwrap();

        // A transaction whose commit never reached the log
        let pending = engine.begin_tx().unwrap();
        assert_ne!(pending, committed);
        engine.write_in_tx(pending, page, 32, b"pending").unwrap();
        engine
            .wal()
            .append(&WalRecord::PageDelta {
                page_id: page,
                offset: 32,
                data: b"pending".to_vec(),
                tx: Some(pending),
            })
            .unwrap();

        // Logged deltas followed by a rollback marker
        let rolled_back = engine.begin_tx().unwrap();
        engine
            .wal()
            .append(&WalRecord::PageDelta {
                page_id: page,
                offset: 64,
                data: b"rolled back".to_vec(),
                tx: Some(rolled_back),
            })
            .unwrap();
        engine.rollback_tx(rolled_back).unwrap();

        engine.sync().unwrap();
        (page, committed)
    };

    let engine = open(&config);
    let state = engine.recovered_state();
    assert_eq!(state.records_discarded, 2);

    let payload = engine.read(page).unwrap();
    assert_eq!(&payload[..9], b"committed");
    assert!(payload[32..39].iter().all(|&b| b == 0));
    assert!(payload[64..75].iter().all(|&b| b == 0));

    // Ids handed out after restart never collide with ones in the WAL
    assert!(engine.begin_tx().unwrap() > committed);
}

#[test]
fn test_commit_marker_of_other_transaction_does_not_apply() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    let page = {
        let engine = open(&config);
        let page = engine.allocate_page(0, PageKind::Data).unwrap();
        engine
            .wal()
            .append(&WalRecord::PageDelta {
                page_id: page,
                offset: 0,
                data: b"orphan".to_vec(),
                tx: Some(1_000),
            })
            .unwrap();
        engine
            .wal()
            .append(&WalRecord::TxMarker {
                tx_id: 1_001,
                kind: TxMarkerKind::Commit,
            })
            .unwrap();
        engine.sync().unwrap();
        page
    };

    let engine = open(&config);
    assert_eq!(engine.recovered_state().records_discarded, 1);
    assert_eq!(&engine.read(page).unwrap()[..6], &[0; 6]);
}

// =============================================================================
// Checkpoint Marker Tests
// =============================================================================

#[test]
fn test_aborted_checkpoint_then_crash() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    let pages = {
        let (io, faults) = FaultyIoFactory::new();
        let engine = Engine::open_with(config.clone(), io, Arc::new(NoopTopology)).unwrap();
        let pages = stamp_pages(&engine, 10, 2);

        faults.fail_sync_on("part-");
        let err = engine.checkpoint().unwrap_err();
        assert!(matches!(err, GridError::CheckpointAborted { .. }));
        assert_eq!(engine.dirty_page_count(), 10);
        engine.sync().unwrap();
        pages
    };

    let engine = open(&config);
    assert!(engine.recovered_state().checkpoint.is_none());
    assert_stamped(&engine, &pages);
}

#[test]
fn test_missing_marker_falls_back_to_scan() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    let pages = {
        let engine = open(&config);
        let pages = stamp_pages(&engine, 6, 2);
        engine.checkpoint().unwrap();
        engine.write(pages[0], 8, &7u64.to_le_bytes()).unwrap();
        engine.sync().unwrap();
        pages
    };
    fs::remove_file(config.marker_path()).unwrap();

    let engine = open(&config);
    let state = engine.recovered_state();
    assert!(!state.used_marker);
    assert_eq!(state.checkpoint.as_ref().unwrap().id, 1);
    assert_eq!(state.records_replayed, 1);
    assert_stamped(&engine, &pages);
    assert_eq!(read_u64(&engine, pages[0], 8), 7);
}

#[test]
fn test_corrupt_marker_falls_back_to_scan() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    let pages = {
        let engine = open(&config);
        let pages = stamp_pages(&engine, 6, 2);
        engine.checkpoint().unwrap();
        pages
    };
    fs::write(config.marker_path(), b"not a marker").unwrap();

    let engine = open(&config);
    assert_eq!(engine.recovered_state().checkpoint.as_ref().unwrap().id, 1);
    assert_stamped(&engine, &pages);
}

#[test]
fn test_marker_skips_retained_segments() {
    let dir = TempDir::new().unwrap();
    let config = test_config_builder(dir.path())
        .page_size(512)
        .wal_segment_size(4096)
        .wal_history_size(3)
        .build()
        .unwrap();

    let page = {
        let engine = open(&config);
        let page = engine.allocate_page(0, PageKind::Data).unwrap();
        engine.checkpoint().unwrap();
        for i in 0..100u64 {
            engine.write(page, 0, &[i as u8; 100]).unwrap();
        }
        engine.checkpoint().unwrap();
        for i in 0..3u64 {
            engine.write(page, 200, &i.to_le_bytes()).unwrap();
        }
        engine.sync().unwrap();
        page
    };

    let engine = open(&config);
    let state = engine.recovered_state();
    assert!(state.used_marker);
    assert_eq!(state.checkpoint.as_ref().unwrap().id, 2);
    assert_eq!(state.records_replayed, 3);
    assert_eq!(engine.read(page).unwrap()[0], 99);
    assert_eq!(read_u64(&engine, page, 200), 2);
}

// =============================================================================
// Direct Recovery Tests
// =============================================================================

#[test]
fn test_recovery_on_empty_directory() {
    let dir = TempDir::new().unwrap();
    let config = small_segment_config(dir.path());
    let stores = PageStoreSet::open(&config.store_dir(), config.page_size, Arc::new(StdIoFactory))
        .unwrap();
    let memory = PageMemory::new(config.page_size);

    let state = RecoveryManager::new(&config, Arc::new(StdIoFactory))
        .recover(&stores, &memory)
        .unwrap();

    assert_eq!(state.next_lsn, 1);
    assert!(state.segments.is_empty());
    assert!(state.checkpoint.is_none());
    assert_eq!(memory.page_count(), 0);
}
