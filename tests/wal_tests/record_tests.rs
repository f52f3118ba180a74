//! Tests for WAL records and segment framing
//!
//! These tests verify:
//! - Frame encoding and decoding
//! - Checksum and truncation detection
//! - Segment header and trailer codecs
//! - Segment file naming

use std::path::Path;

use gridvault::wal::{
    decode_frame, decode_trailer, encode_frame, encode_trailer, parse_segment_ordinal,
    segment_file_name, FrameDecode, SegmentHeader, TxMarkerKind, WalRecord, FRAME_HEADER_SIZE,
    SEGMENT_HEADER_SIZE, SEGMENT_TRAILER_SIZE,
};
use gridvault::{PageId, PageKind};

// =============================================================================
// Helper Functions
// =============================================================================

fn delta(index: u32, byte: u8) -> WalRecord {
    WalRecord::PageDelta {
        page_id: PageId::new(0, index),
        offset: 16,
        data: vec![byte; 32],
        tx: None,
    }
}

fn expect_record(decoded: FrameDecode) -> (u64, WalRecord, usize) {
    match decoded {
        FrameDecode::Record { record, len } => (record.lsn, record.record, len),
        other => panic!("expected a record, got {:?}", other),
    }
}

// =============================================================================
// Frame Tests
// =============================================================================

#[test]
fn test_frame_decodes_to_same_record() {
    let record = delta(3, 0xAA);
    let frame = encode_frame(42, &record).unwrap();

    let (lsn, decoded, len) = expect_record(decode_frame(&frame));
    assert_eq!(lsn, 42);
    assert_eq!(decoded, record);
    assert_eq!(len, frame.len());
}

#[test]
fn test_frame_header_size() {
    let frame = encode_frame(1, &delta(1, 1)).unwrap();
    let body_len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    assert_eq!(frame.len(), FRAME_HEADER_SIZE + body_len);
}

#[test]
fn test_consecutive_frames_decode_in_order() {
    let mut buf = Vec::new();
    buf.extend_from_slice(&encode_frame(1, &delta(1, 1)).unwrap());
    buf.extend_from_slice(
        &encode_frame(
            2,
            &WalRecord::PageAlloc {
                page_id: PageId::new(2, 7),
                kind: PageKind::Index,
            },
        )
        .unwrap(),
    );

    let (lsn1, _, len1) = expect_record(decode_frame(&buf));
    let (lsn2, record2, _) = expect_record(decode_frame(&buf[len1..]));
    assert_eq!(lsn1, 1);
    assert_eq!(lsn2, 2);
    assert_eq!(record2.kind_name(), "page_alloc");
}

#[test]
fn test_empty_buffer_is_end() {
    assert!(matches!(decode_frame(&[]), FrameDecode::End));
}

#[test]
fn test_checksum_mismatch_is_corrupt() {
    let mut frame = encode_frame(5, &delta(1, 0x11)).unwrap().to_vec();
    let last = frame.len() - 1;
    frame[last] ^= 0xFF;

    assert!(matches!(decode_frame(&frame), FrameDecode::Corrupt(_)));
}

#[test]
fn test_lsn_is_covered_by_checksum() {
    let mut frame = encode_frame(5, &delta(1, 0x11)).unwrap().to_vec();
    frame[8] ^= 0x01;

    assert!(matches!(decode_frame(&frame), FrameDecode::Corrupt(_)));
}

#[test]
fn test_truncated_frame_is_corrupt() {
    let frame = encode_frame(5, &delta(1, 0x11)).unwrap();

    for cut in [1, 3, FRAME_HEADER_SIZE - 1, FRAME_HEADER_SIZE + 1, frame.len() - 1] {
        match decode_frame(&frame[..cut]) {
            FrameDecode::Corrupt(_) => {}
            other => panic!("cut at {} decoded as {:?}", cut, other),
        }
    }
}

#[test]
fn test_zeroed_space_is_corrupt() {
    let zeros = [0u8; 64];
    assert!(matches!(decode_frame(&zeros), FrameDecode::Corrupt(_)));
}

#[test]
fn test_oversized_length_is_corrupt() {
    let mut frame = encode_frame(1, &delta(1, 1)).unwrap().to_vec();
    frame[0..4].copy_from_slice(&(u32::MAX - 1).to_le_bytes());
    assert!(matches!(decode_frame(&frame), FrameDecode::Corrupt(_)));
}

#[test]
fn test_all_record_kinds_encode() {
    let records = vec![
        WalRecord::PageAlloc {
            page_id: PageId::new(1, 1),
            kind: PageKind::Data,
        },
        delta(1, 9),
        WalRecord::CheckpointBegin {
            checkpoint_id: 3,
            dirty_pages: 10,
        },
        WalRecord::CheckpointEnd {
            checkpoint_id: 3,
            start_lsn: 100,
            topology_version: 7,
            total_pages: 10,
            data_pages: 8,
            index_pages: 2,
            cow_pages: 1,
        },
        WalRecord::TxMarker {
            tx_id: 77,
            kind: TxMarkerKind::Commit,
        },
    ];

    let names: Vec<&str> = records.iter().map(|r| r.kind_name()).collect();
    assert_eq!(
        names,
        vec!["page_alloc", "page_delta", "checkpoint_begin", "checkpoint_end", "tx_marker"]
    );

    for (i, record) in records.iter().enumerate() {
        let frame = encode_frame(i as u64 + 1, record).unwrap();
        let (_, decoded, _) = expect_record(decode_frame(&frame));
        assert_eq!(&decoded, record);
    }
}

// =============================================================================
// Segment Header / Trailer Tests
// =============================================================================

#[test]
fn test_trailer_is_recognized_at_frame_position() {
    let trailer = encode_trailer(99);
    assert_eq!(trailer.len(), SEGMENT_TRAILER_SIZE);
    assert!(matches!(decode_frame(&trailer), FrameDecode::Trailer));
    assert_eq!(decode_trailer(&trailer), Some(99));
}

#[test]
fn test_corrupt_trailer_rejected() {
    let mut trailer = encode_trailer(99);
    trailer[6] ^= 0xFF;
    assert_eq!(decode_trailer(&trailer), None);
    assert_eq!(decode_trailer(&trailer[..10]), None);
}

#[test]
fn test_segment_header_codec() {
    let header = SegmentHeader {
        ordinal: 12,
        first_lsn: 3456,
    };
    let raw = header.encode();
    assert_eq!(raw.len(), SEGMENT_HEADER_SIZE);
    assert_eq!(SegmentHeader::decode(&raw).unwrap(), header);
}

#[test]
fn test_segment_header_rejects_damage() {
    let raw = SegmentHeader {
        ordinal: 1,
        first_lsn: 1,
    }
    .encode();

    let mut bad_magic = raw;
    bad_magic[0] = b'X';
    assert!(SegmentHeader::decode(&bad_magic).is_err());

    let mut bad_crc = raw;
    bad_crc[10] ^= 0x01;
    assert!(SegmentHeader::decode(&bad_crc).is_err());

    assert!(SegmentHeader::decode(&raw[..20]).is_err());
}

#[test]
fn test_segment_file_names() {
    assert_eq!(segment_file_name(42), "0000000000000042.wal");
    assert_eq!(
        parse_segment_ordinal(Path::new("/tmp/wal/0000000000000042.wal")),
        Some(42)
    );
    assert_eq!(parse_segment_ordinal(Path::new("0000000000000042.wal.discarded")), None);
    assert_eq!(parse_segment_ordinal(Path::new("notes.txt")), None);
}
