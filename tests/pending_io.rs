//! Reads that fault below the head address and complete asynchronously.

use std::sync::Arc;

use tidekv::device::SegmentedFileDisk;
use tidekv::store::U64AddFunctions;
use tidekv::{Status, StoreConfig, TideKv};

/// A log small enough that filling it evicts the oldest pages to disk.
fn create_small_store(
    dir: &std::path::Path,
) -> Arc<TideKv<SegmentedFileDisk, U64AddFunctions>> {
    let config = StoreConfig {
        table_size: 2048,
        log_memory_size: 4 << 12, // four 4 KiB pages
        page_size_bits: 12,
        mutable_fraction: 0.5,
        checkpoint_dir: dir.join("checkpoints"),
        ..Default::default()
    };
    let device = SegmentedFileDisk::with_segment_bits(dir.join("log"), 16).unwrap();
    Arc::new(TideKv::new(config, device, U64AddFunctions).unwrap())
}

#[test]
fn test_read_demoted_record_goes_pending() {
    let dir = tempfile::tempdir().unwrap();
    let store = create_small_store(dir.path());
    let mut session = store.start_session().unwrap();

    assert_eq!(session.upsert(&1, &1), Status::Ok);
    let target_serial = session.serial_num();

    // Push the log far past the in-memory budget so key 1's page evicts.
    for i in 0..2_000u64 {
        assert_eq!(session.upsert(&(1_000 + i), &i), Status::Ok);
        if i % 64 == 0 {
            session.refresh();
        }
    }
    assert!(
        store.log_stats().head_address.control() > 64,
        "log never evicted: {:?}",
        store.log_stats()
    );

    let (status, out) = session.read(&1, &0);
    assert_eq!(status, Status::Pending);
    assert!(out.is_none());

    assert!(session.complete_pending(true));
    let completed = session.drain_completed();
    let done = completed
        .iter()
        .find(|op| op.serial == target_serial + 2_001)
        .expect("pending read completed");
    assert_eq!(done.status, Status::Ok);
    assert_eq!(done.output, Some(1));
}

#[test]
fn test_pending_reads_for_many_evicted_keys() {
    let dir = tempfile::tempdir().unwrap();
    let store = create_small_store(dir.path());
    let mut session = store.start_session().unwrap();

    for key in 0..64u64 {
        session.upsert(&key, &(key + 1));
    }
    for i in 0..2_000u64 {
        session.upsert(&(10_000 + i), &i);
        if i % 64 == 0 {
            session.refresh();
        }
    }

    let mut pending = 0u32;
    for key in 0..64u64 {
        match session.read(&key, &0) {
            (Status::Ok, Some(value)) => assert_eq!(value, key + 1),
            (Status::Pending, None) => pending += 1,
            other => panic!("unexpected read result {other:?}"),
        }
    }
    assert!(pending > 0, "expected at least one read to fault to disk");

    assert!(session.complete_pending(true));
    let completed = session.drain_completed();
    assert_eq!(completed.len() as u32, pending);
    for done in completed {
        assert_eq!(done.status, Status::Ok);
        assert!(done.output.is_some());
    }
}

#[test]
fn test_rmw_on_evicted_record_applies_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = create_small_store(dir.path());
    let mut session = store.start_session().unwrap();

    session.upsert(&5, &100);
    for i in 0..2_000u64 {
        session.upsert(&(20_000 + i), &i);
        if i % 64 == 0 {
            session.refresh();
        }
    }

    let status = session.rmw(&5, &1);
    assert!(status == Status::Pending || status == Status::Ok);
    assert!(session.complete_pending(true));

    let (status, out) = match session.read(&5, &0) {
        (Status::Pending, _) => {
            let read_serial = session.serial_num();
            assert!(session.complete_pending(true));
            let completed = session.drain_completed();
            let done = completed
                .iter()
                .find(|op| op.serial == read_serial)
                .expect("read completed");
            (done.status, done.output)
        }
        direct => direct,
    };
    assert_eq!(status, Status::Ok);
    assert_eq!(out, Some(101));
}
