//! Begin-address shifting and the stale-entry GC sweep.

use std::sync::Arc;

use tidekv::device::SegmentedFileDisk;
use tidekv::store::U64AddFunctions;
use tidekv::{Status, StoreConfig, TideKv};

fn create_store(dir: &std::path::Path) -> Arc<TideKv<SegmentedFileDisk, U64AddFunctions>> {
    let config = StoreConfig {
        table_size: 2048,
        log_memory_size: 4 << 12,
        page_size_bits: 12,
        mutable_fraction: 0.5,
        checkpoint_dir: dir.join("checkpoints"),
        ..Default::default()
    };
    let device = SegmentedFileDisk::with_segment_bits(dir.join("log"), 12).unwrap();
    Arc::new(TideKv::new(config, device, U64AddFunctions).unwrap())
}

#[test]
fn test_shift_begin_truncates_old_keys() {
    let dir = tempfile::tempdir().unwrap();
    let store = create_store(dir.path());
    let mut session = store.start_session().unwrap();

    // Old generation of keys, then enough churn to evict them to disk.
    for key in 0u64..32 {
        session.upsert(&key, &key);
    }
    for i in 0..2_000u64 {
        session.upsert(&(100_000 + i), &i);
        if i % 64 == 0 {
            session.refresh();
        }
    }
    let head = store.log_stats().head_address;
    assert!(head.control() > 64, "nothing was evicted");

    let entries_before = store.entry_count();
    assert_eq!(session.shift_begin_address(head), Status::Ok);
    assert_eq!(store.log_begin_address(), head);

    // The sweep cleared entries whose chains fell below the new begin.
    let entries_after = store.entry_count();
    assert!(
        entries_after < entries_before,
        "sweep cleared nothing ({entries_before} -> {entries_after})"
    );

    // Truncated keys are gone without faulting to disk.
    let mut gone = 0;
    for key in 0u64..32 {
        match session.read(&key, &0) {
            (Status::NotFound, None) => gone += 1,
            (Status::Ok, Some(value)) => assert_eq!(value, key),
            (Status::Pending, None) => {
                session.complete_pending(true);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }
    assert!(gone > 0, "no key was truncated");

    // Recent keys are still readable.
    for i in 1_900..2_000u64 {
        let (status, out) = session.read(&(100_000 + i), &0);
        assert_eq!(status, Status::Ok);
        assert_eq!(out, Some(i));
    }
}

#[test]
fn test_truncated_segments_are_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let store = create_store(dir.path());
    let mut session = store.start_session().unwrap();

    for i in 0..3_000u64 {
        session.upsert(&i, &i);
        if i % 64 == 0 {
            session.refresh();
        }
    }
    let head = store.log_stats().head_address;
    assert!(
        head.control() >= 2 * 4096,
        "need at least two evicted segments, head at {head}"
    );
    assert!(dir.path().join("log").join("log.0").exists());

    assert_eq!(session.shift_begin_address(head), Status::Ok);
    // The deferred segment deletion fires on an epoch drain.
    for _ in 0..100 {
        session.refresh();
        if !dir.path().join("log").join("log.0").exists() {
            break;
        }
        std::thread::yield_now();
    }
    assert!(
        !dir.path().join("log").join("log.0").exists(),
        "truncated segment survived"
    );
}

#[test]
fn test_store_still_writable_after_truncation() {
    let dir = tempfile::tempdir().unwrap();
    let store = create_store(dir.path());
    let mut session = store.start_session().unwrap();

    for i in 0..2_000u64 {
        session.upsert(&(i % 64), &i);
        if i % 64 == 0 {
            session.refresh();
        }
    }
    let head = store.log_stats().head_address;
    assert_eq!(session.shift_begin_address(head), Status::Ok);

    // New writes and RMWs keep working after truncation.
    for key in 0u64..64 {
        assert_eq!(session.upsert(&key, &(key + 1)), Status::Ok);
        assert_eq!(session.read(&key, &0), (Status::Ok, Some(key + 1)));
    }
    let rmw = session.rmw(&0, &10);
    assert!(rmw == Status::Ok || rmw == Status::Pending);
    session.complete_pending(true);
}
