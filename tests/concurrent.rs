//! Concurrent-session linearizability tests.

use std::sync::Arc;
use std::thread;

use rand::Rng;
use tidekv::device::NullDisk;
use tidekv::store::U64AddFunctions;
use tidekv::{Status, StoreConfig, TideKv};

fn create_store(table_size: u64) -> Arc<TideKv<NullDisk, U64AddFunctions>> {
    let config = StoreConfig {
        table_size,
        log_memory_size: 1 << 23, // 8 MiB
        page_size_bits: 16,
        ..Default::default()
    };
    Arc::new(TideKv::new(config, NullDisk::new(), U64AddFunctions).unwrap())
}

/// Two writers race on one key; the surviving value must be one of theirs,
/// and repeated record creation on the same slot must show CAS contention.
#[test]
fn test_two_writer_race_last_writer_wins() {
    let store = create_store(64);

    let handles: Vec<_> = [100u64, 200u64]
        .into_iter()
        .map(|value| {
            let store = store.clone();
            thread::spawn(move || {
                let mut session = store.start_session().unwrap();
                for _ in 0..1000 {
                    assert_eq!(session.upsert(&3, &value), Status::Ok);
                    // Deleting forces the next upsert to publish a fresh
                    // record, so both writers keep racing the index CAS.
                    session.delete(&3);
                }
                assert_eq!(session.upsert(&3, &value), Status::Ok);
                session.refresh();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut session = store.start_session().unwrap();
    let (status, out) = session.read(&3, &0);
    assert_eq!(status, Status::Ok);
    assert!(out == Some(100) || out == Some(200), "got {out:?}");
    assert!(
        store.contention_retries() > 0,
        "two writers on one slot never collided"
    );
}

/// N concurrent increments over a commutative update must all survive.
#[test]
fn test_concurrent_rmw_counts_every_increment() {
    let store = create_store(256);
    const THREADS: u64 = 4;
    const PER_THREAD: u64 = 2_500;

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let store = store.clone();
            thread::spawn(move || {
                let mut session = store.start_session().unwrap();
                for i in 0..PER_THREAD {
                    session.rmw(&7, &1);
                    if i % 128 == 0 {
                        session.refresh();
                        session.complete_pending(false);
                    }
                }
                // Anything parked must land before the session goes away.
                assert!(session.complete_pending(true));
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut session = store.start_session().unwrap();
    assert_eq!(
        session.read(&7, &0),
        (Status::Ok, Some(THREADS * PER_THREAD))
    );
}

/// Concurrent mixed workload over disjoint and shared keys; nothing may
/// error and every session's own writes must be visible to it.
#[test]
fn test_mixed_workload_read_your_writes() {
    let store = create_store(1024);
    const THREADS: u64 = 4;

    let handles: Vec<_> = (0..THREADS)
        .map(|thread_id| {
            let store = store.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let mut session = store.start_session().unwrap();
                for i in 0..5_000u64 {
                    // Own keyspace: read-your-writes must hold.
                    let own = thread_id * 1_000_000 + (i % 256);
                    assert_eq!(session.upsert(&own, &i), Status::Ok);
                    let (status, out) = session.read(&own, &0);
                    assert_eq!(status, Status::Ok);
                    assert_eq!(out, Some(i));

                    // Shared keyspace: any committed value is acceptable.
                    let shared = rng.gen_range(0u64..64);
                    let status = session.rmw(&shared, &1);
                    assert!(
                        status == Status::Ok
                            || status == Status::NotFound
                            || status == Status::Pending
                    );

                    if i % 64 == 0 {
                        session.refresh();
                        session.complete_pending(false);
                    }
                }
                assert!(session.complete_pending(true));
                for done in session.drain_completed() {
                    assert!(!done.status.is_error(), "{:?}", done.status);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

/// The log watermarks stay ordered and non-decreasing while writers churn.
#[test]
fn test_region_monotonicity_under_load() {
    let store = create_store(256);
    let writer = {
        let store = store.clone();
        thread::spawn(move || {
            let mut session = store.start_session().unwrap();
            for i in 0..20_000u64 {
                session.upsert(&(i % 512), &i);
                if i % 128 == 0 {
                    session.refresh();
                }
            }
        })
    };

    let mut last = store.log_stats();
    for _ in 0..500 {
        let now = store.log_stats();
        assert!(now.begin_address <= now.head_address);
        assert!(now.head_address <= now.safe_read_only_address);
        assert!(now.safe_read_only_address <= now.read_only_address);
        assert!(now.read_only_address <= now.tail_address);

        assert!(now.begin_address >= last.begin_address);
        assert!(now.head_address >= last.head_address);
        assert!(now.safe_read_only_address >= last.safe_read_only_address);
        assert!(now.read_only_address >= last.read_only_address);
        assert!(now.tail_address >= last.tail_address);
        last = now;
        thread::yield_now();
    }
    writer.join().unwrap();
}
