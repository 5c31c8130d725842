//! Online hash-table doubling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tidekv::device::NullDisk;
use tidekv::store::U64AddFunctions;
use tidekv::{Status, StoreConfig, TideKv};

fn create_store(table_size: u64) -> Arc<TideKv<NullDisk, U64AddFunctions>> {
    let config = StoreConfig {
        table_size,
        log_memory_size: 1 << 22,
        page_size_bits: 14,
        ..Default::default()
    };
    Arc::new(TideKv::new(config, NullDisk::new(), U64AddFunctions).unwrap())
}

#[test]
fn test_grow_doubles_and_preserves_keys() {
    let store = create_store(64);
    let mut session = store.start_session().unwrap();

    for key in 0u64..500 {
        assert_eq!(session.upsert(&key, &(key * 3)), Status::Ok);
    }
    assert_eq!(store.index_stats().table_size, 64);

    assert_eq!(session.grow_index(), Status::Ok);
    assert_eq!(store.index_stats().table_size, 128);

    for key in 0u64..500 {
        assert_eq!(session.read(&key, &0), (Status::Ok, Some(key * 3)));
    }

    // Writes keep working against the new generation.
    for key in 500u64..600 {
        assert_eq!(session.upsert(&key, &key), Status::Ok);
    }
    for key in 500u64..600 {
        assert_eq!(session.read(&key, &0), (Status::Ok, Some(key)));
    }
}

#[test]
fn test_grow_twice() {
    let store = create_store(64);
    let mut session = store.start_session().unwrap();

    for key in 0u64..200 {
        session.upsert(&key, &key);
    }
    assert_eq!(session.grow_index(), Status::Ok);
    assert_eq!(session.grow_index(), Status::Ok);
    assert_eq!(store.index_stats().table_size, 256);

    for key in 0u64..200 {
        assert_eq!(session.read(&key, &0), (Status::Ok, Some(key)));
    }
}

#[test]
fn test_grow_with_record_chains() {
    let store = create_store(64);
    let mut session = store.start_session().unwrap();

    // Build multi-record chains (value, tombstone, re-created value) so the
    // split has to trace previous addresses.
    for key in 0u64..100 {
        assert_eq!(session.upsert(&key, &1), Status::Ok);
    }
    for key in 0u64..100 {
        assert_eq!(session.delete(&key), Status::Ok);
    }
    for key in 0u64..100 {
        assert_eq!(session.rmw(&key, &7), Status::NotFound);
    }
    for key in 0u64..100 {
        assert_eq!(session.rmw(&key, &3), Status::Ok);
    }

    assert_eq!(session.grow_index(), Status::Ok);
    for key in 0u64..100 {
        assert_eq!(session.read(&key, &0), (Status::Ok, Some(10)));
    }
}

#[test]
fn test_grow_under_concurrent_load() {
    let store = create_store(128);
    let stop = Arc::new(AtomicBool::new(false));

    let workers: Vec<_> = (0..2u64)
        .map(|worker| {
            let store = store.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut session = store.start_session().unwrap();
                let mut i = 0u64;
                while !stop.load(Ordering::Acquire) {
                    let key = worker * 1_000_000 + (i % 2_000);
                    assert!(!session.upsert(&key, &i).is_error());
                    let (status, _) = session.read(&key, &0);
                    assert!(!status.is_error(), "read failed: {status}");
                    i += 1;
                    session.refresh();
                    session.complete_pending(false);
                }
                session.complete_pending(true);
                i
            })
        })
        .collect();

    let mut session = store.start_session().unwrap();
    // Give the workers a head start, then double the table under them.
    for key in 0u64..1_000 {
        session.upsert(&(5_000_000 + key), &key);
    }
    assert_eq!(session.grow_index(), Status::Ok);
    assert_eq!(store.index_stats().table_size, 256);

    stop.store(true, Ordering::Release);
    for worker in workers {
        assert!(worker.join().unwrap() > 0);
    }

    // Everything written by the coordinator survives the migration.
    for key in 0u64..1_000 {
        assert_eq!(
            session.read(&(5_000_000 + key), &0),
            (Status::Ok, Some(key))
        );
    }
}
