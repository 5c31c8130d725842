//! Basic single-session operation tests.

use std::sync::Arc;

use tidekv::device::NullDisk;
use tidekv::store::U64AddFunctions;
use tidekv::{Status, StoreConfig, TideKv};

fn create_store() -> Arc<TideKv<NullDisk, U64AddFunctions>> {
    let config = StoreConfig {
        table_size: 1024,
        log_memory_size: 1 << 22, // 4 MiB
        page_size_bits: 16,       // 64 KiB pages
        mutable_fraction: 0.75,
        ..Default::default()
    };
    Arc::new(TideKv::new(config, NullDisk::new(), U64AddFunctions).unwrap())
}

#[test]
fn test_upsert_then_read() {
    let store = create_store();
    let mut session = store.start_session().unwrap();

    assert_eq!(session.upsert(&7, &42), Status::Ok);
    let (status, out) = session.read(&7, &0);
    assert_eq!(status, Status::Ok);
    assert_eq!(out, Some(42));
}

#[test]
fn test_read_nonexistent() {
    let store = create_store();
    let mut session = store.start_session().unwrap();

    let (status, out) = session.read(&999, &0);
    assert_eq!(status, Status::NotFound);
    assert!(out.is_none());
}

#[test]
fn test_update_overwrites() {
    let store = create_store();
    let mut session = store.start_session().unwrap();

    session.upsert(&42, &100);
    assert_eq!(session.read(&42, &0), (Status::Ok, Some(100)));

    session.upsert(&42, &200);
    assert_eq!(session.read(&42, &0), (Status::Ok, Some(200)));
}

#[test]
fn test_delete() {
    let store = create_store();
    let mut session = store.start_session().unwrap();

    session.upsert(&42, &100);
    assert_eq!(session.delete(&42), Status::Ok);
    assert_eq!(session.read(&42, &0), (Status::NotFound, None));

    // Deleting an absent key is NotFound, not an error.
    assert_eq!(session.delete(&4242), Status::NotFound);

    // A key can be rewritten after deletion.
    session.upsert(&42, &300);
    assert_eq!(session.read(&42, &0), (Status::Ok, Some(300)));
}

#[test]
fn test_many_keys() {
    let store = create_store();
    let mut session = store.start_session().unwrap();

    for key in 1u64..=1000 {
        assert_eq!(session.upsert(&key, &(key * 10)), Status::Ok);
    }
    for key in 1u64..=1000 {
        assert_eq!(session.read(&key, &0), (Status::Ok, Some(key * 10)));
    }

    // Overwrite half and verify both halves.
    for key in 1u64..=500 {
        session.upsert(&key, &(key * 100));
    }
    for key in 1u64..=500 {
        assert_eq!(session.read(&key, &0), (Status::Ok, Some(key * 100)));
    }
    for key in 501u64..=1000 {
        assert_eq!(session.read(&key, &0), (Status::Ok, Some(key * 10)));
    }
}

#[test]
fn test_serial_numbers_are_monotonic() {
    let store = create_store();
    let mut session = store.start_session().unwrap();

    assert_eq!(session.serial_num(), 0);
    session.upsert(&1, &1);
    assert_eq!(session.serial_num(), 1);
    session.read(&1, &0);
    assert_eq!(session.serial_num(), 2);
    session.rmw(&1, &1);
    assert_eq!(session.serial_num(), 3);
    session.delete(&1);
    assert_eq!(session.serial_num(), 4);
}

#[test]
fn test_entry_count_tracks_keys() {
    let store = create_store();
    let mut session = store.start_session().unwrap();

    for key in 0u64..50 {
        session.upsert(&key, &key);
    }
    assert_eq!(store.entry_count(), 50);

    // Overwrites reuse the entry.
    for key in 0u64..50 {
        session.upsert(&key, &(key + 1));
    }
    assert_eq!(store.entry_count(), 50);
}

#[test]
fn test_log_addresses_advance() {
    let store = create_store();
    let mut session = store.start_session().unwrap();

    let before = store.log_tail_address();
    session.upsert(&1, &1);
    let after = store.log_tail_address();
    assert!(after > before);
    assert!(store.log_read_only_address() <= after);
    assert!(store.log_begin_address() <= store.log_read_only_address());
}

#[test]
fn test_two_sessions_see_each_other() {
    let store = create_store();
    let mut a = store.start_session().unwrap();
    let mut b = store.start_session().unwrap();

    a.upsert(&5, &55);
    assert_eq!(b.read(&5, &0), (Status::Ok, Some(55)));

    b.upsert(&5, &66);
    assert_eq!(a.read(&5, &0), (Status::Ok, Some(66)));
}
