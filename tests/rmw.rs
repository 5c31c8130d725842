//! Read-modify-write semantics.

use std::sync::Arc;

use tidekv::device::NullDisk;
use tidekv::store::U64AddFunctions;
use tidekv::{Status, StoreConfig, TideKv};

fn create_store() -> Arc<TideKv<NullDisk, U64AddFunctions>> {
    let config = StoreConfig {
        table_size: 256,
        log_memory_size: 1 << 21,
        page_size_bits: 15,
        ..Default::default()
    };
    Arc::new(TideKv::new(config, NullDisk::new(), U64AddFunctions).unwrap())
}

#[test]
fn test_rmw_first_creates() {
    let store = create_store();
    let mut session = store.start_session().unwrap();

    // First RMW on an absent key creates the value and reports NotFound to
    // distinguish creation from modification.
    assert_eq!(session.rmw(&9, &5), Status::NotFound);
    assert_eq!(session.read(&9, &0), (Status::Ok, Some(5)));
}

#[test]
fn test_rmw_accumulates() {
    let store = create_store();
    let mut session = store.start_session().unwrap();

    session.rmw(&1, &10);
    assert_eq!(session.rmw(&1, &10), Status::Ok);
    assert_eq!(session.rmw(&1, &22), Status::Ok);
    assert_eq!(session.read(&1, &0), (Status::Ok, Some(42)));
}

#[test]
fn test_rmw_after_upsert() {
    let store = create_store();
    let mut session = store.start_session().unwrap();

    session.upsert(&3, &100);
    assert_eq!(session.rmw(&3, &1), Status::Ok);
    assert_eq!(session.read(&3, &0), (Status::Ok, Some(101)));
}

#[test]
fn test_rmw_after_delete_recreates() {
    let store = create_store();
    let mut session = store.start_session().unwrap();

    session.upsert(&4, &7);
    session.delete(&4);
    assert_eq!(session.rmw(&4, &3), Status::NotFound);
    assert_eq!(session.read(&4, &0), (Status::Ok, Some(3)));
}

#[test]
fn test_rmw_many_keys_interleaved() {
    let store = create_store();
    let mut session = store.start_session().unwrap();

    for round in 0u64..10 {
        for key in 0u64..100 {
            let status = session.rmw(&key, &1);
            if round == 0 {
                assert_eq!(status, Status::NotFound);
            } else {
                assert_eq!(status, Status::Ok);
            }
        }
    }
    for key in 0u64..100 {
        assert_eq!(session.read(&key, &0), (Status::Ok, Some(10)));
    }
}
