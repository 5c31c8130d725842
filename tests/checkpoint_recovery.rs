//! Checkpoint and recovery: the recoverable-prefix contract.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use tidekv::checkpoint::CheckpointBackend;
use tidekv::device::SegmentedFileDisk;
use tidekv::store::U64AddFunctions;
use tidekv::{Status, StoreConfig, TideKv};

fn config_for(dir: &std::path::Path) -> StoreConfig {
    StoreConfig {
        table_size: 256,
        log_memory_size: 16 << 12, // sixteen 4 KiB pages
        page_size_bits: 12,
        mutable_fraction: 0.75,
        checkpoint_dir: dir.join("checkpoints"),
        ..Default::default()
    }
}

fn open_store(dir: &std::path::Path) -> Arc<TideKv<SegmentedFileDisk, U64AddFunctions>> {
    let device = SegmentedFileDisk::with_segment_bits(dir.join("log"), 20).unwrap();
    Arc::new(TideKv::new(config_for(dir), device, U64AddFunctions).unwrap())
}

/// Read that resolves a pending (on-disk) result before returning.
fn read_value(
    session: &mut tidekv::Session<SegmentedFileDisk, U64AddFunctions>,
    key: u64,
) -> Option<u64> {
    match session.read(&key, &0) {
        (Status::Ok, out) => out,
        (Status::NotFound, _) => None,
        (Status::Pending, _) => {
            let serial = session.serial_num();
            assert!(session.complete_pending(true));
            let done = session
                .drain_completed()
                .into_iter()
                .find(|op| op.serial == serial)
                .expect("pending read completed");
            match done.status {
                Status::Ok => done.output,
                Status::NotFound => None,
                other => panic!("pending read failed: {other}"),
            }
        }
        other => panic!("unexpected read result {other:?}"),
    }
}

#[test]
fn test_checkpoint_then_recover_prefix() {
    let dir = tempfile::tempdir().unwrap();

    let (token, guid) = {
        let store = open_store(dir.path());
        let mut session = store.start_session().unwrap();

        assert_eq!(session.upsert(&1, &1), Status::Ok);
        assert_eq!(session.upsert(&2, &2), Status::Ok);

        let token = session
            .take_full_checkpoint(CheckpointBackend::FoldOver)
            .unwrap();
        assert_eq!(session.complete_checkpoint(true), Status::Ok);

        // Past the checkpoint: must not be part of the recovered prefix.
        assert_eq!(session.upsert(&3, &3), Status::Ok);

        let guid = session.guid();
        drop(session);
        store.dispose();
        (token, guid)
    };

    let store = open_store(dir.path());
    store.recover(token, token).unwrap();

    let (mut session, serial) = store.continue_session(guid).unwrap();
    assert_eq!(serial, 2);

    assert_eq!(session.read(&1, &0), (Status::Ok, Some(1)));
    assert_eq!(session.read(&2, &0), (Status::Ok, Some(2)));
    assert_eq!(session.read(&3, &0), (Status::NotFound, None));
}

#[test]
fn test_recovered_store_accepts_new_writes() {
    let dir = tempfile::tempdir().unwrap();

    let (token, guid) = {
        let store = open_store(dir.path());
        let mut session = store.start_session().unwrap();
        for key in 0u64..100 {
            session.upsert(&key, &(key * 2));
        }
        let token = session
            .take_full_checkpoint(CheckpointBackend::FoldOver)
            .unwrap();
        assert_eq!(session.complete_checkpoint(true), Status::Ok);
        let guid = session.guid();
        drop(session);
        store.dispose();
        (token, guid)
    };

    let store = open_store(dir.path());
    store.recover(token, token).unwrap();
    let (mut session, serial) = store.continue_session(guid).unwrap();
    assert_eq!(serial, 100);

    for key in 0u64..100 {
        assert_eq!(session.read(&key, &0), (Status::Ok, Some(key * 2)));
    }
    // The recovered store keeps operating.
    session.upsert(&1000, &77);
    assert_eq!(session.read(&1000, &0), (Status::Ok, Some(77)));
    assert_eq!(session.rmw(&0, &5), Status::Ok);
    assert_eq!(session.read(&0, &0), (Status::Ok, Some(5)));
}

#[test]
fn test_snapshot_backend_writes_side_file_and_recovers() {
    let dir = tempfile::tempdir().unwrap();

    let token = {
        let store = open_store(dir.path());
        let mut session = store.start_session().unwrap();
        for key in 0u64..50 {
            session.upsert(&key, &key);
        }
        let token = session
            .take_full_checkpoint(CheckpointBackend::Snapshot)
            .unwrap();
        assert_eq!(session.complete_checkpoint(true), Status::Ok);
        drop(session);
        store.dispose();
        token
    };

    let snapshot_path = dir
        .path()
        .join("checkpoints")
        .join(token.to_string())
        .join("log.snapshot");
    assert!(snapshot_path.exists(), "snapshot side file missing");

    let store = open_store(dir.path());
    store.recover(token, token).unwrap();
    let mut session = store.start_session().unwrap();
    for key in 0u64..50 {
        assert_eq!(session.read(&key, &0), (Status::Ok, Some(key)));
    }
}

#[test]
fn test_index_and_log_checkpoints_pair_for_recovery() {
    let dir = tempfile::tempdir().unwrap();

    let (index_token, log_token) = {
        let store = open_store(dir.path());
        let mut session = store.start_session().unwrap();
        for key in 0u64..40 {
            session.upsert(&key, &(key + 1));
        }
        let index_token = session.take_index_checkpoint().unwrap();
        assert_eq!(session.complete_checkpoint(true), Status::Ok);

        for key in 40u64..80 {
            session.upsert(&key, &(key + 1));
        }
        let log_token = session
            .take_hybrid_log_checkpoint(CheckpointBackend::FoldOver)
            .unwrap();
        assert_eq!(session.complete_checkpoint(true), Status::Ok);

        drop(session);
        store.dispose();
        (index_token, log_token)
    };

    let store = open_store(dir.path());
    store.recover(index_token, log_token).unwrap();
    let mut session = store.start_session().unwrap();
    // Both the dumped prefix and the replayed range are present.
    for key in 0u64..80 {
        assert_eq!(session.read(&key, &0), (Status::Ok, Some(key + 1)));
    }
}

#[test]
fn test_second_checkpoint_while_active_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path());
    let mut a = store.start_session().unwrap();
    let mut b = store.start_session().unwrap();

    a.upsert(&1, &1);
    let _token = a
        .take_full_checkpoint(CheckpointBackend::FoldOver)
        .unwrap();
    assert_eq!(
        b.take_full_checkpoint(CheckpointBackend::FoldOver),
        Err(Status::Aborted)
    );
    // Both sessions cooperate to finish the first one.
    let done = thread::scope(|scope| {
        let h = scope.spawn(move || {
            let status = a.complete_checkpoint(true);
            status
        });
        for _ in 0..10_000 {
            b.refresh();
            if !b.has_pending() && store.system_state().is_rest() {
                break;
            }
            thread::yield_now();
        }
        h.join().unwrap()
    });
    assert_eq!(done, Status::Ok);
}

#[test]
fn test_checkpoint_under_concurrent_writers() {
    let dir = tempfile::tempdir().unwrap();
    const PREFIX: u64 = 500;

    let token;
    let coordinator_guid;
    {
        let store = open_store(dir.path());
        let ready = Arc::new(Barrier::new(3));
        let stop = Arc::new(AtomicBool::new(false));

        let workers: Vec<_> = (0..2u64)
            .map(|worker| {
                let store = store.clone();
                let ready = ready.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    let mut session = store.start_session().unwrap();
                    // Phase 1: a known prefix, fully acknowledged.
                    for i in 0..PREFIX {
                        let key = worker * 1_000_000 + i;
                        assert_eq!(session.upsert(&key, &i), Status::Ok);
                    }
                    session.refresh();
                    ready.wait();
                    // Phase 2: churn while the checkpoint runs; these
                    // writes may or may not survive.
                    let mut i = PREFIX;
                    while !stop.load(Ordering::Acquire) {
                        let key = worker * 1_000_000 + i;
                        session.upsert(&key, &i);
                        i += 1;
                        session.refresh();
                        session.complete_pending(false);
                    }
                    session.complete_pending(true);
                })
            })
            .collect();

        let mut session = store.start_session().unwrap();
        ready.wait();
        token = session
            .take_full_checkpoint(CheckpointBackend::FoldOver)
            .unwrap();
        assert_eq!(session.complete_checkpoint(true), Status::Ok);
        coordinator_guid = session.guid();

        stop.store(true, Ordering::Release);
        for worker in workers {
            worker.join().unwrap();
        }
        drop(session);
        store.dispose();
    }

    let store = open_store(dir.path());
    store.recover(token, token).unwrap();
    let (mut session, _serial) = store.continue_session(coordinator_guid).unwrap();

    // Every pre-checkpoint write is part of the recovered prefix.
    for worker in 0..2u64 {
        for i in 0..PREFIX {
            let key = worker * 1_000_000 + i;
            assert_eq!(
                read_value(&mut session, key),
                Some(i),
                "lost pre-checkpoint write {key}"
            );
        }
    }
}
