//! Asynchronous disk reads for parked operations.
//!
//! Operations that fault below the head address register a pending id and
//! hand the read to a background worker; completions flow back over a
//! per-session channel drained by `complete_pending`.

use std::io;
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::address::Address;
use crate::device::StorageDevice;
use crate::record::RecordView;

pub(crate) enum IoRequest {
    ReadRecord {
        session_slot: usize,
        pending_id: u64,
        address: Address,
    },
    Shutdown,
}

pub(crate) struct IoCompletion {
    pub pending_id: u64,
    pub address: Address,
    pub result: io::Result<Vec<u8>>,
}

/// Routes read requests to a worker thread and completions back to the
/// requesting session's queue.
pub(crate) struct IoManager {
    tx: Sender<IoRequest>,
    sessions: Arc<Mutex<Vec<Option<Sender<IoCompletion>>>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl IoManager {
    pub(crate) fn new<D: StorageDevice>(device: Arc<D>) -> Self {
        let (tx, rx) = unbounded::<IoRequest>();
        let sessions: Arc<Mutex<Vec<Option<Sender<IoCompletion>>>>> =
            Arc::new(Mutex::new(Vec::new()));

        let worker_sessions = sessions.clone();
        let worker = thread::Builder::new()
            .name("tidekv-io".into())
            .spawn(move || io_worker_loop(device, rx, worker_sessions))
            .expect("spawn io worker");

        Self {
            tx,
            sessions,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Register a session slot; completions for it flow into the returned
    /// receiver.
    pub(crate) fn register_session(&self, slot: usize) -> Receiver<IoCompletion> {
        let (tx, rx) = unbounded();
        let mut sessions = self.sessions.lock();
        if sessions.len() <= slot {
            sessions.resize_with(slot + 1, || None);
        }
        sessions[slot] = Some(tx);
        rx
    }

    /// Drop a session's completion channel.
    pub(crate) fn unregister_session(&self, slot: usize) {
        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get_mut(slot) {
            *entry = None;
        }
    }

    /// Queue a record read. Returns `false` if the worker has shut down.
    pub(crate) fn submit_read(&self, session_slot: usize, pending_id: u64, address: Address) -> bool {
        self.tx
            .send(IoRequest::ReadRecord {
                session_slot,
                pending_id,
                address,
            })
            .is_ok()
    }

    /// Stop the worker. Idempotent.
    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(IoRequest::Shutdown);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn io_worker_loop<D: StorageDevice>(
    device: Arc<D>,
    rx: Receiver<IoRequest>,
    sessions: Arc<Mutex<Vec<Option<Sender<IoCompletion>>>>>,
) {
    while let Ok(request) = rx.recv() {
        let (session_slot, pending_id, address) = match request {
            IoRequest::ReadRecord {
                session_slot,
                pending_id,
                address,
            } => (session_slot, pending_id, address),
            IoRequest::Shutdown => break,
        };

        let result = read_record(&*device, address);
        let target = sessions.lock().get(session_slot).and_then(Clone::clone);
        if let Some(tx) = target {
            let _ = tx.send(IoCompletion {
                pending_id,
                address,
                result,
            });
        }
    }
}

/// Two-step record read: the fixed prefix first to learn the record's size,
/// then the remainder.
fn read_record<D: StorageDevice>(device: &D, address: Address) -> io::Result<Vec<u8>> {
    let mut prefix = vec![0u8; RecordView::MIN_SIZE];
    device.read_at(address.control(), &mut prefix)?;
    // SAFETY: prefix holds MIN_SIZE bytes.
    let view = unsafe { RecordView::from_ptr(prefix.as_mut_ptr()) };
    if view.header().is_null() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "record header is empty",
        ));
    }
    let total = view.size() as usize;
    let mut full = vec![0u8; total];
    full[..RecordView::MIN_SIZE].copy_from_slice(&prefix);
    device.read_at(
        address.control() + RecordView::MIN_SIZE as u64,
        &mut full[RecordView::MIN_SIZE..],
    )?;
    Ok(full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SegmentedFileDisk;
    use crate::record::{physical_size, RecordView};

    #[test]
    fn test_read_record_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(SegmentedFileDisk::with_segment_bits(dir.path(), 16).unwrap());

        // Write a record image at offset 4096.
        let key = 9u64;
        let size = physical_size(8, 8) as usize;
        let mut image = vec![0u8; size];
        let view = unsafe {
            RecordView::initialize(
                image.as_mut_ptr(),
                Address::INVALID,
                1,
                false,
                &key,
                8,
            )
        };
        view.value_bytes_mut().copy_from_slice(&77u64.to_le_bytes());
        device.write_at(4096, &image).unwrap();

        let manager = IoManager::new(device);
        let rx = manager.register_session(0);
        assert!(manager.submit_read(0, 11, Address::from_control(4096)));

        let completion = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert_eq!(completion.pending_id, 11);
        let mut bytes = completion.result.unwrap();
        let view = unsafe { RecordView::from_ptr(bytes.as_mut_ptr()) };
        assert!(crate::record::Key::matches(&key, view.key_bytes()));
        assert_eq!(view.value_bytes(), 77u64.to_le_bytes());
        manager.shutdown();
    }

    #[test]
    fn test_unregistered_session_drops_completion() {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(SegmentedFileDisk::with_segment_bits(dir.path(), 16).unwrap());
        let manager = IoManager::new(device);
        let rx = manager.register_session(2);
        manager.unregister_session(2);
        assert!(manager.submit_read(2, 0, Address::from_control(0)));
        assert!(rx
            .recv_timeout(std::time::Duration::from_millis(200))
            .is_err());
        manager.shutdown();
    }
}
