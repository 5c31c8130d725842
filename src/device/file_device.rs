//! File-backed storage device, one file per log segment.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::StorageDevice;
use crate::utility::is_power_of_two;

/// A segmented file device.
///
/// Segment `s` of the log maps to the file `<dir>/<prefix>.<s>`. Files are
/// created lazily on first access and cached; `delete_segment_range`
/// removes the files backing truncated segments.
pub struct SegmentedFileDisk {
    dir: PathBuf,
    prefix: String,
    segment_size_bits: u32,
    files: Mutex<HashMap<u64, Arc<File>>>,
}

impl SegmentedFileDisk {
    /// Open a device rooted at `dir` with 1 GiB segments.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        Self::with_segment_bits(dir, 30)
    }

    /// Open a device with `1 << segment_size_bits` byte segments.
    pub fn with_segment_bits(dir: impl Into<PathBuf>, segment_size_bits: u32) -> io::Result<Self> {
        if !is_power_of_two(1u64 << segment_size_bits) || segment_size_bits < 12 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "segment size must be a power of two of at least 4 KiB",
            ));
        }
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            prefix: "log".to_string(),
            segment_size_bits,
            files: Mutex::new(HashMap::new()),
        })
    }

    fn segment_path(&self, segment: u64) -> PathBuf {
        self.dir.join(format!("{}.{}", self.prefix, segment))
    }

    fn segment_file(&self, segment: u64) -> io::Result<Arc<File>> {
        let mut files = self.files.lock();
        if let Some(file) = files.get(&segment) {
            return Ok(file.clone());
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.segment_path(segment))?;
        let file = Arc::new(file);
        files.insert(segment, file.clone());
        Ok(file)
    }

    #[inline]
    fn segment_of(&self, offset: u64) -> u64 {
        offset >> self.segment_size_bits
    }

    #[inline]
    fn offset_in_segment(&self, offset: u64) -> u64 {
        offset & ((1 << self.segment_size_bits) - 1)
    }
}

impl StorageDevice for SegmentedFileDisk {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;

        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let segment = self.segment_of(pos);
            let in_seg = self.offset_in_segment(pos);
            let seg_remaining = (1u64 << self.segment_size_bits) - in_seg;
            let take = (buf.len() - done).min(seg_remaining as usize);
            let file = self.segment_file(segment)?;
            file.read_exact_at(&mut buf[done..done + take], in_seg)?;
            done += take;
        }
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;

        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let segment = self.segment_of(pos);
            let in_seg = self.offset_in_segment(pos);
            let seg_remaining = (1u64 << self.segment_size_bits) - in_seg;
            let take = (buf.len() - done).min(seg_remaining as usize);
            let file = self.segment_file(segment)?;
            file.write_all_at(&buf[done..done + take], in_seg)?;
            done += take;
        }
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        let files: Vec<Arc<File>> = self.files.lock().values().cloned().collect();
        for file in files {
            file.sync_data()?;
        }
        Ok(())
    }

    fn delete_segment_range(&self, from: u64, to: u64) -> io::Result<()> {
        let mut files = self.files.lock();
        for segment in from..to {
            files.remove(&segment);
            match fs::remove_file(self.segment_path(segment)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn segment_size_bits(&self) -> u32 {
        self.segment_size_bits
    }
}
