//! Uniform seek/read/write/available/size interface over a raw device or an
//! in-memory buffer (§4.2). Implemented as a variant type over the two
//! concrete backends rather than a trait object — there are only ever two
//! shapes and UDP packet rates don't justify dynamic dispatch.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write as IoWrite},
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
};

use thiserror::Error;
use tracing::warn;

/// Default size of the memory-backed device, used for tests and `--test-mode`.
pub const DEFAULT_MEMORY_DEVICE_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("block device unavailable")]
    Unavailable,

    #[error("block device I/O failed: {0}")]
    IoFailed(#[from] io::Error),

    #[error("block device is read-only")]
    ReadOnly,
}

/// Cumulative read/write byte counters, shared with a status reporter
/// thread without a mutex — tearing on the scalar reads is acceptable for
/// human-readable output (§5).
#[derive(Clone, Default)]
pub struct Counters {
    pub bytes_read: Arc<AtomicU64>,
    pub bytes_written: Arc<AtomicU64>,
}

impl Counters {
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.bytes_read.load(Ordering::Relaxed),
            self.bytes_written.load(Ordering::Relaxed),
        )
    }
}

pub enum BlockDevice {
    Memory(MemoryBlockDevice),
    File(FileBlockDevice),
}

impl BlockDevice {
    pub fn sector_size(&self) -> u32 {
        match self {
            BlockDevice::Memory(d) => d.sector_size,
            BlockDevice::File(d) => d.sector_size,
        }
    }

    pub fn sector_count(&self) -> u64 {
        match self {
            BlockDevice::Memory(d) => d.sector_count,
            BlockDevice::File(d) => d.sector_count,
        }
    }

    pub fn available(&self) -> bool {
        match self {
            BlockDevice::Memory(d) => d.available(),
            BlockDevice::File(d) => d.available(),
        }
    }

    /// Whether writes to this device are silently discarded (§4.2, §7).
    /// Memory devices are always read-write; a file device flips this on
    /// when it fell back to read-only at open time (see `FileBlockDevice::open`).
    pub fn is_read_only(&self) -> bool {
        match self {
            BlockDevice::Memory(_) => false,
            BlockDevice::File(d) => d.is_read_only(),
        }
    }

    pub fn status(&self) -> (u64, u64) {
        match self {
            BlockDevice::Memory(d) => d.counters.snapshot(),
            BlockDevice::File(d) => d.counters.snapshot(),
        }
    }

    pub fn counters(&self) -> Counters {
        match self {
            BlockDevice::Memory(d) => d.counters.clone(),
            BlockDevice::File(d) => d.counters.clone(),
        }
    }

    pub fn seek(&mut self, sector_offset: u32) -> Result<(), DeviceError> {
        match self {
            BlockDevice::Memory(d) => d.seek(sector_offset),
            BlockDevice::File(d) => d.seek(sector_offset),
        }
    }

    pub fn read(&mut self, size: usize) -> Result<Vec<u8>, DeviceError> {
        match self {
            BlockDevice::Memory(d) => d.read(size),
            BlockDevice::File(d) => d.read(size),
        }
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        match self {
            BlockDevice::Memory(d) => d.write(data),
            BlockDevice::File(d) => d.write(data),
        }
    }

    pub fn close(&mut self) {
        match self {
            BlockDevice::Memory(_) => {}
            BlockDevice::File(d) => d.close(),
        }
    }
}

/// Fixed-size byte buffer used for tests and `--test-mode`. Cursor is a
/// plain integer into the buffer.
pub struct MemoryBlockDevice {
    data: Vec<u8>,
    position: usize,
    sector_size: u32,
    sector_count: u64,
    counters: Counters,
}

impl MemoryBlockDevice {
    pub fn new(sector_size: u32) -> Self {
        Self::with_capacity(sector_size, DEFAULT_MEMORY_DEVICE_SIZE)
    }

    pub fn with_capacity(sector_size: u32, capacity: u64) -> Self {
        MemoryBlockDevice {
            data: vec![0u8; capacity as usize],
            position: 0,
            sector_size,
            sector_count: capacity / u64::from(sector_size),
            counters: Counters::default(),
        }
    }

    fn available(&self) -> bool {
        true
    }

    fn seek(&mut self, sector_offset: u32) -> Result<(), DeviceError> {
        self.position = u64::from(sector_offset) as usize * self.sector_size as usize;
        Ok(())
    }

    fn read(&mut self, size: usize) -> Result<Vec<u8>, DeviceError> {
        let start = self.position.min(self.data.len());
        let end = (start + size).min(self.data.len());
        let out = self.data[start..end].to_vec();
        self.position = start + size;
        self.counters
            .bytes_read
            .fetch_add(out.len() as u64, Ordering::Relaxed);
        Ok(out)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        let start = self.position.min(self.data.len());
        let end = (start + data.len()).min(self.data.len());
        let n = end - start;
        self.data[start..end].copy_from_slice(&data[..n]);
        self.position = start + data.len();
        self.counters
            .bytes_written
            .fetch_add(n as u64, Ordering::Relaxed);
        Ok(())
    }
}

/// Wraps an OS file descriptor opened on a raw block device or mount point.
pub struct FileBlockDevice {
    file: Option<File>,
    sector_size: u32,
    sector_count: u64,
    read_only: bool,
    counters: Counters,
}

impl FileBlockDevice {
    /// Opens `path` read-write unless `read_only` is set; if a read-write
    /// open fails with a permission/access error, transparently retries
    /// read-only and flips the internal flag (§4.2).
    pub fn open(path: &Path, sector_size: u32, read_only: bool) -> Result<Self, DeviceError> {
        let (file, read_only) = if read_only {
            (OpenOptions::new().read(true).open(path)?, true)
        } else {
            match OpenOptions::new().read(true).write(true).open(path) {
                Ok(f) => (f, false),
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to open block device read-write, retrying read-only"
                    );
                    (OpenOptions::new().read(true).open(path)?, true)
                }
            }
        };

        let total_bytes = device_size_bytes(&file)?;
        let sector_count = total_bytes / u64::from(sector_size);

        Ok(FileBlockDevice {
            file: Some(file),
            sector_size,
            sector_count,
            read_only,
            counters: Counters::default(),
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn file_mut(&mut self) -> Result<&mut File, DeviceError> {
        self.file.as_mut().ok_or(DeviceError::Unavailable)
    }

    /// Cheap probe for unplug: issues a deliberately invalid ioctl and
    /// treats ENODEV as unavailable, any other errno (or success) as
    /// available (§4.2, §9).
    fn available(&self) -> bool {
        let Some(file) = &self.file else {
            return false;
        };
        !matches!(probe_enodev(file), Some(true))
    }

    fn seek(&mut self, sector_offset: u32) -> Result<(), DeviceError> {
        let offset = u64::from(sector_offset) * u64::from(self.sector_size);
        self.file_mut()?.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    fn read(&mut self, size: usize) -> Result<Vec<u8>, DeviceError> {
        let mut buf = vec![0u8; size];
        let file = self.file_mut()?;
        let mut total = 0;
        // Short reads are permitted only at end-of-device (§4.2).
        while total < size {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(total);
        self.counters
            .bytes_read
            .fetch_add(total as u64, Ordering::Relaxed);
        Ok(buf)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        if self.read_only {
            // The protocol has no way to surface this to a client that
            // already sent the data (§4.2, §7) — discard and log.
            warn!("write to read-only block device discarded");
            return Ok(());
        }
        self.file_mut()?.write_all(data)?;
        self.counters
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn close(&mut self) {
        self.file = None;
    }
}

#[cfg(unix)]
fn device_size_bytes(file: &File) -> Result<u64, DeviceError> {
    use std::os::unix::io::AsRawFd;

    #[cfg(target_os = "linux")]
    const BLKGETSIZE64: libc::c_ulong = 0x80081272;

    #[cfg(target_os = "linux")]
    {
        let mut size: u64 = 0;
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
        if ret == 0 {
            return Ok(size);
        }
    }

    #[cfg(target_os = "macos")]
    {
        const DKIOCGETBLOCKSIZE: libc::c_ulong = 0x40046418;
        const DKIOCGETBLOCKCOUNT: libc::c_ulong = 0x40046419;

        let mut block_size: u32 = 0;
        let mut block_count: u64 = 0;
        let ok = unsafe {
            libc::ioctl(file.as_raw_fd(), DKIOCGETBLOCKSIZE, &mut block_size) == 0
                && libc::ioctl(file.as_raw_fd(), DKIOCGETBLOCKCOUNT, &mut block_count) == 0
        };
        if ok {
            return Ok(u64::from(block_size) * block_count);
        }
    }

    // Not a raw device node (e.g. a regular file used to back tests) —
    // fall back to its metadata length.
    Ok(file.metadata()?.len())
}

#[cfg(not(unix))]
fn device_size_bytes(file: &File) -> Result<u64, DeviceError> {
    Ok(file.metadata()?.len())
}

#[cfg(unix)]
fn probe_enodev(file: &File) -> Option<bool> {
    use std::os::unix::io::AsRawFd;

    let ret = unsafe { libc::ioctl(file.as_raw_fd(), -1i32 as libc::c_ulong) };
    if ret == -1 {
        let err = io::Error::last_os_error();
        return Some(err.raw_os_error() == Some(libc::ENODEV));
    }
    Some(false)
}

#[cfg(not(unix))]
fn probe_enodev(_file: &File) -> Option<bool> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_device_defaults() {
        let dev = MemoryBlockDevice::new(512);
        assert_eq!(dev.sector_size, 512);
        assert_eq!(dev.sector_count, DEFAULT_MEMORY_DEVICE_SIZE / 512);
        assert!(dev.available());
    }

    #[test]
    fn memory_device_write_then_read_round_trips() {
        let mut dev = BlockDevice::Memory(MemoryBlockDevice::new(512));
        dev.seek(3).unwrap();
        let payload: Vec<u8> = (0..512u32).map(|b| b as u8).collect();
        dev.write(&payload).unwrap();

        dev.seek(3).unwrap();
        let read_back = dev.read(512).unwrap();
        assert_eq!(read_back, payload);

        let (read, written) = dev.status();
        assert_eq!(read, 512);
        assert_eq!(written, 512);
    }

    #[test]
    fn memory_device_read_past_end_short_reads() {
        let mut dev = MemoryBlockDevice::with_capacity(512, 1024);
        dev.seek(1).unwrap();
        let out = dev.read(1024).unwrap();
        assert_eq!(out.len(), 512);
    }

    #[test]
    fn counters_are_shared_without_locking() {
        let dev = MemoryBlockDevice::new(512);
        let counters = dev.counters.clone();
        let mut dev = BlockDevice::Memory(dev);
        dev.write(&[1, 2, 3, 4]).unwrap();
        let (_, written) = counters.snapshot();
        assert_eq!(written, 4);
    }
}
