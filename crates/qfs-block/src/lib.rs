#![forbid(unsafe_code)]
//! Device access layer.
//!
//! Provides the `ByteDevice` trait with file- and memory-backed
//! implementations, the ordinal-indexed [`BlockIo`] front end (16-entry MRU
//! read cache with invalidate-on-write, the current-large-block buffer used
//! for inode-table updates, and stripe-group splitting), and
//! [`ScratchRegion`], the tempfile-backed paged store that holds working
//! bitmaps and the duplicate ledger.

mod cache;
mod io;
mod scratch;

pub use cache::{CACHE_ENTRIES, MruCache};
pub use io::{BlockIo, IoStats, StripeLayout};
pub use scratch::ScratchRegion;

use parking_lot::Mutex;
use qfs_error::{QfsError, Result};
use std::fs::{File, OpenOptions};
use std::ops::Range;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_range(offset: u64, len: usize, device_len: u64, op: &str) -> Result<()> {
    let end = u64::try_from(len)
        .ok()
        .and_then(|len| offset.checked_add(len))
        .ok_or_else(|| QfsError::Format(format!("{op} range overflows u64")))?;
    if end > device_len {
        return Err(QfsError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("{op} out of bounds: offset={offset} len={len} device_len={device_len}"),
        )));
    }
    Ok(())
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// Opened read-only unless repair was requested, so a check-only run can
/// never modify the image.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>, writable: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(QfsError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "device opened read-only",
            )));
        }
        check_range(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device.
///
/// Clones share the same backing bytes, so a test can hand one clone to the
/// engine and inspect the image through another afterwards.
#[derive(Debug, Clone, Default)]
pub struct MemoryByteDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
    faulty: Arc<Mutex<Vec<Range<u64>>>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_bytes(vec![0_u8; len])
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
            faulty: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Make reads touching `range` fail with an I/O error.
    pub fn inject_read_error(&self, range: Range<u64>) {
        self.faulty.lock().push(range);
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset.saturating_add(buf.len() as u64);
        if self
            .faulty
            .lock()
            .iter()
            .any(|bad| bad.start < end && offset < bad.end)
        {
            return Err(QfsError::Io(std::io::Error::other(format!(
                "injected read error at offset {offset}"
            ))));
        }
        let bytes = self.bytes.lock();
        check_range(offset, buf.len(), bytes.len() as u64, "read")?;
        let start = usize::try_from(offset).map_err(|_| QfsError::Format("offset overflow".into()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        check_range(offset, buf.len(), bytes.len() as u64, "write")?;
        let start = usize::try_from(offset).map_err(|_| QfsError::Format("offset overflow".into()))?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
