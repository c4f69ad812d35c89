use qfs_error::{QfsError, Result};
use std::collections::{HashMap, VecDeque};
use std::os::unix::fs::FileExt;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;

const PAGE_SIZE: usize = 64 * 1024;
const DEFAULT_RESIDENT_PAGES: usize = 256;

#[derive(Debug)]
struct Page {
    data: Vec<u8>,
    dirty: bool,
}

/// Growable byte store backed by an unlinked-on-drop temporary file.
///
/// Holds filesystem-scale working sets (computed bitmaps, the duplicate
/// ledger) without keeping them resident: at most a fixed number of
/// 64 KiB pages are cached in memory, the rest live in the scratch file.
/// The file is removed when the region is dropped, including on
/// cancellation.
#[derive(Debug)]
pub struct ScratchRegion {
    file: NamedTempFile,
    len: u64,
    pages: HashMap<u64, Page>,
    /// Front is most recently used.
    lru: VecDeque<u64>,
    max_pages: usize,
}

fn map_io(err: std::io::Error) -> QfsError {
    if err.kind() == std::io::ErrorKind::StorageFull {
        QfsError::NoSpace
    } else {
        QfsError::Io(err)
    }
}

impl ScratchRegion {
    /// Create a zero-filled region of `len` bytes in `dir` (the system
    /// temporary directory when `None`).
    pub fn create(dir: Option<&Path>, len: u64) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("qfsck.");
        let file = match dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .map_err(map_io)?;
        file.as_file().set_len(len).map_err(map_io)?;
        debug!(path = %file.path().display(), len, "scratch region created");
        Ok(Self {
            file,
            len,
            pages: HashMap::new(),
            lru: VecDeque::new(),
            max_pages: DEFAULT_RESIDENT_PAGES,
        })
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Extend the region; new bytes read as zero.
    pub fn grow(&mut self, new_len: u64) -> Result<()> {
        if new_len > self.len {
            self.file.as_file().set_len(new_len).map_err(map_io)?;
            self.len = new_len;
        }
        Ok(())
    }

    fn check(&self, offset: u64, len: usize) -> Result<()> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| QfsError::Format("scratch range overflows u64".into()))?;
        if end > self.len {
            return Err(QfsError::Format(format!(
                "scratch access out of bounds: offset={offset} len={len} region={}",
                self.len
            )));
        }
        Ok(())
    }

    fn page(&mut self, index: u64) -> Result<&mut Page> {
        if !self.pages.contains_key(&index) {
            if self.pages.len() >= self.max_pages {
                self.evict_one()?;
            }
            let start = index * PAGE_SIZE as u64;
            let avail = usize::try_from(self.len.saturating_sub(start).min(PAGE_SIZE as u64))
                .unwrap_or(PAGE_SIZE);
            let mut data = vec![0_u8; PAGE_SIZE];
            self.file
                .as_file()
                .read_exact_at(&mut data[..avail], start)
                .map_err(map_io)?;
            self.pages.insert(index, Page { data, dirty: false });
        } else if let Some(pos) = self.lru.iter().position(|p| *p == index) {
            let _ = self.lru.remove(pos);
        }
        self.lru.push_front(index);
        self.pages
            .get_mut(&index)
            .ok_or_else(|| QfsError::Format("scratch page vanished".into()))
    }

    fn write_page(&self, index: u64, page: &Page) -> Result<()> {
        let start = index * PAGE_SIZE as u64;
        let avail = usize::try_from(self.len.saturating_sub(start).min(PAGE_SIZE as u64))
            .unwrap_or(PAGE_SIZE);
        self.file
            .as_file()
            .write_all_at(&page.data[..avail], start)
            .map_err(map_io)
    }

    fn evict_one(&mut self) -> Result<()> {
        let Some(victim) = self.lru.pop_back() else {
            return Ok(());
        };
        if let Some(page) = self.pages.remove(&victim) {
            if page.dirty {
                self.write_page(victim, &page)?;
            }
        }
        Ok(())
    }

    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        let mut done = 0_usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let index = pos / PAGE_SIZE as u64;
            let within = usize::try_from(pos % PAGE_SIZE as u64).unwrap_or(0);
            let take = (PAGE_SIZE - within).min(buf.len() - done);
            let page = self.page(index)?;
            buf[done..done + take].copy_from_slice(&page.data[within..within + take]);
            done += take;
        }
        Ok(())
    }

    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        let mut done = 0_usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let index = pos / PAGE_SIZE as u64;
            let within = usize::try_from(pos % PAGE_SIZE as u64).unwrap_or(0);
            let take = (PAGE_SIZE - within).min(data.len() - done);
            let page = self.page(index)?;
            page.data[within..within + take].copy_from_slice(&data[done..done + take]);
            page.dirty = true;
            done += take;
        }
        Ok(())
    }

    pub fn read_u32(&mut self, offset: u64) -> Result<u32> {
        let mut raw = [0_u8; 4];
        self.read_at(offset, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    pub fn write_u32(&mut self, offset: u64, value: u32) -> Result<()> {
        self.write_at(offset, &value.to_le_bytes())
    }

    /// Fill `[offset, offset + len)` with `byte`.
    pub fn fill(&mut self, offset: u64, len: u64, byte: u8) -> Result<()> {
        let chunk = vec![byte; PAGE_SIZE];
        let mut done = 0_u64;
        while done < len {
            let take = (len - done).min(PAGE_SIZE as u64);
            let take = usize::try_from(take).unwrap_or(PAGE_SIZE);
            self.write_at(offset + done, &chunk[..take])?;
            done += take as u64;
        }
        Ok(())
    }

    /// Write every dirty resident page to the scratch file.
    pub fn flush(&mut self) -> Result<()> {
        let dirty: Vec<u64> = self
            .pages
            .iter()
            .filter(|(_, p)| p.dirty)
            .map(|(i, _)| *i)
            .collect();
        for index in dirty {
            if let Some(page) = self.pages.remove(&index) {
                self.write_page(index, &page)?;
                self.pages.insert(
                    index,
                    Page {
                        data: page.data,
                        dirty: false,
                    },
                );
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn with_resident_limit(mut self, pages: usize) -> Self {
        self.max_pages = pages.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_round_trips_across_pages() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut region = ScratchRegion::create(Some(dir.path()), 3 * PAGE_SIZE as u64)
            .expect("create")
            .with_resident_limit(1);
        let data: Vec<u8> = (0..PAGE_SIZE + 100).map(|i| (i % 251) as u8).collect();
        region.write_at(PAGE_SIZE as u64 - 50, &data).expect("write");
        region.write_u32(0, 0xDEAD_BEEF).expect("write u32");

        let mut back = vec![0_u8; data.len()];
        region.read_at(PAGE_SIZE as u64 - 50, &mut back).expect("read");
        assert_eq!(back, data);
        assert_eq!(region.read_u32(0).expect("read u32"), 0xDEAD_BEEF);
    }

    #[test]
    fn scratch_file_removed_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let region = ScratchRegion::create(Some(dir.path()), 1024).expect("create");
        let path = region.path().to_path_buf();
        assert!(path.exists());
        drop(region);
        assert!(!path.exists());
    }

    #[test]
    fn grow_and_bounds() {
        let mut region = ScratchRegion::create(None, 16).expect("create");
        assert!(region.write_at(12, &[0_u8; 8]).is_err());
        region.grow(PAGE_SIZE as u64 * 2).expect("grow");
        region.fill(10, 100, 0xFF).expect("fill");
        let mut buf = [0_u8; 4];
        region.read_at(108, &mut buf).expect("read");
        assert_eq!(buf, [0xFF, 0xFF, 0, 0]);
    }

    #[test]
    fn missing_scratch_dir_errors() {
        let err = ScratchRegion::create(Some(Path::new("/nonexistent/qfsck-scratch")), 16);
        assert!(err.is_err());
    }
}
