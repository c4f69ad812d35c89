use crate::ByteDevice;
use crate::cache::MruCache;
use parking_lot::Mutex;
use qfs_error::{QfsError, Result};
use qfs_types::{DEV_BSIZE, Ordinal};
use std::sync::Arc;
use tracing::{debug, trace};

/// Striping of a group leader: `width` ordinals starting at the leader,
/// `unit_blocks` device blocks per member before moving to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeLayout {
    pub width: u16,
    pub unit_blocks: u64,
}

impl StripeLayout {
    const PLAIN: Self = Self {
        width: 1,
        unit_blocks: 1,
    };

    /// Map a logical group block to (member index, physical block).
    #[must_use]
    pub fn locate(self, block: u64) -> (u16, u64) {
        if self.width <= 1 {
            return (0, block);
        }
        let width = u64::from(self.width);
        let chunk = block / self.unit_blocks;
        let member = u16::try_from(chunk % width).unwrap_or(0);
        (member, (chunk / width) * self.unit_blocks + block % self.unit_blocks)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStats {
    pub reads: u64,
    pub cache_hits: u64,
    pub writes: u64,
    pub large_flushes: u64,
}

#[derive(Debug)]
struct LargeBlock {
    ord: Ordinal,
    block: u64,
    data: Vec<u8>,
    dirty: bool,
}

impl LargeBlock {
    fn overlaps(&self, ord: Ordinal, block: u64, end: u64) -> bool {
        let own_end = self.block + (self.data.len() as u64).div_ceil(u64::from(DEV_BSIZE));
        self.ord == ord && self.block < end && block < own_end
    }
}

/// Ordinal-indexed block I/O.
///
/// All addresses are device blocks of [`DEV_BSIZE`] bytes. `read`/`write`
/// take logical addresses (split across stripe members for group leaders);
/// `read_device`/`write_device` address one physical device and are used
/// for superblocks, bitmaps and other system-area structures.
pub struct BlockIo {
    devices: Vec<Option<Arc<dyn ByteDevice>>>,
    stripes: Vec<StripeLayout>,
    cache: Mutex<MruCache>,
    current: Mutex<Option<LargeBlock>>,
    stats: Mutex<IoStats>,
}

impl std::fmt::Debug for BlockIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockIo")
            .field("ordinals", &self.devices.len())
            .field("stats", &*self.stats.lock())
            .finish_non_exhaustive()
    }
}

impl BlockIo {
    /// `devices[i]` is ordinal `i`; `None` marks a device that is down.
    #[must_use]
    pub fn new(devices: Vec<Option<Arc<dyn ByteDevice>>>) -> Self {
        let stripes = vec![StripeLayout::PLAIN; devices.len()];
        Self {
            devices,
            stripes,
            cache: Mutex::new(MruCache::default()),
            current: Mutex::new(None),
            stats: Mutex::new(IoStats::default()),
        }
    }

    pub fn set_stripe(&mut self, leader: Ordinal, layout: StripeLayout) {
        if let Some(slot) = self.stripes.get_mut(leader.index()) {
            *slot = layout;
        }
    }

    #[must_use]
    pub fn ordinal_count(&self) -> usize {
        self.devices.len()
    }

    #[must_use]
    pub fn is_present(&self, ord: Ordinal) -> bool {
        self.devices.get(ord.index()).is_some_and(Option::is_some)
    }

    /// Device length in device blocks.
    #[must_use]
    pub fn device_blocks(&self, ord: Ordinal) -> u64 {
        self.devices
            .get(ord.index())
            .and_then(Option::as_ref)
            .map_or(0, |d| d.len_bytes() / u64::from(DEV_BSIZE))
    }

    #[must_use]
    pub fn stats(&self) -> IoStats {
        *self.stats.lock()
    }

    fn device(&self, ord: Ordinal) -> Result<&Arc<dyn ByteDevice>> {
        self.devices
            .get(ord.index())
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                QfsError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("ordinal {ord} is not available"),
                ))
            })
    }

    fn end_block(block: u64, len: usize) -> u64 {
        block + (len as u64).div_ceil(u64::from(DEV_BSIZE))
    }

    // ── Physical access ─────────────────────────────────────────────────

    /// Read `buf.len()` bytes from one physical device, through the cache.
    pub fn read_device_into(&self, ord: Ordinal, block: u64, buf: &mut [u8]) -> Result<()> {
        self.flush_current_if_overlapping(ord, block, Self::end_block(block, buf.len()))?;
        self.stats.lock().reads += 1;
        if self.cache.lock().lookup(ord, block, buf) {
            self.stats.lock().cache_hits += 1;
            return Ok(());
        }
        let offset = block * u64::from(DEV_BSIZE);
        self.device(ord)?.read_exact_at(offset, buf)?;
        trace!(ord = ord.0, block, len = buf.len(), "device read");
        self.cache.lock().insert(ord, block, buf);
        Ok(())
    }

    pub fn read_device(&self, ord: Ordinal, block: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; len];
        self.read_device_into(ord, block, &mut buf)?;
        Ok(buf)
    }

    /// Write to one physical device, invalidating overlapping cache runs.
    pub fn write_device(&self, ord: Ordinal, block: u64, data: &[u8]) -> Result<()> {
        let end = Self::end_block(block, data.len());
        self.cache.lock().invalidate(ord, block, end);
        {
            let mut current = self.current.lock();
            if current.as_ref().is_some_and(|c| c.overlaps(ord, block, end)) {
                if let Some(stale) = current.take() {
                    if stale.dirty {
                        self.device(stale.ord)?
                            .write_all_at(stale.block * u64::from(DEV_BSIZE), &stale.data)?;
                    }
                }
            }
        }
        self.stats.lock().writes += 1;
        self.device(ord)?
            .write_all_at(block * u64::from(DEV_BSIZE), data)?;
        trace!(ord = ord.0, block, len = data.len(), "device write");
        Ok(())
    }

    // ── Logical (stripe-aware) access ───────────────────────────────────

    /// Visit each physical piece of a logical range as
    /// (member ordinal, physical block, byte range within the request).
    fn for_each_piece(
        &self,
        ord: Ordinal,
        block: u64,
        len: usize,
        mut visit: impl FnMut(Ordinal, u64, std::ops::Range<usize>) -> Result<()>,
    ) -> Result<()> {
        let layout = self
            .stripes
            .get(ord.index())
            .copied()
            .unwrap_or(StripeLayout::PLAIN);
        if layout.width <= 1 {
            return visit(ord, block, 0..len);
        }
        let bsize = DEV_BSIZE as usize;
        let mut done = 0_usize;
        let mut logical = block;
        while done < len {
            let within = logical % layout.unit_blocks;
            let unit_left = usize::try_from((layout.unit_blocks - within) * u64::from(DEV_BSIZE))
                .unwrap_or(usize::MAX);
            let piece = unit_left.min(len - done);
            let (member, physical) = layout.locate(logical);
            visit(Ordinal(ord.0 + member), physical, done..done + piece)?;
            done += piece;
            logical += (piece as u64).div_ceil(bsize as u64);
        }
        Ok(())
    }

    pub fn read_into(&self, ord: Ordinal, block: u64, buf: &mut [u8]) -> Result<()> {
        let len = buf.len();
        self.for_each_piece(ord, block, len, |member, physical, range| {
            self.read_device_into(member, physical, &mut buf[range])
        })
    }

    /// Read `len` bytes at a logical block address.
    pub fn read(&self, ord: Ordinal, block: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; len];
        self.read_into(ord, block, &mut buf)?;
        Ok(buf)
    }

    pub fn write(&self, ord: Ordinal, block: u64, data: &[u8]) -> Result<()> {
        self.for_each_piece(ord, block, data.len(), |member, physical, range| {
            self.write_device(member, physical, &data[range])
        })
    }

    // ── Current large block ─────────────────────────────────────────────

    fn flush_current_if_overlapping(&self, ord: Ordinal, block: u64, end: u64) -> Result<()> {
        let mut current = self.current.lock();
        if let Some(large) = current.as_mut() {
            if large.dirty && large.overlaps(ord, block, end) {
                self.device(large.ord)?
                    .write_all_at(large.block * u64::from(DEV_BSIZE), &large.data)?;
                large.dirty = false;
                self.stats.lock().large_flushes += 1;
            }
        }
        Ok(())
    }

    /// Run `f` over the large block at a physical address, loading it into
    /// the single current-large-block buffer first. The previous buffer is
    /// flushed if dirty before being repointed. When `f` returns `true`
    /// the buffer is marked dirty.
    pub fn with_large_block<R>(
        &self,
        ord: Ordinal,
        block: u64,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> Result<(R, bool)>,
    ) -> Result<R> {
        let mut current = self.current.lock();
        let hit = current
            .as_ref()
            .is_some_and(|c| c.ord == ord && c.block == block && c.data.len() == len);
        if !hit {
            if let Some(old) = current.take() {
                if old.dirty {
                    self.device(old.ord)?
                        .write_all_at(old.block * u64::from(DEV_BSIZE), &old.data)?;
                    self.stats.lock().large_flushes += 1;
                }
            }
            let mut data = vec![0_u8; len];
            self.device(ord)?
                .read_exact_at(block * u64::from(DEV_BSIZE), &mut data)?;
            *current = Some(LargeBlock {
                ord,
                block,
                data,
                dirty: false,
            });
        }
        let Some(large) = current.as_mut() else {
            return Err(QfsError::Format("large block buffer vanished".into()));
        };
        let (result, dirtied) = f(&mut large.data)?;
        if dirtied {
            large.dirty = true;
            self.cache
                .lock()
                .invalidate(ord, block, Self::end_block(block, len));
        }
        Ok(result)
    }

    /// Write back the current large block if dirty, then sync every device.
    pub fn flush(&self) -> Result<()> {
        {
            let mut current = self.current.lock();
            if let Some(large) = current.as_mut() {
                if large.dirty {
                    self.device(large.ord)?
                        .write_all_at(large.block * u64::from(DEV_BSIZE), &large.data)?;
                    large.dirty = false;
                    self.stats.lock().large_flushes += 1;
                }
            }
        }
        for device in self.devices.iter().flatten() {
            device.sync()?;
        }
        let stats = self.stats();
        debug!(
            reads = stats.reads,
            hits = stats.cache_hits,
            writes = stats.writes,
            large_flushes = stats.large_flushes,
            "block I/O flushed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryByteDevice;

    fn io_with(devs: &[MemoryByteDevice]) -> BlockIo {
        BlockIo::new(
            devs.iter()
                .map(|d| Some(Arc::new(d.clone()) as Arc<dyn ByteDevice>))
                .collect(),
        )
    }

    #[test]
    fn cached_read_sees_later_write() {
        let dev = MemoryByteDevice::new(64 * 1024);
        let io = io_with(std::slice::from_ref(&dev));
        io.write(Ordinal(0), 4, &[1_u8; 1024]).expect("write");
        assert_eq!(io.read(Ordinal(0), 4, 1024).expect("read"), vec![1_u8; 1024]);
        assert_eq!(io.read(Ordinal(0), 4, 1024).expect("read"), vec![1_u8; 1024]);
        assert_eq!(io.stats().cache_hits, 1);
        io.write(Ordinal(0), 4, &[2_u8; 1024]).expect("rewrite");
        assert_eq!(io.read(Ordinal(0), 4, 1024).expect("read"), vec![2_u8; 1024]);
    }

    #[test]
    fn missing_ordinal_is_io_error() {
        let dev = MemoryByteDevice::new(4096);
        let io = BlockIo::new(vec![Some(Arc::new(dev) as Arc<dyn ByteDevice>), None]);
        assert!(!io.is_present(Ordinal(1)));
        assert!(matches!(io.read(Ordinal(1), 0, 1024), Err(QfsError::Io(_))));
    }

    #[test]
    fn large_block_flushed_on_repoint_and_visible_to_reads() {
        let dev = MemoryByteDevice::new(64 * 1024);
        let io = io_with(std::slice::from_ref(&dev));
        io.with_large_block(Ordinal(0), 16, 4096, |buf| {
            buf[0] = 0xAB;
            Ok(((), true))
        })
        .expect("modify");
        assert_eq!(dev.snapshot()[16 * 1024], 0, "not yet flushed");
        // Overlapping read flushes the dirty buffer first.
        assert_eq!(io.read(Ordinal(0), 16, 1024).expect("read")[0], 0xAB);

        io.with_large_block(Ordinal(0), 16, 4096, |buf| {
            buf[1] = 0xCD;
            Ok(((), true))
        })
        .expect("modify again");
        io.with_large_block(Ordinal(0), 32, 4096, |_| Ok(((), false)))
            .expect("repoint");
        assert_eq!(dev.snapshot()[16 * 1024 + 1], 0xCD);
    }

    #[test]
    fn stripe_reads_split_across_members() {
        let a = MemoryByteDevice::new(64 * 1024);
        let b = MemoryByteDevice::new(64 * 1024);
        let mut io = io_with(&[a.clone(), b.clone()]);
        io.set_stripe(
            Ordinal(0),
            StripeLayout {
                width: 2,
                unit_blocks: 4,
            },
        );
        let data: Vec<u8> = (0..8 * 1024).map(|i| (i / 1024) as u8).collect();
        io.write(Ordinal(0), 8, &data).expect("striped write");

        // Logical 8..12 -> chunk 2 -> member 0 physical 4..8;
        // logical 12..16 -> chunk 3 -> member 1 physical 4..8.
        assert_eq!(a.snapshot()[4 * 1024], 0);
        assert_eq!(b.snapshot()[4 * 1024], 4);
        assert_eq!(io.read(Ordinal(0), 8, 8 * 1024).expect("read"), data);
    }

    #[test]
    fn stripe_locate() {
        let layout = StripeLayout {
            width: 3,
            unit_blocks: 16,
        };
        assert_eq!(layout.locate(0), (0, 0));
        assert_eq!(layout.locate(17), (1, 1));
        assert_eq!(layout.locate(48), (0, 16));
    }
}
