use crate::{BitmapGeometry, bitmap_count_free};
use qfs_block::{BlockIo, ScratchRegion};
use qfs_error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, trace};

/// Result of claiming a block range in the computed bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimOutcome {
    /// Every unit was free and is now allocated.
    Fresh,
    /// At least one unit was already allocated by an earlier claim or the
    /// system area.
    Duplicate,
    /// The range runs past the last unit of the device.
    OutOfRange,
    /// The start is not aligned to the claimed size.
    Misaligned,
}

/// Differences between the computed and the on-disk bitmap, in device
/// blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitmapDiff {
    /// In use but marked free on disk.
    pub lost_allocations: u64,
    /// Marked allocated on disk but unreferenced.
    pub leaked_blocks: u64,
}

impl BitmapDiff {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.lost_allocations == 0 && self.leaked_blocks == 0
    }
}

/// Computed free map of one ordinal, held in scratch storage.
#[derive(Debug)]
pub struct WorkingBitmap {
    geom: BitmapGeometry,
    region: ScratchRegion,
}

impl WorkingBitmap {
    /// A map with every real unit free and every trailing bit allocated.
    pub fn build_free_map(geom: BitmapGeometry, scratch_dir: Option<&Path>) -> Result<Self> {
        let mut region = ScratchRegion::create(scratch_dir, geom.map_bytes())?;
        let full = geom.bits / 8;
        region.fill(0, full, 0xFF)?;
        let rem = geom.bits % 8;
        if rem != 0 {
            region.write_at(full, &[(1_u8 << rem) - 1])?;
        }
        debug!(ord = %geom.ord, bits = geom.bits, unit = geom.unit_blocks, "working bitmap built");
        Ok(Self { geom, region })
    }

    #[must_use]
    pub fn geometry(&self) -> &BitmapGeometry {
        &self.geom
    }

    /// Mark the reserved system area `[0, system_blocks)` allocated.
    pub fn clear_allocated(&mut self, system_blocks: u64) -> Result<()> {
        let units = system_blocks.div_ceil(self.geom.unit_blocks).min(self.geom.bits);
        for unit in 0..units {
            self.put(unit, false)?;
        }
        Ok(())
    }

    fn get(&mut self, unit: u64) -> Result<bool> {
        let mut byte = [0_u8; 1];
        self.region.read_at(unit / 8, &mut byte)?;
        Ok((byte[0] >> (unit % 8)) & 1 == 1)
    }

    fn put(&mut self, unit: u64, free: bool) -> Result<()> {
        let mut byte = [0_u8; 1];
        self.region.read_at(unit / 8, &mut byte)?;
        let mask = 1_u8 << (unit % 8);
        if free {
            byte[0] |= mask;
        } else {
            byte[0] &= !mask;
        }
        self.region.write_at(unit / 8, &byte)
    }

    fn units(&self, block: u64, len_blocks: u64) -> Option<std::ops::Range<u64>> {
        let end = block.checked_add(len_blocks)?;
        let first = block / self.geom.unit_blocks;
        let last = end.div_ceil(self.geom.unit_blocks);
        (len_blocks > 0 && last <= self.geom.bits).then_some(first..last)
    }

    /// Required start alignment of a run: its own length, capped at one
    /// large DAU.
    fn alignment(&self, len_blocks: u64) -> u64 {
        len_blocks.clamp(1, self.geom.large_blocks.max(1))
    }

    /// Whether `block` is a legal start for a run of `len_blocks`.
    #[must_use]
    pub fn is_aligned(&self, block: u64, len_blocks: u64) -> bool {
        block % self.alignment(len_blocks) == 0
    }

    /// Allocate `[block, block + len_blocks)`.
    pub fn claim(&mut self, block: u64, len_blocks: u64) -> Result<ClaimOutcome> {
        if !self.is_aligned(block, len_blocks) {
            return Ok(ClaimOutcome::Misaligned);
        }
        let Some(units) = self.units(block, len_blocks) else {
            return Ok(ClaimOutcome::OutOfRange);
        };
        let mut duplicate = false;
        for unit in units {
            if self.get(unit)? {
                self.put(unit, false)?;
            } else {
                duplicate = true;
            }
        }
        trace!(ord = %self.geom.ord, block, len_blocks, duplicate, "claim");
        Ok(if duplicate {
            ClaimOutcome::Duplicate
        } else {
            ClaimOutcome::Fresh
        })
    }

    /// Free `[block, block + len_blocks)`. Out-of-range runs are ignored.
    pub fn release(&mut self, block: u64, len_blocks: u64) -> Result<()> {
        if let Some(units) = self.units(block, len_blocks) {
            for unit in units {
                self.put(unit, true)?;
            }
        }
        Ok(())
    }

    /// Whether every unit of the run is free.
    pub fn is_free(&mut self, block: u64, len_blocks: u64) -> Result<bool> {
        let Some(units) = self.units(block, len_blocks) else {
            return Ok(false);
        };
        for unit in units {
            if !self.get(unit)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Lowest block of a free run of `len_blocks`, aligned as
    /// [`Self::is_aligned`] requires.
    pub fn find_free(&mut self, len_blocks: u64) -> Result<Option<u64>> {
        let align = self.alignment(len_blocks);
        let limit = self.geom.bits * self.geom.unit_blocks;
        let mut block = 0_u64;
        while block + len_blocks <= limit {
            if self.is_free(block, len_blocks)? {
                return Ok(Some(block));
            }
            block += align;
        }
        Ok(None)
    }

    /// Free space in device blocks.
    pub fn free_blocks(&mut self) -> Result<u64> {
        let bytes = self.to_bytes()?;
        Ok(bitmap_count_free(&bytes, self.geom.bits) * self.geom.unit_blocks)
    }

    /// The whole map as stored on disk.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        let len = usize::try_from(self.region.len()).unwrap_or(usize::MAX);
        let mut bytes = vec![0_u8; len];
        self.region.read_at(0, &mut bytes)?;
        Ok(bytes)
    }

    /// Compare against the on-disk map.
    pub fn diff(&mut self, on_disk: &[u8]) -> Result<BitmapDiff> {
        let computed = self.to_bytes()?;
        let mut diff = BitmapDiff::default();
        let unit = self.geom.unit_blocks;
        for idx in 0..self.geom.bits {
            let want = crate::bitmap_is_free(&computed, idx);
            let have = crate::bitmap_is_free(on_disk, idx);
            match (want, have) {
                (false, true) => diff.lost_allocations += unit,
                (true, false) => diff.leaked_blocks += unit,
                _ => {}
            }
        }
        Ok(diff)
    }

    /// Read the on-disk map this geometry describes.
    pub fn read_on_disk(&self, io: &BlockIo) -> Result<Vec<u8>> {
        let len = usize::try_from(self.geom.map_bytes()).unwrap_or(usize::MAX);
        io.read_device(self.geom.map_ord, self.geom.map_block, len)
    }

    /// Replace the on-disk map with the computed one.
    pub fn write_to(&mut self, io: &BlockIo) -> Result<()> {
        let bytes = self.to_bytes()?;
        io.write_device(self.geom.map_ord, self.geom.map_block, &bytes)?;
        debug!(ord = %self.geom.ord, map_ord = %self.geom.map_ord, "bitmap written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qfs_block::{ByteDevice, MemoryByteDevice};
    use qfs_ondisk::DeviceClass;
    use qfs_types::Ordinal;
    use std::sync::Arc;

    fn geom() -> BitmapGeometry {
        BitmapGeometry {
            ord: Ordinal(0),
            class: DeviceClass::Data,
            width: 1,
            unit_blocks: 4,
            small_blocks: 4,
            large_blocks: 16,
            capacity: 4 * 100,
            bits: 100,
            map_ord: Ordinal(0),
            map_block: 32,
            map_blocks: 1,
        }
    }

    #[test]
    fn claim_detects_duplicates_and_range() {
        let mut map = WorkingBitmap::build_free_map(geom(), None).expect("build");
        map.clear_allocated(48).expect("system");
        assert_eq!(map.claim(40, 4).expect("claim"), ClaimOutcome::Duplicate);
        assert_eq!(map.claim(48, 16).expect("claim"), ClaimOutcome::Fresh);
        assert_eq!(map.claim(60, 4).expect("claim"), ClaimOutcome::Duplicate);
        assert_eq!(map.claim(50, 4).expect("claim"), ClaimOutcome::Misaligned);
        // Large runs start on a large boundary even with small units.
        assert_eq!(map.claim(392, 16).expect("claim"), ClaimOutcome::Misaligned);
        assert_eq!(map.claim(400, 4).expect("claim"), ClaimOutcome::OutOfRange);
        assert_eq!(map.claim(384, 16).expect("claim"), ClaimOutcome::Fresh);
        assert_eq!(map.claim(396, 4).expect("claim"), ClaimOutcome::Duplicate);
    }

    #[test]
    fn free_space_and_release() {
        let mut map = WorkingBitmap::build_free_map(geom(), None).expect("build");
        assert_eq!(map.free_blocks().expect("free"), 400);
        map.clear_allocated(32).expect("system");
        assert_eq!(map.free_blocks().expect("free"), 368);
        map.claim(64, 16).expect("claim");
        assert!(!map.is_free(64, 4).expect("is_free"));
        map.release(64, 16).expect("release");
        assert!(map.is_free(64, 16).expect("is_free"));
        assert_eq!(map.find_free(16).expect("find"), Some(32));
    }

    #[test]
    fn trailing_bits_stay_allocated() {
        let mut map = WorkingBitmap::build_free_map(geom(), None).expect("build");
        let bytes = map.to_bytes().expect("bytes");
        assert_eq!(bytes.len(), 1024);
        assert_eq!(bytes[12], 0x0F);
        assert!(bytes[13..].iter().all(|b| *b == 0));
    }

    #[test]
    fn diff_and_write_back() {
        let mut map = WorkingBitmap::build_free_map(geom(), None).expect("build");
        map.clear_allocated(32).expect("system");
        map.claim(32, 4).expect("claim");

        let dev = MemoryByteDevice::new(64 * 1024);
        let io = BlockIo::new(vec![Some(Arc::new(dev.clone()) as Arc<dyn ByteDevice>)]);
        let mut on_disk = map.to_bytes().expect("bytes");
        // Unit 8 (block 32) free on disk, unit 20 allocated on disk.
        on_disk[1] |= 0x01;
        on_disk[2] &= !0x10;
        let diff = map.diff(&on_disk).expect("diff");
        assert_eq!(
            diff,
            BitmapDiff {
                lost_allocations: 4,
                leaked_blocks: 4
            }
        );

        map.write_to(&io).expect("write");
        io.flush().expect("flush");
        let back = map.read_on_disk(&io).expect("read");
        assert!(map.diff(&back).expect("diff").is_clean());
    }
}
