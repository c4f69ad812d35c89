//! File-offset resolution shared by the draft and committed images.

use anyhow::{Context, Result, bail};
use qfs_block::BlockIo;
use qfs_extent::{DauGeometry, Location, direct_map, translate};
use qfs_ondisk::{ExtentPtr, IndirectBlock, Inode, InodeStatus, Superblock};
use qfs_types::{DEV_BSIZE, Ordinal};

pub(crate) const BSIZE: u64 = DEV_BSIZE as u64;

/// Device block holding a file offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Mapped {
    pub ord: Ordinal,
    pub block: u64,
    /// Bytes from the offset to the end of its data block.
    pub left: u64,
}

fn indirect_size(sb: &Superblock) -> usize {
    usize::try_from(sb.lg_meta).unwrap_or(usize::MAX)
}

/// Follow `location` to its data pointer. Holes anywhere on the path yield
/// `None`.
pub(crate) fn pointer(
    sb: &Superblock,
    io: &BlockIo,
    inode: &Inode,
    location: &Location,
) -> Result<Option<ExtentPtr>> {
    let mut ptr = inode.extents[location.slot()];
    if let Location::Indirect { level, .. } = location {
        for (depth, pos) in location.path().iter().enumerate() {
            if ptr.is_hole() {
                return Ok(None);
            }
            let bytes = io.read(ptr.ord, u64::from(ptr.block), indirect_size(sb))?;
            let block = IndirectBlock::parse_from_bytes(&bytes)?;
            let expected = u32::from(*level) - u32::try_from(depth)?;
            if !block.header.matches(inode.id, expected) {
                bail!(
                    "indirect block {} on ordinal {} is not level {expected} of inode {}",
                    ptr.block,
                    ptr.ord,
                    inode.id
                );
            }
            ptr = *block
                .entries
                .get(usize::try_from(*pos)?)
                .context("indirect position out of range")?;
        }
    }
    Ok((!ptr.is_hole()).then_some(ptr))
}

pub(crate) fn resolve(
    sb: &Superblock,
    io: &BlockIo,
    inode: &Inode,
    offset: u64,
) -> Result<Option<Mapped>> {
    if inode.status.contains(InodeStatus::DIRECT_MAP) {
        let base = inode.extents[0];
        return Ok(
            direct_map(u64::from(base.block), inode.dm_span, offset).map(|block| Mapped {
                ord: base.ord,
                block,
                left: inode.dm_span * BSIZE - offset,
            }),
        );
    }
    let geom = DauGeometry::for_inode(sb, inode);
    let t = translate(&geom, offset)?;
    Ok(pointer(sb, io, inode, &t.location)?.map(|ptr| Mapped {
        ord: ptr.ord,
        block: u64::from(ptr.block) + t.within / BSIZE,
        left: t.unit - t.within,
    }))
}

/// Read `len` bytes of file data; holes read as zeros.
pub(crate) fn read_file(
    sb: &Superblock,
    io: &BlockIo,
    inode: &Inode,
    offset: u64,
    len: usize,
) -> Result<Vec<u8>> {
    let mut out = vec![0_u8; len];
    let mut done = 0_usize;
    while done < len {
        let pos = offset + done as u64;
        let in_block = pos % BSIZE;
        let Some(mapped) = resolve(sb, io, inode, pos)? else {
            let skip = usize::try_from(BSIZE - in_block)?.min(len - done);
            done += skip;
            continue;
        };
        let take = usize::try_from(mapped.left)?.min(len - done);
        let span = usize::try_from((in_block + take as u64).div_ceil(BSIZE) * BSIZE)?;
        let bytes = io.read(mapped.ord, mapped.block, span)?;
        let start = usize::try_from(in_block)?;
        out[done..done + take].copy_from_slice(&bytes[start..start + take]);
        done += take;
    }
    Ok(out)
}

/// Overwrite file data in place. Every touched offset must be mapped.
pub(crate) fn write_file(
    sb: &Superblock,
    io: &BlockIo,
    inode: &Inode,
    offset: u64,
    data: &[u8],
) -> Result<()> {
    let mut done = 0_usize;
    while done < data.len() {
        let pos = offset + done as u64;
        let mapped = resolve(sb, io, inode, pos)?
            .with_context(|| format!("offset {pos} of inode {} is a hole", inode.id))?;
        let in_block = pos % BSIZE;
        let take = usize::try_from(mapped.left)?.min(data.len() - done);
        let span = usize::try_from((in_block + take as u64).div_ceil(BSIZE) * BSIZE)?;
        let mut bytes = io.read(mapped.ord, mapped.block, span)?;
        let start = usize::try_from(in_block)?;
        bytes[start..start + take].copy_from_slice(&data[done..done + take]);
        io.write(mapped.ord, mapped.block, &bytes)?;
        done += take;
    }
    Ok(())
}
