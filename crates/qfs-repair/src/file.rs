//! Reading and writing file contents through the extent arrays.
//!
//! Unlike the extent walk these helpers never judge what they find: a
//! broken indirect chain reads as a hole and an unreadable block is
//! reported to the caller, which decides what the damage means.

use qfs_block::BlockIo;
use qfs_dir::{DirEntry, parse_dir_block};
use qfs_error::{QfsError, Result};
use qfs_extent::{DauGeometry, Location, direct_map, translate};
use qfs_ondisk::{ExtentPtr, IndirectBlock, Inode, InodeStatus, Superblock};
use qfs_types::{DEV_BSIZE, DIR_BLK, Ordinal};

const BSIZE: u64 = DEV_BSIZE as u64;

/// Where a file offset lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mapping {
    Mapped {
        ord: Ordinal,
        block: u64,
        /// Bytes from the offset to the end of its data block.
        left: u64,
    },
    Hole,
    /// An indirect block on the path could not be read.
    Unreadable,
}

fn indirect_size(sb: &Superblock) -> usize {
    usize::try_from(sb.lg_meta).unwrap_or(usize::MAX)
}

/// Follow `location` to its data pointer.
fn pointer(sb: &Superblock, io: &BlockIo, inode: &Inode, location: &Location) -> Result<Option<ExtentPtr>> {
    let mut ptr = inode.extents[location.slot()];
    if let Location::Indirect { level, .. } = location {
        for (depth, pos) in location.path().iter().enumerate() {
            if ptr.is_hole() {
                return Ok(Some(ExtentPtr::HOLE));
            }
            let bytes = match io.read(ptr.ord, u64::from(ptr.block), indirect_size(sb)) {
                Ok(bytes) => bytes,
                Err(QfsError::Io(_)) => return Ok(None),
                Err(e) => return Err(e),
            };
            let Ok(block) = IndirectBlock::parse_from_bytes(&bytes) else {
                return Ok(Some(ExtentPtr::HOLE));
            };
            let expected = u32::from(*level) - u32::try_from(depth).unwrap_or(u32::MAX);
            if !block.header.matches(inode.id, expected) {
                return Ok(Some(ExtentPtr::HOLE));
            }
            ptr = usize::try_from(*pos)
                .ok()
                .and_then(|p| block.entries.get(p).copied())
                .unwrap_or(ExtentPtr::HOLE);
        }
    }
    Ok(Some(ptr))
}

pub(crate) fn resolve(sb: &Superblock, io: &BlockIo, inode: &Inode, offset: u64) -> Result<Mapping> {
    if inode.status.contains(InodeStatus::DIRECT_MAP) {
        let base = inode.extents[0];
        return Ok(match direct_map(u64::from(base.block), inode.dm_span, offset) {
            Some(block) => Mapping::Mapped {
                ord: base.ord,
                block,
                left: BSIZE - offset % BSIZE,
            },
            None => Mapping::Hole,
        });
    }
    let geom = DauGeometry::for_inode(sb, inode);
    let t = translate(&geom, offset)?;
    Ok(match pointer(sb, io, inode, &t.location)? {
        None => Mapping::Unreadable,
        Some(ptr) if ptr.is_hole() => Mapping::Hole,
        Some(ptr) => Mapping::Mapped {
            ord: ptr.ord,
            block: u64::from(ptr.block) + t.within / BSIZE,
            left: t.unit - t.within,
        },
    })
}

/// Read `len` bytes at `offset`; holes read as zeros. `None` when any part
/// is unreadable.
pub(crate) fn read_range(
    sb: &Superblock,
    io: &BlockIo,
    inode: &Inode,
    offset: u64,
    len: usize,
) -> Result<Option<Vec<u8>>> {
    let mut out = vec![0_u8; len];
    let mut done = 0_usize;
    while done < len {
        let pos = offset + done as u64;
        let in_block = pos % BSIZE;
        let (ord, block, left) = match resolve(sb, io, inode, pos)? {
            Mapping::Unreadable => return Ok(None),
            Mapping::Hole => {
                done += usize::try_from(BSIZE - in_block)
                    .unwrap_or(usize::MAX)
                    .min(len - done);
                continue;
            }
            Mapping::Mapped { ord, block, left } => (ord, block, left),
        };
        let take = usize::try_from(left).unwrap_or(usize::MAX).min(len - done);
        let span = usize::try_from((in_block + take as u64).div_ceil(BSIZE) * BSIZE)
            .unwrap_or(usize::MAX);
        let bytes = match io.read(ord, block, span) {
            Ok(bytes) => bytes,
            Err(QfsError::Io(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let start = usize::try_from(in_block).unwrap_or(0);
        out[done..done + take].copy_from_slice(&bytes[start..start + take]);
        done += take;
    }
    Ok(Some(out))
}

/// Overwrite file data in place. Every touched offset must be mapped.
pub(crate) fn write_range(sb: &Superblock, io: &BlockIo, inode: &Inode, offset: u64, data: &[u8]) -> Result<()> {
    let mut done = 0_usize;
    while done < data.len() {
        let pos = offset + done as u64;
        let Mapping::Mapped { ord, block, left } = resolve(sb, io, inode, pos)? else {
            return Err(QfsError::Corruption {
                ordinal: inode.extents[0].ord.0,
                block: 0,
                detail: format!("offset {pos} of inode {} is not writable", inode.id),
            });
        };
        let in_block = pos % BSIZE;
        let take = usize::try_from(left).unwrap_or(usize::MAX).min(data.len() - done);
        let span = usize::try_from((in_block + take as u64).div_ceil(BSIZE) * BSIZE)
            .unwrap_or(usize::MAX);
        let mut bytes = io.read(ord, block, span)?;
        let start = usize::try_from(in_block).unwrap_or(0);
        bytes[start..start + take].copy_from_slice(&data[done..done + take]);
        io.write(ord, block, &bytes)?;
        done += take;
    }
    Ok(())
}

/// Offsets of every directory block of `dir`.
pub(crate) fn dir_block_offsets(dir: &Inode) -> impl Iterator<Item = u64> {
    (0..dir.size).step_by(DIR_BLK)
}

/// Find `name` in `dir`, skipping blocks that cannot be read or parsed.
pub(crate) fn lookup(sb: &Superblock, io: &BlockIo, dir: &Inode, name: &[u8]) -> Result<Option<DirEntry>> {
    for offset in dir_block_offsets(dir) {
        let Mapping::Mapped { ord, block, .. } = resolve(sb, io, dir, offset)? else {
            continue;
        };
        let Ok(bytes) = io.read(ord, block, DIR_BLK) else {
            continue;
        };
        let Ok(entries) = parse_dir_block(&bytes) else {
            continue;
        };
        if let Some(entry) = entries.into_iter().find(|e| e.name == name) {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}
