//! The inode table: a file (inode 1) whose data blocks hold every inode
//! slot. Slots are reached through the single current-large-block buffer
//! of [`BlockIo`], so a sequential scan reads each table block once.

use qfs_block::BlockIo;
use qfs_error::{QfsError, Result};
use qfs_extent::{DauGeometry, Location, translate};
use qfs_ondisk::{ExtensionInode, ExtentPtr, IndirectBlock, Inode, InodeStatus, Superblock};
use qfs_types::{DEV_BSIZE, INODE_SIZE, InodeId, InodeNumber, Ordinal};
use tracing::debug;

/// One physically contiguous piece of the table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TableRun {
    /// Byte offset within the table file.
    start: u64,
    ord: Ordinal,
    block: u64,
    len: usize,
}

#[derive(Debug)]
pub(crate) struct InodeTable {
    runs: Vec<TableRun>,
    count: u32,
}

fn table_error(detail: impl Into<String>) -> QfsError {
    QfsError::InodeTable(detail.into())
}

impl InodeTable {
    /// Read inode 1 from its fixed superblock location and map every table
    /// block. Any defect here is fatal.
    pub(crate) fn load(sb: &Superblock, io: &BlockIo) -> Result<(Self, Inode)> {
        let raw = io.read_device(sb.inodes_ord, u64::from(sb.inodes_block), INODE_SIZE)?;
        let table = Inode::parse_from_bytes(&raw).map_err(|e| table_error(format!("inode 1: {e}")))?;
        if table.id.ino != InodeNumber::INODES {
            return Err(table_error(format!(
                "slot at ordinal {} block {} holds inode {}",
                sb.inodes_ord, sb.inodes_block, table.id
            )));
        }
        if table.file_type() != qfs_ondisk::FileType::Regular
            || !table.status.contains(InodeStatus::META)
            || table.status.contains(InodeStatus::DIRECT_MAP)
        {
            return Err(table_error("inode 1 is not a metadata file"));
        }
        if table.extents[0] != ExtentPtr::new(sb.inodes_block, sb.inodes_ord.0) {
            return Err(table_error(format!(
                "inode 1 starts at {:?}, superblock says block {} ordinal {}",
                table.extents[0], sb.inodes_block, sb.inodes_ord
            )));
        }
        let count = u32::try_from(table.size / INODE_SIZE as u64)
            .map_err(|_| table_error(format!("table size {} too large", table.size)))?;
        if count < InodeNumber::FIRST_USER.0 {
            return Err(table_error(format!("table holds only {count} slots")));
        }

        let geom = DauGeometry::for_inode(sb, &table);
        let mut runs = Vec::new();
        let mut offset = 0_u64;
        while offset < table.size {
            let t = translate(&geom, offset)?;
            let ptr = follow(sb, io, &table, &t.location)?;
            if ptr.is_hole() {
                return Err(table_error(format!("hole at table offset {offset}")));
            }
            let striped = sb.device(ptr.ord).is_none_or(|e| e.num_group != 1);
            if striped {
                return Err(table_error(format!(
                    "table block on ordinal {} which is not a plain device",
                    ptr.ord
                )));
            }
            let len = (t.unit - t.within).min(table.size - offset);
            runs.push(TableRun {
                start: offset,
                ord: ptr.ord,
                block: u64::from(ptr.block) + t.within / u64::from(DEV_BSIZE),
                len: usize::try_from(len).map_err(|_| table_error("table run too large"))?,
            });
            offset += len;
        }
        debug!(count, runs = runs.len(), "inode table mapped");
        Ok((Self { runs, count }, table))
    }

    pub(crate) fn count(&self) -> u32 {
        self.count
    }

    fn locate(&self, ino: u32) -> Result<(TableRun, usize)> {
        if ino == 0 || ino > self.count {
            return Err(table_error(format!("inode {ino} outside the table")));
        }
        let offset = u64::from(ino - 1) * INODE_SIZE as u64;
        let idx = self.runs.partition_point(|r| r.start <= offset);
        let run = self.runs[idx.saturating_sub(1)];
        let within = usize::try_from(offset - run.start).map_err(|_| table_error("slot offset"))?;
        if within + INODE_SIZE > run.len {
            return Err(table_error(format!("inode {ino} straddles a table block")));
        }
        Ok((run, within))
    }

    pub(crate) fn read_slot(&self, io: &BlockIo, ino: u32) -> Result<Vec<u8>> {
        let (run, within) = self.locate(ino)?;
        io.with_large_block(run.ord, run.block, run.len, |buf| {
            Ok((buf[within..within + INODE_SIZE].to_vec(), false))
        })
    }

    pub(crate) fn write_slot(&self, io: &BlockIo, ino: u32, bytes: &[u8]) -> Result<()> {
        let (run, within) = self.locate(ino)?;
        if bytes.len() != INODE_SIZE {
            return Err(QfsError::Format(format!("inode slot of {} bytes", bytes.len())));
        }
        io.with_large_block(run.ord, run.block, run.len, |buf| {
            buf[within..within + INODE_SIZE].copy_from_slice(bytes);
            Ok(((), true))
        })
    }

    /// Parse a slot already known to hold a valid base inode.
    pub(crate) fn read_inode(&self, io: &BlockIo, ino: u32) -> Result<Inode> {
        let raw = self.read_slot(io, ino)?;
        Inode::parse_from_bytes(&raw).map_err(|e| table_error(format!("inode {ino}: {e}")))
    }

    pub(crate) fn read_extension(&self, io: &BlockIo, ino: u32) -> Result<ExtensionInode> {
        let raw = self.read_slot(io, ino)?;
        ExtensionInode::parse_from_bytes(&raw).map_err(|e| table_error(format!("extension {ino}: {e}")))
    }

    pub(crate) fn write_inode(&self, io: &BlockIo, inode: &Inode) -> Result<()> {
        let mut bytes = vec![0_u8; INODE_SIZE];
        inode
            .write_into(&mut bytes)
            .map_err(|e| QfsError::Format(e.to_string()))?;
        self.write_slot(io, inode.id.ino.0, &bytes)
    }

    pub(crate) fn write_extension(&self, io: &BlockIo, ext: &ExtensionInode) -> Result<()> {
        let mut bytes = vec![0_u8; INODE_SIZE];
        ext.write_into(&mut bytes)
            .map_err(|e| QfsError::Format(e.to_string()))?;
        self.write_slot(io, ext.id.ino.0, &bytes)
    }

    /// Zero a slot, keeping its generation for the next allocation.
    pub(crate) fn free_slot(&self, io: &BlockIo, id: InodeId) -> Result<()> {
        self.write_inode(io, &Inode::free(id))
    }
}

/// Resolve a table offset's data pointer, insisting on well-formed
/// indirect blocks.
fn follow(sb: &Superblock, io: &BlockIo, table: &Inode, location: &Location) -> Result<ExtentPtr> {
    let mut ptr = table.extents[location.slot()];
    if let Location::Indirect { level, .. } = location {
        let size = usize::try_from(sb.lg_meta).unwrap_or(usize::MAX);
        for (depth, pos) in location.path().iter().enumerate() {
            if ptr.is_hole() {
                return Ok(ptr);
            }
            let bytes = io.read_device(ptr.ord, u64::from(ptr.block), size)?;
            let block = IndirectBlock::parse_from_bytes(&bytes)
                .map_err(|e| table_error(format!("indirect block {}: {e}", ptr.block)))?;
            let expected = u32::from(*level) - u32::try_from(depth).unwrap_or(u32::MAX);
            if !block.header.matches(table.id, expected) {
                return Err(table_error(format!(
                    "indirect block {} on ordinal {} does not belong to the table",
                    ptr.block, ptr.ord
                )));
            }
            ptr = usize::try_from(*pos)
                .ok()
                .and_then(|p| block.entries.get(p).copied())
                .unwrap_or(ExtentPtr::HOLE);
        }
    }
    Ok(ptr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use qfs_block::ByteDevice;
    use qfs_harness::ImageBuilder;
    use std::sync::Arc;

    fn open(image: &qfs_harness::TestImage) -> BlockIo {
        let devices: Vec<Option<Arc<dyn ByteDevice>>> = image.devices().into_iter().map(Some).collect();
        BlockIo::new(devices)
    }

    #[test]
    fn table_maps_every_slot() {
        let image = ImageBuilder::new().inode_slots(96).format().expect("format").commit().expect("commit");
        let io = open(&image);
        let (table, inode1) = InodeTable::load(image.superblock(), &io).expect("load");
        assert_eq!(inode1.id.ino, InodeNumber::INODES);
        assert_eq!(table.count(), 96);
        let root = table.read_inode(&io, 2).expect("root");
        assert!(root.is_dir());
        let last = table.read_slot(&io, 96).expect("last slot");
        assert_eq!(last.len(), INODE_SIZE);
        assert!(table.read_slot(&io, 97).is_err());
    }

    #[test]
    fn writes_land_in_the_slot() {
        let image = ImageBuilder::new().format().expect("format").commit().expect("commit");
        let io = open(&image);
        let (table, _) = InodeTable::load(image.superblock(), &io).expect("load");
        let mut root = table.read_inode(&io, 2).expect("root");
        root.nlink = 9;
        table.write_inode(&io, &root).expect("write");
        io.flush().expect("flush");
        assert_eq!(image.read_inode(2).expect("read").nlink, 9);
    }

    #[test]
    fn misplaced_table_inode_is_fatal() {
        let mut image = ImageBuilder::new().format().expect("format").commit().expect("commit");
        image
            .update_superblock(|sb| sb.inodes_block += 4)
            .expect("update");
        let io = open(&image);
        let err = InodeTable::load(image.superblock(), &io).expect_err("must fail");
        assert!(matches!(err, QfsError::InodeTable(_)));
    }
}
