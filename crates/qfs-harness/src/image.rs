use crate::draft::build_io;
use crate::layout;
use anyhow::{Context, Result, bail};
use qfs_alloc::{BitmapGeometry, bitmap_mark_free};
use qfs_block::{BlockIo, ByteDevice, MemoryByteDevice};
use qfs_dir::{DirEntry, name_hash, parse_dir_block};
use qfs_error::QfsError;
use qfs_ondisk::quota::QUOTA_RECORD_SIZE;
use qfs_ondisk::{
    ExtensionInode, Inode, LogHeader, OptionMask, QuotaDomain, QuotaRecord, Superblock,
};
use qfs_types::{
    BACKUP_SUPERBLK, DIR_BLK, INODE_SIZE, InodeId, InodeNumber, Ordinal, SUPERBLK,
    SUPERBLOCK_SIZE,
};
use std::sync::Arc;

/// A committed image. Every helper reads and patches the device bytes
/// directly, so corruption is invisible until a checker runs.
#[derive(Debug, Clone)]
pub struct TestImage {
    sb: Superblock,
    devices: Vec<MemoryByteDevice>,
}

impl TestImage {
    pub(crate) fn new(sb: Superblock, devices: Vec<MemoryByteDevice>) -> Self {
        Self { sb, devices }
    }

    /// Superblock as last written by the harness.
    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    /// Handles on every device, in ordinal order.
    #[must_use]
    pub fn devices(&self) -> Vec<Arc<dyn ByteDevice>> {
        self.devices
            .iter()
            .map(|d| Arc::new(d.clone()) as Arc<dyn ByteDevice>)
            .collect()
    }

    /// The device at `ord`, for fault injection.
    pub fn device(&self, ord: u16) -> Result<&MemoryByteDevice> {
        self.devices
            .get(usize::from(ord))
            .with_context(|| format!("no device at ordinal {ord}"))
    }

    /// Byte contents of every device.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Vec<u8>> {
        self.devices.iter().map(MemoryByteDevice::snapshot).collect()
    }

    fn io(&self) -> BlockIo {
        build_io(&self.devices, &self.sb)
    }

    // ── Superblocks ─────────────────────────────────────────────────────

    /// Parse the copy at `block` on `ord`.
    pub fn read_superblock_copy(&self, ord: u16, block: u64) -> Result<Superblock> {
        let bytes = self.io().read_device(Ordinal(ord), block, SUPERBLOCK_SIZE)?;
        Ok(Superblock::parse_superblock_region(&bytes)?)
    }

    /// Overwrite one superblock copy with raw bytes.
    pub fn write_superblock_bytes(&self, ord: u16, block: u64, bytes: &[u8]) -> Result<()> {
        let io = self.io();
        io.write_device(Ordinal(ord), block, bytes)?;
        io.flush()?;
        Ok(())
    }

    /// Apply `f` to the superblock and rewrite both copies on every device.
    pub fn update_superblock(&mut self, f: impl FnOnce(&mut Superblock)) -> Result<()> {
        f(&mut self.sb);
        let io = self.io();
        for idx in 0..self.devices.len() {
            let mut copy = self.sb.clone();
            copy.ord = Ordinal(u16::try_from(idx)?);
            let bytes = copy.to_bytes()?;
            io.write_device(copy.ord, SUPERBLK, &bytes)?;
            io.write_device(copy.ord, BACKUP_SUPERBLK, &bytes)?;
        }
        io.flush()?;
        Ok(())
    }

    /// Set option bits on every copy, known or not.
    pub fn set_option_bits(&mut self, bits: u32) -> Result<()> {
        self.update_superblock(|sb| sb.option_mask = OptionMask(sb.option_mask.0 | bits))
    }

    // ── Inodes ──────────────────────────────────────────────────────────

    fn table(&self, io: &BlockIo) -> Result<Inode> {
        let bytes = io.read_device(self.sb.inodes_ord, u64::from(self.sb.inodes_block), INODE_SIZE)?;
        Ok(Inode::parse_from_bytes(&bytes)?)
    }

    fn slot_offset(ino: u32) -> Result<u64> {
        if ino == 0 {
            bail!("inode 0 does not exist");
        }
        Ok(u64::from(ino - 1) * INODE_SIZE as u64)
    }

    /// Raw 512-byte slot of `ino`.
    pub fn read_slot(&self, ino: u32) -> Result<Vec<u8>> {
        let io = self.io();
        let table = self.table(&io)?;
        layout::read_file(&self.sb, &io, &table, Self::slot_offset(ino)?, INODE_SIZE)
    }

    pub fn write_slot(&self, ino: u32, bytes: &[u8]) -> Result<()> {
        if bytes.len() != INODE_SIZE {
            bail!("inode slots are {INODE_SIZE} bytes");
        }
        let io = self.io();
        let table = self.table(&io)?;
        layout::write_file(&self.sb, &io, &table, Self::slot_offset(ino)?, bytes)?;
        io.flush()?;
        Ok(())
    }

    pub fn read_inode(&self, ino: u32) -> Result<Inode> {
        Ok(Inode::parse_from_bytes(&self.read_slot(ino)?)?)
    }

    pub fn read_extension(&self, ino: u32) -> Result<ExtensionInode> {
        Ok(ExtensionInode::parse_from_bytes(&self.read_slot(ino)?)?)
    }

    /// Write `inode` into the slot its id names.
    pub fn write_inode(&self, inode: &Inode) -> Result<()> {
        let mut bytes = vec![0_u8; INODE_SIZE];
        inode.write_into(&mut bytes)?;
        self.write_slot(inode.id.ino.0, &bytes)
    }

    /// Read, modify and write back one inode.
    pub fn patch_inode(&self, ino: u32, f: impl FnOnce(&mut Inode)) -> Result<Inode> {
        let mut inode = self.read_inode(ino)?;
        f(&mut inode);
        self.write_inode(&inode)?;
        Ok(inode)
    }

    pub fn write_extension(&self, ext: &ExtensionInode) -> Result<()> {
        let mut bytes = vec![0_u8; INODE_SIZE];
        ext.write_into(&mut bytes)?;
        self.write_slot(ext.id.ino.0, &bytes)
    }

    /// Read `len` bytes of the data of `ino`.
    pub fn read_file(&self, ino: u32, offset: u64, len: usize) -> Result<Vec<u8>> {
        let io = self.io();
        let inode = self.read_inode(ino)?;
        layout::read_file(&self.sb, &io, &inode, offset, len)
    }

    pub fn write_file(&self, ino: u32, offset: u64, data: &[u8]) -> Result<()> {
        let io = self.io();
        let inode = self.read_inode(ino)?;
        layout::write_file(&self.sb, &io, &inode, offset, data)?;
        io.flush()?;
        Ok(())
    }

    // ── Directories ─────────────────────────────────────────────────────

    /// Live entries of directory `dir`, `.` and `..` included.
    pub fn dir_entries(&self, dir: u32) -> Result<Vec<DirEntry>> {
        let inode = self.read_inode(dir)?;
        let bytes = self.read_file(dir, 0, usize::try_from(inode.size)?)?;
        let mut out = Vec::new();
        for block in bytes.chunks(DIR_BLK) {
            out.extend(parse_dir_block(block)?);
        }
        Ok(out)
    }

    pub fn lookup(&self, dir: u32, name: &str) -> Result<Option<DirEntry>> {
        Ok(self
            .dir_entries(dir)?
            .into_iter()
            .find(|e| e.name == name.as_bytes()))
    }

    /// Id of the root entry `name`.
    pub fn root_entry(&self, name: &str) -> Result<InodeId> {
        Ok(self
            .lookup(InodeNumber::ROOT.0, name)?
            .with_context(|| format!("no root entry {name}"))?
            .id)
    }

    /// Run `f` over each directory block of `dir` until it reports a
    /// change, then write that block back.
    fn edit_dir(&self, dir: u32, mut f: impl FnMut(&mut [u8]) -> Result<bool>) -> Result<bool> {
        let inode = self.read_inode(dir)?;
        let mut offset = 0;
        while offset < inode.size {
            let mut block = self.read_file(dir, offset, DIR_BLK)?;
            if f(&mut block)? {
                self.write_file(dir, offset, &block)?;
                return Ok(true);
            }
            offset += DIR_BLK as u64;
        }
        Ok(false)
    }

    /// Add an entry in place; no link counts change and the directory
    /// never grows.
    pub fn add_raw_entry(&self, dir: u32, name: &str, id: InodeId, ftype: u8) -> Result<()> {
        let hash = if self.sb.option_mask.contains(OptionMask::DIR_HASH) {
            name_hash(name.as_bytes())
        } else {
            0
        };
        let added = self.edit_dir(dir, |block| {
            match qfs_dir::add_entry(block, id, name.as_bytes(), ftype, hash) {
                Ok(_) => Ok(true),
                Err(QfsError::NoSpace) => Ok(false),
                Err(e) => Err(e.into()),
            }
        })?;
        if !added {
            bail!("directory {dir} is full");
        }
        Ok(())
    }

    /// Remove the entry `name` from `dir` without touching the target.
    pub fn remove_raw_entry(&self, dir: u32, name: &str) -> Result<bool> {
        self.edit_dir(dir, |block| Ok(qfs_dir::remove_entry(block, name.as_bytes())?))
    }

    /// Apply `f` to the entry `name` in place.
    pub fn patch_entry(
        &self,
        dir: u32,
        name: &str,
        mut f: impl FnMut(&mut [u8], &DirEntry) -> Result<()>,
    ) -> Result<()> {
        let found = self.edit_dir(dir, |block| {
            let Some(entry) = qfs_dir::find_entry(block, name.as_bytes())? else {
                return Ok(false);
            };
            f(block, &entry)?;
            Ok(true)
        })?;
        if !found {
            bail!("no entry {name} in directory {dir}");
        }
        Ok(())
    }

    // ── Allocation, quota, log ──────────────────────────────────────────

    /// On-disk bitmap of bitmap-owning ordinal `ord`.
    pub fn bitmap(&self, ord: u16) -> Result<Vec<u8>> {
        let entry = self
            .sb
            .device(Ordinal(ord))
            .with_context(|| format!("no ordinal {ord}"))?;
        let len = usize::try_from(entry.l_allocmap)? * qfs_types::DEV_BSIZE as usize;
        Ok(self
            .io()
            .read_device(entry.mm_ord, u64::from(entry.allocmap), len)?)
    }

    pub fn write_bitmap(&self, ord: u16, bytes: &[u8]) -> Result<()> {
        let entry = self
            .sb
            .device(Ordinal(ord))
            .with_context(|| format!("no ordinal {ord}"))?;
        let io = self.io();
        io.write_device(entry.mm_ord, u64::from(entry.allocmap), bytes)?;
        io.flush()?;
        Ok(())
    }

    /// Mark `[block, block + len)` on `ord` free in the on-disk map and
    /// credit the free-space counters, leaving any owner's pointers alone.
    pub fn free_blocks_on_disk(&mut self, ord: u16, block: u64, len: u64) -> Result<()> {
        let geom = BitmapGeometry::from_superblock(&self.sb, Ordinal(ord))?;
        let mut map = self.bitmap(ord)?;
        let first = block / geom.unit_blocks;
        let units = len.div_ceil(geom.unit_blocks);
        for idx in first..first + units {
            bitmap_mark_free(&mut map, idx);
        }
        self.write_bitmap(ord, &map)?;
        let freed = units * geom.unit_blocks;
        self.update_superblock(|sb| {
            if let Some(entry) = sb.eq.get_mut(usize::from(ord)) {
                entry.space += freed;
            }
            sb.space += freed;
        })
    }

    pub fn quota_record(&self, domain: QuotaDomain, index: u32) -> Result<QuotaRecord> {
        let file = self.root_entry(domain.file_name())?;
        let offset = u64::from(index) * QUOTA_RECORD_SIZE as u64;
        let bytes = self.read_file(file.ino.0, offset, QUOTA_RECORD_SIZE)?;
        Ok(QuotaRecord::parse_from_bytes(&bytes)?)
    }

    pub fn write_quota_record(&self, domain: QuotaDomain, index: u32, rec: &QuotaRecord) -> Result<()> {
        let file = self.root_entry(domain.file_name())?;
        let mut bytes = vec![0_u8; QUOTA_RECORD_SIZE];
        rec.write_into(&mut bytes)?;
        self.write_file(file.ino.0, u64::from(index) * QUOTA_RECORD_SIZE as u64, &bytes)
    }

    pub fn log_header(&self) -> Result<LogHeader> {
        let bytes = self.io().read_device(
            self.sb.log_ord,
            u64::from(self.sb.log_block),
            qfs_types::DEV_BSIZE as usize,
        )?;
        Ok(LogHeader::parse_from_bytes(&bytes)?)
    }

    pub fn write_log_header(&self, header: &LogHeader) -> Result<()> {
        let io = self.io();
        io.write_device(self.sb.log_ord, u64::from(self.sb.log_block), &header.to_bytes()?)?;
        io.flush()?;
        Ok(())
    }
}
