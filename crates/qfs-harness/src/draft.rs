use crate::layout::{self, BSIZE};
use crate::{FileSpec, ImageBuilder, QUOTA_FILE_SIZE, TestImage};
use anyhow::{Context, Result, bail};
use qfs_alloc::{BitmapGeometry, ClaimOutcome, WorkingBitmap, system_area_blocks};
use qfs_block::{BlockIo, ByteDevice, MemoryByteDevice, StripeLayout};
use qfs_dir::{init_dir_block, init_empty_block, name_hash};
use qfs_error::QfsError;
use qfs_extent::{DauGeometry, Location, file_class, mapped_len, translate};
use qfs_ondisk::{
    DeviceClass, DeviceEntry, DeviceState, ExtensionInode, ExtensionKind, ExtentPtr, FileType,
    FsckRequest, IndirectBlock, Inode, InodeStatus, LogHeader, OptionMask, QuotaDomain,
    QuotaRecord, Superblock,
};
use qfs_types::{
    BACKUP_SUPERBLK, DEV_BSIZE, DIR_BLK, INODE_SIZE, InodeId, InodeNumber, MAX_EXT_CHAIN,
    Ordinal, QUOTA_UNIT, S_IFDIR, S_IFLNK, S_IFREG, SUPERBLK, SYSTEM_BASE, write_le_u32,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Contents of one inode slot while the image is being built.
#[derive(Debug, Clone)]
enum Slot {
    /// Free, remembering the last generation used.
    Free(u32),
    Base(Inode),
    Ext(ExtensionInode),
}

/// A formatted image whose inode table, bitmaps and superblocks are still
/// held in memory. Directory, indirect and file data blocks are written to
/// the devices as they are created.
#[derive(Debug)]
pub struct DraftImage {
    sb: Superblock,
    devices: Vec<MemoryByteDevice>,
    io: BlockIo,
    maps: BTreeMap<Ordinal, WorkingBitmap>,
    slots: Vec<Slot>,
    data_ord: Ordinal,
    hashed: bool,
    now: u64,
    limits: BTreeMap<(QuotaDomain, u32), QuotaRecord>,
}

pub(crate) fn build_io(devices: &[MemoryByteDevice], sb: &Superblock) -> BlockIo {
    let handles = devices
        .iter()
        .map(|d| Some(Arc::new(d.clone()) as Arc<dyn ByteDevice>))
        .collect();
    let mut io = BlockIo::new(handles);
    for entry in sb.eq.iter().filter(|e| e.num_group > 1) {
        io.set_stripe(
            entry.ord,
            StripeLayout {
                width: entry.num_group,
                unit_blocks: u64::from(sb.lg_data / DEV_BSIZE),
            },
        );
    }
    io
}

fn device_table(cfg: &ImageBuilder) -> Result<(Vec<DeviceEntry>, Vec<u64>)> {
    let mut planned = Vec::new();
    if let Some(blocks) = cfg.meta_blocks {
        planned.push((DeviceClass::Meta, 1_u16, blocks));
    }
    planned.extend(cfg.data.iter().map(|g| (DeviceClass::Data, g.width, g.blocks)));

    let mut eq = Vec::new();
    let mut sizes = Vec::new();
    let mut next_map = SYSTEM_BASE;
    for (class, width, blocks) in planned {
        let (small, large) = match class {
            DeviceClass::Meta => (cfg.sm_meta, cfg.lg_meta),
            DeviceClass::Data => (cfg.sm_data, cfg.lg_data),
        };
        let large_blocks = u64::from(large / DEV_BSIZE) * u64::from(width);
        let unit = if small < large && width == 1 {
            u64::from(small / DEV_BSIZE)
        } else {
            large_blocks
        };
        let member_large = u64::from(large / DEV_BSIZE).max(1);
        let per_member = blocks / member_large * member_large;
        let capacity = per_member * u64::from(width);
        let map_blocks = (capacity / unit).div_ceil(8).div_ceil(BSIZE);
        for member in 0..width {
            let ord = Ordinal(u16::try_from(eq.len())?);
            let leader = member == 0;
            eq.push(DeviceEntry {
                ord,
                eq: 100 + ord.0,
                state: DeviceState::On,
                class,
                num_group: if leader { width } else { 0 },
                capacity: if leader { capacity } else { per_member },
                space: 0,
                allocmap: if leader { u32::try_from(next_map)? } else { 0 },
                l_allocmap: if leader { u32::try_from(map_blocks)? } else { 0 },
                mm_ord: Ordinal(0),
                system: u32::try_from(SYSTEM_BASE)?,
            });
            sizes.push(per_member);
        }
        next_map += map_blocks;
    }
    Ok((eq, sizes))
}

impl DraftImage {
    pub(crate) fn format(cfg: ImageBuilder) -> Result<Self> {
        cfg.check()?;
        let (sm_meta, lg_meta) = if cfg.meta_blocks.is_some() {
            (cfg.sm_meta, cfg.lg_meta)
        } else {
            (cfg.sm_data, cfg.lg_data)
        };
        let cfg = ImageBuilder {
            sm_meta,
            lg_meta,
            ..cfg
        };
        let (eq, sizes) = device_table(&cfg)?;
        let mm_count = u16::try_from(eq.iter().filter(|e| e.class == DeviceClass::Meta).count())?;
        let data_ord = eq
            .iter()
            .find(|e| e.class == DeviceClass::Data)
            .map(|e| e.ord)
            .context("no data device")?;

        let mut sb = Superblock {
            version: cfg.version,
            fs_id: cfg.fs_id,
            name: cfg.name.clone(),
            init_time: cfg.init_time,
            update_time: cfg.init_time,
            fs_count: u16::try_from(eq.len())?,
            mm_count,
            ord: Ordinal(0),
            option_mask: cfg.options,
            fsck_request: FsckRequest::default(),
            sm_data: cfg.sm_data,
            lg_data: cfg.lg_data,
            sm_meta: cfg.sm_meta,
            lg_meta: cfg.lg_meta,
            inodes_ord: Ordinal(0),
            inodes_block: 0,
            capacity: 0,
            space: 0,
            shared: cfg.hosts.is_some(),
            log_ord: Ordinal(0),
            log_block: 0,
            log_len: 0,
            eq,
        };
        for idx in 0..sb.eq.len() {
            if sb.eq[idx].owns_bitmap() {
                let ord = sb.eq[idx].ord;
                let system = u32::try_from(system_area_blocks(&sb, ord)?)?;
                sb.eq[idx].system = system;
            }
        }
        sb.capacity = sb.eq.iter().filter(|e| e.owns_bitmap()).map(|e| e.capacity).sum();

        let devices: Vec<MemoryByteDevice> = sizes
            .iter()
            .map(|blocks| Ok(MemoryByteDevice::new(usize::try_from(blocks * BSIZE)?)))
            .collect::<Result<_>>()?;
        let io = build_io(&devices, &sb);

        let mut maps = BTreeMap::new();
        for geom in BitmapGeometry::for_filesystem(&sb)? {
            let mut map = WorkingBitmap::build_free_map(geom, None)?;
            let system = sb.device(geom.ord).map_or(0, |e| u64::from(e.system));
            map.clear_allocated(system)?;
            maps.insert(geom.ord, map);
        }

        let table_units = (u64::from(cfg.inode_slots) * INODE_SIZE as u64)
            .div_ceil(u64::from(sb.lg_meta));
        if table_units > qfs_types::NDEXT as u64 {
            bail!("inode table of {} slots needs indirect extents", cfg.inode_slots);
        }
        let table_size = table_units * u64::from(sb.lg_meta);
        let slot_count = usize::try_from(table_size / INODE_SIZE as u64)?;

        let mut image = Self {
            hashed: sb.option_mask.contains(OptionMask::DIR_HASH),
            sb,
            devices,
            io,
            maps,
            slots: vec![Slot::Free(0); slot_count + 1],
            data_ord,
            now: cfg.init_time,
            limits: BTreeMap::new(),
        };

        image.create_table(table_size)?;
        if cfg.log_blocks > 0 {
            image.create_log(cfg.log_blocks)?;
        }
        image.create_root()?;
        let root = image.id_of(InodeNumber::ROOT)?;
        image.create_system_file(InodeNumber::BLOCKS, ".blocks", 0)?;
        if let Some(hosts) = &cfg.hosts {
            let id = image.create_system_file(InodeNumber::HOSTS, ".hosts", BSIZE)?;
            let bytes = hosts.to_bytes()?;
            image.write_data(id.ino, 0, &bytes)?;
        }
        if cfg.lost_found {
            image.mkdir(root, "lost+found")?;
        }
        if cfg.quota {
            for domain in QuotaDomain::ALL {
                image.create_file(root, domain.file_name(), &FileSpec::regular(QUOTA_FILE_SIZE))?;
            }
        }
        debug!(
            name = %image.sb.name,
            ordinals = image.sb.fs_count,
            slots = slot_count,
            "image formatted"
        );
        Ok(image)
    }

    // ── Accessors ───────────────────────────────────────────────────────

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    /// First data ordinal; regular files are allocated there by default.
    #[must_use]
    pub fn data_ordinal(&self) -> Ordinal {
        self.data_ord
    }

    pub fn inode(&self, ino: u32) -> Result<&Inode> {
        match self.slots.get(usize::try_from(ino)?) {
            Some(Slot::Base(inode)) => Ok(inode),
            _ => bail!("inode {ino} is not a base inode"),
        }
    }

    pub fn extension(&self, ino: u32) -> Result<&ExtensionInode> {
        match self.slots.get(usize::try_from(ino)?) {
            Some(Slot::Ext(ext)) => Ok(ext),
            _ => bail!("inode {ino} is not an extension inode"),
        }
    }

    fn inode_mut(&mut self, ino: InodeNumber) -> Result<&mut Inode> {
        match self.slots.get_mut(ino.index()) {
            Some(Slot::Base(inode)) => Ok(inode),
            _ => bail!("inode {ino} is not a base inode"),
        }
    }

    fn id_of(&self, ino: InodeNumber) -> Result<InodeId> {
        Ok(self.inode(ino.0)?.id)
    }

    /// Modify a base inode before commit.
    pub fn update_inode(&mut self, ino: u32, f: impl FnOnce(&mut Inode)) -> Result<()> {
        f(self.inode_mut(InodeNumber(ino))?);
        Ok(())
    }

    /// Quota limits written with the usage at commit.
    pub fn set_quota_limits(&mut self, domain: QuotaDomain, index: u32, limits: QuotaRecord) {
        self.limits.insert((domain, index), limits);
    }

    // ── Allocation ──────────────────────────────────────────────────────

    fn alloc(&mut self, ord: Ordinal, blocks: u64) -> Result<u64> {
        let map = self
            .maps
            .get_mut(&ord)
            .with_context(|| format!("ordinal {ord} holds no bitmap"))?;
        let block = map
            .find_free(blocks)?
            .with_context(|| format!("ordinal {ord} has no free run of {blocks} blocks"))?;
        match map.claim(block, blocks)? {
            ClaimOutcome::Fresh => Ok(block),
            other => bail!("claim of block {block} on ordinal {ord} returned {other:?}"),
        }
    }

    fn alloc_ino(&mut self) -> Result<InodeId> {
        let first = InodeNumber::FIRST_USER.index();
        let (idx, generation) = self
            .slots
            .iter()
            .enumerate()
            .skip(first)
            .find_map(|(i, s)| match s {
                Slot::Free(generation) => Some((i, *generation)),
                _ => None,
            })
            .context("inode table is full")?;
        let id = InodeId::new(u32::try_from(idx)?, generation + 1);
        // Reserve the slot until the caller stores the real inode.
        self.slots[idx] = Slot::Base(Inode::free(id));
        Ok(id)
    }

    fn new_inode(&self, id: InodeId, mode: u32, parent: InodeId) -> Inode {
        let mut inode = Inode::free(id);
        inode.mode = mode;
        inode.parent = parent;
        inode.nlink = 1;
        inode.modify_time = self.now;
        inode.change_time = self.now;
        inode.create_time = self.now;
        inode
    }

    fn store(&mut self, inode: Inode) -> Result<()> {
        let idx = inode.id.ino.index();
        let slot = self
            .slots
            .get_mut(idx)
            .with_context(|| format!("inode {} outside the table", inode.id))?;
        *slot = Slot::Base(inode);
        Ok(())
    }

    fn new_indirect(&mut self, inode: &mut Inode, level: u32) -> Result<ExtentPtr> {
        let blocks = u64::from(self.sb.lg_meta / DEV_BSIZE);
        let block = self.alloc(Ordinal(0), blocks)?;
        let mut bytes = vec![0_u8; usize::try_from(self.sb.lg_meta)?];
        IndirectBlock::new(inode.id, level, self.sb.lg_meta).write_into(&mut bytes)?;
        self.io.write(Ordinal(0), block, &bytes)?;
        inode.blocks += blocks;
        Ok(ExtentPtr::new(u32::try_from(block)?, 0))
    }

    fn set_pointer(&mut self, inode: &mut Inode, location: &Location, ptr: ExtentPtr) -> Result<()> {
        let slot = location.slot();
        let Location::Indirect { level, path, .. } = *location else {
            inode.extents[slot] = ptr;
            return Ok(());
        };
        if inode.extents[slot].is_hole() {
            inode.extents[slot] = self.new_indirect(inode, u32::from(level))?;
        }
        let size = usize::try_from(self.sb.lg_meta)?;
        let mut current = inode.extents[slot];
        for depth in 0..usize::from(level) {
            let block_level = u32::from(level) - u32::try_from(depth)?;
            let mut bytes = self.io.read(current.ord, u64::from(current.block), size)?;
            let mut ind = IndirectBlock::parse_from_bytes(&bytes)?;
            let pos = usize::try_from(path[depth])?;
            if block_level == 1 {
                ind.entries[pos] = ptr;
            } else if ind.entries[pos].is_hole() {
                ind.entries[pos] = self.new_indirect(inode, block_level - 1)?;
            } else {
                current = ind.entries[pos];
                continue;
            }
            ind.write_into(&mut bytes)?;
            self.io.write(current.ord, u64::from(current.block), &bytes)?;
            current = ind.entries[pos];
        }
        Ok(())
    }

    /// Allocate every data block the extent arrays of `inode` map.
    fn place_data(&mut self, inode: &mut Inode) -> Result<()> {
        let ord = inode.extents[0].ord;
        if inode.status.contains(InodeStatus::DIRECT_MAP) {
            let geom = DauGeometry::for_inode(&self.sb, inode);
            let large = geom.large / BSIZE;
            let span = inode.size.div_ceil(BSIZE).div_ceil(large).max(1) * large;
            let block = self.alloc(ord, span)?;
            inode.extents[0] = ExtentPtr::new(u32::try_from(block)?, ord.0);
            inode.dm_span = span;
            inode.blocks = span;
            return Ok(());
        }
        let geom = DauGeometry::for_inode(&self.sb, inode);
        let len = mapped_len(inode);
        let mut offset = 0;
        while offset < len {
            let t = translate(&geom, offset)?;
            let blocks = t.unit / BSIZE;
            let block = self.alloc(ord, blocks)?;
            self.set_pointer(inode, &t.location, ExtentPtr::new(u32::try_from(block)?, ord.0))?;
            inode.blocks += blocks;
            offset += t.unit - t.within;
        }
        Ok(())
    }

    fn default_ord(&self, inode: &Inode) -> Ordinal {
        match file_class(&self.sb, inode) {
            DeviceClass::Meta => Ordinal(0),
            DeviceClass::Data if self.sb.mm_count == 0 && inode.is_dir() => Ordinal(0),
            DeviceClass::Data => self.data_ord,
        }
    }

    fn write_data(&self, ino: InodeNumber, offset: u64, data: &[u8]) -> Result<()> {
        let inode = self.inode(ino.0)?;
        layout::write_file(&self.sb, &self.io, inode, offset, data)
    }

    // ── Reserved inodes ─────────────────────────────────────────────────

    fn create_table(&mut self, size: u64) -> Result<()> {
        let id = InodeId::new(InodeNumber::INODES.0, 1);
        let root = InodeId::new(InodeNumber::ROOT.0, 1);
        let mut table = self.new_inode(id, S_IFREG | 0o600, root);
        table.status.insert(InodeStatus::META);
        table.status.insert(InodeStatus::ON_LARGE);
        table.size = size;
        table.extents[0].ord = Ordinal(0);
        self.place_data(&mut table)?;
        self.sb.inodes_ord = table.extents[0].ord;
        self.sb.inodes_block = table.extents[0].block;
        self.store(table)
    }

    fn create_log(&mut self, blocks: u32) -> Result<()> {
        let block = self.alloc(Ordinal(0), u64::from(blocks))?;
        self.sb.log_ord = Ordinal(0);
        self.sb.log_block = u32::try_from(block)?;
        self.sb.log_len = blocks;
        if OptionMask::LOG.unknown_bits(self.sb.version) == 0 {
            self.sb.option_mask = OptionMask(self.sb.option_mask.0 | OptionMask::LOG.0);
        }
        let header = LogHeader::empty(self.sb.fs_id, blocks).to_bytes()?;
        self.io.write_device(Ordinal(0), block, &header)?;
        Ok(())
    }

    fn create_root(&mut self) -> Result<()> {
        let id = InodeId::new(InodeNumber::ROOT.0, 1);
        let mut root = self.new_inode(id, S_IFDIR | 0o755, id);
        root.nlink = 2;
        root.size = DIR_BLK as u64;
        root.extents[0].ord = Ordinal(0);
        self.place_data(&mut root)?;
        let mapped = layout::resolve(&self.sb, &self.io, &root, 0)?.context("root has no data")?;
        let mut block = vec![0_u8; DIR_BLK];
        init_dir_block(&mut block, id, id, self.hashed)?;
        self.io.write(mapped.ord, mapped.block, &block)?;
        self.store(root)?;
        self.add_root_entry(".inodes", InodeId::new(InodeNumber::INODES.0, 1))
    }

    fn add_root_entry(&mut self, name: &str, id: InodeId) -> Result<()> {
        let root = self.id_of(InodeNumber::ROOT)?;
        self.add_raw_entry(root, name, id, FileType::Regular.dirent_code())
    }

    fn create_system_file(&mut self, ino: InodeNumber, name: &str, size: u64) -> Result<InodeId> {
        let id = InodeId::new(ino.0, 1);
        let root = self.id_of(InodeNumber::ROOT)?;
        let mut inode = self.new_inode(id, S_IFREG | 0o600, root);
        inode.status.insert(InodeStatus::META);
        inode.size = size;
        inode.extents[0].ord = Ordinal(0);
        self.place_data(&mut inode)?;
        self.store(inode)?;
        self.add_root_entry(name, id)?;
        Ok(id)
    }

    // ── Namespace ───────────────────────────────────────────────────────

    /// Add a directory entry without touching any link count.
    pub fn add_raw_entry(&mut self, dir: InodeId, name: &str, id: InodeId, ftype: u8) -> Result<()> {
        let hash = if self.hashed { name_hash(name.as_bytes()) } else { 0 };
        let mut inode = self.inode(dir.ino.0)?.clone();
        let mut offset = 0;
        while offset < inode.size {
            let mapped = layout::resolve(&self.sb, &self.io, &inode, offset)?
                .with_context(|| format!("directory {dir} has a hole at {offset}"))?;
            let mut block = self.io.read(mapped.ord, mapped.block, DIR_BLK)?;
            match qfs_dir::add_entry(&mut block, id, name.as_bytes(), ftype, hash) {
                Ok(_) => return Ok(self.io.write(mapped.ord, mapped.block, &block)?),
                Err(QfsError::NoSpace) => offset += DIR_BLK as u64,
                Err(e) => return Err(e.into()),
            }
        }

        let geom = DauGeometry::for_inode(&self.sb, &inode);
        let t = translate(&geom, inode.size)?;
        if t.within == 0 {
            let blocks = t.unit / BSIZE;
            let ord = inode.extents[0].ord;
            let block = self.alloc(ord, blocks)?;
            self.set_pointer(&mut inode, &t.location, ExtentPtr::new(u32::try_from(block)?, ord.0))?;
            inode.blocks += blocks;
        }
        inode.size += DIR_BLK as u64;
        let mapped = layout::resolve(&self.sb, &self.io, &inode, offset)?
            .context("new directory block is unmapped")?;
        let mut block = vec![0_u8; DIR_BLK];
        init_empty_block(&mut block)?;
        qfs_dir::add_entry(&mut block, id, name.as_bytes(), ftype, hash)?;
        self.io.write(mapped.ord, mapped.block, &block)?;
        self.store(inode)
    }

    /// Regular file with data, named `name` in `dir`.
    pub fn create_file(&mut self, dir: InodeId, name: &str, spec: &FileSpec) -> Result<InodeId> {
        let id = self.create_unlinked(dir, spec)?;
        let ftype = FileType::from_mode(spec.mode).dirent_code();
        self.add_raw_entry(dir, name, id, ftype)?;
        Ok(id)
    }

    /// A file whose parent is `parent` but which no directory names.
    pub fn create_unlinked(&mut self, parent: InodeId, spec: &FileSpec) -> Result<InodeId> {
        let id = self.alloc_ino()?;
        let mut inode = self.new_inode(id, spec.mode, parent);
        inode.uid = spec.uid;
        inode.gid = spec.gid;
        inode.admin_id = spec.admin_id;
        inode.status = spec.status;
        inode.arch_status = spec.arch_status;
        inode.size = spec.size;
        let ord = spec.ord.unwrap_or_else(|| self.default_ord(&inode));
        inode.extents[0].ord = ord;
        if inode.has_resident_data() {
            self.place_data(&mut inode)?;
        }
        self.store(inode)?;
        Ok(id)
    }

    pub fn mkdir(&mut self, parent: InodeId, name: &str) -> Result<InodeId> {
        let id = self.alloc_ino()?;
        let mut dir = self.new_inode(id, S_IFDIR | 0o755, parent);
        dir.nlink = 2;
        dir.size = DIR_BLK as u64;
        let ord = self.default_ord(&dir);
        dir.extents[0].ord = ord;
        self.place_data(&mut dir)?;
        let mapped = layout::resolve(&self.sb, &self.io, &dir, 0)?.context("directory has no data")?;
        let mut block = vec![0_u8; DIR_BLK];
        init_dir_block(&mut block, id, parent, self.hashed)?;
        self.io.write(mapped.ord, mapped.block, &block)?;
        self.store(dir)?;
        self.add_raw_entry(parent, name, id, FileType::Directory.dirent_code())?;
        self.inode_mut(parent.ino)?.nlink += 1;
        Ok(id)
    }

    /// Symbolic link whose target lives in a symlink extension inode.
    pub fn symlink(&mut self, dir: InodeId, name: &str, target: &str) -> Result<InodeId> {
        let id = self.alloc_ino()?;
        let mut link = self.new_inode(id, S_IFLNK | 0o777, dir);
        link.size = target.len() as u64;
        self.store(link)?;
        let mut ext = self.new_extension(id, ExtensionKind::Symlink)?;
        let bytes = target.as_bytes();
        if bytes.len() > ext.payload.len() {
            bail!("symlink target of {} bytes does not fit", bytes.len());
        }
        ext.payload[..bytes.len()].copy_from_slice(bytes);
        ext.count = u16::try_from(bytes.len())?;
        self.append_extension(id, ext)?;
        self.add_raw_entry(dir, name, id, FileType::Symlink.dirent_code())?;
        Ok(id)
    }

    fn new_extension(&mut self, base: InodeId, kind: ExtensionKind) -> Result<ExtensionInode> {
        let id = self.alloc_ino()?;
        Ok(ExtensionInode::new(id, base, kind))
    }

    /// Link `ext` at the end of the chain of `base`.
    fn append_extension(&mut self, base: InodeId, ext: ExtensionInode) -> Result<()> {
        let ext_id = ext.id;
        self.slots[ext_id.ino.index()] = Slot::Ext(ext);
        let head = self.inode(base.ino.0)?.ext;
        if head.is_none() {
            self.inode_mut(base.ino)?.ext = ext_id;
            return Ok(());
        }
        let mut cur = head;
        for _ in 0..MAX_EXT_CHAIN {
            let Some(Slot::Ext(e)) = self.slots.get_mut(cur.ino.index()) else {
                bail!("broken extension chain at {cur}");
            };
            if e.next.is_none() {
                e.next = ext_id;
                return Ok(());
            }
            cur = e.next;
        }
        bail!("extension chain of {base} is too long")
    }

    /// Additional hard link. A directory other than the parent is recorded
    /// in a hard-link-parents extension.
    pub fn link(&mut self, dir: InodeId, name: &str, target: InodeId) -> Result<()> {
        let (ftype, parent) = {
            let inode = self.inode(target.ino.0)?;
            (inode.file_type().dirent_code(), inode.parent)
        };
        self.add_raw_entry(dir, name, target, ftype)?;
        self.inode_mut(target.ino)?.nlink += 1;
        if dir == parent {
            return Ok(());
        }

        let mut cur = self.inode(target.ino.0)?.ext;
        while !cur.is_none() {
            let Some(Slot::Ext(e)) = self.slots.get_mut(cur.ino.index()) else {
                bail!("broken extension chain at {cur}");
            };
            if e.kind == ExtensionKind::HardLinkParents && e.count < e.kind.capacity() {
                let mut parents = e.hard_link_parents()?;
                parents.push(dir);
                e.set_hard_link_parents(&parents)?;
                return Ok(());
            }
            cur = e.next;
        }
        let mut ext = self.new_extension(target, ExtensionKind::HardLinkParents)?;
        ext.set_hard_link_parents(&[dir])?;
        self.append_extension(target, ext)
    }

    /// Segmented file: an index inode whose table names one member inode
    /// per `seg_size` bytes of `size`.
    pub fn create_segmented(
        &mut self,
        dir: InodeId,
        name: &str,
        seg_size: u64,
        spec: &FileSpec,
    ) -> Result<(InodeId, Vec<InodeId>)> {
        if seg_size == 0 {
            bail!("segment size must be positive");
        }
        let id = self.alloc_ino()?;
        let mut index = self.new_inode(id, S_IFREG | 0o644, dir);
        index.uid = spec.uid;
        index.gid = spec.gid;
        index.admin_id = spec.admin_id;
        index.status = spec.status;
        index.status.insert(InodeStatus::SEG_INDEX);
        index.size = spec.size;
        index.seg_size = seg_size;
        let ord = self.default_ord(&index);
        index.extents[0].ord = ord;
        self.place_data(&mut index)?;
        self.store(index.clone())?;

        let count = spec.size.div_ceil(seg_size);
        let mut members = Vec::new();
        let mut table = vec![0_u8; usize::try_from(mapped_len(&index))?];
        for seg in 0..count {
            let mid = self.alloc_ino()?;
            let mut member = self.new_inode(mid, S_IFREG | 0o644, id);
            member.uid = spec.uid;
            member.gid = spec.gid;
            member.admin_id = spec.admin_id;
            member.status.insert(InodeStatus::SEG_MEMBER);
            member.seg_ord = u32::try_from(seg)?;
            member.seg_size = seg_size;
            member.size = seg_size.min(spec.size - seg * seg_size);
            member.extents[0].ord = spec.ord.unwrap_or(self.data_ord);
            self.place_data(&mut member)?;
            self.store(member)?;
            let off = usize::try_from(seg)? * 8;
            write_le_u32(&mut table, off, mid.ino.0)?;
            write_le_u32(&mut table, off + 4, mid.generation.0)?;
            members.push(mid);
        }
        self.write_data(id.ino, 0, &table)?;
        self.add_raw_entry(dir, name, id, FileType::Regular.dirent_code())?;
        Ok((id, members))
    }

    // ── Commit ──────────────────────────────────────────────────────────

    fn quota_usage(&self) -> BTreeMap<(QuotaDomain, u32), QuotaRecord> {
        let mut usage: BTreeMap<(QuotaDomain, u32), QuotaRecord> = BTreeMap::new();
        for slot in &self.slots {
            let Slot::Base(inode) = slot else { continue };
            let ino = inode.id.ino;
            if inode.is_free() || ino == InodeNumber::INODES || ino == InodeNumber::BLOCKS {
                continue;
            }
            let is_file = !inode.status.contains(InodeStatus::SEG_MEMBER);
            let offline = inode.status.contains(InodeStatus::OFFLINE);
            let resident = inode.blocks * (BSIZE / QUOTA_UNIT);
            for domain in QuotaDomain::ALL {
                let index = match domain {
                    QuotaDomain::Admin => inode.admin_id,
                    QuotaDomain::Group => inode.gid,
                    QuotaDomain::User => inode.uid,
                };
                let rec = usage.entry((domain, index)).or_default();
                if is_file {
                    rec.total.files += 1;
                    if !offline {
                        rec.online.files += 1;
                    }
                }
                if offline {
                    rec.total.blocks += inode.size.div_ceil(QUOTA_UNIT).max(resident);
                } else {
                    rec.online.blocks += resident;
                    rec.total.blocks += resident;
                }
            }
        }
        usage
    }

    fn write_quota(&self) -> Result<()> {
        let usage = self.quota_usage();
        let root = self.inode(InodeNumber::ROOT.0)?;
        for domain in QuotaDomain::ALL {
            let Some(entry) = self.lookup(root, domain.file_name())? else {
                continue;
            };
            let file = self.inode(entry.ino.0)?;
            let records = file.size / qfs_ondisk::quota::QUOTA_RECORD_SIZE as u64;
            let mut bytes = vec![0_u8; usize::try_from(file.size)?];
            for index in 0..u32::try_from(records)? {
                let mut rec = self.limits.get(&(domain, index)).copied().unwrap_or_default();
                if let Some(used) = usage.get(&(domain, index)) {
                    rec.take_usage(used);
                }
                let off = usize::try_from(index)? * qfs_ondisk::quota::QUOTA_RECORD_SIZE;
                rec.write_into(&mut bytes[off..off + qfs_ondisk::quota::QUOTA_RECORD_SIZE])?;
            }
            layout::write_file(&self.sb, &self.io, file, 0, &bytes)?;
        }
        Ok(())
    }

    fn lookup(&self, dir: &Inode, name: &str) -> Result<Option<InodeId>> {
        let mut offset = 0;
        while offset < dir.size {
            if let Some(mapped) = layout::resolve(&self.sb, &self.io, dir, offset)? {
                let block = self.io.read(mapped.ord, mapped.block, DIR_BLK)?;
                if let Some(entry) = qfs_dir::find_entry(&block, name.as_bytes())? {
                    return Ok(Some(entry.id));
                }
            }
            offset += DIR_BLK as u64;
        }
        Ok(None)
    }

    fn write_table(&self) -> Result<()> {
        let table = self.inode(InodeNumber::INODES.0)?;
        let mut bytes = vec![0_u8; usize::try_from(table.size)?];
        for (idx, slot) in self.slots.iter().enumerate().skip(1) {
            let off = (idx - 1) * INODE_SIZE;
            let Some(raw) = bytes.get_mut(off..off + INODE_SIZE) else {
                break;
            };
            match slot {
                Slot::Free(generation) => {
                    Inode::free(InodeId::new(u32::try_from(idx)?, *generation)).write_into(raw)?;
                }
                Slot::Base(inode) => inode.write_into(raw)?,
                Slot::Ext(ext) => ext.write_into(raw)?,
            }
        }
        layout::write_file(&self.sb, &self.io, table, 0, &bytes)
    }

    /// Write the inode table, quota records, bitmaps, free space and every
    /// superblock copy.
    pub fn commit(mut self) -> Result<TestImage> {
        self.write_table()?;
        self.write_quota()?;

        let mut total = 0;
        for (ord, map) in &mut self.maps {
            map.write_to(&self.io)?;
            let free = map.free_blocks()?;
            self.sb.eq[ord.index()].space = free;
            total += free;
        }
        self.sb.space = total;

        for idx in 0..self.sb.eq.len() {
            let mut copy = self.sb.clone();
            copy.ord = Ordinal(u16::try_from(idx)?);
            let bytes = copy.to_bytes()?;
            self.io.write_device(copy.ord, SUPERBLK, &bytes)?;
            self.io.write_device(copy.ord, BACKUP_SUPERBLK, &bytes)?;
        }
        self.io.flush()?;
        debug!(space = self.sb.space, "image committed");
        Ok(TestImage::new(self.sb, self.devices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_lays_out_the_system_area_and_table() {
        let draft = ImageBuilder::new().format().expect("format");
        let sb = draft.superblock();
        assert_eq!(sb.fs_count, 2);
        assert_eq!(sb.mm_count, 1);
        // 32 superblock blocks plus one map block per ordinal, rounded to 16.
        assert_eq!(sb.eq[0].system, 48);
        assert_eq!(sb.eq[1].system, 32);
        assert_eq!(sb.eq[1].allocmap, 33);
        assert_eq!(sb.inodes_block, 48);

        let table = draft.inode(1).expect("table");
        assert_eq!(table.size, 2 * 16384);
        assert_eq!(table.blocks, 32);
        let root = draft.inode(2).expect("root");
        assert_eq!(root.nlink, 3, "root counts lost+found");
    }

    #[test]
    fn files_spill_into_indirect_blocks() {
        let mut draft = ImageBuilder::new().format().expect("format");
        let root = InodeId::new(2, 1);
        let geom = DauGeometry::new(4096, 16384, 1, false, 16384, false);
        let size = geom.direct_span() + 1;
        let id = draft
            .create_file(root, "big", &FileSpec::regular(size))
            .expect("create");
        let inode = draft.inode(id.ino.0).expect("inode");
        assert!(!inode.extents[16].is_hole());
        // 8 small + 8 large direct DAUs, one indirect block, one data DAU.
        assert_eq!(inode.blocks, 8 * 4 + 8 * 16 + 16 + 16);
    }

    #[test]
    fn directories_grow_by_whole_blocks() {
        let mut draft = ImageBuilder::new()
            .without_quota()
            .inode_slots(512)
            .format()
            .expect("format");
        let root = InodeId::new(2, 1);
        let dir = draft.mkdir(root, "many").expect("mkdir");
        for i in 0..200 {
            draft
                .create_file(dir, &format!("file-with-a-long-name-{i:04}"), &FileSpec::regular(0))
                .expect("create");
        }
        let inode = draft.inode(dir.ino.0).expect("dir");
        assert!(inode.size > DIR_BLK as u64);
        assert_eq!(inode.size % DIR_BLK as u64, 0);
        assert_eq!(inode.blocks, inode.size / BSIZE);
    }

    #[test]
    fn striped_groups_get_one_bitmap() {
        let draft = ImageBuilder::new()
            .add_data_group(2, 4096)
            .format()
            .expect("format");
        let sb = draft.superblock();
        assert_eq!(sb.fs_count, 4);
        assert_eq!(sb.eq[2].num_group, 2);
        assert_eq!(sb.eq[3].num_group, 0);
        assert_eq!(sb.eq[2].capacity, 8192);
        assert_eq!(sb.eq[2].system, 64);
    }
}
