use qfs_types::{
    INODE_SIZE, InodeId, NDEXT, NOEXT, Ordinal, ParseError, S_IFBLK, S_IFCHR, S_IFDIR, S_IFEXT,
    S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK, ensure_slice, read_le_u16, read_le_u32,
    read_le_u64, read_u8, write_bytes, write_le_u16, write_le_u32, write_le_u64, write_u8,
};
use serde::{Deserialize, Serialize};

const EXTENT_OFFSET: usize = 0x70;
const EXTENT_ORD_OFFSET: usize = 0xBC;

/// Extent slot holding the first-level indirect block.
pub const INDIRECT_SLOT_BASE: usize = NDEXT;

// ── Status flags ────────────────────────────────────────────────────────────

/// Inode status word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InodeStatus(pub u32);

impl InodeStatus {
    /// Data has been released to archive media.
    pub const OFFLINE: Self = Self(0x001);
    pub const DAMAGED: Self = Self(0x002);
    pub const SEG_INDEX: Self = Self(0x004);
    pub const SEG_MEMBER: Self = Self(0x008);
    /// One contiguous pre-allocated span instead of extent arrays.
    pub const DIRECT_MAP: Self = Self(0x010);
    /// Data lives on metadata devices.
    pub const META: Self = Self(0x020);
    /// Never use small DAUs for this file.
    pub const ON_LARGE: Self = Self(0x040);
    pub const WORM: Self = Self(0x080);
    /// Partially online: leading blocks stay resident while offline.
    pub const BOF_ONLINE: Self = Self(0x100);
    /// Removable-media stub file.
    pub const REMEDIA: Self = Self(0x200);
    pub const HAS_ACL: Self = Self(0x400);
    pub const HAS_MVA: Self = Self(0x800);

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    pub fn insert(&mut self, flag: Self) {
        self.0 |= flag.0;
    }

    pub fn remove(&mut self, flag: Self) {
        self.0 &= !flag.0;
    }
}

// ── File type ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    Free,
    Regular,
    Directory,
    Symlink,
    Fifo,
    CharDevice,
    BlockDevice,
    Socket,
    Extension,
    Unknown,
}

impl FileType {
    #[must_use]
    pub fn from_mode(mode: u32) -> Self {
        if mode == 0 {
            return Self::Free;
        }
        match mode & S_IFMT {
            S_IFREG => Self::Regular,
            S_IFDIR => Self::Directory,
            S_IFLNK => Self::Symlink,
            S_IFIFO => Self::Fifo,
            S_IFCHR => Self::CharDevice,
            S_IFBLK => Self::BlockDevice,
            S_IFSOCK => Self::Socket,
            S_IFEXT => Self::Extension,
            _ => Self::Unknown,
        }
    }

    /// Type code stored in directory entries (`ftype`).
    #[must_use]
    pub fn dirent_code(self) -> u8 {
        match self {
            Self::Free | Self::Extension | Self::Unknown => 0,
            Self::Regular => 1,
            Self::Directory => 2,
            Self::CharDevice => 3,
            Self::BlockDevice => 4,
            Self::Fifo => 5,
            Self::Socket => 6,
            Self::Symlink => 7,
        }
    }
}

// ── Extent pointers ─────────────────────────────────────────────────────────

/// One (block, ordinal) pair from an extent array or indirect block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtentPtr {
    pub block: u32,
    pub ord: Ordinal,
}

impl ExtentPtr {
    pub const HOLE: Self = Self {
        block: 0,
        ord: Ordinal(0),
    };

    #[must_use]
    pub fn new(block: u32, ord: u16) -> Self {
        Self {
            block,
            ord: Ordinal(ord),
        }
    }

    #[must_use]
    pub fn is_hole(self) -> bool {
        self.block == 0
    }
}

// ── Inode ───────────────────────────────────────────────────────────────────

/// Permanent (base) inode. Extension inodes share the slot size but have
/// their own layout, see [`crate::ExtensionInode`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub mode: u32,
    pub id: InodeId,
    pub parent: InodeId,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub admin_id: u32,
    pub status: InodeStatus,
    /// WORM format version (1 = retention period, 2 = absolute expiry).
    pub version: u8,
    /// Bitmask of archive copies made.
    pub arch_status: u8,
    /// Slot of a segment member within its index.
    pub seg_ord: u32,
    pub size: u64,
    /// Allocated device blocks.
    pub blocks: u64,
    pub seg_size: u64,
    /// Head of the extension chain.
    pub ext: InodeId,
    pub modify_time: u64,
    pub change_time: u64,
    pub create_time: u64,
    /// Span of a direct-mapped file in device blocks.
    pub dm_span: u64,
    pub extents: [ExtentPtr; NOEXT],
    pub worm_period: u32,
    pub worm_until: u64,
}

impl Inode {
    /// A zeroed (free) inode for slot `ino`.
    #[must_use]
    pub fn free(id: InodeId) -> Self {
        Self {
            mode: 0,
            id,
            parent: InodeId::NONE,
            nlink: 0,
            uid: 0,
            gid: 0,
            admin_id: 0,
            status: InodeStatus::default(),
            version: 0,
            arch_status: 0,
            seg_ord: 0,
            size: 0,
            blocks: 0,
            seg_size: 0,
            ext: InodeId::NONE,
            modify_time: 0,
            change_time: 0,
            create_time: 0,
            dm_span: 0,
            extents: [ExtentPtr::HOLE; NOEXT],
            worm_period: 0,
            worm_until: 0,
        }
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, INODE_SIZE)?;

        let mut extents = [ExtentPtr::HOLE; NOEXT];
        for (slot, extent) in extents.iter_mut().enumerate() {
            *extent = ExtentPtr {
                block: read_le_u32(bytes, EXTENT_OFFSET + slot * 4)?,
                ord: Ordinal(read_le_u16(bytes, EXTENT_ORD_OFFSET + slot * 2)?),
            };
        }

        Ok(Self {
            mode: read_le_u32(bytes, 0x00)?,
            id: InodeId::new(read_le_u32(bytes, 0x04)?, read_le_u32(bytes, 0x08)?),
            parent: InodeId::new(read_le_u32(bytes, 0x0C)?, read_le_u32(bytes, 0x10)?),
            nlink: read_le_u32(bytes, 0x14)?,
            uid: read_le_u32(bytes, 0x18)?,
            gid: read_le_u32(bytes, 0x1C)?,
            admin_id: read_le_u32(bytes, 0x20)?,
            status: InodeStatus(read_le_u32(bytes, 0x24)?),
            version: read_u8(bytes, 0x28)?,
            arch_status: read_u8(bytes, 0x29)?,
            seg_ord: read_le_u32(bytes, 0x2C)?,
            size: read_le_u64(bytes, 0x30)?,
            blocks: read_le_u64(bytes, 0x38)?,
            seg_size: read_le_u64(bytes, 0x40)?,
            ext: InodeId::new(read_le_u32(bytes, 0x48)?, read_le_u32(bytes, 0x4C)?),
            modify_time: read_le_u64(bytes, 0x50)?,
            change_time: read_le_u64(bytes, 0x58)?,
            create_time: read_le_u64(bytes, 0x60)?,
            dm_span: read_le_u64(bytes, 0x68)?,
            extents,
            worm_period: read_le_u32(bytes, 0xE8)?,
            worm_until: read_le_u64(bytes, 0xF0)?,
        })
    }

    /// Serialize into a 512-byte slot. Bytes not covered by a field are
    /// zeroed.
    pub fn write_into(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        write_bytes(bytes, 0, &[0_u8; INODE_SIZE])?;
        write_le_u32(bytes, 0x00, self.mode)?;
        write_le_u32(bytes, 0x04, self.id.ino.0)?;
        write_le_u32(bytes, 0x08, self.id.generation.0)?;
        write_le_u32(bytes, 0x0C, self.parent.ino.0)?;
        write_le_u32(bytes, 0x10, self.parent.generation.0)?;
        write_le_u32(bytes, 0x14, self.nlink)?;
        write_le_u32(bytes, 0x18, self.uid)?;
        write_le_u32(bytes, 0x1C, self.gid)?;
        write_le_u32(bytes, 0x20, self.admin_id)?;
        write_le_u32(bytes, 0x24, self.status.0)?;
        write_u8(bytes, 0x28, self.version)?;
        write_u8(bytes, 0x29, self.arch_status)?;
        write_le_u32(bytes, 0x2C, self.seg_ord)?;
        write_le_u64(bytes, 0x30, self.size)?;
        write_le_u64(bytes, 0x38, self.blocks)?;
        write_le_u64(bytes, 0x40, self.seg_size)?;
        write_le_u32(bytes, 0x48, self.ext.ino.0)?;
        write_le_u32(bytes, 0x4C, self.ext.generation.0)?;
        write_le_u64(bytes, 0x50, self.modify_time)?;
        write_le_u64(bytes, 0x58, self.change_time)?;
        write_le_u64(bytes, 0x60, self.create_time)?;
        write_le_u64(bytes, 0x68, self.dm_span)?;
        for (slot, extent) in self.extents.iter().enumerate() {
            write_le_u32(bytes, EXTENT_OFFSET + slot * 4, extent.block)?;
            write_le_u16(bytes, EXTENT_ORD_OFFSET + slot * 2, extent.ord.0)?;
        }
        write_le_u32(bytes, 0xE8, self.worm_period)?;
        write_le_u64(bytes, 0xF0, self.worm_until)?;
        Ok(())
    }

    #[must_use]
    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode)
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.mode == 0
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.file_type() == FileType::Directory
    }

    #[must_use]
    pub fn is_extension(&self) -> bool {
        self.file_type() == FileType::Extension
    }

    /// Whether any archive copy of the data exists.
    #[must_use]
    pub fn has_archive_copy(&self) -> bool {
        self.arch_status != 0
    }

    /// Whether the extent arrays hold device blocks (direct-mapped files
    /// are walked separately, offline files have no resident data).
    #[must_use]
    pub fn has_resident_data(&self) -> bool {
        !self.status.contains(InodeStatus::OFFLINE) || self.status.contains(InodeStatus::BOF_ONLINE)
    }

    /// Mark data as lost but keep the inode: offline + damaged, extents
    /// cleared. Archive copies remain the only source of the data.
    pub fn mark_damaged(&mut self) {
        self.status.insert(InodeStatus::OFFLINE);
        self.status.insert(InodeStatus::DAMAGED);
        self.status.remove(InodeStatus::BOF_ONLINE);
        self.extents = [ExtentPtr::HOLE; NOEXT];
        self.blocks = 0;
    }

    /// Whether this WORM inode still carries the version-1 retention format.
    #[must_use]
    pub fn needs_worm_upgrade(&self) -> bool {
        self.status.contains(InodeStatus::WORM) && self.version < 2
    }

    /// Convert a version-1 retention period into a version-2 expiry.
    pub fn upgrade_worm(&mut self) {
        self.worm_until = self
            .change_time
            .saturating_add(u64::from(self.worm_period));
        self.worm_period = 0;
        self.version = 2;
    }
}
