#![forbid(unsafe_code)]
//! Synthetic qfs images for tests.
//!
//! [`ImageBuilder`] formats in-memory devices, [`DraftImage`] populates the
//! namespace (files, directories, segmented files, extension chains) and
//! [`DraftImage::commit`] writes the inode table, bitmaps, quota records
//! and superblocks so the result is consistent. [`TestImage`] then offers
//! targeted corruption helpers that patch the committed bytes directly.
//!
//! Allocation goes through the same working bitmaps and extent translation
//! the checker uses, so a freshly committed image checks clean.

mod draft;
mod image;
mod layout;

pub use draft::DraftImage;
pub use image::TestImage;

use anyhow::{Result, bail};
use qfs_ondisk::{HostsTable, InodeStatus, OptionMask, SuperblockVersion};
use qfs_types::{Ordinal, S_IFREG};

/// Default filesystem identity.
pub const DEFAULT_NAME: &str = "qfs1";
pub const DEFAULT_FS_ID: u32 = 0x0051_4653;
pub const DEFAULT_INIT_TIME: u64 = 1_700_000_000;

/// Size of each quota file created by [`ImageBuilder`].
pub const QUOTA_FILE_SIZE: u64 = 8192;

/// A data stripe group: `width` devices of `blocks` device blocks each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataGroup {
    pub width: u16,
    pub blocks: u64,
}

/// Layout of a synthetic filesystem.
///
/// Ordinal 0 is the metadata device (or the first data device when the
/// image has none) and stores every bitmap and the inode table.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    pub(crate) name: String,
    pub(crate) fs_id: u32,
    pub(crate) init_time: u64,
    pub(crate) version: SuperblockVersion,
    pub(crate) options: OptionMask,
    pub(crate) sm_data: u32,
    pub(crate) lg_data: u32,
    pub(crate) sm_meta: u32,
    pub(crate) lg_meta: u32,
    pub(crate) meta_blocks: Option<u64>,
    pub(crate) data: Vec<DataGroup>,
    pub(crate) inode_slots: u32,
    pub(crate) log_blocks: u32,
    pub(crate) hosts: Option<HostsTable>,
    pub(crate) quota: bool,
    pub(crate) lost_found: bool,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_owned(),
            fs_id: DEFAULT_FS_ID,
            init_time: DEFAULT_INIT_TIME,
            version: SuperblockVersion::V2a,
            options: OptionMask::DIR_HASH,
            sm_data: 4096,
            lg_data: 16384,
            sm_meta: 4096,
            lg_meta: 16384,
            meta_blocks: Some(4096),
            data: vec![DataGroup {
                width: 1,
                blocks: 8192,
            }],
            inode_slots: 64,
            log_blocks: 0,
            hosts: None,
            quota: true,
            lost_found: true,
        }
    }
}

impl ImageBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        name.clone_into(&mut self.name);
        self
    }

    #[must_use]
    pub fn fs_id(mut self, fs_id: u32) -> Self {
        self.fs_id = fs_id;
        self
    }

    #[must_use]
    pub fn init_time(mut self, init_time: u64) -> Self {
        self.init_time = init_time;
        self
    }

    /// Superblock version. Feature bits the version does not define are
    /// dropped.
    #[must_use]
    pub fn version(mut self, version: SuperblockVersion) -> Self {
        self.version = version;
        if self.options.unknown_bits(version) != 0 {
            self.options = OptionMask::default();
        }
        self
    }

    #[must_use]
    pub fn options(mut self, options: OptionMask) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn data_dau(mut self, small: u32, large: u32) -> Self {
        self.sm_data = small;
        self.lg_data = large;
        self
    }

    #[must_use]
    pub fn meta_dau(mut self, small: u32, large: u32) -> Self {
        self.sm_meta = small;
        self.lg_meta = large;
        self
    }

    #[must_use]
    pub fn meta_blocks(mut self, blocks: u64) -> Self {
        self.meta_blocks = Some(blocks);
        self
    }

    /// No metadata device: metadata shares the data devices and their DAU
    /// sizes.
    #[must_use]
    pub fn without_meta_device(mut self) -> Self {
        self.meta_blocks = None;
        self
    }

    #[must_use]
    pub fn data_groups(mut self, groups: Vec<DataGroup>) -> Self {
        self.data = groups;
        self
    }

    #[must_use]
    pub fn add_data_group(mut self, width: u16, blocks: u64) -> Self {
        self.data.push(DataGroup { width, blocks });
        self
    }

    /// Inode slots, rounded up to whole large metadata DAUs.
    #[must_use]
    pub fn inode_slots(mut self, slots: u32) -> Self {
        self.inode_slots = slots;
        self
    }

    #[must_use]
    pub fn log(mut self, blocks: u32) -> Self {
        self.log_blocks = blocks;
        self
    }

    /// Shared filesystem whose `.hosts` file names `hosts[server]` as the
    /// metadata server.
    #[must_use]
    pub fn shared(mut self, hosts: &[&str], server: u32) -> Self {
        self.hosts = Some(HostsTable {
            version: 1,
            server,
            hosts: hosts.iter().map(|h| (*h).to_owned()).collect(),
        });
        self
    }

    #[must_use]
    pub fn without_quota(mut self) -> Self {
        self.quota = false;
        self
    }

    #[must_use]
    pub fn without_lost_found(mut self) -> Self {
        self.lost_found = false;
        self
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.data.is_empty() {
            bail!("an image needs at least one data group");
        }
        if self.meta_blocks.is_none() && self.data[0].width != 1 {
            bail!("ordinal 0 must be unstriped");
        }
        if self.data.iter().any(|g| g.width == 0 || g.blocks == 0) {
            bail!("data groups need a width and a size");
        }
        if self.options.unknown_bits(self.version) != 0 {
            bail!("options {:#x} not defined for {:?}", self.options.0, self.version);
        }
        if self.inode_slots < 16 {
            bail!("at least 16 inode slots are required");
        }
        Ok(())
    }

    /// Format the devices and create the reserved inodes, the root
    /// directory and (unless disabled) `lost+found` and the quota files.
    pub fn format(self) -> Result<DraftImage> {
        DraftImage::format(self)
    }
}

/// Attributes of a file created by [`DraftImage::create_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpec {
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub admin_id: u32,
    pub status: InodeStatus,
    pub arch_status: u8,
    /// Ordinal data is allocated from; the class default when `None`.
    pub ord: Option<Ordinal>,
}

impl FileSpec {
    #[must_use]
    pub fn regular(size: u64) -> Self {
        Self {
            size,
            mode: S_IFREG | 0o644,
            uid: 0,
            gid: 0,
            admin_id: 0,
            status: InodeStatus::default(),
            arch_status: 0,
            ord: None,
        }
    }

    #[must_use]
    pub fn owned(mut self, uid: u32, gid: u32, admin_id: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self.admin_id = admin_id;
        self
    }

    #[must_use]
    pub fn with_status(mut self, flag: InodeStatus) -> Self {
        self.status.insert(flag);
        self
    }

    /// One archive copy exists.
    #[must_use]
    pub fn archived(mut self) -> Self {
        self.arch_status |= 1;
        self
    }

    /// Archived and released: no resident data.
    #[must_use]
    pub fn offline(self) -> Self {
        self.archived().with_status(InodeStatus::OFFLINE)
    }

    #[must_use]
    pub fn on(mut self, ord: Ordinal) -> Self {
        self.ord = Some(ord);
        self
    }
}
