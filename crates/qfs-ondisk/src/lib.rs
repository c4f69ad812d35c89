#![forbid(unsafe_code)]
//! On-disk format parsing and serialization.
//!
//! Pure crate: no I/O, no side effects. Parses byte slices into typed
//! structures (superblock and device table, inodes, extension inodes,
//! indirect extent blocks, quota records, log header, hosts table) and
//! writes them back bit-exactly for repair.
//!
//! Directory blocks live in `qfs-dir`.

pub mod extension;
pub mod hosts;
pub mod indirect;
pub mod inode;
pub mod log;
pub mod quota;
pub mod superblock;

pub use extension::{ExtensionInode, ExtensionKind};
pub use hosts::HostsTable;
pub use indirect::{IndirectBlock, IndirectHeader};
pub use inode::{ExtentPtr, FileType, Inode, InodeStatus};
pub use log::LogHeader;
pub use quota::{QuotaCounters, QuotaDomain, QuotaRecord};
pub use superblock::{
    DeviceClass, DeviceEntry, DeviceState, FsckRequest, OptionMask, Superblock, SuperblockVersion,
};
