#![forbid(unsafe_code)]
//! Shared types for the qfsck workspace.
//!
//! Unit-carrying newtypes, fixed on-disk layout constants, the parse-layer
//! error type, and the little-endian field readers/writers every on-disk
//! parser in `qfs-ondisk` is built from.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Units and fixed locations ───────────────────────────────────────────────

/// Size of one device block in bytes. All block numbers are in this unit.
pub const DEV_BSIZE: u32 = 1024;
pub const DEV_BSHIFT: u32 = 10;

/// Device block of the primary superblock on every ordinal.
pub const SUPERBLK: u64 = 16;
/// Device block of the backup superblock on every ordinal.
pub const BACKUP_SUPERBLK: u64 = 24;
/// Length of one superblock copy in device blocks.
pub const SUPERBLOCK_BLOCKS: u64 = 8;
pub const SUPERBLOCK_SIZE: usize = 8192;
/// First device block after both superblock copies.
pub const SYSTEM_BASE: u64 = 32;

/// Maximum number of device ordinals in one family set.
pub const MAX_ORDINALS: usize = 64;

/// On-disk inode size.
pub const INODE_SIZE: usize = 512;
/// Directory block size.
pub const DIR_BLK: usize = 4096;

/// Direct extent slots.
pub const NDEXT: usize = 16;
/// Direct slots that hold small-DAU blocks when small DAUs apply.
pub const NSDEXT: usize = 8;
/// Indirect extent slots (1st, 2nd, 3rd level).
pub const NIEXT: usize = 3;
/// Total extent slots.
pub const NOEXT: usize = NDEXT + NIEXT;

/// Longest extension chain accepted before it is considered cyclic.
pub const MAX_EXT_CHAIN: usize = 64;

/// Byte unit quota block counters are kept in.
pub const QUOTA_UNIT: u64 = 512;

// ── Newtypes ────────────────────────────────────────────────────────────────

/// Device block number (units of [`DEV_BSIZE`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u32);

/// Index of a device within the family set's device table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ordinal(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(pub u32);

/// Inode identity: number plus generation.
///
/// Every cross-reference on disk (directory entries, parent ids, extension
/// chains, indirect-block owners, segment tables) stores a full id so that a
/// reused inode slot is distinguishable from its previous occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeId {
    pub ino: InodeNumber,
    pub generation: Generation,
}

impl InodeId {
    pub const NONE: Self = Self::new(0, 0);

    #[must_use]
    pub const fn new(ino: u32, generation: u32) -> Self {
        Self {
            ino: InodeNumber(ino),
            generation: Generation(generation),
        }
    }

    #[must_use]
    pub fn is_none(self) -> bool {
        self.ino.0 == 0
    }
}

impl InodeNumber {
    /// The inode table itself (`.inodes`).
    pub const INODES: Self = Self(1);
    pub const ROOT: Self = Self(2);
    /// Block reservation system file (`.blocks`).
    pub const BLOCKS: Self = Self(3);
    /// Shared host table (`.hosts`).
    pub const HOSTS: Self = Self(4);
    /// First inode number ordinary files may use.
    pub const FIRST_USER: Self = Self(5);

    /// Inodes whose corruption is always fatal.
    #[must_use]
    pub fn is_table_inode(self) -> bool {
        self == Self::INODES || self == Self::BLOCKS
    }

    #[must_use]
    pub fn is_reserved(self) -> bool {
        self.0 < Self::FIRST_USER.0
    }

    /// Index into ordinal-free per-inode arrays.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Ordinal {
    #[must_use]
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Byte offset within a file or device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Device block containing this offset.
    #[must_use]
    pub fn device_block(self) -> BlockNumber {
        BlockNumber(self.0 >> DEV_BSHIFT)
    }
}

impl BlockNumber {
    /// Byte offset of the start of this block, `None` on overflow.
    #[must_use]
    pub fn to_byte_offset(self) -> Option<ByteOffset> {
        self.0.checked_mul(u64::from(DEV_BSIZE)).map(ByteOffset)
    }
}

/// Number of device blocks needed to hold `bytes`.
#[must_use]
pub fn bytes_to_dev_blocks(bytes: u64) -> u64 {
    bytes.div_ceil(u64::from(DEV_BSIZE))
}

/// Round `value` up to a multiple of `align` (which must be non-zero).
#[must_use]
pub fn round_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

// ── Parse errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("foreign byte order: magic {actual:#x} is a byte-swapped {native:#x}")]
    ForeignByteOrder { native: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let actual = data.len().saturating_sub(offset);
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    data.get_mut(offset..end)
        .ok_or(ParseError::InsufficientData {
            needed: len,
            offset,
            actual,
        })
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_u8(data: &mut [u8], offset: usize, value: u8) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 1)?[0] = value;
    Ok(())
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_bytes(data: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, bytes.len())?.copy_from_slice(bytes);
    Ok(())
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

/// NUL-pad `name` into a fixed field, truncating if it does not fit.
#[must_use]
pub fn nul_padded<const N: usize>(name: &str) -> [u8; N] {
    let mut out = [0_u8; N];
    let bytes = name.as_bytes();
    let len = bytes.len().min(N);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Ordinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.ino.0, self.generation.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── POSIX file mode constants ────────────────────────────────────────────────

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u32 = 0o170_000;
/// Named pipe (FIFO).
pub const S_IFIFO: u32 = 0o010_000;
/// Character device.
pub const S_IFCHR: u32 = 0o020_000;
/// Directory.
pub const S_IFDIR: u32 = 0o040_000;
/// Block device.
pub const S_IFBLK: u32 = 0o060_000;
/// Regular file.
pub const S_IFREG: u32 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u32 = 0o120_000;
/// Extension inode (overflow metadata chained off a base inode).
pub const S_IFEXT: u32 = 0o130_000;
/// Socket.
pub const S_IFSOCK: u32 = 0o140_000;
