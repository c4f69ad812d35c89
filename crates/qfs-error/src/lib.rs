#![forbid(unsafe_code)]
//! Error types for qfsck.
//!
//! # Error Taxonomy
//!
//! qfsck uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `qfs-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `QfsError` | `qfs-error` (this crate) | Fatal conditions that end a check run |
//!
//! Per-inode inconsistencies are *not* errors. The engine records them as
//! problem values and keeps scanning; only conditions that make continuing
//! unsafe travel as `Err(QfsError)`.
//!
//! ## Exit Status Mapping
//!
//! Every `QfsError` variant maps to exactly one [`ExitStatus`] via
//! [`QfsError::exit_status`]. The mapping is exhaustive (no wildcard arms)
//! so adding a new variant is a compile error until its status is assigned.
//!
//! | Variant | ExitStatus |
//! |---------|------------|
//! | `Config`, `Mounted`, `NotMetadataServer` | `Argument` |
//! | `NoSpace` | `Memory` |
//! | `Topology` | `Device` |
//! | `Superblock`, `ByteOrder`, `Format`, `Parse` | `Superblock` |
//! | `OptionMismatch` | `OptionMismatch` |
//! | `InodeTable`, `Corruption`, `FileTooLarge` | `InodeTable` |
//! | `Log` | `Log` |
//! | `Io` | `Io` |
//! | `Cancelled` | `Cancelled` |
//!
//! ## Design Constraints
//!
//! - `qfs-error` MUST NOT depend on `qfs-ondisk` (no cyclic deps).
//! - All string payloads are owned (`String`).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Process exit status of a check run.
///
/// Non-fatal statuses are ordered by severity so the worst one seen across
/// a run can be kept with `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// No inconsistencies found.
    Clean,
    /// Notice-level inconsistencies (counts, quota, bitmap drift).
    Minor,
    /// Alert-level inconsistencies (duplicates, orphans, stale entries).
    Major,
    Argument,
    Memory,
    Device,
    Superblock,
    OptionMismatch,
    InodeTable,
    Log,
    Io,
    Cancelled,
}

impl ExitStatus {
    /// Numeric process exit code.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Clean => 0,
            Self::Minor => 4,
            Self::Major => 5,
            Self::Argument => 30,
            Self::Memory => 31,
            Self::Device => 32,
            Self::Superblock => 33,
            Self::OptionMismatch => 34,
            Self::InodeTable => 35,
            Self::Log => 36,
            Self::Io => 37,
            Self::Cancelled => 38,
        }
    }

    #[must_use]
    pub fn is_fatal(self) -> bool {
        !matches!(self, Self::Clean | Self::Minor | Self::Major)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Clean => "clean",
            Self::Minor => "minor inconsistencies",
            Self::Major => "major inconsistencies",
            Self::Argument => "argument error",
            Self::Memory => "out of scratch space",
            Self::Device => "device error",
            Self::Superblock => "superblock error",
            Self::OptionMismatch => "option mismatch",
            Self::InodeTable => "inode table error",
            Self::Log => "log error",
            Self::Io => "I/O error",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{name} ({})", self.code())
    }
}

/// Fatal error for a check run.
#[derive(Debug, Error)]
pub enum QfsError {
    /// Operating system I/O error on a system-area or inode-table block.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Corrupt metadata at a known device block that cannot be worked around.
    #[error("corrupt metadata at ordinal {ordinal} block {block}: {detail}")]
    Corruption {
        ordinal: u16,
        block: u64,
        detail: String,
    },

    /// Structurally invalid on-disk format.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without more specific context.
    #[error("parse error: {0}")]
    Parse(String),

    /// The superblock magic is valid only after a byte swap.
    #[error("filesystem was written with the other byte order: {0}")]
    ByteOrder(String),

    /// The superblock carries option bits this build does not understand.
    #[error("unsupported option bits {unknown:#x} in superblock")]
    OptionMismatch { unknown: u32 },

    /// No usable superblock, or superblock geometry is inconsistent.
    #[error("superblock: {0}")]
    Superblock(String),

    /// Configured device set disagrees with the on-disk device table.
    #[error("device topology: {0}")]
    Topology(String),

    /// The inode table or block reservation inode is unusable.
    #[error("inode table: {0}")]
    InodeTable(String),

    /// The write-ahead log header is invalid.
    #[error("log: {0}")]
    Log(String),

    /// Bad invocation or environment (missing scratch dir, name mismatch).
    #[error("configuration: {0}")]
    Config(String),

    /// The filesystem is mounted read-write and not declared safe.
    #[error("filesystem {0} is mounted read-write")]
    Mounted(String),

    /// Repair on a shared filesystem attempted away from the metadata server.
    #[error("host {local} is not the metadata server (server is {server})")]
    NotMetadataServer { local: String, server: String },

    /// An offset cannot be addressed with this DAU configuration.
    #[error("file too large for this DAU configuration at offset {offset}")]
    FileTooLarge { offset: u64 },

    /// Scratch space exhausted.
    #[error("no space left for scratch data")]
    NoSpace,

    /// Run interrupted by a termination signal.
    #[error("operation cancelled")]
    Cancelled,
}

impl QfsError {
    /// Exit status a run terminated by this error reports.
    #[must_use]
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Self::Config(_) | Self::Mounted(_) | Self::NotMetadataServer { .. } => {
                ExitStatus::Argument
            }
            Self::NoSpace => ExitStatus::Memory,
            Self::Topology(_) => ExitStatus::Device,
            Self::Superblock(_) | Self::ByteOrder(_) | Self::Format(_) | Self::Parse(_) => {
                ExitStatus::Superblock
            }
            Self::OptionMismatch { .. } => ExitStatus::OptionMismatch,
            Self::InodeTable(_) | Self::Corruption { .. } | Self::FileTooLarge { .. } => {
                ExitStatus::InodeTable
            }
            Self::Log(_) => ExitStatus::Log,
            Self::Io(_) => ExitStatus::Io,
            Self::Cancelled => ExitStatus::Cancelled,
        }
    }
}

/// Result alias using `QfsError`.
pub type Result<T> = std::result::Result<T, QfsError>;
