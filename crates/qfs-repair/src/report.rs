//! Problem taxonomy and the run report.
//!
//! Every inconsistency the checker finds becomes one [`Problem`]. Its kind
//! fixes its severity; the worst severity of a run decides the exit status.

use qfs_error::{ExitStatus, QfsError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

// ── Severity ────────────────────────────────────────────────────────────────

/// How much a problem matters to the filesystem's users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Normalisation; not counted as a problem.
    Info,
    /// Accounting drift with no data at risk.
    Notice,
    /// Lost or misattributed data.
    Alert,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Notice => write!(f, "notice"),
            Self::Alert => write!(f, "alert"),
        }
    }
}

// ── Problem kinds ───────────────────────────────────────────────────────────

/// Category of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProblemKind {
    InvalidInode,
    BadExtent,
    BadIndirect,
    DuplicateBlock,
    StaleEntry,
    Orphan,
    BadDirBlock,
    SegmentIndex,
    SegmentMember,
    LostAllocation,
    DirtyLog,
    PastEof,
    IoError,
    DotEntry,
    FileType,
    Extension,
    UnclaimedExtension,
    BlockCount,
    LinkCount,
    Quota,
    LeakedBlocks,
    FreeSpace,
    StaleSuperblock,
    LostFound,
    DirHash,
    WormUpgrade,
}

impl ProblemKind {
    #[must_use]
    pub fn severity(self) -> Severity {
        match self {
            Self::InvalidInode
            | Self::BadExtent
            | Self::BadIndirect
            | Self::DuplicateBlock
            | Self::StaleEntry
            | Self::Orphan
            | Self::BadDirBlock
            | Self::SegmentIndex
            | Self::SegmentMember
            | Self::LostAllocation
            | Self::DirtyLog => Severity::Alert,
            Self::PastEof
            | Self::IoError
            | Self::DotEntry
            | Self::FileType
            | Self::Extension
            | Self::UnclaimedExtension
            | Self::BlockCount
            | Self::LinkCount
            | Self::Quota
            | Self::LeakedBlocks
            | Self::FreeSpace
            | Self::StaleSuperblock
            | Self::LostFound => Severity::Notice,
            Self::DirHash | Self::WormUpgrade => Severity::Info,
        }
    }
}

impl fmt::Display for ProblemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidInode => "invalid_inode",
            Self::BadExtent => "bad_extent",
            Self::BadIndirect => "bad_indirect",
            Self::DuplicateBlock => "duplicate_block",
            Self::StaleEntry => "stale_entry",
            Self::Orphan => "orphan",
            Self::BadDirBlock => "bad_dir_block",
            Self::SegmentIndex => "segment_index",
            Self::SegmentMember => "segment_member",
            Self::LostAllocation => "lost_allocation",
            Self::DirtyLog => "dirty_log",
            Self::PastEof => "past_eof",
            Self::IoError => "io_error",
            Self::DotEntry => "dot_entry",
            Self::FileType => "file_type",
            Self::Extension => "extension",
            Self::UnclaimedExtension => "unclaimed_extension",
            Self::BlockCount => "block_count",
            Self::LinkCount => "link_count",
            Self::Quota => "quota",
            Self::LeakedBlocks => "leaked_blocks",
            Self::FreeSpace => "free_space",
            Self::StaleSuperblock => "stale_superblock",
            Self::LostFound => "lost_found",
            Self::DirHash => "dir_hash",
            Self::WormUpgrade => "worm_upgrade",
        };
        write!(f, "{name}")
    }
}

// ── Problems ────────────────────────────────────────────────────────────────

/// One finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    pub kind: ProblemKind,
    pub severity: Severity,
    /// Inode the finding concerns, if any.
    pub ino: Option<u32>,
    pub detail: String,
    /// Whether the run wrote a fix for it.
    pub repaired: bool,
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity, self.kind)?;
        if let Some(ino) = self.ino {
            write!(f, " inode {ino}")?;
        }
        write!(f, ": {}", self.detail)?;
        if self.repaired {
            write!(f, " (repaired)")?;
        }
        Ok(())
    }
}

// ── Report ──────────────────────────────────────────────────────────────────

/// Tallies gathered along the way.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsckStats {
    /// Slots in the inode table.
    pub inode_slots: u32,
    pub inodes_in_use: u32,
    pub directories: u32,
    pub files: u32,
    pub extensions: u32,
    pub segment_members: u32,
    /// Device blocks claimed by live inodes.
    pub blocks_claimed: u64,
    pub duplicate_keys: u32,
    pub orphans_relocated: u32,
    pub inodes_freed: u32,
    pub inodes_damaged: u32,
    /// Free device blocks after the run.
    pub free_blocks: u64,
}

/// Outcome of one check run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsckReport {
    pub fs_name: String,
    pub repair: bool,
    pub problems: Vec<Problem>,
    pub stats: FsckStats,
    /// Set by preen runs, which look only at the superblock request bits.
    pub preen: Option<ExitStatus>,
}

impl FsckReport {
    #[must_use]
    pub fn new(repair: bool) -> Self {
        Self {
            repair,
            ..Self::default()
        }
    }

    pub fn record(&mut self, kind: ProblemKind, ino: Option<u32>, detail: String, repaired: bool) {
        let severity = kind.severity();
        if severity == Severity::Info {
            debug!(%kind, ?ino, %detail, repaired, "normalised");
        } else {
            warn!(%kind, %severity, ?ino, %detail, repaired, "problem");
        }
        self.problems.push(Problem {
            kind,
            severity,
            ino,
            detail,
            repaired,
        });
    }

    /// Findings at notice severity or above.
    #[must_use]
    pub fn problem_count(&self) -> usize {
        self.count_at_severity(Severity::Notice)
    }

    #[must_use]
    pub fn count_at_severity(&self, min: Severity) -> usize {
        self.problems.iter().filter(|p| p.severity >= min).count()
    }

    #[must_use]
    pub fn count_of(&self, kind: ProblemKind) -> usize {
        self.problems.iter().filter(|p| p.kind == kind).count()
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.problem_count() == 0
    }

    #[must_use]
    pub fn worst_severity(&self) -> Option<Severity> {
        self.problems.iter().map(|p| p.severity).max()
    }

    #[must_use]
    pub fn exit_status(&self) -> ExitStatus {
        if let Some(status) = self.preen {
            return status;
        }
        match self.worst_severity() {
            Some(Severity::Alert) => ExitStatus::Major,
            Some(Severity::Notice) => ExitStatus::Minor,
            Some(Severity::Info) | None => ExitStatus::Clean,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| QfsError::Format(e.to_string()))
    }
}

impl fmt::Display for FsckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.repair { "repair" } else { "check" };
        writeln!(
            f,
            "{} ({mode}): {} problems, {}",
            self.fs_name,
            self.problem_count(),
            self.exit_status()
        )?;
        if self.preen.is_none() {
            let s = &self.stats;
            writeln!(
                f,
                "  {} of {} inodes in use ({} directories, {} files), {} blocks claimed, {} free",
                s.inodes_in_use, s.inode_slots, s.directories, s.files, s.blocks_claimed, s.free_blocks
            )?;
        }
        for problem in &self.problems {
            writeln!(f, "  {problem}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worst_severity_decides_exit_status() {
        let mut report = FsckReport::new(false);
        assert_eq!(report.exit_status(), ExitStatus::Clean);
        report.record(ProblemKind::DirHash, Some(9), "hash".into(), false);
        assert_eq!(report.exit_status(), ExitStatus::Clean);
        assert!(report.is_clean());
        report.record(ProblemKind::LinkCount, Some(9), "nlink".into(), false);
        assert_eq!(report.exit_status(), ExitStatus::Minor);
        report.record(ProblemKind::Orphan, Some(10), "orphan".into(), false);
        assert_eq!(report.exit_status(), ExitStatus::Major);
        assert_eq!(report.problem_count(), 2);
        assert_eq!(report.count_at_severity(Severity::Info), 3);
        assert_eq!(report.count_of(ProblemKind::Orphan), 1);
    }

    #[test]
    fn preen_status_overrides_findings() {
        let mut report = FsckReport::new(false);
        report.preen = Some(ExitStatus::Minor);
        assert_eq!(report.exit_status(), ExitStatus::Minor);
    }

    #[test]
    fn display_and_json() {
        let mut report = FsckReport::new(true);
        report.fs_name = "qfs1".into();
        report.record(ProblemKind::StaleEntry, Some(12), "entry \"x\"".into(), true);
        let text = report.to_string();
        assert!(text.contains("[alert] stale_entry inode 12"));
        assert!(text.contains("(repaired)"));
        let json = report.to_json().expect("json");
        let back: FsckReport = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, report);
        assert!(json.contains("\"stale_entry\""));
    }

    #[test]
    fn every_kind_has_a_fixed_severity() {
        assert_eq!(ProblemKind::DuplicateBlock.severity(), Severity::Alert);
        assert_eq!(ProblemKind::LeakedBlocks.severity(), Severity::Notice);
        assert_eq!(ProblemKind::WormUpgrade.severity(), Severity::Info);
        assert!(Severity::Alert > Severity::Notice);
    }
}
