#![forbid(unsafe_code)]
//! Offline consistency checker and repairer.
//!
//! [`run_fsck`] takes the devices of one filesystem in any order, picks the
//! authoritative superblock, scans every inode (pass 1), checks directories,
//! segment indexes and extension chains (pass 2), settles duplicates, orphans
//! and counts (pass 3), and finally reconciles bitmaps and superblocks with
//! what was found. Nothing is written unless the options allow it.

mod context;
mod dup;
mod env;
mod file;
mod inodes;
mod ledger;
mod links;
mod log;
mod lost_found;
mod options;
mod pass1;
mod pass2;
mod pass3;
mod quota;
mod report;
mod superblock;
mod walk;
mod writeback;

pub use env::{Environment, MountState, StaticEnvironment};
pub use options::{FsckOptions, MAX_FS_NAME_LEN, SharedConversion};
pub use report::{FsckReport, FsckStats, Problem, ProblemKind, Severity};

use context::FsckContext;
use qfs_block::ByteDevice;
use qfs_error::{ExitStatus, Result};
use qfs_ondisk::{FsckRequest, Superblock};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Stage of a run, for progress logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Superblock,
    Log,
    Inodes,
    Directories,
    Resolve,
    WriteBack,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Superblock => "superblock",
            Self::Log => "log",
            Self::Inodes => "pass 1: inodes",
            Self::Directories => "pass 2: directories",
            Self::Resolve => "pass 3: duplicates, orphans and counts",
            Self::WriteBack => "write-back",
        };
        f.write_str(name)
    }
}

fn enter(phase: Phase, options: &FsckOptions) -> Result<()> {
    options.check_cancelled()?;
    info!(%phase, "phase");
    Ok(())
}

/// Exit status a preen run reports for the superblock's request bits.
fn preen_status(sb: &Superblock) -> ExitStatus {
    if sb.fsck_request.contains(FsckRequest::ALERT) {
        ExitStatus::Major
    } else if sb.fsck_request.is_empty() {
        ExitStatus::Clean
    } else {
        ExitStatus::Minor
    }
}

/// Check, and with [`FsckOptions::repair`] fix, the filesystem on `devices`.
///
/// Problems found on the way are values in the returned report. An `Err`
/// means the run could not complete; its [`qfs_error::QfsError::exit_status`]
/// is the status to exit with.
pub fn run_fsck(
    devices: Vec<Arc<dyn ByteDevice>>,
    options: &FsckOptions,
    env: &dyn Environment,
) -> Result<FsckReport> {
    options.validate()?;
    enter(Phase::Superblock, options)?;
    let placement = superblock::reconcile(superblock::read_copies(devices)?)?;
    superblock::validate_master(&placement.sb, options)?;

    let mut report = FsckReport::new(options.repair);
    report.fs_name.clone_from(&placement.sb.name);
    if options.preen {
        let status = preen_status(&placement.sb);
        info!(bits = placement.sb.fsck_request.0, %status, "preen");
        report.preen = Some(status);
        return Ok(report);
    }
    for (ord, block) in &placement.stale {
        report.record(
            ProblemKind::StaleSuperblock,
            None,
            format!("superblock copy at ordinal {ord} block {block} is stale or unreadable"),
            options.repair,
        );
    }
    superblock::check_mount(&placement.sb, options, env)?;

    let mut ctx = FsckContext::new(placement, options, env.now(), report)?;
    superblock::check_hosts(&ctx.sb, &ctx.io, &ctx.table, options, env)?;

    enter(Phase::Log, options)?;
    log::validate(&mut ctx)?;

    enter(Phase::Inodes, options)?;
    pass1::run(&mut ctx)?;

    enter(Phase::Directories, options)?;
    pass2::run(&mut ctx)?;

    enter(Phase::Resolve, options)?;
    pass3::run(&mut ctx)?;

    enter(Phase::WriteBack, options)?;
    writeback::run(&mut ctx)?;

    let report = ctx.report;
    let status = report.exit_status();
    if status == ExitStatus::Clean {
        info!(name = %report.fs_name, "filesystem is clean");
    } else {
        warn!(name = %report.fs_name, problems = report.problem_count(), %status, "filesystem had problems");
    }
    Ok(report)
}
