//! Write-ahead log validation. The log region is claimed before the inode
//! scan so no file can own it.

use crate::context::FsckContext;
use crate::report::ProblemKind;
use qfs_alloc::ClaimOutcome;
use qfs_error::{QfsError, Result};
use qfs_ondisk::{LogHeader, OptionMask};
use qfs_types::DEV_BSIZE;
use tracing::{debug, info};

pub(crate) fn validate(ctx: &mut FsckContext<'_>) -> Result<()> {
    let sb = &ctx.sb;
    if !sb.has_log() {
        if sb.option_mask.contains(OptionMask::LOG) {
            return Err(QfsError::Log(format!("{} has the log option but no log", sb.name)));
        }
        debug!("no log");
        return Ok(());
    }
    let (ord, start, len, fs_id) = (sb.log_ord, u64::from(sb.log_block), sb.log_len, sb.fs_id);

    let bytes = ctx.io.read_device(ord, start, DEV_BSIZE as usize)?;
    let header = LogHeader::parse_from_bytes(&bytes).map_err(|e| QfsError::Log(e.to_string()))?;
    header
        .validate(fs_id, len)
        .map_err(|e| QfsError::Log(e.to_string()))?;

    claim_region(ctx)?;

    if header.is_dirty() {
        ctx.problem(
            ProblemKind::DirtyLog,
            None,
            format!(
                "log holds unapplied records (head {}, tail {}, seq {})",
                header.head, header.tail, header.seq
            ),
        );
        ctx.dirty_log = Some(header);
    } else {
        info!(%ord, block = start, len, "log is clean");
    }
    Ok(())
}

/// Allocate the log region in the working bitmap and keep inodes off it.
pub(crate) fn claim_region(ctx: &mut FsckContext<'_>) -> Result<()> {
    let (ord, start) = (ctx.sb.log_ord, u64::from(ctx.sb.log_block));
    let end = start + u64::from(ctx.sb.log_len);
    let map = ctx
        .maps
        .get_mut(&ord)
        .ok_or_else(|| QfsError::Log(format!("log on ordinal {ord}, which has no bitmap")))?;
    let unit = map.geometry().unit_blocks;
    let mut block = start - start % unit;
    while block < end {
        match map.claim(block, unit)? {
            ClaimOutcome::Fresh => {}
            outcome => {
                return Err(QfsError::Log(format!(
                    "log block {block} on ordinal {ord} cannot be claimed ({outcome:?})"
                )));
            }
        }
        block += unit;
    }
    ctx.reserve(ord, start..end);
    Ok(())
}
