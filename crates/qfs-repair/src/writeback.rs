//! Write-back: bitmaps, free-space counters, the log header and every
//! superblock copy.

use crate::context::FsckContext;
use crate::options::SharedConversion;
use crate::report::ProblemKind;
use crate::superblock::COPY_BLOCKS;
use qfs_error::{QfsError, Result};
use qfs_ondisk::{FsckRequest, OptionMask};
use qfs_types::Ordinal;
use tracing::{debug, info, warn};

pub(crate) fn run(ctx: &mut FsckContext<'_>) -> Result<()> {
    reconcile_bitmaps(ctx)?;
    reset_log(ctx)?;
    apply_superblock_changes(ctx);
    rewrite_superblocks(ctx)?;
    ctx.io.flush()?;
    let stats = ctx.io.stats();
    debug!(?stats, "device I/O");
    Ok(())
}

/// Compare every computed map with its on-disk copy, then the free-space
/// counters with the computed maps.
fn reconcile_bitmaps(ctx: &mut FsckContext<'_>) -> Result<()> {
    let write = ctx.repairing() && !ctx.suppress_bitmap_write;
    if ctx.repairing() && ctx.suppress_bitmap_write {
        warn!("indirect blocks were unreadable; on-disk bitmaps left as they are");
    }
    let mut total_free = 0_u64;
    let ords: Vec<Ordinal> = ctx.maps.keys().copied().collect();
    for ord in ords {
        let Some(map) = ctx.maps.get_mut(&ord) else {
            continue;
        };
        let on_disk = map.read_on_disk(&ctx.io)?;
        let diff = map.diff(&on_disk)?;
        let free = map.free_blocks()?;
        total_free += free;
        if diff.is_clean() {
            debug!(%ord, free, "bitmap matches");
        } else {
            if write {
                map.write_to(&ctx.io)?;
            }
            if diff.lost_allocations > 0 {
                ctx.report.record(
                    ProblemKind::LostAllocation,
                    None,
                    format!("ordinal {ord}: {} blocks in use are marked free", diff.lost_allocations),
                    write,
                );
            }
            if diff.leaked_blocks > 0 {
                ctx.report.record(
                    ProblemKind::LeakedBlocks,
                    None,
                    format!("ordinal {ord}: {} unreferenced blocks are marked in use", diff.leaked_blocks),
                    write,
                );
            }
        }

        if ctx.suppress_bitmap_write {
            continue;
        }
        let recorded = ctx.sb.eq.get(ord.index()).map_or(0, |e| e.space);
        if recorded != free {
            ctx.report.record(
                ProblemKind::FreeSpace,
                None,
                format!("ordinal {ord} records {recorded} free blocks, bitmap has {free}"),
                write,
            );
            if write {
                if let Some(entry) = ctx.sb.eq.get_mut(ord.index()) {
                    entry.space = free;
                }
                ctx.sb_changed = true;
            }
        }
    }
    ctx.report.stats.free_blocks = total_free;

    if !ctx.suppress_bitmap_write && ctx.sb.space != total_free {
        ctx.report.record(
            ProblemKind::FreeSpace,
            None,
            format!("filesystem records {} free blocks, bitmaps have {total_free}", ctx.sb.space),
            write,
        );
        if write {
            ctx.sb.space = total_free;
            ctx.sb_changed = true;
        }
    }
    Ok(())
}

fn reset_log(ctx: &mut FsckContext<'_>) -> Result<()> {
    if !ctx.repairing() {
        return Ok(());
    }
    let Some(mut header) = ctx.dirty_log.take() else {
        return Ok(());
    };
    header.reset();
    let bytes = header.to_bytes().map_err(|e| QfsError::Log(e.to_string()))?;
    ctx.io
        .write_device(ctx.sb.log_ord, u64::from(ctx.sb.log_block), &bytes)?;
    info!(seq = header.seq, "log reset");
    Ok(())
}

/// Request bits, rename, shared conversion and the hash option.
fn apply_superblock_changes(ctx: &mut FsckContext<'_>) {
    let options = ctx.options;
    if options.repair && !ctx.sb.fsck_request.is_empty() {
        debug!(bits = ctx.sb.fsck_request.0, "fsck request cleared");
        ctx.sb.fsck_request = FsckRequest::default();
        ctx.sb_changed = true;
    }
    if options.regen_dir_hash && !ctx.sb.option_mask.contains(OptionMask::DIR_HASH) {
        ctx.sb.option_mask = OptionMask(ctx.sb.option_mask.0 | OptionMask::DIR_HASH.0);
        ctx.sb_changed = true;
    }
    if !options.repair {
        return;
    }
    if let Some(name) = &options.rename {
        if *name != ctx.sb.name {
            info!(from = %ctx.sb.name, to = %name, "filesystem renamed");
            ctx.sb.name.clone_from(name);
            ctx.report.fs_name.clone_from(name);
            ctx.sb_changed = true;
        }
    }
    if let Some(conversion) = options.convert_shared {
        let shared = conversion == SharedConversion::ToShared;
        if ctx.sb.shared != shared {
            info!(shared, "shared flag converted");
            ctx.sb.shared = shared;
            ctx.sb_changed = true;
        }
    }
}

/// Write both copies on every present device when the master changed, or
/// when some copy disagreed with it and this is a repair run.
fn rewrite_superblocks(ctx: &mut FsckContext<'_>) -> Result<()> {
    let stale = ctx.repairing() && !ctx.stale_copies.is_empty();
    if !ctx.sb_changed && !stale {
        return Ok(());
    }
    if ctx.sb_changed {
        ctx.sb.update_time = ctx.now;
    }
    let mut written = 0_u32;
    for idx in 0..ctx.sb.eq.len() {
        let ord = Ordinal(u16::try_from(idx).unwrap_or(u16::MAX));
        if !ctx.io.is_present(ord) {
            continue;
        }
        let mut copy = ctx.sb.clone();
        copy.ord = ord;
        let bytes = copy.to_bytes().map_err(|e| QfsError::Superblock(e.to_string()))?;
        for block in COPY_BLOCKS {
            ctx.io.write_device(ord, block, &bytes)?;
            written += 1;
        }
    }
    ctx.stale_copies.clear();
    info!(copies = written, update_time = ctx.sb.update_time, "superblocks written");
    Ok(())
}
