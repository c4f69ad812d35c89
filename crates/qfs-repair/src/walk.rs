//! Extent walks.
//!
//! One recursive walk serves four purposes: pass 1 claims every block an
//! inode owns and validates indirect headers, pass 2 confirms which owners
//! share a duplicated block, pass 3 releases the blocks of inodes it frees,
//! and a bitmap rebuild re-claims the blocks of every surviving inode.

use crate::context::FsckContext;
use crate::dup::ClaimSpan;
use crate::ledger::InodeFlags;
use crate::report::ProblemKind;
use qfs_alloc::ClaimOutcome;
use qfs_error::{QfsError, Result};
use qfs_extent::{DauGeometry, INDIRECT_SLOT, file_class, mapped_len, offset_of};
use qfs_ondisk::{DeviceClass, ExtentPtr, IndirectBlock, Inode, InodeStatus};
use qfs_types::{DEV_BSIZE, InodeId, NDEXT, NOEXT, Ordinal};
use tracing::{debug, trace};

const BSIZE: u64 = DEV_BSIZE as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WalkMode {
    /// Claim blocks in the working bitmaps, reporting every defect.
    Claim,
    /// Record owners of blocks already known to be shared.
    Confirm,
    /// Give back blocks of an inode being freed or damaged.
    Release,
    /// Re-claim blocks after the working bitmaps were reset.
    Rebuild,
}

/// Per-inode walk facts threaded through the recursion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct WalkState {
    past_eof: bool,
    io_error: bool,
}

/// Outcome of visiting one pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Device blocks now owned, the pointer's own block included.
    Counted(u64),
    Skipped,
    /// The pointer must be cleared.
    Invalid,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct WalkSummary {
    /// Device blocks owned (claim walks only).
    pub blocks: u64,
    /// Extent pointers in the inode were cleared.
    pub changed: bool,
    pub io_error: bool,
    /// The direct map cannot be used at all.
    pub unusable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Data { len: u64 },
    Indirect { level: u8 },
}

struct Walker<'c, 'a> {
    ctx: &'c mut FsckContext<'a>,
    owner: InodeId,
    geom: DauGeometry,
    eof: u64,
    data_class: DeviceClass,
    mode: WalkMode,
}

/// Walk every extent of `inode`. Cleared pointers are removed from
/// `inode` in place; the caller decides whether to write it.
pub(crate) fn walk_inode(ctx: &mut FsckContext<'_>, inode: &mut Inode, mode: WalkMode) -> Result<WalkSummary> {
    if !inode.has_resident_data() {
        return Ok(WalkSummary::default());
    }
    let mut walker = Walker {
        geom: DauGeometry::for_inode(&ctx.sb, inode),
        data_class: file_class(&ctx.sb, inode),
        eof: mapped_len(inode),
        owner: inode.id,
        ctx,
        mode,
    };
    if inode.status.contains(InodeStatus::DIRECT_MAP) {
        return walker.direct_map(inode);
    }

    let mut summary = WalkSummary::default();
    let mut state = WalkState::default();
    for slot in 0..NOEXT {
        let ptr = inode.extents[slot];
        if ptr.is_hole() {
            continue;
        }
        let target = if slot < NDEXT {
            Target::Data {
                len: walker.geom.direct_unit(slot) / BSIZE,
            }
        } else {
            #[expect(clippy::cast_possible_truncation)]
            let level = (slot - INDIRECT_SLOT + 1) as u8;
            Target::Indirect { level }
        };
        let mut path = Vec::with_capacity(3);
        let (step, next) = walker.visit(ptr, target, slot, &mut path, state)?;
        state = next;
        match step {
            Step::Counted(blocks) => summary.blocks += blocks,
            Step::Skipped => {}
            Step::Invalid => {
                inode.extents[slot] = ExtentPtr::HOLE;
                summary.changed = true;
            }
        }
    }
    summary.io_error = state.io_error;
    Ok(summary)
}

/// Whether the direct-map span of `inode` is structurally usable.
pub(crate) fn direct_map_fault(ctx: &FsckContext<'_>, inode: &Inode) -> Option<String> {
    let base = inode.extents[0];
    let geom = DauGeometry::for_inode(&ctx.sb, inode);
    let large = geom.large / BSIZE;
    let span = inode.dm_span;
    if inode.extents[1..].iter().any(|p| !p.is_hole()) {
        return Some("direct-mapped file with extra extents".to_owned());
    }
    if span == 0 || span % large != 0 || span * BSIZE < inode.size {
        return Some(format!("direct-map span of {span} blocks does not fit size {}", inode.size));
    }
    let block = u64::from(base.block);
    let Some(map) = ctx.maps.get(&base.ord) else {
        return Some(format!("direct map on ordinal {} without a bitmap", base.ord));
    };
    let g = map.geometry();
    if g.class != file_class(&ctx.sb, inode) || g.large_blocks != large {
        return Some(format!("direct map on ordinal {} of the wrong class", base.ord));
    }
    if block % large != 0 || block + span > g.bits * g.unit_blocks {
        return Some(format!("direct map at block {block} outside ordinal {}", base.ord));
    }
    if ctx.is_reserved(base.ord, block, span) {
        return Some(format!("direct map at block {block} overlaps the system area"));
    }
    None
}

impl Walker<'_, '_> {
    fn ino(&self) -> u32 {
        self.owner.ino.0
    }

    fn reports(&self) -> bool {
        self.mode == WalkMode::Claim
    }

    fn flag(&mut self, flag: InodeFlags) {
        let ino = self.ino();
        if let Some(rec) = self.ctx.ledger.get_mut(ino) {
            rec.flags.insert(flag);
        }
    }

    fn direct_map(&mut self, inode: &Inode) -> Result<WalkSummary> {
        let mut summary = WalkSummary::default();
        if let Some(fault) = direct_map_fault(&*self.ctx, inode) {
            if self.reports() {
                debug!(ino = self.ino(), fault, "direct map unusable");
            }
            summary.unusable = true;
            return Ok(summary);
        }
        let base = inode.extents[0];
        let large = self.geom.large / BSIZE;
        let start = u64::from(base.block);
        let mut block = start;
        while block < start + inode.dm_span {
            let span = self.claim_span(base.ord, block, large, self.data_class);
            if let Some(span) = span {
                if let (Step::Counted(n), _) = self.settle(span, None, &mut Vec::new(), WalkState::default())? {
                    summary.blocks += n;
                }
            }
            block += large;
        }
        Ok(summary)
    }

    /// Validate a pointer's placement; `None` when it cannot be owned.
    fn claim_span(&self, ord: Ordinal, block: u64, len: u64, class: DeviceClass) -> Option<ClaimSpan> {
        let sb = &self.ctx.sb;
        let entry = sb.device(ord)?;
        let map = self.ctx.maps.get(&ord)?;
        if !entry.owns_bitmap() || entry.class != class {
            return None;
        }
        let g = map.geometry();
        if !map.is_aligned(block, len) || block.checked_add(len)? > g.bits * g.unit_blocks {
            return None;
        }
        if self.ctx.is_reserved(ord, block, len) {
            return None;
        }
        Some(ClaimSpan {
            ord,
            class,
            block,
            len,
            unit: g.unit_blocks,
            large: g.large_blocks,
        })
    }

    fn target_span(&self, ptr: ExtentPtr, target: Target) -> Option<ClaimSpan> {
        let sb = &self.ctx.sb;
        let entry = sb.device(ptr.ord)?;
        let (class, len, large) = match target {
            Target::Data { len } => (self.data_class, len, self.geom.large / BSIZE),
            Target::Indirect { .. } => {
                let len = u64::from(sb.lg_meta) / BSIZE;
                (sb.meta_class(), len, len)
            }
        };
        let device_large = u64::from(entry.stripe_width()) * u64::from(sb.dau_sizes(entry.class).1) / BSIZE;
        if device_large != large {
            return None;
        }
        self.claim_span(ptr.ord, u64::from(ptr.block), len, class)
    }

    fn visit(
        &mut self,
        ptr: ExtentPtr,
        target: Target,
        slot: usize,
        path: &mut Vec<u64>,
        mut state: WalkState,
    ) -> Result<(Step, WalkState)> {
        let ino = self.ino();
        let Some(offset) = offset_of(&self.geom, slot, path) else {
            if self.reports() {
                self.ctx.problem(
                    ProblemKind::BadExtent,
                    Some(ino),
                    format!("pointer at slot {slot} path {path:?} addresses no offset"),
                );
                return Ok((Step::Invalid, state));
            }
            return Ok((Step::Skipped, state));
        };

        if offset >= self.eof {
            if self.reports() && !state.past_eof {
                state.past_eof = true;
                self.ctx.problem(
                    ProblemKind::PastEof,
                    Some(ino),
                    format!("blocks mapped past end of file at offset {offset} (size {})", self.eof),
                );
            }
            if self.ctx.repairing() {
                let step = if self.reports() { Step::Invalid } else { Step::Skipped };
                return Ok((step, state));
            }
        }

        let Some(span) = self.target_span(ptr, target) else {
            if self.reports() {
                self.ctx.problem(
                    ProblemKind::BadExtent,
                    Some(ino),
                    format!(
                        "slot {slot} path {path:?}: block {} on ordinal {} is not a valid {target:?}",
                        ptr.block, ptr.ord
                    ),
                );
                return Ok((Step::Invalid, state));
            }
            return Ok((Step::Skipped, state));
        };

        let level = match target {
            Target::Data { .. } => None,
            Target::Indirect { level } => Some(level),
        };
        let descend = level.map(|l| (l, slot));
        self.settle(span, descend, path, state)
    }

    /// Apply the walk mode to a validated span.
    fn settle(
        &mut self,
        span: ClaimSpan,
        descend: Option<(u8, usize)>,
        path: &mut Vec<u64>,
        state: WalkState,
    ) -> Result<(Step, WalkState)> {
        match self.mode {
            WalkMode::Claim => self.claim(span, descend, path, state),
            WalkMode::Confirm => {
                if self.ctx.dups.overlaps(&span)? {
                    self.ctx.dups.record_claim(self.ino(), &span)?;
                }
                let state = self.children(span, descend, path, state)?.1;
                Ok((Step::Skipped, state))
            }
            WalkMode::Release => {
                match self.ctx.dups.release_claim(self.ino(), &span)? {
                    Some(left) if left > 0 => {
                        trace!(ino = self.ino(), block = span.block, left, "shared block kept");
                        self.ctx.rebuild_maps = true;
                        return Ok((Step::Skipped, state));
                    }
                    _ => {}
                }
                let state = self.children(span, descend, path, state)?.1;
                if let Some(map) = self.ctx.maps.get_mut(&span.ord) {
                    map.release(span.block, span.len)?;
                }
                Ok((Step::Skipped, state))
            }
            WalkMode::Rebuild => {
                if let Some(map) = self.ctx.maps.get_mut(&span.ord) {
                    map.claim(span.block, span.len)?;
                }
                let state = self.children(span, descend, path, state)?.1;
                Ok((Step::Skipped, state))
            }
        }
    }

    fn claim(
        &mut self,
        span: ClaimSpan,
        descend: Option<(u8, usize)>,
        path: &mut Vec<u64>,
        state: WalkState,
    ) -> Result<(Step, WalkState)> {
        let ino = self.ino();
        let Some(map) = self.ctx.maps.get_mut(&span.ord) else {
            return Ok((Step::Invalid, state));
        };
        match map.claim(span.block, span.len)? {
            ClaimOutcome::Fresh => {
                let (step, state) = self.children(span, descend, path, state)?;
                if step == Step::Invalid {
                    if let Some(map) = self.ctx.maps.get_mut(&span.ord) {
                        map.release(span.block, span.len)?;
                    }
                }
                Ok((step, state))
            }
            ClaimOutcome::Duplicate => {
                trace!(ino, ord = %span.ord, block = span.block, "block already claimed");
                self.ctx.dups.record_claim(ino, &span)?;
                self.flag(InodeFlags::DUPLICATE);
                Ok((Step::Counted(span.len), state))
            }
            outcome @ (ClaimOutcome::OutOfRange | ClaimOutcome::Misaligned) => {
                self.ctx.problem(
                    ProblemKind::BadExtent,
                    Some(ino),
                    format!("block {} on ordinal {}: {outcome:?}", span.block, span.ord),
                );
                Ok((Step::Invalid, state))
            }
        }
    }

    /// Visit the entries of an indirect block. Data spans count
    /// themselves. Returns `Invalid` only in claim walks, for a block
    /// whose header does not belong to this owner and level.
    fn children(
        &mut self,
        span: ClaimSpan,
        descend: Option<(u8, usize)>,
        path: &mut Vec<u64>,
        mut state: WalkState,
    ) -> Result<(Step, WalkState)> {
        let Some((level, slot)) = descend else {
            return Ok((Step::Counted(span.len), state));
        };
        let ino = self.ino();
        let size = usize::try_from(self.ctx.sb.lg_meta).unwrap_or(usize::MAX);
        let mut bytes = match self.ctx.io.read(span.ord, span.block, size) {
            Ok(bytes) => bytes,
            Err(QfsError::Io(e)) => {
                if self.reports() {
                    self.ctx.unrepaired(
                        ProblemKind::IoError,
                        Some(ino),
                        format!("indirect block {} on ordinal {}: {e}", span.block, span.ord),
                    );
                    self.flag(InodeFlags::IO_ERROR);
                    self.ctx.suppress_bitmap_write = true;
                }
                state.io_error = true;
                return Ok((Step::Counted(span.len), state));
            }
            Err(e) => return Err(e),
        };
        let block = match IndirectBlock::parse_from_bytes(&bytes) {
            Ok(block) if block.header.matches(self.owner, u32::from(level)) => block,
            parsed => {
                if !self.reports() {
                    return Ok((Step::Skipped, state));
                }
                let detail = match parsed {
                    Ok(block) => format!(
                        "level {level} block {} on ordinal {} belongs to {} level {}",
                        span.block, span.ord, block.header.owner, block.header.level
                    ),
                    Err(e) => format!("block {} on ordinal {}: {e}", span.block, span.ord),
                };
                self.ctx.problem(ProblemKind::BadIndirect, Some(ino), detail);
                return Ok((Step::Invalid, state));
            }
        };

        let mut counted = span.len;
        let mut dirty = false;
        for (idx, child) in block.entries.iter().enumerate() {
            if child.is_hole() {
                continue;
            }
            let target = if level == 1 {
                Target::Data {
                    len: self.geom.large / BSIZE,
                }
            } else {
                Target::Indirect { level: level - 1 }
            };
            path.push(idx as u64);
            let (step, next) = self.visit(*child, target, slot, path, state)?;
            path.pop();
            state = next;
            match step {
                Step::Counted(n) => counted += n,
                Step::Skipped => {}
                Step::Invalid => {
                    if self.ctx.repairing() {
                        IndirectBlock::clear_entry_in_place(&mut bytes, idx)
                            .map_err(|e| QfsError::Format(e.to_string()))?;
                        dirty = true;
                    }
                }
            }
        }
        if dirty {
            self.ctx.io.write(span.ord, span.block, &bytes)?;
            debug!(ino, block = span.block, ord = %span.ord, "indirect entries cleared");
        }
        Ok((Step::Counted(counted), state))
    }
}
