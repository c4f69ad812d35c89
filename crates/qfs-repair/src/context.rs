//! State threaded through every phase of a run.

use crate::dup::DupLedger;
use crate::inodes::InodeTable;
use crate::ledger::InodeLedger;
use crate::options::FsckOptions;
use crate::quota::QuotaTally;
use crate::report::{FsckReport, ProblemKind};
use crate::superblock::Placement;
use qfs_alloc::{BitmapGeometry, WorkingBitmap, check_system_area};
use qfs_block::{BlockIo, StripeLayout};
use qfs_dir::name_hash;
use qfs_error::Result;
use qfs_ondisk::{LogHeader, OptionMask, Superblock};
use qfs_types::{DEV_BSIZE, Ordinal};
use std::collections::BTreeMap;
use std::ops::Range;
use tracing::{debug, info};

/// Blocks no inode may claim: system areas and the log.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Reserved {
    ord: Ordinal,
    blocks: Range<u64>,
}

pub(crate) struct FsckContext<'a> {
    pub sb: Superblock,
    pub io: BlockIo,
    pub options: &'a FsckOptions,
    pub now: u64,
    pub maps: BTreeMap<Ordinal, WorkingBitmap>,
    reserved: Vec<Reserved>,
    pub table: InodeTable,
    pub ledger: InodeLedger,
    pub dups: DupLedger,
    pub quota: QuotaTally,
    pub report: FsckReport,
    /// Superblock copies that disagree with the master.
    pub stale_copies: Vec<(Ordinal, u64)>,
    /// The master superblock needs rewriting.
    pub sb_changed: bool,
    /// A directory block could not be read; orphan relocation is unsafe.
    pub dir_io_error: bool,
    /// An indirect block could not be read; the computed maps are
    /// incomplete and must not replace the on-disk ones.
    pub suppress_bitmap_write: bool,
    /// Releases skipped shared blocks; the maps must be recomputed.
    pub rebuild_maps: bool,
    /// Log header to reset at write-back.
    pub dirty_log: Option<LogHeader>,
    /// Some inode was freed by this run.
    pub any_freed: bool,
}

/// Stripe-aware I/O over the placed devices.
pub(crate) fn open_io(placement: &Placement) -> BlockIo {
    let sb = &placement.sb;
    let mut io = BlockIo::new(placement.devices.clone());
    for entry in sb.eq.iter().filter(|e| e.num_group > 1) {
        io.set_stripe(
            entry.ord,
            StripeLayout {
                width: entry.num_group,
                unit_blocks: u64::from(sb.lg_data / DEV_BSIZE),
            },
        );
    }
    io
}

impl<'a> FsckContext<'a> {
    pub(crate) fn new(placement: Placement, options: &'a FsckOptions, now: u64, report: FsckReport) -> Result<Self> {
        let io = open_io(&placement);
        let sb = placement.sb;
        let (table, _) = InodeTable::load(&sb, &io)?;
        let scratch = options.scratch_dir.as_deref();
        let (maps, reserved) = build_maps(&sb, scratch)?;
        let ledger = InodeLedger::new(table.count());
        let dups = DupLedger::new(scratch)?;
        info!(
            slots = table.count(),
            bitmaps = maps.len(),
            "inode table and working bitmaps ready"
        );
        let mut ctx = Self {
            sb,
            io,
            options,
            now,
            maps,
            reserved,
            table,
            ledger,
            dups,
            quota: QuotaTally::default(),
            report,
            stale_copies: placement.stale,
            sb_changed: false,
            dir_io_error: false,
            suppress_bitmap_write: false,
            rebuild_maps: false,
            dirty_log: None,
            any_freed: false,
        };
        ctx.report.stats.inode_slots = ctx.table.count();
        Ok(ctx)
    }

    /// Start the working bitmaps over: every unit free except the system
    /// areas. Reservations other than system areas are dropped.
    pub(crate) fn reset_maps(&mut self) -> Result<()> {
        let (maps, reserved) = build_maps(&self.sb, self.options.scratch_dir.as_deref())?;
        self.maps = maps;
        self.reserved = reserved;
        Ok(())
    }

    pub(crate) fn reserve(&mut self, ord: Ordinal, blocks: Range<u64>) {
        self.reserved.push(Reserved { ord, blocks });
    }

    pub(crate) fn is_reserved(&self, ord: Ordinal, block: u64, len: u64) -> bool {
        let end = block.saturating_add(len);
        self.reserved
            .iter()
            .any(|r| r.ord == ord && block < r.blocks.end && r.blocks.start < end)
    }

    pub(crate) fn repairing(&self) -> bool {
        self.options.repair
    }

    /// Record a finding that a repair run fixes.
    pub(crate) fn problem(&mut self, kind: ProblemKind, ino: Option<u32>, detail: String) {
        let repaired = self.options.repair;
        self.report.record(kind, ino, detail, repaired);
    }

    /// Record a finding no run fixes.
    pub(crate) fn unrepaired(&mut self, kind: ProblemKind, ino: Option<u32>, detail: String) {
        self.report.record(kind, ino, detail, false);
    }

    /// Directory hashes are verified and rewritten.
    pub(crate) fn checks_hashes(&self) -> bool {
        self.options.regen_dir_hash
            || (self.options.repair && self.sb.option_mask.contains(OptionMask::DIR_HASH))
    }

    /// Hash a name for a new directory entry; zero when hashing is off.
    pub(crate) fn entry_hash(&self, name: &[u8]) -> u16 {
        if self.options.regen_dir_hash || self.sb.option_mask.contains(OptionMask::DIR_HASH) {
            name_hash(name)
        } else {
            0
        }
    }
}

fn build_maps(
    sb: &Superblock,
    scratch: Option<&std::path::Path>,
) -> Result<(BTreeMap<Ordinal, WorkingBitmap>, Vec<Reserved>)> {
    let mut maps = BTreeMap::new();
    let mut reserved = Vec::new();
    for geom in BitmapGeometry::for_filesystem(sb)? {
        let area = check_system_area(sb, geom.ord)?;
        if area.legacy_rounding {
            debug!(ord = %geom.ord, blocks = area.blocks, "system area uses legacy rounding");
        }
        let mut map = WorkingBitmap::build_free_map(geom, scratch)?;
        map.clear_allocated(area.blocks)?;
        reserved.push(Reserved {
            ord: geom.ord,
            blocks: 0..area.blocks,
        });
        maps.insert(geom.ord, map);
    }
    Ok((maps, reserved))
}
