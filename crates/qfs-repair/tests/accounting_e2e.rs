#![forbid(unsafe_code)]
//! Allocation and usage accounting: on-disk bitmaps, free-space counters
//! and quota records against what the inodes actually hold.

use qfs_alloc::{BitmapGeometry, bitmap_is_free, bitmap_mark_allocated, bitmap_mark_free};
use qfs_error::ExitStatus;
use qfs_harness::{FileSpec, ImageBuilder, TestImage};
use qfs_ondisk::{QuotaDomain, QuotaRecord};
use qfs_repair::{FsckOptions, FsckReport, ProblemKind, StaticEnvironment, run_fsck};
use qfs_types::{InodeId, Ordinal, SUPERBLK};

const ROOT: InodeId = InodeId::new(2, 1);

fn check(image: &TestImage) -> FsckReport {
    run_fsck(image.devices(), &FsckOptions::check_only(), &StaticEnvironment::default())
        .expect("check run")
}

fn repair(image: &TestImage) -> FsckReport {
    run_fsck(image.devices(), &FsckOptions::repairing(), &StaticEnvironment::default())
        .expect("repair run")
}

fn image_with_file() -> (TestImage, InodeId) {
    let mut draft = ImageBuilder::new().format().expect("format");
    let id = draft
        .create_file(ROOT, "data", &FileSpec::regular(10_000).owned(7, 8, 9))
        .expect("create");
    (draft.commit().expect("commit"), id)
}

/// Bitmap bit covering device block `block` of ordinal `ord`.
fn bit_of(image: &TestImage, ord: u16, block: u64) -> u64 {
    let geom = BitmapGeometry::from_superblock(image.superblock(), Ordinal(ord)).expect("geometry");
    block / geom.unit_blocks
}

// ── Bitmaps ─────────────────────────────────────────────────────────────────

#[test]
fn allocated_block_marked_free_is_an_alert() {
    let (image, id) = image_with_file();
    let ptr = image.read_inode(id.ino.0).expect("inode").extents[0];
    let mut map = image.bitmap(ptr.ord.0).expect("bitmap");
    let bit = bit_of(&image, ptr.ord.0, u64::from(ptr.block));
    assert!(!bitmap_is_free(&map, bit));
    bitmap_mark_free(&mut map, bit);
    image.write_bitmap(ptr.ord.0, &map).expect("write");

    let report = check(&image);
    assert_eq!(report.count_of(ProblemKind::LostAllocation), 1);
    assert_eq!(report.count_of(ProblemKind::LeakedBlocks), 0);
    assert_eq!(report.exit_status(), ExitStatus::Major);

    repair(&image);
    assert!(!bitmap_is_free(&image.bitmap(ptr.ord.0).expect("bitmap"), bit));
    assert!(check(&image).is_clean());
}

#[test]
fn unowned_block_marked_in_use_is_a_notice() {
    let (image, _) = image_with_file();
    let geom = BitmapGeometry::from_superblock(image.superblock(), Ordinal(1)).expect("geometry");
    let last = geom.bits - 1;
    let mut map = image.bitmap(1).expect("bitmap");
    assert!(bitmap_is_free(&map, last));
    bitmap_mark_allocated(&mut map, last);
    image.write_bitmap(1, &map).expect("write");

    let report = check(&image);
    assert_eq!(report.count_of(ProblemKind::LeakedBlocks), 1);
    assert_eq!(report.exit_status(), ExitStatus::Minor);

    repair(&image);
    assert!(bitmap_is_free(&image.bitmap(1).expect("bitmap"), last));
    assert!(check(&image).is_clean());
}

#[test]
fn free_space_counters_follow_the_bitmaps() {
    let (mut image, _) = image_with_file();
    let space = image.superblock().space;
    let device_space = image.superblock().eq[1].space;
    image
        .update_superblock(|sb| {
            sb.space += 100;
            sb.eq[1].space -= 16;
        })
        .expect("update");

    let report = check(&image);
    assert_eq!(report.count_of(ProblemKind::FreeSpace), 2);
    assert_eq!(report.stats.free_blocks, space);

    repair(&image);
    let sb = image.read_superblock_copy(1, SUPERBLK).expect("copy");
    assert_eq!(sb.space, space);
    assert_eq!(sb.eq[1].space, device_space);
    assert!(check(&image).is_clean());
}

#[test]
fn bad_extent_gives_its_old_blocks_back() {
    let mut draft = ImageBuilder::new().without_quota().format().expect("format");
    let keep = draft
        .create_file(ROOT, "keep", &FileSpec::regular(4096))
        .expect("keep");
    let gone = draft
        .create_file(ROOT, "gone", &FileSpec::regular(40_000))
        .expect("gone");
    let image = draft.commit().expect("commit");
    let free_before = image.superblock().space;
    let ptr = image.read_inode(gone.ino.0).expect("gone").extents[0];

    image
        .patch_inode(gone.ino.0, |inode| inode.extents[0].block = u32::MAX - 3)
        .expect("patch");
    let report = repair(&image);
    assert!(report.count_of(ProblemKind::BadExtent) >= 1);

    let map = image.bitmap(ptr.ord.0).expect("bitmap");
    assert!(bitmap_is_free(&map, bit_of(&image, ptr.ord.0, u64::from(ptr.block))));
    let sb = image.read_superblock_copy(0, SUPERBLK).expect("copy");
    assert!(sb.space > free_before);
    assert!(!image.read_inode(keep.ino.0).expect("keep").is_free());
    assert!(check(&image).is_clean());
}

// ── Quota ───────────────────────────────────────────────────────────────────

#[test]
fn wrong_quota_usage_is_rewritten() {
    let (image, _) = image_with_file();
    let good = image.quota_record(QuotaDomain::User, 7).expect("record");
    assert_eq!(good.total.files, 1);

    let mut bad = QuotaRecord::default();
    bad.online.blocks = 999;
    image
        .write_quota_record(QuotaDomain::User, 7, &bad)
        .expect("write");

    let report = check(&image);
    assert_eq!(report.count_of(ProblemKind::Quota), 1);
    assert_eq!(report.exit_status(), ExitStatus::Minor);

    repair(&image);
    let fixed = image.quota_record(QuotaDomain::User, 7).expect("record");
    assert_eq!(fixed.online.blocks, good.online.blocks);
    assert_eq!(fixed.total.files, good.total.files);
    assert!(check(&image).is_clean());
}

#[test]
fn quota_file_size_past_its_blocks_is_trimmed() {
    let (image, _) = image_with_file();
    let quota = image.root_entry(".quota_u").expect("quota file");
    let size = image.read_inode(quota.ino.0).expect("quota").size;
    image
        .patch_inode(quota.ino.0, |inode| inode.size = 1 << 45)
        .expect("patch");

    let report = check(&image);
    assert_eq!(report.count_of(ProblemKind::Quota), 1, "{report}");

    repair(&image);
    let trimmed = image.read_inode(quota.ino.0).expect("quota").size;
    assert!(trimmed >= size && trimmed < 1 << 45);
    assert_eq!(image.quota_record(QuotaDomain::User, 7).expect("record").total.files, 1);
    assert!(check(&image).is_clean());
}

#[test]
fn quota_survives_orphan_relocation() {
    let mut draft = ImageBuilder::new().format().expect("format");
    draft
        .create_file(ROOT, "kept", &FileSpec::regular(8192).owned(11, 11, 11))
        .expect("kept");
    let stray = draft
        .create_unlinked(InodeId::new(55, 1), &FileSpec::regular(4096).owned(11, 11, 11))
        .expect("stray");
    let image = draft.commit().expect("commit");
    let before = image.quota_record(QuotaDomain::User, 11).expect("record");
    assert_eq!(before.total.files, 2);

    let report = repair(&image);
    assert_eq!(report.stats.orphans_relocated, 1);
    assert_eq!(image.quota_record(QuotaDomain::User, 11).expect("record"), before);
    assert!(!image.read_inode(stray.ino.0).expect("stray").is_free());
    assert!(check(&image).is_clean());
}
