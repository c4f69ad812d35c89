#![forbid(unsafe_code)]
//! Runs that end early or change only the superblock: device placement,
//! byte order, option bits, preen, the log, mount state, shared hosts,
//! renames, hash regeneration, WORM upgrades and cancellation.

use qfs_error::{ExitStatus, QfsError};
use qfs_harness::{FileSpec, ImageBuilder, TestImage};
use qfs_ondisk::{FsckRequest, InodeStatus, LogHeader, OptionMask, SuperblockVersion};
use qfs_repair::{
    FsckOptions, FsckReport, MountState, ProblemKind, SharedConversion, StaticEnvironment,
    run_fsck,
};
use qfs_types::{BACKUP_SUPERBLK, InodeId, SUPERBLK};
use std::sync::atomic::Ordering;

const ROOT: InodeId = InodeId::new(2, 1);

fn image() -> TestImage {
    let mut draft = ImageBuilder::new().format().expect("format");
    draft
        .create_file(ROOT, "data", &FileSpec::regular(9000).owned(5, 5, 5))
        .expect("create");
    draft.commit().expect("commit")
}

fn run(image: &TestImage, options: &FsckOptions) -> qfs_error::Result<FsckReport> {
    run_fsck(image.devices(), options, &StaticEnvironment::default())
}

fn check(image: &TestImage) -> FsckReport {
    run(image, &FsckOptions::check_only()).expect("check run")
}

// ── Devices and superblocks ─────────────────────────────────────────────────

#[test]
fn missing_device_stops_the_run() {
    let image = image();
    let devices = image.devices().into_iter().take(1).collect();
    let err = run_fsck(devices, &FsckOptions::check_only(), &StaticEnvironment::default())
        .expect_err("must fail");
    assert!(matches!(err, QfsError::Topology(_)));
    assert_eq!(err.exit_status(), ExitStatus::Device);
}

#[test]
fn other_byte_order_is_fatal() {
    let image = image();
    for block in [SUPERBLK, BACKUP_SUPERBLK] {
        let mut bytes = image.read_superblock_copy(0, block).expect("copy").to_bytes().expect("bytes");
        bytes[..4].reverse();
        image.write_superblock_bytes(0, block, &bytes).expect("write");
    }
    let err = run(&image, &FsckOptions::check_only()).expect_err("must fail");
    assert!(matches!(err, QfsError::ByteOrder(_)));
    assert_eq!(err.exit_status(), ExitStatus::Superblock);
}

#[test]
fn unknown_option_bits_are_fatal() {
    let mut image = image();
    image.set_option_bits(0x4000).expect("bits");
    let err = run(&image, &FsckOptions::repairing()).expect_err("must fail");
    assert!(matches!(err, QfsError::OptionMismatch { unknown: 0x4000 }));
    assert_eq!(err.exit_status().code(), 34);
}

#[test]
fn stale_superblock_copy_is_rewritten() {
    let image = image();
    let mut old = image.read_superblock_copy(1, SUPERBLK).expect("copy");
    old.update_time -= 60;
    image
        .write_superblock_bytes(1, SUPERBLK, &old.to_bytes().expect("bytes"))
        .expect("write");

    let report = check(&image);
    assert_eq!(report.count_of(ProblemKind::StaleSuperblock), 1);
    assert_eq!(report.exit_status(), ExitStatus::Minor);

    run(&image, &FsckOptions::repairing()).expect("repair");
    let master = image.read_superblock_copy(0, SUPERBLK).expect("master");
    let fixed = image.read_superblock_copy(1, SUPERBLK).expect("copy");
    assert_eq!(fixed.update_time, master.update_time);
    assert!(check(&image).is_clean());
}

#[test]
fn expected_name_must_match() {
    let image = image();
    let options = FsckOptions {
        fs_name: Some("other".into()),
        ..FsckOptions::check_only()
    };
    let err = run(&image, &options).expect_err("must fail");
    assert!(matches!(err, QfsError::Config(_)));
    assert_eq!(err.exit_status(), ExitStatus::Argument);
}

// ── Preen ───────────────────────────────────────────────────────────────────

#[test]
fn preen_reports_the_request_bits_only() {
    let mut image = image();
    image
        .add_raw_entry(2, "ghost", InodeId::new(40, 3), 1)
        .expect("ghost");
    let preen = FsckOptions {
        preen: true,
        ..FsckOptions::check_only()
    };

    let report = run(&image, &preen).expect("preen");
    assert_eq!(report.exit_status(), ExitStatus::Clean);
    assert!(report.problems.is_empty());

    image
        .update_superblock(|sb| sb.fsck_request = FsckRequest::NOTICE)
        .expect("notice");
    assert_eq!(run(&image, &preen).expect("preen").exit_status(), ExitStatus::Minor);

    image
        .update_superblock(|sb| sb.fsck_request = FsckRequest(FsckRequest::NOTICE.0 | FsckRequest::ALERT.0))
        .expect("alert");
    assert_eq!(run(&image, &preen).expect("preen").exit_status(), ExitStatus::Major);
}

#[test]
fn repair_clears_the_request_bits() {
    let mut image = image();
    image
        .update_superblock(|sb| sb.fsck_request = FsckRequest::ALERT)
        .expect("alert");
    let report = run(&image, &FsckOptions::repairing()).expect("repair");
    assert!(report.is_clean());
    for ord in 0..2 {
        for block in [SUPERBLK, BACKUP_SUPERBLK] {
            let copy = image.read_superblock_copy(ord, block).expect("copy");
            assert!(copy.fsck_request.is_empty());
            assert_eq!(copy.update_time, StaticEnvironment::default().now);
        }
    }
}

// ── Log ─────────────────────────────────────────────────────────────────────

#[test]
fn dirty_log_is_reset_by_repair() {
    let mut draft = ImageBuilder::new().log(32).format().expect("format");
    draft
        .create_file(ROOT, "data", &FileSpec::regular(100))
        .expect("create");
    let image = draft.commit().expect("commit");
    assert!(check(&image).is_clean());

    let mut header = image.log_header().expect("header");
    let seq = header.seq;
    header.head = 9;
    header.tail = 3;
    image.write_log_header(&header).expect("write");

    let report = check(&image);
    assert_eq!(report.count_of(ProblemKind::DirtyLog), 1);
    assert_eq!(report.exit_status(), ExitStatus::Major);

    run(&image, &FsckOptions::repairing()).expect("repair");
    let header = image.log_header().expect("header");
    assert!(!header.is_dirty());
    assert_eq!(header.seq, seq + 1);
    assert!(check(&image).is_clean());
}

#[test]
fn invalid_log_header_is_fatal() {
    let image = ImageBuilder::new()
        .log(32)
        .format()
        .expect("format")
        .commit()
        .expect("commit");
    let len = image.superblock().log_len;
    image
        .write_log_header(&LogHeader::empty(0xDEAD_BEEF, len))
        .expect("write");
    let err = run(&image, &FsckOptions::check_only()).expect_err("must fail");
    assert!(matches!(err, QfsError::Log(_)));
    assert_eq!(err.exit_status(), ExitStatus::Log);
}

// ── Mount state and shared filesystems ──────────────────────────────────────

#[test]
fn mounted_filesystem_is_refused_unless_known_safe() {
    let image = image();
    let env = StaticEnvironment::default().mounted(MountState::ReadWrite);
    let err = run_fsck(image.devices(), &FsckOptions::check_only(), &env).expect_err("must fail");
    assert!(matches!(err, QfsError::Mounted(_)));

    let read_only = StaticEnvironment::default().mounted(MountState::ReadOnly);
    run_fsck(image.devices(), &FsckOptions::check_only(), &read_only).expect("read-only check");
    run_fsck(image.devices(), &FsckOptions::repairing(), &read_only).expect_err("read-only repair");

    let safe = FsckOptions {
        mount_known_safe: true,
        ..FsckOptions::check_only()
    };
    run_fsck(image.devices(), &safe, &env).expect("known safe");
}

fn shared_image() -> TestImage {
    ImageBuilder::new()
        .shared(&["alpha", "beta"], 0)
        .format()
        .expect("format")
        .commit()
        .expect("commit")
}

#[test]
fn shared_filesystem_is_repaired_only_on_the_server() {
    let image = shared_image();
    let beta = StaticEnvironment::default().host("beta");
    let alpha = StaticEnvironment::default().host("alpha");

    run_fsck(image.devices(), &FsckOptions::check_only(), &beta).expect("client check");
    let err = run_fsck(image.devices(), &FsckOptions::repairing(), &beta).expect_err("client repair");
    let QfsError::NotMetadataServer { local, server } = err else {
        panic!("unexpected error {err}");
    };
    assert_eq!(local, "beta");
    assert_eq!(server, "alpha");

    let report = run_fsck(image.devices(), &FsckOptions::repairing(), &alpha).expect("server repair");
    assert!(report.is_clean(), "{report}");
}

#[test]
fn conversion_to_shared_needs_a_hosts_table() {
    let image = image();
    let options = FsckOptions {
        convert_shared: Some(SharedConversion::ToShared),
        ..FsckOptions::repairing()
    };
    let err = run(&image, &options).expect_err("must fail");
    assert!(matches!(err, QfsError::Config(_)));
}

#[test]
fn conversion_to_unshared_rewrites_every_copy() {
    let image = shared_image();
    let options = FsckOptions {
        convert_shared: Some(SharedConversion::ToUnshared),
        ..FsckOptions::repairing()
    };
    run_fsck(image.devices(), &options, &StaticEnvironment::default().host("alpha")).expect("convert");
    for ord in 0..2 {
        assert!(!image.read_superblock_copy(ord, SUPERBLK).expect("copy").shared);
        assert!(!image.read_superblock_copy(ord, BACKUP_SUPERBLK).expect("copy").shared);
    }
}

// ── Rename and hashes ───────────────────────────────────────────────────────

#[test]
fn rename_writes_the_new_name_everywhere() {
    let image = image();
    let check_rename = FsckOptions {
        rename: Some("qfs2".into()),
        ..FsckOptions::check_only()
    };
    assert!(matches!(run(&image, &check_rename), Err(QfsError::Config(_))));

    let options = FsckOptions {
        rename: Some("qfs2".into()),
        ..FsckOptions::repairing()
    };
    let report = run(&image, &options).expect("rename");
    assert_eq!(report.fs_name, "qfs2");
    for ord in 0..2 {
        assert_eq!(image.read_superblock_copy(ord, BACKUP_SUPERBLK).expect("copy").name, "qfs2");
    }

    let expect_new = FsckOptions {
        fs_name: Some("qfs2".into()),
        ..FsckOptions::check_only()
    };
    assert!(run(&image, &expect_new).expect("renamed").is_clean());
}

#[test]
fn regeneration_fixes_hashes_without_repair() {
    let image = image();
    image
        .patch_entry(2, "data", |block, entry| Ok(qfs_dir::set_entry_hash(block, entry.offset, 0xBEEF)?))
        .expect("patch");
    assert_eq!(check(&image).count_of(ProblemKind::DirHash), 0);

    let regen = FsckOptions {
        regen_dir_hash: true,
        ..FsckOptions::check_only()
    };
    let report = run(&image, &regen).expect("regen");
    assert_eq!(report.count_of(ProblemKind::DirHash), 1);
    assert_eq!(report.exit_status(), ExitStatus::Clean);

    let entry = image.lookup(2, "data").expect("lookup").expect("entry");
    assert_eq!(entry.hash, qfs_dir::name_hash(b"data"));
    let report = run(&image, &FsckOptions::repairing()).expect("repair");
    assert_eq!(report.count_of(ProblemKind::DirHash), 0);
}

#[test]
fn regeneration_turns_hashing_on() {
    let mut draft = ImageBuilder::new()
        .options(OptionMask::default())
        .format()
        .expect("format");
    draft
        .create_file(ROOT, "data", &FileSpec::regular(10))
        .expect("create");
    let image = draft.commit().expect("commit");
    assert_eq!(image.lookup(2, "data").expect("lookup").expect("entry").hash, 0);

    let regen = FsckOptions {
        regen_dir_hash: true,
        ..FsckOptions::check_only()
    };
    assert!(run(&image, &regen).expect("regen").count_of(ProblemKind::DirHash) > 0);
    let sb = image.read_superblock_copy(0, SUPERBLK).expect("copy");
    assert!(sb.option_mask.contains(OptionMask::DIR_HASH));
    assert_eq!(
        image.lookup(2, "data").expect("lookup").expect("entry").hash,
        qfs_dir::name_hash(b"data")
    );
    let report = run(&image, &FsckOptions::repairing()).expect("repair");
    assert_eq!(report.count_of(ProblemKind::DirHash), 0);
}

#[test]
fn regeneration_needs_a_version_2a_superblock() {
    let image = ImageBuilder::new()
        .version(SuperblockVersion::V2)
        .format()
        .expect("format")
        .commit()
        .expect("commit");
    let regen = FsckOptions {
        regen_dir_hash: true,
        ..FsckOptions::check_only()
    };
    assert!(matches!(run(&image, &regen), Err(QfsError::Config(_))));
}

// ── WORM ────────────────────────────────────────────────────────────────────

#[test]
fn worm_v1_retention_becomes_an_expiry_on_repair() {
    let mut draft = ImageBuilder::new()
        .options(OptionMask(OptionMask::DIR_HASH.0 | OptionMask::WORM_V2.0))
        .format()
        .expect("format");
    let file = draft
        .create_file(ROOT, "kept", &FileSpec::regular(3000))
        .expect("create");
    let image = draft.commit().expect("commit");
    image
        .patch_inode(file.ino.0, |inode| {
            inode.status.insert(InodeStatus::WORM);
            inode.version = 1;
            inode.change_time = 1_000;
            inode.worm_period = 500;
        })
        .expect("patch");

    let report = check(&image);
    assert_eq!(report.count_of(ProblemKind::WormUpgrade), 0);
    assert!(report.is_clean(), "{report}");
    assert_eq!(image.read_inode(file.ino.0).expect("inode").version, 1);

    let report = run(&image, &FsckOptions::repairing()).expect("repair run");
    assert_eq!(report.count_of(ProblemKind::WormUpgrade), 1, "{report}");
    assert!(report.is_clean(), "{report}");
    let inode = image.read_inode(file.ino.0).expect("inode");
    assert_eq!(inode.version, 2);
    assert_eq!(inode.worm_until, 1_500);
    assert_eq!(inode.worm_period, 0);

    let report = run(&image, &FsckOptions::repairing()).expect("repair run");
    assert_eq!(report.count_of(ProblemKind::WormUpgrade), 0);
}

// ── Run control ─────────────────────────────────────────────────────────────

#[test]
fn raised_shutdown_flag_cancels_the_run() {
    let image = image();
    let options = FsckOptions::repairing();
    options.shutdown.store(true, Ordering::Relaxed);
    let before = image.snapshot();
    let err = run(&image, &options).expect_err("must cancel");
    assert!(matches!(err, QfsError::Cancelled));
    assert_eq!(err.exit_status(), ExitStatus::Cancelled);
    assert_eq!(image.snapshot(), before);
}

#[test]
fn scratch_directory_must_exist() {
    let image = image();
    let dir = tempfile::tempdir().expect("tempdir");
    let options = FsckOptions {
        scratch_dir: Some(dir.path().to_path_buf()),
        ..FsckOptions::repairing()
    };
    assert!(run(&image, &options).expect("run").is_clean());

    let missing = FsckOptions {
        scratch_dir: Some(dir.path().join("missing")),
        ..FsckOptions::check_only()
    };
    assert!(matches!(run(&image, &missing), Err(QfsError::Config(_))));
}
