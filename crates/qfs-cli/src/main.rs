#![forbid(unsafe_code)]

mod system;

use anyhow::{Context, Result};
use clap::Parser;
use qfs_block::{ByteDevice, FileByteDevice};
use qfs_error::{ExitStatus, QfsError};
use qfs_repair::{FsckOptions, FsckReport, SharedConversion, run_fsck};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use system::SystemEnvironment;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "qfsck", about = "Check and repair a qfs filesystem", version)]
struct Cli {
    /// Repair what is found. Without it the devices are only read.
    #[arg(short = 'F', long)]
    repair: bool,

    /// Regenerate directory name hashes and turn hashing on.
    #[arg(short = 'G', long)]
    regen_dir_hash: bool,

    /// Give the filesystem a new name (requires --repair).
    #[arg(short = 'R', long, value_name = "NAME")]
    rename: Option<String>,

    /// Only report the check requests recorded in the superblock.
    #[arg(short = 'p', long)]
    preen: bool,

    /// Convert to a shared filesystem (requires --repair).
    #[arg(short = 'S', long, conflicts_with = "unshared")]
    shared: bool,

    /// Convert to an unshared filesystem (requires --repair).
    #[arg(short = 'U', long)]
    unshared: bool,

    /// Directory for scratch files; the system temporary directory otherwise.
    #[arg(short = 's', long, value_name = "DIR")]
    scratch_dir: Option<PathBuf>,

    /// Log progress.
    #[arg(short = 'v', long, conflicts_with = "debug")]
    verbose: bool,

    /// Log per-inode detail.
    #[arg(short = 'd', long)]
    debug: bool,

    /// Proceed although the filesystem is mounted.
    #[arg(long)]
    known_safe: bool,

    /// Leave orphans whose parent may be on offline media where they are.
    #[arg(long)]
    allow_offline_parents: bool,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,

    /// Family-set name of the filesystem.
    fs_name: String,

    /// Device files of every member, in any order.
    #[arg(required = true)]
    devices: Vec<PathBuf>,
}

impl Cli {
    fn options(&self) -> FsckOptions {
        let convert_shared = if self.shared {
            Some(SharedConversion::ToShared)
        } else if self.unshared {
            Some(SharedConversion::ToUnshared)
        } else {
            None
        };
        FsckOptions {
            repair: self.repair,
            regen_dir_hash: self.regen_dir_hash,
            rename: self.rename.clone(),
            preen: self.preen,
            convert_shared,
            scratch_dir: self.scratch_dir.clone(),
            allow_offline_parents: self.allow_offline_parents,
            mount_known_safe: self.known_safe,
            fs_name: Some(self.fs_name.clone()),
            ..FsckOptions::default()
        }
    }

    fn filter(&self) -> EnvFilter {
        let level = if self.debug {
            "debug"
        } else if self.verbose {
            "info"
        } else {
            "warn"
        };
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    }
}

fn init_logging(cli: &Cli) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(cli.filter())
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to initialize logger: {err}"))
}

// ── Run ─────────────────────────────────────────────────────────────────────

fn open_devices(cli: &Cli, writable: bool) -> Result<Vec<Arc<dyn ByteDevice>>> {
    cli.devices
        .iter()
        .map(|path| {
            let device = FileByteDevice::open(path, writable)
                .with_context(|| format!("cannot open {}", path.display()))?;
            Ok(Arc::new(device) as Arc<dyn ByteDevice>)
        })
        .collect()
}

fn print_report(report: &FsckReport, json: bool) -> Result<()> {
    if json {
        println!("{}", report.to_json().context("serialize report")?);
    } else {
        print!("{report}");
    }
    Ok(())
}

fn run(cli: &Cli) -> Result<ExitStatus> {
    let options = cli.options();
    let flag = Arc::clone(&options.shutdown);
    ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed))
        .context("install interrupt handler")?;

    let devices = open_devices(cli, options.writes())?;
    info!(name = %cli.fs_name, devices = devices.len(), repair = options.repair, "qfsck starting");
    match run_fsck(devices, &options, &SystemEnvironment::default()) {
        Ok(report) => {
            print_report(&report, cli.json)?;
            Ok(report.exit_status())
        }
        Err(err) => {
            error!(%err, "qfsck stopped");
            eprintln!("qfsck: {}: {err}", cli.fs_name);
            Ok(err.exit_status())
        }
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = init_logging(&cli) {
        eprintln!("qfsck: {err:#}");
    }
    let status = match run(&cli) {
        Ok(status) => status,
        Err(err) => {
            eprintln!("qfsck: {err:#}");
            match err.downcast_ref::<QfsError>() {
                Some(fatal) => fatal.exit_status(),
                None => ExitStatus::Device,
            }
        }
    };
    std::process::exit(status.code());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_onto_options() {
        let cli = Cli::try_parse_from(["qfsck", "-F", "-G", "-R", "new", "-U", "-s", "/tmp", "qfs1", "/dev/a", "/dev/b"])
            .expect("parse");
        let options = cli.options();
        assert!(options.repair && options.regen_dir_hash);
        assert_eq!(options.rename.as_deref(), Some("new"));
        assert_eq!(options.convert_shared, Some(SharedConversion::ToUnshared));
        assert_eq!(options.fs_name.as_deref(), Some("qfs1"));
        assert_eq!(cli.devices.len(), 2);
        assert!(options.writes());
    }

    #[test]
    fn devices_are_required_and_conversions_exclusive() {
        assert!(Cli::try_parse_from(["qfsck", "qfs1"]).is_err());
        assert!(Cli::try_parse_from(["qfsck", "-S", "-U", "qfs1", "/dev/a"]).is_err());
        let cli = Cli::try_parse_from(["qfsck", "qfs1", "/dev/a"]).expect("parse");
        assert!(!cli.options().writes());
    }
}
