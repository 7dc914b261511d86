#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ffs_badblocks::{
    BadBlockFs, DEFAULT_SCAN_PROGRAM, LogInvalidBlocks, ReconcileMode, ReconcileReport,
    ScanOptions, read_bad_blocks_file, test_disk,
};
use ffs_core::{Filesystem, ImageSpec};
use ffs_types::BlockNumber;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Human,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "ffs", about = "Maintain the bad-block inode of a filesystem image")]
struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, env = "FFS_LOG_FORMAT", default_value = "human")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create an empty metadata image.
    Mkimage {
        image: PathBuf,
        /// Device identifier handed to the scanner.
        #[arg(long)]
        device: String,
        #[arg(long)]
        blocks: u64,
        #[arg(long, default_value_t = 1024)]
        block_size: u32,
        #[arg(long, default_value_t = 1)]
        first_data_block: u32,
        #[arg(long, default_value_t = 8192)]
        blocks_per_group: u32,
    },
    /// Add (or, with --replace, substitute) bad blocks listed in a file.
    ReadBadBlocks {
        image: PathBuf,
        manifest: PathBuf,
        /// Discard the existing bad-block list first.
        #[arg(long)]
        replace: bool,
        #[arg(long)]
        json: bool,
    },
    /// Run the block scanner over the device and append what it finds.
    TestDisk {
        image: PathBuf,
        /// Print the scanner command before running it.
        #[arg(short, long)]
        verbose: bool,
        /// Batch mode: no progress output from the scanner.
        #[arg(short, long)]
        preen: bool,
        /// Destructive write-verify scan. Erases data on the device.
        #[arg(long)]
        destructive: bool,
        #[arg(long, env = "FFS_BADBLOCKS_PROGRAM", default_value = DEFAULT_SCAN_PROGRAM)]
        program: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print the blocks claimed by the bad-block inode.
    ListBadBlocks {
        image: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

// ── Logging ─────────────────────────────────────────────────────────────────

fn default_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_logging(format: LogFormat) -> Result<()> {
    match format {
        LogFormat::Human => tracing_subscriber::fmt()
            .with_env_filter(default_env_filter())
            .with_target(false)
            .with_writer(std::io::stderr)
            .compact()
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize human logger: {err}"))?,
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_env_filter(default_env_filter())
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to initialize json logger: {err}"))?,
    }
    Ok(())
}

// ── Commands ────────────────────────────────────────────────────────────────

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format)?;

    match cli.command {
        Command::Mkimage {
            image,
            device,
            blocks,
            block_size,
            first_data_block,
            blocks_per_group,
        } => {
            let spec = ImageSpec {
                device_name: device,
                block_size,
                blocks_count: blocks,
                first_data_block,
                blocks_per_group,
            };
            Filesystem::create(&image, &spec)
                .with_context(|| format!("failed to create image {}", image.display()))?;
            Ok(())
        }
        Command::ReadBadBlocks {
            image,
            manifest,
            replace,
            json,
        } => {
            let mut fs = open_rw(&image)?;
            let report = read_bad_blocks_file(
                &mut fs,
                &manifest,
                ReconcileMode::from_replace_flag(replace),
                &mut LogInvalidBlocks,
            )
            .with_context(|| format!("failed to read bad blocks from {}", manifest.display()))?;
            finish(&mut fs, &image, &report, json)
        }
        Command::TestDisk {
            image,
            verbose,
            preen,
            destructive,
            program,
            json,
        } => {
            let mut fs = open_rw(&image)?;
            let options = ScanOptions {
                program,
                verbose,
                preen,
                destructive,
            };
            if destructive {
                info!(device = fs.device_name(), "destructive write-verify scan requested");
            }
            let report = test_disk(&mut fs, &options, &mut LogInvalidBlocks)
                .with_context(|| format!("bad-block scan of {} failed", fs.device_name()))?;
            finish(&mut fs, &image, &report, json)
        }
        Command::ListBadBlocks { image, json } => list_bad_blocks(&image, json),
    }
}

fn open_rw(image: &Path) -> Result<Filesystem> {
    Filesystem::open(image).with_context(|| format!("failed to open image {}", image.display()))
}

fn finish(fs: &mut Filesystem, image: &Path, report: &ReconcileReport, json: bool) -> Result<()> {
    fs.flush()
        .with_context(|| format!("failed to write image {}", image.display()))?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(report).context("serialize report")?
        );
        return Ok(());
    }

    if let Some(command) = &report.echoed_command {
        println!("Running command: {command}");
    }
    println!("mode: {}", report.mode);
    println!("source: {}", report.source);
    if !report.cleared.is_empty() {
        println!("cleared from inode: {}", join_blocks(&report.cleared));
    }
    println!(
        "records: {} (inserted {}, duplicate {}, ignored {})",
        report.ingest.records,
        report.ingest.inserted,
        report.ingest.duplicates,
        report.ingest.invalid
    );
    println!(
        "bad blocks: {} (+{} -{})",
        report.persisted.len(),
        report.delta.added.len(),
        report.delta.removed.len()
    );
    println!("free blocks: {}", fs.free_blocks());
    Ok(())
}

#[derive(Debug, Serialize)]
struct ListOutput<'a> {
    device: &'a str,
    block_size: u32,
    first_data_block: u64,
    blocks_count: u64,
    free_blocks: u64,
    bad_blocks: Vec<BlockNumber>,
}

fn list_bad_blocks(image: &Path, json: bool) -> Result<()> {
    let fs = Filesystem::open_read_only(image)
        .with_context(|| format!("failed to open image {}", image.display()))?;
    let range = fs.block_range();
    let output = ListOutput {
        device: fs.device_name(),
        block_size: fs.block_size().get(),
        first_data_block: range.first_data_block,
        blocks_count: range.blocks_count,
        free_blocks: fs.free_blocks(),
        bad_blocks: fs.bad_blocks(),
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        for block in &output.bad_blocks {
            println!("{block}");
        }
    }
    Ok(())
}

fn join_blocks(blocks: &[BlockNumber]) -> String {
    blocks
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}
