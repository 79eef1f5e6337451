//! Binary entry point for the Strata administrative CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use strata::admin::{
    checkpoint, coalesce, dump_page, init, stats, verify, AdminOpenOptions, CheckpointMode,
    CheckpointSummary, CoalesceReport, InitReport, PageDump, StatsReport, VerifyLevel,
    VerifyReport,
};
use strata::{AllocationStrategy, StorageMode, Synchronous};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "strata",
    version,
    about = "Administrative CLI for Strata page stores",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(flatten)]
    open: OpenArgs,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct OpenArgs {
    #[arg(
        long,
        global = true,
        value_name = "FILE",
        env = "STRATA_CONFIG",
        help = "TOML file with storage options"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        help = "Override page size (bytes) when creating a database"
    )]
    page_size: Option<u32>,

    #[arg(long, global = true, help = "Override cache size (pages)")]
    cache_pages: Option<usize>,

    #[arg(long, global = true, value_enum, help = "Synchronous mode override")]
    synchronous: Option<SynchronousArg>,

    #[arg(long, global = true, value_enum, help = "Allocation strategy override")]
    strategy: Option<StrategyArg>,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Create a new, empty database")]
    Init {
        #[arg(value_name = "DB")]
        db_path: PathBuf,

        #[arg(long, value_enum, help = "Layout policy stored in the header")]
        storage_mode: Option<StorageModeArg>,
    },

    #[command(about = "Print pager, allocator and log statistics")]
    Stats {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
    },

    #[command(about = "Check allocator invariants and page checksums")]
    Verify {
        #[arg(value_name = "DB")]
        db_path: PathBuf,

        #[arg(long, value_enum, default_value_t = VerifyLevelArg::Full)]
        level: VerifyLevelArg,
    },

    #[command(about = "Write back dirty pages and snapshot the free-space map")]
    Checkpoint {
        #[arg(value_name = "DB")]
        db_path: PathBuf,

        #[arg(long, value_enum, default_value_t = CheckpointModeArg::Force)]
        mode: CheckpointModeArg,
    },

    #[command(about = "Merge adjacent free extents and checkpoint")]
    Coalesce {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
    },

    #[command(about = "Show one page's header and bytes")]
    DumpPage {
        #[arg(value_name = "DB")]
        db_path: PathBuf,

        #[arg(value_name = "PAGE")]
        page: u64,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum SynchronousArg {
    Full,
    Normal,
    Off,
}

impl From<SynchronousArg> for Synchronous {
    fn from(mode: SynchronousArg) -> Self {
        match mode {
            SynchronousArg::Full => Synchronous::Full,
            SynchronousArg::Normal => Synchronous::Normal,
            SynchronousArg::Off => Synchronous::Off,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum StrategyArg {
    FirstFit,
    BestFit,
    WorstFit,
}

impl From<StrategyArg> for AllocationStrategy {
    fn from(strategy: StrategyArg) -> Self {
        match strategy {
            StrategyArg::FirstFit => AllocationStrategy::FirstFit,
            StrategyArg::BestFit => AllocationStrategy::BestFit,
            StrategyArg::WorstFit => AllocationStrategy::WorstFit,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum StorageModeArg {
    Paged,
    AppendOnly,
    Columnar,
}

impl From<StorageModeArg> for StorageMode {
    fn from(mode: StorageModeArg) -> Self {
        match mode {
            StorageModeArg::Paged => StorageMode::Paged,
            StorageModeArg::AppendOnly => StorageMode::AppendOnly,
            StorageModeArg::Columnar => StorageMode::Columnar,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CheckpointModeArg {
    Force,
    #[value(name = "best-effort")]
    BestEffort,
}

impl From<CheckpointModeArg> for CheckpointMode {
    fn from(mode: CheckpointModeArg) -> Self {
        match mode {
            CheckpointModeArg::Force => CheckpointMode::Force,
            CheckpointModeArg::BestEffort => CheckpointMode::BestEffort,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum VerifyLevelArg {
    Fast,
    Full,
}

impl From<VerifyLevelArg> for VerifyLevel {
    fn from(level: VerifyLevelArg) -> Self {
        match level {
            VerifyLevelArg::Fast => VerifyLevel::Fast,
            VerifyLevelArg::Full => VerifyLevel::Full,
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let open_opts = build_open_options(&cli.open)?;

    match cli.command {
        Command::Init {
            db_path,
            storage_mode,
        } => {
            let mut opts = open_opts;
            if let Some(mode) = storage_mode {
                opts.storage.storage_mode = mode.into();
            }
            let report = init(&db_path, &opts)?;
            emit(cli.format, &report, || print_init_text(&report))?;
        }
        Command::Stats { db_path } => {
            let report = stats(&db_path, &open_opts)?;
            emit(cli.format, &report, || print_stats_text(&report))?;
        }
        Command::Verify { db_path, level } => {
            let report = verify(&db_path, &open_opts, level.into())?;
            emit(cli.format, &report, || print_verify_text(&report))?;
            if !report.success {
                std::process::exit(2);
            }
        }
        Command::Checkpoint { db_path, mode } => {
            let report = checkpoint(&db_path, &open_opts, mode.into())?;
            emit(cli.format, &report, || print_checkpoint_text(&report))?;
        }
        Command::Coalesce { db_path } => {
            let report = coalesce(&db_path, &open_opts)?;
            emit(cli.format, &report, || print_coalesce_text(&report))?;
        }
        Command::DumpPage { db_path, page } => {
            let report = dump_page(&db_path, &open_opts, page)?;
            emit(cli.format, &report, || print_dump_text(&report))?;
        }
    }

    Ok(())
}

fn build_open_options(args: &OpenArgs) -> Result<AdminOpenOptions, Box<dyn Error>> {
    let mut opts = match &args.config {
        Some(path) => AdminOpenOptions::from_config_file(path)?,
        None => AdminOpenOptions::default(),
    };
    if let Some(page_size) = args.page_size {
        opts.storage.page_size = page_size;
    }
    if let Some(cache_pages) = args.cache_pages {
        opts.storage.cache_pages = cache_pages;
    }
    if let Some(mode) = args.synchronous {
        opts.storage.synchronous = mode.into();
    }
    if let Some(strategy) = args.strategy {
        opts.storage.default_strategy = strategy.into();
    }
    opts.storage.validate()?;
    Ok(opts)
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_init_text(report: &InitReport) {
    println!(
        "Created {} (page_size={} storage_mode={} strategy={})",
        report.db_path, report.page_size, report.storage_mode, report.strategy
    );
    println!("  wal_path={}", report.wal_path);
}

fn print_stats_text(report: &StatsReport) {
    let pager = &report.pager;
    println!("Pager:");
    println!(
        "  page_size={} storage_mode={} strategy={} cache_pages={}",
        pager.page_size, pager.storage_mode, pager.strategy, pager.cache_pages
    );
    println!("  {}", pager.counters);
    println!();
    let alloc = &report.allocator;
    println!(
        "Allocator: total={} free={} allocated={} extents={} largest={} fragmentation={:.3}",
        alloc.total_pages,
        alloc.free_pages,
        alloc.allocated_pages,
        alloc.extent_count,
        alloc.largest_extent,
        alloc.fragmentation
    );
    println!();
    println!(
        "WAL: size={} last_checkpoint_lsn={} path={}",
        report.wal.size_bytes, report.wal.last_checkpoint_lsn, report.wal.path
    );
    println!(
        "Recovery: scanned={} applied={} transactions={} discarded={} torn_tail={}",
        report.recovery.records_scanned,
        report.recovery.records_applied,
        report.recovery.transactions_applied,
        report.recovery.records_discarded,
        report.recovery.torn_tail
    );
    println!();
    println!(
        "Filesystem: db_size={} wal_size={} db_path={} wal_path={}",
        report.filesystem.db_size_bytes,
        report.filesystem.wal_size_bytes,
        report.filesystem.db_path,
        report.filesystem.wal_path
    );
}

fn print_verify_text(report: &VerifyReport) {
    let counts = &report.counts;
    println!(
        "Verify ({:?}) => success={} total={} free={} ok={} unwritten={} checksum_failures={} header_errors={}",
        report.level,
        report.success,
        counts.total_pages,
        counts.free_pages,
        counts.pages_ok,
        counts.pages_unwritten,
        counts.checksum_failures,
        counts.header_errors,
    );
    for finding in &report.findings {
        println!("- {:?}: {}", finding.severity, finding.message);
    }
}

fn print_checkpoint_text(report: &CheckpointSummary) {
    if report.skipped {
        println!("Checkpoint ({}) skipped: transactions in progress", report.mode);
        return;
    }
    println!(
        "Checkpoint ({}) completed in {:.2} ms at LSN {} (flushed={} snapshot_extents={} snapshot_pages={})",
        report.mode,
        report.duration_ms,
        report.last_checkpoint_lsn,
        report.pages_flushed,
        report.snapshot_extents,
        report.snapshot_pages
    );
}

fn print_coalesce_text(report: &CoalesceReport) {
    println!(
        "Coalesce: extents {} -> {} (merged={}, largest={})",
        report.extents_before, report.extents_after, report.merged, report.largest_extent
    );
}

fn print_dump_text(report: &PageDump) {
    println!(
        "Page {}: kind={} table={} lsn={} crc32={} checksum_ok={} free={} unwritten={}",
        report.page,
        report.kind.as_deref().unwrap_or("-"),
        report.table_id.map_or("-".to_string(), |v| v.to_string()),
        report.page_lsn.map_or("-".to_string(), |v| v.to_string()),
        report.crc32.map_or("-".to_string(), |v| format!("{v:#010x}")),
        report.checksum_ok,
        report.free,
        report.unwritten,
    );
    for (row, chunk) in report.hex.as_bytes().chunks(64).enumerate() {
        println!("{:08x}  {}", row * 32, String::from_utf8_lossy(chunk));
    }
}
