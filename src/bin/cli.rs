//! GridVault CLI
//!
//! Administrative tool for a GridVault data directory.

use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use gridvault::checkpoint::CheckpointMarker;
use gridvault::io::StdIoFactory;
use gridvault::wal::inspect_segments;
use gridvault::{Config, Engine, PageKind, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// GridVault CLI
#[derive(Parser, Debug)]
#[command(name = "gridvault-cli")]
#[command(about = "Inspect and exercise a GridVault data directory")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./gridvault_data")]
    data_dir: String,

    /// Page size the directory was created with
    #[arg(short, long, default_value = "4096")]
    page_size: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan the WAL without modifying anything
    Verify,

    /// Run recovery and print what it found
    Recover,

    /// Force a checkpoint and print the metrics snapshot
    Checkpoint,

    /// Run a synthetic write workload
    Load {
        /// Pages to allocate
        #[arg(long, default_value = "100")]
        pages: u32,

        /// Writes to issue, spread over the pages
        #[arg(long, default_value = "10000")]
        writes: u64,

        /// Partitions to spread the pages over
        #[arg(long, default_value = "4")]
        partitions: u32,
    },
}

fn main() -> ExitCode {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,gridvault=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    tracing::info!("GridVault CLI v{}", gridvault::VERSION);

    let result = match &args.command {
        Commands::Verify => verify(&args),
        Commands::Recover => recover(&args),
        Commands::Checkpoint => checkpoint(&args),
        Commands::Load {
            pages,
            writes,
            partitions,
        } => load(&args, *pages, *writes, *partitions),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn config(args: &Args, metrics_enabled: bool) -> Result<Config> {
    Config::builder()
        .data_dir(&args.data_dir)
        .page_size(args.page_size)
        .metrics_enabled(metrics_enabled)
        .build()
}

/// Returns false when a tear is mid-stream or hides records the last
/// checkpoint needs
fn verify(args: &Args) -> Result<bool> {
    let config = config(args, false)?;
    let marker = CheckpointMarker::read(&StdIoFactory, &config.marker_path())?
        .map(|m| m.latest());
    let reports = inspect_segments(&StdIoFactory, &config.wal_dir(), &config.wal_archive_dir())?;

    match marker {
        Some(m) => println!(
            "checkpoint marker: id={} start_lsn={} end_lsn={}",
            m.checkpoint_id, m.start_lsn, m.end_lsn
        ),
        None => println!("checkpoint marker: none"),
    }

    let mut healthy = true;
    for (i, report) in reports.iter().enumerate() {
        println!(
            "segment {:>6} {:<8} first_lsn={:<10} last_lsn={:<10} records={:<8} {}",
            report.ordinal,
            if report.archived { "archived" } else { "live" },
            report.first_lsn.map_or("-".to_string(), |l| l.to_string()),
            report.last_lsn.map_or("-".to_string(), |l| l.to_string()),
            report.records,
            if report.sealed { "sealed" } else { "open" },
        );
        if let Some(torn) = &report.torn {
            println!("  torn at offset {}: {}", torn.offset, torn.reason);
            let last_valid = report.last_lsn.unwrap_or(0);
            let followed = reports[i + 1..].iter().any(|later| later.first_lsn.is_some());
            if followed || marker.map_or(false, |m| last_valid < m.end_lsn) {
                healthy = false;
            }
        }
    }
    println!("{} segment(s) scanned", reports.len());
    Ok(healthy)
}

fn recover(args: &Args) -> Result<bool> {
    let engine = Engine::open(config(args, false)?)?;
    let state = engine.recovered_state();
    match &state.checkpoint {
        Some(cp) => println!(
            "last checkpoint: id={} start_lsn={} end_lsn={} pages={}",
            cp.id, cp.start_lsn, cp.end_lsn, cp.total_pages
        ),
        None => println!("last checkpoint: none"),
    }
    println!(
        "pages loaded={} scanned={} replayed={} skipped={} discarded={} next_lsn={}",
        state.pages_loaded,
        state.records_scanned,
        state.records_replayed,
        state.records_skipped,
        state.records_discarded,
        state.next_lsn
    );
    if let Some(torn) = &state.torn_tail {
        println!(
            "torn tail truncated: segment {} offset {} ({})",
            torn.segment, torn.offset, torn.reason
        );
    }
    engine.close()?;
    Ok(true)
}

fn checkpoint(args: &Args) -> Result<bool> {
    let engine = Engine::open(config(args, true)?)?;
    let cp = engine.checkpoint()?;
    println!(
        "checkpoint {}: start_lsn={} end_lsn={} pages={} (data={} index={} cow={})",
        cp.id, cp.start_lsn, cp.end_lsn, cp.total_pages, cp.data_pages, cp.index_pages, cp.cow_pages
    );
    println!("{}", engine.metrics().snapshot());
    engine.close()?;
    Ok(true)
}

fn load(args: &Args, pages: u32, writes: u64, partitions: u32) -> Result<bool> {
    let engine = Engine::open(config(args, true)?)?;
    let partitions = partitions.max(1);

    let mut ids = Vec::with_capacity(pages as usize);
    for i in 0..pages {
        let kind = if i % 8 == 0 { PageKind::Index } else { PageKind::Data };
        ids.push(engine.allocate_page(i % partitions, kind)?);
    }
    if ids.is_empty() {
        println!("no pages allocated");
        engine.close()?;
        return Ok(true);
    }

    let started = Instant::now();
    let payload = engine.payload_size();
    let chunk = 64.min(payload);
    for n in 0..writes {
        let page = ids[(n % ids.len() as u64) as usize];
        let offset = ((n * 97) as usize % (payload - chunk + 1)) & !7;
        let data = vec![(n & 0xFF) as u8; chunk];
        engine.write(page, offset, &data)?;
    }
    engine.sync()?;
    let elapsed = started.elapsed();
    println!(
        "{} writes over {} pages in {:.2?} ({:.0} writes/s)",
        writes,
        ids.len(),
        elapsed,
        writes as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );

    let cp = engine.checkpoint()?;
    println!("checkpoint {} wrote {} pages", cp.id, cp.total_pages);
    println!("{}", engine.metrics().snapshot());
    engine.close()?;
    Ok(true)
}
