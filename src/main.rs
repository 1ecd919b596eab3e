//! ghost-dir CLI
//!
//! Scans an NTFS volume for reparse points and reports the ones whose target
//! is gone.

use clap::{Parser, Subcommand};
use ghost_dir::{
    GhostResult,
    config::Config,
    driver::{self, JournalInfo},
    service::{GhostDirService, ScanReport},
    store::{JsonFileStore, ReparsePointRecord},
    validation::Validate,
};
use std::{path::PathBuf, process::ExitCode};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Find dangling junctions and symbolic links on an NTFS volume
#[derive(Parser)]
#[command(name = "ghost-dir")]
#[command(version)]
#[command(about = "Find dangling junctions and symbolic links on an NTFS volume", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Drive letter of the volume (e.g., C)
    #[arg(short, long, global = true, conflicts_with = "mount_point")]
    drive: Option<char>,

    /// Mount point of the volume
    #[arg(short, long, global = true)]
    mount_point: Option<PathBuf>,

    /// Snapshot file
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enumerate the whole MFT and rebuild the snapshot
    Scan,

    /// Apply journal changes since the last run (full scan if needed)
    Update,

    /// List stored reparse points
    List {
        /// Only show ghosts
        #[arg(long)]
        ghosts: bool,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Re-check targets of stored reparse points without reading the journal
    Recheck,

    /// Manage the USN change journal
    Journal {
        #[command(subcommand)]
        action: JournalAction,
    },
}

#[derive(Subcommand)]
enum JournalAction {
    /// Show journal state
    Query,
    /// Create the journal, or resize it
    Create,
    /// Delete the journal and the stored snapshot
    Delete,
}

fn init_logger(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ghost_dir=debug,info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ghost_dir=info,warn"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .compact(),
        )
        .init();
}

/// File values first, then command-line overrides.
fn load_config(cli: &Cli) -> GhostResult<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if let Some(letter) = cli.drive {
        config.volume.drive_letter = Some(letter);
        config.volume.mount_point = None;
    }
    if let Some(mount_point) = &cli.mount_point {
        config.volume.mount_point = Some(mount_point.clone());
        config.volume.drive_letter = None;
    }
    if let Some(store) = &cli.store {
        config.store.path = store.clone();
    }
    config.sync_scan_options();
    config.validate()?;
    Ok(config)
}

fn run(cli: Cli) -> GhostResult<()> {
    let config = load_config(&cli)?;
    let driver = driver::open_driver(&config)?;
    let store = JsonFileStore::new(&config.store.path);
    let mut service = GhostDirService::new(driver, store, config.scan.clone());

    match cli.command {
        Commands::Scan => print_report(&service.full_scan()?),
        Commands::Update => print_report(&service.sync()?),
        Commands::Recheck => print_report(&service.recheck()?),
        Commands::List { ghosts, json } => {
            let points = if ghosts {
                service.ghosts()?
            } else {
                service.points()?
            };
            print_points(&points, json)?;
        }
        Commands::Journal { action } => match action {
            JournalAction::Query => print_journal(&service.journal_info()?),
            JournalAction::Create => print_journal(
                &service.create_journal(config.journal.max_size, config.journal.allocation_delta)?,
            ),
            JournalAction::Delete => {
                service.delete_journal()?;
                println!("Journal deleted");
            }
        },
    }
    Ok(())
}

fn print_report(report: &ScanReport) {
    println!("Mode:           {:?}", report.mode);
    println!("Scanned:        {}", report.scanned);
    println!("Reparse points: {}", report.reparse_points);
    println!("Ghosts:         {}", report.ghosts);
    println!(
        "Changes:        +{} ~{} -{} ({} skipped)",
        report.added, report.updated, report.removed, report.skipped
    );
    println!("Next USN:       {}", report.next_usn);
}

fn print_points(points: &[ReparsePointRecord], json: bool) -> GhostResult<()> {
    if json {
        let out = serde_json::to_string_pretty(points)
            .map_err(ghost_dir::errors::DaoError::from)?;
        println!("{}", out);
        return Ok(());
    }

    for point in points {
        let target = point
            .target
            .as_ref()
            .map(|t| t.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<6} {:<10} {} -> {}",
            if point.ghost { "GHOST" } else { "ok" },
            point.kind.to_string(),
            point.path.display(),
            target
        );
    }
    println!("{} reparse points", points.len());
    Ok(())
}

fn print_journal(info: &JournalInfo) {
    println!("Journal ID:       {:#x}", info.journal_id);
    println!("First USN:        {}", info.first_usn);
    println!("Next USN:         {}", info.next_usn);
    println!("Lowest valid USN: {}", info.lowest_valid_usn);
    println!("Max USN:          {}", info.max_usn);
    println!("Maximum size:     {}", info.maximum_size);
    println!("Allocation delta: {}", info.allocation_delta);
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error ({}): {}", err.kind(), err);
            ExitCode::FAILURE
        }
    }
}
