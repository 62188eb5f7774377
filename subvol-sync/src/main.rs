//! subvol-sync - Main entry point
//!
//! Clones a btrfs backup hierarchy from SRC to DST.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use subvol_sync::btrfs::{CommandHost, Endpoint};
use subvol_sync::utils::prompt::StdinConfirm;
use subvol_sync::utils::shutdown::ShutdownCoordinator;
use subvol_sync::{utils, Config, SyncError, Synchronizer};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Source root: a local path or ssh://[user@]host[:port]/path
    #[arg(value_name = "SRC")]
    source: String,

    /// Destination root on a different btrfs filesystem
    #[arg(value_name = "DST")]
    destination: String,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Delete destination subvolumes and top-level directories missing on the source
    #[arg(long)]
    delete_strays: bool,

    /// Show what would be done without changing the destination
    #[arg(long)]
    dry_run: bool,

    /// Ask before deleting strays
    #[arg(long)]
    interactive: bool,

    /// Keep going after a failed transfer
    #[arg(long)]
    ignore_errors: bool,

    /// Print the plan as JSON and exit
    #[arg(long)]
    json_plan: bool,

    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        Config::default()
    };
    config.sync.delete_strays |= args.delete_strays;
    config.sync.dry_run |= args.dry_run;
    config.sync.interactive |= args.interactive;
    config.sync.ignore_errors |= args.ignore_errors;

    // Initialize logging
    let configured = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(&utils::logger::level_for_verbosity(configured, args.verbose))?;

    tracing::debug!("subvol-sync v{}", env!("CARGO_PKG_VERSION"));

    let source = CommandHost::new(Endpoint::parse(&args.source)?);
    let destination = CommandHost::new(Endpoint::parse(&args.destination)?);

    let shutdown = Arc::new(ShutdownCoordinator::new());
    let waiter = Arc::clone(&shutdown);
    let signal_handle = tokio::spawn(async move {
        waiter.wait_for_signal().await;
    });

    let confirm = StdinConfirm;
    let synchronizer = Synchronizer::new(&source, &destination, &config, &confirm, shutdown.token());

    let code = if args.json_plan {
        let report = synchronizer.plan_only().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        ExitCode::SUCCESS
    } else {
        match synchronizer.run().await {
            Ok(summary) => {
                if !summary.is_clean() {
                    tracing::error!("{} transfer(s) failed", summary.failed.len());
                }
                ExitCode::from(summary.exit_status(config.sync.ignore_errors))
            }
            Err(SyncError::Interrupted) => {
                tracing::warn!("interrupted; incomplete subvolumes are cleaned up on the next run");
                ExitCode::from(130)
            }
            Err(e) => {
                tracing::error!("{}", e);
                ExitCode::FAILURE
            }
        }
    };

    signal_handle.abort();
    Ok(code)
}
