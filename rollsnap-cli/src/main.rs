//! Rollsnap CLI
//!
//! Command-line interface for policy-driven ZFS snapshot rotation and
//! replication.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rollsnap_common::Error;
use rollsnap_engine::{Runner, ZfsCli};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Run zfs/zpool commands through sudo
    #[arg(long, global = true)]
    sudo: bool,

    /// Output format (table, json, yaml)
    #[arg(short, long, default_value = "table", global = true)]
    output: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Take rolling snapshots of eligible datasets and prune old ones
    Snap {
        /// Schedule label, e.g. "hourly" or "daily"
        label: String,
        /// Snapshots to retain per filesystem, or "all"; defaults to the
        /// label's standard retention
        keep: Option<String>,
        /// Explicit datasets instead of policy-driven selection
        #[arg(long = "dataset")]
        datasets: Vec<String>,
        /// Skip datasets on pools that are scrubbing/resilvering
        #[arg(long)]
        avoid_sync: bool,
        /// Snapshot explicit datasets recursively
        #[arg(long)]
        recursive: bool,
    },
    /// Purge old snapshots under every child of a base dataset
    Purge {
        /// Dataset whose children hold received snapshots
        base_dataset: String,
        /// Schedule label, e.g. "hourly" or "daily"
        label: String,
        /// Snapshots to retain per filesystem, or "all"; defaults to the
        /// label's standard retention
        keep: Option<String>,
    },
    /// Replicate snapshots to a backup host over SSH
    Sync {
        /// Schedule label to replicate
        label: String,
        /// Backup host
        host: String,
        /// SSH user on the backup host
        user: String,
        /// Pool on the backup host that receives the streams
        backup_pool: String,
        /// Explicit dataset instead of policy-driven selection
        #[arg(long)]
        dataset: Option<String>,
    },
    /// Show which datasets the snapshot policy selects
    Policy {
        /// Schedule label, e.g. "hourly" or "daily"
        label: String,
    },
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn runner(sudo: bool) -> Runner {
    if sudo {
        Runner::local_with_prefix(vec!["sudo".to_string()])
    } else {
        Runner::local()
    }
}

async fn run(cli: Cli) -> Result<()> {
    let local = runner(cli.sudo);

    match cli.command {
        Commands::Snap {
            label,
            keep,
            datasets,
            avoid_sync,
            recursive,
        } => {
            let zfs = ZfsCli::new(local);
            commands::snap::run(&zfs, &label, keep.as_deref(), &datasets, avoid_sync, recursive)
                .await
        }
        Commands::Purge {
            base_dataset,
            label,
            keep,
        } => {
            let zfs = ZfsCli::new(local);
            commands::purge::run(&zfs, &base_dataset, &label, keep.as_deref()).await
        }
        Commands::Sync {
            label,
            host,
            user,
            backup_pool,
            dataset,
        } => commands::sync::run(local, &label, &host, &user, &backup_pool, dataset.as_deref()).await,
        Commands::Policy { label } => {
            let zfs = ZfsCli::new(local);
            commands::policy::run(&zfs, &label, &cli.output).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(Error::SnapshotExists(_)) = e.downcast_ref::<Error>() {
                tracing::error!("{}", e);
            } else {
                output::print_error(&format!("{:#}", e));
            }
            ExitCode::FAILURE
        }
    }
}
