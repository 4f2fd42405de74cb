//! ZFS command adapter
//!
//! Thin layer over the `zfs` and `zpool` CLIs. Output is consumed as rows
//! of tab-separated string fields; known error text on stderr is mapped to
//! the typed errors in `rollsnap-common`. Everything else in the engine
//! talks to ZFS through the [`ZfsOps`] trait so tests can substitute a
//! fake.

use crate::runner::Runner;
use rollsnap_common::names::{validate_dataset_name, validate_snapshot_name};
use rollsnap_common::{Error, Result};
use std::process::Output;
use tokio::process::Command;
use tracing::debug;

/// Options for `zfs list`
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Dataset types (`-t`), e.g. `filesystem,volume` or `snapshot`
    pub types: Vec<String>,
    /// Sort property (`-s`)
    pub sort: Option<String>,
    /// Output columns (`-o`)
    pub columns: Vec<String>,
    /// Dataset to start from; all datasets when unset
    pub target: Option<String>,
    /// Recurse into children (`-r`)
    pub recursive: bool,
    /// Recursion depth limit (`-d`)
    pub depth: Option<u32>,
}

impl ListOptions {
    /// Listing of filesystems and volumes.
    pub fn datasets() -> Self {
        Self {
            types: vec!["filesystem".to_string(), "volume".to_string()],
            ..Default::default()
        }
    }

    /// Snapshots under `target`, sorted by creation time ascending.
    pub fn snapshots(target: &str) -> Self {
        Self {
            types: vec!["snapshot".to_string()],
            sort: Some("creation".to_string()),
            columns: vec!["name".to_string()],
            target: Some(target.to_string()),
            ..Default::default()
        }
    }

    pub fn sorted_by(mut self, property: &str) -> Self {
        self.sort = Some(property.to_string());
        self
    }

    pub fn with_columns(mut self, columns: &[String]) -> Self {
        self.columns = columns.to_vec();
        self
    }

    pub fn with_target(mut self, target: &str) -> Self {
        self.target = Some(target.to_string());
        self
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }
}

/// Interface the engine uses to query and mutate ZFS state
#[allow(async_fn_in_trait)]
pub trait ZfsOps {
    /// List datasets as rows of string fields aligned to the requested
    /// columns.
    async fn list_datasets(&self, opts: &ListOptions) -> Result<Vec<Vec<String>>>;

    /// List snapshot names under `dataset`, oldest first.
    async fn list_snapshots(&self, dataset: &str, recursive: bool) -> Result<Vec<String>>;

    /// List pools as rows of string fields.
    async fn list_pools(&self, target: Option<&str>) -> Result<Vec<Vec<String>>>;

    /// Create `dataset@snaptag`, atomically covering children when
    /// `recursive` is set.
    async fn create_snapshot(&self, dataset: &str, snaptag: &str, recursive: bool) -> Result<()>;

    /// Destroy one dataset or snapshot. One name per call.
    async fn destroy(&self, name: &str, recursive: bool) -> Result<()>;

    /// Whether the pool is mid-scrub or mid-resilver.
    async fn pool_is_syncing(&self, pool: &str) -> Result<bool>;

    /// Stable GUID of the pool.
    async fn pool_guid(&self, pool: &str) -> Result<String>;
}

/// ZFS adapter backed by a command [`Runner`]
#[derive(Debug, Clone)]
pub struct ZfsCli {
    runner: Runner,
}

impl ZfsCli {
    pub fn new(runner: Runner) -> Self {
        Self { runner }
    }

    pub fn local() -> Self {
        Self::new(Runner::local())
    }

    async fn run_checked(&self, program: &str, args: &[&str], context: &str) -> Result<Output> {
        let output = self.runner.run(program, args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(classify_failure(context, &output))
        }
    }

    /// Create a filesystem, with `-p` for missing parents.
    pub async fn create_dataset(&self, name: &str, parents: bool) -> Result<()> {
        validate_dataset_name(name)?;
        let mut args = vec!["create"];
        if parents {
            args.push("-p");
        }
        args.push(name);
        self.run_checked("zfs", &args, name).await?;
        Ok(())
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    /// Prepared `zfs send` command, optionally incremental from `base`.
    /// The caller pipes stdout into a receive command.
    pub fn send_command(
        &self,
        snapshot: &str,
        incremental_base: Option<&str>,
        recursive: bool,
    ) -> Command {
        let mut args = vec!["send"];
        if recursive {
            args.push("-R");
        }
        if let Some(base) = incremental_base {
            args.push("-i");
            args.push(base);
        }
        args.push(snapshot);
        self.runner.command("zfs", &args)
    }
}

impl ZfsOps for ZfsCli {
    async fn list_datasets(&self, opts: &ListOptions) -> Result<Vec<Vec<String>>> {
        let mut args: Vec<&str> = vec!["list", "-H"];

        if opts.recursive {
            args.push("-r");
        }
        let depth;
        if let Some(d) = opts.depth {
            depth = d.to_string();
            args.push("-d");
            args.push(&depth);
        }
        let types;
        if !opts.types.is_empty() {
            types = opts.types.join(",");
            args.push("-t");
            args.push(&types);
        }
        if let Some(ref sort) = opts.sort {
            args.push("-s");
            args.push(sort);
        }
        let columns;
        if !opts.columns.is_empty() {
            columns = opts.columns.join(",");
            args.push("-o");
            args.push(&columns);
        }
        if let Some(ref target) = opts.target {
            args.push(target);
        }

        let context = opts.target.as_deref().unwrap_or("(all datasets)");
        let output = self.run_checked("zfs", &args, context).await?;
        Ok(parse_rows(&output.stdout))
    }

    async fn list_snapshots(&self, dataset: &str, recursive: bool) -> Result<Vec<String>> {
        let opts = ListOptions::snapshots(dataset).recursive(recursive);
        let rows = self.list_datasets(&opts).await?;
        Ok(rows.into_iter().filter_map(|mut r| {
            if r.is_empty() {
                None
            } else {
                Some(r.swap_remove(0))
            }
        }).collect())
    }

    async fn list_pools(&self, target: Option<&str>) -> Result<Vec<Vec<String>>> {
        let mut args = vec!["list", "-H"];
        if let Some(pool) = target {
            args.push(pool);
        }
        let context = target.unwrap_or("(all pools)");
        let output = self.run_checked("zpool", &args, context).await?;
        Ok(parse_rows(&output.stdout))
    }

    async fn create_snapshot(&self, dataset: &str, snaptag: &str, recursive: bool) -> Result<()> {
        let name = format!("{}@{}", dataset, snaptag);
        validate_snapshot_name(&name)?;

        let mut args = vec!["snapshot"];
        if recursive {
            args.push("-r");
        }
        args.push(&name);
        self.run_checked("zfs", &args, &name).await?;
        Ok(())
    }

    async fn destroy(&self, name: &str, recursive: bool) -> Result<()> {
        // zfs destroy accepts comma-separated batches; we don't.
        if name.contains(',') {
            return Err(Error::Argument(format!(
                "destroy takes one name per call, got {:?}",
                name
            )));
        }
        if name.contains('@') {
            validate_snapshot_name(name)?;
        } else {
            validate_dataset_name(name)?;
        }

        let mut args = vec!["destroy"];
        if recursive {
            args.push("-r");
        }
        args.push(name);

        match self.run_checked("zfs", &args, name).await {
            Ok(_) => Ok(()),
            // A missing snapshot is reported by zfs as a missing dataset.
            Err(Error::NoSuchDataset(ctx)) if name.contains('@') => {
                Err(Error::NoSuchSnapshot(ctx))
            }
            Err(e) => Err(e),
        }
    }

    async fn pool_is_syncing(&self, pool: &str) -> Result<bool> {
        let output = self
            .run_checked("zpool", &["status", "-v", pool], pool)
            .await?;
        let status = String::from_utf8_lossy(&output.stdout);
        let syncing = status.contains(" in progress");
        debug!(pool, syncing, "checked pool sync state");
        Ok(syncing)
    }

    async fn pool_guid(&self, pool: &str) -> Result<String> {
        let output = self
            .run_checked("zpool", &["list", "-H", "-o", "guid", pool], pool)
            .await?;
        let guid = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if guid.is_empty() {
            return Err(Error::CommandFailed(format!(
                "empty guid for pool {}",
                pool
            )));
        }
        Ok(guid)
    }
}

/// Split command output into rows of tab-separated fields.
fn parse_rows(stdout: &[u8]) -> Vec<Vec<String>> {
    String::from_utf8_lossy(stdout)
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| line.split('\t').map(|f| f.to_string()).collect())
        .collect()
}

/// Map known zfs/zpool stderr text to typed errors.
fn classify_failure(context: &str, output: &Output) -> Error {
    let stderr = String::from_utf8_lossy(&output.stderr);

    if stderr.contains("Permission denied") {
        Error::PermissionDenied(context.to_string())
    } else if stderr.contains("snapshot does not exist")
        || stderr.contains("could not find any snapshots")
    {
        Error::NoSuchSnapshot(context.to_string())
    } else if stderr.contains("dataset does not exist") {
        Error::NoSuchDataset(context.to_string())
    } else if stderr.contains("no such pool") {
        Error::NoSuchPool(context.to_string())
    } else if stderr.contains("dataset already exists")
        || stderr.contains("snapshot already exists")
    {
        Error::SnapshotExists(context.to_string())
    } else if stderr.contains("bad property list") || stderr.contains("invalid property") {
        Error::InvalidProperty(context.to_string())
    } else {
        Error::CommandFailed(format!("{}: {}", context, stderr.trim()))
    }
}
