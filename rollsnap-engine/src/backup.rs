//! Snapshot replication to a backup host
//!
//! Continual incremental replication over SSH. Per filesystem the local and
//! remote snapshot lists are compared to decide between a full send and an
//! incremental send from the newest snapshot the remote already holds.
//! Remote datasets live under `{backup_pool}/{pool_guid}/{filesystem}`, so
//! backups from different source pools never collide.

use crate::policy;
use crate::runner::{shell_quote, Runner, SshConfig};
use crate::snapshot::SnapTarget;
use crate::zfs::{ZfsCli, ZfsOps};
use rollsnap_common::names::pool_from_fsname;
use rollsnap_common::{Error, Result, PREFIX, USERPROP_NAME};
use std::process::Stdio;
use tracing::{debug, info, warn};

/// How one filesystem should be replicated
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum BackupPlan {
    /// Send the newest snapshot in full. When `purge_remote` is set the
    /// remote holds snapshots we no longer have and they must go first.
    Full { purge_remote: bool },
    /// Send the delta from `base` (a snaptag present on both sides) to the
    /// newest local snapshot.
    Incremental { base: String },
}

/// The `snaptag` part of a `dataset@snaptag` name.
fn snaptag_of(name: &str) -> &str {
    name.rsplit('@').next().unwrap_or(name)
}

/// Decide full vs. incremental from two creation-ordered snapshot lists.
///
/// Pure decision logic; `local` and `remote` are full snapshot names for
/// the same filesystem on each side, oldest first, already filtered to the
/// relevant label.
pub fn plan_backup(local: &[String], remote: &[String]) -> BackupPlan {
    if remote.is_empty() || local.len() <= 1 {
        return BackupPlan::Full {
            purge_remote: false,
        };
    }

    // remote is ordered oldest first, so the last entry is newest
    let newest_remote = snaptag_of(remote.last().map(String::as_str).unwrap_or(""));
    let known_locally = local.iter().any(|snap| snaptag_of(snap) == newest_remote);

    if !known_locally {
        // The remote has drifted away from our incremental window.
        BackupPlan::Full { purge_remote: true }
    } else {
        BackupPlan::Incremental {
            base: newest_remote.to_string(),
        }
    }
}

/// Remote dataset that mirrors `filesystem` from the pool with `guid`.
pub fn remote_backup_path(backup_pool: &str, guid: &str, filesystem: &str) -> String {
    format!("{}/{}/{}", backup_pool, guid, filesystem)
}

/// Subset of `snapshots` that are label snapshots of `filesystem` itself.
fn label_snapshots(
    snapshots: &[String],
    filesystem: &str,
    prefix: &str,
    label: &str,
) -> Vec<String> {
    let snap_prefix = format!("{}@{}_{}-", filesystem, prefix, label);
    snapshots
        .iter()
        .filter(|name| name.starts_with(&snap_prefix))
        .cloned()
        .collect()
}

/// Replicate snapshots over SSH, buffered through mbuffer on the receiver
pub struct MbufferedSshBackup {
    label: String,
    prefix: String,
    userprop_name: String,
    backup_pool: String,
    local: ZfsCli,
    remote: ZfsCli,
}

impl MbufferedSshBackup {
    pub fn new(label: &str, host: &str, ssh: SshConfig, backup_pool: &str) -> Self {
        Self::with_runners(
            label,
            backup_pool,
            Runner::local(),
            Runner::ssh(host, ssh),
        )
    }

    /// Construct with explicit runners, e.g. to add a sudo prefix.
    pub fn with_runners(label: &str, backup_pool: &str, local: Runner, remote: Runner) -> Self {
        Self {
            label: label.to_string(),
            prefix: PREFIX.to_string(),
            userprop_name: USERPROP_NAME.to_string(),
            backup_pool: backup_pool.to_string(),
            local: ZfsCli::new(local),
            remote: ZfsCli::new(remote),
        }
    }

    /// Back up the target filesystems. Returns the number of filesystems
    /// replicated.
    pub async fn take_backup(&self, target: SnapTarget) -> Result<usize> {
        match target {
            SnapTarget::Policy => {
                let (single_list, recursive_list) =
                    policy::resolve(&self.local, &self.label, &self.userprop_name).await?;

                info!(
                    "Taking non-recursive backups of: {}",
                    single_list.join(", ")
                );
                let singles = self.backup_datasets(&single_list, false).await?;

                info!("Taking recursive backups of: {}", recursive_list.join(", "));
                let recursives = self.backup_datasets(&recursive_list, true).await?;

                Ok(singles + recursives)
            }
            SnapTarget::Datasets(names) => self.backup_datasets(&names, false).await,
        }
    }

    async fn backup_datasets(&self, fsnames: &[String], recursive: bool) -> Result<usize> {
        let mut replicated = 0;

        for fs in fsnames {
            info!(
                "Looking for {} snapshots of {}",
                if recursive { "recursive" } else { "non-recursive" },
                fs
            );

            let pool = pool_from_fsname(fs)?;
            let guid = self.local.pool_guid(&pool).await?;
            let remote_path = remote_backup_path(&self.backup_pool, &guid, fs);

            let local_snaps = label_snapshots(
                &self.local.list_snapshots(fs, false).await?,
                fs,
                &self.prefix,
                &self.label,
            );
            let Some(newest_local) = local_snaps.last() else {
                warn!(filesystem = %fs, label = %self.label, "no snapshots to replicate");
                continue;
            };

            let remote_snaps = match self.remote.list_snapshots(&remote_path, false).await {
                Ok(snaps) => label_snapshots(&snaps, &remote_path, &self.prefix, &self.label),
                // First backup of this filesystem to this host.
                Err(Error::NoSuchDataset(_)) => Vec::new(),
                Err(e) => return Err(e),
            };

            let plan = plan_backup(&local_snaps, &remote_snaps);
            debug!(filesystem = %fs, ?plan, "backup plan");

            match plan {
                BackupPlan::Full { purge_remote } => {
                    if purge_remote {
                        info!(filesystem = %fs, "remote has diverged, purging stale snapshots");
                        for snap in &remote_snaps {
                            self.remote.destroy(snap, false).await?;
                        }
                    }
                    // zfs receive needs the parent of the target to exist.
                    if let Some((parent, _)) = remote_path.rsplit_once('/') {
                        self.remote.create_dataset(parent, true).await?;
                    }
                    self.send_and_receive(newest_local, None, &remote_path, recursive)
                        .await?;
                }
                BackupPlan::Incremental { base } => {
                    let base_snapshot = format!("{}@{}", fs, base);
                    self.send_and_receive(
                        newest_local,
                        Some(&base_snapshot),
                        &remote_path,
                        recursive,
                    )
                    .await?;
                }
            }

            replicated += 1;
        }

        Ok(replicated)
    }

    async fn send_and_receive(
        &self,
        snapshot: &str,
        incremental_base: Option<&str>,
        remote_path: &str,
        recursive: bool,
    ) -> Result<()> {
        info!(
            "Sending {} to {} ({})",
            snapshot,
            remote_path,
            if incremental_base.is_some() {
                "incremental"
            } else {
                "full"
            }
        );

        let mut send_cmd = self
            .local
            .send_command(snapshot, incremental_base, recursive);
        send_cmd.stdout(Stdio::piped());
        let mut send = send_cmd.spawn()?;

        // mbuffer smooths out the bursty send stream on the receiver.
        let pipeline = format!(
            "mbuffer -q -m 128M | zfs receive -F {}",
            shell_quote(remote_path)
        );
        let mut recv_cmd = self.remote.runner().command("sh", &["-c", &pipeline]);
        recv_cmd.stdin(Stdio::piped());
        let mut recv = recv_cmd.spawn()?;

        let mut send_out = send
            .stdout
            .take()
            .ok_or_else(|| Error::CommandFailed("zfs send produced no stdout".to_string()))?;
        let mut recv_in = recv
            .stdin
            .take()
            .ok_or_else(|| Error::CommandFailed("zfs receive accepted no stdin".to_string()))?;

        let copied = tokio::io::copy(&mut send_out, &mut recv_in).await?;
        drop(recv_in);
        debug!(bytes = copied, "stream copied");

        let send_status = send.wait().await?;
        let recv_status = recv.wait().await?;

        if !send_status.success() {
            return Err(Error::CommandFailed(format!(
                "zfs send of {} failed",
                snapshot
            )));
        }
        if !recv_status.success() {
            return Err(Error::CommandFailed(format!(
                "zfs receive into {} failed",
                remote_path
            )));
        }

        Ok(())
    }
}
