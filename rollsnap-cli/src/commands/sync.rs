//! Snapshot replication command

use crate::output;
use anyhow::Result;
use rollsnap_engine::backup::MbufferedSshBackup;
use rollsnap_engine::{Runner, SnapTarget, SshConfig};

pub async fn run(
    local: Runner,
    label: &str,
    host: &str,
    user: &str,
    backup_pool: &str,
    dataset: Option<&str>,
) -> Result<()> {
    let ssh = SshConfig {
        username: user.to_string(),
        ..Default::default()
    };

    let target = match dataset {
        Some(ds) => SnapTarget::parse(ds),
        None => SnapTarget::Policy,
    };

    let syncer =
        MbufferedSshBackup::with_runners(label, backup_pool, local, Runner::ssh(host, ssh));
    let replicated = syncer.take_backup(target).await?;

    output::print_success(&format!(
        "Replicated {} filesystem(s) to {}:{}",
        replicated, host, backup_pool
    ));
    Ok(())
}
