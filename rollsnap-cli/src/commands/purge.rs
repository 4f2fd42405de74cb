//! Snapshot purge command for backup receivers

use crate::output;
use anyhow::Result;
use rollsnap_common::{Keep, RetentionDefaults};
use rollsnap_engine::{SnapshotPurger, ZfsCli};

pub async fn run(
    zfs: &ZfsCli,
    base_dataset: &str,
    label: &str,
    keep: Option<&str>,
) -> Result<()> {
    let keep: Keep = match keep {
        Some(raw) => raw.parse()?,
        None => RetentionDefaults::default().for_label(label),
    };

    let purger = SnapshotPurger::new(base_dataset, label, keep);
    let removed = purger.run(zfs).await?;

    output::print_success(&format!(
        "Removed {} {} snapshot(s) under {}",
        removed, label, base_dataset
    ));
    Ok(())
}
