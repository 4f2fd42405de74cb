//! Rolling snapshot command

use crate::output;
use anyhow::Result;
use rollsnap_common::{Error, Keep, RetentionDefaults};
use rollsnap_engine::{RollingSnapshotter, SnapTarget, ZfsCli};

/// No datasets, or the `//` sentinel alone, means policy-driven selection.
fn snap_target(datasets: &[String]) -> Result<SnapTarget> {
    match datasets {
        [] => Ok(SnapTarget::Policy),
        [only] => Ok(SnapTarget::parse(only)),
        _ if datasets.iter().any(|ds| ds == "//") => Err(Error::Argument(
            "the \"//\" policy sentinel cannot be combined with other datasets".to_string(),
        )
        .into()),
        _ => Ok(SnapTarget::Datasets(datasets.to_vec())),
    }
}

pub async fn run(
    zfs: &ZfsCli,
    label: &str,
    keep: Option<&str>,
    datasets: &[String],
    avoid_sync: bool,
    recursive: bool,
) -> Result<()> {
    let keep: Keep = match keep {
        Some(raw) => raw.parse()?,
        None => RetentionDefaults::default().for_label(label),
    };

    let target = snap_target(datasets)?;

    let snapper = RollingSnapshotter::new(label, keep).avoid_sync(avoid_sync);
    let count = snapper.take_snapshot(zfs, target, recursive).await?;

    output::print_success(&format!("Created {} {} snapshot(s)", count, label));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_snap_target_defaults_to_policy() {
        assert_eq!(snap_target(&[]).unwrap(), SnapTarget::Policy);
    }

    #[test]
    fn test_snap_target_accepts_policy_sentinel() {
        assert_eq!(snap_target(&strings(&["//"])).unwrap(), SnapTarget::Policy);
    }

    #[test]
    fn test_snap_target_explicit_datasets() {
        assert_eq!(
            snap_target(&strings(&["tank/foo", "tank/bar"])).unwrap(),
            SnapTarget::Datasets(strings(&["tank/foo", "tank/bar"]))
        );
    }

    #[test]
    fn test_snap_target_rejects_mixed_sentinel() {
        let err = snap_target(&strings(&["tank/foo", "//"])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Argument(_))
        ));
    }
}
