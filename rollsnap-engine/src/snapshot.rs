//! Rolling snapshots and retention pruning
//!
//! Snapshots are named `{prefix}_{label}-{YYYY-MM-DD-HHMM}`. Minute
//! resolution means two runs for the same label inside one minute collide
//! with [`Error::SnapshotExists`]; that limitation is accepted.

use crate::policy;
use crate::zfs::{ListOptions, ZfsOps};
use chrono::Local;
use rollsnap_common::names::pool_from_fsname;
use rollsnap_common::{Error, Keep, Result, PREFIX, USERPROP_NAME};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// What to snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapTarget {
    /// Consult the ZFS user properties for eligible datasets
    Policy,
    /// Explicit dataset names
    Datasets(Vec<String>),
}

impl SnapTarget {
    /// `//` is the conventional sentinel for policy-driven selection.
    pub fn parse(raw: &str) -> Self {
        if raw == "//" {
            SnapTarget::Policy
        } else {
            SnapTarget::Datasets(vec![raw.to_string()])
        }
    }
}

/// Drop datasets whose pool is mid-scrub or mid-resilver.
///
/// A snapshot would interrupt or restart the sync, so those datasets are
/// skipped for this run. Each distinct pool is queried at most once; the
/// cache lives only for this call. A sync can still start or finish
/// between the check and the snapshot; that race is accepted.
pub async fn filter_syncing_pools<Z: ZfsOps>(zfs: &Z, fsnames: &[String]) -> Result<Vec<String>> {
    let mut pool_cache: HashMap<String, bool> = HashMap::new();
    let mut survivors = Vec::new();

    for fs in fsnames {
        let pool = pool_from_fsname(fs)?;
        let syncing = match pool_cache.get(&pool) {
            Some(cached) => *cached,
            None => {
                let state = zfs.pool_is_syncing(&pool).await?;
                pool_cache.insert(pool.clone(), state);
                state
            }
        };

        if syncing {
            info!(dataset = %fs, pool = %pool, "pool is being scrubbed/resilvered, skipping");
        } else {
            survivors.push(fs.clone());
        }
    }

    Ok(survivors)
}

/// Pick which snapshots to destroy for one filesystem and label.
///
/// `snapshots` must be ordered by creation time ascending. Entries matching
/// the exact prefix `{filesystem}@{prefix}_{label}-` beyond the newest
/// `keep` are returned oldest-first; snapshots of child filesystems and
/// other labels never match.
pub fn select_prunable(
    snapshots: &[String],
    filesystem: &str,
    keep: u32,
    label: &str,
    prefix: &str,
) -> Vec<String> {
    let snap_prefix = format!("{}@{}_{}-", filesystem, prefix, label);
    debug!(%snap_prefix, "subsetting snapshots by prefix");

    let matching: Vec<&String> = snapshots
        .iter()
        .filter(|name| name.starts_with(&snap_prefix))
        .collect();

    matching
        .iter()
        .skip(keep as usize)
        .map(|name| name.to_string())
        .collect()
}

/// Destroy old snapshots of `filesystem`, keeping the `keep` newest.
///
/// With [`Keep::All`] this is a no-op and no query is issued. A snapshot
/// that is already gone by the time we destroy it (a previous partial run
/// may have removed it) is logged and skipped; every other failure
/// propagates. Returns the number destroyed.
pub async fn destroy_older_snapshots<Z: ZfsOps>(
    zfs: &Z,
    filesystem: &str,
    keep: Keep,
    label: &str,
    prefix: &str,
    recursive: bool,
) -> Result<usize> {
    let keep = match keep {
        Keep::All => return Ok(0),
        Keep::Count(n) => n,
    };

    // Child filesystem snapshots are filtered out by the name prefix, so
    // the listing is always recursive; the recursive flag only shapes the
    // destroys.
    let snapshots = zfs.list_snapshots(filesystem, true).await?;
    let to_remove = select_prunable(&snapshots, filesystem, keep, label, prefix);
    debug!(
        filesystem,
        keep,
        candidates = snapshots.len(),
        removing = to_remove.len(),
        "pruning snapshots"
    );

    let mut removed = 0;
    for snapshot in &to_remove {
        match zfs.destroy(snapshot, recursive).await {
            Ok(()) => removed += 1,
            Err(Error::NoSuchSnapshot(_)) | Err(Error::NoSuchDataset(_)) => {
                warn!(snapshot = %snapshot, "unable to destroy, already gone");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(removed)
}

/// Automatic rolling snapshots for ZFS filesystems
///
/// Takes a dated snapshot of every eligible dataset and purges older
/// snapshots for the same label beyond the retention count. All fields are
/// fixed at construction.
#[derive(Debug, Clone)]
pub struct RollingSnapshotter {
    label: String,
    keep: Keep,
    avoid_sync: bool,
    prefix: String,
    userprop_name: String,
}

impl RollingSnapshotter {
    pub fn new(label: &str, keep: Keep) -> Self {
        Self {
            label: label.to_string(),
            keep,
            avoid_sync: false,
            prefix: PREFIX.to_string(),
            userprop_name: USERPROP_NAME.to_string(),
        }
    }

    /// Skip datasets on pools that are mid-scrub/resilver.
    pub fn avoid_sync(mut self, avoid: bool) -> Self {
        self.avoid_sync = avoid;
        self
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    pub fn with_userprop_name(mut self, name: &str) -> Self {
        self.userprop_name = name.to_string();
        self
    }

    /// Snapshot the target, then prune. Returns the number of snapshots
    /// created (one per top-level dataset; recursive children are covered
    /// by their ancestor's snapshot).
    pub async fn take_snapshot<Z: ZfsOps>(
        &self,
        zfs: &Z,
        target: SnapTarget,
        recursive: bool,
    ) -> Result<usize> {
        match target {
            SnapTarget::Policy => {
                let (single_list, recursive_list) =
                    policy::resolve(zfs, &self.label, &self.userprop_name).await?;

                info!(
                    "Taking non-recursive snapshots of: {}",
                    single_list.join(", ")
                );
                let singles = self.snap_datasets(zfs, &single_list, false).await?;

                info!(
                    "Taking recursive snapshots of: {}",
                    recursive_list.join(", ")
                );
                let recursives = self.snap_datasets(zfs, &recursive_list, true).await?;

                Ok(singles + recursives)
            }
            SnapTarget::Datasets(names) => self.snap_datasets(zfs, &names, recursive).await,
        }
    }

    async fn snap_datasets<Z: ZfsOps>(
        &self,
        zfs: &Z,
        fsnames: &[String],
        recursive: bool,
    ) -> Result<usize> {
        let snapdate = Local::now().format("%Y-%m-%d-%H%M").to_string();
        debug!(%snapdate, "snapshot date");
        let snapname = format!("{}_{}-{}", self.prefix, self.label, snapdate);

        let fsnames = if self.avoid_sync {
            filter_syncing_pools(zfs, fsnames).await?
        } else {
            fsnames.to_vec()
        };

        // We are about to add one snapshot per filesystem, so retain one
        // fewer of the existing ones.
        let keep = self.keep.decremented();

        for fs in &fsnames {
            info!(
                "Taking {} snapshot {}@{}",
                if recursive { "recursive" } else { "non-recursive" },
                fs,
                snapname
            );
            zfs.create_snapshot(fs, &snapname, recursive).await?;

            destroy_older_snapshots(zfs, fs, keep, &self.label, &self.prefix, recursive).await?;
        }

        Ok(fsnames.len())
    }
}

/// Prune old snapshots under every child of a base dataset
///
/// Useful on a backup receiver, where snapshots arrive via replication and
/// nothing else retires them. On source systems use [`RollingSnapshotter`].
#[derive(Debug, Clone)]
pub struct SnapshotPurger {
    base_dataset: String,
    label: String,
    keep: Keep,
    prefix: String,
}

impl SnapshotPurger {
    pub fn new(base_dataset: &str, label: &str, keep: Keep) -> Self {
        Self {
            base_dataset: base_dataset.to_string(),
            label: label.to_string(),
            keep,
            prefix: PREFIX.to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    /// Returns the total number of snapshots removed.
    pub async fn run<Z: ZfsOps>(&self, zfs: &Z) -> Result<usize> {
        let opts = ListOptions::datasets()
            .with_columns(&["name".to_string()])
            .with_target(&self.base_dataset)
            .recursive(true);
        let rows = zfs.list_datasets(&opts).await?;

        let mut removed = 0;
        // The first row is the base dataset itself.
        for row in rows.iter().skip(1) {
            let Some(ds) = row.first() else { continue };
            removed +=
                destroy_older_snapshots(zfs, ds, self.keep, &self.label, &self.prefix, false)
                    .await?;
        }

        info!(removed, base = %self.base_dataset, "purged old snapshots");
        Ok(removed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// In-memory stand-in for the zfs command line
    #[derive(Default)]
    pub(crate) struct FakeZfs {
        /// Rows returned from dataset listings
        pub policy_rows: Vec<Vec<String>>,
        /// Snapshot names returned from snapshot listings, oldest first
        pub snapshots: Vec<String>,
        /// Pools that report a scrub/resilver in progress
        pub syncing_pools: Vec<String>,
        /// Destroys of these names fail as already gone
        pub missing_snapshots: Vec<String>,
        /// Snapshot creation fails with SnapshotExists
        pub fail_create: bool,

        pub sync_checks: Mutex<Vec<String>>,
        pub created: Mutex<Vec<(String, String, bool)>>,
        pub destroyed: Mutex<Vec<String>>,
        pub list_calls: Mutex<usize>,
    }

    impl ZfsOps for FakeZfs {
        async fn list_datasets(&self, _opts: &ListOptions) -> Result<Vec<Vec<String>>> {
            *self.list_calls.lock().unwrap() += 1;
            Ok(self.policy_rows.clone())
        }

        async fn list_snapshots(&self, _dataset: &str, _recursive: bool) -> Result<Vec<String>> {
            *self.list_calls.lock().unwrap() += 1;
            Ok(self.snapshots.clone())
        }

        async fn list_pools(&self, _target: Option<&str>) -> Result<Vec<Vec<String>>> {
            Ok(Vec::new())
        }

        async fn create_snapshot(
            &self,
            dataset: &str,
            snaptag: &str,
            recursive: bool,
        ) -> Result<()> {
            if self.fail_create {
                return Err(Error::SnapshotExists(format!("{}@{}", dataset, snaptag)));
            }
            self.created.lock().unwrap().push((
                dataset.to_string(),
                snaptag.to_string(),
                recursive,
            ));
            Ok(())
        }

        async fn destroy(&self, name: &str, _recursive: bool) -> Result<()> {
            if self.missing_snapshots.iter().any(|m| m == name) {
                return Err(Error::NoSuchSnapshot(name.to_string()));
            }
            self.destroyed.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn pool_is_syncing(&self, pool: &str) -> Result<bool> {
            self.sync_checks.lock().unwrap().push(pool.to_string());
            Ok(self.syncing_pools.iter().any(|p| p == pool))
        }

        async fn pool_guid(&self, _pool: &str) -> Result<String> {
            Ok("1234567890".to_string())
        }
    }

    pub(crate) fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    /// 7 hourly snapshots of tank/foo interleaved with child, daily and
    /// manual snapshots, oldest first.
    fn hourly_fixture() -> Vec<String> {
        strings(&[
            "tank/foo@zfs-auto-snap_hourly-2014-11-19-2300",
            "tank/foo/bar@zfs-auto-snap_hourly-2014-11-19-2300",
            "tank/foo@zfs-auto-snap_daily-2014-11-19-0003",
            "tank/foo/bar@zfs-auto-snap_daily-2014-11-19-0003",
            "tank/foo@zfs-auto-snap_hourly-2014-11-20-0000",
            "tank/foo/bar@zfs-auto-snap_hourly-2014-11-20-0000",
            "tank/foo@manual-snapshot",
            "tank/foo@zfs-auto-snap_hourly-2014-11-20-0100",
            "tank/foo/bar@zfs-auto-snap_hourly-2014-11-20-0100",
            "tank/foo@zfs-auto-snap_hourly-2014-11-20-0200",
            "tank/foo/bar@zfs-auto-snap_hourly-2014-11-20-0200",
            "tank/foo@zfs-auto-snap_hourly-2014-11-20-0300",
            "tank/foo/bar@zfs-auto-snap_hourly-2014-11-20-0300",
            "tank/foo@zfs-auto-snap_hourly-2014-11-20-0400",
            "tank/foo/bar@zfs-auto-snap_hourly-2014-11-20-0400",
            "tank/foo@zfs-auto-snap_hourly-2014-11-20-0500",
            "tank/foo/bar@zfs-auto-snap_hourly-2014-11-20-0500",
        ])
    }

    #[test]
    fn test_select_prunable_filters_label_and_children() {
        let to_remove = select_prunable(
            &hourly_fixture(),
            "tank/foo",
            3,
            "hourly",
            "zfs-auto-snap",
        );
        // 7 hourly snapshots of tank/foo match; the first keep=3 entries of
        // the creation-ordered list survive and the remaining 4 are
        // returned for destruction. Child and non-hourly snapshots never
        // match.
        assert_eq!(
            to_remove,
            strings(&[
                "tank/foo@zfs-auto-snap_hourly-2014-11-20-0200",
                "tank/foo@zfs-auto-snap_hourly-2014-11-20-0300",
                "tank/foo@zfs-auto-snap_hourly-2014-11-20-0400",
                "tank/foo@zfs-auto-snap_hourly-2014-11-20-0500",
            ])
        );
    }

    #[test]
    fn test_select_prunable_keep_covers_everything() {
        let to_remove = select_prunable(
            &hourly_fixture(),
            "tank/foo",
            10,
            "hourly",
            "zfs-auto-snap",
        );
        assert!(to_remove.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_older_snapshots() {
        let zfs = FakeZfs {
            snapshots: hourly_fixture(),
            ..Default::default()
        };
        let removed = destroy_older_snapshots(
            &zfs,
            "tank/foo",
            Keep::Count(3),
            "hourly",
            "zfs-auto-snap",
            false,
        )
        .await
        .unwrap();
        assert_eq!(removed, 4);
        assert_eq!(zfs.destroyed.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_destroy_older_snapshots_keep_all_is_a_noop() {
        let zfs = FakeZfs {
            snapshots: hourly_fixture(),
            ..Default::default()
        };
        let removed = destroy_older_snapshots(
            &zfs,
            "tank/foo",
            Keep::All,
            "hourly",
            "zfs-auto-snap",
            false,
        )
        .await
        .unwrap();
        assert_eq!(removed, 0);
        assert_eq!(*zfs.list_calls.lock().unwrap(), 0);
        assert!(zfs.destroyed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_older_snapshots_absorbs_already_gone() {
        let zfs = FakeZfs {
            snapshots: hourly_fixture(),
            missing_snapshots: strings(&["tank/foo@zfs-auto-snap_hourly-2014-11-20-0200"]),
            ..Default::default()
        };
        let removed = destroy_older_snapshots(
            &zfs,
            "tank/foo",
            Keep::Count(3),
            "hourly",
            "zfs-auto-snap",
            false,
        )
        .await
        .unwrap();
        // One of the four candidates was already gone; not fatal, not
        // counted.
        assert_eq!(removed, 3);
    }

    #[tokio::test]
    async fn test_filter_syncing_pools_memoizes_and_keeps_order() {
        let zfs = FakeZfs {
            syncing_pools: strings(&["deadweight"]),
            ..Default::default()
        };
        let survivors = filter_syncing_pools(
            &zfs,
            &strings(&[
                "tank/foo",
                "tank/bar",
                "deadweight/foo",
                "deadweight/bar",
                "tan/deadweight",
            ]),
        )
        .await
        .unwrap();
        assert_eq!(survivors, strings(&["tank/foo", "tank/bar", "tan/deadweight"]));
        // One status query per distinct pool, five inputs notwithstanding.
        assert_eq!(
            *zfs.sync_checks.lock().unwrap(),
            strings(&["tank", "deadweight", "tan"])
        );
    }

    #[tokio::test]
    async fn test_filter_syncing_pools_bad_name_is_fatal() {
        let zfs = FakeZfs::default();
        let err = filter_syncing_pools(&zfs, &strings(&["/invalid"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadName(_)));
    }

    #[tokio::test]
    async fn test_take_snapshot_explicit_dataset() {
        let zfs = FakeZfs {
            snapshots: hourly_fixture(),
            ..Default::default()
        };
        let snapper = RollingSnapshotter::new("hourly", Keep::Count(3));
        let count = snapper
            .take_snapshot(&zfs, SnapTarget::Datasets(strings(&["tank/foo"])), false)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let created = zfs.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        let (ds, snaptag, recursive) = &created[0];
        assert_eq!(ds, "tank/foo");
        assert!(!recursive);
        assert!(snaptag.starts_with("zfs-auto-snap_hourly-"));
        // {prefix}_{label}-{YYYY-MM-DD-HHMM}
        let date = snaptag.strip_prefix("zfs-auto-snap_hourly-").unwrap();
        assert_eq!(date.len(), "2014-11-20-0500".len());

        // keep was pre-decremented to 2, so 5 of the 7 hourlies go.
        assert_eq!(zfs.destroyed.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_take_snapshot_policy_partitions_and_orders() {
        let rows: Vec<Vec<String>> = [
            ["tank", "-", "-"],
            ["tank/crap with spaces", "-", "-"],
            ["tank/nodaily", "-", "false"],
            ["tank/snapnorecurse", "true", "-"],
            ["tank/snapnorecurse/child1", "true", "false"],
            ["tank/snapnorecurse/child2", "true", "-"],
            ["tank/snaprecurse", "true", "-"],
            ["tank/snaprecurse/child1", "true", "-"],
            ["tank/snaprecurse/child2", "true", "-"],
        ]
        .iter()
        .map(|r| strings(&r[..]))
        .collect();

        let zfs = FakeZfs {
            policy_rows: rows,
            ..Default::default()
        };
        let snapper = RollingSnapshotter::new("daily", Keep::All);
        let count = snapper
            .take_snapshot(&zfs, SnapTarget::Policy, false)
            .await
            .unwrap();
        assert_eq!(count, 3);

        let created = zfs.created.lock().unwrap();
        let summary: Vec<(String, bool)> =
            created.iter().map(|(ds, _, r)| (ds.clone(), *r)).collect();
        assert_eq!(
            summary,
            vec![
                ("tank/snapnorecurse".to_string(), false),
                ("tank/snapnorecurse/child2".to_string(), true),
                ("tank/snaprecurse".to_string(), true),
            ]
        );
    }

    #[tokio::test]
    async fn test_take_snapshot_collision_propagates() {
        let zfs = FakeZfs {
            fail_create: true,
            ..Default::default()
        };
        let snapper = RollingSnapshotter::new("hourly", Keep::Count(3));
        let err = snapper
            .take_snapshot(&zfs, SnapTarget::Datasets(strings(&["tank/foo"])), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SnapshotExists(_)));
    }

    #[test]
    fn test_snap_target_parse() {
        assert_eq!(SnapTarget::parse("//"), SnapTarget::Policy);
        assert_eq!(
            SnapTarget::parse("tank/foo"),
            SnapTarget::Datasets(strings(&["tank/foo"]))
        );
    }

    #[tokio::test]
    async fn test_purger_skips_base_dataset() {
        let zfs = FakeZfs {
            policy_rows: vec![
                strings(&["zfsbackups"]),
                strings(&["zfsbackups/1234/tank/foo"]),
            ],
            snapshots: hourly_fixture()
                .iter()
                .map(|s| format!("zfsbackups/1234/{}", s))
                .collect(),
            ..Default::default()
        };
        let purger = SnapshotPurger::new("zfsbackups", "hourly", Keep::Count(3));
        let removed = purger.run(&zfs).await.unwrap();
        assert_eq!(removed, 4);
    }
}
