//! Rolling snapshot engine for ZFS
//!
//! Resolves per-dataset snapshot policy from ZFS user properties, takes
//! dated snapshots (recursively where safe), prunes old snapshots beyond a
//! retention count, and plans full-vs-incremental replication to a backup
//! host. All ZFS interaction goes through the [`zfs`] adapter, which shells
//! out to the `zfs`/`zpool` CLIs either locally or over SSH.

pub mod backup;
pub mod policy;
pub mod runner;
pub mod snapshot;
pub mod zfs;

pub use runner::{Runner, SshConfig};
pub use snapshot::{RollingSnapshotter, SnapTarget, SnapshotPurger};
pub use zfs::{ZfsCli, ZfsOps};
