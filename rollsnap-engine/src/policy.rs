//! Snapshot policy resolution
//!
//! Two user properties drive the policy: a blanket enable/disable property
//! and a per-label override (`com.sun:auto-snapshot:daily` and friends).
//! From a flat property listing of every dataset we work out which subtrees
//! can be snapshotted recursively, which datasets must be snapshotted
//! alone, and which are skipped entirely.
//!
//! A dataset is excluded when the label property is an explicit `false`,
//! when the blanket property is `false` and the label is unset, or when
//! both are unset. Only an explicit `true` somewhere, with no `false` at
//! the label level, opts a dataset in.

use crate::zfs::{ListOptions, ZfsOps};
use rollsnap_common::{PropertyValue, Result, PROP_SEP};
use tracing::debug;

/// One dataset's policy-relevant properties
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRow {
    pub name: String,
    pub blanket: PropertyValue,
    pub label: PropertyValue,
}

impl PolicyRow {
    pub fn new(name: &str, blanket: &str, label: &str) -> Self {
        Self {
            name: name.to_string(),
            blanket: PropertyValue::parse(blanket),
            label: PropertyValue::parse(label),
        }
    }

    fn excluded(&self) -> bool {
        self.label == PropertyValue::Disabled
            || (self.blanket == PropertyValue::Disabled && self.label == PropertyValue::Unset)
            || (self.blanket == PropertyValue::Unset && self.label == PropertyValue::Unset)
    }
}

/// Check whether `candidate` can be snapshotted with `-r`.
///
/// Recursion is unsafe when the candidate is an ancestor of, or equal to,
/// any excluded dataset. Comparison is component-wise on `/`-separated
/// paths, never substring: excluding `tank` does not affect `tankety`.
pub fn can_recursive_snapshot<S: AsRef<str>>(candidate: &str, excludes: &[S]) -> bool {
    let parts: Vec<&str> = candidate.split('/').collect();
    for exclude in excludes {
        let exc_parts: Vec<&str> = exclude.as_ref().split('/').collect();
        if exc_parts.len() >= parts.len() && exc_parts[..parts.len()] == parts[..] {
            return false;
        }
    }
    true
}

/// Reduce a recursive candidate list to its topmost ancestors.
///
/// A dataset whose ancestor is elsewhere in the list is redundant, since
/// snapshotting the ancestor recursively already covers it. Order of first
/// occurrence is preserved for survivors.
pub fn narrow_recursive_filesystems(recursive_list: &[String]) -> Vec<String> {
    let mut final_list = Vec::new();
    for ds in recursive_list {
        let parts: Vec<&str> = ds.split('/').collect();
        let has_ancestor = recursive_list.iter().any(|other| {
            if other == ds {
                return false;
            }
            let other_parts: Vec<&str> = other.split('/').collect();
            other_parts.len() <= parts.len() && other_parts[..] == parts[..other_parts.len()]
        });
        if !has_ancestor {
            final_list.push(ds.clone());
        }
    }
    final_list
}

/// Partition policy rows into (single list, narrowed recursive list).
///
/// Pure companion to [`resolve`]; row order determines output order,
/// modulo narrowing.
pub fn partition_datasets(rows: &[PolicyRow]) -> (Vec<String>, Vec<String>) {
    let excludes: Vec<String> = rows
        .iter()
        .filter(|row| row.excluded())
        .map(|row| row.name.clone())
        .collect();

    let mut recursive_list = Vec::new();
    let mut single_list = Vec::new();

    for row in rows {
        if can_recursive_snapshot(&row.name, &excludes) {
            debug!(dataset = %row.name, "eligible for recursive snapshot");
            recursive_list.push(row.name.clone());
        } else if !excludes.contains(&row.name) {
            debug!(dataset = %row.name, "eligible for single snapshot");
            single_list.push(row.name.clone());
        } else {
            debug!(dataset = %row.name, "excluded from snapshots");
        }
    }

    let narrowed = narrow_recursive_filesystems(&recursive_list);
    debug!(?narrowed, "narrowed recursive list");
    (single_list, narrowed)
}

/// Query every dataset's policy properties for `label` and partition them.
pub async fn resolve<Z: ZfsOps>(
    zfs: &Z,
    label: &str,
    userprop_name: &str,
) -> Result<(Vec<String>, Vec<String>)> {
    let columns = vec![
        "name".to_string(),
        userprop_name.to_string(),
        [userprop_name, label].join(PROP_SEP),
    ];
    let opts = ListOptions::datasets()
        .sorted_by("name")
        .with_columns(&columns);
    let listing = zfs.list_datasets(&opts).await?;

    let rows: Vec<PolicyRow> = listing
        .iter()
        .filter(|fields| fields.len() >= 3)
        .map(|fields| PolicyRow::new(&fields[0], &fields[1], &fields[2]))
        .collect();

    Ok(partition_datasets(&rows))
}
