//! Dataset and snapshot name validation
//!
//! Dataset names are hierarchical, `pool/child/grandchild`, with no empty
//! components. Snapshot names are `dataset@snaptag` where the snaptag is a
//! single component. Malformed names fail fast with [`Error::BadName`]
//! rather than being silently coerced.

use crate::{Error, Result};

/// Characters allowed in a name component besides alphanumerics.
///
/// Space and colon are legal in ZFS dataset names and show up in the wild,
/// so they are accepted here alongside the usual `-_.` set.
const EXTRA_COMPONENT_CHARS: &[char] = &['-', '_', '.', ':', ' '];

fn is_valid_component(component: &str) -> bool {
    !component.is_empty()
        && component
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || EXTRA_COMPONENT_CHARS.contains(&c))
}

/// Validate a hierarchical dataset (filesystem or volume) name.
pub fn validate_dataset_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::BadName("empty dataset name".to_string()));
    }
    if name.split('/').all(is_valid_component) {
        Ok(())
    } else {
        Err(Error::BadName(name.to_string()))
    }
}

/// Validate a `dataset@snaptag` snapshot name.
pub fn validate_snapshot_name(name: &str) -> Result<()> {
    let (dataset, snaptag) = name
        .split_once('@')
        .ok_or_else(|| Error::BadName(name.to_string()))?;
    validate_dataset_name(dataset)?;
    if is_valid_component(snaptag) {
        Ok(())
    } else {
        Err(Error::BadName(name.to_string()))
    }
}

/// Split a dataset name into its path components.
pub fn split_components(name: &str) -> Vec<&str> {
    name.split('/').collect()
}

/// Derive the pool name (first path component) from a filesystem name.
pub fn pool_from_fsname(fsname: &str) -> Result<String> {
    validate_dataset_name(fsname)?;
    // split always yields at least one element for a validated name
    Ok(fsname.split('/').next().unwrap_or(fsname).to_string())
}
