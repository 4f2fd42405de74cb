//! Common types shared between the rollsnap engine and CLI

pub mod names;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// First part of every generated snapshot name.
pub const PREFIX: &str = "zfs-auto-snap";

/// ZFS user property consulted for snapshot policy.
pub const USERPROP_NAME: &str = "com.sun:auto-snapshot";

/// Separator between the user property and its per-label variant.
pub const PROP_SEP: &str = ":";

/// Error types for ZFS operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed dataset name: {0}")]
    BadName(String),

    #[error("dataset does not exist: {0}")]
    NoSuchDataset(String),

    #[error("snapshot does not exist: {0}")]
    NoSuchSnapshot(String),

    #[error("pool does not exist: {0}")]
    NoSuchPool(String),

    #[error("snapshot already exists: {0}")]
    SnapshotExists(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid property: {0}")]
    InvalidProperty(String),

    #[error("argument error: {0}")]
    Argument(String),

    #[error("command failed: {0}")]
    CommandFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Three-state value of a snapshot policy property.
///
/// ZFS reports unset user properties as `-`; anything that is not an
/// explicit `true` or `false` is treated as unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyValue {
    Enabled,
    Disabled,
    Unset,
}

impl PropertyValue {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "true" => PropertyValue::Enabled,
            "false" => PropertyValue::Disabled,
            _ => PropertyValue::Unset,
        }
    }
}

/// Retention count: keep the newest N snapshots, or all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Keep {
    All,
    Count(u32),
}

impl Keep {
    /// Account for a snapshot that is about to be taken.
    pub fn decremented(self) -> Self {
        match self {
            Keep::All => Keep::All,
            Keep::Count(n) => Keep::Count(n.saturating_sub(1)),
        }
    }
}

impl FromStr for Keep {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s == "all" {
            return Ok(Keep::All);
        }
        s.parse::<u32>()
            .map(Keep::Count)
            .map_err(|_| Error::Argument(format!("keep must be a number or \"all\", got {:?}", s)))
    }
}

impl fmt::Display for Keep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Keep::All => write!(f, "all"),
            Keep::Count(n) => write!(f, "{}", n),
        }
    }
}

/// Default retention counts per schedule label.
///
/// Passed explicitly to callers that need a fallback so tests can
/// substitute alternate tables.
#[derive(Debug, Clone)]
pub struct RetentionDefaults {
    counts: HashMap<String, u32>,
    fallback: u32,
}

impl Default for RetentionDefaults {
    fn default() -> Self {
        let mut counts = HashMap::new();
        counts.insert("hourly".to_string(), 24);
        counts.insert("daily".to_string(), 30);
        Self { counts, fallback: 10 }
    }
}

impl RetentionDefaults {
    pub fn for_label(&self, label: &str) -> Keep {
        Keep::Count(*self.counts.get(label).unwrap_or(&self.fallback))
    }

    pub fn with_label(mut self, label: &str, count: u32) -> Self {
        self.counts.insert(label.to_string(), count);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_value_parse() {
        assert_eq!(PropertyValue::parse("true"), PropertyValue::Enabled);
        assert_eq!(PropertyValue::parse("false"), PropertyValue::Disabled);
        assert_eq!(PropertyValue::parse("-"), PropertyValue::Unset);
        assert_eq!(PropertyValue::parse("garbage"), PropertyValue::Unset);
    }

    #[test]
    fn test_keep_from_str() {
        assert_eq!("all".parse::<Keep>().unwrap(), Keep::All);
        assert_eq!("24".parse::<Keep>().unwrap(), Keep::Count(24));
        assert_eq!("0".parse::<Keep>().unwrap(), Keep::Count(0));
        assert!("many".parse::<Keep>().is_err());
        assert!("-3".parse::<Keep>().is_err());
    }

    #[test]
    fn test_keep_decremented() {
        assert_eq!(Keep::Count(3).decremented(), Keep::Count(2));
        assert_eq!(Keep::Count(0).decremented(), Keep::Count(0));
        assert_eq!(Keep::All.decremented(), Keep::All);
    }

    #[test]
    fn test_retention_defaults() {
        let defaults = RetentionDefaults::default();
        assert_eq!(defaults.for_label("hourly"), Keep::Count(24));
        assert_eq!(defaults.for_label("daily"), Keep::Count(30));
        assert_eq!(defaults.for_label("monthly"), Keep::Count(10));

        let custom = RetentionDefaults::default().with_label("hourly", 48);
        assert_eq!(custom.for_label("hourly"), Keep::Count(48));
    }
}
