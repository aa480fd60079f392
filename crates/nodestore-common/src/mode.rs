//! Operating modes of a shard and its components

use serde::{Deserialize, Serialize};
use std::fmt;

/// Mode of operation of a shard, its write-cache, metabase and blob store.
///
/// Two independent properties are encoded: whether mutation is allowed
/// (`read_only`) and whether the metabase is available (`no_metabase`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// All components accept reads and writes
    #[default]
    ReadWrite,
    /// Mutation is rejected everywhere
    ReadOnly,
    /// Metabase is unavailable, blob store is writable
    Degraded,
    /// Metabase is unavailable and mutation is rejected
    DegradedReadOnly,
}

impl Mode {
    /// True if the mode forbids mutation
    #[must_use]
    pub const fn read_only(self) -> bool {
        matches!(self, Self::ReadOnly | Self::DegradedReadOnly)
    }

    /// True if the mode disables the metabase
    #[must_use]
    pub const fn no_metabase(self) -> bool {
        matches!(self, Self::Degraded | Self::DegradedReadOnly)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ReadWrite => "READ_WRITE",
            Self::ReadOnly => "READ_ONLY",
            Self::Degraded => "DEGRADED_READ_WRITE",
            Self::DegradedReadOnly => "DEGRADED_READ_ONLY",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_flags() {
        assert!(!Mode::ReadWrite.read_only());
        assert!(!Mode::ReadWrite.no_metabase());
        assert!(Mode::ReadOnly.read_only());
        assert!(!Mode::ReadOnly.no_metabase());
        assert!(!Mode::Degraded.read_only());
        assert!(Mode::Degraded.no_metabase());
        assert!(Mode::DegradedReadOnly.read_only());
        assert!(Mode::DegradedReadOnly.no_metabase());
    }

    #[test]
    fn test_mode_default() {
        assert_eq!(Mode::default(), Mode::ReadWrite);
    }
}
