//! Versioned change set checksums.
//!
//! A stored checksum carries its algorithm version as a prefix (`2:<hex>`).
//! When the algorithm changes, rows written by an older release are
//! recomputed with the version they were written with: a match means the
//! row is merely old and gets rewritten with the current digest, anything
//! else is drift.

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::changeset::ChangeSet;
use crate::error::{Result, TidemarkError};

/// Checksum algorithm revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChecksumVersion {
    /// CRC32 over the change payloads only.
    V1,
    /// SHA-256 over the identity triple and the change payloads.
    V2,
}

impl ChecksumVersion {
    pub const fn latest() -> Self {
        ChecksumVersion::V2
    }

    pub fn number(self) -> u8 {
        match self {
            ChecksumVersion::V1 => 1,
            ChecksumVersion::V2 => 2,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(ChecksumVersion::V1),
            2 => Some(ChecksumVersion::V2),
            _ => None,
        }
    }
}

/// A digest together with the algorithm version that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckSum {
    version: ChecksumVersion,
    digest: String,
}

impl CheckSum {
    /// Hash `input` with the given algorithm version.
    pub fn compute(version: ChecksumVersion, input: &str) -> Self {
        let digest = match version {
            ChecksumVersion::V1 => format!("{:08x}", crc32fast::hash(input.as_bytes())),
            ChecksumVersion::V2 => {
                let mut hasher = Sha256::new();
                hasher.update(input.as_bytes());
                hex::encode(hasher.finalize())
            }
        };
        Self { version, digest }
    }

    pub fn version(&self) -> ChecksumVersion {
        self.version
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for CheckSum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.version.number(), self.digest)
    }
}

impl FromStr for CheckSum {
    type Err = TidemarkError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || TidemarkError::ConfigError(format!("Invalid checksum '{}'", s));
        let (version, digest) = s.trim().split_once(':').ok_or_else(invalid)?;
        let version = version
            .parse::<u8>()
            .ok()
            .and_then(ChecksumVersion::from_number)
            .ok_or_else(invalid)?;
        if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        Ok(Self {
            version,
            digest: digest.to_ascii_lowercase(),
        })
    }
}

impl Serialize for CheckSum {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// An extra digest a change set declares acceptable despite a mismatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidCheckSum {
    /// Accept any stored digest.
    Any,
    Exact(CheckSum),
}

impl ValidCheckSum {
    pub fn accepts(&self, stored: &CheckSum) -> bool {
        match self {
            ValidCheckSum::Any => true,
            ValidCheckSum::Exact(sum) => sum == stored,
        }
    }
}

impl FromStr for ValidCheckSum {
    type Err = TidemarkError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" | "all" | "*" => Ok(ValidCheckSum::Any),
            _ => Ok(ValidCheckSum::Exact(s.parse()?)),
        }
    }
}

/// Result of comparing a ledger checksum with the authored change set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumComparison {
    /// Same version, same digest.
    Match,
    /// Older version whose digest still matches; the stored value should be rewritten.
    Upgrade { current: CheckSum },
    /// The authored content changed after it was recorded.
    Drift { stored: CheckSum, computed: CheckSum },
}

/// Compare a stored checksum against the change set, recomputing with the
/// stored version so that an algorithm upgrade is never reported as drift.
pub fn compare(stored: &CheckSum, change_set: &ChangeSet) -> ChecksumComparison {
    let recomputed = change_set.checksum_with(stored.version());
    if recomputed != *stored {
        return ChecksumComparison::Drift {
            stored: stored.clone(),
            computed: recomputed,
        };
    }
    if stored.version() < ChecksumVersion::latest() {
        ChecksumComparison::Upgrade {
            current: change_set.checksum().clone(),
        }
    } else {
        ChecksumComparison::Match
    }
}

/// Parse an optional stored checksum column.
pub fn parse_stored(value: Option<&str>) -> Result<Option<CheckSum>> {
    match value {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => s.parse().map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::Sql;
    use std::sync::Arc;

    fn change_set(sql: &str) -> ChangeSet {
        ChangeSet::new("1", "alice", "db/main.toml").with_change(Arc::new(Sql::new(sql)))
    }

    #[test]
    fn test_display_and_parse() {
        let sum = CheckSum::compute(ChecksumVersion::V2, "abc");
        let text = sum.to_string();
        assert!(text.starts_with("2:"));
        assert_eq!(text.len(), 2 + 64);
        assert_eq!(text.parse::<CheckSum>().unwrap(), sum);
    }

    #[test]
    fn test_v1_is_crc32() {
        let sum = CheckSum::compute(ChecksumVersion::V1, "abc");
        assert_eq!(sum.digest(), format!("{:08x}", crc32fast::hash(b"abc")));
        assert_eq!(sum.version(), ChecksumVersion::V1);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<CheckSum>().is_err());
        assert!("abc".parse::<CheckSum>().is_err());
        assert!("9:abc".parse::<CheckSum>().is_err());
        assert!("2:xyz".parse::<CheckSum>().is_err());
        assert!("2:".parse::<CheckSum>().is_err());
    }

    #[test]
    fn test_compare_match() {
        let cs = change_set("SELECT 1");
        let stored = cs.checksum().clone();
        assert_eq!(compare(&stored, &cs), ChecksumComparison::Match);
    }

    #[test]
    fn test_compare_upgrades_older_version() {
        let cs = change_set("SELECT 1");
        let legacy = cs.checksum_with(ChecksumVersion::V1);
        match compare(&legacy, &cs) {
            ChecksumComparison::Upgrade { current } => {
                assert_eq!(current.version(), ChecksumVersion::latest());
                assert_eq!(&current, cs.checksum());
            }
            other => panic!("expected upgrade, got {other:?}"),
        }
    }

    #[test]
    fn test_compare_detects_drift_in_legacy_rows() {
        let old = change_set("SELECT 1");
        let legacy = old.checksum_with(ChecksumVersion::V1);
        let edited = change_set("SELECT 2");
        match compare(&legacy, &edited) {
            ChecksumComparison::Drift { stored, computed } => {
                assert_eq!(stored, legacy);
                assert_eq!(computed.version(), ChecksumVersion::V1);
            }
            other => panic!("expected drift, got {other:?}"),
        }
    }

    #[test]
    fn test_compare_detects_drift() {
        let stored = change_set("SELECT 1").checksum().clone();
        let edited = change_set("SELECT 2");
        assert!(matches!(
            compare(&stored, &edited),
            ChecksumComparison::Drift { .. }
        ));
    }

    #[test]
    fn test_valid_checksum_any() {
        let any: ValidCheckSum = "ANY".parse().unwrap();
        let sum = CheckSum::compute(ChecksumVersion::V2, "x");
        assert!(any.accepts(&sum));
        let exact: ValidCheckSum = sum.to_string().parse().unwrap();
        assert!(exact.accepts(&sum));
        assert!(!exact.accepts(&CheckSum::compute(ChecksumVersion::V2, "y")));
    }

    #[test]
    fn test_parse_stored_blank_is_none() {
        assert_eq!(parse_stored(None).unwrap(), None);
        assert_eq!(parse_stored(Some("  ")).unwrap(), None);
        assert!(parse_stored(Some("2:ab")).unwrap().is_some());
    }
}
