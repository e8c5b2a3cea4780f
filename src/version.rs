//! Ordered migration version identifiers.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{MigrateError, MigrateResult};

/// An ordered, dot-separated numeric version identifier (e.g. `1`, `1.2.3`).
///
/// Trailing zero components are insignificant: `1.2` and `1.2.0` compare
/// equal and hash identically, while the original text is preserved for
/// display.
#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    parts: Vec<u64>,
}

impl Version {
    /// Parse a version from its textual form.
    pub fn parse(text: &str) -> MigrateResult<Self> {
        let raw = text.trim();
        if raw.is_empty() {
            return Err(MigrateError::configuration("version must not be empty"));
        }

        let mut parts = Vec::new();
        for component in raw.split('.') {
            let value: u64 = component.parse().map_err(|_| {
                MigrateError::configuration(format!(
                    "invalid version '{raw}': component '{component}' is not numeric"
                ))
            })?;
            parts.push(value);
        }

        // Trailing zeros do not affect ordering or identity.
        while parts.len() > 1 && parts.last() == Some(&0) {
            parts.pop();
        }

        Ok(Self {
            raw: raw.to_string(),
            parts,
        })
    }

    /// The normalized numeric components (trailing zeros stripped).
    pub fn components(&self) -> &[u64] {
        &self.parts
    }

    /// The version exactly as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Version {
    type Err = MigrateError;

    fn from_str(s: &str) -> MigrateResult<Self> {
        Self::parse(s)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.parts == other.parts
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.parts.hash(state);
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for i in 0..len {
            let a = self.parts.get(i).copied().unwrap_or(0);
            let b = other.parts.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        Ordering::Equal
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Version::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// Target version selector for a migration run.
///
/// `Current`, `Latest` and `Next` are resolved against the reconciled
/// state at plan time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetVersion {
    /// The highest currently applied version (apply nothing new).
    Current,
    /// The highest resolved version (apply everything).
    Latest,
    /// One pending migration past the current version.
    Next,
    /// An explicit version; pending migrations above it are excluded.
    Specific(Version),
}

impl TargetVersion {
    /// Parse a target selector from its textual form.
    pub fn parse(text: &str) -> MigrateResult<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "current" => Ok(Self::Current),
            "latest" => Ok(Self::Latest),
            "next" => Ok(Self::Next),
            _ => Ok(Self::Specific(Version::parse(text)?)),
        }
    }
}

impl fmt::Display for TargetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Current => f.write_str("current"),
            Self::Latest => f.write_str("latest"),
            Self::Next => f.write_str("next"),
            Self::Specific(v) => write!(f, "{v}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(text: &str) -> Version {
        Version::parse(text).unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let version = v("1.2.3");
        assert_eq!(version.to_string(), "1.2.3");
        assert_eq!(version.components(), &[1, 2, 3]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Version::parse("").is_err());
        assert!(Version::parse("1.a.2").is_err());
        assert!(Version::parse("one").is_err());
    }

    #[test]
    fn test_total_ordering() {
        assert!(v("1") < v("2"));
        assert!(v("1.2") < v("1.10"));
        assert!(v("1.9") < v("1.10"));
        assert!(v("2") < v("10"));
        assert!(v("1.2.1") > v("1.2"));
    }

    #[test]
    fn test_trailing_zeros_insignificant() {
        assert_eq!(v("1.2"), v("1.2.0"));
        assert_eq!(v("1"), v("1.0.0"));
        assert!(v("1.2.0") < v("1.2.1"));

        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(v("1.2"));
        assert!(set.contains(&v("1.2.0")));
    }

    #[test]
    fn test_display_preserves_raw_text() {
        assert_eq!(v("1.2.0").to_string(), "1.2.0");
    }

    #[test]
    fn test_target_version_parse() {
        assert_eq!(TargetVersion::parse("latest").unwrap(), TargetVersion::Latest);
        assert_eq!(TargetVersion::parse("Current").unwrap(), TargetVersion::Current);
        assert_eq!(TargetVersion::parse("next").unwrap(), TargetVersion::Next);
        assert_eq!(
            TargetVersion::parse("3.1").unwrap(),
            TargetVersion::Specific(v("3.1"))
        );
        assert!(TargetVersion::parse("nonsense").is_err());
    }
}
