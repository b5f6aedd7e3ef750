use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Result};

const MAX_ID_LEN: usize = 128;

/// Validated, immutable container identifier.
///
/// An id is made of ASCII alphanumerics plus `.`, `-` and `_`, holds at least
/// one letter, never contains `..` and is at most 128 characters long. Any
/// other input produces the empty id.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn create(id: impl AsRef<str>) -> Self {
        let id = id.as_ref();
        if Self::is_valid(id) {
            Self(id.to_string())
        } else {
            Self::default()
        }
    }

    pub fn is_valid(id: &str) -> bool {
        if id.is_empty() || id.len() > MAX_ID_LEN {
            return false;
        }

        let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_');
        if !id.chars().all(allowed) {
            return false;
        }

        // purely numeric ids would be confused with descriptors
        if !id.chars().any(|c| c.is_ascii_alphabetic()) {
            return false;
        }

        !id.contains("..")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for ContainerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let id = Self::create(s);
        if id.is_empty() {
            return Err(Error::InvalidArgument(format!("invalid container id {s:?}")));
        }
        Ok(id)
    }
}

impl Serialize for ContainerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ContainerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_ids() {
        for id in ["a.123", "app", "com.example-app_1", "A", "x1.y2.z3"] {
            assert_eq!(ContainerId::create(id).as_str(), id, "{id} should be valid");
        }
    }

    #[test]
    fn test_invalid_ids() {
        for id in ["", "123", "1.2.3", "a..123", "a/b", "a b", "über", "..", "-_."] {
            assert!(ContainerId::create(id).is_empty(), "{id:?} should be invalid");
        }
    }

    #[test]
    fn test_length_limit() {
        let id = "a".repeat(MAX_ID_LEN);
        assert!(!ContainerId::create(&id).is_empty());

        let id = "a".repeat(MAX_ID_LEN + 1);
        assert!(ContainerId::create(&id).is_empty());
    }

    #[test]
    fn test_parse_and_serde() -> Result<()> {
        let id: ContainerId = "a.123".parse()?;
        assert_eq!(id.to_string(), "a.123");
        assert!("123".parse::<ContainerId>().is_err());

        let json = serde_json::to_string(&id)?;
        assert_eq!(json, "\"a.123\"");
        let back: ContainerId = serde_json::from_str(&json)?;
        assert_eq!(back, id);
        assert!(serde_json::from_str::<ContainerId>("\"a..b\"").is_err());
        Ok(())
    }

    #[test]
    fn test_ordering() {
        let mut ids = vec![ContainerId::create("b"), ContainerId::create("a")];
        ids.sort();
        assert_eq!(ids[0].as_str(), "a");
    }
}
