//! Storage keys for staged messages
//!
//! A key is opaque to the relay, but it is joined onto a filesystem path or
//! a URL, so anything that could escape the configured prefix is refused.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::StoreError;

/// Longest key accepted, matching the object-store limit
pub const MAX_KEY_LENGTH: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct StorageKey(String);

impl StorageKey {
    /// Validate a storage key.
    ///
    /// # Security
    /// This function explicitly rejects:
    /// - Path separators (`/` and `\`)
    /// - Directory traversal patterns (`..`)
    /// - Whitespace, control characters and non-ASCII input
    pub fn parse(key: &str) -> Result<Self, StoreError> {
        let invalid = |reason: &str| StoreError::InvalidKey {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        if key.is_empty() {
            return Err(invalid("key is empty"));
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(invalid("key is too long"));
        }

        if key.contains('/') || key.contains('\\') {
            return Err(invalid("key contains a path separator"));
        }

        if key.contains("..") {
            return Err(invalid("key contains a traversal pattern"));
        }

        if !key.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(invalid("key contains non-printable characters"));
        }

        Ok(Self(key.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for StorageKey {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for StorageKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Check an object prefix such as `emails/`: relative, no traversal.
pub(crate) fn validate_prefix(prefix: &str) -> Result<(), StoreError> {
    let invalid = |reason: &str| StoreError::InvalidPrefix {
        prefix: prefix.to_string(),
        reason: reason.to_string(),
    };

    if prefix.starts_with('/') || prefix.contains('\\') {
        return Err(invalid("prefix must be relative"));
    }

    if prefix.split('/').any(|segment| segment == "..") {
        return Err(invalid("prefix contains a traversal pattern"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_object_store_ids() {
        assert!(StorageKey::parse("o1r2u3r7c0b1e2q9h5lf9v1g5o7pnr9l2jq3l0g1").is_ok());
        assert!(StorageKey::parse("01ARZ3NDEKTSV4RRFFQ69G5FAV.eml").is_ok());
    }

    #[test]
    fn rejects_escapes() {
        assert!(StorageKey::parse("").is_err());
        assert!(StorageKey::parse("../etc/passwd").is_err());
        assert!(StorageKey::parse("foo/bar").is_err());
        assert!(StorageKey::parse("..\\windows").is_err());
        assert!(StorageKey::parse("has space").is_err());
        assert!(StorageKey::parse(&"a".repeat(MAX_KEY_LENGTH + 1)).is_err());
    }

    #[test]
    fn prefixes() {
        assert!(validate_prefix("emails/").is_ok());
        assert!(validate_prefix("").is_ok());
        assert!(validate_prefix("/var").is_err());
        assert!(validate_prefix("emails/../secrets").is_err());
    }
}
