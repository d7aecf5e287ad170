//! Domain newtype for type safety
//!
//! Wraps validated, lowercased domain names so that a catch-all key or a
//! bounce rule can never be confused with a full mailbox.

use std::{
    fmt::{self, Display},
    ops::Deref,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::address::{AddressError, MAX_DOMAIN_LENGTH};

/// A validated, lowercase domain name
///
/// # Examples
///
/// ```
/// use ferry_common::Domain;
///
/// let domain = Domain::parse("Mail.Example.COM").unwrap();
/// assert_eq!(domain.as_str(), "mail.example.com");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Domain(Arc<str>);

impl Domain {
    /// Validate and normalise a domain name.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError::InvalidDomain`] when any label is empty, longer
    /// than 63 octets, or starts/ends with a hyphen, and
    /// [`AddressError::DomainTooLong`] when the whole name exceeds 255 octets.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let input = input.trim().trim_end_matches('.');

        if input.is_empty() {
            return Err(AddressError::InvalidDomain("Empty domain".to_string()));
        }

        if input.len() > MAX_DOMAIN_LENGTH {
            return Err(AddressError::DomainTooLong);
        }

        for label in input.split('.') {
            validate_label(label)?;
        }

        Ok(Self(Arc::from(input.to_ascii_lowercase())))
    }

    /// Get the domain as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate_label(label: &str) -> Result<(), AddressError> {
    if label.is_empty() {
        return Err(AddressError::InvalidDomain(
            "Domain contains an empty label".to_string(),
        ));
    }

    if label.len() > 63 {
        return Err(AddressError::InvalidDomain(format!(
            "Label '{label}' exceeds 63 octets"
        )));
    }

    if label.starts_with('-') || label.ends_with('-') {
        return Err(AddressError::InvalidDomain(format!(
            "Label '{label}' cannot start or end with '-'"
        )));
    }

    if let Some(ch) = label
        .chars()
        .find(|ch| !ch.is_ascii_alphanumeric() && *ch != '-')
    {
        return Err(AddressError::InvalidDomain(format!(
            "Invalid character '{ch}' in domain"
        )));
    }

    Ok(())
}

impl Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Deref for Domain {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for Domain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Domain {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn normalises_case_and_trailing_dot() {
        let domain = Domain::parse("Example.COM.").unwrap();
        assert_eq!(domain.as_str(), "example.com");
        assert_eq!(domain, Domain::parse("example.com").unwrap());
    }

    #[test]
    fn rejects_bad_labels() {
        assert!(Domain::parse("").is_err());
        assert!(Domain::parse("a..b").is_err());
        assert!(Domain::parse("-a.com").is_err());
        assert!(Domain::parse("under_score.com").is_err());
        assert!(Domain::parse(&format!("{}.com", "a".repeat(64))).is_err());
    }

    #[test]
    fn deref_and_display() {
        let domain = Domain::parse("company.com").unwrap();
        assert!(domain.ends_with(".com"));
        assert_eq!(format!("{domain}"), "company.com");
    }
}
