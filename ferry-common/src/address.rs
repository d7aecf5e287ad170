//! Mailbox parsing for aliases, destinations and envelope addresses
//!
//! Addresses reach the relay from three places: the address-map document,
//! the inbound trigger and the relay configuration. All of them are plain
//! `local-part@domain` strings, optionally wrapped in angle brackets, and are
//! validated against the RFC 5321 mailbox grammar:
//!
//! ```text
//! Mailbox        = Local-part "@" Domain
//! Local-part     = Dot-string / Quoted-string
//! Dot-string     = Atom *("." Atom)
//! Domain         = sub-domain *("." sub-domain)
//! sub-domain     = Let-dig [Ldh-str]
//! ```
//!
//! Address literals (`user@[192.0.2.1]`) are rejected: a forwarding target or
//! alias is always a named domain.

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Domain;

/// Maximum length of a path including brackets (RFC 5321 4.5.3.1.3)
pub const MAX_PATH_LENGTH: usize = 256;
/// Maximum length of the local part (RFC 5321 4.5.3.1.1)
pub const MAX_LOCAL_PART_LENGTH: usize = 64;
/// Maximum length of the domain (RFC 5321 4.5.3.1.2)
pub const MAX_DOMAIN_LENGTH: usize = 255;

/// Errors that can occur during address parsing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Empty address")]
    Empty,

    #[error("Address exceeds {MAX_PATH_LENGTH} octets")]
    PathTooLong,

    #[error("Local-part exceeds {MAX_LOCAL_PART_LENGTH} octets")]
    LocalPartTooLong,

    #[error("Domain exceeds {MAX_DOMAIN_LENGTH} octets")]
    DomainTooLong,

    #[error("Unbalanced angle brackets in '{0}'")]
    UnbalancedBrackets(String),

    #[error("Missing '@' separator in mailbox")]
    MissingAtSign,

    #[error("Invalid local-part: {0}")]
    InvalidLocalPart(String),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Invalid quoted string: {0}")]
    InvalidQuotedString(String),
}

pub type Result<T> = std::result::Result<T, AddressError>;

/// A validated mailbox (`local-part@domain`)
///
/// The domain is always stored lowercase. The local part keeps its original
/// case; use [`Mailbox::normalized`] for lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Mailbox {
    local_part: String,
    domain: Domain,
}

impl Mailbox {
    /// Parse a mailbox, accepting either `user@example.com` or
    /// `<user@example.com>`.
    ///
    /// # Errors
    ///
    /// Returns an [`AddressError`] if the input is not a valid RFC 5321 mailbox.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();

        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }

        if trimmed.len() > MAX_PATH_LENGTH {
            return Err(AddressError::PathTooLong);
        }

        let bare = strip_brackets(trimmed)?;
        if bare.is_empty() {
            return Err(AddressError::Empty);
        }

        let at = find_unquoted_at(bare)?;
        let (local, domain) = (&bare[..at], &bare[at + 1..]);

        if local.len() > MAX_LOCAL_PART_LENGTH {
            return Err(AddressError::LocalPartTooLong);
        }
        if domain.len() > MAX_DOMAIN_LENGTH {
            return Err(AddressError::DomainTooLong);
        }

        validate_local_part(local)?;
        let domain = Domain::parse(domain)?;

        Ok(Self {
            local_part: local.to_string(),
            domain,
        })
    }

    #[must_use]
    pub fn local_part(&self) -> &str {
        &self.local_part
    }

    #[must_use]
    pub const fn domain(&self) -> &Domain {
        &self.domain
    }

    /// The lookup form of this mailbox: lowercase local part and domain.
    #[must_use]
    pub fn normalized(&self) -> Self {
        Self {
            local_part: self.local_part.to_ascii_lowercase(),
            domain: self.domain.clone(),
        }
    }
}

impl Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local_part, self.domain)
    }
}

impl FromStr for Mailbox {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Mailbox {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Mailbox {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Parse an envelope sender, where `<>` (or an empty string) is the null
/// sender used by bounces and other automated mail.
///
/// # Errors
///
/// Returns an [`AddressError`] if the input is neither null nor a valid mailbox.
pub fn parse_reverse_path(input: &str) -> Result<Option<Mailbox>> {
    let trimmed = input.trim();
    if trimmed.is_empty() || trimmed == "<>" {
        return Ok(None);
    }

    Mailbox::parse(trimmed).map(Some)
}

fn strip_brackets(input: &str) -> Result<&str> {
    match (input.starts_with('<'), input.ends_with('>')) {
        (true, true) if input.len() >= 2 => Ok(&input[1..input.len() - 1]),
        (false, false) => Ok(input),
        _ => Err(AddressError::UnbalancedBrackets(input.to_string())),
    }
}

/// Find the position of the '@' that is not inside a quoted local part
fn find_unquoted_at(input: &str) -> Result<usize> {
    let mut in_quotes = false;
    let mut escaped = false;

    for (i, ch) in input.char_indices() {
        match ch {
            '\\' if in_quotes && !escaped => {
                escaped = true;
                continue;
            }
            '"' if !escaped => in_quotes = !in_quotes,
            '@' if !in_quotes => return Ok(i),
            _ => {}
        }
        escaped = false;
    }

    Err(AddressError::MissingAtSign)
}

fn validate_local_part(input: &str) -> Result<()> {
    if input.is_empty() {
        return Err(AddressError::InvalidLocalPart(
            "Empty local-part".to_string(),
        ));
    }

    if input.starts_with('"') {
        validate_quoted_string(input)
    } else {
        validate_dot_string(input)
    }
}

fn validate_dot_string(input: &str) -> Result<()> {
    if input.starts_with('.') || input.ends_with('.') {
        return Err(AddressError::InvalidLocalPart(
            "Dot-string cannot start or end with '.'".to_string(),
        ));
    }

    for atom in input.split('.') {
        if atom.is_empty() {
            return Err(AddressError::InvalidLocalPart(
                "Dot-string cannot contain consecutive dots".to_string(),
            ));
        }

        if let Some(ch) = atom.chars().find(|ch| !is_atext(*ch)) {
            return Err(AddressError::InvalidLocalPart(format!(
                "Invalid character '{ch}' in atom"
            )));
        }
    }

    Ok(())
}

fn validate_quoted_string(input: &str) -> Result<()> {
    if input.len() < 2 || !input.ends_with('"') {
        return Err(AddressError::InvalidQuotedString(
            "Unclosed quoted string".to_string(),
        ));
    }

    let mut chars = input[1..input.len() - 1].chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some(next) if next.is_ascii_graphic() || next == ' ' => {}
                Some(next) => {
                    return Err(AddressError::InvalidQuotedString(format!(
                        "Invalid quoted-pair: \\{next}"
                    )));
                }
                None => {
                    return Err(AddressError::InvalidQuotedString(
                        "Backslash at end of quoted string".to_string(),
                    ));
                }
            }
        } else if !is_qtext_smtp(ch) {
            return Err(AddressError::InvalidQuotedString(format!(
                "Invalid character '{ch}' in quoted string"
            )));
        }
    }

    Ok(())
}

/// atext = ALPHA / DIGIT / "!" / "#" / "$" / "%" / "&" / "'" / "*" / "+" /
///         "-" / "/" / "=" / "?" / "^" / "_" / "`" / "{" / "|" / "}" / "~"
const fn is_atext(ch: char) -> bool {
    ch.is_ascii_alphanumeric()
        || matches!(
            ch,
            '!' | '#'
                | '$'
                | '%'
                | '&'
                | '\''
                | '*'
                | '+'
                | '-'
                | '/'
                | '='
                | '?'
                | '^'
                | '_'
                | '`'
                | '{'
                | '|'
                | '}'
                | '~'
        )
}

/// qtextSMTP = %d32-33 / %d35-91 / %d93-126
const fn is_qtext_smtp(ch: char) -> bool {
    matches!(ch as u32, 32..=33 | 35..=91 | 93..=126)
}
