//! Keys of the address map
//!
//! An alias is either a full mailbox (`sales@example.com`) or a domain
//! catch-all written `@example.com` or `*@example.com`.

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use crate::{
    address::{AddressError, Mailbox},
    domain::Domain,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Alias {
    Exact(Mailbox),
    CatchAll(Domain),
}

impl Alias {
    /// Parse an address-map key. Exact aliases are normalised to lowercase.
    ///
    /// # Errors
    ///
    /// Returns an [`AddressError`] when the key is neither a valid mailbox nor
    /// a valid catch-all.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let trimmed = input.trim();

        if let Some(domain) = trimmed
            .strip_prefix("*@")
            .or_else(|| trimmed.strip_prefix('@'))
        {
            return Domain::parse(domain).map(Self::CatchAll);
        }

        Mailbox::parse(trimmed).map(|mailbox| Self::Exact(mailbox.normalized()))
    }

    #[must_use]
    pub const fn domain(&self) -> &Domain {
        match self {
            Self::Exact(mailbox) => mailbox.domain(),
            Self::CatchAll(domain) => domain,
        }
    }

    #[must_use]
    pub const fn is_catch_all(&self) -> bool {
        matches!(self, Self::CatchAll(_))
    }
}

impl Display for Alias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(mailbox) => write!(f, "{mailbox}"),
            Self::CatchAll(domain) => write!(f, "@{domain}"),
        }
    }
}

impl FromStr for Alias {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
