//! Alias resolution
//!
//! The map is built once from a JSON document of the form
//!
//! ```json
//! {
//!     "sales@example.com": ["ops@company.com", "archive@company.com"],
//!     "info@example.com": "ops@company.com",
//!     "@example.org": "catchall@company.com"
//! }
//! ```
//!
//! plus the statically configured bounce rules. A map is immutable once
//! built; reloading means building a new one and swapping it in.

use std::{collections::HashMap, fmt, sync::Arc};

use ferry_common::{Alias, Domain, Mailbox};
use serde::{
    Deserialize, Deserializer, Serialize,
    de::{MapAccess, Visitor},
};
use sha2::{Digest, Sha256};

use crate::{MapLoadError, bounce::BounceReason};

/// A bounce-only domain and how to bounce for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BounceRule {
    pub domain: Domain,
    /// Identity the bounce is sent as
    pub sender: Mailbox,
    #[serde(default)]
    pub reason: BounceReason,
}

/// Outcome of resolving a recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Relay to these destinations, in order
    Forward(Arc<[Mailbox]>),
    Bounce(BounceRule),
    /// No alias and no bounce rule: a provisioning mistake, not a bounce
    Unknown,
}

impl Resolution {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Forward(_) => "forward",
            Self::Bounce(_) => "bounce",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AddressMap {
    exact: HashMap<Mailbox, Arc<[Mailbox]>>,
    catch_all: HashMap<Domain, Arc<[Mailbox]>>,
    bounce: HashMap<Domain, BounceRule>,
    version: String,
}

/// One `"alias": destinations` entry, in document order
struct RawEntries(Vec<(String, Vec<String>)>);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDestinations {
    One(String),
    Many(Vec<String>),
}

impl<'de> Deserialize<'de> for RawEntries {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = RawEntries;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object mapping aliases to destination addresses")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or_default());

                while let Some((alias, destinations)) =
                    access.next_entry::<String, RawDestinations>()?
                {
                    let destinations = match destinations {
                        RawDestinations::One(one) => vec![one],
                        RawDestinations::Many(many) => many,
                    };
                    entries.push((alias, destinations));
                }

                Ok(RawEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

impl AddressMap {
    /// Build a map from an alias document and the bounce rules.
    ///
    /// Keys are kept in document order while validating so that a
    /// duplicate key (including one differing only in case) is reported
    /// instead of silently overwritten.
    ///
    /// # Errors
    ///
    /// Returns a [`MapLoadError`] for malformed JSON, invalid addresses,
    /// empty destination lists, duplicate aliases or rules, and domains that
    /// have both a catch-all and a bounce rule.
    pub fn from_json(document: &str, rules: &[BounceRule]) -> Result<Self, MapLoadError> {
        let RawEntries(entries) = serde_json::from_str(document)?;

        let mut map = Self::default();

        for (key, destinations) in entries {
            let alias = Alias::parse(&key).map_err(|source| MapLoadError::InvalidAlias {
                alias: key.clone(),
                source,
            })?;

            if destinations.is_empty() {
                return Err(MapLoadError::NoDestinations(key));
            }

            let destinations = destinations
                .iter()
                .map(|destination| {
                    Mailbox::parse(destination).map_err(|source| {
                        MapLoadError::InvalidDestination {
                            alias: key.clone(),
                            destination: destination.clone(),
                            source,
                        }
                    })
                })
                .collect::<Result<Arc<[Mailbox]>, _>>()?;

            let duplicate = match alias {
                Alias::Exact(mailbox) => map.exact.insert(mailbox, destinations).is_some(),
                Alias::CatchAll(domain) => map.catch_all.insert(domain, destinations).is_some(),
            };

            if duplicate {
                return Err(MapLoadError::DuplicateAlias(key));
            }
        }

        for rule in rules {
            if map.catch_all.contains_key(&rule.domain) {
                return Err(MapLoadError::ConflictingDomain(rule.domain.clone()));
            }

            if map
                .bounce
                .insert(rule.domain.clone(), rule.clone())
                .is_some()
            {
                return Err(MapLoadError::DuplicateBounceRule(rule.domain.clone()));
            }
        }

        map.version = fingerprint(document, rules);

        Ok(map)
    }

    /// Resolve a recipient: exact alias, then domain catch-all, then bounce
    /// rule, else [`Resolution::Unknown`].
    #[must_use]
    pub fn resolve(&self, recipient: &Mailbox) -> Resolution {
        let recipient = recipient.normalized();

        if let Some(destinations) = self.exact.get(&recipient) {
            return Resolution::Forward(Arc::clone(destinations));
        }

        if let Some(destinations) = self.catch_all.get(recipient.domain()) {
            return Resolution::Forward(Arc::clone(destinations));
        }

        self.bounce
            .get(recipient.domain())
            .map_or(Resolution::Unknown, |rule| Resolution::Bounce(rule.clone()))
    }

    /// Short content hash identifying this version of the map
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Number of aliases, counting catch-alls
    #[must_use]
    pub fn len(&self) -> usize {
        self.exact.len() + self.catch_all.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.bounce.is_empty()
    }

    #[must_use]
    pub fn bounce_rule_count(&self) -> usize {
        self.bounce.len()
    }

    /// Every domain that has either an alias or a bounce rule
    #[must_use]
    pub fn domains(&self) -> Vec<Domain> {
        let mut domains: Vec<Domain> = self
            .exact
            .keys()
            .map(|mailbox| mailbox.domain().clone())
            .chain(self.catch_all.keys().cloned())
            .chain(self.bounce.keys().cloned())
            .collect();

        domains.sort();
        domains.dedup();
        domains
    }
}

fn fingerprint(document: &str, rules: &[BounceRule]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document.as_bytes());
    for rule in rules {
        hasher.update(format!("\0{}\0{}\0{}", rule.domain, rule.sender, rule.reason).as_bytes());
    }

    hex::encode(&hasher.finalize()[..6])
}
