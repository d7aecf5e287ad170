use std::{path::PathBuf, sync::Arc, time::Duration};

use serde::Deserialize;

use crate::{FileStore, HttpStore, MemoryStore, MessageStore, Result, backends::DEFAULT_MAX_OBJECT_SIZE};

/// Where staged messages are read from
///
/// # Examples
///
/// ```ron
/// store: File(
///     path: "/var/lib/ferry",
///     prefix: "emails/",
/// ),
/// ```
///
/// ```ron
/// store: Http(
///     endpoint: "https://staging-bucket.example.net",
///     bearer_token: Some("..."),
/// ),
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub enum StoreConfig {
    File {
        path: PathBuf,
        #[serde(default = "default_prefix")]
        prefix: String,
    },
    Http {
        endpoint: String,
        #[serde(default = "default_prefix")]
        prefix: String,
        #[serde(default)]
        bearer_token: Option<String>,
        /// Largest object accepted from the endpoint, in bytes
        #[serde(default = "default_max_object_size")]
        max_object_size: u64,
    },
    /// Starts empty; only useful for tests and dry runs
    Memory,
}

fn default_prefix() -> String {
    "emails/".to_string()
}

const fn default_max_object_size() -> u64 {
    DEFAULT_MAX_OBJECT_SIZE
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::File {
            path: PathBuf::from("/var/lib/ferry"),
            prefix: default_prefix(),
        }
    }
}

impl StoreConfig {
    /// Construct the configured backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the prefix is invalid or an HTTP client cannot be
    /// built.
    pub fn build(&self, timeout: Duration) -> Result<Arc<dyn MessageStore>> {
        Ok(match self {
            Self::File { path, prefix } => Arc::new(FileStore::new(path.clone(), prefix.clone())?),
            Self::Http {
                endpoint,
                prefix,
                bearer_token,
                max_object_size,
            } => Arc::new(
                HttpStore::new(endpoint.clone(), prefix.clone(), bearer_token.clone(), timeout)?
                    .with_max_object_size(*max_object_size),
            ),
            Self::Memory => Arc::new(MemoryStore::new()),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn file_config_defaults_prefix() {
        let config: StoreConfig = ron::from_str(r#"File(path: "/srv/mail")"#).unwrap();
        assert_eq!(
            config,
            StoreConfig::File {
                path: PathBuf::from("/srv/mail"),
                prefix: "emails/".to_string(),
            }
        );
    }

    #[test]
    fn http_config() {
        let config: StoreConfig = ron::from_str(
            r#"Http(endpoint: "https://bucket.example.net", prefix: "in/", bearer_token: Some("t"))"#,
        )
        .unwrap();

        assert!(matches!(
            config,
            StoreConfig::Http { ref prefix, bearer_token: Some(_), max_object_size, .. }
                if prefix == "in/" && max_object_size == DEFAULT_MAX_OBJECT_SIZE
        ));
        assert!(config.build(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn memory_config() {
        let config: StoreConfig = ron::from_str("Memory").unwrap();
        let store = config.build(Duration::from_secs(1)).unwrap();
        assert!(store.describe().starts_with("memory"));
    }

    #[test]
    fn invalid_prefix_fails_build() {
        let config = StoreConfig::File {
            path: PathBuf::from("/srv"),
            prefix: "../x".to_string(),
        };
        assert!(config.build(Duration::from_secs(1)).is_err());
    }
}
