use std::{path::Path, time::Duration};

use ferry_delivery::{BounceRule, NotificationConfig, RelayIdentity, RewriteConfig, TransportConfig};
use ferry_store::StoreConfig;
use serde::Deserialize;

use crate::{ConfigError, reload::AddressMapConfig};

/// Everything the relay needs, constructed once at start-up and passed to
/// each component.
///
/// ```ron
/// (
///     relay: (address: "forwarder@relay.example.net"),
///     store: File(path: "/var/lib/ferry"),
///     address_map: (source: File("/etc/ferry/aliases.json"), reload: Signal),
///     bounce_rules: [
///         (domain: "retired.example.com", sender: "mailer-daemon@relay.example.net"),
///     ],
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct FerryConfig {
    pub relay: RelayIdentity,
    #[serde(default)]
    pub store: StoreConfig,
    pub address_map: AddressMapConfig,
    #[serde(default)]
    pub bounce_rules: Vec<BounceRule>,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub rewrite: RewriteConfig,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub serve: ServeConfig,
}

/// Per-attempt bounds on blocking work, in seconds
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Timeouts {
    #[serde(default = "default_store_secs")]
    pub store_secs: u64,
    /// Immediate retries of a transient store read
    #[serde(default = "default_store_retries")]
    pub store_retries: u32,
    #[serde(default = "default_send_secs")]
    pub send_secs: u64,
    #[serde(default = "default_notify_secs")]
    pub notify_secs: u64,
    /// Deadline for a whole invocation, covering every stage and retry
    #[serde(default = "default_invocation_secs")]
    pub invocation_secs: u64,
}

const fn default_store_secs() -> u64 {
    5
}

const fn default_store_retries() -> u32 {
    1
}

const fn default_send_secs() -> u64 {
    30
}

const fn default_notify_secs() -> u64 {
    2
}

const fn default_invocation_secs() -> u64 {
    60
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            store_secs: default_store_secs(),
            store_retries: default_store_retries(),
            send_secs: default_send_secs(),
            notify_secs: default_notify_secs(),
            invocation_secs: default_invocation_secs(),
        }
    }
}

impl Timeouts {
    #[must_use]
    pub const fn store(&self) -> Duration {
        Duration::from_secs(self.store_secs)
    }

    #[must_use]
    pub const fn send(&self) -> Duration {
        Duration::from_secs(self.send_secs)
    }

    #[must_use]
    pub const fn notify(&self) -> Duration {
        Duration::from_secs(self.notify_secs)
    }

    #[must_use]
    pub const fn invocation(&self) -> Duration {
        Duration::from_secs(self.invocation_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServeConfig {
    /// Invocations processed at once in serve mode
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

const fn default_max_concurrency() -> usize {
    16
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl FerryConfig {
    /// Parse and validate a RON document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for syntax or type errors and
    /// [`ConfigError::Invalid`] for values that parse but cannot work.
    pub fn from_ron(document: &str) -> Result<Self, ConfigError> {
        let config: Self = ron::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate the file at `path`.
    ///
    /// # Errors
    ///
    /// As [`Self::from_ron`], plus [`ConfigError::Io`] if the file cannot be
    /// read.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let document = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_ron(&document)
    }

    /// Checks that need more than one field, or that serde cannot express.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: &str| Err(ConfigError::Invalid(message.to_string()));

        if self.timeouts.store_secs == 0
            || self.timeouts.send_secs == 0
            || self.timeouts.notify_secs == 0
            || self.timeouts.invocation_secs == 0
        {
            return invalid("timeouts must be at least one second");
        }

        if self.timeouts.invocation_secs < self.timeouts.store_secs {
            return invalid("timeouts.invocation_secs is shorter than a single store read");
        }

        if self.serve.max_concurrency == 0 {
            return invalid("serve.max_concurrency must be at least 1");
        }

        if self.rewrite.max_message_size == 0 {
            return invalid("rewrite.max_message_size must be greater than 0");
        }

        let marker = &self.rewrite.marker_header;
        if marker.is_empty() || !marker.bytes().all(|b| b.is_ascii_graphic() && b != b':') {
            return Err(ConfigError::Invalid(format!(
                "rewrite.marker_header '{marker}' is not a valid header name"
            )));
        }

        let format = &self.relay.display_format;
        if !format.contains("{name}") && !format.contains("{alias}") {
            return invalid("relay.display_format must use {name} or {alias}");
        }

        Ok(())
    }
}
