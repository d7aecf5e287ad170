use ferry_common::Mailbox;
use serde::Deserialize;

/// The identity outbound mail is sent as
///
/// ```ron
/// relay: (
///     address: "forwarder@relay.example.net",
///     display_format: "{name} via {alias}",
///     reporting_mta: "relay.example.net",
///     region: Some("eu-west-1"),
/// ),
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RelayIdentity {
    /// Envelope sender and `From` address of every relayed message
    pub address: Mailbox,

    /// Display name for the rewritten `From`. `{name}` is replaced with the
    /// original author's name (or address) and `{alias}` with the alias the
    /// message was sent to.
    #[serde(default = "default_display_format")]
    pub display_format: String,

    /// Host named in `Reporting-MTA` and bounce `Message-ID`s
    #[serde(default = "default_reporting_mta")]
    pub reporting_mta: String,

    /// Deployment region or locale label, carried in logs and reports only
    #[serde(default)]
    pub region: Option<String>,
}

fn default_display_format() -> String {
    "{name} via {alias}".to_string()
}

fn default_reporting_mta() -> String {
    "localhost".to_string()
}

impl RelayIdentity {
    #[must_use]
    pub fn new(address: Mailbox) -> Self {
        let reporting_mta = address.domain().to_string();
        Self {
            address,
            display_format: default_display_format(),
            reporting_mta,
            region: None,
        }
    }
}

/// How inbound messages are turned into outbound ones
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RewriteConfig {
    /// Prepended to `Subject` when set, e.g. `[fwd]`
    #[serde(default)]
    pub subject_prefix: Option<String>,

    /// Largest outbound message the transport accepts, in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Name of the header recording which alias a message was forwarded for
    #[serde(default = "default_marker_header")]
    pub marker_header: String,

    /// Header names (or `Prefix-*` families) allowed through in addition to
    /// the built-in list
    #[serde(default)]
    pub extra_allowed_headers: Vec<String>,
}

const fn default_max_message_size() -> usize {
    10 * 1024 * 1024
}

fn default_marker_header() -> String {
    "X-Ferry-Forwarded-For".to_string()
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            subject_prefix: None,
            max_message_size: default_max_message_size(),
            marker_header: default_marker_header(),
            extra_allowed_headers: Vec::new(),
        }
    }
}
