//! Typed errors for resolution, rewriting, relaying and bounces.
//!
//! Every error that can end a pipeline stage implements
//! [`ferry_common::Classify`], so the orchestrator can tell "redeliver later"
//! from "drop and report" without matching on variants.

use ferry_common::{AddressError, Classify, Domain, FailureClass};
use ferry_smtp::ClientError;
use thiserror::Error;

/// The address map could not be built. Nothing is loaded when this occurs.
#[derive(Debug, Error)]
pub enum MapLoadError {
    #[error("Address map is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Could not read address map from {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid alias '{alias}': {source}")]
    InvalidAlias {
        alias: String,
        #[source]
        source: AddressError,
    },

    #[error("Invalid destination '{destination}' for alias '{alias}': {source}")]
    InvalidDestination {
        alias: String,
        destination: String,
        #[source]
        source: AddressError,
    },

    #[error("Alias '{0}' has no destinations")]
    NoDestinations(String),

    #[error("Alias '{0}' is defined more than once")]
    DuplicateAlias(String),

    #[error("More than one bounce rule for domain {0}")]
    DuplicateBounceRule(Domain),

    /// A domain may forward everything or bounce, not both.
    #[error("Domain {0} has both a catch-all alias and a bounce rule")]
    ConflictingDomain(Domain),
}

/// The staged message cannot be turned into an outbound message.
///
/// All variants are terminal: retrying with the same bytes gives the same
/// answer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RewriteError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Message is {size} bytes, exceeding the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("Message was already forwarded for {alias}")]
    LoopDetected { alias: String },

    #[error("No destinations to forward to")]
    NoDestinations,
}

impl Classify for RewriteError {
    fn class(&self) -> FailureClass {
        FailureClass::Terminal
    }
}

/// A transport could not hand a message over.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The remote answered with a 4xx reply.
    #[error("Temporary rejection: {code} {message}")]
    Temporary { code: u16, message: String },

    /// The remote answered with a 5xx reply.
    #[error("Permanent rejection: {code} {message}")]
    Permanent { code: u16, message: String },

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("TLS required: {0}")]
    TlsRequired(String),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Build from an SMTP reply code: 4xx temporary, everything else permanent.
    #[must_use]
    pub fn from_reply(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match FailureClass::from_reply_code(code) {
            FailureClass::Retryable => Self::Temporary { code, message },
            FailureClass::Terminal => Self::Permanent { code, message },
        }
    }

    /// The SMTP reply code behind this error, if there was one
    #[must_use]
    pub const fn reply_code(&self) -> Option<u16> {
        match self {
            Self::Temporary { code, .. } | Self::Permanent { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl Classify for TransportError {
    fn class(&self) -> FailureClass {
        match self {
            Self::Temporary { .. } | Self::Connection(_) | Self::Timeout(_) | Self::Tls(_) => {
                FailureClass::Retryable
            }
            Self::Permanent { .. } | Self::TlsRequired(_) | Self::Protocol(_) => {
                FailureClass::Terminal
            }
        }
    }
}

/// Map SMTP client failures onto transport failures:
///
/// - **4xx replies** → temporary
/// - **5xx replies** → permanent
/// - **Connection/I/O errors** → connection (retryable)
/// - **TLS errors** → TLS handshake (retryable)
/// - **Parse errors** → protocol (terminal)
impl From<ClientError> for TransportError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::SmtpError { code, message } => Self::from_reply(code, message),
            ClientError::Io(e) => Self::Connection(format!("I/O error: {e}")),
            ClientError::ConnectionClosed => {
                Self::Connection("Connection closed unexpectedly".to_string())
            }
            ClientError::TlsError(msg) => Self::Tls(msg),
            ClientError::ParseError(msg) => {
                Self::Protocol(format!("SMTP protocol parse error: {msg}"))
            }
            ClientError::Utf8Error(e) => Self::Protocol(format!("UTF-8 decoding error: {e}")),
        }
    }
}

#[derive(Debug, Error)]
pub enum BounceError {
    #[error("No sender to return a bounce to")]
    NoSender,

    #[error("Invalid bounce configuration: {0}")]
    Configuration(String),
}

impl Classify for BounceError {
    fn class(&self) -> FailureClass {
        FailureClass::Terminal
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Notification request failed: {0}")]
    Request(String),

    #[error("Notification endpoint responded {0}")]
    Status(u16),

    #[error("Notification timed out")]
    Timeout,

    #[error("No notification subscribers")]
    Closed,
}

#[cfg(test)]
mod tests {
    use std::io;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn client_error_conversion_4xx() {
        let err: TransportError = ClientError::SmtpError {
            code: 421,
            message: "Service not available".to_string(),
        }
        .into();

        assert!(err.is_retryable());
        assert_eq!(err.reply_code(), Some(421));
    }

    #[test]
    fn client_error_conversion_5xx() {
        let err: TransportError = ClientError::SmtpError {
            code: 550,
            message: "No such user".to_string(),
        }
        .into();

        assert!(err.is_terminal());
        assert_eq!(err.to_string(), "Permanent rejection: 550 No such user");
    }

    #[test]
    fn client_error_conversion_network() {
        let err: TransportError = ClientError::Io(io::Error::from(io::ErrorKind::ConnectionRefused)).into();
        assert!(err.is_retryable());

        let err: TransportError = ClientError::ConnectionClosed.into();
        assert!(err.is_retryable());

        let err: TransportError = ClientError::ParseError("junk".to_string()).into();
        assert!(err.is_terminal());
    }

    #[test]
    fn rewrite_errors_are_terminal() {
        assert!(RewriteError::Malformed("x".into()).is_terminal());
        assert!(
            RewriteError::LoopDetected {
                alias: "a@b.c".into()
            }
            .is_terminal()
        );
    }
}
