//! Error types for the ferry-store crate.

use std::{io, time::Duration};

use ferry_common::{Classify, FailureClass};
use thiserror::Error;

use crate::StorageKey;

#[derive(Debug, Error)]
pub enum StoreError {
    /// No object under this key, e.g. a delayed redelivery racing expiry.
    #[error("Message not found: {0}")]
    NotFound(StorageKey),

    /// Connectivity problems, throttling, or a server-side fault.
    #[error("Transient store error: {0}")]
    Transient(String),

    /// The store answered, but refused the request outright.
    #[error("Store rejected request for {key} with status {status}")]
    Rejected { key: StorageKey, status: u16 },

    /// The object is bigger than the store is allowed to hand back.
    #[error("Message {key} exceeds the {limit} byte limit")]
    TooLarge { key: StorageKey, limit: u64 },

    #[error("Store read timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid storage key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Invalid storage prefix '{prefix}': {reason}")]
    InvalidPrefix { prefix: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Store misconfigured: {0}")]
    Configuration(String),
}

impl StoreError {
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Map a filesystem error for `key`, separating absence from faults.
    pub(crate) fn from_io(key: &StorageKey, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(key.clone()),
            _ => Self::Io(err),
        }
    }
}

impl Classify for StoreError {
    fn class(&self) -> FailureClass {
        match self {
            Self::Transient(_) | Self::Timeout(_) | Self::Io(_) => FailureClass::Retryable,
            Self::NotFound(_)
            | Self::Rejected { .. }
            | Self::TooLarge { .. }
            | Self::InvalidKey { .. }
            | Self::InvalidPrefix { .. }
            | Self::Configuration(_) => FailureClass::Terminal,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn io_not_found_becomes_not_found() {
        let key = StorageKey::parse("abc").unwrap();
        let err = StoreError::from_io(&key, io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(err.is_not_found());
        assert!(err.is_terminal());
    }

    #[test]
    fn other_io_is_retryable() {
        let key = StorageKey::parse("abc").unwrap();
        let err = StoreError::from_io(
            &key,
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(!err.is_not_found());
        assert!(err.is_retryable());
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn classification() {
        assert!(StoreError::Transient("throttled".into()).is_retryable());
        assert!(StoreError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(
            StoreError::Rejected {
                key: StorageKey::parse("abc").unwrap(),
                status: 403
            }
            .is_terminal()
        );
    }
}
