use std::{io, path::PathBuf, time::Duration};

use ferry_common::{Classify, FailureClass, Mailbox};
use ferry_delivery::{BounceError, MapLoadError, NotifyError, RewriteError};
use ferry_store::StoreError;
use thiserror::Error;

/// The relay cannot start with this configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config from {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] ron::error::SpannedError),

    #[error(transparent)]
    AddressMap(#[from] MapLoadError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Notification(#[from] NotifyError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Why an invocation did not finish.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),

    /// Every accepted domain should have an alias or a bounce rule, so this
    /// is a provisioning mistake rather than a bounce.
    #[error("No alias or bounce rule for {0}")]
    Unresolvable(Mailbox),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Rewrite(#[from] RewriteError),

    #[error(transparent)]
    Bounce(#[from] BounceError),

    #[error("Relay to {destination} failed: {detail}")]
    Relay {
        destination: Mailbox,
        class: FailureClass,
        detail: String,
    },

    #[error("Invocation exceeded its {0:?} deadline")]
    Deadline(Duration),
}

impl PipelineError {
    /// Name of the stage that failed, for reports and logs
    #[must_use]
    pub const fn stage(&self) -> &'static str {
        match self {
            Self::InvalidTrigger(_) => "trigger",
            Self::Unresolvable(_) => "resolve",
            Self::Store(_) => "fetch",
            Self::Rewrite(_) => "rewrite",
            Self::Bounce(_) => "bounce",
            Self::Relay { .. } => "relay",
            Self::Deadline(_) => "deadline",
        }
    }

    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Unresolvable(_))
    }
}

impl Classify for PipelineError {
    fn class(&self) -> FailureClass {
        match self {
            Self::InvalidTrigger(_) | Self::Unresolvable(_) => FailureClass::Terminal,
            Self::Store(err) => err.class(),
            Self::Rewrite(err) => err.class(),
            Self::Bounce(err) => err.class(),
            Self::Relay { class, .. } => *class,
            Self::Deadline(_) => FailureClass::Retryable,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use ferry_store::StorageKey;

    use super::*;

    #[test]
    fn classification() {
        let key = StorageKey::parse("abc").unwrap();

        assert!(PipelineError::Store(StoreError::NotFound(key)).is_terminal());
        assert!(PipelineError::Store(StoreError::Transient("503".into())).is_retryable());
        assert!(PipelineError::Deadline(Duration::from_secs(1)).is_retryable());

        let unresolvable = PipelineError::Unresolvable(Mailbox::parse("x@nowhere.net").unwrap());
        assert!(unresolvable.is_terminal());
        assert!(unresolvable.is_configuration());
        assert_eq!(unresolvable.stage(), "resolve");
    }
}
