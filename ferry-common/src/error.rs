//! Failure classification shared by every stage of the relay.
//!
//! Each crate keeps its own error enum; they all collapse onto
//! [`FailureClass`] so the orchestrator can decide between "redeliver later"
//! and "drop and report" without knowing where the failure came from.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Whether redelivering the same invocation is expected to eventually succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Throttling, timeouts, temporary unavailability
    Retryable,
    /// Permanent rejection, malformed input, missing data
    Terminal,
}

impl FailureClass {
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Retryable)
    }

    /// Classify an SMTP-style reply code: 4xx is temporary, anything else
    /// that is not a success is permanent.
    #[must_use]
    pub const fn from_reply_code(code: u16) -> Self {
        if matches!(code, 400..=499) {
            Self::Retryable
        } else {
            Self::Terminal
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retryable => f.write_str("retryable"),
            Self::Terminal => f.write_str("terminal"),
        }
    }
}

/// Implemented by error types that can be mapped onto a [`FailureClass`]
pub trait Classify {
    fn class(&self) -> FailureClass;

    fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    fn is_terminal(&self) -> bool {
        !self.is_retryable()
    }
}
