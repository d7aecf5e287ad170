//! Error types for the SMTP client.

use std::io;

use ferry_common::{Classify, FailureClass};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse SMTP response: {0}")]
    ParseError(String),

    /// The server answered a command with a 4xx or 5xx reply.
    #[error("SMTP error: {code} - {message}")]
    SmtpError { code: u16, message: String },

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("UTF-8 error: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),
}

impl Classify for ClientError {
    fn class(&self) -> FailureClass {
        match self {
            Self::SmtpError { code, .. } => FailureClass::from_reply_code(*code),
            Self::Io(_) | Self::ConnectionClosed => FailureClass::Retryable,
            Self::ParseError(_) | Self::TlsError(_) | Self::Utf8Error(_) => FailureClass::Terminal,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
