//! Bounce generation per RFC 3464
//!
//! A bounce is returned to the original sender whenever a recipient resolves
//! to a bounce-only domain.
//!
//! # Structure
//! ```text
//! multipart/report; report-type="delivery-status"
//! ├── Part 1: text/plain (human-readable explanation)
//! ├── Part 2: message/delivery-status (machine-readable status)
//! └── Part 3: text/rfc822-headers (original headers, when the message was fetched)
//! ```
//!
//! Everything that would normally vary between runs (`Message-ID`, MIME
//! boundary, `Date`) is derived from the storage key, recipient and arrival
//! time, so a redelivered trigger produces a byte-identical bounce that
//! downstream systems collapse by `Message-ID`.

use std::{fmt::Write as _, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use ferry_common::{Mailbox, internal};
use ferry_tracing::traced;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    BounceError,
    address_map::BounceRule,
    message::RawMessage,
    notify::{BounceEvent, Notifier},
};

/// The fixed set of bounce templates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BounceReason {
    #[default]
    #[serde(alias = "MailboxDoesNotExist")]
    MailboxDoesNotExist,
    #[serde(alias = "MessageTooLarge")]
    MessageTooLarge,
    #[serde(alias = "MailboxFull")]
    MailboxFull,
    #[serde(alias = "MessageContentRejected")]
    MessageContentRejected,
    #[serde(alias = "TemporaryFailure")]
    TemporaryFailure,
}

impl BounceReason {
    /// SMTP reply code reported in `Diagnostic-Code`
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::MailboxDoesNotExist => 550,
            Self::MessageTooLarge | Self::MailboxFull => 552,
            Self::MessageContentRejected => 500,
            Self::TemporaryFailure => 450,
        }
    }

    /// RFC 3463 enhanced status code
    #[must_use]
    pub const fn status(self) -> &'static str {
        match self {
            Self::MailboxDoesNotExist => "5.1.1",
            Self::MessageTooLarge => "5.3.4",
            Self::MailboxFull => "5.2.2",
            Self::MessageContentRejected => "5.3.0",
            Self::TemporaryFailure => "4.0.0",
        }
    }

    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::MailboxDoesNotExist => "The email account that you tried to reach does not exist",
            Self::MessageTooLarge => "The message exceeds the maximum size the recipient accepts",
            Self::MailboxFull => "The recipient's mailbox is full and cannot accept messages",
            Self::MessageContentRejected => "The message content was rejected by the recipient",
            Self::TemporaryFailure => "The recipient is temporarily unable to accept messages",
        }
    }

    /// RFC 3464 `Action` field
    #[must_use]
    pub const fn action(self) -> &'static str {
        match self {
            Self::TemporaryFailure => "delayed",
            _ => "failed",
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MailboxDoesNotExist => "MAILBOX_DOES_NOT_EXIST",
            Self::MessageTooLarge => "MESSAGE_TOO_LARGE",
            Self::MailboxFull => "MAILBOX_FULL",
            Self::MessageContentRejected => "MESSAGE_CONTENT_REJECTED",
            Self::TemporaryFailure => "TEMPORARY_FAILURE",
        }
    }
}

impl std::fmt::Display for BounceReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why no bounce is sent for a message that would otherwise get one
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Suppression {
    /// `MAIL FROM:<>`: bouncing a bounce would loop
    NullSender,
    /// The message is itself automated (`Auto-Submitted` other than `no`)
    AutoSubmitted(String),
}

impl std::fmt::Display for Suppression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NullSender => f.write_str("null envelope sender"),
            Self::AutoSubmitted(value) => write!(f, "Auto-Submitted: {value}"),
        }
    }
}

/// Decide whether a bounce must be withheld (RFC 3834 section 2)
#[must_use]
pub fn suppression(sender: Option<&Mailbox>, auto_submitted: Option<&str>) -> Option<Suppression> {
    if sender.is_none() {
        return Some(Suppression::NullSender);
    }

    auto_submitted
        .map(str::trim)
        .filter(|value| !value.is_empty() && !value.eq_ignore_ascii_case("no"))
        .map(|value| Suppression::AutoSubmitted(value.to_string()))
}

/// What is known about the message being bounced
#[derive(Debug, Clone)]
pub struct BounceRequest<'a> {
    pub storage_key: &'a str,
    pub original_recipient: &'a Mailbox,
    /// Envelope sender of the original message; the bounce goes here
    pub return_path: Option<&'a Mailbox>,
    /// When the original arrived, if known. Unknown arrival times leave the
    /// bounce identity to `(storage_key, recipient)` alone.
    pub received_at: Option<DateTime<Utc>>,
    /// Header block of the original message, if it was fetched
    pub original_headers: Option<&'a [u8]>,
}

/// A composed bounce, ready to be sent with a null envelope sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BounceMessage {
    pub to: Mailbox,
    pub from: Mailbox,
    pub message_id: String,
    pub reason: BounceReason,
    pub data: Arc<[u8]>,
}

#[derive(Debug, Clone)]
pub struct BounceGenerator {
    reporting_mta: String,
    notifier: Arc<dyn Notifier>,
    notify_timeout: Duration,
}

impl BounceGenerator {
    #[must_use]
    pub fn new(
        reporting_mta: impl Into<String>,
        notifier: Arc<dyn Notifier>,
        notify_timeout: Duration,
    ) -> Self {
        Self {
            reporting_mta: reporting_mta.into(),
            notifier,
            notify_timeout,
        }
    }

    /// Compose the bounce and publish a notification for it.
    ///
    /// The notification is best-effort: a failure or timeout is logged and
    /// never fails the bounce.
    ///
    /// # Errors
    ///
    /// See [`Self::compose`].
    #[traced(instrument(level = "debug", skip_all, fields(recipient = %request.original_recipient, reason = %rule.reason)), timing(precision = "ms"))]
    pub async fn generate(
        &self,
        rule: &BounceRule,
        request: &BounceRequest<'_>,
    ) -> Result<BounceMessage, BounceError> {
        let bounce = self.compose(rule, request)?;

        let event = BounceEvent {
            original_recipient: request.original_recipient.clone(),
            reason: bounce.reason,
            bounce_sender: bounce.from.clone(),
            returned_to: bounce.to.clone(),
            storage_key: request.storage_key.to_string(),
            message_id: bounce.message_id.clone(),
            occurred_at: Utc::now(),
        };

        match tokio::time::timeout(self.notify_timeout, self.notifier.notify(&event)).await {
            Ok(Ok(())) => {
                internal!(level = DEBUG, notifier = %self.notifier.describe(), "Bounce notification sent");
            }
            Ok(Err(err)) => {
                internal!(
                    level = WARN,
                    notifier = %self.notifier.describe(),
                    error = %err,
                    "Bounce notification failed"
                );
            }
            Err(_) => {
                internal!(
                    level = WARN,
                    notifier = %self.notifier.describe(),
                    timeout = ?self.notify_timeout,
                    "Bounce notification timed out"
                );
            }
        }

        Ok(bounce)
    }

    /// Build the bounce message without side effects.
    ///
    /// # Errors
    ///
    /// [`BounceError::NoSender`] when there is no return path, and
    /// [`BounceError::Configuration`] when the reporting MTA is not a usable
    /// host name.
    pub fn compose(
        &self,
        rule: &BounceRule,
        request: &BounceRequest<'_>,
    ) -> Result<BounceMessage, BounceError> {
        let to = request.return_path.ok_or(BounceError::NoSender)?;

        if self.reporting_mta.is_empty()
            || self
                .reporting_mta
                .chars()
                .any(|c| c.is_whitespace() || c == '@' || c == '>')
        {
            return Err(BounceError::Configuration(format!(
                "invalid reporting MTA '{}'",
                self.reporting_mta
            )));
        }

        let seed = seed(request);
        let message_id = format!("<{}@{}>", &seed[..32], self.reporting_mta);
        let boundary = format!("=_ferry_{}", &seed[32..]);
        let reason = rule.reason;

        let human_readable = human_readable_part(&self.reporting_mta, request, reason);
        let machine_readable = machine_readable_part(&self.reporting_mta, request, reason);

        let subject = if reason.action() == "delayed" {
            "Delivery Status Notification (Delay)"
        } else {
            "Delivery Status Notification (Failure)"
        };

        let mut data = format!(
            "From: Mail Delivery System <{from}>\r\n\
            To: <{to}>\r\n\
            Subject: {subject}\r\n\
            Date: {date}\r\n\
            Message-ID: {message_id}\r\n",
            from = rule.sender,
            date = request.received_at.unwrap_or_else(Utc::now).to_rfc2822(),
        );

        if let Some(original_id) = request.original_headers.and_then(original_message_id) {
            let _ = write!(data, "In-Reply-To: {original_id}\r\nReferences: {original_id}\r\n");
        }

        let _ = write!(
            data,
            "Auto-Submitted: auto-replied\r\n\
            MIME-Version: 1.0\r\n\
            Content-Type: multipart/report; report-type=\"delivery-status\"; boundary=\"{boundary}\"\r\n\
            \r\n\
            This is a multi-part message in MIME format.\r\n\
            \r\n\
            --{boundary}\r\n\
            Content-Type: text/plain; charset=utf-8\r\n\
            Content-Transfer-Encoding: 7bit\r\n\
            \r\n\
            {human_readable}\r\n\
            --{boundary}\r\n\
            Content-Type: message/delivery-status\r\n\
            Content-Transfer-Encoding: 7bit\r\n\
            \r\n\
            {machine_readable}\r\n"
        );

        let mut data = data.into_bytes();

        if let Some(headers) = request.original_headers {
            data.extend_from_slice(
                format!(
                    "--{boundary}\r\n\
                    Content-Type: text/rfc822-headers\r\n\
                    Content-Transfer-Encoding: 7bit\r\n\
                    \r\n"
                )
                .as_bytes(),
            );
            data.extend_from_slice(headers);
            if !headers.ends_with(b"\n") {
                data.extend_from_slice(b"\r\n");
            }
            data.extend_from_slice(b"\r\n");
        }

        data.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

        Ok(BounceMessage {
            to: to.clone(),
            from: rule.sender.clone(),
            message_id,
            reason,
            data: Arc::from(data),
        })
    }
}

/// `sha256(storage_key \0 recipient [\0 received_at])` as hex
fn seed(request: &BounceRequest<'_>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.storage_key.as_bytes());
    hasher.update([0]);
    hasher.update(request.original_recipient.normalized().to_string().as_bytes());
    if let Some(received_at) = request.received_at {
        hasher.update([0]);
        hasher.update(received_at.to_rfc3339().as_bytes());
    }

    hex::encode(hasher.finalize())
}

fn original_message_id(headers: &[u8]) -> Option<String> {
    RawMessage::split(headers)
        .ok()?
        .header("Message-ID")
        .map(|field| field.value())
        .filter(|id| id.starts_with('<') && id.ends_with('>'))
}

fn human_readable_part(
    reporting_mta: &str,
    request: &BounceRequest<'_>,
    reason: BounceReason,
) -> String {
    format!(
        "This is the mail system at host {reporting_mta}.\r\n\
        \r\n\
        I'm sorry to have to inform you that your message could not\r\n\
        be delivered to the recipient below.\r\n\
        \r\n\
        <{recipient}>: {code} {status} {description}\r\n",
        recipient = request.original_recipient,
        code = reason.code(),
        status = reason.status(),
        description = reason.description(),
    )
}

fn machine_readable_part(
    reporting_mta: &str,
    request: &BounceRequest<'_>,
    reason: BounceReason,
) -> String {
    let mut dsn = format!("Reporting-MTA: dns; {reporting_mta}\r\n");
    if let Some(received_at) = request.received_at {
        let _ = write!(dsn, "Arrival-Date: {}\r\n", received_at.to_rfc2822());
    }

    dsn.push_str("\r\n");

    let _ = write!(dsn, "Final-Recipient: rfc822; {}\r\n", request.original_recipient);
    let _ = write!(dsn, "Action: {}\r\n", reason.action());
    let _ = write!(dsn, "Status: {}\r\n", reason.status());
    let _ = write!(
        dsn,
        "Diagnostic-Code: smtp; {} {} {}\r\n",
        reason.code(),
        reason.status(),
        reason.description()
    );

    dsn
}
