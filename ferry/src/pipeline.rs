//! Per-message orchestration
//!
//! ```text
//! RECEIVED -> RESOLVED -> FETCHED -> REWRITTEN -> SENT -> DONE
//!                     \-> [FETCHED ->] BOUNCED ----------> DONE
//! any step -> FAILED
//! ```
//!
//! Every invocation is isolated: it takes a snapshot of the address map,
//! reads the staged message, and reports. Nothing is remembered between
//! invocations, so a redelivered trigger is processed exactly like the first
//! one and at worst causes one more relay attempt.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use ferry_common::{Classify, FailureClass, Mailbox, incoming, internal, parse_reverse_path};
use ferry_delivery::{
    BounceGenerator, BounceReason, BounceRequest, BounceRule, OutboundMessage, RelayOutcome,
    RelaySender, RelayStatus, Resolution, RewriteError, Rewriter,
    bounce::suppression,
    message::RawMessage,
};
use ferry_store::{MessageStore, RetryingStore, StorageKey};
use ferry_tracing::traced;
use serde::{Deserialize, Serialize};

use crate::{ConfigError, FerryConfig, PipelineError, reload::AddressMapHandle};

/// One invocation request: a message was staged for `recipient`.
///
/// `sender` and `received_at` are optional envelope details from the
/// receiving layer. When a bounce is needed and `sender` is present, the
/// staged message is not read at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub recipient: String,
    pub storage_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
}

impl Trigger {
    #[must_use]
    pub fn new(recipient: impl Into<String>, storage_key: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            storage_key: storage_key.into(),
            sender: None,
            received_at: None,
        }
    }

    #[must_use]
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    #[must_use]
    pub const fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = Some(received_at);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Received,
    Resolved,
    Fetched,
    Rewritten,
    Sent,
    Bounced,
    Done,
    Failed,
}

/// What the invoking layer should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Disposition {
    /// Finished; individual destinations may still have failed terminally
    Done,
    /// Redeliver the trigger later
    Retryable,
    /// Terminal failure; logged and dropped
    Dropped,
    /// No alias or bounce rule covers the recipient
    ConfigurationError,
}

impl Disposition {
    /// `sysexits.h` code for the one-shot binary
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Done => 0,
            Self::Retryable => 75,
            Self::Dropped => 65,
            Self::ConfigurationError => 78,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BounceSummary {
    pub to: Mailbox,
    pub from: Mailbox,
    pub message_id: String,
    pub reason: BounceReason,
    pub status: RelayStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub stage: &'static str,
    pub class: FailureClass,
    pub error: String,
}

/// Structured result of one invocation, written as one JSON line in serve
/// mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    pub recipient: String,
    pub storage_key: String,
    pub disposition: Disposition,
    pub trace: Vec<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map_version: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub outcomes: Vec<RelayOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounce: Option<BounceSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suppressed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
}

impl Report {
    fn received(trigger: &Trigger) -> Self {
        Self {
            recipient: trigger.recipient.clone(),
            storage_key: trigger.storage_key.clone(),
            disposition: Disposition::Dropped,
            trace: vec![Stage::Received],
            resolution: None,
            map_version: None,
            outcomes: Vec::new(),
            bounce: None,
            suppressed: None,
            failure: None,
        }
    }

    /// A report for input that never became a trigger, e.g. a malformed line
    /// in serve mode.
    #[must_use]
    pub fn rejected(input: &str, error: &PipelineError) -> Self {
        let mut report = Self::received(&Trigger::new("", ""));
        report.fail(error);
        internal!(level = WARN, input = input, error = %error, "Rejected trigger");
        report
    }

    fn advance(&mut self, stage: Stage) {
        self.trace.push(stage);
    }

    fn fail(&mut self, error: &PipelineError) {
        self.disposition = if error.is_configuration() {
            Disposition::ConfigurationError
        } else if error.is_retryable() {
            Disposition::Retryable
        } else {
            Disposition::Dropped
        };
        self.advance(Stage::Failed);
        self.failure = Some(Failure {
            stage: error.stage(),
            class: error.class(),
            error: error.to_string(),
        });
    }

    #[must_use]
    pub fn last_stage(&self) -> Stage {
        self.trace.last().copied().unwrap_or(Stage::Received)
    }

    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        self.disposition.exit_code()
    }
}

/// Envelope details recovered from the staged message's headers
struct Original {
    return_path: Option<Mailbox>,
    auto_submitted: Option<String>,
    date: Option<DateTime<Utc>>,
    headers: Vec<u8>,
}

impl Original {
    /// `Return-Path` when present (and `<>` means the null sender), else the
    /// first `From` mailbox.
    fn read(raw: &[u8]) -> Result<Self, RewriteError> {
        let message = RawMessage::split(raw)?;

        let return_path = match message
            .header("Return-Path")
            .map(|field| parse_reverse_path(&field.value()))
        {
            Some(Ok(path)) => path,
            _ => message
                .header("From")
                .and_then(|field| first_address(&field.value())),
        };

        Ok(Self {
            return_path,
            auto_submitted: message.header("Auto-Submitted").map(|field| field.value()),
            date: message
                .header("Date")
                .and_then(|field| mailparse::dateparse(&field.value()).ok())
                .and_then(|timestamp| DateTime::from_timestamp(timestamp, 0)),
            headers: message.header_bytes(),
        })
    }
}

fn first_address(value: &str) -> Option<Mailbox> {
    let addresses = mailparse::addrparse(value).ok()?;

    addresses.iter().find_map(|address| match address {
        mailparse::MailAddr::Single(info) => Mailbox::parse(&info.addr).ok(),
        mailparse::MailAddr::Group(group) => group
            .addrs
            .first()
            .and_then(|info| Mailbox::parse(&info.addr).ok()),
    })
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    address_map: AddressMapHandle,
    store: Arc<dyn MessageStore>,
    rewriter: Rewriter,
    sender: RelaySender,
    bounces: BounceGenerator,
    invocation_timeout: Duration,
}

impl Pipeline {
    #[must_use]
    pub fn new(
        address_map: AddressMapHandle,
        store: Arc<dyn MessageStore>,
        rewriter: Rewriter,
        sender: RelaySender,
        bounces: BounceGenerator,
    ) -> Self {
        Self {
            address_map,
            store,
            rewriter,
            sender,
            bounces,
            invocation_timeout: Duration::from_secs(60),
        }
    }

    /// Bound the whole invocation; running over is a retryable failure.
    #[must_use]
    pub const fn with_invocation_timeout(mut self, timeout: Duration) -> Self {
        self.invocation_timeout = timeout;
        self
    }

    /// Build every component from `config`.
    ///
    /// # Errors
    ///
    /// Fails if the address map cannot be loaded, or the store or notifier
    /// cannot be constructed.
    pub fn from_config(config: &FerryConfig) -> Result<Self, ConfigError> {
        let address_map =
            AddressMapHandle::load(config.address_map.clone(), config.bounce_rules.clone())?;

        let store = config.store.build(config.timeouts.store())?;
        let store: Arc<dyn MessageStore> = Arc::new(RetryingStore::new(
            store,
            config.timeouts.store_retries,
            config.timeouts.store(),
        ));

        let notifier = config.notification.build(config.timeouts.notify())?;

        Ok(Self::new(
            address_map,
            store,
            Rewriter::new(config.relay.clone(), config.rewrite.clone()),
            RelaySender::new(config.transport.build(), config.timeouts.send()),
            BounceGenerator::new(
                config.relay.reporting_mta.clone(),
                notifier,
                config.timeouts.notify(),
            ),
        )
        .with_invocation_timeout(config.timeouts.invocation()))
    }

    #[must_use]
    pub const fn address_map(&self) -> &AddressMapHandle {
        &self.address_map
    }

    #[must_use]
    pub fn describe(&self) -> String {
        format!(
            "store: {}, transport: {}",
            self.store.describe(),
            self.sender.describe()
        )
    }

    /// Process one trigger to completion and report what happened.
    ///
    /// Never panics or returns early: every failure ends up classified in
    /// the report.
    #[traced(instrument(level = "info", skip_all, fields(recipient = %trigger.recipient, storage_key = %trigger.storage_key)), timing(precision = "ms"))]
    pub async fn process(&self, trigger: &Trigger) -> Report {
        incoming!(
            level = INFO,
            recipient = %trigger.recipient,
            storage_key = %trigger.storage_key,
            "Trigger received"
        );

        let mut report = Report::received(trigger);

        let result = tokio::time::timeout(self.invocation_timeout, self.run(trigger, &mut report))
            .await
            .unwrap_or(Err(PipelineError::Deadline(self.invocation_timeout)));

        match result {
            Ok(()) => {
                report.disposition = Disposition::Done;
                report.advance(Stage::Done);

                internal!(
                    level = INFO,
                    recipient = %trigger.recipient,
                    storage_key = %trigger.storage_key,
                    resolution = report.resolution.unwrap_or("-"),
                    "Invocation done"
                );
            }
            Err(err) => {
                report.fail(&err);

                internal!(
                    level = ERROR,
                    recipient = %trigger.recipient,
                    storage_key = %trigger.storage_key,
                    stage = err.stage(),
                    class = %err.class(),
                    disposition = ?report.disposition,
                    error = %err,
                    "Invocation failed"
                );
            }
        }

        report
    }

    async fn run(&self, trigger: &Trigger, report: &mut Report) -> Result<(), PipelineError> {
        let recipient = Mailbox::parse(&trigger.recipient).map_err(|err| {
            PipelineError::InvalidTrigger(format!("recipient '{}': {err}", trigger.recipient))
        })?;
        let key = StorageKey::parse(&trigger.storage_key)
            .map_err(|err| PipelineError::InvalidTrigger(err.to_string()))?;

        let map = self.address_map.current();
        report.map_version = Some(map.version().to_string());

        let resolution = map.resolve(&recipient);
        report.resolution = Some(resolution.kind());

        match resolution {
            Resolution::Unknown => Err(PipelineError::Unresolvable(recipient.normalized())),
            Resolution::Forward(destinations) => {
                report.advance(Stage::Resolved);
                self.forward(&recipient, &key, &destinations, report).await
            }
            Resolution::Bounce(rule) => {
                report.advance(Stage::Resolved);
                self.bounce(trigger, &recipient, &key, &rule, report).await
            }
        }
    }

    async fn forward(
        &self,
        recipient: &Mailbox,
        key: &StorageKey,
        destinations: &[Mailbox],
        report: &mut Report,
    ) -> Result<(), PipelineError> {
        let raw = self.store.fetch(key).await?;
        report.advance(Stage::Fetched);

        let message = self.rewriter.rewrite(&raw, destinations, recipient)?;
        report.advance(Stage::Rewritten);

        report.outcomes = self.sender.send_all(&message).await;

        // A retryable destination makes the whole invocation retryable.
        // Destinations that already succeeded will be sent again on
        // redelivery.
        if let Some(outcome) = report
            .outcomes
            .iter()
            .find(|outcome| outcome.status == RelayStatus::RetryableFailure)
        {
            return Err(PipelineError::Relay {
                destination: outcome.destination.clone(),
                class: FailureClass::Retryable,
                detail: outcome.error_detail.clone().unwrap_or_default(),
            });
        }

        for outcome in report
            .outcomes
            .iter()
            .filter(|outcome| outcome.status == RelayStatus::TerminalFailure)
        {
            internal!(
                level = ERROR,
                recipient = %recipient,
                storage_key = %key,
                destination = %outcome.destination,
                error = outcome.error_detail.as_deref().unwrap_or("-"),
                "Destination rejected message permanently"
            );
        }

        report.advance(Stage::Sent);
        Ok(())
    }

    async fn bounce(
        &self,
        trigger: &Trigger,
        recipient: &Mailbox,
        key: &StorageKey,
        rule: &BounceRule,
        report: &mut Report,
    ) -> Result<(), PipelineError> {
        let original = if let Some(sender) = &trigger.sender {
            let return_path = parse_reverse_path(sender).map_err(|err| {
                PipelineError::InvalidTrigger(format!("sender '{sender}': {err}"))
            })?;

            Original {
                return_path,
                auto_submitted: None,
                date: None,
                headers: Vec::new(),
            }
        } else {
            let raw = self.store.fetch(key).await?;
            report.advance(Stage::Fetched);
            Original::read(&raw)?
        };

        if let Some(reason) =
            suppression(original.return_path.as_ref(), original.auto_submitted.as_deref())
        {
            internal!(
                level = INFO,
                recipient = %recipient,
                storage_key = %key,
                reason = %reason,
                "Bounce suppressed"
            );
            report.suppressed = Some(reason.to_string());
            return Ok(());
        }

        // The bounce identity is derived from this timestamp when there is
        // one, so a redelivered trigger must see the same value. Never `now`.
        let received_at = trigger.received_at.or(original.date);

        let request = BounceRequest {
            storage_key: key.as_str(),
            original_recipient: recipient,
            return_path: original.return_path.as_ref(),
            received_at,
            original_headers: (!original.headers.is_empty()).then_some(original.headers.as_slice()),
        };

        let bounce = self.bounces.generate(rule, &request).await?;

        let outcome = self
            .sender
            .send_outbound(&OutboundMessage {
                envelope_sender: None,
                recipient: bounce.to.clone(),
                data: Arc::clone(&bounce.data),
            })
            .await;

        report.bounce = Some(BounceSummary {
            to: bounce.to,
            from: bounce.from,
            message_id: bounce.message_id,
            reason: bounce.reason,
            status: outcome.status,
        });

        let class = match outcome.status {
            RelayStatus::Sent => {
                report.advance(Stage::Bounced);
                return Ok(());
            }
            RelayStatus::RetryableFailure => FailureClass::Retryable,
            RelayStatus::TerminalFailure => FailureClass::Terminal,
        };

        Err(PipelineError::Relay {
            destination: outcome.destination,
            class,
            detail: outcome.error_detail.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn trigger_json() {
        let trigger: Trigger =
            serde_json::from_str(r#"{"recipient": "sales@example.com", "storage_key": "abc"}"#)
                .unwrap();
        assert_eq!(trigger, Trigger::new("sales@example.com", "abc"));

        let trigger: Trigger = serde_json::from_str(
            r#"{"recipient": "x@example.com", "storage_key": "k", "sender": "<>", "received_at": "2025-01-06T10:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(trigger.sender.as_deref(), Some("<>"));
        assert!(trigger.received_at.is_some());
    }

    #[test]
    fn exit_codes() {
        assert_eq!(Disposition::Done.exit_code(), 0);
        assert_eq!(Disposition::Retryable.exit_code(), 75);
        assert_eq!(Disposition::Dropped.exit_code(), 65);
        assert_eq!(Disposition::ConfigurationError.exit_code(), 78);
    }

    #[test]
    fn original_prefers_return_path() {
        let original = Original::read(
            b"Return-Path: <bounces@list.example.org>\r\n\
From: Jane <jane@sender.org>\r\n\
Date: Mon, 6 Jan 2025 10:00:00 +0000\r\n\
\r\n\
body\r\n",
        )
        .unwrap();

        assert_eq!(
            original.return_path,
            Some(Mailbox::parse("bounces@list.example.org").unwrap())
        );
        assert_eq!(
            original.date,
            DateTime::parse_from_rfc3339("2025-01-06T10:00:00Z")
                .ok()
                .map(|date| date.with_timezone(&Utc))
        );
        assert!(original.headers.starts_with(b"Return-Path:"));
        assert!(!original.headers.ends_with(b"body\r\n"));
    }

    #[test]
    fn original_falls_back_to_from() {
        let original =
            Original::read(b"From: Jane <jane@sender.org>\r\nAuto-Submitted: auto-replied\r\n\r\n")
                .unwrap();

        assert_eq!(
            original.return_path,
            Some(Mailbox::parse("jane@sender.org").unwrap())
        );
        assert_eq!(original.auto_submitted.as_deref(), Some("auto-replied"));
    }

    #[test]
    fn null_return_path() {
        let original =
            Original::read(b"Return-Path: <>\r\nFrom: MAILER-DAEMON <md@sender.org>\r\n\r\n")
                .unwrap();
        assert_eq!(original.return_path, None);
    }

    #[test]
    fn report_serialisation() {
        let mut report = Report::received(&Trigger::new("x@nowhere.net", "k"));
        report.fail(&PipelineError::Unresolvable(Mailbox::parse("x@nowhere.net").unwrap()));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["disposition"], "CONFIGURATION_ERROR");
        assert_eq!(json["trace"], serde_json::json!(["RECEIVED", "FAILED"]));
        assert_eq!(json["failure"]["stage"], "resolve");
        assert_eq!(json["failure"]["class"], "terminal");
        assert!(json.get("outcomes").is_none());
        assert_eq!(report.last_stage(), Stage::Failed);
    }
}
