//! Operator notifications for bounces
//!
//! Notifications are fire-and-forget: the bounce generator bounds each
//! emission with a timeout and only logs a failure.

use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ferry_common::{Mailbox, internal, outgoing};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{NotifyError, bounce::BounceReason};

/// Published once for every bounce that is composed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BounceEvent {
    pub original_recipient: Mailbox,
    pub reason: BounceReason,
    pub bounce_sender: Mailbox,
    pub returned_to: Mailbox,
    pub storage_key: String,
    pub message_id: String,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait]
pub trait Notifier: Send + Sync + Debug {
    /// Publish `event`.
    ///
    /// # Errors
    ///
    /// Returns a [`NotifyError`] when the channel could not accept the event.
    async fn notify(&self, event: &BounceEvent) -> Result<(), NotifyError>;

    /// Short description for logs, e.g. `webhook https://...`
    fn describe(&self) -> String;
}

/// Writes each event to the log at INFO
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &BounceEvent) -> Result<(), NotifyError> {
        internal!(
            level = INFO,
            recipient = %event.original_recipient,
            reason = %event.reason,
            returned_to = %event.returned_to,
            storage_key = %event.storage_key,
            message_id = %event.message_id,
            "Bounce generated"
        );

        Ok(())
    }

    fn describe(&self) -> String {
        "log".to_string()
    }
}

/// In-process broadcast of events, used by embedders and tests
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: broadcast::Sender<BounceEvent>,
}

impl ChannelNotifier {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BounceEvent> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, event: &BounceEvent) -> Result<(), NotifyError> {
        self.sender
            .send(event.clone())
            .map(|_| ())
            .map_err(|_| NotifyError::Closed)
    }

    fn describe(&self) -> String {
        format!("channel ({} subscribers)", self.sender.receiver_count())
    }
}

/// POSTs each event as JSON to a URL
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    /// # Errors
    ///
    /// Fails when the HTTP client cannot be constructed.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| NotifyError::Request(err.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &BounceEvent) -> Result<(), NotifyError> {
        outgoing!(level = DEBUG, url = %self.url, recipient = %event.original_recipient, "POST bounce event");

        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    NotifyError::Timeout
                } else {
                    NotifyError::Request(err.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(NotifyError::Status(status.as_u16()))
        }
    }

    fn describe(&self) -> String {
        format!("webhook {}", self.url)
    }
}

/// Where bounce events are published
///
/// ```ron
/// notification: Webhook(url: "https://hooks.example.net/bounces"),
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub enum NotificationConfig {
    #[default]
    Log,
    Webhook { url: String },
}

impl NotificationConfig {
    /// # Errors
    ///
    /// Fails when a webhook client cannot be constructed.
    pub fn build(&self, timeout: Duration) -> Result<Arc<dyn Notifier>, NotifyError> {
        Ok(match self {
            Self::Log => Arc::new(LogNotifier),
            Self::Webhook { url } => Arc::new(WebhookNotifier::new(url.clone(), timeout)?),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn event() -> BounceEvent {
        BounceEvent {
            original_recipient: Mailbox::parse("noexist@example.com").unwrap(),
            reason: BounceReason::MailboxDoesNotExist,
            bounce_sender: Mailbox::parse("mailer-daemon@example.com").unwrap(),
            returned_to: Mailbox::parse("jane@sender.org").unwrap(),
            storage_key: "abc123".to_string(),
            message_id: "<x@relay.example.net>".to_string(),
            occurred_at: DateTime::parse_from_rfc3339("2025-01-06T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn event_json_shape() {
        let json = serde_json::to_value(event()).unwrap();

        assert_eq!(json["original_recipient"], "noexist@example.com");
        assert_eq!(json["reason"], "MAILBOX_DOES_NOT_EXIST");
        assert_eq!(json["returned_to"], "jane@sender.org");
    }

    #[tokio::test]
    async fn channel_delivers_to_subscribers() {
        let notifier = ChannelNotifier::new(4);
        let mut events = notifier.subscribe();

        notifier.notify(&event()).await.unwrap();

        assert_eq!(events.recv().await.unwrap(), event());
    }

    #[tokio::test]
    async fn channel_without_subscribers_is_closed() {
        let notifier = ChannelNotifier::new(4);
        assert!(matches!(
            notifier.notify(&event()).await,
            Err(NotifyError::Closed)
        ));
    }

    #[tokio::test]
    async fn webhook_posts_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/bounces")
            .match_header("content-type", "application/json")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "reason": "MAILBOX_DOES_NOT_EXIST",
                "storage_key": "abc123",
            })))
            .with_status(204)
            .create_async()
            .await;

        let notifier =
            WebhookNotifier::new(format!("{}/bounces", server.url()), Duration::from_secs(5))
                .unwrap();
        notifier.notify(&event()).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn webhook_error_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/bounces")
            .with_status(503)
            .create_async()
            .await;

        let notifier =
            WebhookNotifier::new(format!("{}/bounces", server.url()), Duration::from_secs(5))
                .unwrap();

        assert!(matches!(
            notifier.notify(&event()).await,
            Err(NotifyError::Status(503))
        ));
    }

    #[test]
    fn config_parsing() {
        let config: NotificationConfig =
            ron::from_str(r#"Webhook(url: "https://hooks.example.net/b")"#).unwrap();
        assert_eq!(
            config,
            NotificationConfig::Webhook {
                url: "https://hooks.example.net/b".to_string()
            }
        );
        assert_eq!(ron::from_str::<NotificationConfig>("Log").unwrap(), NotificationConfig::Log);
    }
}
