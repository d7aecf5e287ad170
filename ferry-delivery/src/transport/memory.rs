use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use ferry_common::Mailbox;
use parking_lot::Mutex;

use super::{OutboundMessage, Transport, TransportReceipt};
use crate::TransportError;

#[derive(Debug)]
enum Scripted {
    Reply(u16, String),
    Disconnect,
}

#[derive(Debug, Default)]
struct Inner {
    sent: Vec<OutboundMessage>,
    attempts: usize,
    scripted: VecDeque<Scripted>,
    rejections: HashMap<Mailbox, (u16, String)>,
    delay: Option<Duration>,
}

/// Keeps accepted messages in memory instead of sending them.
///
/// Failures can be scripted: the next N attempts, or every attempt for a
/// given recipient. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next attempt with this SMTP reply
    pub fn fail_next(&self, code: u16, message: impl Into<String>) {
        self.inner
            .lock()
            .scripted
            .push_back(Scripted::Reply(code, message.into()));
    }

    /// Fail the next attempt as though the connection dropped
    pub fn disconnect_next(&self) {
        self.inner.lock().scripted.push_back(Scripted::Disconnect);
    }

    /// Answer every attempt for `recipient` with this SMTP reply
    pub fn reject(&self, recipient: &Mailbox, code: u16, message: impl Into<String>) {
        self.inner
            .lock()
            .rejections
            .insert(recipient.normalized(), (code, message.into()));
    }

    /// Wait this long before answering each attempt
    pub fn delay(&self, delay: Duration) {
        self.inner.lock().delay = Some(delay);
    }

    /// Messages accepted so far, in order
    #[must_use]
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.inner.lock().sent.clone()
    }

    /// Every attempt, accepted or not
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.inner.lock().attempts
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<TransportReceipt, TransportError> {
        let delay = {
            let mut inner = self.inner.lock();
            inner.attempts += 1;
            inner.delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock();

        if let Some(scripted) = inner.scripted.pop_front() {
            return Err(match scripted {
                Scripted::Reply(code, text) => TransportError::from_reply(code, text),
                Scripted::Disconnect => {
                    TransportError::Connection("Connection closed unexpectedly".to_string())
                }
            });
        }

        if let Some((code, text)) = inner.rejections.get(&message.recipient.normalized()) {
            return Err(TransportError::from_reply(*code, text.clone()));
        }

        inner.sent.push(message.clone());
        let reference = format!("mem-{}", inner.sent.len());

        Ok(TransportReceipt {
            response: format!("250 2.0.0 Ok: queued as {reference}"),
            reference: Some(reference),
        })
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use ferry_common::Classify;
    use pretty_assertions::assert_eq;

    use super::*;

    fn message(to: &str) -> OutboundMessage {
        OutboundMessage {
            envelope_sender: None,
            recipient: Mailbox::parse(to).unwrap(),
            data: Arc::from(&b"Subject: x\r\n\r\nbody"[..]),
        }
    }

    #[tokio::test]
    async fn records_accepted_messages() {
        let transport = MemoryTransport::new();

        let receipt = transport.send(&message("a@company.com")).await.unwrap();
        assert_eq!(receipt.reference.as_deref(), Some("mem-1"));
        assert_eq!(transport.sent(), vec![message("a@company.com")]);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let transport = MemoryTransport::new();
        transport.fail_next(421, "try again");
        transport.disconnect_next();

        let err = transport.send(&message("a@company.com")).await.unwrap_err();
        assert!(err.is_retryable());
        let err = transport.send(&message("a@company.com")).await.unwrap_err();
        assert!(matches!(err, TransportError::Connection(_)));
        assert!(transport.send(&message("a@company.com")).await.is_ok());

        assert_eq!(transport.attempts(), 3);
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn per_recipient_rejection() {
        let transport = MemoryTransport::new();
        transport.reject(&Mailbox::parse("Gone@company.com").unwrap(), 550, "no such user");

        let err = transport.send(&message("gone@company.com")).await.unwrap_err();
        assert!(err.is_terminal());
        assert!(transport.send(&message("here@company.com")).await.is_ok());
    }
}
