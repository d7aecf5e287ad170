//! Handing rewritten messages to the transport and classifying the result

use std::{sync::Arc, time::Duration};

use ferry_common::{Classify, FailureClass, Mailbox, internal};
use ferry_tracing::traced;
use serde::Serialize;

use crate::{
    RewrittenMessage, TransportError,
    transport::{OutboundMessage, Transport},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayStatus {
    Sent,
    RetryableFailure,
    TerminalFailure,
}

/// Result of one send attempt to one destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayOutcome {
    pub destination: Mailbox,
    pub status: RelayStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl RelayOutcome {
    fn failed(destination: &Mailbox, error: &TransportError) -> Self {
        let status = match error.class() {
            FailureClass::Retryable => RelayStatus::RetryableFailure,
            FailureClass::Terminal => RelayStatus::TerminalFailure,
        };

        Self {
            destination: destination.clone(),
            status,
            transport_reference: None,
            error_detail: Some(error.to_string()),
        }
    }

    #[must_use]
    pub fn is_sent(&self) -> bool {
        self.status == RelayStatus::Sent
    }
}

#[derive(Debug, Clone)]
pub struct RelaySender {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl RelaySender {
    /// `timeout` bounds each attempt; an attempt that runs over is a
    /// retryable failure.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    #[must_use]
    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    /// Send `message` to a single destination, enveloped from the relay
    /// identity.
    pub async fn send(&self, message: &RewrittenMessage, destination: &Mailbox) -> RelayOutcome {
        let outbound = OutboundMessage {
            envelope_sender: Some(message.envelope_sender().clone()),
            recipient: destination.clone(),
            data: message.data(),
        };

        self.send_outbound(&outbound).await
    }

    /// One independent attempt per destination, in order. Each outcome is
    /// reported separately.
    pub async fn send_all(&self, message: &RewrittenMessage) -> Vec<RelayOutcome> {
        let mut outcomes = Vec::with_capacity(message.destinations().len());
        for destination in message.destinations() {
            outcomes.push(self.send(message, destination).await);
        }
        outcomes
    }

    /// Send an already-enveloped message, e.g. a bounce with a null sender.
    #[traced(instrument(level = "debug", skip_all, fields(destination = %outbound.recipient)), timing(precision = "ms"))]
    pub async fn send_outbound(&self, outbound: &OutboundMessage) -> RelayOutcome {
        let result = tokio::time::timeout(self.timeout, self.transport.send(outbound))
            .await
            .unwrap_or_else(|_| {
                Err(TransportError::Timeout(format!(
                    "Send timed out after {:?}",
                    self.timeout
                )))
            });

        match result {
            Ok(receipt) => {
                internal!(
                    level = INFO,
                    destination = %outbound.recipient,
                    reference = receipt.reference.as_deref().unwrap_or("-"),
                    "Message relayed"
                );

                RelayOutcome {
                    destination: outbound.recipient.clone(),
                    status: RelayStatus::Sent,
                    transport_reference: receipt.reference,
                    error_detail: None,
                }
            }
            Err(error) => {
                let outcome = RelayOutcome::failed(&outbound.recipient, &error);
                internal!(
                    level = WARN,
                    destination = %outbound.recipient,
                    status = ?outcome.status,
                    error = %error,
                    "Relay attempt failed"
                );
                outcome
            }
        }
    }
}
