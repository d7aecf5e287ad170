//! Outbound mail transports

mod memory;
mod smtp;

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use ferry_common::Mailbox;
use serde::Deserialize;

pub use self::{
    memory::MemoryTransport,
    smtp::{SmtpTimeouts, SmtpTransport, SmtpTransportConfig},
};
use crate::TransportError;

/// One message for one envelope recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// `None` sends with the null reverse-path `<>`, as bounces are
    pub envelope_sender: Option<Mailbox>,
    pub recipient: Mailbox,
    pub data: Arc<[u8]>,
}

/// The transport accepted the message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportReceipt {
    /// Identifier the remote assigned, e.g. from `250 OK queued as ABC123`
    pub reference: Option<String>,
    /// Final reply text
    pub response: String,
}

#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Hand `message` over for delivery.
    ///
    /// # Errors
    ///
    /// A [`TransportError`] whose classification says whether a later
    /// attempt could succeed.
    async fn send(&self, message: &OutboundMessage) -> Result<TransportReceipt, TransportError>;

    fn describe(&self) -> String;
}

/// ```ron
/// transport: Smtp((host: "smtp.relay.example.net", port: 587, require_tls: true)),
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum TransportConfig {
    Smtp(SmtpTransportConfig),
    /// Accept everything and keep it in memory; for dry runs
    Memory,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Smtp(SmtpTransportConfig::default())
    }
}

impl TransportConfig {
    #[must_use]
    pub fn build(&self) -> Arc<dyn Transport> {
        match self {
            Self::Smtp(config) => Arc::new(SmtpTransport::new(config.clone())),
            Self::Memory => Arc::new(MemoryTransport::new()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn config_parsing() {
        let config: TransportConfig = ron::from_str(
            r#"Smtp((host: "smtp.relay.example.net", port: 587, require_tls: true, timeouts: (data_secs: 300)))"#,
        )
        .unwrap();

        let TransportConfig::Smtp(smtp) = config else {
            panic!("expected an SMTP transport");
        };
        assert_eq!(smtp.host, "smtp.relay.example.net");
        assert_eq!(smtp.port, 587);
        assert!(smtp.require_tls);
        assert_eq!(smtp.timeouts.data_secs, 300);
        assert_eq!(smtp.timeouts.ehlo_secs, 30);
        assert_eq!(smtp.helo, "localhost");

        assert_eq!(
            ron::from_str::<TransportConfig>("Memory").unwrap(),
            TransportConfig::Memory
        );
    }
}
