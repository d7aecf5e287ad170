//! SMTP submission to a smart host
//!
//! One connection per message:
//! 1. Connect and read the greeting
//! 2. EHLO, then STARTTLS when required or advertised
//! 3. If opportunistic STARTTLS fails, reconnect without it (RFC 3207 4.1)
//! 4. MAIL FROM, RCPT TO, DATA
//! 5. QUIT, whose failure does not affect the outcome

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use ferry_common::{internal, outgoing};
use ferry_smtp::{Response, SmtpClient};
use ferry_tracing::traced;
use serde::Deserialize;

use super::{OutboundMessage, Transport, TransportReceipt};
use crate::TransportError;

/// Per-command timeouts, in seconds
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SmtpTimeouts {
    #[serde(default = "default_connect_timeout")]
    pub connect_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub ehlo_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub starttls_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub mail_from_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub rcpt_to_secs: u64,
    /// Covers the DATA command and the message transfer, so it is longer
    #[serde(default = "default_data_timeout")]
    pub data_secs: u64,
    #[serde(default = "default_quit_timeout")]
    pub quit_secs: u64,
}

const fn default_connect_timeout() -> u64 {
    30
}

const fn default_command_timeout() -> u64 {
    30
}

const fn default_data_timeout() -> u64 {
    120
}

const fn default_quit_timeout() -> u64 {
    10
}

impl Default for SmtpTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_timeout(),
            ehlo_secs: default_command_timeout(),
            starttls_secs: default_command_timeout(),
            mail_from_secs: default_command_timeout(),
            rcpt_to_secs: default_command_timeout(),
            data_secs: default_data_timeout(),
            quit_secs: default_quit_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SmtpTransportConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Name sent in EHLO
    #[serde(default = "default_helo")]
    pub helo: String,
    /// Fail rather than fall back to plain text when STARTTLS is unavailable
    #[serde(default)]
    pub require_tls: bool,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default)]
    pub timeouts: SmtpTimeouts,
}

const fn default_port() -> u16 {
    25
}

fn default_helo() -> String {
    "localhost".to_string()
}

impl Default for SmtpTransportConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: default_port(),
            helo: default_helo(),
            require_tls: false,
            accept_invalid_certs: false,
            timeouts: SmtpTimeouts::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TlsNegotiationOutcome {
    Success,
    /// Not advertised and not required
    Skipped,
    /// Opportunistic STARTTLS failed; the connection is unusable
    RetryWithoutTls,
}

#[derive(Debug, Clone)]
pub struct SmtpTransport {
    config: SmtpTransportConfig,
    address: String,
}

impl SmtpTransport {
    #[must_use]
    pub fn new(config: SmtpTransportConfig) -> Self {
        let address = format!("{}:{}", config.host, config.port);
        Self { config, address }
    }

    /// Run one complete SMTP transaction for `message`.
    ///
    /// # Errors
    ///
    /// Replies are classified by code (4xx temporary, 5xx permanent);
    /// connection failures and timeouts are retryable; a required STARTTLS
    /// that fails is terminal.
    #[traced(instrument(level = "info", skip_all, fields(server = %self.address, recipient = %message.recipient)), timing(precision = "ms"))]
    pub async fn deliver(&self, message: &OutboundMessage) -> Result<TransportReceipt, TransportError> {
        if self.config.accept_invalid_certs {
            internal!(
                level = WARN,
                server = %self.address,
                "SECURITY WARNING: TLS certificate validation is disabled for this connection"
            );
        }

        let (mut client, mut ehlo) = self.connect_and_ehlo().await?;

        match self.negotiate_tls(&mut client, &ehlo).await? {
            TlsNegotiationOutcome::RetryWithoutTls => {
                internal!(
                    level = INFO,
                    server = %self.address,
                    "Reconnecting without STARTTLS per RFC 3207 Section 4.1"
                );

                drop(client);
                (client, ehlo) = self.connect_and_ehlo().await?;
            }
            TlsNegotiationOutcome::Success => {
                ehlo = self.ehlo(&mut client).await?;
            }
            TlsNegotiationOutcome::Skipped => {}
        }

        let size = message.data.len();
        if let Some(limit) = ehlo.size_limit()
            && limit > 0
            && size > limit
        {
            return Err(TransportError::Permanent {
                code: 552,
                message: format!("Message is {size} bytes, server accepts at most {limit}"),
            });
        }

        let timeouts = &self.config.timeouts;
        let sender = message.envelope_sender.as_ref().map(ToString::to_string);
        let advertises_size = ehlo.has_capability("SIZE");

        let response = timed(
            timeouts.mail_from_secs,
            "MAIL FROM",
            client.mail_from(sender.as_deref(), advertises_size.then_some(size)),
        )
        .await?;
        expect_success(&response, "MAIL FROM")?;

        let recipient = message.recipient.to_string();
        let response = timed(timeouts.rcpt_to_secs, "RCPT TO", client.rcpt_to(&recipient)).await?;
        expect_success(&response, &format!("RCPT TO {recipient}"))?;

        let response = timed(timeouts.data_secs, "DATA", client.data()).await?;
        if !response.is_intermediate() {
            return Err(rejected(&response, "DATA"));
        }

        let response = timed(timeouts.data_secs, "message data", client.send_data(&message.data)).await?;
        expect_success(&response, "message data")?;

        let receipt = TransportReceipt {
            reference: queue_reference(&response),
            response: format!("{} {}", response.code, response.message()),
        };

        let quit = Duration::from_secs(timeouts.quit_secs);
        if tokio::time::timeout(quit, client.quit()).await.is_err() {
            internal!(
                level = WARN,
                server = %self.address,
                timeout = ?quit,
                "QUIT timed out after successful delivery"
            );
        }

        Ok(receipt)
    }

    async fn connect_and_ehlo(&self) -> Result<(SmtpClient, Response), TransportError> {
        let connect = Duration::from_secs(self.config.timeouts.connect_secs);

        outgoing!(level = DEBUG, server = %self.address, "Connecting");

        let mut client = tokio::time::timeout(
            connect,
            SmtpClient::connect(&self.address, self.config.host.clone()),
        )
        .await
        .map_err(|_| {
            TransportError::Timeout(format!("Connecting to {} timed out after {connect:?}", self.address))
        })?
        .map_err(|e| TransportError::Connection(format!("Failed to connect to {}: {e}", self.address)))?
        .accept_invalid_certs(self.config.accept_invalid_certs);

        let greeting = timed(self.config.timeouts.ehlo_secs, "greeting", client.read_greeting()).await?;
        if !greeting.is_success() {
            return Err(rejected(&greeting, "greeting"));
        }

        let ehlo = self.ehlo(&mut client).await?;
        Ok((client, ehlo))
    }

    async fn ehlo(&self, client: &mut SmtpClient) -> Result<Response, TransportError> {
        let response = timed(self.config.timeouts.ehlo_secs, "EHLO", client.ehlo(&self.config.helo)).await?;
        expect_success(&response, "EHLO")?;
        Ok(response)
    }

    async fn negotiate_tls(
        &self,
        client: &mut SmtpClient,
        ehlo: &Response,
    ) -> Result<TlsNegotiationOutcome, TransportError> {
        let supports_starttls = ehlo.has_capability("STARTTLS");

        if !supports_starttls && !self.config.require_tls {
            return Ok(TlsNegotiationOutcome::Skipped);
        }

        if !supports_starttls {
            return Err(TransportError::TlsRequired(format!(
                "{} does not advertise STARTTLS",
                self.address
            )));
        }

        let starttls = Duration::from_secs(self.config.timeouts.starttls_secs);
        let result = tokio::time::timeout(starttls, client.starttls())
            .await
            .map_err(|_| format!("STARTTLS timed out after {starttls:?}"))
            .and_then(|r| r.map_err(|e| format!("STARTTLS failed: {e}")))
            .and_then(|response| {
                if response.is_success() {
                    Ok(response)
                } else {
                    Err(format!("Server rejected STARTTLS: {}", response.message()))
                }
            });

        match result {
            Ok(_) => {
                internal!(level = DEBUG, server = %self.address, "TLS negotiated via STARTTLS");
                Ok(TlsNegotiationOutcome::Success)
            }
            Err(message) if self.config.require_tls => Err(TransportError::TlsRequired(message)),
            Err(message) => {
                internal!(
                    level = INFO,
                    server = %self.address,
                    error = %message,
                    "Opportunistic STARTTLS failed, will retry without TLS"
                );
                Ok(TlsNegotiationOutcome::RetryWithoutTls)
            }
        }
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<TransportReceipt, TransportError> {
        self.deliver(message).await
    }

    fn describe(&self) -> String {
        format!("smtp {}", self.address)
    }
}

async fn timed<T>(
    secs: u64,
    stage: &str,
    fut: impl Future<Output = ferry_smtp::Result<T>>,
) -> Result<T, TransportError> {
    let limit = Duration::from_secs(secs);
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| TransportError::Timeout(format!("{stage} timed out after {limit:?}")))?
        .map_err(TransportError::from)
}

fn rejected(response: &Response, stage: &str) -> TransportError {
    TransportError::from_reply(
        response.code,
        format!("Server rejected {stage}: {}", response.message()),
    )
}

fn expect_success(response: &Response, stage: &str) -> Result<(), TransportError> {
    if response.is_success() {
        Ok(())
    } else {
        Err(rejected(response, stage))
    }
}

/// The queue identifier from a final reply such as `250 2.0.0 Ok: queued as 4F2A1B`
fn queue_reference(response: &Response) -> Option<String> {
    let message = response.message();
    let lower = message.to_ascii_lowercase();
    let start = lower.find("queued as ")? + "queued as ".len();

    message[start..]
        .split_whitespace()
        .next()
        .map(|id| id.trim_end_matches(['.', ',', ')']).to_string())
        .filter(|id| !id.is_empty())
}
