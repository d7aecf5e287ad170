//! End-to-end harness: the real pipeline over an in-memory store, transport
//! and notifier.
#![allow(dead_code)] // Not every test uses every helper

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use ferry::{AddressMapConfig, AddressMapHandle, MapSource, Pipeline, ReloadPolicy};
use ferry_common::{Domain, Mailbox};
use ferry_delivery::{
    BounceEvent, BounceGenerator, BounceReason, BounceRule, ChannelNotifier, MemoryTransport,
    RelayIdentity, RelaySender, RewriteConfig, Rewriter,
};
use ferry_store::TestStore;
use tokio::sync::broadcast;

pub const ALIASES: &str = r#"{
    "sales@example.com": "ops@company.com",
    "team@example.com": ["ops@company.com", "lead@partner.org"],
    "@catchall.example.net": "inbox@company.com"
}"#;

/// A message to `sales@example.com` with one PDF attachment
pub const MESSAGE: &str = "From: Jane Doe <jane@sender.org>\r\n\
To: sales@example.com\r\n\
Subject: Hello\r\n\
Date: Mon, 6 Jan 2025 10:00:00 +0000\r\n\
Message-ID: <orig-1@sender.org>\r\n\
MIME-Version: 1.0\r\n\
DKIM-Signature: v=1; a=rsa-sha256; d=sender.org; s=sel;\r\n\
\tb=dGVzdA==\r\n\
Content-Type: multipart/mixed; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Hi there.\r\n\
--b1\r\n\
Content-Type: application/pdf; name=\"report.pdf\"\r\n\
Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjQKJcfsj6IKMSAwIG9iago8PC9UeXBlL0NhdGFsb2c+PgplbmRvYmoK\r\n\
--b1--\r\n";

pub fn mailbox(s: &str) -> Mailbox {
    Mailbox::parse(s).unwrap()
}

pub fn received_at() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-01-06T10:00:05Z")
        .unwrap()
        .with_timezone(&Utc)
}

pub fn bounce_rule() -> BounceRule {
    BounceRule {
        domain: Domain::parse("example.com").unwrap(),
        sender: mailbox("mailer-daemon@example.com"),
        reason: BounceReason::MailboxDoesNotExist,
    }
}

pub struct Harness {
    pub store: TestStore,
    pub transport: MemoryTransport,
    pub events: broadcast::Receiver<BounceEvent>,
    pub pipeline: Pipeline,
    notifier: ChannelNotifier,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(ALIASES, RewriteConfig::default(), Duration::from_secs(5))
    }

    pub fn with_rewrite(config: RewriteConfig) -> Self {
        Self::with(ALIASES, config, Duration::from_secs(5))
    }

    pub fn with_invocation_timeout(timeout: Duration) -> Self {
        Self::with(ALIASES, RewriteConfig::default(), timeout)
    }

    pub fn with(aliases: &str, rewrite: RewriteConfig, invocation_timeout: Duration) -> Self {
        let store = TestStore::new();
        let transport = MemoryTransport::new();
        let notifier = ChannelNotifier::new(16);
        let events = notifier.subscribe();

        let address_map = AddressMapHandle::load(
            AddressMapConfig {
                source: MapSource::Inline(aliases.to_string()),
                reload: ReloadPolicy::Never,
            },
            vec![bounce_rule()],
        )
        .unwrap();

        let mut identity = RelayIdentity::new(mailbox("forwarder@relay.example.net"));
        identity.reporting_mta = "relay.example.net".to_string();

        let pipeline = Pipeline::new(
            address_map,
            Arc::new(store.clone()),
            Rewriter::new(identity, rewrite),
            RelaySender::new(Arc::new(transport.clone()), Duration::from_secs(1)),
            BounceGenerator::new(
                "relay.example.net",
                Arc::new(notifier.clone()),
                Duration::from_millis(200),
            ),
        )
        .with_invocation_timeout(invocation_timeout);

        Self {
            store,
            transport,
            events,
            pipeline,
            notifier,
        }
    }

    /// Stage [`MESSAGE`] under `key`
    pub fn stage(&self, key: &str) {
        self.store.stage(key, MESSAGE.as_bytes().to_vec());
    }
}
