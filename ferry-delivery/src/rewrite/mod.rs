//! Turning a staged message into one that can leave under the relay's name
//!
//! The body is never touched. Header fields are copied byte-for-byte unless
//! the [`HeaderPolicy`] says otherwise, so identical input always produces
//! identical output.

mod encoding;
mod policy;

use std::sync::Arc;

use ferry_common::{Mailbox, internal};
use ferry_tracing::traced;

pub use self::policy::{Disposition, HeaderPolicy, Rewritten};
use crate::{
    RelayIdentity, RewriteConfig, RewriteError,
    message::{self, HeaderField, RawMessage},
};

/// A message ready to be handed to a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenMessage {
    envelope_sender: Mailbox,
    original_recipient: Mailbox,
    original_author: Mailbox,
    destinations: Arc<[Mailbox]>,
    headers: Vec<HeaderField>,
    data: Arc<[u8]>,
    body_offset: usize,
    attachment_count: usize,
}

impl RewrittenMessage {
    /// The relay identity, used as `MAIL FROM`
    #[must_use]
    pub const fn envelope_sender(&self) -> &Mailbox {
        &self.envelope_sender
    }

    #[must_use]
    pub const fn original_recipient(&self) -> &Mailbox {
        &self.original_recipient
    }

    /// Address from the inbound `From`, which replies are directed to
    #[must_use]
    pub const fn original_author(&self) -> &Mailbox {
        &self.original_author
    }

    #[must_use]
    pub fn destinations(&self) -> &[Mailbox] {
        &self.destinations
    }

    #[must_use]
    pub fn headers(&self) -> &[HeaderField] {
        &self.headers
    }

    /// Unfolded value of the first header called `name`
    #[must_use]
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|field| field.is(name))
            .map(HeaderField::value)
    }

    /// The complete serialised message
    #[must_use]
    pub fn data(&self) -> Arc<[u8]> {
        Arc::clone(&self.data)
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.data[self.body_offset..]
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub const fn attachment_count(&self) -> usize {
        self.attachment_count
    }
}

#[derive(Debug, Clone)]
pub struct Rewriter {
    identity: RelayIdentity,
    config: RewriteConfig,
    policy: HeaderPolicy,
}

impl Rewriter {
    #[must_use]
    pub fn new(identity: RelayIdentity, config: RewriteConfig) -> Self {
        let policy = HeaderPolicy::new(
            &config.extra_allowed_headers,
            config.subject_prefix.is_some(),
        );

        Self {
            identity,
            config,
            policy,
        }
    }

    #[must_use]
    pub const fn identity(&self) -> &RelayIdentity {
        &self.identity
    }

    /// Rewrite `raw` for relaying to `destinations` on behalf of
    /// `original_recipient`.
    ///
    /// # Errors
    ///
    /// All errors are terminal: malformed MIME or headers, a missing or
    /// unparseable `From`, a message that has already been forwarded for
    /// this alias, an empty destination list, or a result larger than
    /// `max_message_size`.
    #[traced(instrument(level = "debug", skip_all, fields(recipient = %original_recipient, size = raw.len())), timing(precision = "us"))]
    pub fn rewrite(
        &self,
        raw: &[u8],
        destinations: &[Mailbox],
        original_recipient: &Mailbox,
    ) -> Result<RewrittenMessage, RewriteError> {
        let limit = self.config.max_message_size;
        if raw.len() > limit {
            return Err(RewriteError::TooLarge {
                size: raw.len(),
                limit,
            });
        }

        if destinations.is_empty() {
            return Err(RewriteError::NoDestinations);
        }

        let split = RawMessage::split(raw)?;
        let parsed = mailparse::parse_mail(raw)
            .map_err(|err| RewriteError::Malformed(err.to_string()))?;
        message::validate_mime(&parsed)?;

        let (author_name, author_address) = message::first_mailbox(&parsed, "From")
            .ok_or_else(|| RewriteError::Malformed("missing or unparseable From".to_string()))?;
        let original_author = Mailbox::parse(&author_address).map_err(|err| {
            RewriteError::Malformed(format!("invalid From address '{author_address}': {err}"))
        })?;

        self.detect_loop(&split, original_recipient)?;

        let headers = self.rewrite_headers(
            &split,
            author_name.as_deref().unwrap_or(&author_address),
            original_recipient,
        );

        let mut data: Vec<u8> = headers
            .iter()
            .flat_map(|field| field.raw().iter().copied())
            .collect();
        data.extend_from_slice(split.line_ending);
        let body_offset = data.len();
        data.extend_from_slice(split.body);

        if data.len() > limit {
            return Err(RewriteError::TooLarge {
                size: data.len(),
                limit,
            });
        }

        let attachment_count = message::attachments(&parsed).len();

        internal!(
            level = DEBUG,
            size = data.len(),
            headers = headers.len(),
            attachments = attachment_count,
            "Rewrote message"
        );

        Ok(RewrittenMessage {
            envelope_sender: self.identity.address.clone(),
            original_recipient: original_recipient.clone(),
            original_author,
            destinations: Arc::from(destinations),
            headers,
            data: Arc::from(data),
            body_offset,
            attachment_count,
        })
    }

    /// A marker naming this alias means the message has come back around.
    fn detect_loop(
        &self,
        message: &RawMessage<'_>,
        original_recipient: &Mailbox,
    ) -> Result<(), RewriteError> {
        let alias = original_recipient.normalized();

        let looped = message
            .headers
            .iter()
            .filter(|field| field.is(&self.config.marker_header))
            .filter_map(|field| {
                field
                    .value()
                    .split_whitespace()
                    .next()
                    .and_then(|first| Mailbox::parse(first).ok())
            })
            .any(|marked| marked.normalized() == alias);

        if looped {
            return Err(RewriteError::LoopDetected {
                alias: alias.to_string(),
            });
        }

        Ok(())
    }

    fn rewrite_headers(
        &self,
        message: &RawMessage<'_>,
        author_name: &str,
        original_recipient: &Mailbox,
    ) -> Vec<HeaderField> {
        let line_ending = message.line_ending;
        let has_reply_to = message.header("Reply-To").is_some();

        let mut headers = Vec::with_capacity(message.headers.len() + 2);

        for field in &message.headers {
            match self.policy.disposition(field.name()) {
                Disposition::Strip | Disposition::Drop => {}
                Disposition::Keep | Disposition::Rewrite(Rewritten::ReplyTo) => {
                    headers.push(field.clone());
                }
                Disposition::Rewrite(Rewritten::From) => {
                    if headers.iter().any(|h: &HeaderField| h.is("From")) {
                        continue;
                    }

                    headers.push(HeaderField::with_line_ending(
                        "From",
                        &self.from_value(author_name, original_recipient),
                        line_ending,
                    ));

                    if !has_reply_to {
                        headers.push(field.renamed("Reply-To"));
                    }
                }
                Disposition::Rewrite(Rewritten::Subject) => {
                    headers.push(self.prefixed_subject(field, line_ending));
                }
            }
        }

        headers.push(HeaderField::with_line_ending(
            &self.config.marker_header,
            &format!("{original_recipient} via {}", self.identity.address),
            line_ending,
        ));

        headers
    }

    fn from_value(&self, author_name: &str, original_recipient: &Mailbox) -> String {
        let display = self
            .identity
            .display_format
            .replace("{name}", author_name)
            .replace("{alias}", &original_recipient.to_string());

        format!(
            "{} <{}>",
            encoding::display_name(&display),
            self.identity.address
        )
    }

    fn prefixed_subject(&self, field: &HeaderField, line_ending: &[u8]) -> HeaderField {
        let Some(prefix) = &self.config.subject_prefix else {
            return field.clone();
        };

        let subject = field.value();
        if subject.starts_with(prefix.as_str()) {
            return field.clone();
        }

        let value = if subject.is_empty() {
            prefix.clone()
        } else {
            format!("{prefix} {subject}")
        };

        HeaderField::with_line_ending(field.name(), &value, line_ending)
    }
}
