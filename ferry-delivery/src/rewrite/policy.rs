//! Which inbound header fields survive forwarding

/// A header name, or a `Prefix-*` family of names
#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    Exact(String),
    Prefix(String),
}

impl Pattern {
    fn parse(pattern: &str) -> Self {
        pattern.strip_suffix('*').map_or_else(
            || Self::Exact(pattern.to_ascii_lowercase()),
            |prefix| Self::Prefix(prefix.to_ascii_lowercase()),
        )
    }

    fn matches(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        match self {
            Self::Exact(exact) => name == *exact,
            Self::Prefix(prefix) => name.starts_with(prefix.as_str()),
        }
    }
}

/// Signatures and envelope artefacts that would fail or mislead once the
/// message leaves under the relay's envelope sender.
const STRIPPED: &[&str] = &[
    "DKIM-Signature",
    "DomainKey-Signature",
    "X-Google-DKIM-Signature",
    "ARC-Seal",
    "ARC-Message-Signature",
    "ARC-Authentication-Results",
    "Authentication-Results",
    "Received-SPF",
    "Return-Path",
    "Sender",
    "Delivered-To",
    "X-Original-To",
];

const ALLOWED: &[&str] = &[
    "Date",
    "Subject",
    "To",
    "Cc",
    "Message-ID",
    "In-Reply-To",
    "References",
    "MIME-Version",
    "Content-*",
    "List-*",
    "Received",
    "Comments",
    "Keywords",
    "Importance",
    "Priority",
    "Precedence",
    "Auto-Submitted",
    "Thread-*",
    "Accept-Language",
    "X-*",
];

/// What happens to one inbound header field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Strip,
    Rewrite(Rewritten),
    Keep,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rewritten {
    From,
    ReplyTo,
    Subject,
}

/// Strip beats rewrite beats allow; anything unmatched is dropped.
#[derive(Debug, Clone)]
pub struct HeaderPolicy {
    strip: Vec<Pattern>,
    allow: Vec<Pattern>,
    rewrite_subject: bool,
}

impl HeaderPolicy {
    pub fn new<S: AsRef<str>>(extra_allowed: &[S], rewrite_subject: bool) -> Self {
        Self {
            strip: STRIPPED.iter().copied().map(Pattern::parse).collect(),
            allow: ALLOWED
                .iter()
                .copied()
                .chain(extra_allowed.iter().map(AsRef::as_ref))
                .map(Pattern::parse)
                .collect(),
            rewrite_subject,
        }
    }

    #[must_use]
    pub fn disposition(&self, name: &str) -> Disposition {
        if self.strip.iter().any(|p| p.matches(name)) {
            return Disposition::Strip;
        }

        if name.eq_ignore_ascii_case("From") {
            return Disposition::Rewrite(Rewritten::From);
        }

        if name.eq_ignore_ascii_case("Reply-To") {
            return Disposition::Rewrite(Rewritten::ReplyTo);
        }

        if self.rewrite_subject && name.eq_ignore_ascii_case("Subject") {
            return Disposition::Rewrite(Rewritten::Subject);
        }

        if self.allow.iter().any(|p| p.matches(name)) {
            Disposition::Keep
        } else {
            Disposition::Drop
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn precedence() {
        let policy = HeaderPolicy::new(&["Organization"], false);

        assert_eq!(policy.disposition("dkim-signature"), Disposition::Strip);
        // X-* is allowed, but the explicit strip entry wins.
        assert_eq!(policy.disposition("X-Original-To"), Disposition::Strip);
        assert_eq!(policy.disposition("X-Mailer"), Disposition::Keep);
        assert_eq!(policy.disposition("From"), Disposition::Rewrite(Rewritten::From));
        assert_eq!(
            policy.disposition("REPLY-TO"),
            Disposition::Rewrite(Rewritten::ReplyTo)
        );
        assert_eq!(policy.disposition("Subject"), Disposition::Keep);
        assert_eq!(policy.disposition("Content-Type"), Disposition::Keep);
        assert_eq!(policy.disposition("List-Unsubscribe"), Disposition::Keep);
        assert_eq!(policy.disposition("Organization"), Disposition::Keep);
        assert_eq!(policy.disposition("Bcc"), Disposition::Drop);
        assert_eq!(policy.disposition("Disposition-Notification-To"), Disposition::Drop);
    }

    #[test]
    fn subject_rewrite_only_when_enabled() {
        let policy = HeaderPolicy::new::<&str>(&[], true);
        assert_eq!(
            policy.disposition("subject"),
            Disposition::Rewrite(Rewritten::Subject)
        );
    }
}
