//! Raw RFC 5322 message splitting
//!
//! Header fields are kept as their original bytes, folding and line endings
//! included, so that a field copied through the rewriter is byte-identical
//! to the input. The body is never decoded here.

use mailparse::{MailAddr, MailHeaderMap, ParsedMail};

use crate::RewriteError;

/// One header field exactly as it appeared in the message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    name: String,
    raw: Vec<u8>,
}

impl HeaderField {
    /// Build a new field, `Name: value\r\n`
    #[must_use]
    pub fn new(name: &str, value: &str) -> Self {
        Self::with_line_ending(name, value, b"\r\n")
    }

    /// Build a new field terminated the same way as the surrounding message
    #[must_use]
    pub fn with_line_ending(name: &str, value: &str, line_ending: &[u8]) -> Self {
        let mut raw = format!("{name}: {value}").into_bytes();
        raw.extend_from_slice(line_ending);

        Self {
            name: name.to_string(),
            raw,
        }
    }

    /// A field named `name` carrying another field's raw value unchanged
    #[must_use]
    pub fn renamed(&self, name: &str) -> Self {
        let mut raw = format!("{name}:").into_bytes();
        raw.extend_from_slice(self.raw_value());

        Self {
            name: name.to_string(),
            raw,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The whole field including name, colon, folding and line ending
    #[must_use]
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// The unfolded value with surrounding whitespace trimmed
    #[must_use]
    pub fn value(&self) -> String {
        let raw = String::from_utf8_lossy(&self.raw);
        let value = raw.split_once(':').map_or("", |(_, value)| value);

        value
            .split(['\r', '\n'])
            .filter(|segment| !segment.is_empty())
            .collect::<String>()
            .trim()
            .to_string()
    }

    /// The raw bytes after the colon, still folded
    #[must_use]
    pub fn raw_value(&self) -> &[u8] {
        let colon = self
            .raw
            .iter()
            .position(|b| *b == b':')
            .map_or(self.raw.len(), |i| i + 1);

        &self.raw[colon..]
    }

    #[must_use]
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// A message split into header fields and an untouched body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage<'a> {
    pub headers: Vec<HeaderField>,
    /// The line ending the message uses for its header block
    pub line_ending: &'static [u8],
    pub body: &'a [u8],
}

impl<'a> RawMessage<'a> {
    /// Split `raw` at the first empty line.
    ///
    /// A message with no empty line is all header.
    ///
    /// # Errors
    ///
    /// Returns [`RewriteError::Malformed`] when the header block does not
    /// consist of `name: value` fields with optional folded continuations.
    pub fn split(raw: &'a [u8]) -> Result<Self, RewriteError> {
        let line_ending: &'static [u8] = match raw.iter().position(|b| *b == b'\n') {
            Some(i) if i > 0 && raw[i - 1] == b'\r' => b"\r\n",
            Some(_) => b"\n",
            None => b"\r\n",
        };

        let mut headers: Vec<HeaderField> = Vec::new();
        let mut offset = 0;
        let mut body = &raw[raw.len()..];

        while offset < raw.len() {
            let end = raw[offset..]
                .iter()
                .position(|b| *b == b'\n')
                .map_or(raw.len(), |i| offset + i + 1);
            let line = &raw[offset..end];
            let content = trim_line_ending(line);

            if content.is_empty() {
                body = &raw[end..];
                break;
            }

            if content[0] == b' ' || content[0] == b'\t' {
                let Some(field) = headers.last_mut() else {
                    return Err(RewriteError::Malformed(
                        "message starts with a continuation line".to_string(),
                    ));
                };
                field.raw.extend_from_slice(line);
            } else {
                let colon = content.iter().position(|b| *b == b':').ok_or_else(|| {
                    RewriteError::Malformed(format!(
                        "header line without a colon: '{}'",
                        String::from_utf8_lossy(content)
                    ))
                })?;

                // Obsolete syntax allows whitespace between the name and
                // the colon (RFC 5322 section 4.5.8).
                let mut name = &content[..colon];
                while let [rest @ .., b' ' | b'\t'] = name {
                    name = rest;
                }
                if name.is_empty() || !name.iter().all(|b| b.is_ascii_graphic()) {
                    return Err(RewriteError::Malformed(format!(
                        "invalid header name '{}'",
                        String::from_utf8_lossy(name)
                    )));
                }

                headers.push(HeaderField {
                    name: String::from_utf8_lossy(name).into_owned(),
                    raw: line.to_vec(),
                });
            }

            offset = end;
        }

        if headers.is_empty() {
            return Err(RewriteError::Malformed("message has no headers".to_string()));
        }

        // The final header must end with a line break before anything is
        // appended after it.
        if let Some(last) = headers.last_mut()
            && !last.raw.ends_with(b"\n")
        {
            last.raw.extend_from_slice(line_ending);
        }

        Ok(Self {
            headers,
            line_ending,
            body,
        })
    }

    /// First field named `name`, case-insensitive
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&HeaderField> {
        self.headers.iter().find(|field| field.is(name))
    }

    /// The header block only, as it appeared in the message
    #[must_use]
    pub fn header_bytes(&self) -> Vec<u8> {
        self.headers.iter().flat_map(|field| field.raw.iter().copied()).collect()
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// The first mailbox in an address header such as `From`
#[must_use]
pub fn first_mailbox(parsed: &ParsedMail<'_>, header: &str) -> Option<(Option<String>, String)> {
    let field = parsed.headers.get_first_header(header)?;
    let addresses = mailparse::addrparse_header(field).ok()?;

    addresses.iter().find_map(|address| match address {
        MailAddr::Single(info) => Some((info.display_name.clone(), info.addr.clone())),
        MailAddr::Group(group) => group
            .addrs
            .first()
            .map(|info| (info.display_name.clone(), info.addr.clone())),
    })
}

/// An attachment's identity and decoded content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: Option<String>,
    pub content_type: String,
    pub content: Vec<u8>,
}

/// Every leaf part that is an attachment: an explicit
/// `Content-Disposition: attachment`, or any part carrying a filename.
#[must_use]
pub fn attachments(parsed: &ParsedMail<'_>) -> Vec<Attachment> {
    let mut found = Vec::new();
    collect_attachments(parsed, &mut found);
    found
}

fn collect_attachments(part: &ParsedMail<'_>, found: &mut Vec<Attachment>) {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect_attachments(sub, found);
        }
        return;
    }

    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .cloned();

    let is_attachment =
        disposition.disposition == mailparse::DispositionType::Attachment || filename.is_some();

    if is_attachment {
        found.push(Attachment {
            filename,
            content_type: part.ctype.mimetype.clone(),
            content: part.get_body_raw().unwrap_or_default(),
        });
    }
}

/// Basic MIME well-formedness: every multipart has a boundary that actually
/// delimits at least one part, recursively.
///
/// # Errors
///
/// Returns [`RewriteError::Malformed`] describing the first violation.
pub fn validate_mime(parsed: &ParsedMail<'_>) -> Result<(), RewriteError> {
    if parsed.ctype.mimetype.starts_with("multipart/") {
        let Some(boundary) = parsed.ctype.params.get("boundary") else {
            return Err(RewriteError::Malformed(format!(
                "{} part without a boundary",
                parsed.ctype.mimetype
            )));
        };

        if parsed.subparts.is_empty() {
            return Err(RewriteError::Malformed(format!(
                "{} part has no '--{boundary}' delimited parts",
                parsed.ctype.mimetype
            )));
        }

        for sub in &parsed.subparts {
            validate_mime(sub)?;
        }
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn splits_headers_and_body() {
        let raw = b"From: a@b.com\r\nSubject: hello\r\n  world\r\n\r\nbody\r\n";
        let message = RawMessage::split(raw).unwrap();

        assert_eq!(message.headers.len(), 2);
        assert_eq!(message.line_ending, b"\r\n");
        assert_eq!(message.body, b"body\r\n");
        assert_eq!(message.header("subject").unwrap().value(), "hello  world");
        assert_eq!(
            message.header("Subject").unwrap().raw(),
            b"Subject: hello\r\n  world\r\n"
        );
    }

    #[test]
    fn bare_lf_messages() {
        let message = RawMessage::split(b"From: a@b.com\n\nbody").unwrap();
        assert_eq!(message.line_ending, b"\n");
        assert_eq!(message.body, b"body");
    }

    #[test]
    fn header_only_message_gets_terminated() {
        let message = RawMessage::split(b"From: a@b.com").unwrap();
        assert_eq!(message.headers[0].raw(), b"From: a@b.com\r\n");
        assert!(message.body.is_empty());
    }

    #[test]
    fn whitespace_before_colon_is_accepted() {
        let raw = b"From: a@b.com\r\nSubject : Hello\r\nX-Tag\t: 1\r\n\r\nbody\r\n";
        let message = RawMessage::split(raw).unwrap();

        let subject = message.header("Subject").unwrap();
        assert_eq!(subject.name(), "Subject");
        assert_eq!(subject.value(), "Hello");
        assert_eq!(subject.raw(), b"Subject : Hello\r\n");
        assert_eq!(message.header("X-Tag").unwrap().value(), "1");
        assert_eq!(message.header_bytes(), raw[..raw.len() - 8].to_vec());
    }

    #[test]
    fn rejects_garbage_headers() {
        assert!(RawMessage::split(b" leading continuation\r\n\r\n").is_err());
        assert!(RawMessage::split(b"no colon here\r\n\r\n").is_err());
        assert!(RawMessage::split(b"Bad Name: x\r\n\r\n").is_err());
        assert!(RawMessage::split(b"\r\nbody only").is_err());
    }

    #[test]
    fn multipart_without_boundary_is_malformed() {
        let raw = b"From: a@b.com\r\nContent-Type: multipart/mixed\r\n\r\nstuff\r\n";
        let parsed = mailparse::parse_mail(raw).unwrap();
        assert!(validate_mime(&parsed).is_err());
    }

    #[test]
    fn finds_attachments_and_author() {
        let raw = b"From: \"Jane Doe\" <jane@sender.org>\r\n\
Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\
\r\n\
--XYZ\r\n\
Content-Type: text/plain\r\n\
\r\n\
hello\r\n\
--XYZ\r\n\
Content-Type: application/pdf; name=\"report.pdf\"\r\n\
Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjQK\r\n\
--XYZ--\r\n";
        let parsed = mailparse::parse_mail(raw).unwrap();

        validate_mime(&parsed).unwrap();

        let found = attachments(&parsed);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].filename.as_deref(), Some("report.pdf"));
        assert_eq!(found[0].content_type, "application/pdf");

        assert_eq!(
            first_mailbox(&parsed, "From"),
            Some((Some("Jane Doe".to_string()), "jane@sender.org".to_string()))
        );
    }
}
