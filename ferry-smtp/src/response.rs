//! SMTP reply parsing and representation.

use crate::error::{ClientError, Result};

/// A complete, possibly multi-line, SMTP reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    #[must_use]
    pub const fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// The reply text with lines joined by newlines
    #[must_use]
    pub fn message(&self) -> String {
        self.lines.join("\n")
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, 200..=299)
    }

    /// 354, the go-ahead after DATA
    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        matches!(self.code, 300..=399)
    }

    #[must_use]
    pub const fn is_temporary_error(&self) -> bool {
        matches!(self.code, 400..=499)
    }

    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        matches!(self.code, 500..=599)
    }

    /// The RFC 3463 enhanced status code at the start of the first line,
    /// e.g. `5.1.1`.
    #[must_use]
    pub fn enhanced_status(&self) -> Option<&str> {
        let first = self.lines.first()?;
        let candidate = first.split_whitespace().next()?;

        let mut parts = candidate.split('.');
        let class = parts.next()?;
        let subject = parts.next()?;
        let detail = parts.next()?;

        let valid = matches!(class, "2" | "4" | "5")
            && parts.next().is_none()
            && [subject, detail]
                .iter()
                .all(|part| !part.is_empty() && part.len() <= 3 && part.bytes().all(|b| b.is_ascii_digit()));

        valid.then_some(candidate)
    }

    /// Whether an EHLO reply advertises `keyword` (case-insensitive).
    ///
    /// The first line is the server greeting and is skipped.
    #[must_use]
    pub fn has_capability(&self, keyword: &str) -> bool {
        self.lines.iter().skip(1).any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|kw| kw.eq_ignore_ascii_case(keyword))
        })
    }

    /// Value of the `SIZE` extension, if advertised with a limit.
    #[must_use]
    pub fn size_limit(&self) -> Option<usize> {
        self.lines.iter().skip(1).find_map(|line| {
            let mut words = line.split_whitespace();
            words
                .next()
                .filter(|kw| kw.eq_ignore_ascii_case("SIZE"))
                .and_then(|_| words.next())
                .and_then(|value| value.parse().ok())
                .filter(|limit| *limit > 0)
        })
    }

    /// Parse one complete reply from the front of `buffer`.
    ///
    /// Returns the reply and the number of bytes it occupied, or `None` when
    /// more input is needed. Lines may end in CRLF or a bare LF.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ParseError` if the reply is malformed.
    pub fn parse_response(buffer: &[u8]) -> Result<Option<(Self, usize)>> {
        let mut offset = 0;
        let mut code = None;
        let mut lines = Vec::new();

        while let Some(newline) = buffer[offset..].iter().position(|b| *b == b'\n') {
            let raw = &buffer[offset..offset + newline];
            offset += newline + 1;

            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.is_empty() {
                continue;
            }

            let (line_code, last, text) = parse_line(std::str::from_utf8(raw)?)?;

            match code {
                None => code = Some(line_code),
                Some(expected) if expected != line_code => {
                    return Err(ClientError::ParseError(format!(
                        "Status code mismatch in multi-line response: expected {expected}, got {line_code}"
                    )));
                }
                Some(_) => {}
            }

            lines.push(text.to_string());

            if last {
                return Ok(code.map(|code| (Self::new(code, lines), offset)));
            }
        }

        Ok(None)
    }
}

/// Split `250-text` / `250 text` / `250` into code, last-line flag and text
fn parse_line(line: &str) -> Result<(u16, bool, &str)> {
    let code = line
        .get(..3)
        .filter(|digits| digits.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|digits| digits.parse::<u16>().ok())
        .ok_or_else(|| ClientError::ParseError(format!("Invalid status code in '{line}'")))?;

    match line.as_bytes().get(3) {
        None => Ok((code, true, "")),
        Some(b' ') => Ok((code, true, &line[4..])),
        Some(b'-') => Ok((code, false, &line[4..])),
        Some(other) => Err(ClientError::ParseError(format!(
            "Invalid separator character: '{}'",
            char::from(*other)
        ))),
    }
}
