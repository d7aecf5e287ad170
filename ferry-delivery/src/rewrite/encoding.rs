//! Display-name encoding for generated address headers

/// Longest encoded word allowed by RFC 2047
const MAX_ENCODED_WORD: usize = 75;
const PREFIX: &str = "=?utf-8?q?";
const SUFFIX: &str = "?=";

/// Render `name` as an RFC 5322 phrase.
///
/// Printable ASCII becomes a quoted string. Anything else is written as one
/// or more RFC 2047 `Q` encoded words, split on character boundaries.
pub fn display_name(name: &str) -> String {
    if name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return quoted(name);
    }

    let budget = MAX_ENCODED_WORD - PREFIX.len() - SUFFIX.len();
    let mut words = Vec::new();
    let mut current = String::new();

    for c in name.chars() {
        let encoded = encode_char(c);
        if !current.is_empty() && current.len() + encoded.len() > budget {
            words.push(format!("{PREFIX}{current}{SUFFIX}"));
            current.clear();
        }
        current.push_str(&encoded);
    }

    if !current.is_empty() {
        words.push(format!("{PREFIX}{current}{SUFFIX}"));
    }

    words.join(" ")
}

fn quoted(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for c in name.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Characters allowed unencoded in a phrase encoded word (RFC 2047 5(3))
const fn is_phrase_safe(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'!' | b'*' | b'+' | b'-' | b'/')
}

fn encode_char(c: char) -> String {
    if c == ' ' {
        return "_".to_string();
    }

    let mut buf = [0u8; 4];
    c.encode_utf8(&mut buf)
        .bytes()
        .map(|byte| {
            if is_phrase_safe(byte) {
                char::from(byte).to_string()
            } else {
                format!("={byte:02X}")
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn ascii_is_quoted() {
        assert_eq!(display_name("Jane via sales@example.com"), "\"Jane via sales@example.com\"");
        assert_eq!(display_name(r#"The "Boss""#), r#""The \"Boss\"""#);
    }

    #[test]
    fn non_ascii_is_encoded() {
        assert_eq!(display_name("Zoë"), "=?utf-8?q?Zo=C3=AB?=");
        assert_eq!(display_name("José Núñez"), "=?utf-8?q?Jos=C3=A9_N=C3=BA=C3=B1ez?=");
    }

    #[test]
    fn long_names_are_split() {
        let name = "é".repeat(40);
        let encoded = display_name(&name);

        for word in encoded.split(' ') {
            assert!(word.len() <= MAX_ENCODED_WORD, "{word}");
            assert!(word.starts_with(PREFIX) && word.ends_with(SUFFIX));
        }
        assert!(encoded.contains(' '));
    }
}
