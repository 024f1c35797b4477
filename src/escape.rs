//! Quoting and escaping helpers for building SQL text by hand.
//!
//! Prefer parameters (`$1`, `$2`, ...) where possible.

use crate::error::{Error, Result};

/// Maximum identifier length, including the terminator (NAMEDATALEN).
pub const NAMEDATALEN: usize = 64;

/// Escape a string for use inside single quotes.
///
/// Backslashes are doubled only when `standard_conforming_strings` is off.
pub fn escape_string(s: &str, standard_conforming_strings: bool) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' if !standard_conforming_strings => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out
}

/// Quote a string as a complete SQL literal.
///
/// Literals containing backslashes use the `E'...'` form so they read the same
/// regardless of `standard_conforming_strings`.
pub fn escape_literal(s: &str) -> String {
    let has_backslash = s.contains('\\');
    let mut out = String::with_capacity(s.len() + 3);
    if has_backslash {
        out.push_str(" E'");
    } else {
        out.push('\'');
    }
    for c in s.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Quote an identifier, doubling embedded double quotes.
pub fn quote_ident(s: &str) -> Result<String> {
    if s.len() >= NAMEDATALEN {
        return Err(Error::InvalidUsage(format!(
            "identifier is too long ({} bytes, limit {})",
            s.len(),
            NAMEDATALEN - 1
        )));
    }
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
    Ok(out)
}

/// Encode bytes as a `bytea` literal body in hex format (`\x...`).
pub fn escape_bytea(data: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(2 + data.len() * 2);
    out.push_str("\\x");
    for &b in data {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0xf) as usize] as char);
    }
    out
}

/// Decode a `bytea` value in text output format (hex or escape).
pub fn unescape_bytea(text: &[u8]) -> Result<Vec<u8>> {
    if let Some(hex) = text.strip_prefix(b"\\x") {
        return unhex(hex);
    }

    let mut out = Vec::with_capacity(text.len());
    let mut i = 0;
    while i < text.len() {
        if text[i] != b'\\' {
            out.push(text[i]);
            i += 1;
            continue;
        }
        match text.get(i + 1..i + 4) {
            Some(oct) if oct.iter().all(|d| (b'0'..=b'7').contains(d)) => {
                let value = oct
                    .iter()
                    .fold(0u16, |acc, d| acc * 8 + u16::from(d - b'0'));
                out.push(value as u8);
                i += 4;
            }
            _ if text.get(i + 1) == Some(&b'\\') => {
                out.push(b'\\');
                i += 2;
            }
            _ => {
                return Err(Error::InvalidUsage(format!(
                    "invalid bytea escape at byte {i}"
                )));
            }
        }
    }
    Ok(out)
}

fn unhex(hex: &[u8]) -> Result<Vec<u8>> {
    fn nibble(c: u8) -> Option<u8> {
        match c {
            b'0'..=b'9' => Some(c - b'0'),
            b'a'..=b'f' => Some(c - b'a' + 10),
            b'A'..=b'F' => Some(c - b'A' + 10),
            _ => None,
        }
    }

    let digits: Vec<u8> = hex.iter().copied().filter(|c| !c.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(Error::InvalidUsage("odd number of hex digits in bytea".into()));
    }
    digits
        .chunks_exact(2)
        .map(|pair| match (nibble(pair[0]), nibble(pair[1])) {
            (Some(hi), Some(lo)) => Ok(hi << 4 | lo),
            _ => Err(Error::InvalidUsage("invalid hex digit in bytea".into())),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_string_modes() {
        assert_eq!(escape_string(r"it's a\b", true), r"it''s a\b");
        assert_eq!(escape_string(r"it's a\b", false), r"it''s a\\b");
    }

    #[test]
    fn escape_literal_forms() {
        assert_eq!(escape_literal("O'Reilly"), "'O''Reilly'");
        assert_eq!(escape_literal(r"C:\tmp"), r" E'C:\\tmp'");
    }

    #[test]
    fn quote_ident_doubles_quotes() {
        assert_eq!(quote_ident(r#"my "table""#).unwrap(), r#""my ""table""""#);
    }

    #[test]
    fn quote_ident_length_limit() {
        assert!(quote_ident(&"a".repeat(63)).is_ok());
        assert!(matches!(
            quote_ident(&"a".repeat(64)),
            Err(Error::InvalidUsage(_))
        ));
    }

    #[test]
    fn bytea_hex_round_trip() {
        let data = [0u8, 1, 0x7f, 0xff, b'\\'];
        let text = escape_bytea(&data);
        assert_eq!(text, r"\x00017fff5c");
        assert_eq!(unescape_bytea(text.as_bytes()).unwrap(), data);
    }

    #[test]
    fn bytea_escape_format() {
        assert_eq!(
            unescape_bytea(br"a\000\\b\377").unwrap(),
            vec![b'a', 0, b'\\', b'b', 0xff]
        );
        assert!(unescape_bytea(br"\9").is_err());
    }

    #[test]
    fn bytea_bad_hex() {
        assert!(unescape_bytea(br"\x0").is_err());
        assert!(unescape_bytea(br"\xzz").is_err());
    }
}
