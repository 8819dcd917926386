//! Byte formatting helpers used by the packet capture.
//!
//! All functions are stateless. The hex form is what ends up in capture
//! exports and log lines; [`hex_decode`] reads it back (and the looser forms
//! people type on a command line).

use crate::error::ParseError;

/// Encode bytes as lowercase, space separated hex (`"01 ff 42"`).
pub fn hex_encode(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Encode bytes as printable ASCII (non-printable as dots).
///
/// Only 0x20..=0x7E are kept verbatim.
pub fn ascii_encode(data: &[u8]) -> String {
    data.iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}

/// Decode a hex string into bytes.
///
/// Accepts tokens separated by whitespace, `,` or `:`; each token may carry
/// a `0x` prefix and may hold several bytes (`"0104"`). Every token must have
/// an even number of digits.
pub fn hex_decode(text: &str) -> Result<Vec<u8>, ParseError> {
    let mut bytes = Vec::new();

    for (start, token) in tokens(text) {
        let (offset, digits) = match token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
        {
            Some(rest) => (2, rest),
            None => (0, token),
        };
        if digits.is_empty() || digits.len() % 2 != 0 {
            return Err(ParseError::InvalidHex {
                position: start,
                message: format!("odd number of digits in '{}'", token),
            });
        }
        for (i, pair) in digits.as_bytes().chunks(2).enumerate() {
            let hi = hex_value(pair[0]);
            let lo = hex_value(pair[1]);
            match (hi, lo) {
                (Some(hi), Some(lo)) => bytes.push((hi << 4) | lo),
                _ => {
                    return Err(ParseError::InvalidHex {
                        position: start + offset + i * 2,
                        message: format!("not a hex digit in '{}'", token),
                    })
                }
            }
        }
    }

    Ok(bytes)
}

fn tokens(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let is_sep = |c: char| c.is_whitespace() || c == ',' || c == ':';
    let mut rest = text;
    let mut consumed = 0;
    std::iter::from_fn(move || {
        let trimmed = rest.trim_start_matches(is_sep);
        consumed += rest.len() - trimmed.len();
        if trimmed.is_empty() {
            return None;
        }
        let end = trimmed.find(is_sep).unwrap_or(trimmed.len());
        let start = consumed;
        let token = &trimmed[..end];
        rest = &trimmed[end..];
        consumed += end;
        Some((start, token))
    })
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}
