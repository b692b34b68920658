//! Enhanced status codes (RFC 2034) and xtext (RFC 3461).

use std::fmt;
use std::fmt::Write as _;

use crate::types::Reply;

/// An RFC 3463 `class.subject.detail` status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnhancedStatus {
    /// Class digit (2, 4 or 5).
    pub class: u8,
    /// Subject number.
    pub subject: u16,
    /// Detail number.
    pub detail: u16,
}

impl EnhancedStatus {
    /// Parses a token such as `5.7.1`.
    #[must_use]
    pub fn parse(token: &str) -> Option<Self> {
        let mut parts = token.split('.');
        let class = parts.next()?;
        let subject = parts.next()?;
        let detail = parts.next()?;
        if parts.next().is_some() {
            return None;
        }

        let class: u8 = class.parse().ok()?;
        if !matches!(class, 2 | 4 | 5) || !all_digits(subject) || !all_digits(detail) {
            return None;
        }

        Some(Self {
            class,
            subject: subject.parse().ok()?,
            detail: detail.parse().ok()?,
        })
    }
}

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.len() <= 3 && s.bytes().all(|b| b.is_ascii_digit())
}

impl fmt::Display for EnhancedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// Decodes xtext: `+XX` becomes the byte `0xXX`, everything else is copied.
///
/// A `+` not followed by two hex digits is kept as is.
#[must_use]
pub fn decode_xtext(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'+' {
            if let (Some(hi), Some(lo)) = (
                input.get(i + 1).and_then(|&b| hex_value(b)),
                input.get(i + 2).and_then(|&b| hex_value(b)),
            ) {
                out.push(hi * 16 + lo);
                i += 3;
                continue;
            }
        }
        out.push(input[i]);
        i += 1;
    }
    out
}

/// Encodes bytes as xtext.
#[must_use]
pub fn encode_xtext(input: &[u8]) -> String {
    let mut out = String::with_capacity(input.len());
    for &byte in input {
        if (33..=126).contains(&byte) && byte != b'+' && byte != b'=' {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "+{byte:02X}");
        }
    }
    out
}

fn hex_value(byte: u8) -> Option<u8> {
    char::from(byte)
        .to_digit(16)
        .and_then(|d| u8::try_from(d).ok())
}

/// Fixed description for a reply code, used when the server sent nothing
/// better.
#[must_use]
pub const fn fallback_text(code: Option<u16>) -> &'static str {
    let Some(code) = code else {
        return "No response from server";
    };
    match code {
        211 => "System status, or system help reply",
        214 => "Help message",
        220 => "Service ready",
        221 => "Service closing transmission channel",
        250 => "Requested mail action okay, completed",
        251 => "User not local; will forward to <forward-path>",
        354 => "Start mail input; end with <CRLF>.<CRLF>",
        421 => "Service not available, closing transmission channel",
        432 => "A password transition is needed",
        450 => "Requested mail action not taken: mailbox unavailable",
        451 => "Requested action aborted: error in processing",
        452 => "Requested action not taken: insufficient system storage",
        454 => "Temporary authentication failure",
        500 => "Syntax error, command unrecognized",
        501 => "Syntax error in parameters or arguments",
        502 => "Command not implemented",
        504 => "Command parameter not implemented",
        530 => "Authentication required",
        532 => "Encryption required for requested mail action",
        534 => "Authentication mechanism is too weak",
        535 => "Authentication credentials invalid",
        538 => "Encryption required for requested authentication mechanism",
        550 => "Requested action not taken: mailbox unavailable",
        551 => "User not local; please try <forward-path>",
        552 => "Requested mail action aborted: exceeded storage allocation",
        553 => "Requested action not taken: mailbox name not allowed",
        554 => "Transaction failed",
        _ => "Unknown",
    }
}

/// Produces the human-readable text of a failed reply.
///
/// With `enhanced` set, every line must start with an enhanced status code
/// followed by text; the texts are joined and xtext-decoded. Anything else
/// falls back to [`fallback_text`].
#[must_use]
pub fn describe(reply: &Reply, enhanced: bool) -> String {
    if enhanced {
        if let Some(text) = enhanced_text(reply) {
            return text;
        }
    }
    fallback_text(reply.code_u16()).to_string()
}

fn enhanced_text(reply: &Reply) -> Option<String> {
    if reply.message.is_empty() {
        return None;
    }

    let mut parts = Vec::with_capacity(reply.message.len());
    for line in &reply.message {
        let line = line.trim_start();
        let (token, rest) = line.split_once(char::is_whitespace)?;
        EnhancedStatus::parse(token)?;
        let rest = rest.trim_start();
        if rest.is_empty() {
            return None;
        }
        parts.push(rest);
    }

    String::from_utf8(decode_xtext(parts.join(" ").as_bytes())).ok()
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use crate::types::ReplyCode;
    use proptest::prelude::*;

    fn reply(code: u16, lines: &[&str]) -> Reply {
        Reply::new(
            Some(ReplyCode::new(code)),
            lines.iter().map(ToString::to_string).collect(),
        )
    }

    #[test]
    fn test_parse_enhanced_status() {
        let status = EnhancedStatus::parse("5.7.1").unwrap();
        assert_eq!(status.class, 5);
        assert_eq!(status.subject, 7);
        assert_eq!(status.detail, 1);
        assert_eq!(status.to_string(), "5.7.1");

        assert!(EnhancedStatus::parse("3.1.1").is_none());
        assert!(EnhancedStatus::parse("5.1").is_none());
        assert!(EnhancedStatus::parse("5.1.1.1").is_none());
        assert!(EnhancedStatus::parse("mailbox").is_none());
    }

    #[test]
    fn test_decode_xtext() {
        assert_eq!(decode_xtext(b"a+2Bb"), b"a+b");
        assert_eq!(decode_xtext(b"+3d"), b"=");
        assert_eq!(decode_xtext(b"trailing+"), b"trailing+");
        assert_eq!(decode_xtext(b"+ZZ"), b"+ZZ");
    }

    #[test]
    fn test_encode_xtext() {
        assert_eq!(encode_xtext(b"a+b=c d"), "a+2Bb+3Dc+20d");
    }

    #[test]
    fn test_describe_enhanced() {
        let r = reply(550, &["5.1.1 <bob@example.com>: Recipient+20address rejected"]);
        assert_eq!(
            describe(&r, true),
            "<bob@example.com>: Recipient address rejected"
        );
    }

    #[test]
    fn test_describe_joins_lines() {
        let r = reply(554, &["5.7.1 Message rejected", "5.7.1 see policy"]);
        assert_eq!(describe(&r, true), "Message rejected see policy");
    }

    #[test]
    fn test_describe_falls_back_without_enhanced_code() {
        let r = reply(550, &["mailbox unavailable"]);
        assert_eq!(
            describe(&r, true),
            "Requested action not taken: mailbox unavailable"
        );
    }

    #[test]
    fn test_describe_ignores_text_when_not_enhanced() {
        let r = reply(550, &["5.1.1 No such user"]);
        assert_eq!(describe(&r, false), fallback_text(Some(550)));
    }

    #[test]
    fn test_describe_bad_utf8_falls_back() {
        let r = reply(554, &["5.0.0 +FF+FE"]);
        assert_eq!(describe(&r, true), "Transaction failed");
    }

    #[test]
    fn test_fallback_table() {
        assert_eq!(fallback_text(Some(221)), "Service closing transmission channel");
        assert_eq!(fallback_text(Some(999)), "Unknown");
        assert_eq!(fallback_text(None), "No response from server");
    }

    proptest! {
        #[test]
        fn xtext_roundtrip(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let encoded = encode_xtext(&bytes);
            prop_assert!(encoded.is_ascii());
            prop_assert_eq!(decode_xtext(encoded.as_bytes()), bytes);
        }
    }
}
