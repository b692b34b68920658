//! SMTP response parser.

pub mod status;

use crate::connection::LineChannel;
use crate::error::TransportError;
use crate::types::{Reply, ReplyCode, ReplyLine};

/// Parses one reply line.
///
/// SMTP replies can be single-line or multi-line:
/// - Single: `250 OK\r\n`
/// - Multi: `250-First line\r\n250-Second line\r\n250 Last line\r\n`
///
/// A line that does not start with three digits gets no code and is treated
/// as final, so a misbehaving server cannot keep the reader looping.
#[must_use]
pub fn parse_line(line: &str) -> ReplyLine {
    let bytes = line.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
        return ReplyLine {
            code: None,
            is_continuation: false,
            text: line.to_string(),
        };
    }

    let code = line[..3].parse::<u16>().ok().map(ReplyCode::new);
    let (is_continuation, text) = match bytes.get(3) {
        Some(b'-') => (true, &line[4..]),
        Some(b' ') => (false, &line[4..]),
        Some(_) => (false, &line[3..]),
        None => (false, ""),
    };

    ReplyLine {
        code,
        is_continuation,
        text: text.to_string(),
    }
}

/// Checks if a line is the last line of a multi-line reply.
///
/// Multi-line replies use `-` separator for continuation and ` ` for the last line.
#[must_use]
pub fn is_last_reply_line(line: &str) -> bool {
    !parse_line(line).is_continuation
}

/// Assembles parsed lines into a reply. The code is taken from the final line.
#[must_use]
pub fn parse_reply(lines: &[ReplyLine]) -> Reply {
    Reply::new(
        lines.last().and_then(|l| l.code),
        lines.iter().map(|l| l.text.clone()).collect(),
    )
}

/// Reads every line of one reply.
///
/// # Errors
///
/// Returns an error if the channel fails before the final line.
pub async fn read_reply_lines<C>(channel: &mut C) -> Result<Vec<ReplyLine>, TransportError>
where
    C: LineChannel + ?Sized,
{
    let mut lines = Vec::new();
    loop {
        let line = channel.read_line().await?;
        if line.is_empty() {
            continue;
        }
        tracing::trace!(response = %line, "S:");

        let parsed = parse_line(&line);
        let done = !parsed.is_continuation;
        lines.push(parsed);
        if done {
            return Ok(lines);
        }
    }
}

/// Reads one complete reply.
///
/// # Errors
///
/// Returns an error if the channel fails before the final line.
pub async fn read_reply<C>(channel: &mut C) -> Result<Reply, TransportError>
where
    C: LineChannel + ?Sized,
{
    let lines = read_reply_lines(channel).await?;
    Ok(parse_reply(&lines))
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

    fn parse_all(lines: &[&str]) -> Reply {
        let parsed: Vec<_> = lines.iter().map(|l| parse_line(l)).collect();
        parse_reply(&parsed)
    }

    #[test]
    fn test_parse_single_line_reply() {
        let reply = parse_all(&["250 OK"]);
        assert_eq!(reply.code_u16(), Some(250));
        assert_eq!(reply.message, vec!["OK"]);
        assert!(reply.is_success());
    }

    #[test]
    fn test_parse_multi_line_reply() {
        let reply = parse_all(&["250-First line", "250-Second line", "250 Last line"]);
        assert_eq!(reply.code_u16(), Some(250));
        assert_eq!(
            reply.message,
            vec!["First line", "Second line", "Last line"]
        );
    }

    #[test]
    fn test_parse_greeting() {
        let reply = parse_all(&["220 smtp.example.com ESMTP ready"]);
        assert_eq!(reply.code_u16(), Some(220));
        assert_eq!(reply.message, vec!["smtp.example.com ESMTP ready"]);
    }

    #[test]
    fn test_continuation_flag() {
        assert!(parse_line("250-8BITMIME").is_continuation);
        assert!(!parse_line("250 OK").is_continuation);
        assert!(!parse_line("250").is_continuation);
        assert_eq!(parse_line("250").text, "");
    }

    #[test]
    fn test_is_last_reply_line() {
        assert!(is_last_reply_line("250 OK"));
        assert!(!is_last_reply_line("250-Continuing"));
        assert!(is_last_reply_line("250"));
    }

    #[test]
    fn test_malformed_lines_have_no_code() {
        for line in ["", "25", "ABC OK", "2x0 hi", "\u{e9}\u{e9}\u{e9}"] {
            let parsed = parse_line(line);
            assert_eq!(parsed.code, None, "{line:?}");
            assert!(!parsed.is_continuation);
        }
    }

    #[test]
    fn test_missing_separator() {
        let parsed = parse_line("250OK");
        assert_eq!(parsed.code, Some(ReplyCode::OK));
        assert_eq!(parsed.text, "OK");
    }

    #[test]
    fn test_empty_reply() {
        let reply = parse_reply(&[]);
        assert_eq!(reply.code, None);
        assert!(reply.message.is_empty());
    }
}
