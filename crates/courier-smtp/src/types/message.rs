//! Message sources handed to the transaction engine.
//!
//! The engine never builds MIME itself. It asks a [`MessageSource`] whether
//! it carries 8-bit data, tells it which transfer encoding ceiling applies,
//! temporarily pulls the `Bcc` headers out of it and has it serialize itself.

use std::io;

use super::mime::{self, Reencoded};

/// Highest content transfer encoding the server will accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingCeiling {
    /// Only 7-bit data may be sent.
    SevenBit,
    /// 8-bit data may be sent (`BODY=8BITMIME`).
    EightBit,
}

/// A raw message whose header section cannot be represented faithfully.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    /// Header bytes that are not UTF-8 (RFC 6532).
    #[error("Header line {line} is not valid UTF-8")]
    NonUtf8Header {
        /// One-based line number.
        line: usize,
    },

    /// A header line with no field name, or a continuation with nothing to
    /// continue.
    #[error("Malformed header line {line}: {text:?}")]
    MalformedHeader {
        /// One-based line number.
        line: usize,
        /// The offending line.
        text: String,
    },
}

/// A header taken out of a message, remembered with its original position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedHeader {
    /// Index the header occupied before removal.
    pub position: usize,
    /// Header name as it appeared.
    pub name: String,
    /// Header value as it appeared.
    pub value: String,
}

/// Something the transaction engine can transmit.
pub trait MessageSource {
    /// Returns true if the content contains 8-bit data.
    fn has_8bit_parts(&self) -> bool;

    /// Re-encodes content so that nothing exceeds `ceiling` and no line is
    /// longer than the protocol allows.
    ///
    /// The change is made in place and is not undone after sending: a
    /// message sent to a server without 8BITMIME keeps its quoted-printable
    /// parts. Send a clone to keep the original.
    fn set_best_encoding(&mut self, ceiling: EncodingCeiling);

    /// Removes every header called `name` (case-insensitive) and returns
    /// them in their original order.
    fn remove_headers(&mut self, name: &str) -> Vec<RemovedHeader>;

    /// Puts back headers returned by [`MessageSource::remove_headers`].
    fn restore_headers(&mut self, removed: Vec<RemovedHeader>);

    /// Serializes the message.
    ///
    /// # Errors
    ///
    /// Returns an error if the writer fails.
    fn write_to(&self, out: &mut dyn io::Write) -> io::Result<()>;
}

/// A single header field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Field name.
    pub name: String,
    /// Field value, folded lines included.
    pub value: String,
}

/// A ready-to-send RFC 5322 message: an ordered header list and a body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    headers: Vec<Header>,
    body: Vec<u8>,
}

impl Message {
    /// Creates an empty message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a header, builder style.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_header(name, value);
        self
    }

    /// Sets the body, builder style.
    #[must_use]
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Appends a header.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push(Header {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Replaces every header called `name` with a single value.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .headers
            .iter()
            .position(|h| h.name.eq_ignore_ascii_case(name))
        {
            Some(first) => {
                self.headers[first].value = value;
                let mut index = 0;
                self.headers.retain(|h| {
                    let keep = index <= first || !h.name.eq_ignore_ascii_case(name);
                    index += 1;
                    keep
                });
            }
            None => self.add_header(name, value),
        }
    }

    /// Returns all headers in order.
    #[must_use]
    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// Returns every value of a header, in order.
    #[must_use]
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
            .collect()
    }

    /// Returns the body bytes.
    #[must_use]
    pub fn body_bytes(&self) -> &[u8] {
        &self.body
    }

    /// Parses a raw message. Folded header lines stay attached to their field.
    ///
    /// # Errors
    ///
    /// Returns a [`MessageError`] rather than alter a header section that is
    /// not UTF-8 or holds a line that is not a header field.
    pub fn parse(raw: &[u8]) -> Result<Self, MessageError> {
        let (head, _, body) = mime::split_head(raw);

        let mut headers: Vec<Header> = Vec::new();
        for (index, line) in head.split(|&b| b == b'\n').enumerate() {
            let number = index + 1;
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                continue;
            }
            let line = std::str::from_utf8(line)
                .map_err(|_| MessageError::NonUtf8Header { line: number })?;
            let malformed = || MessageError::MalformedHeader {
                line: number,
                text: line.to_string(),
            };

            if line.starts_with([' ', '\t']) {
                let last = headers.last_mut().ok_or_else(malformed)?;
                last.value.push_str("\r\n");
                last.value.push_str(line);
                continue;
            }
            match line.split_once(':') {
                Some((name, value)) if !name.trim().is_empty() => headers.push(Header {
                    name: name.trim_end().to_string(),
                    value: value.strip_prefix(' ').unwrap_or(value).to_string(),
                }),
                _ => return Err(malformed()),
            }
        }

        Ok(Self {
            headers,
            body: body.to_vec(),
        })
    }

    fn first_value(&self, name: &str) -> Option<&str> {
        self.header_values(name).first().copied()
    }
}

impl MessageSource for Message {
    fn has_8bit_parts(&self) -> bool {
        mime::contains_8bit(
            self.first_value("Content-Type"),
            self.first_value("Content-Transfer-Encoding"),
            &self.body,
        )
    }

    fn set_best_encoding(&mut self, ceiling: EncodingCeiling) {
        let content_type = self.first_value("Content-Type").map(ToString::to_string);
        let encoding = self
            .first_value("Content-Transfer-Encoding")
            .map(ToString::to_string);

        let outcome = mime::reencode(
            content_type.as_deref(),
            encoding.as_deref(),
            &mut self.body,
            ceiling,
        );
        if outcome != Reencoded::Unchanged {
            tracing::debug!(?ceiling, ?outcome, "re-encoded message body");
        }
        if let Reencoded::Relabelled(encoding) = outcome {
            self.set_header("Content-Transfer-Encoding", encoding);
        }
    }

    fn remove_headers(&mut self, name: &str) -> Vec<RemovedHeader> {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.headers.len());
        for (position, header) in self.headers.drain(..).enumerate() {
            if header.name.eq_ignore_ascii_case(name) {
                removed.push(RemovedHeader {
                    position,
                    name: header.name,
                    value: header.value,
                });
            } else {
                kept.push(header);
            }
        }
        self.headers = kept;
        removed
    }

    fn restore_headers(&mut self, mut removed: Vec<RemovedHeader>) {
        removed.sort_by_key(|h| h.position);
        for header in removed {
            let position = header.position.min(self.headers.len());
            self.headers.insert(
                position,
                Header {
                    name: header.name,
                    value: header.value,
                },
            );
        }
    }

    fn write_to(&self, out: &mut dyn io::Write) -> io::Result<()> {
        for header in &self.headers {
            write!(out, "{}: {}\r\n", header.name, header.value)?;
        }
        out.write_all(b"\r\n")?;
        out.write_all(&self.body)
    }
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

    fn sample() -> Message {
        Message::parse(
            b"From: a@example.com\r\nBcc: x@example.com\r\nTo: b@example.com\r\nBcc: y@example.com,\r\n z@example.com\r\nSubject: hi\r\n\r\nbody\r\n",
        )
        .unwrap()
    }

    #[test]
    fn test_parse_headers_and_body() {
        let msg = sample();
        assert_eq!(msg.headers().len(), 5);
        assert_eq!(msg.header_values("subject"), vec!["hi"]);
        assert_eq!(
            msg.header_values("Bcc"),
            vec!["x@example.com", "y@example.com,\r\n z@example.com"]
        );
        assert_eq!(msg.body_bytes(), b"body\r\n");
    }

    #[test]
    fn test_parse_bare_lf() {
        let msg = Message::parse(b"Subject: s\n\nline\n").unwrap();
        assert_eq!(msg.header_values("Subject"), vec!["s"]);
        assert_eq!(msg.body_bytes(), b"line\n");
    }

    #[test]
    fn test_remove_and_restore_is_identity() {
        let mut msg = sample();
        let before = msg.clone();

        let removed = msg.remove_headers("BCC");
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].value, "x@example.com");
        assert!(msg.header_values("Bcc").is_empty());

        msg.restore_headers(removed);
        assert_eq!(msg, before);
    }

    #[test]
    fn test_write_to() {
        let msg = Message::new()
            .header("Subject", "hello")
            .body("hi\r\n");
        let mut out = Vec::new();
        msg.write_to(&mut out).unwrap();
        assert_eq!(out, b"Subject: hello\r\n\r\nhi\r\n");
    }

    #[test]
    fn test_8bit_detection() {
        let plain = Message::new().body("plain ascii");
        assert!(!plain.has_8bit_parts());

        let utf8 = Message::new().body("caf\u{e9}");
        assert!(utf8.has_8bit_parts());

        let encoded = Message::new()
            .header("Content-Transfer-Encoding", "base64")
            .body("Y2Fmw6k=");
        assert!(!encoded.has_8bit_parts());
    }

    #[test]
    fn test_seven_bit_ceiling_reencodes() {
        let mut msg = Message::new()
            .header("Content-Transfer-Encoding", "8bit")
            .body("caf\u{e9}\r\nsecond line \r\n");
        msg.set_best_encoding(EncodingCeiling::SevenBit);

        assert_eq!(
            msg.header_values("Content-Transfer-Encoding"),
            vec!["quoted-printable"]
        );
        assert_eq!(msg.body_bytes(), b"caf=C3=A9\r\nsecond line=20\r\n");
        assert!(!msg.has_8bit_parts());
    }

    #[test]
    fn test_eight_bit_ceiling_keeps_body() {
        let mut msg = Message::new().body("caf\u{e9}\r\n");
        msg.set_best_encoding(EncodingCeiling::EightBit);
        assert_eq!(msg.body_bytes(), "caf\u{e9}\r\n".as_bytes());
        assert!(msg.header_values("Content-Transfer-Encoding").is_empty());
    }

    #[test]
    fn test_long_lines_are_wrapped() {
        let mut msg = Message::new().body("a".repeat(2000));
        msg.set_best_encoding(EncodingCeiling::EightBit);
        for line in msg.body_bytes().split(|&b| b == b'\n') {
            assert!(line.len() <= 77);
        }
    }

    #[test]
    fn test_set_header_replaces_all() {
        let mut msg = Message::new()
            .header("X-A", "1")
            .header("X-B", "2")
            .header("x-a", "3");
        msg.set_header("X-A", "9");
        assert_eq!(msg.header_values("X-A"), vec!["9"]);
        assert_eq!(msg.headers()[1].name, "X-B");
    }

    #[test]
    fn test_parse_rejects_what_it_cannot_keep() {
        assert_eq!(
            Message::parse(b"Subject: caf\xe9\r\n\r\nbody").unwrap_err(),
            MessageError::NonUtf8Header { line: 1 }
        );
        assert_eq!(
            Message::parse(b"From: a@example.com\r\nnot a header\r\n\r\nbody").unwrap_err(),
            MessageError::MalformedHeader {
                line: 2,
                text: "not a header".to_string()
            }
        );
        assert!(matches!(
            Message::parse(b" orphan\r\nSubject: s\r\n\r\n"),
            Err(MessageError::MalformedHeader { line: 1, .. })
        ));
    }

    #[test]
    fn test_parse_headers_only() {
        let msg = Message::parse(b"Subject: s\r\n").unwrap();
        assert_eq!(msg.header_values("Subject"), vec!["s"]);
        assert!(msg.body_bytes().is_empty());

        let msg = Message::parse(b"\r\nbody only").unwrap();
        assert!(msg.headers().is_empty());
        assert_eq!(msg.body_bytes(), b"body only");
    }

    #[test]
    fn test_multipart_downgrade_keeps_boundaries() {
        let raw = "Subject: attached\r\n\
                   MIME-Version: 1.0\r\n\
                   Content-Type: multipart/mixed; boundary=\"=_b1\"\r\n\
                   \r\n\
                   --=_b1\r\n\
                   Content-Type: text/plain; charset=utf-8\r\n\
                   \r\n\
                   caf\u{e9}\r\n\
                   --=_b1\r\n\
                   Content-Type: application/pdf\r\n\
                   Content-Transfer-Encoding: base64\r\n\
                   \r\n\
                   JVBERi0=\r\n\
                   --=_b1--\r\n";
        let mut msg = Message::parse(raw.as_bytes()).unwrap();
        assert!(msg.has_8bit_parts());

        msg.set_best_encoding(EncodingCeiling::SevenBit);
        assert!(!msg.has_8bit_parts());
        assert!(msg.header_values("Content-Transfer-Encoding").is_empty());

        let mut out = Vec::new();
        msg.write_to(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("\r\n--=_b1\r\nContent-Type: text/plain; charset=utf-8\r\n"));
        assert!(text.contains(
            "Content-Transfer-Encoding: quoted-printable\r\n\r\ncaf=C3=A9\r\n--=_b1\r\n"
        ));
        assert!(text.contains("\r\nJVBERi0=\r\n--=_b1--\r\n"));
        assert!(!text.contains("=3D_b1"));
    }

    #[test]
    fn test_multipart_with_8bit_label_is_relabelled() {
        let mut msg = Message::new()
            .header("Content-Type", "multipart/alternative; boundary=alt")
            .header("Content-Transfer-Encoding", "8bit")
            .body("--alt\r\nContent-Type: text/plain\r\n\r\n\u{e9}t\u{e9}\r\n--alt--\r\n");
        msg.set_best_encoding(EncodingCeiling::SevenBit);

        assert_eq!(msg.header_values("Content-Transfer-Encoding"), vec!["7bit"]);
        assert!(msg.body_bytes().starts_with(b"--alt\r\n"));
        assert!(msg.body_bytes().is_ascii());
    }
}
