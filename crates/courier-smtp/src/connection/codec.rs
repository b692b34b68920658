//! DATA transparency: line ending normalization and dot-stuffing.

use std::io::{self, Write};

/// Writer that makes message bytes safe to send after `DATA`.
///
/// Bare LF becomes CRLF and a `.` at the start of a line is doubled
/// (RFC 5321 section 4.5.2). State carries across `write` calls, so the
/// message may be fed in arbitrary chunks.
#[derive(Debug)]
pub struct DotStuffer<W> {
    inner: W,
    at_line_start: bool,
    prev_cr: bool,
    written: bool,
}

impl<W: Write> DotStuffer<W> {
    /// Wraps `inner`.
    pub const fn new(inner: W) -> Self {
        Self {
            inner,
            at_line_start: true,
            prev_cr: false,
            written: false,
        }
    }

    /// Bytes that end the DATA phase after what has been written so far.
    #[must_use]
    pub const fn terminator(&self) -> &'static [u8] {
        if self.written && self.at_line_start {
            b".\r\n"
        } else {
            b"\r\n.\r\n"
        }
    }

    /// Returns the inner writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for DotStuffer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = Vec::with_capacity(buf.len() + buf.len() / 64 + 2);
        for &byte in buf {
            match byte {
                b'\n' => {
                    if !self.prev_cr {
                        out.push(b'\r');
                    }
                    out.push(b'\n');
                    self.at_line_start = true;
                    self.prev_cr = false;
                }
                b'\r' => {
                    out.push(b'\r');
                    self.at_line_start = false;
                    self.prev_cr = true;
                }
                b'.' if self.at_line_start => {
                    out.extend_from_slice(b"..");
                    self.at_line_start = false;
                    self.prev_cr = false;
                }
                _ => {
                    out.push(byte);
                    self.at_line_start = false;
                    self.prev_cr = false;
                }
            }
        }
        if !buf.is_empty() {
            self.written = true;
        }
        self.inner.write_all(&out)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
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

    fn stuff(chunks: &[&[u8]]) -> (Vec<u8>, &'static [u8]) {
        let mut stuffer = DotStuffer::new(Vec::new());
        for chunk in chunks {
            stuffer.write_all(chunk).unwrap();
        }
        let terminator = stuffer.terminator();
        (stuffer.into_inner(), terminator)
    }

    #[test]
    fn test_leading_dots_are_doubled() {
        let (out, _) = stuff(&[b".hidden\r\nok\r\n..two\r\n"]);
        assert_eq!(out, b"..hidden\r\nok\r\n...two\r\n");
    }

    #[test]
    fn test_inner_dots_untouched() {
        let (out, _) = stuff(&[b"a.b\r\nend.\r\n"]);
        assert_eq!(out, b"a.b\r\nend.\r\n");
    }

    #[test]
    fn test_bare_lf_becomes_crlf() {
        let (out, _) = stuff(&[b"one\ntwo\r\nthree\n"]);
        assert_eq!(out, b"one\r\ntwo\r\nthree\r\n");
    }

    #[test]
    fn test_state_spans_chunks() {
        let (out, _) = stuff(&[b"line\r", b"\n", b".dot\n", b"x"]);
        assert_eq!(out, b"line\r\n..dot\r\nx");
    }

    #[test]
    fn test_lone_dot_line() {
        let (out, _) = stuff(&[b"a\r\n.\r\nb\r\n"]);
        assert_eq!(out, b"a\r\n..\r\nb\r\n");
    }

    #[test]
    fn test_terminator() {
        assert_eq!(stuff(&[b"body\r\n"]).1, b".\r\n");
        assert_eq!(stuff(&[b"body\n"]).1, b".\r\n");
        assert_eq!(stuff(&[b"body"]).1, b"\r\n.\r\n");
        assert_eq!(stuff(&[]).1, b"\r\n.\r\n");
    }
}
