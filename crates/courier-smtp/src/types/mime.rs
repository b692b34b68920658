//! Just enough MIME structure to re-encode leaf parts in place.
//!
//! Composite entities (`multipart/*`, `message/rfc822`) are never given a
//! transfer encoding of their own (RFC 2045 section 6.4). Their boundaries,
//! preambles and part headers are copied through untouched; only the leaves
//! that need it are rewritten.

use std::fmt::Write as _;

use super::message::EncodingCeiling;

/// Maximum line length allowed by RFC 5322, excluding CRLF.
const MAX_LINE_OCTETS: usize = 998;

/// Maximum line length for Quoted-Printable encoding.
const QP_LINE_LENGTH: usize = 76;

/// Nesting depth past which an entity is treated as opaque.
const MAX_NESTING: usize = 32;

/// Media type and the `boundary` parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ContentType {
    main_type: String,
    sub_type: String,
    boundary: Option<String>,
}

impl ContentType {
    /// Parses a `Content-Type` value. Returns `None` without a `type/subtype`.
    pub(crate) fn parse(value: &str) -> Option<Self> {
        let mut params = value.split(';');
        let (main_type, sub_type) = params.next()?.trim().split_once('/')?;
        let boundary = params
            .filter_map(|param| param.split_once('='))
            .find(|(key, _)| key.trim().eq_ignore_ascii_case("boundary"))
            .map(|(_, value)| value.trim().trim_matches('"').to_string())
            .filter(|boundary| !boundary.is_empty());

        Some(Self {
            main_type: main_type.trim().to_ascii_lowercase(),
            sub_type: sub_type.trim().to_ascii_lowercase(),
            boundary,
        })
    }

    pub(crate) fn is_multipart(&self) -> bool {
        self.main_type == "multipart"
    }

    /// `message/rfc822` and `message/global` wrap a complete message.
    pub(crate) fn is_message(&self) -> bool {
        self.main_type == "message" && matches!(self.sub_type.as_str(), "rfc822" | "global")
    }

    pub(crate) fn boundary(&self) -> Option<&str> {
        self.boundary.as_deref()
    }
}

/// What re-encoding did to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reencoded {
    /// Nothing changed.
    Unchanged,
    /// The body changed, the entity's own headers stay valid.
    Body,
    /// The body may have changed and `Content-Transfer-Encoding` must now
    /// read as given.
    Relabelled(&'static str),
}

/// Returns true if the entity, or anything nested in it, holds raw 8-bit data.
pub(crate) fn contains_8bit(
    content_type: Option<&str>,
    encoding: Option<&str>,
    body: &[u8],
) -> bool {
    contains_8bit_at(content_type, encoding, body, 0)
}

fn contains_8bit_at(
    content_type: Option<&str>,
    encoding: Option<&str>,
    body: &[u8],
    depth: usize,
) -> bool {
    match Shape::of(content_type, body, depth) {
        Shape::Multipart(multipart) => multipart.contains_8bit(depth),
        Shape::Message(part) => part.contains_8bit(depth + 1),
        Shape::Leaf => !is_transfer_encoded(encoding) && !body.is_ascii(),
    }
}

/// Rewrites `body` so that nothing in it exceeds `ceiling` and no line is
/// too long. Leaves that need it become quoted-printable.
pub(crate) fn reencode(
    content_type: Option<&str>,
    encoding: Option<&str>,
    body: &mut Vec<u8>,
    ceiling: EncodingCeiling,
) -> Reencoded {
    reencode_at(content_type, encoding, body, ceiling, 0)
}

fn reencode_at(
    content_type: Option<&str>,
    encoding: Option<&str>,
    body: &mut Vec<u8>,
    ceiling: EncodingCeiling,
    depth: usize,
) -> Reencoded {
    let rebuilt = match Shape::of(content_type, body, depth) {
        Shape::Multipart(multipart) => Some(multipart.reencode(ceiling, depth)),
        Shape::Message(part) => Some(part.reencode(ceiling, depth + 1)),
        Shape::Leaf => None,
    };
    let Some(rebuilt) = rebuilt else {
        return reencode_leaf(encoding, body, ceiling);
    };

    let changed = rebuilt.is_some();
    if let Some(bytes) = rebuilt {
        *body = bytes;
    }

    let declared_8bit = matches!(normalized(encoding).as_deref(), Some("8bit" | "binary"));
    if ceiling == EncodingCeiling::SevenBit && declared_8bit {
        Reencoded::Relabelled("7bit")
    } else if changed {
        Reencoded::Body
    } else {
        Reencoded::Unchanged
    }
}

fn reencode_leaf(
    encoding: Option<&str>,
    body: &mut Vec<u8>,
    ceiling: EncodingCeiling,
) -> Reencoded {
    if is_transfer_encoded(encoding) || !needs_reencoding(body, ceiling) {
        return Reencoded::Unchanged;
    }
    *body = encode_quoted_printable(body).into_bytes();
    Reencoded::Relabelled("quoted-printable")
}

fn needs_reencoding(bytes: &[u8], ceiling: EncodingCeiling) -> bool {
    (ceiling == EncodingCeiling::SevenBit && !bytes.is_ascii()) || has_long_lines(bytes)
}

fn normalized(encoding: Option<&str>) -> Option<String> {
    encoding.map(|value| value.trim().to_ascii_lowercase())
}

fn is_transfer_encoded(encoding: Option<&str>) -> bool {
    matches!(
        normalized(encoding).as_deref(),
        Some("base64" | "quoted-printable")
    )
}

fn has_long_lines(bytes: &[u8]) -> bool {
    bytes
        .split(|&b| b == b'\n')
        .any(|line| line.strip_suffix(b"\r").unwrap_or(line).len() > MAX_LINE_OCTETS)
}

/// How an entity's body is laid out.
enum Shape<'a> {
    Multipart(Multipart<'a>),
    Message(Part<'a>),
    Leaf,
}

impl<'a> Shape<'a> {
    fn of(content_type: Option<&str>, body: &'a [u8], depth: usize) -> Self {
        if depth >= MAX_NESTING {
            return Self::Leaf;
        }
        match content_type.and_then(ContentType::parse) {
            Some(ct) if ct.is_multipart() => ct
                .boundary()
                .and_then(|boundary| Multipart::split(body, boundary))
                .map_or(Self::Leaf, Self::Multipart),
            Some(ct) if ct.is_message() => Self::Message(Part::parse(body)),
            _ => Self::Leaf,
        }
    }
}

/// A multipart body cut at its delimiter lines. Every slice borrows the body,
/// so concatenating them in order gives it back byte for byte.
struct Multipart<'a> {
    preamble: &'a [u8],
    /// Delimiter line (with its line ending) and the part that follows it.
    parts: Vec<(&'a [u8], &'a [u8])>,
    close_line: &'a [u8],
    epilogue: &'a [u8],
}

impl<'a> Multipart<'a> {
    /// Returns `None` if no delimiter line for `boundary` is present.
    fn split(body: &'a [u8], boundary: &str) -> Option<Self> {
        let delimiter = format!("--{boundary}");
        let delimiter = delimiter.as_bytes();

        let mut preamble_end = None;
        let mut parts = Vec::new();
        let mut open: Option<(usize, usize)> = None;
        let mut offset = 0;

        for line in body.split_inclusive(|&b| b == b'\n') {
            let start = offset;
            offset += line.len();

            let Some(rest) = line.trim_ascii_end().strip_prefix(delimiter) else {
                continue;
            };
            let closing = match rest {
                b"" => false,
                b"--" => true,
                _ => continue,
            };

            match open.take() {
                Some((line_start, content_start)) => {
                    parts.push((&body[line_start..content_start], &body[content_start..start]));
                }
                None => preamble_end = Some(start),
            }

            if closing {
                return Some(Self {
                    preamble: &body[..preamble_end?],
                    parts,
                    close_line: &body[start..offset],
                    epilogue: &body[offset..],
                });
            }
            open = Some((start, offset));
        }

        // Truncated: the last part runs to the end of the body.
        let (line_start, content_start) = open?;
        parts.push((&body[line_start..content_start], &body[content_start..]));
        Some(Self {
            preamble: &body[..preamble_end?],
            parts,
            close_line: &[],
            epilogue: &[],
        })
    }

    fn contains_8bit(&self, depth: usize) -> bool {
        !self.preamble.is_ascii()
            || !self.epilogue.is_ascii()
            || self
                .parts
                .iter()
                .any(|(_, content)| Part::parse(content).contains_8bit(depth + 1))
    }

    /// Returns the rebuilt body, or `None` if nothing had to change.
    fn reencode(&self, ceiling: EncodingCeiling, depth: usize) -> Option<Vec<u8>> {
        let mut changed = false;
        let mut out = Vec::new();

        out.extend_from_slice(&reencode_filler(self.preamble, ceiling, &mut changed));
        for (delimiter, content) in &self.parts {
            out.extend_from_slice(delimiter);
            match Part::parse(content).reencode(ceiling, depth + 1) {
                Some(bytes) => {
                    changed = true;
                    out.extend_from_slice(&bytes);
                }
                None => out.extend_from_slice(content),
            }
        }
        out.extend_from_slice(self.close_line);
        out.extend_from_slice(&reencode_filler(self.epilogue, ceiling, &mut changed));

        changed.then_some(out)
    }
}

/// Preamble and epilogue text is ignored by readers but still travels.
fn reencode_filler(bytes: &[u8], ceiling: EncodingCeiling, changed: &mut bool) -> Vec<u8> {
    if needs_reencoding(bytes, ceiling) {
        *changed = true;
        encode_quoted_printable(bytes).into_bytes()
    } else {
        bytes.to_vec()
    }
}

/// A body part or embedded message: raw header fields and a body.
struct Part<'a> {
    /// Header block and blank line exactly as received.
    head: &'a [u8],
    /// Header fields, folded lines included, without their final line ending.
    fields: Vec<&'a [u8]>,
    body: &'a [u8],
}

impl<'a> Part<'a> {
    fn parse(raw: &'a [u8]) -> Self {
        let (head, separator, body) = split_head(raw);
        Self {
            head: &raw[..head.len() + separator.len()],
            fields: fields(head),
            body,
        }
    }

    /// First value of the field called `name`, unfolded.
    fn field(&self, name: &str) -> Option<String> {
        self.fields.iter().find_map(|field| {
            let (field_name, value) = split_field(field)?;
            field_name
                .eq_ignore_ascii_case(name.as_bytes())
                .then(|| String::from_utf8_lossy(value).trim().to_string())
        })
    }

    fn contains_8bit(&self, depth: usize) -> bool {
        let content_type = self.field("Content-Type");
        let encoding = self.field("Content-Transfer-Encoding");
        contains_8bit_at(content_type.as_deref(), encoding.as_deref(), self.body, depth)
    }

    fn reencode(&self, ceiling: EncodingCeiling, depth: usize) -> Option<Vec<u8>> {
        let content_type = self.field("Content-Type");
        let encoding = self.field("Content-Transfer-Encoding");
        let mut body = self.body.to_vec();

        match reencode_at(
            content_type.as_deref(),
            encoding.as_deref(),
            &mut body,
            ceiling,
            depth,
        ) {
            Reencoded::Unchanged => None,
            Reencoded::Body => {
                let mut out = self.head.to_vec();
                out.extend_from_slice(&body);
                Some(out)
            }
            Reencoded::Relabelled(encoding) => Some(self.relabelled(encoding, &body)),
        }
    }

    /// Writes the part back with `Content-Transfer-Encoding: encoding`.
    fn relabelled(&self, encoding: &str, body: &[u8]) -> Vec<u8> {
        let label = format!("Content-Transfer-Encoding: {encoding}");
        let mut out = Vec::with_capacity(self.head.len() + body.len() + label.len() + 4);
        let mut labelled = false;

        for field in &self.fields {
            let is_encoding = split_field(field).is_some_and(|(name, _)| {
                name.eq_ignore_ascii_case(b"Content-Transfer-Encoding")
            });
            if !is_encoding {
                out.extend_from_slice(field);
            } else if !labelled {
                out.extend_from_slice(label.as_bytes());
                labelled = true;
            } else {
                continue;
            }
            out.extend_from_slice(b"\r\n");
        }
        if !labelled {
            out.extend_from_slice(label.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(body);
        out
    }
}

/// Splits a header field into its trimmed name and raw value.
fn split_field(field: &[u8]) -> Option<(&[u8], &[u8])> {
    let colon = field.iter().position(|&b| b == b':')?;
    Some((field[..colon].trim_ascii(), &field[colon + 1..]))
}

/// Cuts a header block into fields. Continuation lines stay with their field.
fn fields(head: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut offset = 0;
    for line in head.split_inclusive(|&b| b == b'\n') {
        let continuation = line.starts_with(b" ") || line.starts_with(b"\t");
        if !continuation || starts.is_empty() {
            starts.push(offset);
        }
        offset += line.len();
    }

    starts
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let end = starts.get(i + 1).copied().unwrap_or(head.len());
            strip_line_end(&head[start..end])
        })
        .filter(|field| !field.is_empty())
        .collect()
}

fn strip_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Splits raw entity bytes into header block, blank line and body.
///
/// The header block excludes the line ending of its last field. Without a
/// blank line everything is header.
pub(crate) fn split_head(raw: &[u8]) -> (&[u8], &[u8], &[u8]) {
    for separator in [&b"\r\n"[..], &b"\n"[..]] {
        if raw.starts_with(separator) {
            return (&[], separator, &raw[separator.len()..]);
        }
    }
    for i in 0..raw.len() {
        for separator in [&b"\r\n\r\n"[..], &b"\n\n"[..]] {
            if raw[i..].starts_with(separator) {
                return (&raw[..i], separator, &raw[i + separator.len()..]);
            }
        }
    }
    (raw, &[], &[])
}

/// Encodes bytes as Quoted-Printable (RFC 2045), keeping hard line breaks.
pub(crate) fn encode_quoted_printable(body: &[u8]) -> String {
    let mut result = String::new();
    let mut lines = body.split(|&b| b == b'\n').peekable();

    while let Some(line) = lines.next() {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let mut line_length = 0;

        for (i, byte) in line.iter().enumerate() {
            if line_length >= QP_LINE_LENGTH - 3 {
                result.push_str("=\r\n");
                line_length = 0;
            }

            let last = i + 1 == line.len();
            match byte {
                b'!'..=b'<' | b'>'..=b'~' => {
                    result.push(char::from(*byte));
                    line_length += 1;
                }
                // Whitespace at the end of a line would be stripped in transit.
                b' ' | b'\t' if !last => {
                    result.push(char::from(*byte));
                    line_length += 1;
                }
                _ => {
                    let _ = write!(result, "={byte:02X}");
                    line_length += 3;
                }
            }
        }

        if lines.peek().is_some() {
            result.push_str("\r\n");
        }
    }

    result
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

    const MIXED: &str = "multipart/mixed; boundary=\"=_b1\"";

    fn mixed_body() -> Vec<u8> {
        "preamble\r\n\
         --=_b1\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Transfer-Encoding: 8bit\r\n\
         \r\n\
         caf\u{e9}\r\n\
         --=_b1\r\n\
         Content-Type: application/octet-stream\r\n\
         Content-Transfer-Encoding: base64\r\n\
         \r\n\
         AAEC\r\n\
         --=_b1--\r\n\
         epilogue\r\n"
            .as_bytes()
            .to_vec()
    }

    #[test]
    fn test_content_type_parse() {
        let ct = ContentType::parse("Multipart/Mixed; charset=x;\r\n boundary=\"=_b1\"").unwrap();
        assert!(ct.is_multipart());
        assert_eq!(ct.boundary(), Some("=_b1"));

        let ct = ContentType::parse("message/rfc822").unwrap();
        assert!(ct.is_message());
        assert_eq!(ct.boundary(), None);

        assert!(ContentType::parse("garbage").is_none());
    }

    #[test]
    fn test_split_head_keeps_separator() {
        assert_eq!(
            split_head(b"A: 1\r\nB: 2\r\n\r\nbody"),
            (&b"A: 1\r\nB: 2"[..], &b"\r\n\r\n"[..], &b"body"[..])
        );
        assert_eq!(split_head(b"\r\nbody"), (&b""[..], &b"\r\n"[..], &b"body"[..]));
        assert_eq!(split_head(b"A: 1"), (&b"A: 1"[..], &b""[..], &b""[..]));
    }

    #[test]
    fn test_fields_keep_folding() {
        let head = b"A: 1\r\nB: two\r\n  lines\r\nno colon here";
        assert_eq!(
            fields(head),
            vec![&b"A: 1"[..], &b"B: two\r\n  lines"[..], &b"no colon here"[..]]
        );
    }

    #[test]
    fn test_multipart_split_is_lossless() {
        let body = mixed_body();
        let multipart = Multipart::split(&body, "=_b1").unwrap();
        assert_eq!(multipart.preamble, b"preamble\r\n");
        assert_eq!(multipart.parts.len(), 2);
        assert_eq!(multipart.close_line, b"--=_b1--\r\n");
        assert_eq!(multipart.epilogue, b"epilogue\r\n");

        let mut joined = multipart.preamble.to_vec();
        for (delimiter, content) in &multipart.parts {
            joined.extend_from_slice(delimiter);
            joined.extend_from_slice(content);
        }
        joined.extend_from_slice(multipart.close_line);
        joined.extend_from_slice(multipart.epilogue);
        assert_eq!(joined, body);
    }

    #[test]
    fn test_boundary_prefix_is_not_a_delimiter() {
        let body = b"--=_b1x\r\nnot a part\r\n--=_b1\r\n\r\npart\r\n--=_b1--\r\n";
        let multipart = Multipart::split(body, "=_b1").unwrap();
        assert_eq!(multipart.preamble, b"--=_b1x\r\nnot a part\r\n");
        assert_eq!(multipart.parts.len(), 1);
    }

    #[test]
    fn test_multipart_downgrade_touches_only_8bit_leaf() {
        let mut body = mixed_body();
        assert!(contains_8bit(Some(MIXED), None, &body));

        let outcome = reencode(Some(MIXED), None, &mut body, EncodingCeiling::SevenBit);
        assert_eq!(outcome, Reencoded::Body);

        let text = String::from_utf8(body.clone()).unwrap();
        assert!(text.contains("\r\n--=_b1\r\n"));
        assert!(text.contains("\r\n--=_b1--\r\n"));
        assert!(text.contains(
            "Content-Type: text/plain; charset=utf-8\r\n\
             Content-Transfer-Encoding: quoted-printable\r\n\r\ncaf=C3=A9\r\n--=_b1\r\n"
        ));
        assert!(text.contains("Content-Transfer-Encoding: base64\r\n\r\nAAEC\r\n"));
        assert!(!text.contains("8bit"));
        assert!(!contains_8bit(Some(MIXED), None, &body));
    }

    #[test]
    fn test_multipart_in_7bit_is_unchanged() {
        let mut body = b"--b\r\nContent-Type: text/plain\r\n\r\nhello\r\n--b--\r\n".to_vec();
        let before = body.clone();
        let outcome = reencode(
            Some("multipart/alternative; boundary=b"),
            None,
            &mut body,
            EncodingCeiling::SevenBit,
        );
        assert_eq!(outcome, Reencoded::Unchanged);
        assert_eq!(body, before);
    }

    #[test]
    fn test_nested_multipart_and_8bit_container_label() {
        let mut body = "--outer\r\n\
             Content-Type: multipart/alternative; boundary=inner\r\n\
             \r\n\
             --inner\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             \u{fc}ber\r\n\
             --inner--\r\n\
             --outer--\r\n"
            .as_bytes()
            .to_vec();

        let outcome = reencode(
            Some("multipart/mixed; boundary=outer"),
            Some("8bit"),
            &mut body,
            EncodingCeiling::SevenBit,
        );
        assert_eq!(outcome, Reencoded::Relabelled("7bit"));

        let text = String::from_utf8(body).unwrap();
        assert!(text.contains(
            "Content-Type: multipart/alternative; boundary=inner\r\n\r\n--inner\r\n"
        ));
        assert!(text.contains(
            "Content-Type: text/plain\r\n\
             Content-Transfer-Encoding: quoted-printable\r\n\r\n=C3=BCber\r\n--inner--\r\n"
        ));
    }

    #[test]
    fn test_embedded_message_is_recursed() {
        let mut body = "Subject: inner\r\n\r\nna\u{ef}ve\r\n".as_bytes().to_vec();
        let outcome = reencode(
            Some("message/rfc822"),
            None,
            &mut body,
            EncodingCeiling::SevenBit,
        );
        assert_eq!(outcome, Reencoded::Body);
        assert_eq!(
            body,
            b"Subject: inner\r\nContent-Transfer-Encoding: quoted-printable\r\n\r\nna=C3=AFve\r\n"
        );
    }

    #[test]
    fn test_multipart_without_delimiters_is_a_leaf() {
        let mut body = "caf\u{e9}\r\n".as_bytes().to_vec();
        let outcome = reencode(
            Some("multipart/mixed; boundary=missing"),
            None,
            &mut body,
            EncodingCeiling::SevenBit,
        );
        assert_eq!(outcome, Reencoded::Relabelled("quoted-printable"));
    }

    #[test]
    fn test_quoted_printable_soft_breaks() {
        let encoded = encode_quoted_printable("a".repeat(200).as_bytes());
        for line in encoded.split("\r\n") {
            assert!(line.len() <= QP_LINE_LENGTH);
        }
        assert_eq!(encoded.replace("=\r\n", ""), "a".repeat(200));
    }
}
