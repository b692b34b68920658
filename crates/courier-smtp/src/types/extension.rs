//! SMTP extension types.

use std::collections::BTreeSet;

use super::Reply;

/// SMTP extension keyword found on one EHLO reply line.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Extension {
    /// STARTTLS - TLS upgrade
    StartTls,
    /// AUTH - Authentication, with the advertised mechanism names
    Auth(Vec<String>),
    /// 8BITMIME - 8-bit MIME transport
    EightBitMime,
    /// ENHANCEDSTATUSCODES - RFC 2034 status codes in replies
    EnhancedStatusCodes,
    /// Unknown extension
    Unknown(String),
}

impl Extension {
    /// Parses an extension line from EHLO response.
    ///
    /// Both `AUTH LOGIN PLAIN` and the older `AUTH=LOGIN PLAIN` form are
    /// understood.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let keyword_end = line
            .find(|c: char| c.is_whitespace() || c == '=')
            .unwrap_or(line.len());
        let keyword = line[..keyword_end].to_uppercase();

        match keyword.as_str() {
            "STARTTLS" => Self::StartTls,
            "8BITMIME" => Self::EightBitMime,
            "ENHANCEDSTATUSCODES" => Self::EnhancedStatusCodes,
            "AUTH" => {
                let rest = line[keyword_end..]
                    .trim_start_matches(|c: char| c.is_whitespace() || c == '=');
                Self::Auth(rest.split_whitespace().map(str::to_uppercase).collect())
            }
            _ => Self::Unknown(line.to_string()),
        }
    }
}

/// Features advertised by the server.
///
/// Rebuilt from scratch on every HELO/EHLO so that nothing learned from a
/// previous connection leaks into the next one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Server speaks ESMTP (EHLO was accepted).
    pub is_esmtp: bool,
    /// 8BITMIME advertised.
    pub eight_bit_mime: bool,
    /// ENHANCEDSTATUSCODES advertised.
    pub enhanced_status_codes: bool,
    /// STARTTLS advertised.
    pub starttls: bool,
    auth_mechanisms: BTreeSet<String>,
    auth_seen: bool,
}

impl Capabilities {
    /// Capabilities of a server that only accepted HELO.
    #[must_use]
    pub fn helo() -> Self {
        Self::default()
    }

    /// Builds the capability set from an accepted EHLO reply.
    #[must_use]
    pub fn from_ehlo(reply: &Reply) -> Self {
        let mut caps = Self {
            is_esmtp: true,
            ..Self::default()
        };
        for line in &reply.message {
            caps.apply(Extension::parse(line));
        }
        caps
    }

    /// Records one advertised extension.
    ///
    /// Only the first AUTH line counts: servers that also advertise the
    /// `AUTH=` form for old clients repeat the same list.
    pub fn apply(&mut self, extension: Extension) {
        match extension {
            Extension::StartTls => self.starttls = true,
            Extension::EightBitMime => self.eight_bit_mime = true,
            Extension::EnhancedStatusCodes => self.enhanced_status_codes = true,
            Extension::Auth(mechanisms) if !self.auth_seen => {
                self.auth_seen = true;
                self.auth_mechanisms.extend(mechanisms);
            }
            Extension::Auth(_) | Extension::Unknown(_) => {}
        }
    }

    /// Returns the advertised SASL mechanism names (upper case).
    #[must_use]
    pub const fn auth_mechanisms(&self) -> &BTreeSet<String> {
        &self.auth_mechanisms
    }

    /// Checks if the server advertises a SASL mechanism.
    #[must_use]
    pub fn supports_auth(&self, mechanism: &str) -> bool {
        self.auth_mechanisms.contains(&mechanism.to_uppercase())
    }

    /// Forgets everything.
    pub fn clear(&mut self) {
        *self = Self::default();
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
    use crate::types::ReplyCode;

    fn ehlo(lines: &[&str]) -> Reply {
        Reply::new(
            Some(ReplyCode::OK),
            lines.iter().map(ToString::to_string).collect(),
        )
    }

    mod extension_parse_tests {
        use super::*;

        #[test]
        fn parse_starttls() {
            assert_eq!(Extension::parse("STARTTLS"), Extension::StartTls);
            assert_eq!(Extension::parse("starttls"), Extension::StartTls);
        }

        #[test]
        fn parse_8bitmime() {
            assert_eq!(Extension::parse("8BITMIME"), Extension::EightBitMime);
        }

        #[test]
        fn parse_enhanced_status_codes() {
            assert_eq!(
                Extension::parse("ENHANCEDSTATUSCODES"),
                Extension::EnhancedStatusCodes
            );
        }

        #[test]
        fn parse_auth_space_form() {
            assert_eq!(
                Extension::parse("AUTH LOGIN PLAIN"),
                Extension::Auth(vec!["LOGIN".into(), "PLAIN".into()])
            );
        }

        #[test]
        fn parse_auth_equals_form() {
            assert_eq!(
                Extension::parse("AUTH=login plain"),
                Extension::Auth(vec!["LOGIN".into(), "PLAIN".into()])
            );
        }

        #[test]
        fn parse_unknown() {
            assert_eq!(
                Extension::parse("SIZE 52428800"),
                Extension::Unknown("SIZE 52428800".into())
            );
            assert!(matches!(Extension::parse(""), Extension::Unknown(_)));
        }

        #[test]
        fn keyword_prefix_is_not_enough() {
            assert!(matches!(
                Extension::parse("AUTHORITY yes"),
                Extension::Unknown(_)
            ));
        }
    }

    mod capabilities_tests {
        use super::*;

        #[test]
        fn from_ehlo_reply() {
            let caps =
                Capabilities::from_ehlo(&ehlo(&["8BITMIME", "STARTTLS", "AUTH LOGIN PLAIN"]));
            assert!(caps.is_esmtp);
            assert!(caps.eight_bit_mime);
            assert!(caps.starttls);
            assert!(!caps.enhanced_status_codes);
            let mechs: Vec<_> = caps.auth_mechanisms().iter().cloned().collect();
            assert_eq!(mechs, vec!["LOGIN", "PLAIN"]);
        }

        #[test]
        fn greeting_line_is_ignored() {
            let caps = Capabilities::from_ehlo(&ehlo(&[
                "mx.example.com Hello [192.0.2.1]",
                "ENHANCEDSTATUSCODES",
            ]));
            assert!(caps.enhanced_status_codes);
            assert!(caps.auth_mechanisms().is_empty());
        }

        #[test]
        fn second_auth_line_is_not_parsed() {
            let caps = Capabilities::from_ehlo(&ehlo(&[
                "AUTH LOGIN PLAIN",
                "AUTH=LOGIN PLAIN CRAM-MD5",
            ]));
            let mechs: Vec<_> = caps.auth_mechanisms().iter().cloned().collect();
            assert_eq!(mechs, vec!["LOGIN", "PLAIN"]);
        }

        #[test]
        fn supports_auth_is_case_insensitive() {
            let caps = Capabilities::from_ehlo(&ehlo(&["AUTH PLAIN"]));
            assert!(caps.supports_auth("plain"));
            assert!(!caps.supports_auth("LOGIN"));
        }

        #[test]
        fn helo_has_nothing() {
            let caps = Capabilities::helo();
            assert!(!caps.is_esmtp);
            assert!(!caps.starttls);
            assert!(caps.auth_mechanisms().is_empty());
        }

        #[test]
        fn clear_resets_everything() {
            let mut caps = Capabilities::from_ehlo(&ehlo(&["STARTTLS", "AUTH PLAIN"]));
            caps.clear();
            assert_eq!(caps, Capabilities::default());
            caps.apply(Extension::Auth(vec!["LOGIN".into()]));
            assert!(caps.supports_auth("LOGIN"));
        }
    }
}
