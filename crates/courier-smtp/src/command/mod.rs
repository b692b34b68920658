//! Client commands and their wire form.

use crate::types::Address;

/// One client command. Every command is a single CRLF-terminated line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `HELO`, for servers that reject EHLO.
    Helo {
        /// Name or address literal the client announces.
        hostname: String,
    },
    /// `EHLO`, asking for the extension list.
    Ehlo {
        /// Name or address literal the client announces.
        hostname: String,
    },
    /// `STARTTLS`.
    StartTls,
    /// `AUTH`, opening a SASL exchange.
    Auth {
        /// SASL mechanism name.
        mechanism: String,
        /// Base64 initial response, `=` for an empty one.
        initial_response: Option<String>,
    },
    /// Base64 answer to a `334` challenge.
    AuthResponse(String),
    /// `*`, cancelling the SASL exchange.
    AuthAbort,
    /// `MAIL FROM`, opening a transaction.
    MailFrom {
        /// Reverse path.
        from: Address,
        /// Append `BODY=8BITMIME`.
        eight_bit: bool,
    },
    /// `RCPT TO`, one per recipient.
    RcptTo {
        /// Forward path.
        to: Address,
    },
    /// `DATA`.
    Data,
    /// `RSET`, discarding the transaction.
    Rset,
    /// `QUIT`.
    Quit,
}

impl Command {
    /// Short name used in error messages.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Helo { .. } => "HELO",
            Self::Ehlo { .. } => "EHLO",
            Self::StartTls => "STARTTLS",
            Self::Auth { .. } | Self::AuthResponse(_) | Self::AuthAbort => "AUTH",
            Self::MailFrom { .. } => "MAIL FROM",
            Self::RcptTo { .. } => "RCPT TO",
            Self::Data => "DATA",
            Self::Rset => "RSET",
            Self::Quit => "QUIT",
        }
    }

    /// Serializes the command, CRLF included.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut line = self.line().into_bytes();
        line.extend_from_slice(b"\r\n");
        line
    }

    /// Form of the command that is safe to log. SASL payloads are hidden.
    #[must_use]
    pub fn redacted(&self) -> String {
        match self {
            Self::Auth {
                mechanism,
                initial_response: Some(_),
            } => format!("AUTH {mechanism} <redacted>"),
            Self::AuthResponse(_) => "<redacted>".to_string(),
            other => other.line(),
        }
    }

    fn line(&self) -> String {
        match self {
            Self::Helo { hostname } => format!("HELO {hostname}"),
            Self::Ehlo { hostname } => format!("EHLO {hostname}"),
            Self::StartTls => "STARTTLS".to_string(),
            Self::Auth {
                mechanism,
                initial_response: Some(ir),
            } => format!("AUTH {mechanism} {ir}"),
            Self::Auth {
                mechanism,
                initial_response: None,
            } => format!("AUTH {mechanism}"),
            Self::AuthResponse(response) => response.clone(),
            Self::AuthAbort => "*".to_string(),
            Self::MailFrom { from, eight_bit } => {
                let body = if *eight_bit { " BODY=8BITMIME" } else { "" };
                format!("MAIL FROM:<{}>{body}", from.as_str())
            }
            Self::RcptTo { to } => format!("RCPT TO:<{}>", to.as_str()),
            Self::Data => "DATA".to_string(),
            Self::Rset => "RSET".to_string(),
            Self::Quit => "QUIT".to_string(),
        }
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

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    #[test]
    fn test_greetings() {
        let helo = Command::Helo {
            hostname: "mail.example.net".to_string(),
        };
        assert_eq!(helo.serialize(), b"HELO mail.example.net\r\n");

        let ehlo = Command::Ehlo {
            hostname: "[192.0.2.1]".to_string(),
        };
        assert_eq!(ehlo.serialize(), b"EHLO [192.0.2.1]\r\n");
        assert_eq!(Command::StartTls.serialize(), b"STARTTLS\r\n");
    }

    #[test]
    fn test_auth_with_initial_response() {
        let cmd = Command::Auth {
            mechanism: "PLAIN".to_string(),
            initial_response: Some("AGJvYgBzZWNyZXQ=".to_string()),
        };
        assert_eq!(cmd.serialize(), b"AUTH PLAIN AGJvYgBzZWNyZXQ=\r\n");
        assert_eq!(cmd.redacted(), "AUTH PLAIN <redacted>");
    }

    #[test]
    fn test_auth_without_initial_response() {
        let cmd = Command::Auth {
            mechanism: "LOGIN".to_string(),
            initial_response: None,
        };
        assert_eq!(cmd.serialize(), b"AUTH LOGIN\r\n");
        assert_eq!(cmd.redacted(), "AUTH LOGIN");
    }

    #[test]
    fn test_auth_response_and_abort() {
        let resp = Command::AuthResponse("dXNlcg==".to_string());
        assert_eq!(resp.serialize(), b"dXNlcg==\r\n");
        assert_eq!(resp.redacted(), "<redacted>");
        assert_eq!(Command::AuthAbort.serialize(), b"*\r\n");
    }

    #[test]
    fn test_envelope_commands() {
        let plain = Command::MailFrom {
            from: addr("alice@example.org"),
            eight_bit: false,
        };
        assert_eq!(plain.serialize(), b"MAIL FROM:<alice@example.org>\r\n");
        assert_eq!(plain.name(), "MAIL FROM");

        let eight_bit = Command::MailFrom {
            from: addr("alice@example.org"),
            eight_bit: true,
        };
        assert_eq!(
            eight_bit.serialize(),
            b"MAIL FROM:<alice@example.org> BODY=8BITMIME\r\n"
        );

        let rcpt = Command::RcptTo {
            to: addr("bob@example.net"),
        };
        assert_eq!(rcpt.serialize(), b"RCPT TO:<bob@example.net>\r\n");
        assert_eq!(rcpt.redacted(), "RCPT TO:<bob@example.net>");
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(Command::Data.serialize(), b"DATA\r\n");
        assert_eq!(Command::Rset.serialize(), b"RSET\r\n");
        assert_eq!(Command::Quit.serialize(), b"QUIT\r\n");
    }
}
