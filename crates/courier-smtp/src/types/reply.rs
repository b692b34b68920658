//! SMTP reply types.

/// One physical reply line as read from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    /// Reply code, `None` when the line does not start with three digits.
    pub code: Option<ReplyCode>,
    /// True when the fourth column is `-` and more lines follow.
    pub is_continuation: bool,
    /// Text after the code and separator.
    pub text: String,
}

/// SMTP reply from server, possibly assembled from several lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Reply code of the final line, `None` if it was malformed.
    pub code: Option<ReplyCode>,
    /// Text of every line, in order.
    pub message: Vec<String>,
}

impl Reply {
    /// Creates a new reply.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)] // Vec is not const-compatible
    pub fn new(code: Option<ReplyCode>, message: Vec<String>) -> Self {
        Self { code, message }
    }

    /// Returns the numeric code, if the reply carried one.
    #[must_use]
    pub fn code_u16(&self) -> Option<u16> {
        self.code.map(ReplyCode::as_u16)
    }

    /// Returns true if the reply carries exactly this code.
    #[must_use]
    pub fn is(&self, code: ReplyCode) -> bool {
        self.code == Some(code)
    }

    /// Returns true if this is a success reply (2xx).
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code.is_some_and(ReplyCode::is_success)
    }

    /// Returns true if this is a transient error (4xx).
    #[must_use]
    pub fn is_transient_error(&self) -> bool {
        self.code.is_some_and(ReplyCode::is_transient)
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub fn is_permanent_error(&self) -> bool {
        self.code.is_some_and(ReplyCode::is_permanent)
    }

    /// Returns the full message as a single string.
    #[must_use]
    pub fn message_text(&self) -> String {
        self.message.join("\n")
    }

    /// Returns the text of the first line, used for greetings and challenges.
    #[must_use]
    pub fn first_line(&self) -> &str {
        self.message.first().map_or("", String::as_str)
    }
}

/// SMTP reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplyCode(u16);

impl ReplyCode {
    /// Creates a new reply code.
    #[must_use]
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    /// Returns the numeric code.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns true if this is a success code (2xx).
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 >= 200 && self.0 < 300
    }

    /// Returns true if this is a transient error (4xx).
    #[must_use]
    pub const fn is_transient(self) -> bool {
        self.0 >= 400 && self.0 < 500
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub const fn is_permanent(self) -> bool {
        self.0 >= 500 && self.0 < 600
    }

    /// Returns true if this is an intermediate reply (3xx).
    #[must_use]
    pub const fn is_intermediate(self) -> bool {
        self.0 >= 300 && self.0 < 400
    }
}

impl std::fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Codes the client waits for, and a few it commonly gets instead.
impl ReplyCode {
    /// Greeting, and the go-ahead for STARTTLS.
    pub const SERVICE_READY: Self = Self(220);
    /// Answer to QUIT.
    pub const CLOSING: Self = Self(221);
    /// AUTH completed.
    pub const AUTH_SUCCESS: Self = Self(235);
    /// EHLO, HELO, MAIL, RCPT, RSET and end of data.
    pub const OK: Self = Self(250);
    /// Base64 SASL challenge follows.
    pub const AUTH_CONTINUE: Self = Self(334);
    /// Answer to DATA.
    pub const START_DATA: Self = Self(354);
    /// Server is shutting the channel down.
    pub const SERVICE_UNAVAILABLE: Self = Self(421);
    /// Mailbox temporarily unavailable.
    pub const MAILBOX_BUSY: Self = Self(450);
    /// Temporary authentication failure.
    pub const AUTH_TEMPORARY_FAILURE: Self = Self(454);
    /// Command not recognized.
    pub const SYNTAX_ERROR: Self = Self(500);
    /// Credentials rejected.
    pub const AUTH_FAILED: Self = Self(535);
    /// Mechanism needs an encrypted channel.
    pub const ENCRYPTION_REQUIRED: Self = Self(538);
    /// Mailbox does not exist or refuses mail.
    pub const MAILBOX_UNAVAILABLE: Self = Self(550);
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

    mod reply_code_tests {
        use super::*;

        #[test]
        fn success_codes() {
            assert!(ReplyCode::OK.is_success());
            assert!(ReplyCode::SERVICE_READY.is_success());
            assert!(ReplyCode::CLOSING.is_success());
            assert!(ReplyCode::AUTH_SUCCESS.is_success());
        }

        #[test]
        fn intermediate_codes() {
            assert!(ReplyCode::AUTH_CONTINUE.is_intermediate());
            assert!(ReplyCode::START_DATA.is_intermediate());
            assert!(!ReplyCode::START_DATA.is_success());
        }

        #[test]
        fn transient_errors() {
            assert!(ReplyCode::MAILBOX_BUSY.is_transient());
            assert!(ReplyCode::SERVICE_UNAVAILABLE.is_transient());
            assert!(ReplyCode::AUTH_TEMPORARY_FAILURE.is_transient());
        }

        #[test]
        fn permanent_errors() {
            assert!(ReplyCode::MAILBOX_UNAVAILABLE.is_permanent());
            assert!(ReplyCode::AUTH_FAILED.is_permanent());
            assert!(ReplyCode::ENCRYPTION_REQUIRED.is_permanent());
        }

        #[test]
        fn display() {
            assert_eq!(format!("{}", ReplyCode::OK), "250");
            assert_eq!(format!("{}", ReplyCode::SYNTAX_ERROR), "500");
        }
    }

    mod reply_tests {
        use super::*;

        #[test]
        fn is_exact_code() {
            let reply = Reply::new(Some(ReplyCode::START_DATA), vec!["go ahead".to_string()]);
            assert!(reply.is(ReplyCode::START_DATA));
            assert!(!reply.is(ReplyCode::OK));
            assert_eq!(reply.code_u16(), Some(354));
        }

        #[test]
        fn missing_code_is_nothing() {
            let reply = Reply::new(None, vec!["garbage".to_string()]);
            assert!(!reply.is_success());
            assert!(!reply.is_transient_error());
            assert!(!reply.is_permanent_error());
            assert_eq!(reply.code_u16(), None);
        }

        #[test]
        fn message_text_multiple_lines() {
            let reply = Reply::new(
                Some(ReplyCode::SERVICE_READY),
                vec![
                    "smtp.example.com ESMTP".to_string(),
                    "Ready to serve".to_string(),
                ],
            );
            assert_eq!(
                reply.message_text(),
                "smtp.example.com ESMTP\nReady to serve"
            );
            assert_eq!(reply.first_line(), "smtp.example.com ESMTP");
        }

        #[test]
        fn message_text_empty() {
            let reply = Reply::new(Some(ReplyCode::OK), vec![]);
            assert_eq!(reply.message_text(), "");
            assert_eq!(reply.first_line(), "");
        }
    }
}
