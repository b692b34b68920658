//! Error types for SMTP operations.
//!
//! Errors are split by the phase that produced them: establishing the
//! connection ([`ConnectError`]), authenticating ([`AuthError`]) and running a
//! mail transaction ([`SendError`]). All of them bottom out in either a
//! [`ReplyError`] (the server answered something unexpected, or nothing at
//! all) or a [`TransportError`] (the byte stream itself failed).

use std::io;
use std::time::Duration;

/// Result type alias for SMTP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of the underlying byte stream.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Invalid DNS name for TLS.
    #[error("Invalid DNS name: {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),

    /// A read or write did not complete before the channel deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The server closed the connection.
    #[error("connection closed by server")]
    Closed,

    /// Encryption was requested on a stream that is already encrypted.
    #[error("stream is already encrypted")]
    AlreadyEncrypted,
}

impl TransportError {
    /// Returns true if the channel deadline expired.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// A command that did not get the reply it needed.
#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    /// The server answered with an unexpected reply code.
    #[error("{command} response error (expected {expected}, got {}): {text}", code_text(*.received))]
    Rejected {
        /// Command that was issued (e.g. `MAIL FROM`).
        command: &'static str,
        /// Reply code the command required.
        expected: u16,
        /// Reply code received, `None` if the reply line was malformed.
        received: Option<u16>,
        /// Human-readable reason, enhanced-status decoded when available.
        text: String,
    },

    /// The command could not be written or no reply could be read.
    #[error("{command} request failed: {source}")]
    Transport {
        /// Command that was issued.
        command: &'static str,
        /// Underlying stream failure.
        #[source]
        source: TransportError,
    },
}

fn code_text(code: Option<u16>) -> String {
    code.map_or_else(|| "no valid reply code".to_string(), |c| c.to_string())
}

impl ReplyError {
    /// Returns the reply code received from the server, if any.
    #[must_use]
    pub const fn code(&self) -> Option<u16> {
        match self {
            Self::Rejected { received, .. } => *received,
            Self::Transport { .. } => None,
        }
    }

    /// Returns the command this error belongs to.
    #[must_use]
    pub const fn command(&self) -> &'static str {
        match self {
            Self::Rejected { command, .. } | Self::Transport { command, .. } => *command,
        }
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self.code(), Some(code) if code >= 500 && code < 600)
    }

    /// Returns true if this is a transient error (4xx).
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.code(), Some(code) if code >= 400 && code < 500)
    }

    /// Returns true if the channel deadline expired while waiting.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport { source, .. } if source.is_timeout())
    }
}

/// Errors raised while establishing a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The host name could not be resolved.
    #[error("Could not resolve SMTP server {host}: {source}")]
    HostUnreachable {
        /// Configured host.
        host: String,
        /// Resolution failure.
        #[source]
        source: io::Error,
    },

    /// Nothing accepted the connection on the given port.
    #[error("Could not connect to {host} (port {port}): {source}")]
    ServiceUnavailable {
        /// Configured host.
        host: String,
        /// Port that was tried.
        port: u16,
        /// Connection failure.
        #[source]
        source: TransportError,
    },

    /// The server greeting was missing or not a `220`.
    #[error(transparent)]
    Greeting(ReplyError),

    /// Neither EHLO nor HELO was accepted.
    #[error(transparent)]
    Ehlo(ReplyError),

    /// Secure mode was required but STARTTLS is not advertised.
    #[error("Failed to connect to SMTP server {host} in secure mode: server does not appear to support SSL")]
    StartTlsUnsupported {
        /// Configured host.
        host: String,
    },

    /// The server refused the STARTTLS command.
    #[error(transparent)]
    StartTls(ReplyError),

    /// The TLS handshake after STARTTLS failed.
    #[error("Failed to connect to SMTP server {host} in secure mode: {source}")]
    StartTlsHandshakeFailed {
        /// Configured host.
        host: String,
        /// Handshake failure.
        #[source]
        source: TransportError,
    },
}

impl ConnectError {
    /// Returns true if the port refused service, which makes an
    /// implicit-TLS attempt eligible for the STARTTLS fallback.
    #[must_use]
    pub const fn is_service_unavailable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable { .. })
    }
}

/// Errors raised while authenticating.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The server does not advertise the requested mechanism.
    #[error("SMTP server does not support requested authentication type {mechanism}")]
    MechanismUnsupportedByServer {
        /// Requested mechanism.
        mechanism: String,
    },

    /// The mechanism is not implemented by this crate.
    #[error("No support for authentication type {0}")]
    MechanismUnavailableLocally(String),

    /// The server rejected the credentials. Retryable with a new password.
    #[error(transparent)]
    CredentialDenied(ReplyError),

    /// The credential provider returned no password.
    #[error("You didn't enter a password")]
    UserCancelled,

    /// The exchange could not be completed by the mechanism.
    #[error("Bad authentication response from server: {0}")]
    ServerProtocolViolation(String),

    /// The connection failed during the exchange.
    #[error(transparent)]
    Transport(ReplyError),
}

impl AuthError {
    /// Returns true if prompting for a new password may help.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CredentialDenied(_) | Self::ServerProtocolViolation(_)
        )
    }
}

impl From<ReplyError> for AuthError {
    fn from(err: ReplyError) -> Self {
        match err {
            ReplyError::Rejected { .. } => Self::CredentialDenied(err),
            ReplyError::Transport { .. } => Self::Transport(err),
        }
    }
}

/// Errors raised while sending a message.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// No connection is open.
    #[error("Cannot send message: not connected")]
    NotConnected,

    /// The sender address is not usable.
    #[error("Cannot send message: sender address not valid: {0}")]
    InvalidSender(String),

    /// The recipient list is empty.
    #[error("Cannot send message: no recipients defined")]
    NoRecipients,

    /// A recipient address is not usable.
    #[error("Cannot send message: one or more invalid recipients: {0}")]
    InvalidRecipient(String),

    /// MAIL FROM was not accepted.
    #[error(transparent)]
    SenderRejected(ReplyError),

    /// RCPT TO was not accepted for one recipient.
    #[error("RCPT TO <{address}> failed: {source}")]
    RecipientRejected {
        /// Rejected recipient.
        address: String,
        /// Server reply.
        #[source]
        source: ReplyError,
    },

    /// DATA was not answered with `354`.
    #[error(transparent)]
    DataPhaseRejected(ReplyError),

    /// Writing the message body failed.
    #[error("DATA send failed: {0}: mail not sent")]
    TransmissionIoFailure(#[source] TransportError),

    /// The server did not accept the message after the terminator.
    #[error(transparent)]
    TerminationRejected(ReplyError),
}

impl SendError {
    /// Returns true if the connection itself failed, rather than the server
    /// refusing something. The connection is unusable afterwards.
    #[must_use]
    pub const fn is_connection_lost(&self) -> bool {
        match self {
            Self::TransmissionIoFailure(_) => true,
            Self::SenderRejected(e)
            | Self::RecipientRejected { source: e, .. }
            | Self::DataPhaseRejected(e)
            | Self::TerminationRejected(e) => matches!(e, ReplyError::Transport { .. }),
            _ => false,
        }
    }
}

/// Top-level SMTP error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connection establishment failed.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Authentication failed.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Sending failed.
    #[error(transparent)]
    Send(#[from] SendError),
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

    fn rejected(code: u16) -> ReplyError {
        ReplyError::Rejected {
            command: "MAIL FROM",
            expected: 250,
            received: Some(code),
            text: "nope".into(),
        }
    }

    #[test]
    fn test_rejected_display_names_command_and_codes() {
        assert_eq!(
            rejected(550).to_string(),
            "MAIL FROM response error (expected 250, got 550): nope"
        );
    }

    #[test]
    fn test_rejected_display_without_code() {
        let err = ReplyError::Rejected {
            command: "DATA",
            expected: 354,
            received: None,
            text: "Unknown".into(),
        };
        assert!(err.to_string().contains("no valid reply code"));
    }

    #[test]
    fn test_permanent_and_transient() {
        assert!(rejected(550).is_permanent());
        assert!(!rejected(550).is_transient());
        assert!(rejected(451).is_transient());
        assert!(!rejected(451).is_permanent());
    }

    #[test]
    fn test_timeout_is_distinct() {
        let err = ReplyError::Transport {
            command: "RCPT TO",
            source: TransportError::Timeout(Duration::from_secs(5)),
        };
        assert!(err.is_timeout());
        assert!(err.to_string().contains("timed out"));
        assert!(!rejected(421).is_timeout());
    }

    #[test]
    fn test_auth_error_from_reply() {
        assert!(matches!(
            AuthError::from(rejected(535)),
            AuthError::CredentialDenied(_)
        ));
        let transport = ReplyError::Transport {
            command: "AUTH",
            source: TransportError::Closed,
        };
        let err = AuthError::from(transport);
        assert!(matches!(err, AuthError::Transport(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_recipient_rejected_names_address() {
        let err = SendError::RecipientRejected {
            address: "bob@example.com".into(),
            source: rejected(550),
        };
        assert!(err.to_string().contains("<bob@example.com>"));
        assert!(!err.is_connection_lost());
    }

    #[test]
    fn test_connection_lost() {
        let err = SendError::DataPhaseRejected(ReplyError::Transport {
            command: "DATA",
            source: TransportError::Closed,
        });
        assert!(err.is_connection_lost());
        assert!(SendError::TransmissionIoFailure(TransportError::Closed).is_connection_lost());
        assert!(!SendError::NoRecipients.is_connection_lost());
    }
}
