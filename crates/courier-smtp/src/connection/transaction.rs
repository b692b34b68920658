//! One MAIL / RCPT / DATA / RSET cycle.

use std::io;

use super::codec::DotStuffer;
use super::{LineChannel, exchange, receive, rejected};
use crate::command::Command;
use crate::error::SendError;
use crate::types::{
    Address, Capabilities, EncodingCeiling, MessageSource, RemovedHeader, ReplyCode,
};

/// Header that must never reach the server.
const BLIND_RECIPIENT_HEADER: &str = "Bcc";

/// Progress of a mail transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Nothing sent yet.
    Idle,
    /// `MAIL FROM` accepted.
    MailSent,
    /// Every `RCPT TO` accepted.
    RecipientsAccepted,
    /// `DATA` accepted, message being transmitted.
    DataInProgress,
    /// Message accepted for delivery.
    Complete,
    /// The transaction was aborted.
    Failed,
}

/// Drives a single message through an open, greeted connection.
#[derive(Debug)]
pub struct TransactionEngine<'a, C: ?Sized> {
    channel: &'a mut C,
    capabilities: &'a Capabilities,
    state: TransactionState,
    started: bool,
}

impl<'a, C> TransactionEngine<'a, C>
where
    C: LineChannel + ?Sized,
{
    /// Creates an engine over `channel`.
    pub const fn new(channel: &'a mut C, capabilities: &'a Capabilities) -> Self {
        Self {
            channel,
            capabilities,
            state: TransactionState::Idle,
            started: false,
        }
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> TransactionState {
        self.state
    }

    /// Sends `message` from `sender` to every address in `recipients`.
    ///
    /// Addresses are validated before anything is written. Once `MAIL FROM`
    /// has been issued, `RSET` follows whatever the outcome. The engine may
    /// be reused; each call starts again from [`TransactionState::Idle`].
    ///
    /// # Errors
    ///
    /// Returns the [`SendError`] of the first step that failed.
    pub async fn send<M, S>(
        &mut self,
        sender: &str,
        recipients: &[S],
        message: &mut M,
    ) -> Result<(), SendError>
    where
        M: MessageSource + ?Sized,
        S: AsRef<str>,
    {
        self.state = TransactionState::Idle;
        self.started = false;

        let from = Address::new(sender).map_err(|e| SendError::InvalidSender(e.to_string()))?;
        if recipients.is_empty() {
            return Err(SendError::NoRecipients);
        }
        let to = recipients
            .iter()
            .map(|r| Address::new(r.as_ref()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SendError::InvalidRecipient(e.to_string()))?;

        let result = self.transmit(from, &to, message).await;
        self.state = if result.is_ok() {
            TransactionState::Complete
        } else {
            TransactionState::Failed
        };

        if self.started {
            self.reset().await;
        }
        result
    }

    async fn transmit<M>(
        &mut self,
        from: Address,
        to: &[Address],
        message: &mut M,
    ) -> Result<(), SendError>
    where
        M: MessageSource + ?Sized,
    {
        let enhanced = self.capabilities.enhanced_status_codes;
        let has_8bit = message.has_8bit_parts();
        let eight_bit = has_8bit && self.capabilities.eight_bit_mime;

        tracing::debug!(recipients = to.len(), has_8bit, "starting mail transaction");
        self.started = true;
        exchange(
            &mut *self.channel,
            &Command::MailFrom { from, eight_bit },
            ReplyCode::OK,
            enhanced,
        )
        .await
        .map_err(SendError::SenderRejected)?;
        self.state = TransactionState::MailSent;

        for address in to {
            exchange(
                &mut *self.channel,
                &Command::RcptTo {
                    to: address.clone(),
                },
                ReplyCode::OK,
                enhanced,
            )
            .await
            .map_err(|source| SendError::RecipientRejected {
                address: address.to_string(),
                source,
            })?;
        }
        self.state = TransactionState::RecipientsAccepted;

        let ceiling = if has_8bit && !self.capabilities.eight_bit_mime {
            EncodingCeiling::SevenBit
        } else {
            EncodingCeiling::EightBit
        };
        message.set_best_encoding(ceiling);

        exchange(&mut *self.channel, &Command::Data, ReplyCode::START_DATA, enhanced)
            .await
            .map_err(SendError::DataPhaseRejected)?;
        self.state = TransactionState::DataInProgress;

        let stuffer = render(message).map_err(|e| SendError::TransmissionIoFailure(e.into()))?;
        let terminator = stuffer.terminator();
        let body = stuffer.into_inner();

        self.channel
            .write_all(&body)
            .await
            .map_err(SendError::TransmissionIoFailure)?;
        tracing::trace!(bytes = body.len(), "C: <message body>");
        self.channel
            .write_all(terminator)
            .await
            .map_err(SendError::TransmissionIoFailure)?;

        let reply = receive(&mut *self.channel, "DATA")
            .await
            .map_err(SendError::TerminationRejected)?;
        if !reply.is(ReplyCode::OK) {
            return Err(SendError::TerminationRejected(rejected(
                &reply,
                "DATA",
                ReplyCode::OK,
                enhanced,
            )));
        }

        tracing::debug!("message accepted");
        Ok(())
    }

    async fn reset(&mut self) {
        let enhanced = self.capabilities.enhanced_status_codes;
        if let Err(e) =
            exchange(&mut *self.channel, &Command::Rset, ReplyCode::OK, enhanced).await
        {
            tracing::warn!(?e, "RSET failed");
        }
    }
}

/// Serializes `message` with its blind recipient headers removed.
fn render<M>(message: &mut M) -> io::Result<DotStuffer<Vec<u8>>>
where
    M: MessageSource + ?Sized,
{
    let hidden = HiddenHeaders::remove(message, BLIND_RECIPIENT_HEADER);
    let mut stuffer = DotStuffer::new(Vec::new());
    hidden.message().write_to(&mut stuffer)?;
    Ok(stuffer)
}

/// Headers taken out of a message for as long as this guard lives.
struct HiddenHeaders<'m, M: MessageSource + ?Sized> {
    message: &'m mut M,
    removed: Vec<RemovedHeader>,
}

impl<'m, M: MessageSource + ?Sized> HiddenHeaders<'m, M> {
    fn remove(message: &'m mut M, name: &str) -> Self {
        let removed = message.remove_headers(name);
        if !removed.is_empty() {
            tracing::debug!(count = removed.len(), header = name, "withholding headers");
        }
        Self { message, removed }
    }

    fn message(&self) -> &M {
        &*self.message
    }
}

impl<M: MessageSource + ?Sized> Drop for HiddenHeaders<'_, M> {
    fn drop(&mut self) {
        let removed = std::mem::take(&mut self.removed);
        if !removed.is_empty() {
            self.message.restore_headers(removed);
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
    use std::collections::VecDeque;

    use super::*;
    use crate::error::TransportError;
    use crate::types::{Extension, Message, Reply};

    struct Script {
        replies: VecDeque<&'static str>,
        written: Vec<u8>,
        fail_writes_after: Option<usize>,
    }

    impl Script {
        fn new(replies: &[&'static str]) -> Self {
            Self {
                replies: replies.iter().copied().collect(),
                written: Vec::new(),
                fail_writes_after: None,
            }
        }

        fn commands(&self) -> Vec<String> {
            String::from_utf8_lossy(&self.written)
                .split("\r\n")
                .map(ToString::to_string)
                .collect()
        }
    }

    impl LineChannel for Script {
        async fn read_line(&mut self) -> Result<String, TransportError> {
            self.replies
                .pop_front()
                .map(ToString::to_string)
                .ok_or(TransportError::Closed)
        }

        async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
            if let Some(left) = self.fail_writes_after.as_mut() {
                if *left == 0 {
                    return Err(TransportError::Closed);
                }
                *left -= 1;
            }
            self.written.extend_from_slice(data);
            Ok(())
        }

        async fn start_tls(&mut self, _host: &str) -> Result<(), TransportError> {
            Ok(())
        }

        fn is_encrypted(&self) -> bool {
            false
        }

        async fn shutdown(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn esmtp(extensions: &[&str]) -> Capabilities {
        Capabilities::from_ehlo(&Reply::new(
            Some(ReplyCode::OK),
            extensions.iter().map(ToString::to_string).collect(),
        ))
    }

    fn message() -> Message {
        Message::parse(b"From: a@example.com\r\nBcc: hidden@example.com\r\nSubject: hi\r\n\r\n.leading dot\r\n")
            .unwrap()
    }

    #[tokio::test]
    async fn test_successful_send() {
        let mut channel = Script::new(&["250 ok", "250 ok", "354 go", "250 queued", "250 reset"]);
        let caps = esmtp(&[]);
        let mut msg = message();
        let before = msg.clone();

        let mut engine = TransactionEngine::new(&mut channel, &caps);
        engine
            .send("a@example.com", &["b@example.com"], &mut msg)
            .await
            .unwrap();
        assert_eq!(engine.state(), TransactionState::Complete);

        let wire = String::from_utf8(channel.written.clone()).unwrap();
        assert!(wire.starts_with("MAIL FROM:<a@example.com>\r\nRCPT TO:<b@example.com>\r\nDATA\r\n"));
        assert!(!wire.contains("Bcc"));
        assert!(wire.contains("\r\n\r\n..leading dot\r\n.\r\n"));
        assert!(wire.ends_with("RSET\r\n"));
        assert_eq!(msg, before);
    }

    #[tokio::test]
    async fn test_second_recipient_rejected() {
        let mut channel = Script::new(&["250 ok", "250 ok", "550 5.1.1 no such user", "250 reset"]);
        let caps = esmtp(&["ENHANCEDSTATUSCODES"]);
        let mut msg = message();

        let mut engine = TransactionEngine::new(&mut channel, &caps);
        let err = engine
            .send(
                "a@example.com",
                &["one@example.com", "two@example.com", "three@example.com"],
                &mut msg,
            )
            .await
            .unwrap_err();
        assert_eq!(engine.state(), TransactionState::Failed);

        match err {
            SendError::RecipientRejected { address, source } => {
                assert_eq!(address, "two@example.com");
                assert_eq!(source.code(), Some(550));
                assert!(source.to_string().contains("no such user"));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let commands = channel.commands();
        assert!(!commands.iter().any(|c| c == "DATA"));
        assert!(!commands.iter().any(|c| c.contains("three@")));
        assert!(commands.iter().any(|c| c == "RSET"));
    }

    #[tokio::test]
    async fn test_validation_happens_before_io() {
        let caps = esmtp(&[]);
        let mut msg = message();

        let mut channel = Script::new(&[]);
        let mut engine = TransactionEngine::new(&mut channel, &caps);
        let no_rcpt: [&str; 0] = [];
        assert!(matches!(
            engine.send("a@example.com", &no_rcpt, &mut msg).await,
            Err(SendError::NoRecipients)
        ));
        assert!(matches!(
            engine.send("not-an-address", &["b@example.com"], &mut msg).await,
            Err(SendError::InvalidSender(_))
        ));
        assert!(matches!(
            engine.send("a@example.com", &["b@example.com", "bad"], &mut msg).await,
            Err(SendError::InvalidRecipient(_))
        ));
        assert!(channel.written.is_empty());
    }

    #[tokio::test]
    async fn test_8bitmime_requested_when_advertised() {
        let mut channel = Script::new(&["250 ok", "250 ok", "354 go", "250 queued", "250 reset"]);
        let caps = esmtp(&["8BITMIME"]);
        let mut msg = Message::new().header("Subject", "x").body("caf\u{e9}\r\n");

        TransactionEngine::new(&mut channel, &caps)
            .send("a@example.com", &["b@example.com"], &mut msg)
            .await
            .unwrap();
        assert_eq!(channel.commands()[0], "MAIL FROM:<a@example.com> BODY=8BITMIME");
        assert!(!msg.header_values("Content-Transfer-Encoding").contains(&"quoted-printable"));
    }

    #[tokio::test]
    async fn test_8bit_downgraded_without_8bitmime() {
        let mut channel = Script::new(&["250 ok", "250 ok", "354 go", "250 queued", "250 reset"]);
        let caps = esmtp(&[]);
        let mut msg = Message::new().header("Subject", "x").body("caf\u{e9}\r\n");

        TransactionEngine::new(&mut channel, &caps)
            .send("a@example.com", &["b@example.com"], &mut msg)
            .await
            .unwrap();
        assert_eq!(channel.commands()[0], "MAIL FROM:<a@example.com>");
        assert!(channel.written.is_ascii());
        // The caller's message keeps the downgraded body.
        assert_eq!(
            msg.header_values("Content-Transfer-Encoding"),
            vec!["quoted-printable"]
        );
        assert_eq!(msg.body_bytes(), b"caf=C3=A9\r\n");
    }

    #[tokio::test]
    async fn test_reused_engine_starts_from_idle() {
        let mut channel = Script::new(&["250 ok", "550 no such user", "250 reset"]);
        let caps = esmtp(&[]);
        let mut msg = message();

        let mut engine = TransactionEngine::new(&mut channel, &caps);
        engine
            .send("a@example.com", &["b@example.com"], &mut msg)
            .await
            .unwrap_err();
        assert_eq!(engine.state(), TransactionState::Failed);

        let err = engine
            .send("a@example.com", &["bad"], &mut msg)
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::InvalidRecipient(_)));
        assert_eq!(engine.state(), TransactionState::Idle);

        let resets = channel.commands().iter().filter(|c| *c == "RSET").count();
        assert_eq!(resets, 1);
    }

    #[tokio::test]
    async fn test_data_rejected() {
        let mut channel = Script::new(&["250 ok", "250 ok", "554 no", "250 reset"]);
        let caps = esmtp(&[]);
        let mut msg = message();

        let err = TransactionEngine::new(&mut channel, &caps)
            .send("a@example.com", &["b@example.com"], &mut msg)
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::DataPhaseRejected(ref e) if e.code() == Some(554)));
        assert!(err.to_string().contains("Transaction failed"));
    }

    #[tokio::test]
    async fn test_write_failure_is_transmission_error() {
        let mut channel = Script::new(&["250 ok", "250 ok", "354 go"]);
        channel.fail_writes_after = Some(3);
        let caps = esmtp(&[]);
        let mut msg = message();
        let before = msg.clone();

        let err = TransactionEngine::new(&mut channel, &caps)
            .send("a@example.com", &["b@example.com"], &mut msg)
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::TransmissionIoFailure(_)));
        assert!(err.to_string().ends_with("mail not sent"));
        assert_eq!(msg, before);
    }

    #[tokio::test]
    async fn test_rset_failure_does_not_mask_success() {
        let mut channel = Script::new(&["250 ok", "250 ok", "354 go", "250 queued", "500 what"]);
        let caps = esmtp(&[]);
        let mut msg = message();

        TransactionEngine::new(&mut channel, &caps)
            .send("a@example.com", &["b@example.com"], &mut msg)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_termination_rejected() {
        let mut channel = Script::new(&["250 ok", "250 ok", "354 go", "552 too big", "250 reset"]);
        let caps = esmtp(&[]);
        let mut msg = message();

        let err = TransactionEngine::new(&mut channel, &caps)
            .send("a@example.com", &["b@example.com"], &mut msg)
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::TerminationRejected(ref e) if e.code() == Some(552)));
    }

    #[test]
    fn test_extension_helper_parses() {
        let caps = esmtp(&["8BITMIME"]);
        assert!(caps.eight_bit_mime);
        assert_eq!(Extension::parse("8BITMIME"), Extension::EightBitMime);
    }
}
