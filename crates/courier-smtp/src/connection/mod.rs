//! SMTP connection management.
//!
//! A [`Connector`] opens [`LineChannel`]s; the [`Session`] drives the
//! greeting, EHLO, STARTTLS and authentication over them and hands the open
//! channel to the transaction engine for each message.

mod codec;
mod config;
mod session;
mod stream;
mod transaction;

pub use codec::DotStuffer;
pub use config::{Config, ConfigBuilder, DEFAULT_PORT, DEFAULT_TLS_PORT, Security};
pub use session::{ConnectionState, Session};
pub use stream::{NetworkChannel, SmtpStream, TcpConnector};
pub use transaction::{TransactionEngine, TransactionState};

use std::net::SocketAddr;

use crate::command::Command;
use crate::error::{ConnectError, ReplyError, TransportError};
use crate::parser::{self, status};
use crate::types::{Reply, ReplyCode};

/// Duplex line-oriented byte stream to a server.
#[allow(async_fn_in_trait)]
pub trait LineChannel {
    /// Reads one line without its line terminator.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] at end of stream, or the I/O error.
    async fn read_line(&mut self) -> Result<String, TransportError>;

    /// Writes and flushes `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Performs a TLS handshake over the existing stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake fails or the stream is already
    /// encrypted.
    async fn start_tls(&mut self, host: &str) -> Result<(), TransportError>;

    /// Returns true if the stream is encrypted.
    fn is_encrypted(&self) -> bool;

    /// Local socket address, used to build the HELO identity.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Closes the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown fails.
    async fn shutdown(&mut self) -> Result<(), TransportError>;
}

/// Opens channels to a server.
#[allow(async_fn_in_trait)]
pub trait Connector {
    /// Channel type produced by this connector.
    type Channel: LineChannel;

    /// Connects to `host:port`, with TLS from the first byte if
    /// `implicit_tls` is set.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::HostUnreachable`] if the host cannot be
    /// resolved and [`ConnectError::ServiceUnavailable`] if nothing usable
    /// answers on the port.
    async fn open(
        &self,
        host: &str,
        port: u16,
        implicit_tls: bool,
    ) -> Result<Self::Channel, ConnectError>;
}

/// Writes one command.
pub(crate) async fn send_command<C>(channel: &mut C, command: &Command) -> Result<(), ReplyError>
where
    C: LineChannel + ?Sized,
{
    tracing::trace!(command = %command.redacted(), "C:");
    channel
        .write_all(&command.serialize())
        .await
        .map_err(|source| ReplyError::Transport {
            command: command.name(),
            source,
        })
}

/// Reads the reply to `command`.
pub(crate) async fn receive<C>(channel: &mut C, command: &'static str) -> Result<Reply, ReplyError>
where
    C: LineChannel + ?Sized,
{
    parser::read_reply(channel)
        .await
        .map_err(|source| ReplyError::Transport { command, source })
}

/// Builds the error for a reply that did not carry `expected`.
pub(crate) fn rejected(
    reply: &Reply,
    command: &'static str,
    expected: ReplyCode,
    enhanced: bool,
) -> ReplyError {
    ReplyError::Rejected {
        command,
        expected: expected.as_u16(),
        received: reply.code_u16(),
        text: status::describe(reply, enhanced),
    }
}

/// Sends a command and requires a reply with the `expected` code.
pub(crate) async fn exchange<C>(
    channel: &mut C,
    command: &Command,
    expected: ReplyCode,
    enhanced: bool,
) -> Result<Reply, ReplyError>
where
    C: LineChannel + ?Sized,
{
    send_command(channel, command).await?;
    let reply = receive(channel, command.name()).await?;
    if reply.is(expected) {
        Ok(reply)
    } else {
        Err(rejected(&reply, command.name(), expected, enhanced))
    }
}
