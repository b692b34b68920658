//! Connection supervisor.
//!
//! Owns the channel and everything learned about the server, and enforces
//! the connect policy: implicit TLS with STARTTLS fallback, opportunistic
//! STARTTLS, or plaintext.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use super::{
    Config, Connector, LineChannel, Security, TcpConnector, TransactionEngine, exchange,
};
use crate::auth::{self, CredentialProvider, Credentials, password_prompt};
use crate::command::Command;
use crate::error::{AuthError, ConnectError, ReplyError, Result, SendError, TransportError};
use crate::parser::{self, status};
use crate::types::{Capabilities, MessageSource, ReplyCode};

const GREETING: &str = "greeting";

/// Where the session stands with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No channel.
    Disconnected,
    /// Greeted over plaintext.
    Connected,
    /// STARTTLS accepted, handshake not finished.
    EncryptedPending,
    /// Channel is encrypted.
    Encrypted,
    /// Authentication succeeded.
    Authenticated,
}

/// An SMTP session with one server.
///
/// Commands are strictly sequential: the session is driven through
/// `&mut self`, so concurrent senders need their own synchronization.
pub struct Session<K: Connector, P> {
    config: Config,
    connector: K,
    credentials: P,
    channel: Option<K::Channel>,
    capabilities: Capabilities,
    state: ConnectionState,
    password: Option<String>,
}

impl<P: CredentialProvider> Session<TcpConnector, P> {
    /// Connects over the network using the deadlines in `config`.
    ///
    /// # Errors
    ///
    /// See [`Session::connect`].
    pub async fn open_tcp(config: Config, credentials: P) -> Result<Self> {
        let connector = TcpConnector::from_config(&config);
        Self::open(config, connector, credentials).await
    }
}

impl<K, P> Session<K, P>
where
    K: Connector,
    P: CredentialProvider,
{
    /// Creates a disconnected session.
    #[must_use]
    pub fn new(config: Config, connector: K, credentials: P) -> Self {
        Self {
            config,
            connector,
            credentials,
            channel: None,
            capabilities: Capabilities::default(),
            state: ConnectionState::Disconnected,
            password: None,
        }
    }

    /// Creates a session and connects it.
    ///
    /// # Errors
    ///
    /// See [`Session::connect`].
    pub async fn open(config: Config, connector: K, credentials: P) -> Result<Self> {
        let mut session = Self::new(config, connector, credentials);
        session.connect().await?;
        Ok(session)
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the connection state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Returns what the server advertised on the last EHLO/HELO.
    #[must_use]
    pub const fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Returns true if a channel is open.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    /// Connects, negotiates encryption and authenticates.
    ///
    /// Any previous connection is dropped first.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectError`] or [`AuthError`]. The session is
    /// disconnected afterwards.
    pub async fn connect(&mut self) -> Result<()> {
        self.disconnect(false).await;

        if let Err(e) = self.establish().await {
            self.disconnect(false).await;
            return Err(e.into());
        }

        if let Err(e) = self.authenticate().await {
            let clean = !matches!(e, AuthError::Transport(_));
            self.disconnect(clean).await;
            return Err(e.into());
        }

        tracing::info!(
            host = %self.config.host,
            state = ?self.state,
            esmtp = self.capabilities.is_esmtp,
            "connected to SMTP server"
        );
        Ok(())
    }

    /// Sends one message.
    ///
    /// A failure of the connection itself (as opposed to a refusal by the
    /// server) also disconnects the session.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::NotConnected`] without a connection, otherwise
    /// the error of the failed transaction step.
    pub async fn send<M, S>(
        &mut self,
        sender: &str,
        recipients: &[S],
        message: &mut M,
    ) -> std::result::Result<(), SendError>
    where
        M: MessageSource + ?Sized,
        S: AsRef<str>,
    {
        if self.state == ConnectionState::Disconnected {
            return Err(SendError::NotConnected);
        }
        let Some(channel) = self.channel.as_mut() else {
            return Err(SendError::NotConnected);
        };

        let result = TransactionEngine::new(channel, &self.capabilities)
            .send(sender, recipients, message)
            .await;

        if let Err(e) = &result {
            if e.is_connection_lost() {
                tracing::warn!(error = %e, "connection lost during send");
                self.disconnect(false).await;
            }
        }
        result
    }

    /// Closes the connection, with `QUIT` first if `clean`.
    ///
    /// Never fails: `QUIT` and shutdown errors are only logged. All
    /// per-connection state is cleared.
    pub async fn disconnect(&mut self, clean: bool) {
        if let Some(mut channel) = self.channel.take() {
            if clean {
                let enhanced = self.capabilities.enhanced_status_codes;
                if let Err(e) =
                    exchange(&mut channel, &Command::Quit, ReplyCode::CLOSING, enhanced).await
                {
                    tracing::warn!(error = %e, "QUIT failed");
                }
            }
            if let Err(e) = channel.shutdown().await {
                tracing::debug!(error = %e, "shutdown failed");
            }
        }
        self.capabilities.clear();
        transition(&mut self.state, ConnectionState::Disconnected);
    }

    /// Returns the advertised SASL mechanisms this crate can use.
    ///
    /// Uses the current connection if there is one, otherwise connects
    /// without authenticating and disconnects again.
    ///
    /// # Errors
    ///
    /// Returns an error if a temporary connection cannot be established.
    pub async fn query_auth_types(
        &mut self,
    ) -> std::result::Result<BTreeSet<String>, ConnectError> {
        let temporary = self.channel.is_none();
        if temporary {
            if let Err(e) = self.establish().await {
                self.disconnect(false).await;
                return Err(e);
            }
        }

        let types = self
            .capabilities
            .auth_mechanisms()
            .iter()
            .filter(|name| auth::auth_type(name).is_some())
            .cloned()
            .collect();

        if temporary {
            self.disconnect(true).await;
        }
        Ok(types)
    }

    async fn establish(&mut self) -> std::result::Result<(), ConnectError> {
        match self.config.security {
            Security::Always => match self.open_channel(self.config.tls_port(), true).await {
                Err(e) if e.is_service_unavailable() => {
                    tracing::warn!(error = %e, "implicit TLS unavailable, trying STARTTLS");
                    self.open_channel(self.config.plain_port(), false).await?;
                    if !self.capabilities.starttls {
                        return Err(ConnectError::StartTlsUnsupported {
                            host: self.config.host.clone(),
                        });
                    }
                    self.start_tls().await
                }
                other => other,
            },
            Security::WhenPossible => {
                self.open_channel(self.config.plain_port(), false).await?;
                if self.capabilities.starttls {
                    self.start_tls().await
                } else {
                    tracing::debug!("STARTTLS not offered, staying in plaintext");
                    Ok(())
                }
            }
            Security::Never => self.open_channel(self.config.plain_port(), false).await,
        }
    }

    /// Opens a channel, reads the greeting and says hello.
    async fn open_channel(
        &mut self,
        port: u16,
        implicit_tls: bool,
    ) -> std::result::Result<(), ConnectError> {
        let opened = self
            .connector
            .open(&self.config.host, port, implicit_tls)
            .await?;
        let channel = self.channel.insert(opened);
        transition(
            &mut self.state,
            if implicit_tls {
                ConnectionState::Encrypted
            } else {
                ConnectionState::Connected
            },
        );

        let esmtp = read_greeting(channel).await?;
        let name = hello_name(self.config.hello_name.as_deref(), channel.local_addr());
        self.capabilities = hello(channel, &name, esmtp).await?;
        tracing::debug!(capabilities = ?self.capabilities, "server capabilities");
        Ok(())
    }

    async fn start_tls(&mut self) -> std::result::Result<(), ConnectError> {
        let host = &self.config.host;
        let Some(channel) = self.channel.as_mut() else {
            return Err(ConnectError::StartTlsHandshakeFailed {
                host: host.clone(),
                source: TransportError::Closed,
            });
        };

        exchange(
            &mut *channel,
            &Command::StartTls,
            ReplyCode::SERVICE_READY,
            self.capabilities.enhanced_status_codes,
        )
        .await
        .map_err(ConnectError::StartTls)?;
        transition(&mut self.state, ConnectionState::EncryptedPending);

        channel
            .start_tls(host)
            .await
            .map_err(|source| ConnectError::StartTlsHandshakeFailed {
                host: host.clone(),
                source,
            })?;
        transition(&mut self.state, ConnectionState::Encrypted);
        Ok(())
    }

    /// Authentication gate run after every connect.
    async fn authenticate(&mut self) -> std::result::Result<(), AuthError> {
        let Self {
            config,
            credentials,
            channel,
            capabilities,
            state,
            password,
            ..
        } = self;

        let Some(mechanism) = config.auth_mechanism.as_deref() else {
            return Ok(());
        };
        let Some(channel) = channel.as_mut() else {
            return Err(AuthError::Transport(ReplyError::Transport {
                command: "AUTH",
                source: TransportError::Closed,
            }));
        };

        if !capabilities.is_esmtp || capabilities.auth_mechanisms().is_empty() {
            tracing::warn!(
                mechanism,
                "server does not advertise authentication, continuing without it"
            );
            return Ok(());
        }
        if !capabilities.supports_auth(mechanism) {
            return Err(AuthError::MechanismUnsupportedByServer {
                mechanism: mechanism.to_string(),
            });
        }
        let auth_type = auth::auth_type(mechanism)
            .ok_or_else(|| AuthError::MechanismUnavailableLocally(mechanism.to_string()))?;

        if auth_type.needs_password {
            let mut failure: Option<String> = None;
            loop {
                let secret = match password.take() {
                    Some(secret) => secret,
                    None => {
                        let prompt =
                            password_prompt(&config.username, &config.host, failure.as_deref());
                        credentials
                            .password(&prompt)
                            .ok_or(AuthError::UserCancelled)?
                    }
                };

                let mut sasl = auth::mechanism_for(
                    mechanism,
                    Credentials::new(config.username.clone(), secret.clone()),
                )?;
                match auth::authenticate(&mut *channel, &*capabilities, sasl.as_mut()).await {
                    Ok(()) => {
                        *password = Some(secret);
                        break;
                    }
                    Err(e) if e.is_retryable() => {
                        tracing::warn!(error = %e, "authentication failed");
                        credentials.forget_password();
                        failure = Some(e.to_string());
                    }
                    Err(e) => return Err(e),
                }
            }
        } else {
            let mut sasl =
                auth::mechanism_for(mechanism, Credentials::new(config.username.clone(), ""))?;
            auth::authenticate(&mut *channel, &*capabilities, sasl.as_mut()).await?;
        }
        transition(state, ConnectionState::Authenticated);

        // Some servers only advertise extensions to authenticated clients.
        let name = hello_name(config.hello_name.as_deref(), channel.local_addr());
        let ehlo = Command::Ehlo { hostname: name };
        match exchange(channel, &ehlo, ReplyCode::OK, capabilities.enhanced_status_codes).await {
            Ok(reply) => *capabilities = Capabilities::from_ehlo(&reply),
            Err(e) => tracing::warn!(error = %e, "EHLO after authentication failed"),
        }
        Ok(())
    }
}

impl<K: Connector, P> fmt::Debug for Session<K, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.config.host)
            .field("state", &self.state)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

fn transition(state: &mut ConnectionState, next: ConnectionState) {
    if *state != next {
        tracing::debug!(from = ?*state, to = ?next, "connection state changed");
        *state = next;
    }
}

/// Reads the greeting. Returns true if the server announced ESMTP.
async fn read_greeting<C>(channel: &mut C) -> std::result::Result<bool, ConnectError>
where
    C: LineChannel + ?Sized,
{
    let lines = parser::read_reply_lines(channel).await.map_err(|source| {
        ConnectError::Greeting(ReplyError::Transport {
            command: GREETING,
            source,
        })
    })?;

    if let Some(line) = lines
        .iter()
        .find(|l| l.code != Some(ReplyCode::SERVICE_READY))
    {
        let received = line.code.map(ReplyCode::as_u16);
        return Err(ConnectError::Greeting(ReplyError::Rejected {
            command: GREETING,
            expected: ReplyCode::SERVICE_READY.as_u16(),
            received,
            text: status::fallback_text(received).to_string(),
        }));
    }

    Ok(lines
        .iter()
        .any(|l| l.text.to_ascii_uppercase().contains("ESMTP")))
}

/// EHLO, falling back to HELO unless the greeting already promised ESMTP.
async fn hello<C>(
    channel: &mut C,
    name: &str,
    esmtp: bool,
) -> std::result::Result<Capabilities, ConnectError>
where
    C: LineChannel + ?Sized,
{
    let ehlo = Command::Ehlo {
        hostname: name.to_string(),
    };
    match exchange(channel, &ehlo, ReplyCode::OK, false).await {
        Ok(reply) => Ok(Capabilities::from_ehlo(&reply)),
        Err(e @ ReplyError::Rejected { .. }) if !esmtp => {
            tracing::debug!(error = %e, "EHLO refused, falling back to HELO");
            let helo = Command::Helo {
                hostname: name.to_string(),
            };
            exchange(channel, &helo, ReplyCode::OK, false)
                .await
                .map_err(ConnectError::Ehlo)?;
            Ok(Capabilities::helo())
        }
        Err(e) => Err(ConnectError::Ehlo(e)),
    }
}

/// Name to announce: the configured one, else the local address literal.
fn hello_name(configured: Option<&str>, local: Option<SocketAddr>) -> String {
    if let Some(name) = configured.filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    match local.map(|addr| addr.ip()) {
        Some(IpAddr::V4(ip)) => format!("[{ip}]"),
        Some(IpAddr::V6(ip)) => format!("[IPv6:{ip}]"),
        None => "localhost".to_string(),
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

    #[test]
    fn test_hello_name_configured() {
        assert_eq!(hello_name(Some("client.example.com"), None), "client.example.com");
    }

    #[test]
    fn test_hello_name_address_literals() {
        let v4: SocketAddr = "192.0.2.1:4000".parse().unwrap();
        assert_eq!(hello_name(None, Some(v4)), "[192.0.2.1]");

        let v6: SocketAddr = "[2001:db8::1]:4000".parse().unwrap();
        assert_eq!(hello_name(Some(""), Some(v6)), "[IPv6:2001:db8::1]");
    }

    #[test]
    fn test_hello_name_fallback() {
        assert_eq!(hello_name(None, None), "localhost");
    }

    #[test]
    fn test_transition() {
        let mut state = ConnectionState::Disconnected;
        transition(&mut state, ConnectionState::Connected);
        assert_eq!(state, ConnectionState::Connected);
        transition(&mut state, ConnectionState::Connected);
        assert_eq!(state, ConnectionState::Connected);
    }
}
