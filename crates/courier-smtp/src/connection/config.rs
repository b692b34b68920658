//! Connection configuration types.

use std::str::FromStr;
use std::time::Duration;

/// Port for plain SMTP and STARTTLS.
pub const DEFAULT_PORT: u16 = 25;

/// Port for SMTP over TLS from the first byte.
pub const DEFAULT_TLS_PORT: u16 = 465;

/// Connection security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum Security {
    /// No encryption (port 25). **Not recommended for production.**
    Never,
    /// Upgrade with STARTTLS when the server offers it, plaintext otherwise.
    WhenPossible,
    /// TLS from the start (port 465), falling back to a mandatory STARTTLS
    /// on port 25 when nothing answers there.
    #[default]
    Always,
}

impl Security {
    /// Returns the default port for this security mode.
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::Never | Self::WhenPossible => DEFAULT_PORT,
            Self::Always => DEFAULT_TLS_PORT,
        }
    }
}

impl FromStr for Security {
    type Err = std::convert::Infallible;

    /// Parses the account setting: empty or `always` is [`Security::Always`],
    /// `when-possible` is [`Security::WhenPossible`], anything else is
    /// [`Security::Never`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "" | "always" => Self::Always,
            "when-possible" => Self::WhenPossible,
            _ => Self::Never,
        })
    }
}

/// SMTP connection configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Config {
    /// Server hostname.
    pub host: String,
    /// Server port, `None` for the default of each attempt.
    pub port: Option<u16>,
    /// Security mode.
    pub security: Security,
    /// SASL mechanism to authenticate with, `None` to skip authentication.
    pub auth_mechanism: Option<String>,
    /// Account username.
    pub username: String,
    /// Name sent with EHLO/HELO, `None` for the local address literal.
    pub hello_name: Option<String>,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Read/write timeout.
    pub io_timeout: Duration,
}

impl Config {
    /// Creates a new configuration with default security and no
    /// authentication.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        ConfigBuilder::new(host).build()
    }

    /// Creates a configuration builder.
    #[must_use]
    pub fn builder(host: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder::new(host)
    }

    /// Port for an implicit-TLS attempt.
    #[must_use]
    pub fn tls_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_TLS_PORT)
    }

    /// Port for a plaintext or STARTTLS attempt.
    #[must_use]
    pub fn plain_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}

/// Builder for connection configuration.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    host: String,
    port: Option<u16>,
    security: Security,
    auth_mechanism: Option<String>,
    username: String,
    hello_name: Option<String>,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl ConfigBuilder {
    /// Creates a new builder with the given hostname.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            security: Security::Always,
            auth_mechanism: None,
            username: String::new(),
            hello_name: None,
            connect_timeout: Duration::from_secs(30),
            io_timeout: Duration::from_secs(60),
        }
    }

    /// Sets the port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the security mode.
    #[must_use]
    pub const fn security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    /// Enables authentication with the given mechanism and username.
    #[must_use]
    pub fn auth(mut self, mechanism: impl Into<String>, username: impl Into<String>) -> Self {
        self.auth_mechanism = Some(mechanism.into());
        self.username = username.into();
        self
    }

    /// Sets the name announced in EHLO/HELO.
    #[must_use]
    pub fn hello_name(mut self, name: impl Into<String>) -> Self {
        self.hello_name = Some(name.into());
        self
    }

    /// Sets the connection timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the I/O timeout.
    #[must_use]
    pub const fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> Config {
        Config {
            host: self.host,
            port: self.port,
            security: self.security,
            auth_mechanism: self.auth_mechanism,
            username: self.username,
            hello_name: self.hello_name,
            connect_timeout: self.connect_timeout,
            io_timeout: self.io_timeout,
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

    #[test]
    fn test_default_ports() {
        assert_eq!(Security::Never.default_port(), 25);
        assert_eq!(Security::WhenPossible.default_port(), 25);
        assert_eq!(Security::Always.default_port(), 465);
    }

    #[test]
    fn test_security_from_str() {
        assert_eq!("".parse::<Security>().unwrap(), Security::Always);
        assert_eq!("always".parse::<Security>().unwrap(), Security::Always);
        assert_eq!(
            "when-possible".parse::<Security>().unwrap(),
            Security::WhenPossible
        );
        assert_eq!("never".parse::<Security>().unwrap(), Security::Never);
        assert_eq!("bogus".parse::<Security>().unwrap(), Security::Never);
    }

    #[test]
    fn test_config_new() {
        let config = Config::new("smtp.example.com");
        assert_eq!(config.host, "smtp.example.com");
        assert_eq!(config.port, None);
        assert_eq!(config.security, Security::Always);
        assert_eq!(config.auth_mechanism, None);
        assert_eq!(config.tls_port(), 465);
        assert_eq!(config.plain_port(), 25);
    }

    #[test]
    fn test_config_builder() {
        let config = Config::builder("smtp.example.com")
            .port(587)
            .security(Security::WhenPossible)
            .auth("PLAIN", "bob")
            .hello_name("client.example.com")
            .connect_timeout(Duration::from_secs(10))
            .build();

        assert_eq!(config.port, Some(587));
        assert_eq!(config.tls_port(), 587);
        assert_eq!(config.plain_port(), 587);
        assert_eq!(config.security, Security::WhenPossible);
        assert_eq!(config.auth_mechanism.as_deref(), Some("PLAIN"));
        assert_eq!(config.username, "bob");
        assert_eq!(config.hello_name.as_deref(), Some("client.example.com"));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.io_timeout, Duration::from_secs(60));
    }
}
