//! SASL mechanisms.
//!
//! Implements:
//! - PLAIN (RFC 4616) - Basic username/password authentication
//! - LOGIN - Username and password sent as answers to two challenges
//! - XOAUTH2 (Google/Microsoft proprietary) - Legacy `OAuth2` authentication
//! - OAUTHBEARER (RFC 7628) - Standard `OAuth2` authentication
//! - EXTERNAL (RFC 4422) - Identity established outside SASL, e.g. a TLS
//!   client certificate
//!
//! Mechanisms only produce raw bytes. Base64 framing and the `334`/`235`
//! exchange belong to the negotiator.

use std::fmt;

/// Username and secret used by a mechanism.
///
/// For the `OAuth2` mechanisms the secret is the bearer token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    secret: String,
}

impl Credentials {
    /// Creates credentials from a username and secret.
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }

    /// Returns the username.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// A mechanism could not answer a challenge.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MechanismError {
    /// The server sent more challenges than the mechanism expects.
    #[error("{mechanism} received an unexpected challenge")]
    UnexpectedChallenge {
        /// Mechanism name.
        mechanism: &'static str,
    },
}

/// Client side of one SASL exchange.
pub trait SaslMechanism: Send {
    /// Mechanism name as advertised by servers.
    fn name(&self) -> &'static str;

    /// Produces the next client response.
    ///
    /// Called with `None` once before `AUTH` is sent; returning `Some` there
    /// supplies an initial response. Afterwards called with each decoded
    /// server challenge.
    ///
    /// # Errors
    ///
    /// Returns an error if the challenge cannot be answered.
    fn challenge(&mut self, challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>, MechanismError>;

    /// True once the mechanism has nothing more to send.
    fn is_authenticated(&self) -> bool;
}

/// PLAIN: `\0<username>\0<password>` as the initial response.
#[derive(Debug)]
pub struct Plain {
    credentials: Credentials,
    authenticated: bool,
}

impl Plain {
    /// Creates the mechanism.
    #[must_use]
    pub const fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            authenticated: false,
        }
    }
}

impl SaslMechanism for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn challenge(&mut self, _challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>, MechanismError> {
        // The first NUL is for the authorization identity (empty = same as auth identity)
        self.authenticated = true;
        Ok(Some(
            format!(
                "\0{}\0{}",
                self.credentials.username, self.credentials.secret
            )
            .into_bytes(),
        ))
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated
    }
}

/// LOGIN: no initial response, then username and password in turn.
#[derive(Debug)]
pub struct Login {
    credentials: Credentials,
    step: u8,
}

impl Login {
    /// Creates the mechanism.
    #[must_use]
    pub const fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            step: 0,
        }
    }
}

impl SaslMechanism for Login {
    fn name(&self) -> &'static str {
        "LOGIN"
    }

    fn challenge(&mut self, challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>, MechanismError> {
        if challenge.is_none() {
            return Ok(None);
        }
        // Challenge texts ("Username:", "Password:") vary between servers,
        // so only the order is relied on.
        let response = match self.step {
            0 => self.credentials.username.clone(),
            1 => self.credentials.secret.clone(),
            _ => {
                return Err(MechanismError::UnexpectedChallenge {
                    mechanism: "LOGIN",
                });
            }
        };
        self.step += 1;
        Ok(Some(response.into_bytes()))
    }

    fn is_authenticated(&self) -> bool {
        self.step >= 2
    }
}

/// Bearer token mechanisms: XOAUTH2 and OAUTHBEARER.
///
/// On failure the server sends a JSON error as a challenge; the client
/// answers it with an empty response and gets the final error reply.
#[derive(Debug)]
pub struct Bearer {
    credentials: Credentials,
    standard: bool,
    authenticated: bool,
}

impl Bearer {
    /// Creates the XOAUTH2 mechanism.
    #[must_use]
    pub const fn xoauth2(credentials: Credentials) -> Self {
        Self {
            credentials,
            standard: false,
            authenticated: false,
        }
    }

    /// Creates the OAUTHBEARER mechanism.
    #[must_use]
    pub const fn oauthbearer(credentials: Credentials) -> Self {
        Self {
            credentials,
            standard: true,
            authenticated: false,
        }
    }
}

impl SaslMechanism for Bearer {
    fn name(&self) -> &'static str {
        if self.standard { "OAUTHBEARER" } else { "XOAUTH2" }
    }

    fn challenge(&mut self, challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>, MechanismError> {
        if let Some(error) = challenge {
            if !error.is_empty() {
                tracing::debug!(
                    mechanism = self.name(),
                    error = %String::from_utf8_lossy(error),
                    "bearer token rejected"
                );
            }
            self.authenticated = true;
            return Ok(Some(Vec::new()));
        }

        let Credentials { username, secret } = &self.credentials;
        let response = if self.standard {
            format!("n,a={username},\x01auth=Bearer {secret}\x01\x01")
        } else {
            format!("user={username}\x01auth=Bearer {secret}\x01\x01")
        };
        self.authenticated = true;
        Ok(Some(response.into_bytes()))
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated
    }
}

/// EXTERNAL: an empty initial response, no credential involved.
#[derive(Debug, Default)]
pub struct External {
    authenticated: bool,
}

impl External {
    /// Creates the mechanism.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            authenticated: false,
        }
    }
}

impl SaslMechanism for External {
    fn name(&self) -> &'static str {
        "EXTERNAL"
    }

    fn challenge(&mut self, _challenge: Option<&[u8]>) -> Result<Option<Vec<u8>>, MechanismError> {
        self.authenticated = true;
        Ok(Some(Vec::new()))
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated
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

    fn creds() -> Credentials {
        Credentials::new("user@example.com", "secret")
    }

    #[test]
    fn test_credentials_debug_hides_secret() {
        let debug = format!("{:?}", creds());
        assert!(debug.contains("user@example.com"));
        assert!(!debug.contains("secret"));
    }

    #[test]
    fn test_plain_initial_response() {
        let mut mech = Plain::new(creds());
        assert!(!mech.is_authenticated());
        let ir = mech.challenge(None).unwrap().unwrap();
        assert_eq!(ir, b"\0user@example.com\0secret");
        assert!(mech.is_authenticated());
    }

    #[test]
    fn test_login_sequence() {
        let mut mech = Login::new(creds());
        assert_eq!(mech.challenge(None).unwrap(), None);
        assert_eq!(
            mech.challenge(Some(b"Username:")).unwrap().unwrap(),
            b"user@example.com"
        );
        assert!(!mech.is_authenticated());
        assert_eq!(
            mech.challenge(Some(b"Password:")).unwrap().unwrap(),
            b"secret"
        );
        assert!(mech.is_authenticated());
        assert!(mech.challenge(Some(b"More?")).is_err());
    }

    #[test]
    fn test_xoauth2_initial_response() {
        let mut mech = Bearer::xoauth2(Credentials::new("user@example.com", "token123"));
        assert_eq!(mech.name(), "XOAUTH2");
        let ir = mech.challenge(None).unwrap().unwrap();
        assert_eq!(ir, b"user=user@example.com\x01auth=Bearer token123\x01\x01");
        assert!(mech.is_authenticated());
    }

    #[test]
    fn test_oauthbearer_initial_response() {
        let mut mech = Bearer::oauthbearer(Credentials::new("user@example.com", "token123"));
        assert_eq!(mech.name(), "OAUTHBEARER");
        let ir = mech.challenge(None).unwrap().unwrap();
        assert_eq!(
            ir,
            b"n,a=user@example.com,\x01auth=Bearer token123\x01\x01"
        );
    }

    #[test]
    fn test_bearer_error_challenge_gets_empty_response() {
        let mut mech = Bearer::xoauth2(creds());
        mech.challenge(None).unwrap();
        let resp = mech
            .challenge(Some(br#"{"status":"401","schemes":"bearer"}"#))
            .unwrap()
            .unwrap();
        assert!(resp.is_empty());
    }

    #[test]
    fn test_external_empty_initial_response() {
        let mut mech = External::new();
        assert_eq!(mech.challenge(None).unwrap(), Some(Vec::new()));
        assert!(mech.is_authenticated());
    }
}
