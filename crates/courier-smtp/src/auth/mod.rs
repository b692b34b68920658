//! SMTP authentication.
//!
//! [`SaslMechanism`] implementations produce the bytes of one exchange,
//! [`authenticate`] drives them against the server, and a
//! [`CredentialProvider`] supplies passwords to the session when it needs
//! them.

mod mechanism;
mod negotiator;

pub use mechanism::{
    Bearer, Credentials, External, Login, MechanismError, Plain, SaslMechanism,
};
pub use negotiator::authenticate;

use crate::error::AuthError;

/// Description of a mechanism this crate implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthType {
    /// Mechanism name as advertised by servers.
    pub name: &'static str,
    /// Human-readable description.
    pub description: &'static str,
    /// Whether a password (or token) has to be obtained first.
    pub needs_password: bool,
}

/// Every mechanism this crate implements.
pub const AUTH_TYPES: &[AuthType] = &[
    AuthType {
        name: "PLAIN",
        description: "This option will connect to the server using a simple password.",
        needs_password: true,
    },
    AuthType {
        name: "LOGIN",
        description: "This option will connect to the server using a simple password.",
        needs_password: true,
    },
    AuthType {
        name: "XOAUTH2",
        description: "This option will connect to the server using an OAuth 2.0 access token.",
        needs_password: true,
    },
    AuthType {
        name: "OAUTHBEARER",
        description: "This option will connect to the server using an OAuth 2.0 bearer token (RFC 7628).",
        needs_password: true,
    },
    AuthType {
        name: "EXTERNAL",
        description: "This option will authenticate with credentials established outside SMTP, such as a TLS client certificate.",
        needs_password: false,
    },
];

/// Looks up a mechanism by name (case-insensitive).
#[must_use]
pub fn auth_type(name: &str) -> Option<&'static AuthType> {
    AUTH_TYPES
        .iter()
        .find(|t| t.name.eq_ignore_ascii_case(name))
}

/// Creates the mechanism called `name`.
///
/// # Errors
///
/// Returns [`AuthError::MechanismUnavailableLocally`] if the mechanism is not
/// implemented.
pub fn mechanism_for(
    name: &str,
    credentials: Credentials,
) -> Result<Box<dyn SaslMechanism>, AuthError> {
    let Some(auth_type) = auth_type(name) else {
        return Err(AuthError::MechanismUnavailableLocally(name.to_string()));
    };

    Ok(match auth_type.name {
        "PLAIN" => Box::new(Plain::new(credentials)),
        "LOGIN" => Box::new(Login::new(credentials)),
        "XOAUTH2" => Box::new(Bearer::xoauth2(credentials)),
        "OAUTHBEARER" => Box::new(Bearer::oauthbearer(credentials)),
        _ => Box::new(External::new()),
    })
}

/// Source of passwords for the authentication gate.
pub trait CredentialProvider {
    /// Asks for the password. `None` means the user cancelled.
    fn password(&mut self, prompt: &str) -> Option<String>;

    /// Drops any cached copy of the password after it was rejected.
    fn forget_password(&mut self) {}
}

impl<F> CredentialProvider for F
where
    F: FnMut(&str) -> Option<String>,
{
    fn password(&mut self, prompt: &str) -> Option<String> {
        self(prompt)
    }
}

/// Provider that never has a password.
///
/// Suitable when no mechanism is configured or the mechanism needs none.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

impl CredentialProvider for NoCredentials {
    fn password(&mut self, _prompt: &str) -> Option<String> {
        None
    }
}

/// Builds the password prompt, including the previous failure if any.
#[must_use]
pub fn password_prompt(user: &str, host: &str, failure: Option<&str>) -> String {
    let base = format!("Please enter the SMTP password for {user}@{host}");
    match failure {
        Some(error) => format!("Unable to authenticate to SMTP server.\n{error}\n\n{base}"),
        None => base,
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
    fn test_auth_type_lookup() {
        assert_eq!(auth_type("plain").unwrap().name, "PLAIN");
        assert!(!auth_type("EXTERNAL").unwrap().needs_password);
        assert!(auth_type("CRAM-MD5").is_none());
    }

    #[test]
    fn test_mechanism_for() {
        let creds = Credentials::new("u", "p");
        assert_eq!(mechanism_for("login", creds.clone()).unwrap().name(), "LOGIN");
        assert_eq!(mechanism_for("XOAUTH2", creds.clone()).unwrap().name(), "XOAUTH2");
        assert!(matches!(
            mechanism_for("GSSAPI", creds),
            Err(AuthError::MechanismUnavailableLocally(name)) if name == "GSSAPI"
        ));
    }

    #[test]
    fn test_closure_provider() {
        let mut asked = Vec::new();
        let mut provider = |prompt: &str| {
            asked.push(prompt.to_string());
            Some("pw".to_string())
        };
        assert_eq!(provider.password("hello").as_deref(), Some("pw"));
        provider.forget_password();
        assert_eq!(asked, vec!["hello"]);
    }

    #[test]
    fn test_no_credentials() {
        assert_eq!(NoCredentials.password("anything"), None);
    }

    #[test]
    fn test_password_prompt() {
        assert_eq!(
            password_prompt("bob", "mail.example.com", None),
            "Please enter the SMTP password for bob@mail.example.com"
        );
        assert_eq!(
            password_prompt("bob", "mail.example.com", Some("bad password")),
            "Unable to authenticate to SMTP server.\nbad password\n\nPlease enter the SMTP password for bob@mail.example.com"
        );
    }
}
