//! The `AUTH` challenge/response loop.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use super::SaslMechanism;
use crate::command::Command;
use crate::connection::{LineChannel, receive, rejected, send_command};
use crate::error::AuthError;
use crate::types::{Capabilities, Reply, ReplyCode};

const AUTH: &str = "AUTH";

/// Runs one SASL exchange with `mechanism`.
///
/// The mechanism must be advertised in `capabilities`. Retrying with other
/// credentials is up to the caller.
///
/// # Errors
///
/// - [`AuthError::MechanismUnsupportedByServer`] if the server does not
///   advertise the mechanism.
/// - [`AuthError::CredentialDenied`] if the server refuses the exchange.
/// - [`AuthError::ServerProtocolViolation`] if a challenge cannot be decoded
///   or answered; the exchange is cancelled with `*` first.
/// - [`AuthError::Transport`] if the connection fails.
pub async fn authenticate<C>(
    channel: &mut C,
    capabilities: &Capabilities,
    mechanism: &mut dyn SaslMechanism,
) -> Result<(), AuthError>
where
    C: LineChannel + ?Sized,
{
    let name = mechanism.name();
    if !capabilities.supports_auth(name) {
        return Err(AuthError::MechanismUnsupportedByServer {
            mechanism: name.to_string(),
        });
    }
    let enhanced = capabilities.enhanced_status_codes;

    let initial = mechanism
        .challenge(None)
        .map_err(|e| AuthError::ServerProtocolViolation(e.to_string()))?;
    let sent_initial = initial.is_some();
    let initial_response = initial.map(|bytes| {
        if bytes.is_empty() {
            "=".to_string()
        } else {
            STANDARD.encode(bytes)
        }
    });

    tracing::debug!(mechanism = name, initial_response = sent_initial, "starting SASL exchange");
    send_command(
        channel,
        &Command::Auth {
            mechanism: name.to_string(),
            initial_response,
        },
    )
    .await?;
    let mut reply = receive(channel, AUTH).await?;

    while !mechanism.is_authenticated() {
        if !reply.is(ReplyCode::AUTH_CONTINUE) {
            return Err(AuthError::CredentialDenied(rejected(
                &reply,
                AUTH,
                ReplyCode::AUTH_CONTINUE,
                enhanced,
            )));
        }
        reply = answer(channel, mechanism, &reply).await?;
    }

    // Some servers send one more challenge after an initial response that
    // already completed the mechanism.
    if sent_initial && reply.is(ReplyCode::AUTH_CONTINUE) {
        tracing::warn!(mechanism = name, "server sent a challenge after the initial response");
        reply = answer(channel, mechanism, &reply).await?;
    }

    if !reply.is(ReplyCode::AUTH_SUCCESS) {
        return Err(AuthError::CredentialDenied(rejected(
            &reply,
            AUTH,
            ReplyCode::AUTH_SUCCESS,
            enhanced,
        )));
    }

    tracing::debug!(mechanism = name, "authenticated");
    Ok(())
}

/// Answers the `334` challenge in `reply` and returns the next reply.
async fn answer<C>(
    channel: &mut C,
    mechanism: &mut dyn SaslMechanism,
    reply: &Reply,
) -> Result<Reply, AuthError>
where
    C: LineChannel + ?Sized,
{
    let encoded = reply.first_line().trim_start();
    let response = match STANDARD.decode(encoded) {
        Ok(challenge) => mechanism
            .challenge(Some(&challenge))
            .map_err(|e| e.to_string()),
        Err(e) => Err(format!("invalid challenge: {e}")),
    };

    match response {
        Ok(bytes) => {
            let bytes = bytes.unwrap_or_default();
            send_command(channel, &Command::AuthResponse(STANDARD.encode(bytes))).await?;
            Ok(receive(channel, AUTH).await?)
        }
        Err(reason) => {
            send_command(channel, &Command::AuthAbort).await?;
            let ack = receive(channel, AUTH).await?;
            tracing::debug!(code = ?ack.code_u16(), "SASL exchange cancelled");
            Err(AuthError::ServerProtocolViolation(reason))
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
    use crate::auth::{Bearer, Credentials, Login, Plain};
    use crate::error::TransportError;
    use crate::types::Extension;

    #[derive(Default)]
    struct Script {
        replies: VecDeque<String>,
        written: Vec<String>,
    }

    impl Script {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: replies.iter().map(ToString::to_string).collect(),
                written: Vec::new(),
            }
        }
    }

    impl LineChannel for Script {
        async fn read_line(&mut self) -> Result<String, TransportError> {
            self.replies.pop_front().ok_or(TransportError::Closed)
        }

        async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
            self.written
                .push(String::from_utf8_lossy(data).trim_end().to_string());
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

    fn caps(mechanisms: &[&str]) -> Capabilities {
        let mut caps = Capabilities::default();
        caps.apply(Extension::Auth(
            mechanisms.iter().map(ToString::to_string).collect(),
        ));
        caps
    }

    fn creds() -> Credentials {
        Credentials::new("user", "pass")
    }

    #[tokio::test]
    async fn test_plain_success() {
        let mut channel = Script::new(&["235 2.7.0 Authentication successful"]);
        let mut mech = Plain::new(creds());
        authenticate(&mut channel, &caps(&["PLAIN"]), &mut mech)
            .await
            .unwrap();
        assert_eq!(channel.written, vec!["AUTH PLAIN AHVzZXIAcGFzcw=="]);
    }

    #[tokio::test]
    async fn test_login_challenges() {
        let mut channel = Script::new(&[
            "334 VXNlcm5hbWU6",
            "334 UGFzc3dvcmQ6",
            "235 ok",
        ]);
        let mut mech = Login::new(creds());
        authenticate(&mut channel, &caps(&["LOGIN"]), &mut mech)
            .await
            .unwrap();
        assert_eq!(channel.written, vec!["AUTH LOGIN", "dXNlcg==", "cGFzcw=="]);
    }

    #[tokio::test]
    async fn test_not_advertised() {
        let mut channel = Script::new(&[]);
        let mut mech = Plain::new(creds());
        let err = authenticate(&mut channel, &caps(&["LOGIN"]), &mut mech)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::MechanismUnsupportedByServer { .. }));
        assert!(channel.written.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let mut channel = Script::new(&["535 5.7.8 Bad credentials"]);
        let mut mech = Plain::new(creds());
        let err = authenticate(&mut channel, &caps(&["PLAIN"]), &mut mech)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, AuthError::CredentialDenied(ref e) if e.code() == Some(535)));
    }

    #[tokio::test]
    async fn test_non_334_inside_loop_is_failure() {
        let mut channel = Script::new(&["334 VXNlcm5hbWU6", "535 no"]);
        let mut mech = Login::new(creds());
        let err = authenticate(&mut channel, &caps(&["LOGIN"]), &mut mech)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::CredentialDenied(_)));
    }

    #[tokio::test]
    async fn test_undecodable_challenge_aborts() {
        let mut channel = Script::new(&["334 !!!not-base64!!!", "501 cancelled"]);
        let mut mech = Login::new(creds());
        let err = authenticate(&mut channel, &caps(&["LOGIN"]), &mut mech)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::ServerProtocolViolation(_)));
        assert!(err.to_string().starts_with("Bad authentication response from server"));
        assert_eq!(channel.written, vec!["AUTH LOGIN", "*"]);
    }

    #[tokio::test]
    async fn test_broken_server_extra_challenge() {
        let mut channel = Script::new(&["334 ", "235 ok"]);
        let mut mech = Plain::new(creds());
        authenticate(&mut channel, &caps(&["PLAIN"]), &mut mech)
            .await
            .unwrap();
        assert_eq!(channel.written.len(), 2);
    }

    #[tokio::test]
    async fn test_xoauth2_error_challenge() {
        let mut channel = Script::new(&[
            "334 eyJzdGF0dXMiOiI0MDEifQ==",
            "535 5.7.8 Username and Password not accepted",
        ]);
        let mut mech = Bearer::xoauth2(creds());
        let err = authenticate(&mut channel, &caps(&["XOAUTH2"]), &mut mech)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::CredentialDenied(_)));
        assert_eq!(channel.written[1], "");
    }

    #[tokio::test]
    async fn test_connection_lost() {
        let mut channel = Script::new(&[]);
        let mut mech = Plain::new(creds());
        let err = authenticate(&mut channel, &caps(&["PLAIN"]), &mut mech)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Transport(_)));
        assert!(!err.is_retryable());
    }
}
