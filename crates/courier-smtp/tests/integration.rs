//! Integration tests for the SMTP session.
//!
//! These tests use a scripted connector whose channels replay server replies
//! and check every byte the client writes, without requiring a real server.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_test::io::{Builder, Mock};

use courier_smtp::{
    AuthError, Config, ConnectError, ConnectionState, Connector, Error, LineChannel, Message,
    NoCredentials, ReplyError, Security, SendError, Session, TransportError,
};

const HOST: &str = "smtp.example.com";
const GREETING: &[u8] = b"220 smtp.example.com ESMTP ready\r\n";
const EHLO: &[u8] = b"EHLO client.test\r\n";

/// Channel over a `tokio_test` mock.
struct MockChannel {
    io: BufReader<Mock>,
    encrypted: bool,
}

impl LineChannel for MockChannel {
    async fn read_line(&mut self) -> Result<String, TransportError> {
        let mut line = String::new();
        if self.io.read_line(&mut line).await? == 0 {
            return Err(TransportError::Closed);
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.io.write_all(data).await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn start_tls(&mut self, _host: &str) -> Result<(), TransportError> {
        if self.encrypted {
            return Err(TransportError::AlreadyEncrypted);
        }
        self.encrypted = true;
        Ok(())
    }

    fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.io.shutdown().await?;
        Ok(())
    }
}

/// What the next connection attempt gets.
enum Attempt {
    Serve(Mock),
    Refuse,
}

#[derive(Default)]
struct Script {
    attempts: VecDeque<Attempt>,
    opened: Vec<(u16, bool)>,
}

/// Connector that plays back one [`Attempt`] per `open`.
#[derive(Clone, Default)]
struct ScriptedConnector {
    script: Arc<Mutex<Script>>,
}

impl ScriptedConnector {
    fn new(attempts: impl IntoIterator<Item = Attempt>) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                attempts: attempts.into_iter().collect(),
                opened: Vec::new(),
            })),
        }
    }

    fn serving(mock: Mock) -> Self {
        Self::new([Attempt::Serve(mock)])
    }

    /// Every `(port, implicit_tls)` that was opened, in order.
    fn opened(&self) -> Vec<(u16, bool)> {
        self.script.lock().unwrap().opened.clone()
    }
}

impl Connector for ScriptedConnector {
    type Channel = MockChannel;

    async fn open(
        &self,
        host: &str,
        port: u16,
        implicit_tls: bool,
    ) -> Result<MockChannel, ConnectError> {
        let attempt = {
            let mut script = self.script.lock().unwrap();
            script.opened.push((port, implicit_tls));
            script.attempts.pop_front()
        };
        match attempt {
            Some(Attempt::Serve(mock)) => Ok(MockChannel {
                io: BufReader::new(mock),
                encrypted: implicit_tls,
            }),
            Some(Attempt::Refuse) | None => Err(ConnectError::ServiceUnavailable {
                host: host.to_string(),
                port,
                source: TransportError::Io(io::Error::from(io::ErrorKind::ConnectionRefused)),
            }),
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config(security: Security) -> Config {
    Config::builder(HOST)
        .security(security)
        .hello_name("client.test")
        .build()
}

fn auth_config(mechanism: &str) -> Config {
    Config::builder(HOST)
        .security(Security::Never)
        .hello_name("client.test")
        .auth(mechanism, "bob")
        .build()
}

/// Greeting plus an EHLO answered with `extensions`.
fn greeted(extensions: &[&str]) -> Builder {
    let mut reply = String::new();
    let mut lines = vec![HOST];
    lines.extend_from_slice(extensions);
    for (i, line) in lines.iter().enumerate() {
        let sep = if i + 1 == lines.len() { ' ' } else { '-' };
        reply.push_str(&format!("250{sep}{line}\r\n"));
    }

    let mut builder = Builder::new();
    builder.read(GREETING).write(EHLO).read(reply.as_bytes());
    builder
}

#[tokio::test]
async fn test_plain_connect_send_quit() {
    init_tracing();

    let mock = greeted(&["8BITMIME"])
        .write(b"MAIL FROM:<alice@example.com>\r\n")
        .read(b"250 2.1.0 Ok\r\n")
        .write(b"RCPT TO:<bob@example.com>\r\n")
        .read(b"250 2.1.5 Ok\r\n")
        .write(b"DATA\r\n")
        .read(b"354 End data with <CR><LF>.<CR><LF>\r\n")
        .write(b"Subject: Hi\r\n\r\nHello\r\n..dot\r\n")
        .write(b".\r\n")
        .read(b"250 2.0.0 Ok: queued\r\n")
        .write(b"RSET\r\n")
        .read(b"250 2.0.0 Ok\r\n")
        .write(b"QUIT\r\n")
        .read(b"221 2.0.0 Bye\r\n")
        .build();
    let connector = ScriptedConnector::serving(mock);

    let mut session = Session::open(config(Security::Never), connector.clone(), NoCredentials)
        .await
        .unwrap();
    assert_eq!(session.state(), ConnectionState::Connected);
    assert!(session.capabilities().is_esmtp);
    assert!(session.capabilities().eight_bit_mime);

    let mut message = Message::new().header("Subject", "Hi").body("Hello\n.dot\n");
    session
        .send("alice@example.com", &["bob@example.com"], &mut message)
        .await
        .unwrap();
    assert_eq!(session.state(), ConnectionState::Connected);

    session.disconnect(true).await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(!session.is_connected());
    assert!(!session.capabilities().is_esmtp);
    assert_eq!(connector.opened(), vec![(25, false)]);
}

#[tokio::test]
async fn test_helo_fallback_for_old_server() {
    init_tracing();

    let mock = Builder::new()
        .read(b"220 legacy.example.com Sendmail ready\r\n")
        .write(EHLO)
        .read(b"502 Command not implemented\r\n")
        .write(b"HELO client.test\r\n")
        .read(b"250 legacy.example.com\r\n")
        .write(b"QUIT\r\n")
        .read(b"221 Bye\r\n")
        .build();

    let mut session = Session::open(
        config(Security::Never),
        ScriptedConnector::serving(mock),
        NoCredentials,
    )
    .await
    .unwrap();
    assert!(!session.capabilities().is_esmtp);
    assert!(session.capabilities().auth_mechanisms().is_empty());

    session.disconnect(true).await;
}

#[tokio::test]
async fn test_ehlo_rejection_is_fatal_for_esmtp_server() {
    let mock = Builder::new()
        .read(GREETING)
        .write(EHLO)
        .read(b"554 5.7.1 Go away\r\n")
        .build();

    let mut session = Session::new(
        config(Security::Never),
        ScriptedConnector::serving(mock),
        NoCredentials,
    );
    let err = session.connect().await.unwrap_err();

    match err {
        Error::Connect(ConnectError::Ehlo(e)) => {
            assert_eq!(e.command(), "EHLO");
            assert_eq!(e.code(), Some(554));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_bad_greeting() {
    let mock = Builder::new().read(b"554 No SMTP service here\r\n").build();

    let mut session = Session::new(
        config(Security::Never),
        ScriptedConnector::serving(mock),
        NoCredentials,
    );
    let err = session.connect().await.unwrap_err();

    assert!(matches!(
        err,
        Error::Connect(ConnectError::Greeting(ReplyError::Rejected {
            received: Some(554),
            ..
        }))
    ));
    assert!(!session.is_connected());
}

#[tokio::test]
async fn test_greeting_must_be_complete() {
    let mock = Builder::new().read(b"220-smtp.example.com ESMTP\r\n").build();

    let mut session = Session::new(
        config(Security::Never),
        ScriptedConnector::serving(mock),
        NoCredentials,
    );
    let err = session.connect().await.unwrap_err();

    match err {
        Error::Connect(ConnectError::Greeting(e)) => {
            assert!(matches!(
                e,
                ReplyError::Transport {
                    source: TransportError::Closed,
                    ..
                }
            ));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_always_falls_back_to_starttls() {
    init_tracing();

    let mock = greeted(&["STARTTLS"])
        .write(b"STARTTLS\r\n")
        .read(b"220 2.0.0 Ready to start TLS\r\n")
        .write(b"QUIT\r\n")
        .read(b"221 Bye\r\n")
        .build();
    let connector = ScriptedConnector::new([Attempt::Refuse, Attempt::Serve(mock)]);

    let mut session = Session::open(config(Security::Always), connector.clone(), NoCredentials)
        .await
        .unwrap();

    assert_eq!(session.state(), ConnectionState::Encrypted);
    assert_eq!(connector.opened(), vec![(465, true), (25, false)]);
    session.disconnect(true).await;
}

#[tokio::test]
async fn test_always_requires_starttls_on_fallback() {
    let mock = greeted(&["8BITMIME"]).build();
    let connector = ScriptedConnector::new([Attempt::Refuse, Attempt::Serve(mock)]);

    let mut session = Session::new(config(Security::Always), connector, NoCredentials);
    let err = session.connect().await.unwrap_err();

    match err {
        Error::Connect(ConnectError::StartTlsUnsupported { host }) => assert_eq!(host, HOST),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_always_uses_implicit_tls_port() {
    let mock = greeted(&[])
        .write(b"QUIT\r\n")
        .read(b"221 Bye\r\n")
        .build();
    let connector = ScriptedConnector::serving(mock);

    let mut session = Session::open(config(Security::Always), connector.clone(), NoCredentials)
        .await
        .unwrap();

    assert_eq!(session.state(), ConnectionState::Encrypted);
    assert_eq!(connector.opened(), vec![(465, true)]);
    session.disconnect(true).await;
}

#[tokio::test]
async fn test_explicit_port_is_used_for_both_attempts() {
    let mock = greeted(&["STARTTLS"])
        .write(b"STARTTLS\r\n")
        .read(b"220 Go ahead\r\n")
        .build();
    let connector = ScriptedConnector::new([Attempt::Refuse, Attempt::Serve(mock)]);
    let config = Config::builder(HOST)
        .port(2525)
        .hello_name("client.test")
        .build();

    let mut session = Session::open(config, connector.clone(), NoCredentials)
        .await
        .unwrap();

    assert_eq!(connector.opened(), vec![(2525, true), (2525, false)]);
    session.disconnect(false).await;
}

#[tokio::test]
async fn test_when_possible_stays_plain_without_starttls() {
    let mock = greeted(&["8BITMIME"])
        .write(b"QUIT\r\n")
        .read(b"221 Bye\r\n")
        .build();
    let connector = ScriptedConnector::serving(mock);

    let mut session = Session::open(
        config(Security::WhenPossible),
        connector.clone(),
        NoCredentials,
    )
    .await
    .unwrap();

    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(connector.opened(), vec![(25, false)]);
    session.disconnect(true).await;
}

#[tokio::test]
async fn test_when_possible_starttls_rejected() {
    let mock = greeted(&["STARTTLS"])
        .write(b"STARTTLS\r\n")
        .read(b"454 TLS not available due to temporary reason\r\n")
        .build();

    let mut session = Session::new(
        config(Security::WhenPossible),
        ScriptedConnector::serving(mock),
        NoCredentials,
    );
    let err = session.connect().await.unwrap_err();

    match err {
        Error::Connect(ConnectError::StartTls(e)) => {
            assert_eq!(e.code(), Some(454));
            assert!(e.is_transient());
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_auth_reprompts_until_accepted() {
    init_tracing();

    let mock = greeted(&["AUTH PLAIN LOGIN"])
        .write(b"AUTH PLAIN AGJvYgB3cm9uZw==\r\n")
        .read(b"535 Authentication failed\r\n")
        .write(b"AUTH PLAIN AGJvYgByaWdodA==\r\n")
        .read(b"235 Authentication successful\r\n")
        .write(EHLO)
        .read(b"250-smtp.example.com\r\n250-8BITMIME\r\n250 AUTH PLAIN LOGIN\r\n")
        .write(b"QUIT\r\n")
        .read(b"221 Bye\r\n")
        .build();

    let prompts = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&prompts);
    let mut answers = VecDeque::from(["wrong", "right"]);
    let provider = move |prompt: &str| {
        seen.lock().unwrap().push(prompt.to_string());
        answers.pop_front().map(String::from)
    };

    let mut session = Session::open(
        auth_config("PLAIN"),
        ScriptedConnector::serving(mock),
        provider,
    )
    .await
    .unwrap();

    assert_eq!(session.state(), ConnectionState::Authenticated);
    assert!(session.capabilities().eight_bit_mime);

    let prompts = prompts.lock().unwrap().clone();
    assert_eq!(prompts.len(), 2);
    assert_eq!(
        prompts[0],
        "Please enter the SMTP password for bob@smtp.example.com"
    );
    assert!(prompts[1].starts_with("Unable to authenticate to SMTP server.\n"));
    assert!(prompts[1].contains("Authentication credentials invalid"));
    assert!(prompts[1].ends_with(&prompts[0]));

    session.disconnect(true).await;
}

#[tokio::test]
async fn test_cached_password_survives_reconnect() {
    let first = greeted(&["AUTH PLAIN"])
        .write(b"AUTH PLAIN AGJvYgBzZWNyZXQ=\r\n")
        .read(b"235 Ok\r\n")
        .write(EHLO)
        .read(b"250-smtp.example.com\r\n250 AUTH PLAIN\r\n")
        .build();
    let second = greeted(&["AUTH PLAIN"])
        .write(b"AUTH PLAIN AGJvYgBzZWNyZXQ=\r\n")
        .read(b"235 Ok\r\n")
        .write(EHLO)
        .read(b"250-smtp.example.com\r\n250 AUTH PLAIN\r\n")
        .build();
    let connector = ScriptedConnector::new([Attempt::Serve(first), Attempt::Serve(second)]);

    let mut asked = 0;
    let provider = move |_: &str| {
        asked += 1;
        (asked == 1).then(|| "secret".to_string())
    };

    let mut session = Session::open(auth_config("PLAIN"), connector, provider)
        .await
        .unwrap();
    session.connect().await.unwrap();

    assert_eq!(session.state(), ConnectionState::Authenticated);
    session.disconnect(false).await;
}

#[tokio::test]
async fn test_auth_cancelled_by_user() {
    let mock = greeted(&["AUTH PLAIN"])
        .write(b"QUIT\r\n")
        .read(b"221 Bye\r\n")
        .build();

    let mut session = Session::new(
        auth_config("PLAIN"),
        ScriptedConnector::serving(mock),
        NoCredentials,
    );
    let err = session.connect().await.unwrap_err();

    assert!(matches!(err, Error::Auth(AuthError::UserCancelled)));
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_auth_mechanism_not_advertised() {
    let mock = greeted(&["AUTH PLAIN"])
        .write(b"QUIT\r\n")
        .read(b"221 Bye\r\n")
        .build();

    let mut session = Session::new(
        auth_config("LOGIN"),
        ScriptedConnector::serving(mock),
        |_: &str| Some("secret".to_string()),
    );
    let err = session.connect().await.unwrap_err();

    match err {
        Error::Auth(AuthError::MechanismUnsupportedByServer { mechanism }) => {
            assert_eq!(mechanism, "LOGIN");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_auth_mechanism_unknown_locally() {
    let mock = greeted(&["AUTH CRAM-MD5"])
        .write(b"QUIT\r\n")
        .read(b"221 Bye\r\n")
        .build();

    let mut session = Session::new(
        auth_config("CRAM-MD5"),
        ScriptedConnector::serving(mock),
        NoCredentials,
    );
    let err = session.connect().await.unwrap_err();

    assert!(matches!(
        err,
        Error::Auth(AuthError::MechanismUnavailableLocally(ref name)) if name == "CRAM-MD5"
    ));
}

#[tokio::test]
async fn test_login_exchange() {
    // "Username:" / "Password:" challenges, "bob" / "secret" answers.
    let mock = greeted(&["AUTH LOGIN"])
        .write(b"AUTH LOGIN\r\n")
        .read(b"334 VXNlcm5hbWU6\r\n")
        .write(b"Ym9i\r\n")
        .read(b"334 UGFzc3dvcmQ6\r\n")
        .write(b"c2VjcmV0\r\n")
        .read(b"235 2.7.0 Authentication successful\r\n")
        .write(EHLO)
        .read(b"250-smtp.example.com\r\n250 AUTH LOGIN\r\n")
        .build();

    let mut session = Session::open(
        auth_config("LOGIN"),
        ScriptedConnector::serving(mock),
        |_: &str| Some("secret".to_string()),
    )
    .await
    .unwrap();

    assert_eq!(session.state(), ConnectionState::Authenticated);
    session.disconnect(false).await;
}

#[tokio::test]
async fn test_external_is_tried_once_without_prompting() {
    let mock = greeted(&["AUTH EXTERNAL PLAIN"])
        .write(b"AUTH EXTERNAL =\r\n")
        .read(b"535 5.7.8 Certificate not accepted\r\n")
        .write(b"QUIT\r\n")
        .read(b"221 Bye\r\n")
        .build();

    let asked = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&asked);
    let provider = move |_: &str| {
        *counter.lock().unwrap() += 1;
        Some("unused".to_string())
    };

    let mut session = Session::new(
        auth_config("EXTERNAL"),
        ScriptedConnector::serving(mock),
        provider,
    );
    let err = session.connect().await.unwrap_err();

    match err {
        Error::Auth(AuthError::CredentialDenied(reply)) => assert_eq!(reply.code(), Some(535)),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(*asked.lock().unwrap(), 0);
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_failed_ehlo_after_auth_is_ignored() {
    let mock = greeted(&["8BITMIME", "AUTH PLAIN"])
        .write(b"AUTH PLAIN AGJvYgBzZWNyZXQ=\r\n")
        .read(b"235 2.7.0 Accepted\r\n")
        .write(EHLO)
        .read(b"502 5.5.1 Not now\r\n")
        .write(b"QUIT\r\n")
        .read(b"221 Bye\r\n")
        .build();

    let mut session = Session::open(
        auth_config("PLAIN"),
        ScriptedConnector::serving(mock),
        |_: &str| Some("secret".to_string()),
    )
    .await
    .unwrap();

    assert_eq!(session.state(), ConnectionState::Authenticated);
    assert!(session.capabilities().eight_bit_mime);
    session.disconnect(true).await;
}

#[tokio::test]
async fn test_undecodable_challenge_cancels_and_reprompts() {
    let mock = greeted(&["AUTH LOGIN"])
        .write(b"AUTH LOGIN\r\n")
        .read(b"334 !!not base64!!\r\n")
        .write(b"*\r\n")
        .read(b"501 5.7.0 Authentication cancelled\r\n")
        .write(b"AUTH LOGIN\r\n")
        .read(b"334 VXNlcm5hbWU6\r\n")
        .write(b"Ym9i\r\n")
        .read(b"334 UGFzc3dvcmQ6\r\n")
        .write(b"c2VjcmV0\r\n")
        .read(b"235 2.7.0 Authentication successful\r\n")
        .write(EHLO)
        .read(b"250-smtp.example.com\r\n250 AUTH LOGIN\r\n")
        .build();

    let prompts = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&prompts);
    let provider = move |prompt: &str| {
        seen.lock().unwrap().push(prompt.to_string());
        Some("secret".to_string())
    };

    let mut session = Session::open(
        auth_config("LOGIN"),
        ScriptedConnector::serving(mock),
        provider,
    )
    .await
    .unwrap();

    assert_eq!(session.state(), ConnectionState::Authenticated);
    let prompts = prompts.lock().unwrap().clone();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].starts_with("Unable to authenticate to SMTP server.\n"));
    assert!(prompts[1].contains("Bad authentication response from server"));
    session.disconnect(false).await;
}

#[tokio::test]
async fn test_auth_skipped_for_helo_server() {
    let mock = Builder::new()
        .read(b"220 legacy.example.com ready\r\n")
        .write(EHLO)
        .read(b"500 Unrecognized command\r\n")
        .write(b"HELO client.test\r\n")
        .read(b"250 legacy.example.com\r\n")
        .write(b"QUIT\r\n")
        .read(b"221 Bye\r\n")
        .build();

    let mut session = Session::open(
        auth_config("PLAIN"),
        ScriptedConnector::serving(mock),
        NoCredentials,
    )
    .await
    .unwrap();

    assert_eq!(session.state(), ConnectionState::Connected);
    session.disconnect(true).await;
}

#[tokio::test]
async fn test_query_auth_types_uses_temporary_connection() {
    let mock = greeted(&["AUTH LOGIN PLAIN CRAM-MD5"])
        .write(b"QUIT\r\n")
        .read(b"221 Bye\r\n")
        .build();

    let mut session = Session::new(
        config(Security::Never),
        ScriptedConnector::serving(mock),
        NoCredentials,
    );
    let types = session.query_auth_types().await.unwrap();

    let types: Vec<_> = types.into_iter().collect();
    assert_eq!(types, vec!["LOGIN", "PLAIN"]);
    assert!(!session.is_connected());
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_send_requires_connection() {
    let mut session = Session::new(
        config(Security::Never),
        ScriptedConnector::default(),
        NoCredentials,
    );
    let mut message = Message::new().body("Hi\r\n");

    let err = session
        .send("alice@example.com", &["bob@example.com"], &mut message)
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::NotConnected));
}

#[tokio::test]
async fn test_send_strips_bcc_and_restores_it() {
    let mock = greeted(&[])
        .write(b"MAIL FROM:<alice@example.com>\r\n")
        .read(b"250 Ok\r\n")
        .write(b"RCPT TO:<bob@example.com>\r\n")
        .read(b"250 Ok\r\n")
        .write(b"RCPT TO:<carol@example.com>\r\n")
        .read(b"250 Ok\r\n")
        .write(b"DATA\r\n")
        .read(b"354 Go ahead\r\n")
        .write(b"From: alice@example.com\r\nTo: bob@example.com\r\nSubject: Secret\r\n\r\nHi\r\n")
        .write(b".\r\n")
        .read(b"250 Ok\r\n")
        .write(b"RSET\r\n")
        .read(b"250 Ok\r\n")
        .build();

    let mut session = Session::open(
        config(Security::Never),
        ScriptedConnector::serving(mock),
        NoCredentials,
    )
    .await
    .unwrap();

    let mut message = Message::new()
        .header("From", "alice@example.com")
        .header("Bcc", "carol@example.com")
        .header("To", "bob@example.com")
        .header("Subject", "Secret")
        .body("Hi\r\n");
    session
        .send(
            "alice@example.com",
            &["bob@example.com", "carol@example.com"],
            &mut message,
        )
        .await
        .unwrap();

    let names: Vec<_> = message.headers().iter().map(|h| h.name.as_str()).collect();
    assert_eq!(names, vec!["From", "Bcc", "To", "Subject"]);
    session.disconnect(false).await;
}

#[tokio::test]
async fn test_recipient_rejected_mid_list() {
    let mock = greeted(&["ENHANCEDSTATUSCODES"])
        .write(b"MAIL FROM:<alice@example.com>\r\n")
        .read(b"250 2.1.0 Ok\r\n")
        .write(b"RCPT TO:<bob@example.com>\r\n")
        .read(b"250 2.1.5 Ok\r\n")
        .write(b"RCPT TO:<carol@example.com>\r\n")
        .read(b"550 5.1.1 <carol@example.com>: Recipient address rejected\r\n")
        .write(b"RSET\r\n")
        .read(b"250 2.0.0 Ok\r\n")
        .write(b"QUIT\r\n")
        .read(b"221 Bye\r\n")
        .build();

    let mut session = Session::open(
        config(Security::Never),
        ScriptedConnector::serving(mock),
        NoCredentials,
    )
    .await
    .unwrap();

    let mut message = Message::new().body("Hi\r\n");
    let err = session
        .send(
            "alice@example.com",
            &["bob@example.com", "carol@example.com", "dave@example.com"],
            &mut message,
        )
        .await
        .unwrap_err();

    match &err {
        SendError::RecipientRejected { address, source } => {
            assert_eq!(address, "carol@example.com");
            assert_eq!(source.code(), Some(550));
            assert!(source.is_permanent());
            assert!(err.to_string().contains("Recipient address rejected"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(session.is_connected());

    session.disconnect(true).await;
}

#[tokio::test]
async fn test_invalid_recipient_writes_nothing() {
    let mock = greeted(&[]).build();

    let mut session = Session::open(
        config(Security::Never),
        ScriptedConnector::serving(mock),
        NoCredentials,
    )
    .await
    .unwrap();

    let mut message = Message::new().body("Hi\r\n");
    let err = session
        .send("alice@example.com", &["not-an-address"], &mut message)
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::InvalidRecipient(_)));

    let none: [&str; 0] = [];
    let err = session
        .send("alice@example.com", &none, &mut message)
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::NoRecipients));

    assert!(session.is_connected());
    session.disconnect(false).await;
}

#[tokio::test]
async fn test_body_write_failure_disconnects() {
    let mock = greeted(&[])
        .write(b"MAIL FROM:<alice@example.com>\r\n")
        .read(b"250 Ok\r\n")
        .write(b"RCPT TO:<bob@example.com>\r\n")
        .read(b"250 Ok\r\n")
        .write(b"DATA\r\n")
        .read(b"354 Go ahead\r\n")
        .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "connection reset"))
        .write(b"RSET\r\n")
        .read(b"250 Ok\r\n")
        .build();

    let mut session = Session::open(
        config(Security::Never),
        ScriptedConnector::serving(mock),
        NoCredentials,
    )
    .await
    .unwrap();

    let mut message = Message::new().body("Hi\r\n");
    let err = session
        .send("alice@example.com", &["bob@example.com"], &mut message)
        .await
        .unwrap_err();

    assert!(matches!(err, SendError::TransmissionIoFailure(_)));
    assert!(err.is_connection_lost());
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(!session.is_connected());
}

#[tokio::test]
async fn test_eight_bit_body_downgraded_without_8bitmime() {
    let mock = greeted(&[])
        .write(b"MAIL FROM:<alice@example.com>\r\n")
        .read(b"250 Ok\r\n")
        .write(b"RCPT TO:<bob@example.com>\r\n")
        .read(b"250 Ok\r\n")
        .write(b"DATA\r\n")
        .read(b"354 Go ahead\r\n")
        .write(b"Content-Transfer-Encoding: quoted-printable\r\n\r\ncaf=C3=A9\r\n")
        .write(b".\r\n")
        .read(b"250 Ok\r\n")
        .write(b"RSET\r\n")
        .read(b"250 Ok\r\n")
        .build();

    let mut session = Session::open(
        config(Security::Never),
        ScriptedConnector::serving(mock),
        NoCredentials,
    )
    .await
    .unwrap();

    let mut message = Message::new()
        .header("Content-Transfer-Encoding", "8bit")
        .body("café\r\n".as_bytes());
    session
        .send("alice@example.com", &["bob@example.com"], &mut message)
        .await
        .unwrap();

    session.disconnect(false).await;
}

#[tokio::test]
async fn test_eight_bit_body_announced_with_8bitmime() {
    let mock = greeted(&["8BITMIME"])
        .write(b"MAIL FROM:<alice@example.com> BODY=8BITMIME\r\n")
        .read(b"250 Ok\r\n")
        .write(b"RCPT TO:<bob@example.com>\r\n")
        .read(b"250 Ok\r\n")
        .write(b"DATA\r\n")
        .read(b"451 4.3.0 Try again later\r\n")
        .write(b"RSET\r\n")
        .read(b"250 Ok\r\n")
        .build();

    let mut session = Session::open(
        config(Security::Never),
        ScriptedConnector::serving(mock),
        NoCredentials,
    )
    .await
    .unwrap();

    let mut message = Message::new().body("café\r\n".as_bytes());
    let err = session
        .send("alice@example.com", &["bob@example.com"], &mut message)
        .await
        .unwrap_err();

    match err {
        SendError::DataPhaseRejected(e) => assert!(e.is_transient()),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(session.is_connected());
    session.disconnect(false).await;
}
