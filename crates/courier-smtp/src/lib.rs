//! # courier-smtp
//!
//! Outbound SMTP transport (RFC 5321) for a mail client.
//!
//! ## Features
//!
//! - **Connection policy**: implicit TLS on port 465 with STARTTLS fallback,
//!   opportunistic STARTTLS, or plaintext
//! - **ESMTP negotiation**: EHLO with HELO fallback for old servers
//! - **Authentication**: PLAIN, LOGIN, XOAUTH2, OAUTHBEARER, EXTERNAL, with
//!   re-prompting through a [`CredentialProvider`]
//! - **Extensions**: 8BITMIME, ENHANCEDSTATUSCODES, STARTTLS, AUTH
//! - **Mail transactions**: dot-stuffing, Bcc stripping, quoted-printable
//!   downgrade for 7-bit servers
//!
//! ## Quick Start
//!
//! ```ignore
//! use courier_smtp::{Config, Message, Security, Session};
//!
//! #[tokio::main]
//! async fn main() -> courier_smtp::Result<()> {
//!     let config = Config::builder("smtp.example.com")
//!         .security(Security::Always)
//!         .auth("PLAIN", "user@example.com")
//!         .build();
//!
//!     let prompt = |_: &str| std::env::var("SMTP_PASSWORD").ok();
//!     let mut session = Session::open_tcp(config, prompt).await?;
//!
//!     let mut message = Message::new()
//!         .header("From", "user@example.com")
//!         .header("To", "friend@example.com")
//!         .header("Subject", "Hello")
//!         .body("Hello, World!\r\n");
//!
//!     session
//!         .send("user@example.com", &["friend@example.com"], &mut message)
//!         .await?;
//!
//!     session.disconnect(true).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Connection States
//!
//! ```text
//! Disconnected ── connect ──→ Connected ── STARTTLS ──→ EncryptedPending ──→ Encrypted
//!       │                         │                                             │
//!       └── connect (port 465) ───┼─────────────────────────────────────────────┤
//!                                 └──────────── AUTH ──→ Authenticated ←────────┘
//! ```
//!
//! ## Modules
//!
//! - [`auth`]: SASL mechanisms and the `AUTH` exchange
//! - [`command`]: SMTP command builders
//! - [`connection`]: Channels, connection policy and mail transactions
//! - [`parser`]: Reply parser and enhanced status codes
//! - [`types`]: Core SMTP types (addresses, extensions, replies, messages)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod auth;
pub mod command;
pub mod connection;
mod error;
pub mod parser;
pub mod types;

pub use auth::{CredentialProvider, Credentials, NoCredentials};
pub use connection::{
    Config, ConfigBuilder, ConnectionState, Connector, LineChannel, NetworkChannel, Security,
    Session, TcpConnector,
};
pub use error::{
    AuthError, ConnectError, Error, ReplyError, Result, SendError, TransportError,
};
pub use types::{Address, Capabilities, Message, MessageError, MessageSource, Reply, ReplyCode};
