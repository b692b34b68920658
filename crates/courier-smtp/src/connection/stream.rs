//! Network channel: TCP with optional TLS, and the connector that opens it.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, RootCertStore},
};

use super::{Config, Connector, LineChannel};
use crate::error::{ConnectError, TransportError};

/// SMTP stream (TCP or TLS).
#[derive(Debug)]
pub enum SmtpStream {
    /// Plain TCP connection.
    Tcp(BufReader<TcpStream>),
    /// TLS-encrypted connection.
    Tls(Box<BufReader<TlsStream<TcpStream>>>),
    /// Shut down, or lost during a failed upgrade.
    Closed,
}

/// [`LineChannel`] over a real socket with per-operation deadlines.
#[derive(Debug)]
pub struct NetworkChannel {
    stream: SmtpStream,
    io_timeout: Duration,
    local_addr: Option<SocketAddr>,
}

impl NetworkChannel {
    /// Wraps an established stream.
    #[must_use]
    pub const fn new(
        stream: SmtpStream,
        io_timeout: Duration,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            stream,
            io_timeout,
            local_addr,
        }
    }
}

impl LineChannel for NetworkChannel {
    async fn read_line(&mut self) -> Result<String, TransportError> {
        let io_timeout = self.io_timeout;
        let mut buf = Vec::new();
        let read = match &mut self.stream {
            SmtpStream::Tcp(reader) => {
                timeout(io_timeout, reader.read_until(b'\n', &mut buf)).await
            }
            SmtpStream::Tls(reader) => {
                timeout(io_timeout, reader.read_until(b'\n', &mut buf)).await
            }
            SmtpStream::Closed => return Err(TransportError::Closed),
        };

        let n = read.map_err(|_| TransportError::Timeout(io_timeout))??;
        if n == 0 {
            return Err(TransportError::Closed);
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.strip_suffix('\n').unwrap_or(&line);
        Ok(line.strip_suffix('\r').unwrap_or(line).to_string())
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let io_timeout = self.io_timeout;
        let written = match &mut self.stream {
            SmtpStream::Tcp(reader) => {
                let stream = reader.get_mut();
                timeout(io_timeout, async {
                    stream.write_all(data).await?;
                    stream.flush().await
                })
                .await
            }
            SmtpStream::Tls(reader) => {
                let stream = reader.get_mut();
                timeout(io_timeout, async {
                    stream.write_all(data).await?;
                    stream.flush().await
                })
                .await
            }
            SmtpStream::Closed => return Err(TransportError::Closed),
        };

        written.map_err(|_| TransportError::Timeout(io_timeout))??;
        Ok(())
    }

    async fn start_tls(&mut self, host: &str) -> Result<(), TransportError> {
        let tcp_stream = match std::mem::replace(&mut self.stream, SmtpStream::Closed) {
            SmtpStream::Tcp(reader) => reader.into_inner(),
            SmtpStream::Tls(reader) => {
                self.stream = SmtpStream::Tls(reader);
                return Err(TransportError::AlreadyEncrypted);
            }
            SmtpStream::Closed => return Err(TransportError::Closed),
        };

        let tls_stream = tls_handshake(tcp_stream, host, self.io_timeout).await?;
        self.stream = SmtpStream::Tls(Box::new(BufReader::new(tls_stream)));
        Ok(())
    }

    fn is_encrypted(&self) -> bool {
        matches!(self.stream, SmtpStream::Tls(_))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        match std::mem::replace(&mut self.stream, SmtpStream::Closed) {
            SmtpStream::Tcp(mut reader) => reader.get_mut().shutdown().await?,
            SmtpStream::Tls(mut reader) => reader.get_mut().shutdown().await?,
            SmtpStream::Closed => {}
        }
        Ok(())
    }
}

/// Opens [`NetworkChannel`]s.
#[derive(Debug, Clone, Copy)]
pub struct TcpConnector {
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl TcpConnector {
    /// Creates a connector with the given deadlines.
    #[must_use]
    pub const fn new(connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            io_timeout,
        }
    }

    /// Creates a connector with the deadlines from `config`.
    #[must_use]
    pub const fn from_config(config: &Config) -> Self {
        Self::new(config.connect_timeout, config.io_timeout)
    }
}

impl Connector for TcpConnector {
    type Channel = NetworkChannel;

    async fn open(
        &self,
        host: &str,
        port: u16,
        implicit_tls: bool,
    ) -> Result<NetworkChannel, ConnectError> {
        let unresolved = |source| ConnectError::HostUnreachable {
            host: host.to_string(),
            source,
        };
        let unavailable = |source| ConnectError::ServiceUnavailable {
            host: host.to_string(),
            port,
            source,
        };

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .map_err(unresolved)?
            .collect();
        if addrs.is_empty() {
            return Err(unresolved(io::Error::new(
                io::ErrorKind::NotFound,
                "no addresses found",
            )));
        }

        let tcp_stream = timeout(self.connect_timeout, TcpStream::connect(&addrs[..]))
            .await
            .map_err(|_| unavailable(TransportError::Timeout(self.connect_timeout)))?
            .map_err(|e| unavailable(e.into()))?;
        let local_addr = tcp_stream.local_addr().ok();

        let stream = if implicit_tls {
            let tls_stream = tls_handshake(tcp_stream, host, self.io_timeout)
                .await
                .map_err(unavailable)?;
            SmtpStream::Tls(Box::new(BufReader::new(tls_stream)))
        } else {
            SmtpStream::Tcp(BufReader::new(tcp_stream))
        };

        tracing::debug!(host, port, implicit_tls, "connected");
        Ok(NetworkChannel::new(stream, self.io_timeout, local_addr))
    }
}

async fn tls_handshake(
    tcp_stream: TcpStream,
    host: &str,
    deadline: Duration,
) -> Result<TlsStream<TcpStream>, TransportError> {
    let connector = create_tls_connector();
    let server_name = ServerName::try_from(host.to_string())?;

    let tls_stream = timeout(deadline, connector.connect(server_name, tcp_stream))
        .await
        .map_err(|_| TransportError::Timeout(deadline))??;
    Ok(tls_stream)
}

/// Creates a TLS connector with system root certificates.
fn create_tls_connector() -> TlsConnector {
    let root_store = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
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
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn pair() -> (NetworkChannel, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connector = TcpConnector::new(Duration::from_secs(5), Duration::from_secs(5));
        let (channel, accepted) = tokio::join!(
            connector.open("127.0.0.1", addr.port(), false),
            listener.accept()
        );
        (channel.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_read_lines_strip_terminators() {
        let (mut channel, mut server) = pair().await;
        server.write_all(b"220 ready\r\n250 bare lf\n").await.unwrap();

        assert_eq!(channel.read_line().await.unwrap(), "220 ready");
        assert_eq!(channel.read_line().await.unwrap(), "250 bare lf");
        assert!(!channel.is_encrypted());
        assert!(channel.local_addr().is_some());
    }

    #[tokio::test]
    async fn test_eof_is_closed() {
        let (mut channel, server) = pair().await;
        drop(server);
        assert!(matches!(
            channel.read_line().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_write_all() {
        let (mut channel, mut server) = pair().await;
        channel.write_all(b"QUIT\r\n").await.unwrap();
        let mut buf = [0u8; 6];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"QUIT\r\n");
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (mut channel, _server) = pair().await;
        channel.io_timeout = Duration::from_millis(20);
        let err = channel.read_line().await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_connection_refused_is_service_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let connector = TcpConnector::new(Duration::from_secs(5), Duration::from_secs(5));
        let err = connector.open("127.0.0.1", port, false).await.unwrap_err();
        assert!(err.is_service_unavailable());
    }

    #[tokio::test]
    async fn test_shutdown_closes() {
        let (mut channel, _server) = pair().await;
        channel.shutdown().await.unwrap();
        assert!(matches!(
            channel.write_all(b"x").await,
            Err(TransportError::Closed)
        ));
    }
}
