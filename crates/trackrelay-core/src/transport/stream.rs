//! TCP and Unix-domain socket plumbing.
//!
//! [`Stream`] wraps either socket kind behind one `AsyncRead + AsyncWrite`
//! type so the channel, the protocol sessions and the server accept loop never
//! care which transport a connection came from.

use std::fmt;
use std::io;
#[cfg(unix)]
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use super::ChannelError;

/// Where a server listens or a client connects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// `host:port`, resolved at connect time.
    Tcp(String),
    /// Filesystem path of a Unix-domain socket.
    #[cfg(unix)]
    Unix(PathBuf),
}

/// Returned when an endpoint string is neither `host:port` nor `unix:/path`.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid endpoint '{0}': expected host:port or unix:/path")]
pub struct EndpointParseError(pub String);

impl Endpoint {
    /// Builds a TCP endpoint, bracketing bare IPv6 literals.
    pub fn tcp(host: impl AsRef<str>, port: u16) -> Self {
        let host = host.as_ref();
        if host.contains(':') && !host.starts_with('[') {
            Endpoint::Tcp(format!("[{host}]:{port}"))
        } else {
            Endpoint::Tcp(format!("{host}:{port}"))
        }
    }

    #[cfg(unix)]
    pub fn unix(path: impl AsRef<Path>) -> Self {
        Endpoint::Unix(path.as_ref().to_path_buf())
    }

    /// Opens a socket to this endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Connect`] if the socket cannot be established.
    pub async fn connect(&self) -> Result<Stream, ChannelError> {
        let connect_error = |source: io::Error| ChannelError::Connect {
            endpoint: self.to_string(),
            source,
        };
        match self {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await.map_err(connect_error)?;
                set_nodelay(&stream);
                Ok(Stream::Tcp(stream))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path).await.map_err(connect_error)?;
                Ok(Stream::Unix(stream))
            }
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => f.write_str(addr),
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            #[cfg(unix)]
            {
                if !path.is_empty() {
                    return Ok(Endpoint::unix(path));
                }
            }
            #[cfg(not(unix))]
            let _ = path;
            return Err(EndpointParseError(s.to_string()));
        }

        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Endpoint::Tcp(s.to_string()))
            }
            _ => Err(EndpointParseError(s.to_string())),
        }
    }
}

fn set_nodelay(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("could not set TCP_NODELAY: {e}");
    }
}

// ── Stream ────────────────────────────────────────────────────────────────────

/// A connected socket of either kind.
#[derive(Debug)]
pub enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

// ── Listener ──────────────────────────────────────────────────────────────────

enum ListenerInner {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// A bound server socket.
pub struct Listener {
    inner: ListenerInner,
    endpoint: Endpoint,
}

impl Listener {
    /// Binds to `endpoint`.
    ///
    /// For TCP the stored endpoint carries the actually bound address, so
    /// binding port `0` yields the OS-assigned port.  For Unix sockets a stale
    /// socket file left behind by a previous process is removed first.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the bind fails.
    pub async fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str()).await?;
                let local = listener.local_addr()?;
                Ok(Self {
                    inner: ListenerInner::Tcp(listener),
                    endpoint: Endpoint::Tcp(local.to_string()),
                })
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)?;
                Ok(Self {
                    inner: ListenerInner::Unix(listener),
                    endpoint: endpoint.clone(),
                })
            }
        }
    }

    /// The endpoint clients should connect to.
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Waits for the next connection; returns the stream and a printable peer
    /// description.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if accepting fails.
    pub async fn accept(&self) -> io::Result<(Stream, String)> {
        match &self.inner {
            ListenerInner::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                set_nodelay(&stream);
                Ok((Stream::Tcp(stream), peer.to_string()))
            }
            #[cfg(unix)]
            ListenerInner::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((Stream::Unix(stream), self.endpoint.to_string()))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Endpoint::Unix(path) = &self.endpoint {
            let _ = std::fs::remove_file(path);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_tcp_endpoint_formats_host_and_port() {
        assert_eq!(Endpoint::tcp("localhost", 8555).to_string(), "localhost:8555");
    }

    #[test]
    fn test_tcp_endpoint_brackets_ipv6_literal() {
        assert_eq!(Endpoint::tcp("::1", 8555).to_string(), "[::1]:8555");
    }

    #[test]
    fn test_parse_tcp_endpoint() {
        let parsed: Endpoint = "10.0.0.2:8555".parse().expect("valid endpoint");
        assert_eq!(parsed, Endpoint::Tcp("10.0.0.2:8555".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_parse_unix_endpoint() {
        let parsed: Endpoint = "unix:/tmp/trackrelay.sock".parse().expect("valid endpoint");
        assert_eq!(parsed, Endpoint::unix("/tmp/trackrelay.sock"));
        assert_eq!(parsed.to_string(), "unix:/tmp/trackrelay.sock");
    }

    #[test]
    fn test_parse_rejects_missing_port() {
        assert!("localhost".parse::<Endpoint>().is_err());
        assert!("localhost:notaport".parse::<Endpoint>().is_err());
        assert!("unix:".parse::<Endpoint>().is_err());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_returns_connect_error() {
        // Arrange: bind then drop to obtain a port nobody listens on
        let listener = Listener::bind(&Endpoint::tcp("127.0.0.1", 0)).await.unwrap();
        let endpoint = listener.local_endpoint().clone();
        drop(listener);

        // Act
        let result = endpoint.connect().await;

        // Assert
        assert!(matches!(result, Err(ChannelError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_tcp_listener_accepts_and_carries_bytes() {
        let listener = Listener::bind(&Endpoint::tcp("127.0.0.1", 0)).await.unwrap();
        let endpoint = listener.local_endpoint().clone();

        let client = tokio::spawn(async move {
            let mut stream = endpoint.connect().await.unwrap();
            stream.write_all(b"ping").await.unwrap();
        });

        let (mut stream, _peer) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        client.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_listener_replaces_stale_socket_file() {
        let path =
            std::env::temp_dir().join(format!("trackrelay-test-{}.sock", std::process::id()));
        std::fs::write(&path, b"stale").unwrap();

        let listener = Listener::bind(&Endpoint::unix(&path)).await.unwrap();
        let endpoint = listener.local_endpoint().clone();
        let client = tokio::spawn(async move { endpoint.connect().await.map(|_| ()) });
        let accepted = listener.accept().await;

        assert!(accepted.is_ok());
        assert!(client.await.unwrap().is_ok());
        drop(listener);
        assert!(!path.exists());
    }
}
