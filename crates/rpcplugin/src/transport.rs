//! Listener negotiation for the plugin RPC channel.
//!
//! The server consults `PLUGIN_TRANSPORTS` (default `unix,tcp`) and opens
//! the first transport that succeeds. UNIX domain sockets live in a fresh
//! temporary directory owned by the listener and removed with it; the TCP
//! fallback binds an OS-assigned port on the loopback interface and never
//! anything else.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tonic::transport::server::Connected;
use tracing::debug;

use crate::context::{Context, ENV_TRANSPORTS, ENV_XDG_RUNTIME_DIR};

/// Name of the socket file created inside the listener's temporary
/// directory.
const UNIX_SOCKET_NAME: &str = "server.sock";

/// Transport preference used when the client does not specify one.
const DEFAULT_TRANSPORTS: &str = "unix,tcp";

/// Error returned when every acceptable transport failed to produce a
/// listener.
#[derive(Debug, thiserror::Error)]
#[error("unable to negotiate a transport protocol")]
pub struct TransportError;

/// Address of a plugin RPC listener, as advertised in the handshake line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddr {
    /// TCP on the loopback interface.
    Tcp(SocketAddr),
    /// A UNIX domain socket path.
    Unix(PathBuf),
}

impl ServerAddr {
    /// The transport name as it appears in the handshake line.
    #[must_use]
    pub fn network(&self) -> &'static str {
        match self {
            Self::Tcp(_) => "tcp",
            Self::Unix(_) => "unix",
        }
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A negotiated plugin listener together with the resources it owns.
///
/// For UNIX transports the listener owns its temporary socket directory:
/// dropping the listener (or the directory handle split out of it) closes
/// the socket and then removes the directory recursively.
pub(crate) struct ServerListener {
    socket: ListenerSocket,
    addr: ServerAddr,
    dir: Option<TempDir>,
}

impl ServerListener {
    /// Open a listener using the first transport acceptable to the client
    /// that succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when no transport produced a listener.
    pub(crate) async fn open(ctx: &Context) -> Result<Self, TransportError> {
        let transports = ctx
            .getenv(ENV_TRANSPORTS)
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_TRANSPORTS.to_string());

        for transport in transports.split(',') {
            match transport.trim() {
                "unix" => match Self::open_unix(ctx) {
                    Ok(listener) => return Ok(listener),
                    Err(error) => debug!(%error, "unix transport unavailable"),
                },
                "tcp" => match Self::open_tcp().await {
                    Ok(listener) => return Ok(listener),
                    Err(error) => debug!(%error, "tcp transport unavailable"),
                },
                other => debug!(transport = other, "ignoring unsupported transport"),
            }
        }

        Err(TransportError)
    }

    fn open_unix(ctx: &Context) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("rpcplugin");

        // XDG_RUNTIME_DIR has better permissions by contract and is cleaned
        // up on reboot should anything prevent our own cleanup.
        let dir = match ctx.getenv(ENV_XDG_RUNTIME_DIR) {
            Some(runtime_dir) if Path::new(&runtime_dir).is_absolute() => {
                builder.tempdir_in(runtime_dir)?
            }
            _ => builder.tempdir()?,
        };

        let path = dir.path().join(UNIX_SOCKET_NAME);
        let listener = UnixListener::bind(&path)?;

        Ok(Self {
            socket: ListenerSocket::Unix(listener),
            addr: ServerAddr::Unix(path),
            dir: Some(dir),
        })
    }

    async fn open_tcp() -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        Ok(Self {
            socket: ListenerSocket::Tcp(listener),
            addr: ServerAddr::Tcp(addr),
            dir: None,
        })
    }

    pub(crate) fn addr(&self) -> &ServerAddr {
        &self.addr
    }

    /// Split the listener into its accepting socket and the owned socket
    /// directory, so the two can live in different tasks while cleanup
    /// stays deterministic.
    pub(crate) fn into_parts(self) -> (ListenerSocket, Option<TempDir>) {
        (self.socket, self.dir)
    }
}

/// The accepting half of a [`ServerListener`].
pub(crate) enum ListenerSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl ListenerSocket {
    pub(crate) async fn accept(&self) -> io::Result<SocketStream> {
        match self {
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(SocketStream::Tcp(stream))
            }
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(SocketStream::Unix(stream))
            }
        }
    }
}

/// One accepted plugin connection, before any TLS framing.
pub(crate) enum SocketStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for SocketStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SocketStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Self::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// One connection as handed to the RPC server: either TLS-wrapped or, in
/// the deliberate force-plaintext mode, raw.
pub(crate) enum ServerIo {
    Plain(SocketStream),
    Tls(Box<tokio_rustls::server::TlsStream<SocketStream>>),
}

impl AsyncRead for ServerIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ServerIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

impl Connected for ServerIo {
    type ConnectInfo = ();

    fn connect_info(&self) -> Self::ConnectInfo {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_negotiation_prefers_unix() {
        let ctx = Context::new().with_env::<_, String, String>([]);
        let listener = ServerListener::open(&ctx).await.unwrap();
        assert!(matches!(listener.addr(), ServerAddr::Unix(_)));
    }

    #[tokio::test]
    async fn test_tcp_only_negotiation_binds_loopback() {
        let ctx = Context::new().with_env([(ENV_TRANSPORTS, "tcp")]);
        let listener = ServerListener::open(&ctx).await.unwrap();
        match listener.addr() {
            ServerAddr::Tcp(addr) => {
                assert!(addr.ip().is_loopback());
                assert_ne!(addr.port(), 0);
            }
            ServerAddr::Unix(_) => panic!("expected tcp listener"),
        }
    }

    #[tokio::test]
    async fn test_unknown_transports_fail_negotiation() {
        let ctx = Context::new().with_env([(ENV_TRANSPORTS, "carrier-pigeon")]);
        let result = ServerListener::open(&ctx).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unix_listener_cleans_up_its_directory() {
        let ctx = Context::new().with_env([(ENV_TRANSPORTS, "unix")]);
        let listener = ServerListener::open(&ctx).await.unwrap();
        let socket_path = match listener.addr() {
            ServerAddr::Unix(path) => path.clone(),
            ServerAddr::Tcp(_) => panic!("expected unix listener"),
        };
        let socket_dir = socket_path.parent().unwrap().to_path_buf();
        assert!(socket_path.exists());

        drop(listener);
        assert!(!socket_path.exists());
        assert!(!socket_dir.exists());
    }

    #[tokio::test]
    async fn test_xdg_runtime_dir_is_preferred_when_absolute() {
        let runtime_dir = tempfile::tempdir().unwrap();
        let ctx = Context::new().with_env([
            (ENV_TRANSPORTS, "unix"),
            (ENV_XDG_RUNTIME_DIR, runtime_dir.path().to_str().unwrap()),
        ]);
        let listener = ServerListener::open(&ctx).await.unwrap();
        match listener.addr() {
            ServerAddr::Unix(path) => assert!(path.starts_with(runtime_dir.path())),
            ServerAddr::Tcp(_) => panic!("expected unix listener"),
        }
    }

    #[tokio::test]
    async fn test_relative_xdg_runtime_dir_is_ignored() {
        let ctx = Context::new().with_env([
            (ENV_TRANSPORTS, "unix"),
            (ENV_XDG_RUNTIME_DIR, "relative/run/dir"),
        ]);
        let listener = ServerListener::open(&ctx).await.unwrap();
        match listener.addr() {
            ServerAddr::Unix(path) => assert!(path.is_absolute()),
            ServerAddr::Tcp(_) => panic!("expected unix listener"),
        }
    }
}
