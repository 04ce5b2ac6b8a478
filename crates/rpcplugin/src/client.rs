//! Plugin client lifecycle: launching, dialing, and tearing down plugins.
//!
//! [`Plugin::new`] spawns the plugin server executable as a child process,
//! waits for its handshake line (bounded by the start timeout), pins the
//! negotiated TLS identity, and returns a handle. [`Plugin::client`] dials
//! the advertised listener and hands back the version-specific proxy built
//! by the caller's [`ClientVersion`] factory. [`Plugin::close`] kills the
//! child and waits for it to be reaped.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use rpcplugin_trace::ClientTracer;
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use tokio::io::{AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint, Uri};
use tracing::debug;

use crate::cert::{CryptoError, EphemeralIdentity};
use crate::context::{
    Context, ENV_CLIENT_CERT, ENV_MAX_PORT, ENV_MIN_PORT, ENV_PROTOCOL_VERSIONS, ENV_TRANSPORTS,
};
use crate::handshake::{self, HandshakeConfig, HandshakeError};
use crate::tls::{self, TlsError, TLS_SERVER_NAME};
use crate::transport::{ServerAddr, SocketStream};
use crate::BoxError;

/// Default limit on how long a plugin server may take to complete the
/// handshake.
const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(60);

/// Transports this client is willing to accept, as advertised to servers.
const CLIENT_TRANSPORTS: &str = "unix,tcp";

/// Per-protocol-version client factory.
///
/// Given an open connection, an implementation builds the proxy object for
/// one major protocol version. The framework cannot know the proxy's
/// concrete type, so it travels as `Box<dyn Any>`; all factories in one
/// version map should produce a single known type per version that the
/// caller downcasts to.
///
/// Message-size limits are per generated client, so factories that expect
/// large messages should raise `max_decoding_message_size` and friends on
/// the proxies they build. Plain closures of the matching shape also
/// implement this trait.
pub trait ClientVersion: Send + Sync {
    /// Build the proxy object for this version over the given channel.
    ///
    /// # Errors
    ///
    /// Any error fails the [`Plugin::client`] call that invoked the
    /// factory.
    fn client_proxy(&self, channel: Channel) -> Result<Box<dyn Any + Send + Sync>, BoxError>;
}

impl<F> ClientVersion for F
where
    F: Fn(Channel) -> Result<Box<dyn Any + Send + Sync>, BoxError> + Send + Sync,
{
    fn client_proxy(&self, channel: Channel) -> Result<Box<dyn Any + Send + Sync>, BoxError> {
        self(channel)
    }
}

/// Configuration for launching one plugin server.
pub struct ClientConfig {
    /// Handshake settings that must agree with the server's.
    pub handshake: HandshakeConfig,

    /// One client factory per supported major protocol version. The server
    /// selects the greatest version in common and reports its choice in
    /// the handshake.
    pub proto_versions: HashMap<u32, Arc<dyn ClientVersion>>,

    /// The not-yet-started command that launches the plugin server
    /// executable. Its environment and standard I/O are rewritten by
    /// [`Plugin::new`].
    pub command: Command,

    /// Explicit TLS configuration for the RPC channel. When `None`, the
    /// client and server negotiate temporary mutual TLS during the
    /// handshake.
    pub tls: Option<rustls::ClientConfig>,

    /// Limit on how long the plugin may take to signal readiness. Defaults
    /// to one minute.
    pub start_timeout: Option<Duration>,

    /// Receives anything the child writes to its stderr. When `None` that
    /// output is discarded. Stdout is not available: it belongs to the
    /// handshake protocol.
    pub stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,

    /// Advisory lower bound of the TCP port range, passed to the server.
    pub min_port: u16,

    /// Advisory upper bound of the TCP port range, passed to the server.
    pub max_port: u16,
}

impl ClientConfig {
    /// Start a configuration with the given handshake settings and server
    /// command.
    #[must_use]
    pub fn new(handshake: HandshakeConfig, command: Command) -> Self {
        Self {
            handshake,
            proto_versions: HashMap::new(),
            command,
            tls: None,
            start_timeout: None,
            stderr: None,
            min_port: 0,
            max_port: 0,
        }
    }

    /// Add a protocol version factory.
    #[must_use]
    pub fn with_version(mut self, version: u32, client: Arc<dyn ClientVersion>) -> Self {
        self.proto_versions.insert(version, client);
        self
    }

    /// Use an explicit TLS configuration instead of automatic negotiation.
    #[must_use]
    pub fn with_tls(mut self, tls: rustls::ClientConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Override the handshake start timeout.
    #[must_use]
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = Some(timeout);
        self
    }

    /// Forward the child's stderr into the given sink.
    #[must_use]
    pub fn with_stderr(mut self, stderr: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
        self.stderr = Some(stderr);
        self
    }
}

/// Failure modes of the client lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Required configuration is missing or empty.
    #[error("invalid client configuration: {0}")]
    Config(&'static str),

    /// The child process could not be started.
    #[error("failed to start child process: {0}")]
    Spawn(#[source] io::Error),

    /// The child did not produce a handshake line within the start
    /// timeout.
    #[error("timeout ({0:?}) waiting for plugin server handshake message")]
    Timeout(Duration),

    /// The child exited before completing the handshake.
    #[error("plugin server process exited without completing handshake")]
    ExitedBeforeHandshake,

    /// The handshake line was malformed or inconsistent.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Issuing the client's ephemeral certificate failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Building the pinned TLS configuration failed.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// Dialing the plugin's listener failed.
    #[error("failed to connect to plugin server: {0}")]
    Rpc(#[source] tonic::transport::Error),

    /// The protocol version factory failed to build its proxy.
    #[error("failed to create client proxy: {0}")]
    Proxy(#[source] BoxError),

    /// Killing the child process failed.
    #[error("failed to kill plugin server process {pid}: {source}")]
    Kill {
        /// The child's OS process ID.
        pid: u32,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
}

/// How the client's side of the TLS channel is established.
enum ClientTlsMode {
    /// Caller-supplied configuration, used as given.
    Provided(rustls::ClientConfig),
    /// Automatic negotiation with this freshly issued identity; the
    /// server's certificate is pinned once the handshake advertises it.
    Auto(EphemeralIdentity),
}

/// A currently-active plugin instance with an associated child process
/// running an RPC server.
///
/// A plugin owns exactly one child process from successful construction
/// until [`Plugin::close`] consumes the handle. Dropping the handle without
/// closing it leaks the child.
pub struct Plugin {
    proto_version: u32,
    version: Arc<dyn ClientVersion>,
    pid: u32,
    addr: ServerAddr,
    tls: Arc<rustls::ClientConfig>,
    exit: CancellationToken,
    tracer: Arc<dyn ClientTracer>,
}

impl Plugin {
    /// Launch a plugin server in a child process and complete the
    /// handshake.
    ///
    /// The child environment is the context's environment snapshot with the
    /// negotiation variables layered on top. The child's stdin is empty,
    /// its stdout belongs to the handshake protocol, and its stderr goes to
    /// the configured sink or is discarded.
    ///
    /// On success the caller must retain the handle and eventually call
    /// [`Plugin::close`]. On any failure after the child was spawned, the
    /// child is killed before the error is returned.
    ///
    /// # Errors
    ///
    /// See [`ClientError`].
    pub async fn new(ctx: &Context, config: ClientConfig) -> Result<Self, ClientError> {
        let ClientConfig {
            handshake: handshake_config,
            proto_versions,
            mut command,
            tls,
            start_timeout,
            stderr,
            min_port,
            max_port,
        } = config;

        if proto_versions.is_empty() {
            return Err(ClientError::Config(
                "proto_versions must contain at least one version",
            ));
        }
        if handshake_config.cookie_key.is_empty() || handshake_config.cookie_value.is_empty() {
            return Err(ClientError::Config(
                "handshake must have non-empty cookie key and value",
            ));
        }
        let start_timeout = start_timeout.unwrap_or(DEFAULT_START_TIMEOUT);

        let mut environ = ctx.environ();
        let mut versions: Vec<u32> = proto_versions.keys().copied().collect();
        versions.sort_unstable();
        let version_list = versions
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        environ.push((
            handshake_config.cookie_key.clone(),
            handshake_config.cookie_value.clone(),
        ));
        environ.push((ENV_MIN_PORT.to_string(), min_port.to_string()));
        environ.push((ENV_MAX_PORT.to_string(), max_port.to_string()));
        environ.push((ENV_PROTOCOL_VERSIONS.to_string(), version_list));
        environ.push((ENV_TRANSPORTS.to_string(), CLIENT_TRANSPORTS.to_string()));

        let tls_mode = match tls {
            Some(provided) => ClientTlsMode::Provided(provided),
            None => {
                let identity = EphemeralIdentity::issue()?;
                environ.push((ENV_CLIENT_CERT.to_string(), identity.cert_pem().to_string()));
                ClientTlsMode::Auto(identity)
            }
        };

        command.env_clear();
        for (key, value) in &environ {
            command.env(key, value);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(if stderr.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(false);

        let tracer = Arc::clone(ctx.client_tracer());
        let program = PathBuf::from(command.as_std().get_program());

        tracer.process_start(&program);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                tracer.process_start_failed(&program, &error);
                return Err(ClientError::Spawn(error));
            }
        };
        let pid = child.id().ok_or_else(|| {
            ClientError::Spawn(io::Error::other("child process has no pid"))
        })?;
        tracer.process_running(pid);

        let stdout = child.stdout.take().ok_or_else(|| {
            ClientError::Spawn(io::Error::other("child process has no stdout pipe"))
        })?;

        if let Some(mut sink) = stderr {
            if let Some(mut child_stderr) = child.stderr.take() {
                tokio::spawn(async move {
                    let _ = tokio::io::copy(&mut child_stderr, &mut sink).await;
                });
            }
        }

        // The reaper owns the child from here: it observes the exit exactly
        // once and then releases everyone waiting on the latch.
        let exit = CancellationToken::new();
        {
            let tracer = Arc::clone(&tracer);
            let exit = exit.clone();
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => tracer.process_exited(status),
                    Err(error) => debug!(%error, "failed waiting for plugin server process"),
                }
                exit.cancel();
            });
        }

        // The scanner owns the child's stdout until EOF.
        let (line_tx, mut line_rx) = mpsc::channel::<String>(1);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line_tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        });

        let handshake_result = await_handshake(
            &tracer,
            pid,
            start_timeout,
            &exit,
            &mut line_rx,
            &proto_versions,
            tls_mode,
        )
        .await;

        match handshake_result {
            Ok((proto_version, version, addr, tls)) => Ok(Self {
                proto_version,
                version,
                pid,
                addr,
                tls,
                exit,
                tracer,
            }),
            Err(error) => {
                if let Err(kill_error) = kill_process(pid) {
                    debug!(pid, %kill_error, "failed to kill plugin server after startup error");
                }
                Err(error)
            }
        }
    }

    /// The protocol version negotiated with the server.
    #[must_use]
    pub fn proto_version(&self) -> u32 {
        self.proto_version
    }

    /// The address the server is listening on.
    #[must_use]
    pub fn addr(&self) -> &ServerAddr {
        &self.addr
    }

    /// The child process's OS process ID.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Dial the plugin and build the version-specific client proxy.
    ///
    /// The returned object must be downcast by the caller to the concrete
    /// proxy type for the returned protocol version.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Rpc`] if the dial fails and
    /// [`ClientError::Proxy`] if the version factory fails.
    pub async fn client(&self) -> Result<(u32, Box<dyn Any + Send + Sync>), ClientError> {
        let network = self.addr.network();
        let addr_str = self.addr.to_string();

        self.tracer.connect(network, &addr_str);
        let channel = match dial(self.addr.clone(), Arc::clone(&self.tls)).await {
            Ok(channel) => channel,
            Err(error) => {
                self.tracer.connect_failed(network, &addr_str, &error);
                return Err(ClientError::Rpc(error));
            }
        };

        let proxy = self
            .version
            .client_proxy(channel)
            .map_err(ClientError::Proxy)?;
        self.tracer.connected(network, &addr_str);

        Ok((self.proto_version, proxy))
    }

    /// Terminate the plugin child process and wait for it to be reaped.
    ///
    /// Consumes the handle; the plugin is gone afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Kill`] if the child could not be signalled.
    pub async fn close(self) -> Result<(), ClientError> {
        self.tracer.closing(self.pid);

        if !self.exit.is_cancelled() {
            if let Err(source) = kill_process(self.pid) {
                return Err(ClientError::Kill {
                    pid: self.pid,
                    source,
                });
            }
        }

        self.exit.cancelled().await;
        Ok(())
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("proto_version", &self.proto_version)
            .field("pid", &self.pid)
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

/// Race the start timeout, the child exiting, and the first stdout line.
async fn await_handshake(
    tracer: &Arc<dyn ClientTracer>,
    pid: u32,
    start_timeout: Duration,
    exit: &CancellationToken,
    line_rx: &mut mpsc::Receiver<String>,
    proto_versions: &HashMap<u32, Arc<dyn ClientVersion>>,
    tls_mode: ClientTlsMode,
) -> Result<(u32, Arc<dyn ClientVersion>, ServerAddr, Arc<rustls::ClientConfig>), ClientError> {
    tokio::select! {
        // A handshake line that is already available wins over a racing
        // exit notification.
        biased;

        line = line_rx.recv() => {
            let Some(line) = line else {
                return Err(ClientError::ExitedBeforeHandshake);
            };

            let parsed =
                handshake::parse_handshake_line(&line, |v| proto_versions.contains_key(&v))?;
            let Some(version) = proto_versions.get(&parsed.proto_version).cloned() else {
                return Err(HandshakeError::UnsupportedProtoVersion(parsed.proto_version).into());
            };

            let (tls_config, auto) = match tls_mode {
                ClientTlsMode::Provided(provided) => (provided, false),
                ClientTlsMode::Auto(identity) => {
                    let Some(server_cert) = parsed.server_cert else {
                        return Err(HandshakeError::MissingServerCert.into());
                    };
                    let mut roots = RootCertStore::empty();
                    roots.add(server_cert).map_err(|error| {
                        HandshakeError::InvalidServerCert(error.to_string())
                    })?;
                    (tls::client_tls_config(&identity, roots)?, true)
                }
            };

            tracer.tls_config(auto);
            tracer.server_started(
                pid,
                parsed.addr.network(),
                &parsed.addr.to_string(),
                parsed.proto_version,
            );

            Ok((parsed.proto_version, version, parsed.addr, Arc::new(tls_config)))
        }

        () = exit.cancelled() => Err(ClientError::ExitedBeforeHandshake),

        () = tokio::time::sleep(start_timeout) => {
            tracer.server_start_timeout(pid, start_timeout);
            Err(ClientError::Timeout(start_timeout))
        }
    }
}

/// Dial the plugin's listener with the pinned TLS credentials.
async fn dial(
    addr: ServerAddr,
    tls: Arc<rustls::ClientConfig>,
) -> Result<Channel, tonic::transport::Error> {
    let connector = TlsConnector::from(tls);
    Endpoint::from_static("http://localhost")
        .connect_with_connector(tower::service_fn(move |_: Uri| {
            let addr = addr.clone();
            let connector = connector.clone();
            async move {
                let stream = match &addr {
                    ServerAddr::Tcp(tcp) => SocketStream::Tcp(TcpStream::connect(tcp).await?),
                    ServerAddr::Unix(path) => SocketStream::Unix(UnixStream::connect(path).await?),
                };
                let server_name = ServerName::try_from(TLS_SERVER_NAME).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "invalid TLS server name")
                })?;
                let tls_stream = connector.connect(server_name, stream).await?;
                Ok::<_, io::Error>(TokioIo::new(tls_stream))
            }
        }))
        .await
}

/// Send SIGKILL to the child. A child that already exited is not an error.
fn kill_process(pid: u32) -> io::Result<()> {
    let rc = unsafe { libc::kill(pid as i32, libc::SIGKILL) };
    if rc != 0 {
        let error = io::Error::last_os_error();
        if error.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(error);
    }
    Ok(())
}
