//! Plugin server lifecycle.
//!
//! [`serve`] is the entry point for plugin executables: it validates that
//! the process was launched by its expected host, negotiates protocol
//! version, transport, and TLS with the environment the host prepared,
//! announces itself with the handshake line, and then serves gRPC until the
//! host tears the channel down.
//!
//! Usually an application with rpcplugin-based plugins will wrap this in
//! its own SDK-level serve function that fills in the application-specific
//! configuration, so individual plugin authors never deal with it directly.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Arc;

use rpcplugin_trace::ServerTracer;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::service::RoutesBuilder;
use tonic::transport::Server;
use tracing::{debug, warn};

use crate::context::Context;
use crate::controlplane::{self, CONTROL_SERVICE_NAME};
use crate::handshake::{self, HandshakeConfig};
use crate::tls::{self, NegotiatedServerTls, ServerTlsProvider, TlsError};
use crate::transport::{ListenerSocket, ServerIo, ServerListener, SocketStream, TransportError};
use crate::version;
use crate::BoxError;

/// Per-protocol-version server implementation.
///
/// Implementations register the services for one major protocol version
/// into the server's route set. Plain closures of the matching shape also
/// implement this trait.
pub trait ServerVersion: Send + Sync {
    /// Register this version's services.
    ///
    /// # Errors
    ///
    /// Any error aborts server startup before the handshake line is
    /// written.
    fn register(&self, routes: &mut RoutesBuilder) -> Result<(), BoxError>;
}

impl<F> ServerVersion for F
where
    F: Fn(&mut RoutesBuilder) -> Result<(), BoxError> + Send + Sync,
{
    fn register(&self, routes: &mut RoutesBuilder) -> Result<(), BoxError> {
        self(routes)
    }
}

/// Configuration for a plugin server started by [`serve`].
pub struct ServerConfig {
    /// Handshake settings that must agree with the client's.
    pub handshake: HandshakeConfig,

    /// One server implementation per supported major protocol version. The
    /// greatest version in common with the client wins.
    pub proto_versions: HashMap<u32, Box<dyn ServerVersion>>,

    /// Custom TLS provider. When `None`, the ad-hoc mutual-TLS negotiation
    /// protocol establishes a single-use certificate for this process.
    pub tls: Option<ServerTlsProvider>,

    /// Prevent [`serve`] from installing its interrupt handler. If set, some
    /// other arrangement must keep interrupts aimed at the client process
    /// group from also terminating the plugin servers.
    pub no_signal_handlers: bool,
}

impl ServerConfig {
    /// Start a configuration with the given handshake settings.
    #[must_use]
    pub fn new(handshake: HandshakeConfig) -> Self {
        Self {
            handshake,
            proto_versions: HashMap::new(),
            tls: None,
            no_signal_handlers: false,
        }
    }

    /// Add a protocol version implementation.
    #[must_use]
    pub fn with_version(mut self, version: u32, server: Box<dyn ServerVersion>) -> Self {
        self.proto_versions.insert(version, server);
        self
    }

    /// Install a custom TLS provider.
    #[must_use]
    pub fn with_tls(mut self, provider: ServerTlsProvider) -> Self {
        self.tls = Some(provider);
        self
    }
}

/// Failure modes of [`serve`].
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    /// Required configuration is missing or empty.
    #[error("invalid server configuration: {0}")]
    Config(&'static str),

    /// The server program was launched directly rather than as a child of
    /// its expected host. Plugin executables match on this to print an
    /// application-specific "do not run this directly" message.
    #[error("plugin server program launched outside of its expected host")]
    NotChildProcess,

    /// No protocol version in common with the client.
    #[error("plugin does not support any protocol versions supported by the host")]
    Negotiation,

    /// No transport could produce a listener.
    #[error("cannot start plugin RPC server: {0}")]
    Transport(#[from] TransportError),

    /// TLS negotiation failed.
    #[error("invalid TLS settings: {0}")]
    Tls(#[from] TlsError),

    /// A protocol version implementation failed to register its services.
    #[error("failed to register services for protocol version {version}: {source}")]
    Registration {
        /// The negotiated version whose registration failed.
        version: u32,
        /// The error returned by the implementation.
        #[source]
        source: BoxError,
    },

    /// Standard I/O redirection or another OS-level operation failed.
    #[error("failed to prepare plugin standard I/O: {0}")]
    Io(#[from] io::Error),

    /// Writing the handshake line to the inherited stdout failed.
    #[error("failed to print plugin handshake to stdout: {0}")]
    Handshake(#[source] io::Error),
}

impl ServeError {
    /// Whether this error means the binary was launched outside of its
    /// expected host process.
    #[must_use]
    pub fn is_not_child_process(&self) -> bool {
        matches!(self, Self::NotChildProcess)
    }
}

/// Start up a plugin server and block while serving requests.
///
/// Returns an error if initialization fails. Returns `Ok(())` once all
/// in-flight requests are complete after the client asks the server to
/// exit, or after the context's cancellation token fires.
///
/// `serve` assumes ownership of the standard I/O handles for its duration:
/// stdout and stderr are redirected to in-process pipes so the inherited
/// stdout stays reserved for the handshake line, and both are restored on
/// every exit path. By default it also installs a handler that counts and
/// ignores interrupt signals, under the expectation that the host process
/// decides when plugins shut down.
///
/// # Errors
///
/// See [`ServeError`]. In particular a launch outside of the expected host
/// process yields [`ServeError::NotChildProcess`] before anything else
/// happens.
pub async fn serve(ctx: &Context, config: ServerConfig) -> Result<(), ServeError> {
    if config.handshake.cookie_key.is_empty() || config.handshake.cookie_value.is_empty() {
        return Err(ServeError::Config(
            "handshake must have non-empty cookie key and value",
        ));
    }
    if !handshake::have_handshake_cookie(ctx, &config.handshake) {
        return Err(ServeError::NotChildProcess);
    }

    let tracer = Arc::clone(ctx.server_tracer());

    let Some((proto_version, server_version)) = version::negotiate(ctx, &config.proto_versions)
    else {
        return Err(ServeError::Negotiation);
    };

    let listener = ServerListener::open(ctx).await?;
    let addr = listener.addr().clone();

    let negotiated = tls::server_tls_config(ctx, config.tls.as_ref())?;
    let go_plugin_dialect = handshake::client_smells_like_go_plugin(ctx);
    tracer.tls_config(negotiated.is_auto());

    let (acceptor, cert_b64) = match &negotiated {
        NegotiatedServerTls::Auto { config, identity } => (
            Some(TlsAcceptor::from(Arc::clone(config))),
            handshake::encode_handshake_cert(identity.cert_der(), go_plugin_dialect),
        ),
        NegotiatedServerTls::Provided(config) => {
            (Some(TlsAcceptor::from(Arc::clone(config))), String::new())
        }
        NegotiatedServerTls::Plaintext => (None, String::new()),
    };

    // From here until return, fds 1 and 2 point at pipes; the guard
    // restores them on every exit path. The inherited stdout is reserved
    // for the handshake line.
    let mut stdio = crate::stdio::StdioRedirect::install()?;

    // All shutdown causes feed this one token: the caller's context, the
    // go-plugin shutdown RPC, and the serve loop winding down.
    let done = ctx.cancellation().child_token();

    let mut routes = RoutesBuilder::default();
    let shutdown_token = go_plugin_dialect.then(|| done.clone());
    let mut health = controlplane::register(&mut routes, shutdown_token).await;
    server_version
        .register(&mut routes)
        .map_err(|source| ServeError::Registration {
            version: proto_version,
            source,
        })?;

    if !config.no_signal_handlers {
        spawn_interrupt_watcher(Arc::clone(&tracer), done.clone());
    }

    // The client (our parent process) reads exactly one line to learn where
    // to connect.
    let line = handshake::format_handshake_line(proto_version, &addr, &cert_b64);
    stdio
        .handshake_out()
        .write_all(line.as_bytes())
        .map_err(ServeError::Handshake)?;
    // The sync is best-effort: stdout might be bound to something that
    // cannot sync.
    let _ = stdio.handshake_out().sync_all();

    let (socket, _socket_dir) = listener.into_parts();
    let incoming = spawn_accept_loop(socket, acceptor, done.clone());

    let serve_done = done.clone();
    let serve_tracer = Arc::clone(&tracer);
    tokio::spawn(async move {
        let result = Server::builder()
            .add_routes(routes.routes())
            .serve_with_incoming_shutdown(incoming, serve_done.clone().cancelled_owned())
            .await;
        if let Err(error) = result {
            serve_tracer.rpc_serve_error(&error);
        }
        serve_done.cancel();
    });

    tracer.listening(addr.network(), &addr.to_string(), proto_version);

    done.cancelled().await;

    health
        .set_service_status(CONTROL_SERVICE_NAME, tonic_health::ServingStatus::NotServing)
        .await;

    // Being cancelled is the expected way to exit; the stdio guard and the
    // socket directory clean up as they drop.
    Ok(())
}

/// Count and ignore interrupt signals until the server winds down.
fn spawn_interrupt_watcher(tracer: Arc<dyn ServerTracer>, done: CancellationToken) {
    tokio::spawn(async move {
        let mut interrupts = match signal(SignalKind::interrupt()) {
            Ok(interrupts) => interrupts,
            Err(error) => {
                warn!(%error, "cannot install interrupt handler");
                return;
            }
        };
        let mut count: u32 = 0;
        loop {
            tokio::select! {
                () = done.cancelled() => break,
                received = interrupts.recv() => {
                    if received.is_none() {
                        break;
                    }
                    count += 1;
                    tracer.interrupt_ignored(count);
                }
            }
        }
    });
}

/// Accept connections, perform TLS handshakes off the accept path, and feed
/// the resulting streams to the RPC server.
fn spawn_accept_loop(
    socket: ListenerSocket,
    acceptor: Option<TlsAcceptor>,
    done: CancellationToken,
) -> ReceiverStream<io::Result<ServerIo>> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = done.cancelled() => break,
                accepted = socket.accept() => match accepted {
                    Ok(stream) => {
                        let acceptor = acceptor.clone();
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            match accept_io(stream, acceptor).await {
                                Ok(io) => {
                                    let _ = tx.send(Ok(io)).await;
                                }
                                // A failed TLS handshake ends that one
                                // connection, not the server.
                                Err(error) => debug!(%error, "TLS accept failed"),
                            }
                        });
                    }
                    Err(error) => {
                        let _ = tx.send(Err(error)).await;
                        break;
                    }
                }
            }
        }
    });
    ReceiverStream::new(rx)
}

async fn accept_io(stream: SocketStream, acceptor: Option<TlsAcceptor>) -> io::Result<ServerIo> {
    match acceptor {
        Some(acceptor) => Ok(ServerIo::Tls(Box::new(acceptor.accept(stream).await?))),
        None => Ok(ServerIo::Plain(stream)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_child_process_is_matchable() {
        assert!(ServeError::NotChildProcess.is_not_child_process());
        assert!(!ServeError::Negotiation.is_not_child_process());
    }

    #[test]
    fn test_closures_implement_server_version() {
        let version: Box<dyn ServerVersion> = Box::new(|_routes: &mut RoutesBuilder| Ok(()));
        let mut routes = RoutesBuilder::default();
        assert!(version.register(&mut routes).is_ok());
    }
}
