//! Ambient context for plugin negotiation.
//!
//! Both halves of the handshake protocol are driven by environment variables,
//! emit trace events, and react to cancellation. All three concerns travel
//! together in a [`Context`] value that is passed explicitly into the client
//! and server entry points.
//!
//! Environment reads are always routed through the context so that tests can
//! inject variables without mutating the real process environment.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rpcplugin_trace::{ClientTracer, NoopClientTracer, NoopServerTracer, ServerTracer};
use tokio_util::sync::CancellationToken;

/// Environment variable listing the protocol versions the client supports.
pub(crate) const ENV_PROTOCOL_VERSIONS: &str = "PLUGIN_PROTOCOL_VERSIONS";

/// Environment variable listing the transports acceptable to the client.
///
/// Its absence is also the heuristic for detecting go-plugin dialect
/// clients, which never set it.
pub(crate) const ENV_TRANSPORTS: &str = "PLUGIN_TRANSPORTS";

/// Environment variable carrying the PEM of the client's ephemeral
/// certificate, present exactly when automatic TLS negotiation is in use.
pub(crate) const ENV_CLIENT_CERT: &str = "PLUGIN_CLIENT_CERT";

/// Environment variable giving the advisory lower bound of the TCP port
/// range.
pub(crate) const ENV_MIN_PORT: &str = "PLUGIN_MIN_PORT";

/// Environment variable giving the advisory upper bound of the TCP port
/// range.
pub(crate) const ENV_MAX_PORT: &str = "PLUGIN_MAX_PORT";

/// Environment variable naming the preferred parent directory for UNIX
/// socket directories, honored only when it holds an absolute path.
pub(crate) const ENV_XDG_RUNTIME_DIR: &str = "XDG_RUNTIME_DIR";

/// Ambient state shared by the client and server lifecycles: an optional
/// environment override, the installed tracers, and the caller's
/// cancellation token.
///
/// A default context reads the real process environment, traces nothing,
/// and is never cancelled. Tracers are treated as read-only once installed.
#[derive(Clone)]
pub struct Context {
    env: Option<Arc<HashMap<String, String>>>,
    client_tracer: Arc<dyn ClientTracer>,
    server_tracer: Arc<dyn ServerTracer>,
    cancel: CancellationToken,
}

impl Context {
    /// Create a context that reads the real process environment.
    #[must_use]
    pub fn new() -> Self {
        Self {
            env: None,
            client_tracer: Arc::new(NoopClientTracer),
            server_tracer: Arc::new(NoopServerTracer),
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the environment with the given snapshot.
    ///
    /// Subsequent variable reads and child environment construction use only
    /// this snapshot; the real process environment is not consulted.
    #[must_use]
    pub fn with_env<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map = env
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect::<HashMap<_, _>>();
        self.env = Some(Arc::new(map));
        self
    }

    /// Install a client-side tracer.
    #[must_use]
    pub fn with_client_tracer(mut self, tracer: Arc<dyn ClientTracer>) -> Self {
        self.client_tracer = tracer;
        self
    }

    /// Install a server-side tracer.
    #[must_use]
    pub fn with_server_tracer(mut self, tracer: Arc<dyn ServerTracer>) -> Self {
        self.server_tracer = tracer;
        self
    }

    /// Root the context in the given cancellation token.
    ///
    /// Cancelling the token makes [`serve`](crate::serve) wind down and
    /// return without error.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Read one environment variable through the context.
    pub(crate) fn getenv(&self, key: &str) -> Option<String> {
        match &self.env {
            Some(env) => env.get(key).cloned(),
            None => std::env::var(key).ok(),
        }
    }

    /// Snapshot the full environment visible through the context, for
    /// constructing a child process environment.
    pub(crate) fn environ(&self) -> Vec<(String, String)> {
        match &self.env {
            Some(env) => env.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            None => std::env::vars().collect(),
        }
    }

    pub(crate) fn client_tracer(&self) -> &Arc<dyn ClientTracer> {
        &self.client_tracer
    }

    pub(crate) fn server_tracer(&self) -> &Arc<dyn ServerTracer> {
        &self.server_tracer
    }

    /// The caller's cancellation token.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("env", &self.env.as_ref().map(|env| env.len()))
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}
