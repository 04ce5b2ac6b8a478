//! # rpcplugin
//!
//! A framework for host programs that embed functionality by launching
//! separate plugin executables and talking to them over a local,
//! mutually-authenticated gRPC channel.
//!
//! A host (the client) spawns a plugin binary (the server) as a child
//! process. The two perform a short out-of-band handshake over the child's
//! standard output and then switch to gRPC over HTTP/2, transported over a
//! UNIX domain socket or loopback TCP and secured by short-lived,
//! mutually-pinned TLS certificates.
//!
//! ## Client side
//!
//! ```rust,no_run
//! use std::any::Any;
//! use std::sync::Arc;
//!
//! use rpcplugin::{ClientConfig, Context, HandshakeConfig, Plugin};
//! use tokio::process::Command;
//! use tonic::transport::Channel;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = Context::new();
//! let config = ClientConfig::new(
//!     HandshakeConfig::new("COUNT_PLUGIN_COOKIE", "e8f9c7d7-20fd-55c7"),
//!     Command::new("count-plugin-server"),
//! )
//! .with_version(
//!     1,
//!     Arc::new(|channel: Channel| -> Result<Box<dyn Any + Send + Sync>, rpcplugin::BoxError> {
//!         // Build and box the generated gRPC client for version 1 here.
//!         Ok(Box::new(channel))
//!     }),
//! );
//!
//! let plugin = Plugin::new(&ctx, config).await?;
//! let (proto_version, proxy) = plugin.client().await?;
//! // Downcast `proxy` to the concrete client type for `proto_version`.
//! # let _ = (proto_version, proxy);
//! plugin.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Server side
//!
//! A plugin executable calls [`serve`] from its `main`, handing it one
//! [`ServerVersion`] per supported protocol version. A
//! [`ServeError::NotChildProcess`] result means a human ran the binary
//! directly and deserves a friendly explanation instead of a handshake
//! line.
//!
//! ## Tracing
//!
//! Lifecycle events are delivered to the [`trace`] sinks installed on the
//! [`Context`]; nothing is traced by default.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod cert;
mod client;
mod context;
pub mod controlplane;
mod handshake;
mod server;
mod stdio;
mod tls;
mod transport;
mod version;

pub use rpcplugin_trace as trace;

pub use cert::{CryptoError, EphemeralIdentity};
pub use client::{ClientConfig, ClientError, ClientVersion, Plugin};
pub use context::Context;
pub use handshake::{HandshakeConfig, HandshakeError};
pub use server::{serve, ServeError, ServerConfig, ServerVersion};
pub use tls::{force_server_without_tls, ServerTls, ServerTlsProvider, TlsError};
pub use transport::{ServerAddr, TransportError};

/// Boxed error type used where callers hand their own failures back to the
/// framework.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
