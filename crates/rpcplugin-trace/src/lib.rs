//! Lifecycle trace events for the rpcplugin framework.
//!
//! Plugin clients and servers emit a small set of structured notifications as
//! they move through their lifecycles: processes starting and exiting, TLS
//! negotiation completing, listeners coming up, interrupts being ignored.
//! This crate defines the two sinks for those notifications, [`ClientTracer`]
//! and [`ServerTracer`], as traits whose methods all have empty default
//! bodies. An implementation observes only the events it cares about.
//!
//! Tracers are passive: they must not block, must not mutate anything handed
//! to them, and are treated as read-only once installed on a context.
//!
//! [`LogClientTracer`] and [`LogServerTracer`] are ready-made implementations
//! that forward every event to the `tracing` facade as human-oriented log
//! entries.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

use std::error::Error;
use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;

/// Observer for events in a plugin client (the host program).
///
/// All methods have no-op default bodies; implement only the ones you need.
/// Address-bearing events receive the transport name (`"tcp"` or `"unix"`)
/// and the display form of the address.
pub trait ClientTracer: Send + Sync {
    /// Called just before the client launches the plugin server child
    /// process.
    fn process_start(&self, _program: &Path) {}

    /// Called after the server child process has started, with its OS
    /// process ID.
    fn process_running(&self, _pid: u32) {}

    /// Called if the server child process failed to start.
    fn process_start_failed(&self, _program: &Path, _error: &(dyn Error + 'static)) {}

    /// Called when a server child process terminates. Emitted at most once
    /// per process, always before the plugin's exit latch closes.
    fn process_exited(&self, _status: ExitStatus) {}

    /// Called when the client TLS configuration is complete. `auto` is true
    /// if and only if the auto-negotiation protocol produced a single-use
    /// certificate.
    fn tls_config(&self, _auto: bool) {}

    /// Called once the server process has completed the handshake protocol
    /// and is ready to be used.
    fn server_started(&self, _pid: u32, _network: &str, _addr: &str, _proto_version: u32) {}

    /// Called if the server program doesn't complete the handshake before
    /// the configured start timeout.
    fn server_start_timeout(&self, _pid: u32, _timeout: Duration) {}

    /// Called just before the client opens a connection to the server's
    /// listen socket.
    fn connect(&self, _network: &str, _addr: &str) {}

    /// Called once a connection to the server's listen socket is
    /// established.
    fn connected(&self, _network: &str, _addr: &str) {}

    /// Called if connecting to the server's listen socket failed.
    fn connect_failed(&self, _network: &str, _addr: &str, _error: &(dyn Error + 'static)) {}

    /// Called when a plugin instance is asked to shut down, before the
    /// child process is killed.
    fn closing(&self, _pid: u32) {}
}

/// Observer for events in a plugin server (the child process).
///
/// All methods have no-op default bodies; implement only the ones you need.
pub trait ServerTracer: Send + Sync {
    /// Called when server TLS configuration is complete. `auto` is true if
    /// and only if the auto-negotiation protocol produced a single-use
    /// certificate.
    fn tls_config(&self, _auto: bool) {}

    /// Called once the server listener is up and the handshake line has
    /// been written, with the negotiated parameters.
    fn listening(&self, _network: &str, _addr: &str, _proto_version: u32) {}

    /// Called each time the server ignores an interrupt signal. `count` is
    /// how many interrupts have been received since the server started.
    ///
    /// Never called when signal handling is disabled in the server config.
    fn interrupt_ignored(&self, _count: u32) {}

    /// Called when version negotiation encounters an entry in the client's
    /// supported-version list that is not a decimal integer. The entry is
    /// skipped.
    fn invalid_client_handshake_version(&self, _invalid: &str) {}

    /// Called when the server finds no protocol version in common with the
    /// client. The argument is the set of versions the client supports.
    fn version_negotiation_failed(&self, _client_versions: &[u32]) {}

    /// Called if the RPC serve loop exits with an error.
    fn rpc_serve_error(&self, _error: &(dyn Error + 'static)) {}
}

/// A [`ClientTracer`] that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopClientTracer;

impl ClientTracer for NoopClientTracer {}

/// A [`ServerTracer`] that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopServerTracer;

impl ServerTracer for NoopServerTracer {}

/// A [`ClientTracer`] that emits a human-oriented `tracing` event for every
/// notification.
///
/// The format of these log entries is not customizable and may change in
/// future versions. For more control, implement [`ClientTracer`] yourself
/// and build log messages however you like.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogClientTracer;

impl ClientTracer for LogClientTracer {
    fn process_start(&self, program: &Path) {
        tracing::info!(program = %program.display(), "launching plugin server");
    }

    fn process_running(&self, pid: u32) {
        tracing::debug!(pid, "plugin server process started");
    }

    fn process_start_failed(&self, program: &Path, error: &(dyn Error + 'static)) {
        tracing::error!(program = %program.display(), %error, "failed to start plugin server");
    }

    fn process_exited(&self, status: ExitStatus) {
        tracing::info!(%status, "plugin server process exited");
    }

    fn tls_config(&self, auto: bool) {
        if auto {
            tracing::debug!("auto-negotiated TLS configuration");
        } else {
            tracing::debug!("TLS configuration supplied by the caller");
        }
    }

    fn server_started(&self, pid: u32, network: &str, addr: &str, proto_version: u32) {
        tracing::info!(
            pid,
            network,
            addr,
            proto_version,
            "plugin server completed handshake"
        );
    }

    fn server_start_timeout(&self, pid: u32, timeout: Duration) {
        tracing::warn!(pid, ?timeout, "timeout waiting for plugin server handshake");
    }

    fn connect(&self, network: &str, addr: &str) {
        tracing::debug!(network, addr, "connecting to plugin server");
    }

    fn connected(&self, network: &str, addr: &str) {
        tracing::debug!(network, addr, "connected to plugin server");
    }

    fn connect_failed(&self, network: &str, addr: &str, error: &(dyn Error + 'static)) {
        tracing::warn!(network, addr, %error, "failed to connect to plugin server");
    }

    fn closing(&self, pid: u32) {
        tracing::info!(pid, "closing plugin server");
    }
}

/// A [`ServerTracer`] that emits a human-oriented `tracing` event for every
/// notification.
///
/// The format of these log entries is not customizable and may change in
/// future versions. For more control, implement [`ServerTracer`] yourself
/// and build log messages however you like.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogServerTracer;

impl ServerTracer for LogServerTracer {
    fn tls_config(&self, auto: bool) {
        if auto {
            tracing::debug!("auto-negotiated TLS configuration");
        } else {
            tracing::debug!("TLS configuration supplied by the caller");
        }
    }

    fn listening(&self, network: &str, addr: &str, proto_version: u32) {
        tracing::info!(network, addr, proto_version, "plugin server listening");
    }

    fn interrupt_ignored(&self, count: u32) {
        tracing::debug!(count, "ignored interrupt signal");
    }

    fn invalid_client_handshake_version(&self, invalid: &str) {
        tracing::warn!(invalid, "invalid version string in client handshake");
    }

    fn version_negotiation_failed(&self, client_versions: &[u32]) {
        if client_versions.is_empty() {
            tracing::warn!("version negotiation failed: client supports no protocol versions");
        } else {
            tracing::warn!(
                ?client_versions,
                "version negotiation failed: no version in common with client"
            );
        }
    }

    fn rpc_serve_error(&self, error: &(dyn Error + 'static)) {
        tracing::error!(%error, "RPC server exited with error");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct CountingTracer {
        interrupts: AtomicU32,
    }

    impl ServerTracer for CountingTracer {
        fn interrupt_ignored(&self, _count: u32) {
            self.interrupts.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_default_methods_are_noops() {
        // A tracer that overrides one slot still accepts every other event.
        let tracer = CountingTracer {
            interrupts: AtomicU32::new(0),
        };
        tracer.tls_config(true);
        tracer.listening("tcp", "127.0.0.1:4000", 1);
        tracer.version_negotiation_failed(&[1, 2]);
        tracer.interrupt_ignored(1);
        tracer.interrupt_ignored(2);
        assert_eq!(tracer.interrupts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_noop_tracers_accept_all_events() {
        let client = NoopClientTracer;
        client.process_running(42);
        client.tls_config(false);
        client.closing(42);

        let server = NoopServerTracer;
        server.interrupt_ignored(1);
        server.invalid_client_handshake_version("abc");
    }
}
