//! Client lifecycle tests against scripted plugin servers.
//!
//! Real plugin executables are not needed to exercise most of the client
//! state machine: a `/bin/sh` child that prints a crafted handshake line
//! (or refuses to) covers the timeout, early-exit, validation, and pinning
//! paths. The full happy path against a live gRPC server lives in the
//! `e2e` test binary.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use rpcplugin::trace::ClientTracer;
use rpcplugin::{
    BoxError, ClientConfig, ClientError, ClientVersion, Context, EphemeralIdentity,
    HandshakeConfig, HandshakeError, Plugin, ServerAddr,
};
use tokio::process::Command;
use tonic::transport::Channel;

/// Generous bound for operations that should finish almost immediately.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn test_handshake() -> HandshakeConfig {
    HandshakeConfig::new("RPCPLUGIN_TEST_COOKIE", "f0b9c1d2-unit-test-cookie")
}

fn dummy_version() -> Arc<dyn ClientVersion> {
    Arc::new(|_channel: Channel| -> Result<Box<dyn Any + Send + Sync>, BoxError> {
        Ok(Box::new(()))
    })
}

/// A plugin "server" implemented as a shell one-liner.
fn scripted_plugin(script: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(script);
    command
}

fn config_for(script: &str) -> ClientConfig {
    ClientConfig::new(test_handshake(), scripted_plugin(script))
        .with_version(1, dummy_version())
        .with_start_timeout(TEST_TIMEOUT)
}

async fn expect_startup_error(script: &str) -> ClientError {
    Plugin::new(&Context::new(), config_for(script))
        .await
        .expect_err("startup should fail")
}

#[tokio::test]
async fn test_start_timeout_fails_and_kills_slow_server() {
    let config = config_for("sleep 30").with_start_timeout(Duration::from_millis(200));
    let err = Plugin::new(&Context::new(), config).await.unwrap_err();
    assert!(matches!(err, ClientError::Timeout(_)), "got {err}");
}

#[tokio::test]
async fn test_exit_without_handshake_is_reported() {
    let err = expect_startup_error("exit 0").await;
    assert!(matches!(err, ClientError::ExitedBeforeHandshake), "got {err}");
}

#[tokio::test]
async fn test_invalid_handshake_version_is_rejected() {
    let err = expect_startup_error("printf '2|1|tcp|127.0.0.1:5000|grpc|\\n'; sleep 30").await;
    assert!(
        matches!(
            err,
            ClientError::Handshake(HandshakeError::InvalidCoreVersion(_))
        ),
        "got {err}"
    );
}

#[tokio::test]
async fn test_unsupported_proto_version_is_rejected() {
    let err = expect_startup_error("printf '1|9|tcp|127.0.0.1:5000|grpc|\\n'; sleep 30").await;
    assert!(
        matches!(
            err,
            ClientError::Handshake(HandshakeError::UnsupportedProtoVersion(9))
        ),
        "got {err}"
    );
}

#[tokio::test]
async fn test_auto_tls_requires_advertised_certificate() {
    let err = expect_startup_error("printf '1|1|tcp|127.0.0.1:5000|grpc|\\n'; sleep 30").await;
    assert!(
        matches!(
            err,
            ClientError::Handshake(HandshakeError::MissingServerCert)
        ),
        "got {err}"
    );
}

#[derive(Default)]
struct RecordingTracer {
    events: Mutex<Vec<String>>,
    exited: AtomicBool,
}

impl ClientTracer for RecordingTracer {
    fn process_start(&self, _program: &std::path::Path) {
        self.events.lock().unwrap().push("process_start".into());
    }

    fn process_running(&self, _pid: u32) {
        self.events.lock().unwrap().push("process_running".into());
    }

    fn process_exited(&self, _status: std::process::ExitStatus) {
        self.events.lock().unwrap().push("process_exited".into());
        self.exited.store(true, Ordering::SeqCst);
    }

    fn tls_config(&self, auto: bool) {
        self.events.lock().unwrap().push(format!("tls_config:{auto}"));
    }

    fn server_started(&self, _pid: u32, network: &str, _addr: &str, proto_version: u32) {
        self.events
            .lock()
            .unwrap()
            .push(format!("server_started:{network}:{proto_version}"));
    }

    fn closing(&self, _pid: u32) {
        self.events.lock().unwrap().push("closing".into());
    }
}

#[tokio::test]
async fn test_successful_handshake_pins_certificate_and_close_reaps() {
    // The "server" advertises a real certificate and then just sits there;
    // the handshake completes without any dialing.
    let identity = EphemeralIdentity::issue().unwrap();
    let cert_b64 = BASE64_STANDARD.encode(identity.cert_der());
    let script = format!("printf '1|1|tcp|127.0.0.1:5000|grpc|{cert_b64}\\n'; sleep 30");

    let tracer = Arc::new(RecordingTracer::default());
    let ctx = Context::new().with_client_tracer(tracer.clone());

    let plugin = Plugin::new(&ctx, config_for(&script)).await.unwrap();
    assert_eq!(plugin.proto_version(), 1);
    assert_eq!(
        plugin.addr(),
        &ServerAddr::Tcp("127.0.0.1:5000".parse().unwrap())
    );

    tokio::time::timeout(TEST_TIMEOUT, plugin.close())
        .await
        .expect("close should not hang")
        .unwrap();

    // The child is gone once close returns.
    assert!(tracer.exited.load(Ordering::SeqCst));
    let events = tracer.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "process_start",
            "process_running",
            "tls_config:true",
            "server_started:tcp:1",
            "closing",
            "process_exited",
        ]
    );
}

#[tokio::test]
async fn test_pinned_certificate_rejects_mismatched_server() {
    // A TLS server presenting certificate Y while the handshake advertised
    // certificate X must be rejected at dial time.
    let actual = EphemeralIdentity::issue().unwrap();
    let advertised = EphemeralIdentity::issue().unwrap();

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![actual.cert_der().clone()], actual.private_key())
        .unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let _ = acceptor.accept(stream).await;
            });
        }
    });

    let cert_b64 = BASE64_STANDARD.encode(advertised.cert_der());
    let script = format!("printf '1|1|tcp|{addr}|grpc|{cert_b64}\\n'; sleep 30");
    let plugin = Plugin::new(&Context::new(), config_for(&script))
        .await
        .unwrap();

    let err = plugin.client().await.unwrap_err();
    assert!(matches!(err, ClientError::Rpc(_)), "got {err}");

    plugin.close().await.unwrap();
}
