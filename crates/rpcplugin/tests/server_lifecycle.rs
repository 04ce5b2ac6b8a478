//! Server lifecycle tests driven through environment-injected contexts.
//!
//! `serve` reads everything it negotiates from the environment its host
//! prepared, so these tests inject environments through `Context` values
//! instead of mutating the real process environment. They cover the
//! initialization failure paths, which all reject before the handshake
//! line is written; the serving happy path lives in the `e2e` test binary.

use rpcplugin::{
    serve, BoxError, Context, EphemeralIdentity, HandshakeConfig, ServeError, ServerConfig,
    ServerTlsProvider, ServerVersion, TlsError,
};
use tonic::service::RoutesBuilder;

const COOKIE_KEY: &str = "RPCPLUGIN_TEST_COOKIE";
const COOKIE_VALUE: &str = "9d7b2a41-server-test-cookie";

fn noop_version() -> Box<dyn ServerVersion> {
    Box::new(|_routes: &mut RoutesBuilder| -> Result<(), BoxError> { Ok(()) })
}

fn base_config() -> ServerConfig {
    ServerConfig::new(HandshakeConfig::new(COOKIE_KEY, COOKIE_VALUE)).with_version(1, noop_version())
}

#[tokio::test]
async fn test_direct_launch_is_rejected() {
    // No cookie variable at all: the binary was run from a shell.
    let ctx = Context::new().with_env::<_, String, String>([]);
    let err = serve(&ctx, base_config()).await.unwrap_err();
    assert!(err.is_not_child_process(), "got {err}");
}

#[tokio::test]
async fn test_cookie_mismatch_is_rejected() {
    let ctx = Context::new().with_env([(COOKIE_KEY, "some other value")]);
    let err = serve(&ctx, base_config()).await.unwrap_err();
    assert!(matches!(err, ServeError::NotChildProcess), "got {err}");
}

#[tokio::test]
async fn test_empty_cookie_config_is_rejected() {
    let ctx = Context::new().with_env([(COOKIE_KEY, COOKIE_VALUE)]);
    let config = ServerConfig::new(HandshakeConfig::new("", "")).with_version(1, noop_version());
    let err = serve(&ctx, config).await.unwrap_err();
    assert!(matches!(err, ServeError::Config(_)), "got {err}");
}

#[tokio::test]
async fn test_no_common_version_fails_before_listening() {
    let ctx = Context::new().with_env([
        (COOKIE_KEY, COOKIE_VALUE),
        ("PLUGIN_PROTOCOL_VERSIONS", "1"),
    ]);
    let config =
        ServerConfig::new(HandshakeConfig::new(COOKIE_KEY, COOKIE_VALUE)).with_version(2, noop_version());
    let err = serve(&ctx, config).await.unwrap_err();
    assert!(matches!(err, ServeError::Negotiation), "got {err}");
}

#[tokio::test]
async fn test_missing_version_list_fails_negotiation() {
    let ctx = Context::new().with_env([(COOKIE_KEY, COOKIE_VALUE)]);
    let err = serve(&ctx, base_config()).await.unwrap_err();
    assert!(matches!(err, ServeError::Negotiation), "got {err}");
}

#[tokio::test]
async fn test_auto_tls_requires_client_certificate() {
    // Everything up to TLS negotiation succeeds, but the client never
    // advertised a certificate.
    let ctx = Context::new().with_env([
        (COOKIE_KEY, COOKIE_VALUE),
        ("PLUGIN_PROTOCOL_VERSIONS", "1"),
        ("PLUGIN_TRANSPORTS", "tcp"),
    ]);
    let err = serve(&ctx, base_config()).await.unwrap_err();
    assert!(
        matches!(err, ServeError::Tls(TlsError::MissingClientCert)),
        "got {err}"
    );
}

#[tokio::test]
async fn test_garbage_client_certificate_is_rejected() {
    let ctx = Context::new().with_env([
        (COOKIE_KEY, COOKIE_VALUE),
        ("PLUGIN_PROTOCOL_VERSIONS", "1"),
        ("PLUGIN_TRANSPORTS", "tcp"),
        ("PLUGIN_CLIENT_CERT", "definitely not PEM"),
    ]);
    let err = serve(&ctx, base_config()).await.unwrap_err();
    assert!(matches!(err, ServeError::Tls(_)), "got {err}");
}

#[tokio::test]
async fn test_tls_provider_errors_propagate() {
    let identity = EphemeralIdentity::issue().unwrap();
    let ctx = Context::new().with_env([
        (COOKIE_KEY, COOKIE_VALUE),
        ("PLUGIN_PROTOCOL_VERSIONS", "1"),
        ("PLUGIN_TRANSPORTS", "tcp"),
        ("PLUGIN_CLIENT_CERT", identity.cert_pem()),
    ]);
    let provider: ServerTlsProvider = Box::new(|_| Err("certificate store unavailable".into()));
    let config = base_config().with_tls(provider);
    let err = serve(&ctx, config).await.unwrap_err();
    assert!(
        matches!(err, ServeError::Tls(TlsError::Provider(_))),
        "got {err}"
    );
}

#[tokio::test]
async fn test_unusable_transports_fail_negotiation() {
    let identity = EphemeralIdentity::issue().unwrap();
    let ctx = Context::new().with_env([
        (COOKIE_KEY, COOKIE_VALUE),
        ("PLUGIN_PROTOCOL_VERSIONS", "1"),
        ("PLUGIN_TRANSPORTS", "smoke-signals"),
        ("PLUGIN_CLIENT_CERT", identity.cert_pem()),
    ]);
    let err = serve(&ctx, base_config()).await.unwrap_err();
    assert!(matches!(err, ServeError::Transport(_)), "got {err}");
}
