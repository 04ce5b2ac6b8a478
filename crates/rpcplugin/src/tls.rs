//! Mutual-TLS negotiation for the plugin RPC channel.
//!
//! By default both peers bootstrap trust automatically: each issues itself
//! an ephemeral certificate (see [`crate::cert`]), the client's travels to
//! the server in `PLUGIN_CLIENT_CERT`, the server's travels back in the
//! handshake line, and each side pins the other's certificate as its only
//! trust root.
//!
//! A server may instead install its own TLS provider function, either to
//! take full control of certificate selection or to deliberately run
//! without TLS for interop with clients that do not speak it.

use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;

use crate::cert::{CryptoError, EphemeralIdentity};
use crate::context::{Context, ENV_CLIENT_CERT};
use crate::BoxError;

/// Server name the client always verifies against, matching the subject of
/// every ephemeral certificate.
pub(crate) const TLS_SERVER_NAME: &str = "localhost";

/// Result of a caller-supplied server TLS provider function.
pub enum ServerTls {
    /// Serve with this TLS configuration.
    Config(rustls::ServerConfig),
    /// Serve plaintext. This violates the rpcplugin protocol and exists as
    /// a pragmatic exception for debugging and for serving go-plugin
    /// clients that were not configured to use TLS.
    ForceNoTls,
}

/// A caller-supplied function that prepares the server's TLS configuration,
/// overriding the automatic negotiation protocol.
pub type ServerTlsProvider = Box<dyn Fn(&Context) -> Result<ServerTls, BoxError> + Send + Sync>;

/// A ready-made [`ServerTlsProvider`] that turns TLS off entirely.
///
/// This is the only way to make a server run plaintext; see
/// [`ServerTls::ForceNoTls`].
#[must_use]
pub fn force_server_without_tls() -> ServerTlsProvider {
    Box::new(|_| Ok(ServerTls::ForceNoTls))
}

/// Errors preparing a TLS configuration.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// The caller-supplied TLS provider function failed.
    #[error("TLS configuration function failed: {0}")]
    Provider(#[source] BoxError),

    /// Automatic negotiation requires the client certificate environment
    /// variable.
    #[error("PLUGIN_CLIENT_CERT environment variable is not set")]
    MissingClientCert,

    /// Certificate issuance or PEM parsing failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Building the client-certificate verifier failed.
    #[error("failed to build client certificate verifier: {0}")]
    ClientVerifier(#[source] rustls::server::VerifierBuilderError),

    /// Assembling the rustls configuration failed.
    #[error("failed to build TLS configuration: {0}")]
    Build(#[from] rustls::Error),
}

/// The server's negotiated TLS mode.
#[derive(Debug)]
pub(crate) enum NegotiatedServerTls {
    /// Automatic negotiation: serve with `config` and advertise `identity`
    /// in the handshake line.
    Auto {
        config: Arc<rustls::ServerConfig>,
        identity: EphemeralIdentity,
    },
    /// Caller-supplied configuration; nothing to advertise.
    Provided(Arc<rustls::ServerConfig>),
    /// The force-no-TLS override was chosen.
    Plaintext,
}

impl NegotiatedServerTls {
    pub(crate) fn is_auto(&self) -> bool {
        matches!(self, Self::Auto { .. })
    }
}

/// Install the process-default rustls crypto provider.
///
/// Ignores the error when a provider is already installed, for example by
/// the embedding application or by an earlier call.
pub(crate) fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Prepare the server's TLS mode, either through the caller's provider
/// function or the automatic negotiation protocol.
///
/// # Errors
///
/// Returns [`TlsError`] if the provider function fails, the advertised
/// client certificate is missing or unparseable, identity issuance fails,
/// or the rustls configuration cannot be built.
pub(crate) fn server_tls_config(
    ctx: &Context,
    provider: Option<&ServerTlsProvider>,
) -> Result<NegotiatedServerTls, TlsError> {
    if let Some(provider) = provider {
        // A provider function overrides all of the usual default behavior so
        // the calling application can handle certificate selection however
        // it wants.
        return match provider(ctx).map_err(TlsError::Provider)? {
            ServerTls::Config(config) => Ok(NegotiatedServerTls::Provided(Arc::new(config))),
            ServerTls::ForceNoTls => Ok(NegotiatedServerTls::Plaintext),
        };
    }

    install_crypto_provider();

    let client_cert_pem = ctx
        .getenv(ENV_CLIENT_CERT)
        .filter(|pem| !pem.is_empty())
        .ok_or(TlsError::MissingClientCert)?;

    let client_certs = parse_cert_pem(&client_cert_pem)?;
    let mut client_roots = RootCertStore::empty();
    for cert in client_certs {
        client_roots
            .add(cert)
            .map_err(|error| CryptoError::InvalidPem(error.to_string()))?;
    }

    let verifier = WebPkiClientVerifier::builder(Arc::new(client_roots))
        .build()
        .map_err(TlsError::ClientVerifier)?;

    let identity = EphemeralIdentity::issue()?;

    let config = rustls::ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS13,
        &rustls::version::TLS12,
    ])
    .with_client_cert_verifier(verifier)
    .with_single_cert(vec![identity.cert_der().clone()], identity.private_key())?;

    Ok(NegotiatedServerTls::Auto {
        config: Arc::new(config),
        identity,
    })
}

/// Build the client's TLS configuration from its ephemeral identity and the
/// trust roots pinned from the server's handshake line.
///
/// # Errors
///
/// Returns [`TlsError`] if the rustls configuration cannot be built.
pub(crate) fn client_tls_config(
    identity: &EphemeralIdentity,
    roots: RootCertStore,
) -> Result<rustls::ClientConfig, TlsError> {
    install_crypto_provider();

    let config = rustls::ClientConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS13,
        &rustls::version::TLS12,
    ])
    .with_root_certificates(roots)
    .with_client_auth_cert(vec![identity.cert_der().clone()], identity.private_key())?;

    Ok(config)
}

/// Decode every certificate in a PEM bundle.
fn parse_cert_pem(pem: &str) -> Result<Vec<CertificateDer<'static>>, CryptoError> {
    let mut reader = pem.as_bytes();
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|error| CryptoError::InvalidPem(error.to_string()))?;
    if certs.is_empty() {
        return Err(CryptoError::InvalidPem(
            "no certificates found in PEM data".to_string(),
        ));
    }
    Ok(certs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with_client_cert(pem: &str) -> Context {
        Context::new().with_env([(ENV_CLIENT_CERT, pem)])
    }

    #[test]
    fn test_auto_negotiation_builds_config_and_identity() {
        let client = EphemeralIdentity::issue().unwrap();
        let ctx = ctx_with_client_cert(client.cert_pem());
        let negotiated = server_tls_config(&ctx, None).unwrap();
        match negotiated {
            NegotiatedServerTls::Auto { identity, .. } => {
                assert!(identity.cert_pem().starts_with("-----BEGIN CERTIFICATE-----"));
            }
            _ => panic!("expected auto-negotiated TLS"),
        }
    }

    #[test]
    fn test_auto_negotiation_requires_client_cert() {
        let ctx = Context::new().with_env::<_, String, String>([]);
        let err = server_tls_config(&ctx, None).unwrap_err();
        assert!(matches!(err, TlsError::MissingClientCert));
    }

    #[test]
    fn test_auto_negotiation_rejects_garbage_pem() {
        let ctx = ctx_with_client_cert("not a certificate");
        let err = server_tls_config(&ctx, None).unwrap_err();
        assert!(matches!(err, TlsError::Crypto(CryptoError::InvalidPem(_))));
    }

    #[test]
    fn test_force_no_tls_provider_selects_plaintext() {
        let ctx = Context::new().with_env::<_, String, String>([]);
        let provider = force_server_without_tls();
        let negotiated = server_tls_config(&ctx, Some(&provider)).unwrap();
        assert!(matches!(negotiated, NegotiatedServerTls::Plaintext));
    }

    #[test]
    fn test_provider_errors_propagate() {
        let ctx = Context::new().with_env::<_, String, String>([]);
        let provider: ServerTlsProvider = Box::new(|_| Err("no certs today".into()));
        let err = server_tls_config(&ctx, Some(&provider)).unwrap_err();
        assert!(matches!(err, TlsError::Provider(_)));
    }

    #[test]
    fn test_client_config_pins_roots() {
        let identity = EphemeralIdentity::issue().unwrap();
        let server = EphemeralIdentity::issue().unwrap();
        let mut roots = RootCertStore::empty();
        roots.add(server.cert_der().clone()).unwrap();
        let config = client_tls_config(&identity, roots).unwrap();
        // Mutual TLS: the client presents its own certificate.
        assert!(config.client_auth_cert_resolver.has_certs());
    }
}
