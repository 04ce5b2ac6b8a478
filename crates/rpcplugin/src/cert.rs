//! Ephemeral certificate issuance for the automatic TLS bootstrap.
//!
//! Each side of an auto-negotiated plugin connection issues itself one
//! single-use, self-signed certificate that acts as both CA and leaf
//! identity. The public half travels to the peer (through the environment on
//! the way down, through the handshake line on the way up) and is pinned as
//! the peer's only trust root. The private key never leaves the issuing
//! process and is discarded with it.
//!
//! The stated validity window is deliberately long (about 30 years, with
//! `NotBefore` backdated 30 seconds for clock skew): these certificates are
//! ephemeral in use, not in lifetime, and pinning rather than expiry is what
//! provides the security.

use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SerialNumber, PKCS_ECDSA_P384_SHA384,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::{Duration, OffsetDateTime};

/// Common name and DNS SAN used by every ephemeral certificate. The client
/// always dials with this server name, so verification is independent of the
/// actual transport address.
pub(crate) const CERT_HOST: &str = "localhost";

/// Clock-skew slack applied to `NotBefore`.
const NOT_BEFORE_SLACK: Duration = Duration::seconds(30);

/// Validity period. Matches the wire-compatible implementations (262980
/// hours, about 30 years).
const VALIDITY: Duration = Duration::hours(262_980);

/// Errors from certificate issuance or PEM decoding.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Key-pair generation failed.
    #[error("failed to generate key pair: {0}")]
    KeyGeneration(#[source] rcgen::Error),

    /// Building or signing the certificate failed.
    #[error("failed to issue self-signed certificate: {0}")]
    Issuance(#[source] rcgen::Error),

    /// A PEM blob did not contain a usable certificate.
    #[error("invalid certificate PEM: {0}")]
    InvalidPem(String),
}

/// A freshly issued self-signed identity: certificate plus private key.
///
/// Produced once per plugin session on each side when automatic TLS
/// negotiation is in use. Callers building their own TLS configurations can
/// also issue identities directly.
#[derive(Debug)]
pub struct EphemeralIdentity {
    cert_der: CertificateDer<'static>,
    key_der: Vec<u8>,
    cert_pem: String,
}

impl EphemeralIdentity {
    /// Issue a new single-use identity.
    ///
    /// The certificate self-signs (it is its own issuer), carries both
    /// `clientAuth` and `serverAuth` extended key usages plus the CA bit, a
    /// 128-bit random serial number, and a `localhost` subject and DNS name.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError`] if key generation or certificate signing
    /// fails.
    pub fn issue() -> Result<Self, CryptoError> {
        let key_pair =
            KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384).map_err(CryptoError::KeyGeneration)?;

        let mut params = CertificateParams::new(vec![CERT_HOST.to_string()])
            .map_err(CryptoError::Issuance)?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, CERT_HOST);
        dn.push(DnType::OrganizationName, "rpcplugin");
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::KeyAgreement,
            KeyUsagePurpose::KeyCertSign,
        ];

        let mut serial = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut serial);
        params.serial_number = Some(SerialNumber::from_slice(&serial));

        let now = OffsetDateTime::now_utc();
        params.not_before = now - NOT_BEFORE_SLACK;
        params.not_after = now + VALIDITY;

        let cert = params.self_signed(&key_pair).map_err(CryptoError::Issuance)?;

        Ok(Self {
            cert_der: cert.der().clone(),
            key_der: key_pair.serialize_der(),
            cert_pem: cert.pem(),
        })
    }

    /// The certificate in DER form.
    #[must_use]
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// The certificate as a PEM block, as exported through
    /// `PLUGIN_CLIENT_CERT`.
    #[must_use]
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// The private key as PKCS#8 DER, ready for a rustls configuration.
    #[must_use]
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_produces_pem_and_der() {
        let identity = EphemeralIdentity::issue().unwrap();
        assert!(identity.cert_pem().starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(!identity.cert_der().is_empty());
    }

    #[test]
    fn test_issued_identities_are_unique() {
        let a = EphemeralIdentity::issue().unwrap();
        let b = EphemeralIdentity::issue().unwrap();
        // Random serials and fresh keys mean no two identities ever agree.
        assert_ne!(a.cert_der(), b.cert_der());
    }

    #[test]
    fn test_identity_is_usable_as_rustls_server_identity() {
        crate::tls::install_crypto_provider();
        let identity = EphemeralIdentity::issue().unwrap();
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![identity.cert_der().clone()], identity.private_key());
        assert!(config.is_ok());
    }

    #[test]
    fn test_identity_is_usable_as_pinned_trust_root() {
        let identity = EphemeralIdentity::issue().unwrap();
        let mut roots = rustls::RootCertStore::empty();
        roots.add(identity.cert_der().clone()).unwrap();
        assert_eq!(roots.len(), 1);
    }
}
