//! The out-of-band plugin handshake: cookie gate and handshake line.
//!
//! Before any RPC traffic, the server proves it was launched by its expected
//! host (the cookie environment variable) and then announces how to connect
//! by printing a single pipe-delimited line on its inherited stdout:
//!
//! ```text
//! 1|<protoVersion>|<transport>|<address>|grpc|<certB64>
//! ```
//!
//! The final field is empty unless automatic TLS negotiation produced a
//! server certificate, in which case it carries the certificate DER under
//! base64. For interop with the related go-plugin dialect the server uses
//! unpadded base64 when the client looks like go-plugin, and the client
//! accepts either variant.

use base64::prelude::{Engine as _, BASE64_STANDARD, BASE64_STANDARD_NO_PAD};
use rustls::pki_types::CertificateDer;

use crate::context::{Context, ENV_TRANSPORTS};
use crate::transport::ServerAddr;

/// Version of the handshake line format itself (the first field).
const CORE_PROTOCOL_VERSION: &str = "1";

/// The only RPC protocol this implementation speaks (the fifth field).
const RPC_PROTOCOL: &str = "grpc";

/// Certificate fields at most this long are ignored: older go-plugin
/// versions used the slot for something other than a certificate, and no
/// base64 DER certificate can be this short.
const LEGACY_CERT_FIELD_LEN: usize = 50;

/// Settings that the client and server must both agree on for a plugin
/// connection to be established.
///
/// The cookie is passed as an environment variable from the client to the
/// server child process. It is not a security mechanism: it exists so that
/// a plugin executable launched directly from a shell can print a friendly
/// error instead of an inscrutable handshake line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Environment variable name the client sets when launching servers.
    /// Usually identifies the calling application.
    pub cookie_key: String,
    /// Expected value, usually a hard-coded arbitrary string unlikely to be
    /// set by hand.
    pub cookie_value: String,
}

impl HandshakeConfig {
    /// Convenience constructor.
    pub fn new(cookie_key: impl Into<String>, cookie_value: impl Into<String>) -> Self {
        Self {
            cookie_key: cookie_key.into(),
            cookie_value: cookie_value.into(),
        }
    }
}

/// Whether the configured handshake cookie variable is present with the
/// agreed value in the environment visible through the context.
pub(crate) fn have_handshake_cookie(ctx: &Context, config: &HandshakeConfig) -> bool {
    ctx.getenv(&config.cookie_key).as_deref() == Some(config.cookie_value.as_str())
}

/// Whether the client appears to be the related go-plugin dialect rather
/// than a compliant rpcplugin client.
///
/// go-plugin never sets `PLUGIN_TRANSPORTS`. The answer changes only which
/// base64 variant encodes the handshake certificate and whether the
/// shutdown compatibility service is registered; RPC semantics for
/// compliant clients are unaffected.
pub(crate) fn client_smells_like_go_plugin(ctx: &Context) -> bool {
    ctx.getenv(ENV_TRANSPORTS).is_none()
}

/// Render the handshake line, newline terminator included.
pub(crate) fn format_handshake_line(proto_version: u32, addr: &ServerAddr, cert_b64: &str) -> String {
    format!(
        "{CORE_PROTOCOL_VERSION}|{proto_version}|{network}|{addr}|{RPC_PROTOCOL}|{cert_b64}\n",
        network = addr.network(),
    )
}

/// Encode a server certificate for the handshake line.
///
/// go-plugin expects its non-standard unpadded encoding; everything else
/// gets standard padded base64.
pub(crate) fn encode_handshake_cert(der: &[u8], go_plugin_dialect: bool) -> String {
    if go_plugin_dialect {
        BASE64_STANDARD_NO_PAD.encode(der)
    } else {
        BASE64_STANDARD.encode(der)
    }
}

/// A successfully validated handshake line.
#[derive(Debug)]
pub(crate) struct ParsedHandshake {
    pub proto_version: u32,
    pub addr: ServerAddr,
    pub server_cert: Option<CertificateDer<'static>>,
}

/// Failure to validate a handshake line received from a plugin server.
///
/// Each variant names the specific field that was inconsistent.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// The line did not have at least five pipe-delimited fields.
    #[error("invalid handshake message {0:?} from plugin server")]
    Malformed(String),

    /// The first field was not the expected handshake format version.
    #[error("invalid handshake version {0:?} from plugin server; want \"1\"")]
    InvalidCoreVersion(String),

    /// The fifth field named an RPC protocol other than gRPC.
    #[error("invalid RPC protocol {0:?} from plugin server; want \"grpc\"")]
    InvalidRpcProtocol(String),

    /// The protocol version field was not a decimal integer.
    #[error("invalid protocol version {0:?} from plugin server")]
    InvalidProtoVersion(String),

    /// The server chose a protocol version this client does not implement.
    #[error("plugin server selected unsupported protocol version {0}")]
    UnsupportedProtoVersion(u32),

    /// The transport field named neither `tcp` nor `unix`.
    #[error("plugin server selected unsupported transport protocol {0:?}")]
    UnsupportedTransport(String),

    /// The address field did not parse for the named transport.
    #[error("plugin server provided invalid {network} socket address {addr:?}")]
    InvalidAddress {
        /// Transport the address was claimed to belong to.
        network: &'static str,
        /// The offending address text.
        addr: String,
    },

    /// The certificate field was present but not decodable base64 DER.
    #[error("failed to parse plugin server's temporary certificate: {0}")]
    InvalidServerCert(String),

    /// Automatic TLS is in use but the server advertised no certificate to
    /// pin.
    #[error("plugin server advertised no certificate for automatic TLS")]
    MissingServerCert,
}

/// Parse and validate one handshake line.
///
/// `is_supported` reports whether this client implements a given protocol
/// version. Validation happens in a fixed order so that the reported error
/// always names the first inconsistent field.
pub(crate) fn parse_handshake_line(
    line: &str,
    is_supported: impl Fn(u32) -> bool,
) -> Result<ParsedHandshake, HandshakeError> {
    let line = line.trim();
    let parts: Vec<&str> = line.splitn(6, '|').collect();
    if parts.len() < 5 {
        return Err(HandshakeError::Malformed(line.to_string()));
    }

    if parts[0] != CORE_PROTOCOL_VERSION {
        return Err(HandshakeError::InvalidCoreVersion(parts[0].to_string()));
    }
    if parts[4] != RPC_PROTOCOL {
        return Err(HandshakeError::InvalidRpcProtocol(parts[4].to_string()));
    }

    let proto_version: u32 = parts[1]
        .parse()
        .map_err(|_| HandshakeError::InvalidProtoVersion(parts[1].to_string()))?;
    if !is_supported(proto_version) {
        return Err(HandshakeError::UnsupportedProtoVersion(proto_version));
    }

    let addr = match parts[2] {
        "tcp" => {
            let addr = parts[3]
                .parse()
                .map_err(|_| HandshakeError::InvalidAddress {
                    network: "tcp",
                    addr: parts[3].to_string(),
                })?;
            ServerAddr::Tcp(addr)
        }
        "unix" => {
            if parts[3].is_empty() {
                return Err(HandshakeError::InvalidAddress {
                    network: "unix",
                    addr: String::new(),
                });
            }
            ServerAddr::Unix(parts[3].into())
        }
        other => return Err(HandshakeError::UnsupportedTransport(other.to_string())),
    };

    let server_cert = match parts.get(5) {
        Some(cert) if cert.len() > LEGACY_CERT_FIELD_LEN => {
            let der = BASE64_STANDARD
                .decode(cert)
                .or_else(|_| BASE64_STANDARD_NO_PAD.decode(cert))
                .map_err(|error| HandshakeError::InvalidServerCert(error.to_string()))?;
            Some(CertificateDer::from(der))
        }
        _ => None,
    };

    Ok(ParsedHandshake {
        proto_version,
        addr,
        server_cert,
    })
}
