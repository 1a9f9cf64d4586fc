//! rustls engines handed to the connection layer.
//!
//! A [`ServerEngine`] terminates the client-facing handshake with a minted
//! leaf; a [`ClientEngine`] opens the origin-facing handshake.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use http::Request;
use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{
    ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, ServerConfig,
    ServerConnection, SignatureScheme,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::leaf::normalize_hostname;
use crate::types::{Certificate, CertificateAndKey};

/// ALPN protocols offered when none are configured.
pub const DEFAULT_ALPN_PROTOCOLS: &[&str] = &["http/1.1"];

const HTTPS_PORT: u16 = 443;
const HTTP_PORT: u16 = 80;

pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn engine_error(e: rustls::Error) -> Error {
    Error::Engine(e.to_string())
}

/// How the client engine authenticates origin servers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum UpstreamTrust {
    /// Verify against the bundled Mozilla roots.
    #[default]
    DefaultRoots,
    /// Verify against `roots`, optionally together with the bundled roots.
    Custom {
        /// Extra trust anchors.
        roots: Vec<Certificate>,
        /// Whether the bundled roots are trusted as well.
        include_default_roots: bool,
    },
    /// Accept any origin certificate.
    TrustAll,
}

impl UpstreamTrust {
    /// Trusts the certificates in the given PEM files.
    pub fn from_pem_files(
        files: impl IntoIterator<Item = PathBuf>,
        include_default_roots: bool,
    ) -> Result<Self> {
        let mut roots = Vec::new();
        for file in files {
            let text = crate::pem::read_file(&file, "trust anchor")?;
            roots.extend(crate::pem::parse_certificates(&text)?);
        }
        Ok(Self::Custom {
            roots,
            include_default_roots,
        })
    }

    /// Returns `true` for [`UpstreamTrust::TrustAll`].
    #[must_use]
    pub const fn is_trust_all(&self) -> bool {
        matches!(self, Self::TrustAll)
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let mut store = RootCertStore::empty();
        match self {
            Self::DefaultRoots => {
                store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }
            Self::Custom {
                roots,
                include_default_roots,
            } => {
                if *include_default_roots {
                    store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                }
                for root in roots {
                    store
                        .add(CertificateDer::from(root.der().to_vec()))
                        .map_err(|e| {
                            Error::InvalidConfiguration(format!(
                                "trust anchor {} rejected: {e}",
                                root.subject()
                            ))
                        })?;
                }
            }
            Self::TrustAll => {}
        }
        Ok(store)
    }
}

/// Serializable selector for [`UpstreamTrust`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamTrustMode {
    /// Verify origin certificates.
    #[default]
    Verify,
    /// Accept any origin certificate.
    TrustAll,
}

/// Accepts every server certificate but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Always presents one certificate, whatever the client asks for.
#[derive(Debug)]
struct FixedCertResolver(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

fn alpn(protocols: &[String]) -> Vec<Vec<u8>> {
    protocols.iter().map(|p| p.as_bytes().to_vec()).collect()
}

pub(crate) fn resolver_server_config(
    provider: Arc<CryptoProvider>,
    resolver: Arc<dyn ResolvesServerCert>,
    alpn_protocols: &[String],
) -> Result<ServerConfig> {
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(engine_error)?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = alpn(alpn_protocols);
    Ok(config)
}

pub(crate) fn client_config(
    provider: Arc<CryptoProvider>,
    trust: &UpstreamTrust,
    alpn_protocols: &[String],
) -> Result<ClientConfig> {
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(engine_error)?;

    let mut config = if trust.is_trust_all() {
        warn!("Upstream certificate verification is disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert {
                algorithms: provider.signature_verification_algorithms,
            }))
            .with_no_client_auth()
    } else {
        builder
            .with_root_certificates(trust.root_store()?)
            .with_no_client_auth()
    };
    config.alpn_protocols = alpn(alpn_protocols);
    Ok(config)
}

/// Server configurations keyed by hostname.
///
/// A host keeps one [`ServerConfig`] for as long as its leaf is unchanged, so
/// engines issued for it share the rustls session store and clients can
/// resume across connections.
#[derive(Default)]
pub(crate) struct ServerConfigCache {
    configs: Mutex<HashMap<String, (Arc<CertificateAndKey>, Arc<ServerConfig>)>>,
}

impl ServerConfigCache {
    /// Returns the configuration presenting `leaf` for `hostname`, building
    /// it when the host is new or its leaf was re-minted.
    pub(crate) fn get_or_build(
        &self,
        hostname: &str,
        leaf: &Arc<CertificateAndKey>,
        provider: &Arc<CryptoProvider>,
        alpn_protocols: &[String],
    ) -> Result<Arc<ServerConfig>> {
        let mut configs = self.configs.lock();
        if let Some((presented, config)) = configs.get(hostname) {
            if Arc::ptr_eq(presented, leaf) {
                return Ok(Arc::clone(config));
            }
        }

        let resolver = Arc::new(FixedCertResolver(leaf.certified_key()?));
        let config = Arc::new(resolver_server_config(
            Arc::clone(provider),
            resolver,
            alpn_protocols,
        )?);

        // Leaves held only here were evicted from the leaf cache and have no
        // live engine.
        configs.retain(|_, (presented, _)| Arc::strong_count(presented) > 1);
        configs.insert(hostname.to_string(), (Arc::clone(leaf), Arc::clone(&config)));
        debug!("Built server configuration for {}", hostname);
        Ok(config)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.configs.lock().len()
    }
}

/// A server-side engine presenting the leaf minted for one hostname.
#[derive(Clone)]
pub struct ServerEngine {
    config: Arc<ServerConfig>,
    leaf: Arc<CertificateAndKey>,
    hostname: String,
    port: u16,
}

impl ServerEngine {
    pub(crate) fn new(
        config: Arc<ServerConfig>,
        leaf: Arc<CertificateAndKey>,
        hostname: String,
        port: u16,
    ) -> Self {
        Self {
            config,
            leaf,
            hostname,
            port,
        }
    }

    /// Returns the rustls configuration.
    #[must_use]
    pub fn config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }

    /// Returns the presented leaf (chain `[leaf, root]`) and its key.
    #[must_use]
    pub fn certificate(&self) -> &Arc<CertificateAndKey> {
        &self.leaf
    }

    /// Returns the normalized hostname the engine was requested for.
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Returns the port the engine was requested for.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Starts a server-side TLS session.
    pub fn connection(&self) -> Result<ServerConnection> {
        ServerConnection::new(self.config()).map_err(engine_error)
    }
}

impl fmt::Debug for ServerEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerEngine")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("serial", &self.leaf.certificate().serial_hex())
            .field("alpn", &self.config.alpn_protocols.len())
            .finish()
    }
}

/// A client-side engine for the origin server of an intercepted connection.
#[derive(Clone)]
pub struct ClientEngine {
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
    host: String,
    port: u16,
}

impl ClientEngine {
    pub(crate) fn new(config: Arc<ClientConfig>, host: String, port: u16) -> Result<Self> {
        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| Error::InvalidHostname(host.clone()))?;
        Ok(Self {
            config,
            server_name,
            host,
            port,
        })
    }

    /// Returns the rustls configuration.
    #[must_use]
    pub fn config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }

    /// Returns the name sent as SNI and verified against the origin certificate.
    #[must_use]
    pub const fn server_name(&self) -> &ServerName<'static> {
        &self.server_name
    }

    /// Returns the origin host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the origin port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Starts a client-side TLS session towards the origin.
    pub fn connection(&self) -> Result<ClientConnection> {
        ClientConnection::new(self.config(), self.server_name.clone()).map_err(engine_error)
    }
}

impl fmt::Debug for ClientEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientEngine")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

/// What the connection layer knows about an accepted TLS session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSession {
    peer_host: Option<String>,
    peer_port: Option<u16>,
}

impl TlsSession {
    /// A session whose origin peer is `host:port`.
    pub fn new(peer_host: impl Into<String>, peer_port: u16) -> Self {
        Self {
            peer_host: Some(peer_host.into()),
            peer_port: Some(peer_port),
        }
    }

    /// A session with no recorded peer.
    #[must_use]
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Returns the recorded peer host.
    #[must_use]
    pub fn peer_host(&self) -> Option<&str> {
        self.peer_host.as_deref()
    }

    /// Returns the recorded peer port.
    #[must_use]
    pub const fn peer_port(&self) -> Option<u16> {
        self.peer_port
    }
}

/// Picks the origin `(host, port)` for a request.
///
/// Order: the request URI authority (absolute-form or CONNECT authority-form),
/// the `Host` header, then the session peer.
pub(crate) fn upstream_target<B>(
    request: &Request<B>,
    session: &TlsSession,
) -> Result<(String, u16)> {
    let default_port = match request.uri().scheme_str() {
        Some("http") => HTTP_PORT,
        _ => HTTPS_PORT,
    };

    if let Some(authority) = request.uri().authority() {
        let host = normalize_hostname(authority.host())?;
        let port = authority.port_u16().unwrap_or(default_port);
        debug!("Upstream target {}:{} from request URI", host, port);
        return Ok((host, port));
    }

    if let Some(value) = request.headers().get(http::header::HOST) {
        let authority = value
            .to_str()
            .ok()
            .and_then(|v| v.parse::<http::uri::Authority>().ok());
        if let Some(authority) = authority {
            let host = normalize_hostname(authority.host())?;
            let port = authority
                .port_u16()
                .or(session.peer_port)
                .unwrap_or(default_port);
            debug!("Upstream target {}:{} from Host header", host, port);
            return Ok((host, port));
        }
        debug!("Ignoring unparsable Host header {:?}", value);
    }

    if let Some(peer) = session.peer_host() {
        let host = normalize_hostname(peer)?;
        let port = session.peer_port.unwrap_or(default_port);
        debug!("Upstream target {}:{} from session peer", host, port);
        return Ok((host, port));
    }

    Err(Error::UnresolvedTarget(format!(
        "request '{} {}' names no host and the session has no peer",
        request.method(),
        request.uri()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn request(method: &str, uri: &str) -> Request<()> {
        Request::builder().method(method).uri(uri).body(()).unwrap()
    }

    // ===================== target resolution =====================

    #[test_case("GET", "https://api.example.com/v1", "api.example.com", 443 ; "absolute https")]
    #[test_case("GET", "http://plain.example/", "plain.example", 80 ; "absolute http")]
    #[test_case("GET", "https://API.Example.com:8443/x", "api.example.com", 8443 ; "explicit port")]
    #[test_case("CONNECT", "tunnel.example:443", "tunnel.example", 443 ; "connect authority")]
    #[test_case("CONNECT", "[::1]:9443", "::1", 9443 ; "connect ipv6")]
    fn target_from_uri(method: &str, uri: &str, host: &str, port: u16) {
        let session = TlsSession::new("session.example", 1443);
        let (h, p) = upstream_target(&request(method, uri), &session).unwrap();
        assert_eq!(h, host);
        assert_eq!(p, port);
    }

    #[test]
    fn target_from_host_header() {
        let req = Request::builder()
            .uri("/index.html")
            .header("host", "header.example:8080")
            .body(())
            .unwrap();
        let (host, port) = upstream_target(&req, &TlsSession::new("peer.example", 443)).unwrap();
        assert_eq!(host, "header.example");
        assert_eq!(port, 8080);
    }

    #[test]
    fn host_header_without_port_uses_session_port() {
        let req = Request::builder()
            .uri("/")
            .header("host", "header.example")
            .body(())
            .unwrap();
        let (_, port) = upstream_target(&req, &TlsSession::new("peer.example", 8443)).unwrap();
        assert_eq!(port, 8443);
    }

    #[test]
    fn target_from_session_peer() {
        let (host, port) =
            upstream_target(&request("GET", "/relative"), &TlsSession::new("Peer.Example", 4443))
                .unwrap();
        assert_eq!(host, "peer.example");
        assert_eq!(port, 4443);
    }

    #[test]
    fn no_target_is_unresolved() {
        let err = upstream_target(&request("GET", "/"), &TlsSession::unknown()).unwrap_err();
        assert!(matches!(err, Error::UnresolvedTarget(_)));
    }

    // ===================== configs =====================

    #[test]
    fn client_config_applies_alpn() {
        let protocols = vec!["h2".to_string(), "http/1.1".to_string()];
        let config = client_config(crypto_provider(), &UpstreamTrust::DefaultRoots, &protocols).unwrap();
        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn trust_all_builds() {
        let config = client_config(crypto_provider(), &UpstreamTrust::TrustAll, &[]).unwrap();
        assert!(config.alpn_protocols.is_empty());
    }

    #[test]
    fn custom_roots_are_added() {
        let pair = crate::keystore::tests::test_pair("anchor");
        let trust = UpstreamTrust::Custom {
            roots: vec![pair.certificate().clone()],
            include_default_roots: false,
        };
        assert_eq!(trust.root_store().unwrap().len(), 1);
    }

    #[test]
    fn missing_trust_file_is_import_error() {
        let err = UpstreamTrust::from_pem_files([PathBuf::from("/nonexistent/roots.pem")], true)
            .unwrap_err();
        assert!(matches!(err, Error::Import(_)));
    }

    #[test]
    fn client_engine_accepts_ip_targets() {
        let config = Arc::new(client_config(crypto_provider(), &UpstreamTrust::TrustAll, &[]).unwrap());
        let engine = ClientEngine::new(config, "10.1.2.3".into(), 443).unwrap();
        assert!(matches!(engine.server_name(), ServerName::IpAddress(_)));
        engine.connection().unwrap();
    }
}
