//! The engine provisioner: one root authority, one leaf cache, two call sites.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use http::Request;
use rustls::crypto::CryptoProvider;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, ServerConfig};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::{
    ClientEngine, DEFAULT_ALPN_PROTOCOLS, ServerConfigCache, ServerEngine, TlsSession,
    UpstreamTrust, client_config, crypto_provider, resolver_server_config, upstream_target,
};
use crate::error::{Error, Result};
use crate::key::{DigestAlgorithm, KeyGenerator};
use crate::keystore::KeyStoreFormat;
use crate::leaf::{
    CertificateInfoGenerator, HostnameCertificateInfoGenerator, LeafCacheStats, LeafCachePolicy,
    LeafCertificateCache, normalize_hostname,
};
use crate::root::RootCertificateAuthority;
use crate::source::CertificateSource;
use crate::types::CertificateAndKey;

/// Lifecycle of a provisioner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionerState {
    /// The root has not been loaded yet.
    Uninitialized,
    /// The root is loaded; no engine has been handed out.
    RootLoaded,
    /// At least one engine has been handed out.
    Serving,
}

/// Point-in-time provisioner counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionerMetrics {
    /// Leaf cache counters.
    pub leaf_cache: LeafCacheStats,
    /// Server engines handed out.
    pub server_engines: u64,
    /// Client engines handed out.
    pub client_engines: u64,
    /// Whether the root has been loaded.
    pub root_loaded: bool,
}

struct Inner {
    authority: RootCertificateAuthority,
    cache: LeafCertificateCache,
    leaf_key_generator: Arc<dyn KeyGenerator>,
    info_generator: Arc<dyn CertificateInfoGenerator>,
    provider: Arc<CryptoProvider>,
    client_config: Arc<ClientConfig>,
    server_configs: ServerConfigCache,
    alpn_protocols: Vec<String>,
    serving: AtomicBool,
    server_engines: AtomicU64,
    client_engines: AtomicU64,
}

impl Inner {
    fn leaf_for(&self, hostname: &str) -> Result<Arc<CertificateAndKey>> {
        self.cache.get_or_create(
            hostname,
            &self.authority,
            self.leaf_key_generator.as_ref(),
            self.info_generator.as_ref(),
        )
    }
}

/// Resolves the served certificate from the client's SNI during the handshake.
struct SniCertResolver {
    inner: Arc<Inner>,
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(server_name) = client_hello.server_name() else {
            warn!("Client hello carries no SNI; no certificate to present");
            return None;
        };

        match self
            .inner
            .leaf_for(server_name)
            .and_then(|leaf| leaf.certified_key())
        {
            Ok(certified) => {
                self.inner.serving.store(true, Ordering::Relaxed);
                Some(certified)
            }
            Err(e) => {
                warn!("No certificate for SNI {}: {}", server_name, e);
                None
            }
        }
    }
}

impl fmt::Debug for SniCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniCertResolver").finish_non_exhaustive()
    }
}

/// Hands out TLS engines for intercepted connections.
///
/// Cloning is cheap; clones share the root, the leaf cache and the counters.
///
/// # Example
///
/// ```no_run
/// use interpose_pki::{
///     EcKeyGenerator, RootCertificateGenerator, TlsEngineProvisioner, TlsSession,
/// };
///
/// let provisioner = TlsEngineProvisioner::builder()
///     .root_source(RootCertificateGenerator::with_common_name("interpose Root CA").unwrap())
///     .leaf_key_generator(EcKeyGenerator::default())
///     .digest("SHA256")
///     .build()
///     .unwrap();
///
/// let server = provisioner.server_engine("example.com", 443).unwrap();
/// assert_eq!(server.certificate().certificate().common_name(), Some("example.com"));
///
/// let request = http::Request::get("https://example.com/").body(()).unwrap();
/// let client = provisioner.client_engine(&request, &TlsSession::unknown()).unwrap();
/// assert_eq!(client.host(), "example.com");
/// ```
#[derive(Clone)]
pub struct TlsEngineProvisioner {
    inner: Arc<Inner>,
}

impl TlsEngineProvisioner {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> TlsEngineProvisionerBuilder {
        TlsEngineProvisionerBuilder::default()
    }

    /// Returns an engine presenting the leaf for `hostname`, loading the root
    /// and minting the leaf if needed. The port does not affect the leaf.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidHostname`], root loading errors, or
    /// [`Error::CertificateMinting`] for this hostname.
    pub fn server_engine(&self, hostname: &str, port: u16) -> Result<ServerEngine> {
        let host = normalize_hostname(hostname)?;
        let leaf = self.inner.leaf_for(&host)?;
        let config = self.inner.server_configs.get_or_build(
            &host,
            &leaf,
            &self.inner.provider,
            &self.inner.alpn_protocols,
        )?;
        let engine = ServerEngine::new(config, leaf, host, port);

        self.inner.serving.store(true, Ordering::Relaxed);
        self.inner.server_engines.fetch_add(1, Ordering::Relaxed);
        debug!("Server engine issued for {}:{}", engine.hostname(), port);
        Ok(engine)
    }

    /// Returns an engine for the origin named by `request`, or by the peer
    /// recorded on `session` when the request names no host.
    ///
    /// # Errors
    ///
    /// [`Error::UnresolvedTarget`] when neither identifies a host.
    pub fn client_engine<B>(&self, request: &Request<B>, session: &TlsSession) -> Result<ClientEngine> {
        let (host, port) = upstream_target(request, session)?;
        let engine = ClientEngine::new(Arc::clone(&self.inner.client_config), host, port)?;

        self.inner.serving.store(true, Ordering::Relaxed);
        self.inner.client_engines.fetch_add(1, Ordering::Relaxed);
        debug!("Client engine issued for {}:{}", engine.host(), port);
        Ok(engine)
    }

    /// Returns a server configuration that mints the leaf for the client's
    /// SNI during each handshake.
    pub fn sni_server_config(&self) -> Result<Arc<ServerConfig>> {
        let resolver = Arc::new(SniCertResolver {
            inner: Arc::clone(&self.inner),
        });
        resolver_server_config(
            Arc::clone(&self.inner.provider),
            resolver,
            &self.inner.alpn_protocols,
        )
        .map(Arc::new)
    }

    /// Loads the root now instead of on the first server engine request.
    pub fn warm_up(&self) -> Result<()> {
        self.inner.authority.load().map(|_| ())
    }

    /// Returns the lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProvisionerState {
        if !self.inner.authority.is_loaded() {
            ProvisionerState::Uninitialized
        } else if self.inner.serving.load(Ordering::Relaxed) {
            ProvisionerState::Serving
        } else {
            ProvisionerState::RootLoaded
        }
    }

    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn metrics(&self) -> ProvisionerMetrics {
        ProvisionerMetrics {
            leaf_cache: self.inner.cache.stats(),
            server_engines: self.inner.server_engines.load(Ordering::Relaxed),
            client_engines: self.inner.client_engines.load(Ordering::Relaxed),
            root_loaded: self.inner.authority.is_loaded(),
        }
    }

    /// Returns the root authority.
    #[must_use]
    pub fn root_authority(&self) -> &RootCertificateAuthority {
        &self.inner.authority
    }

    /// Returns the leaf cache.
    #[must_use]
    pub fn leaf_cache(&self) -> &LeafCertificateCache {
        &self.inner.cache
    }

    /// Returns the root certificate as PEM, for installing into client trust stores.
    pub fn root_certificate_pem(&self) -> Result<String> {
        Ok(self.inner.authority.load()?.certificate().pem())
    }

    /// Writes the root into a new key store file.
    pub fn export_root_to_keystore(
        &self,
        format: KeyStoreFormat,
        destination: &Path,
        alias: &str,
        password: &str,
    ) -> Result<()> {
        self.inner
            .authority
            .export_to_keystore(format, destination, alias, password)
    }

    /// Returns `(certificate PEM, private key PEM)` for the root.
    pub fn export_root_as_pem(&self, password: Option<&str>) -> Result<(String, String)> {
        self.inner.authority.export_as_pem(password)
    }
}

impl fmt::Debug for TlsEngineProvisioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsEngineProvisioner")
            .field("authority", &self.inner.authority)
            .field("leaf_key_generator", &self.inner.leaf_key_generator)
            .field("cache", &self.inner.cache)
            .field("alpn_protocols", &self.inner.alpn_protocols)
            .field("state", &self.state())
            .finish()
    }
}

/// Builder for [`TlsEngineProvisioner`]. Everything is validated by [`build`](Self::build).
pub struct TlsEngineProvisionerBuilder {
    source: Option<CertificateSource>,
    leaf_key_generator: Option<Arc<dyn KeyGenerator>>,
    digest: Option<String>,
    info_generator: Arc<dyn CertificateInfoGenerator>,
    cache_policy: LeafCachePolicy,
    upstream_trust: UpstreamTrust,
    alpn_protocols: Vec<String>,
    eager_root_load: bool,
}

impl Default for TlsEngineProvisionerBuilder {
    fn default() -> Self {
        Self {
            source: None,
            leaf_key_generator: None,
            digest: None,
            info_generator: Arc::new(HostnameCertificateInfoGenerator::default()),
            cache_policy: LeafCachePolicy::default(),
            upstream_trust: UpstreamTrust::default(),
            alpn_protocols: DEFAULT_ALPN_PROTOCOLS.iter().map(ToString::to_string).collect(),
            eager_root_load: false,
        }
    }
}

impl TlsEngineProvisionerBuilder {
    /// Sets where the root certificate and key come from. Required.
    #[must_use]
    pub fn root_source(mut self, source: impl Into<CertificateSource>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Sets the generator for leaf keys. Required.
    #[must_use]
    pub fn leaf_key_generator(mut self, generator: impl KeyGenerator + 'static) -> Self {
        self.leaf_key_generator = Some(Arc::new(generator));
        self
    }

    /// Sets a shared generator for leaf keys.
    #[must_use]
    pub fn shared_leaf_key_generator(mut self, generator: Arc<dyn KeyGenerator>) -> Self {
        self.leaf_key_generator = Some(generator);
        self
    }

    /// Sets the leaf signature digest by name, e.g. `SHA256`. Required.
    #[must_use]
    pub fn digest(mut self, name: impl Into<String>) -> Self {
        self.digest = Some(name.into());
        self
    }

    /// Sets the leaf signature digest.
    #[must_use]
    pub fn digest_algorithm(mut self, digest: DigestAlgorithm) -> Self {
        self.digest = Some(digest.to_string());
        self
    }

    /// Replaces the leaf naming strategy.
    #[must_use]
    pub fn info_generator(mut self, generator: impl CertificateInfoGenerator + 'static) -> Self {
        self.info_generator = Arc::new(generator);
        self
    }

    /// Bounds the leaf cache.
    #[must_use]
    pub const fn leaf_cache_policy(mut self, policy: LeafCachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    /// Sets how client engines authenticate origins.
    #[must_use]
    pub fn upstream_trust(mut self, trust: UpstreamTrust) -> Self {
        self.upstream_trust = trust;
        self
    }

    /// Sets the ALPN protocols of both engine kinds.
    #[must_use]
    pub fn alpn_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alpn_protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// Loads the root during [`build`](Self::build) so import errors abort construction.
    #[must_use]
    pub const fn eager_root_load(mut self, eager: bool) -> Self {
        self.eager_root_load = eager;
        self
    }

    /// Validates the configuration and creates the provisioner.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidConfiguration`] for a missing or empty input,
    /// [`Error::UnsupportedAlgorithm`] for an unknown digest or one the
    /// generated root key cannot sign with, and, with eager loading, any
    /// root loading error.
    pub fn build(self) -> Result<TlsEngineProvisioner> {
        let source = self.source.ok_or_else(|| {
            Error::InvalidConfiguration("root certificate source must not be missing".into())
        })?;
        let leaf_key_generator = self.leaf_key_generator.ok_or_else(|| {
            Error::InvalidConfiguration("leaf key generator must not be missing".into())
        })?;
        let digest = match self.digest.as_deref().map(str::trim) {
            None | Some("") => {
                return Err(Error::InvalidConfiguration(
                    "digest algorithm must not be missing".into(),
                ));
            }
            Some(name) => name.parse::<DigestAlgorithm>()?,
        };
        if self.alpn_protocols.iter().any(String::is_empty) {
            return Err(Error::InvalidConfiguration(
                "ALPN protocol names must not be empty".into(),
            ));
        }

        let cache = LeafCertificateCache::with_policy(self.cache_policy)?;
        let authority = RootCertificateAuthority::new(source, digest)?;
        let provider = crypto_provider();
        let client_config =
            client_config(Arc::clone(&provider), &self.upstream_trust, &self.alpn_protocols)?;

        let provisioner = TlsEngineProvisioner {
            inner: Arc::new(Inner {
                authority,
                cache,
                leaf_key_generator,
                info_generator: self.info_generator,
                provider,
                client_config: Arc::new(client_config),
                server_configs: ServerConfigCache::default(),
                alpn_protocols: self.alpn_protocols,
                serving: AtomicBool::new(false),
                server_engines: AtomicU64::new(0),
                client_engines: AtomicU64::new(0),
            }),
        };

        if self.eager_root_load {
            provisioner.warm_up()?;
        }

        info!(
            "TLS engine provisioner ready: {} root, {} leaf keys, {} signatures",
            provisioner.inner.authority.source().kind(),
            provisioner.inner.leaf_key_generator.algorithm(),
            digest
        );
        Ok(provisioner)
    }
}

impl fmt::Debug for TlsEngineProvisionerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsEngineProvisionerBuilder")
            .field("source", &self.source)
            .field("leaf_key_generator", &self.leaf_key_generator)
            .field("digest", &self.digest)
            .field("cache_policy", &self.cache_policy)
            .field("upstream_trust", &self.upstream_trust)
            .field("alpn_protocols", &self.alpn_protocols)
            .field("eager_root_load", &self.eager_root_load)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{EcKeyGenerator, NamedCurve, RsaKeyGenerator};
    use crate::root::RootCertificateGenerator;
    use crate::source::PemFileCertificateSource;
    use crate::types::CertificateInfo;
    use test_case::test_case;

    fn generated_root(cn: &str) -> RootCertificateGenerator {
        let info = CertificateInfo::builder(cn).validity_days(30).build().unwrap();
        RootCertificateGenerator::new(info, Arc::new(EcKeyGenerator::default()), DigestAlgorithm::Sha256)
            .unwrap()
    }

    fn provisioner() -> TlsEngineProvisioner {
        TlsEngineProvisioner::builder()
            .root_source(generated_root("test-ca"))
            .leaf_key_generator(EcKeyGenerator::default())
            .digest("SHA256")
            .build()
            .unwrap()
    }

    // ===================== construction =====================

    #[test]
    fn missing_source_is_rejected() {
        let err = TlsEngineProvisioner::builder()
            .leaf_key_generator(EcKeyGenerator::default())
            .digest("SHA256")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test]
    fn missing_leaf_key_generator_is_rejected() {
        let err = TlsEngineProvisioner::builder()
            .root_source(generated_root("ca"))
            .digest("SHA256")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test_case(None ; "missing")]
    #[test_case(Some("  ") ; "blank")]
    fn missing_digest_is_rejected(digest: Option<&str>) {
        let mut builder = TlsEngineProvisioner::builder()
            .root_source(generated_root("ca"))
            .leaf_key_generator(EcKeyGenerator::default());
        if let Some(digest) = digest {
            builder = builder.digest(digest);
        }
        assert!(matches!(builder.build(), Err(Error::InvalidConfiguration(_))));
    }

    #[test_case("WHIRLPOOL" ; "unknown")]
    #[test_case("SHA1" ; "too weak")]
    #[test_case("SHA384" ; "incompatible with p256 root")]
    fn unusable_digest_is_unsupported(digest: &str) {
        let err = TlsEngineProvisioner::builder()
            .root_source(generated_root("ca"))
            .leaf_key_generator(EcKeyGenerator::default())
            .digest(digest)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedAlgorithm(_)));
        assert!(err.is_configuration_error());
    }

    #[test]
    fn empty_alpn_name_is_rejected() {
        let err = TlsEngineProvisioner::builder()
            .root_source(generated_root("ca"))
            .leaf_key_generator(EcKeyGenerator::default())
            .digest("SHA256")
            .alpn_protocols(["h2", ""])
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test]
    fn eager_load_surfaces_import_errors() {
        let source =
            PemFileCertificateSource::new("/nonexistent/ca.pem", "/nonexistent/ca.key", None).unwrap();
        let builder = || {
            TlsEngineProvisioner::builder()
                .root_source(
                    PemFileCertificateSource::new("/nonexistent/ca.pem", "/nonexistent/ca.key", None)
                        .unwrap(),
                )
                .leaf_key_generator(EcKeyGenerator::default())
                .digest("SHA256")
        };

        assert!(matches!(
            builder().eager_root_load(true).build(),
            Err(Error::Import(_))
        ));

        let lazy = TlsEngineProvisioner::builder()
            .root_source(source)
            .leaf_key_generator(EcKeyGenerator::default())
            .digest("SHA256")
            .build()
            .unwrap();
        assert!(matches!(lazy.server_engine("a.test", 443), Err(Error::Import(_))));
    }

    // ===================== state =====================

    #[test]
    fn state_progresses() {
        let provisioner = provisioner();
        assert_eq!(provisioner.state(), ProvisionerState::Uninitialized);

        provisioner.warm_up().unwrap();
        assert_eq!(provisioner.state(), ProvisionerState::RootLoaded);

        provisioner.server_engine("state.test", 443).unwrap();
        assert_eq!(provisioner.state(), ProvisionerState::Serving);
    }

    #[test]
    fn server_engine_loads_root_on_demand() {
        let provisioner = provisioner();
        provisioner.server_engine("lazy.test", 443).unwrap();
        assert!(provisioner.metrics().root_loaded);
    }

    // ===================== server engines =====================

    #[test]
    fn same_host_reuses_leaf() {
        let provisioner = provisioner();
        let first = provisioner.server_engine("example.com", 443).unwrap();
        let second = provisioner.server_engine("EXAMPLE.com", 8443).unwrap();

        assert_eq!(
            first.certificate().certificate().serial_number(),
            second.certificate().certificate().serial_number()
        );
        assert_eq!(second.port(), 8443);
        assert_eq!(second.hostname(), "example.com");
    }

    #[test]
    fn same_leaf_shares_server_config() {
        let provisioner = provisioner();
        let first = provisioner.server_engine("example.com", 443).unwrap();
        let second = provisioner.server_engine("example.com", 8443).unwrap();
        let other = provisioner.server_engine("other.com", 443).unwrap();

        assert!(Arc::ptr_eq(&first.config(), &second.config()));
        assert!(!Arc::ptr_eq(&first.config(), &other.config()));
        assert_eq!(provisioner.inner.server_configs.len(), 2);
    }

    #[test]
    fn reminted_leaf_gets_fresh_server_config() {
        let provisioner = provisioner();
        let before = provisioner.server_engine("example.com", 443).unwrap();
        let stale = before.config();
        drop(before);
        drop(provisioner.server_engine("gone.com", 443).unwrap());

        provisioner.leaf_cache().clear();
        let after = provisioner.server_engine("example.com", 443).unwrap();

        assert!(!Arc::ptr_eq(&stale, &after.config()));
        assert_eq!(provisioner.inner.server_configs.len(), 1);
    }

    #[test]
    fn different_hosts_get_distinct_leaves() {
        let provisioner = provisioner();
        let a = provisioner.server_engine("example.com", 443).unwrap();
        let b = provisioner.server_engine("other.com", 443).unwrap();

        assert_ne!(
            a.certificate().certificate().serial_number(),
            b.certificate().certificate().serial_number()
        );
        assert_eq!(a.certificate().certificate().common_name(), Some("example.com"));
        assert_eq!(b.certificate().certificate().common_name(), Some("other.com"));
    }

    #[test]
    fn server_engine_presents_leaf_and_root() {
        let provisioner = provisioner();
        let engine = provisioner.server_engine("chain.test", 443).unwrap();
        let root = provisioner.root_authority().load().unwrap();

        let chain = engine.certificate().chain();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1], *root.certificate());
        assert_eq!(engine.config().alpn_protocols, vec![b"http/1.1".to_vec()]);
        engine.connection().unwrap();
    }

    #[test]
    fn rsa_root_with_ec_leaves() {
        let info = CertificateInfo::builder("rsa-root").build().unwrap();
        let root = RootCertificateGenerator::new(
            info,
            Arc::new(RsaKeyGenerator::default()),
            DigestAlgorithm::Sha256,
        )
        .unwrap();
        let provisioner = TlsEngineProvisioner::builder()
            .root_source(root)
            .leaf_key_generator(EcKeyGenerator::with_curve(NamedCurve::P384))
            .digest_algorithm(DigestAlgorithm::Sha384)
            .build()
            .unwrap();

        let engine = provisioner.server_engine("mixed.test", 443).unwrap();
        assert_eq!(
            engine.certificate().certificate().issuer_common_name(),
            Some("rsa-root")
        );
    }

    #[test]
    fn invalid_hostname_is_rejected() {
        let err = provisioner().server_engine("not a host", 443).unwrap_err();
        assert!(matches!(err, Error::InvalidHostname(_)));
    }

    // ===================== client engines =====================

    #[test]
    fn client_engine_targets_request_uri() {
        let provisioner = provisioner();
        let request = Request::get("https://origin.example/path").body(()).unwrap();
        let engine = provisioner
            .client_engine(&request, &TlsSession::new("session.example", 443))
            .unwrap();
        assert_eq!(engine.host(), "origin.example");
        assert_eq!(engine.port(), 443);
    }

    #[test]
    fn client_engine_falls_back_to_session() {
        let provisioner = provisioner();
        let request = Request::get("/path").body(()).unwrap();
        let engine = provisioner
            .client_engine(&request, &TlsSession::new("session.example", 8443))
            .unwrap();
        assert_eq!(engine.host(), "session.example");
        assert_eq!(engine.port(), 8443);
        engine.connection().unwrap();
    }

    #[test]
    fn client_engine_without_target_fails() {
        let request = Request::get("/").body(()).unwrap();
        let err = provisioner()
            .client_engine(&request, &TlsSession::unknown())
            .unwrap_err();
        assert!(matches!(err, Error::UnresolvedTarget(_)));
    }

    // ===================== metrics and exports =====================

    #[test]
    fn metrics_count_engines_and_cache() {
        let provisioner = provisioner();
        provisioner.server_engine("m.test", 443).unwrap();
        provisioner.server_engine("m.test", 443).unwrap();
        let request = Request::get("https://m.test/").body(()).unwrap();
        provisioner
            .client_engine(&request, &TlsSession::unknown())
            .unwrap();

        let metrics = provisioner.metrics();
        assert_eq!(metrics.server_engines, 2);
        assert_eq!(metrics.client_engines, 1);
        assert_eq!(metrics.leaf_cache.minted, 1);
        assert_eq!(metrics.leaf_cache.hits, 1);
        assert!(metrics.root_loaded);
    }

    #[test]
    fn root_pem_is_available() {
        let provisioner = provisioner();
        let pem = provisioner.root_certificate_pem().unwrap();
        let parsed = crate::pem::parse_certificates(&pem).unwrap();
        assert_eq!(parsed[0].common_name(), Some("test-ca"));

        let (cert_pem, _) = provisioner.export_root_as_pem(None).unwrap();
        assert_eq!(cert_pem, pem);
    }

    #[test]
    fn clones_share_state() {
        let provisioner = provisioner();
        let clone = provisioner.clone();
        let a = provisioner.server_engine("shared.test", 443).unwrap();
        let b = clone.server_engine("shared.test", 443).unwrap();
        assert!(Arc::ptr_eq(a.certificate(), b.certificate()));
    }

    #[test]
    fn sni_config_uses_alpn() {
        let provisioner = TlsEngineProvisioner::builder()
            .root_source(generated_root("ca"))
            .leaf_key_generator(EcKeyGenerator::default())
            .digest("SHA256")
            .alpn_protocols(["h2", "http/1.1"])
            .build()
            .unwrap();
        let config = provisioner.sni_server_config().unwrap();
        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }
}
