//! Serializable provisioner configuration.
//!
//! ```json
//! {
//!   "root": { "type": "generated", "common_name": "interpose Root CA" },
//!   "leaf_key": { "algorithm": "ec", "curve": "secp256r1" },
//!   "digest": "SHA256"
//! }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::engine::{DEFAULT_ALPN_PROTOCOLS, UpstreamTrust, UpstreamTrustMode};
use crate::error::{Error, Result};
use crate::key::{DEFAULT_RSA_KEY_SIZE, EcKeyGenerator, KeyGenerator, NamedCurve, RsaKeyGenerator};
use crate::keystore::KeyStoreFormat;
use crate::leaf::LeafCachePolicy;
use crate::provisioner::TlsEngineProvisioner;
use crate::root::{
    DEFAULT_ROOT_COMMON_NAME, DEFAULT_ROOT_ORGANIZATION, DEFAULT_ROOT_VALIDITY_DAYS,
    RootCertificateGenerator,
};
use crate::source::{
    CertificateSource, ExistingCertificateSource, KeyStoreFileCertificateSource,
    PemFileCertificateSource,
};
use crate::types::CertificateInfo;

/// A password read from configuration. Wiped on drop, redacted in `Debug`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wraps a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the secret value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

fn default_digest() -> String {
    "SHA256".to_string()
}

fn default_true() -> bool {
    true
}

fn default_root_common_name() -> String {
    DEFAULT_ROOT_COMMON_NAME.to_string()
}

fn default_root_organization() -> Option<String> {
    Some(DEFAULT_ROOT_ORGANIZATION.to_string())
}

fn default_root_validity_days() -> u32 {
    DEFAULT_ROOT_VALIDITY_DAYS
}

fn default_rsa_key_size() -> u32 {
    DEFAULT_RSA_KEY_SIZE
}

fn default_curve() -> String {
    NamedCurve::default().name().to_string()
}

fn default_root_key() -> KeyConfig {
    KeyConfig::Rsa {
        key_size: DEFAULT_RSA_KEY_SIZE,
    }
}

fn default_leaf_key() -> KeyConfig {
    KeyConfig::Ec {
        curve: default_curve(),
    }
}

fn default_alpn_protocols() -> Vec<String> {
    DEFAULT_ALPN_PROTOCOLS.iter().map(ToString::to_string).collect()
}

/// Key generation parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum KeyConfig {
    /// RSA keys.
    Rsa {
        /// Modulus size in bits.
        #[serde(default = "default_rsa_key_size")]
        key_size: u32,
    },
    /// EC keys on a named curve.
    Ec {
        /// Curve name, e.g. `secp256r1`.
        #[serde(default = "default_curve")]
        curve: String,
    },
}

impl KeyConfig {
    /// Creates the described generator.
    pub fn generator(&self) -> Result<Arc<dyn KeyGenerator>> {
        Ok(match self {
            Self::Rsa { key_size } => Arc::new(RsaKeyGenerator::new(*key_size)?),
            Self::Ec { curve } => Arc::new(EcKeyGenerator::with_curve_name(curve)?),
        })
    }
}

/// Where a generated root is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistConfig {
    /// Certificate PEM file.
    pub certificate_file: PathBuf,
    /// Private key PEM file.
    pub private_key_file: PathBuf,
}

/// Root certificate source selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RootConfig {
    /// A self-signed root generated on first use.
    Generated {
        /// Subject common name.
        #[serde(default = "default_root_common_name")]
        common_name: String,
        /// Subject organization.
        #[serde(default = "default_root_organization")]
        organization: Option<String>,
        /// Root key parameters.
        #[serde(default = "default_root_key")]
        key: KeyConfig,
        /// Self-signature digest.
        #[serde(default = "default_digest")]
        digest: String,
        /// Validity in days, starting a day ago.
        #[serde(default = "default_root_validity_days")]
        validity_days: u32,
        /// Keep the root across restarts.
        #[serde(default)]
        persist: Option<PersistConfig>,
    },
    /// A PEM certificate file and a PEM private key file.
    PemFiles {
        /// Certificate (chain) file.
        certificate_file: PathBuf,
        /// Private key file.
        private_key_file: PathBuf,
        /// Password of an encrypted private key.
        #[serde(default)]
        password: Option<Secret>,
    },
    /// An entry of a PKCS12 or JKS file.
    KeyStoreFile {
        /// Key store file.
        path: PathBuf,
        /// Container format.
        format: KeyStoreFormat,
        /// Private key entry alias.
        alias: String,
        /// Store and key password.
        password: Secret,
    },
    /// PEM text embedded in the configuration.
    ExistingPem {
        /// Certificate (chain) PEM.
        certificate_pem: String,
        /// Private key PEM.
        private_key_pem: String,
        /// Password of an encrypted private key.
        #[serde(default)]
        password: Option<Secret>,
    },
}

impl RootConfig {
    /// Creates the described source.
    pub fn source(&self) -> Result<CertificateSource> {
        Ok(match self {
            Self::Generated {
                common_name,
                organization,
                key,
                digest,
                validity_days,
                persist,
            } => {
                let mut info = CertificateInfo::builder(common_name.as_str())
                    .not_before(Utc::now() - chrono::Duration::days(1))
                    .validity_days(*validity_days);
                if let Some(organization) = organization {
                    info = info.organization(organization.as_str());
                }
                let mut generator =
                    RootCertificateGenerator::new(info.build()?, key.generator()?, digest.parse()?)?;
                if let Some(persist) = persist {
                    generator =
                        generator.persist_to(&persist.certificate_file, &persist.private_key_file);
                }
                generator.into()
            }
            Self::PemFiles {
                certificate_file,
                private_key_file,
                password,
            } => PemFileCertificateSource::new(
                certificate_file,
                private_key_file,
                password.as_ref().map(Secret::expose),
            )?
            .into(),
            Self::KeyStoreFile {
                path,
                format,
                alias,
                password,
            } => KeyStoreFileCertificateSource::from_file(path, *format, alias, password.expose())?
                .into(),
            Self::ExistingPem {
                certificate_pem,
                private_key_pem,
                password,
            } => ExistingCertificateSource::from_pem(
                certificate_pem,
                private_key_pem,
                password.as_ref().map(Secret::expose),
            )?
            .into(),
        })
    }

    fn resolve_paths(&mut self, base: &Path) {
        match self {
            Self::Generated {
                persist: Some(persist),
                ..
            } => {
                resolve(&mut persist.certificate_file, base);
                resolve(&mut persist.private_key_file, base);
            }
            Self::PemFiles {
                certificate_file,
                private_key_file,
                ..
            } => {
                resolve(certificate_file, base);
                resolve(private_key_file, base);
            }
            Self::KeyStoreFile { path, .. } => resolve(path, base),
            Self::Generated { persist: None, .. } | Self::ExistingPem { .. } => {}
        }
    }
}

/// Origin certificate verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamTrustConfig {
    /// Verify or accept everything.
    #[serde(default)]
    pub mode: UpstreamTrustMode,
    /// PEM files with additional trust anchors.
    #[serde(default)]
    pub extra_root_files: Vec<PathBuf>,
    /// Whether the bundled Mozilla roots are trusted.
    #[serde(default = "default_true")]
    pub include_default_roots: bool,
}

impl Default for UpstreamTrustConfig {
    fn default() -> Self {
        Self {
            mode: UpstreamTrustMode::Verify,
            extra_root_files: Vec::new(),
            include_default_roots: true,
        }
    }
}

impl UpstreamTrustConfig {
    /// Creates the described trust policy, reading extra root files.
    pub fn trust(&self) -> Result<UpstreamTrust> {
        match self.mode {
            UpstreamTrustMode::TrustAll => Ok(UpstreamTrust::TrustAll),
            UpstreamTrustMode::Verify
                if self.extra_root_files.is_empty() && self.include_default_roots =>
            {
                Ok(UpstreamTrust::DefaultRoots)
            }
            UpstreamTrustMode::Verify => UpstreamTrust::from_pem_files(
                self.extra_root_files.iter().cloned(),
                self.include_default_roots,
            ),
        }
    }
}

/// Leaf cache bounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafCacheConfig {
    /// Maximum cached hostnames.
    #[serde(default)]
    pub max_entries: Option<usize>,
    /// Maximum leaf age in seconds.
    #[serde(default)]
    pub time_to_live_secs: Option<u64>,
}

impl From<LeafCacheConfig> for LeafCachePolicy {
    fn from(config: LeafCacheConfig) -> Self {
        Self {
            max_entries: config.max_entries,
            time_to_live: config.time_to_live_secs.map(Duration::from_secs),
        }
    }
}

/// Everything needed to build a [`TlsEngineProvisioner`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    /// Root certificate source.
    pub root: RootConfig,
    /// Leaf key parameters.
    #[serde(default = "default_leaf_key")]
    pub leaf_key: KeyConfig,
    /// Leaf signature digest.
    #[serde(default = "default_digest")]
    pub digest: String,
    /// Origin certificate verification.
    #[serde(default)]
    pub upstream_trust: UpstreamTrustConfig,
    /// Leaf cache bounds.
    #[serde(default)]
    pub leaf_cache: LeafCacheConfig,
    /// ALPN protocols of both engine kinds.
    #[serde(default = "default_alpn_protocols")]
    pub alpn_protocols: Vec<String>,
    /// Load the root while building.
    #[serde(default)]
    pub eager_root_load: bool,
}

impl ProvisionerConfig {
    /// Parses a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfiguration(format!("malformed provisioner configuration: {e}")))
    }

    /// Reads a JSON configuration file. Relative paths inside it are resolved
    /// against the file's directory.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfiguration(format!(
                "cannot read provisioner configuration {}: {e}",
                path.display()
            ))
        })?;
        let mut config = Self::from_json_str(&text)?;

        if let Some(base) = path.parent() {
            config.root.resolve_paths(base);
            for file in &mut config.upstream_trust.extra_root_files {
                resolve(file, base);
            }
        }
        debug!("Loaded provisioner configuration from {}", path.display());
        Ok(config)
    }

    /// Serializes the configuration as pretty JSON.
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::InvalidConfiguration(format!("unserializable configuration: {e}")))
    }

    /// Builds the provisioner.
    pub fn build_provisioner(&self) -> Result<TlsEngineProvisioner> {
        TlsEngineProvisioner::builder()
            .root_source(self.root.source()?)
            .shared_leaf_key_generator(self.leaf_key.generator()?)
            .digest(self.digest.as_str())
            .upstream_trust(self.upstream_trust.trust()?)
            .leaf_cache_policy(self.leaf_cache.into())
            .alpn_protocols(self.alpn_protocols.iter().cloned())
            .eager_root_load(self.eager_root_load)
            .build()
    }
}

fn resolve(path: &mut PathBuf, base: &Path) {
    if path.is_relative() && !base.as_os_str().is_empty() {
        *path = base.join(&*path);
    }
}
