//! Root certificate authority lifecycle.
//!
//! [`RootCertificateGenerator`] synthesizes (and optionally persists) a
//! self-signed CA. [`RootCertificateAuthority`] loads the root once from any
//! [`CertificateSource`] and prepares the signer used for leaf minting.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Utc};
use once_cell::sync::OnceCell;
use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyUsagePurpose, PublicKeyData};
use rustls::pki_types::CertificateDer;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::key::{DigestAlgorithm, KeyGenerator, RsaKeyGenerator, signature_algorithm, signing_key};
use crate::keystore::{KeyStore, KeyStoreFormat};
use crate::source::{CertificateSource, PemFileCertificateSource};
use crate::types::{CertificateAndKey, CertificateInfo};

/// Common name of the default generated root.
pub const DEFAULT_ROOT_COMMON_NAME: &str = "interpose Root CA";

/// Organization of the default generated root.
pub const DEFAULT_ROOT_ORGANIZATION: &str = "interpose";

/// Default root validity in days.
pub const DEFAULT_ROOT_VALIDITY_DAYS: u32 = 3650;

fn ca_params(info: &CertificateInfo) -> Result<CertificateParams> {
    let mut params = info.to_params()?;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    Ok(params)
}

/// Where a generated root is persisted as PEM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistPaths {
    /// Certificate PEM file.
    pub certificate_file: PathBuf,
    /// Unencrypted private key PEM file.
    pub private_key_file: PathBuf,
}

/// Generates a self-signed root CA on first load and returns it from then on.
pub struct RootCertificateGenerator {
    info: CertificateInfo,
    key_generator: Arc<dyn KeyGenerator>,
    digest: DigestAlgorithm,
    persist: Option<PersistPaths>,
    generated: OnceCell<CertificateAndKey>,
}

impl RootCertificateGenerator {
    /// Creates a generator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] for invalid `info`, or
    /// [`Error::UnsupportedAlgorithm`] if keys from `key_generator` cannot sign
    /// with `digest`.
    pub fn new(
        info: CertificateInfo,
        key_generator: Arc<dyn KeyGenerator>,
        digest: DigestAlgorithm,
    ) -> Result<Self> {
        info.validate()?;
        signature_algorithm(key_generator.algorithm(), digest)?;
        Ok(Self {
            info,
            key_generator,
            digest,
            persist: None,
            generated: OnceCell::new(),
        })
    }

    /// Creates a generator for an RSA-2048, SHA-256 root named `common_name`.
    pub fn with_common_name(common_name: &str) -> Result<Self> {
        let not_before = Utc::now() - Duration::days(1);
        let info = CertificateInfo::builder(common_name)
            .organization(DEFAULT_ROOT_ORGANIZATION)
            .not_before(not_before)
            .validity_days(DEFAULT_ROOT_VALIDITY_DAYS)
            .build()?;
        Self::new(info, Arc::new(RsaKeyGenerator::default()), DigestAlgorithm::Sha256)
    }

    /// Persists the root to PEM files.
    ///
    /// When both files exist the root is read from them, when neither exists
    /// it is generated and written, and a lone file is a configuration error.
    #[must_use]
    pub fn persist_to(
        mut self,
        certificate_file: impl Into<PathBuf>,
        private_key_file: impl Into<PathBuf>,
    ) -> Self {
        self.persist = Some(PersistPaths {
            certificate_file: certificate_file.into(),
            private_key_file: private_key_file.into(),
        });
        self
    }

    /// Returns the identity the root is generated with.
    #[must_use]
    pub const fn info(&self) -> &CertificateInfo {
        &self.info
    }

    /// Returns the key generator for the root key.
    #[must_use]
    pub fn key_generator(&self) -> &dyn KeyGenerator {
        self.key_generator.as_ref()
    }

    /// Returns the digest the root self-signature uses.
    #[must_use]
    pub const fn digest(&self) -> DigestAlgorithm {
        self.digest
    }

    /// Returns the persistence paths, if configured.
    #[must_use]
    pub const fn persist_paths(&self) -> Option<&PersistPaths> {
        self.persist.as_ref()
    }

    /// Returns the root, generating (or restoring) it on the first call.
    ///
    /// Every later call returns an identical value: same serial, same key.
    pub fn load(&self) -> Result<CertificateAndKey> {
        self.generated
            .get_or_try_init(|| self.restore_or_generate())
            .cloned()
    }

    /// Writes the root into a new key store file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Export`] if the store cannot be encoded or written.
    pub fn export_to_keystore(
        &self,
        format: KeyStoreFormat,
        destination: &Path,
        alias: &str,
        password: &str,
    ) -> Result<()> {
        export_to_keystore(&self.load()?, format, destination, alias, password)
    }

    /// Returns `(certificate PEM, private key PEM)`, encrypting the key when
    /// `password` is given.
    pub fn export_as_pem(&self, password: Option<&str>) -> Result<(String, String)> {
        export_as_pem(&self.load()?, password)
    }

    /// Writes the root certificate as PEM.
    pub fn save_certificate_pem_file(&self, path: &Path) -> Result<()> {
        let root = self.load()?;
        write_file(path, root.certificate().pem().as_bytes(), false)
    }

    /// Writes the root private key as PEM, encrypted when `password` is given.
    pub fn save_private_key_pem_file(&self, path: &Path, password: Option<&str>) -> Result<()> {
        let root = self.load()?;
        let pem = crate::pem::encode_private_key(root.private_key(), password)?;
        write_file(path, pem.as_bytes(), true)
    }

    fn restore_or_generate(&self) -> Result<CertificateAndKey> {
        let Some(paths) = &self.persist else {
            return self.generate();
        };

        match (paths.certificate_file.exists(), paths.private_key_file.exists()) {
            (true, true) => {
                info!(
                    "Loading persisted root CA from {}",
                    paths.certificate_file.display()
                );
                PemFileCertificateSource::new(
                    &paths.certificate_file,
                    &paths.private_key_file,
                    None,
                )?
                .load()
            }
            (false, false) => {
                let root = self.generate()?;
                write_file(&paths.certificate_file, root.certificate().pem().as_bytes(), false)?;
                write_file(&paths.private_key_file, root.private_key().pem().as_bytes(), true)?;
                info!(
                    "Persisted root CA to {} and {}",
                    paths.certificate_file.display(),
                    paths.private_key_file.display()
                );
                Ok(root)
            }
            _ => Err(Error::InvalidConfiguration(format!(
                "root CA files {} and {} must both exist or both be absent",
                paths.certificate_file.display(),
                paths.private_key_file.display()
            ))),
        }
    }

    fn generate(&self) -> Result<CertificateAndKey> {
        info!(
            "Generating root CA '{}' with {} key",
            self.info.common_name,
            self.key_generator.algorithm()
        );

        let key_pair = self.key_generator.generate()?;
        let signer = signing_key(key_pair.private_key(), self.digest)?;
        let cert = ca_params(&self.info)?
            .self_signed(&signer)
            .map_err(|e| {
                Error::InvalidConfiguration(format!("failed to generate root certificate: {e}"))
            })?;

        let root = CertificateAndKey::from_der_chain([cert.der()], key_pair.into_private_key())?;
        debug!(
            "Root CA created with serial {}",
            root.certificate().serial_hex()
        );
        Ok(root)
    }
}

impl fmt::Debug for RootCertificateGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootCertificateGenerator")
            .field("common_name", &self.info.common_name)
            .field("key_generator", &self.key_generator)
            .field("digest", &self.digest)
            .field("persist", &self.persist)
            .field("generated", &self.generated.get().is_some())
            .finish()
    }
}

/// Signs leaf certificates on behalf of a loaded root.
pub(crate) struct RootSigner {
    issuer: rcgen::Certificate,
    key: rcgen::KeyPair,
}

impl RootSigner {
    fn new(root: &CertificateAndKey, digest: DigestAlgorithm) -> Result<Self> {
        let key = signing_key(root.private_key(), digest)?;
        let der = CertificateDer::from(root.certificate().der().to_vec());
        let issuer = CertificateParams::from_ca_cert_der(&der)
            .and_then(|params| params.self_signed(&key))
            .map_err(|e| {
                Error::Import(format!(
                    "root certificate {} cannot be used as an issuer: {e}",
                    root.certificate().subject()
                ))
            })?;
        Ok(Self { issuer, key })
    }

    /// Signs `params` for the holder of `public_key`.
    pub(crate) fn sign(
        &self,
        params: CertificateParams,
        public_key: &impl PublicKeyData,
    ) -> std::result::Result<rcgen::Certificate, rcgen::Error> {
        params.signed_by(public_key, &self.issuer, &self.key)
    }
}

struct LoadedRoot {
    pair: Arc<CertificateAndKey>,
    signer: RootSigner,
}

/// Owns the root certificate and key, loaded once from a [`CertificateSource`].
///
/// The first successful [`load`](Self::load) wins; concurrent callers block
/// until it finishes and then observe the same instance. A failed load leaves
/// the authority unloaded so the next call retries.
pub struct RootCertificateAuthority {
    source: CertificateSource,
    digest: DigestAlgorithm,
    root: OnceCell<LoadedRoot>,
}

impl RootCertificateAuthority {
    /// Creates an unloaded authority that signs leaves with `digest`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedAlgorithm`] if a generated root's key
    /// algorithm cannot sign with `digest`.
    pub fn new(source: CertificateSource, digest: DigestAlgorithm) -> Result<Self> {
        if let Some(generator) = source.as_generator() {
            signature_algorithm(generator.key_generator().algorithm(), digest)?;
        }
        Ok(Self {
            source,
            digest,
            root: OnceCell::new(),
        })
    }

    /// Returns the root, loading it from the source on first use.
    pub fn load(&self) -> Result<Arc<CertificateAndKey>> {
        self.loaded().map(|root| Arc::clone(&root.pair))
    }

    /// Returns `true` once the root has been loaded.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.root.get().is_some()
    }

    /// Returns the digest leaves are signed with.
    #[must_use]
    pub const fn digest(&self) -> DigestAlgorithm {
        self.digest
    }

    /// Returns the configured source.
    #[must_use]
    pub const fn source(&self) -> &CertificateSource {
        &self.source
    }

    /// Writes the root into a new key store file.
    pub fn export_to_keystore(
        &self,
        format: KeyStoreFormat,
        destination: &Path,
        alias: &str,
        password: &str,
    ) -> Result<()> {
        let root = self.load()?;
        export_to_keystore(&root, format, destination, alias, password)
    }

    /// Returns `(certificate PEM, private key PEM)` for the root.
    pub fn export_as_pem(&self, password: Option<&str>) -> Result<(String, String)> {
        let root = self.load()?;
        export_as_pem(&root, password)
    }

    pub(crate) fn signer(&self) -> Result<(&Arc<CertificateAndKey>, &RootSigner)> {
        self.loaded().map(|root| (&root.pair, &root.signer))
    }

    fn loaded(&self) -> Result<&LoadedRoot> {
        self.root.get_or_try_init(|| {
            let pair = self.source.load().inspect_err(|e| {
                warn!("Loading root CA from {} source failed: {}", self.source.kind(), e);
            })?;
            if !pair.certificate().is_ca() {
                warn!(
                    "Root certificate {} is not marked as a CA; clients will reject minted leaves",
                    pair.certificate().subject()
                );
            }
            let signer = RootSigner::new(&pair, self.digest)?;
            info!(
                "Root CA loaded: {} (serial {}, {} key, {} source)",
                pair.certificate().subject(),
                pair.certificate().serial_hex(),
                pair.private_key().algorithm(),
                self.source.kind()
            );
            Ok(LoadedRoot {
                pair: Arc::new(pair),
                signer,
            })
        })
    }
}

impl fmt::Debug for RootCertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootCertificateAuthority")
            .field("source", &self.source)
            .field("digest", &self.digest)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

fn export_to_keystore(
    root: &CertificateAndKey,
    format: KeyStoreFormat,
    destination: &Path,
    alias: &str,
    password: &str,
) -> Result<()> {
    let mut store = KeyStore::new(format);
    store.set_private_key_entry(alias, root)?;
    ensure_parent_exists(destination)?;
    store.save_file(destination, password)
}

fn export_as_pem(root: &CertificateAndKey, password: Option<&str>) -> Result<(String, String)> {
    let key_pem = crate::pem::encode_private_key(root.private_key(), password)?;
    info!(
        "Exported root CA {} as PEM (key {})",
        root.certificate().subject(),
        if password.is_some() { "encrypted" } else { "unencrypted" }
    );
    Ok((root.certificate().pem(), key_pem))
}

fn ensure_parent_exists(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Export(format!("cannot create directory {}: {e}", parent.display()))
            })?;
        }
    }
    Ok(())
}

fn write_file(path: &Path, contents: &[u8], private: bool) -> Result<()> {
    ensure_parent_exists(path)?;

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    if private {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    #[cfg(not(unix))]
    let _ = private;

    options
        .open(path)
        .and_then(|mut file| file.write_all(contents))
        .map_err(|e| Error::Export(format!("cannot write {}: {e}", path.display())))
}
