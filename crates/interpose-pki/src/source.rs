//! Certificate sources: where the root authority's certificate and key come from.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::keystore::{KeyStore, KeyStoreFormat};
use crate::root::RootCertificateGenerator;
use crate::types::{Certificate, CertificateAndKey, PrivateKey};

/// A producer of a [`CertificateAndKey`].
///
/// `load` may be called any number of times. Only the generated variant
/// memoizes on its own; the root authority memoizes for every variant.
#[derive(Debug)]
pub enum CertificateSource {
    /// Caller supplied certificate and key.
    Existing(ExistingCertificateSource),
    /// An entry of an already opened key store.
    KeyStore(KeyStoreCertificateSource),
    /// An entry of a key store read from a file or bundled bytes.
    KeyStoreFile(KeyStoreFileCertificateSource),
    /// A PEM certificate file and a PEM private key file.
    PemFile(PemFileCertificateSource),
    /// A self-signed root generated on first load.
    Generated(RootCertificateGenerator),
}

impl CertificateSource {
    /// Produces the certificate chain and key.
    pub fn load(&self) -> Result<CertificateAndKey> {
        match self {
            Self::Existing(source) => source.load(),
            Self::KeyStore(source) => source.load(),
            Self::KeyStoreFile(source) => source.load(),
            Self::PemFile(source) => source.load(),
            Self::Generated(source) => source.load(),
        }
    }

    /// Short name of the variant, for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Existing(_) => "existing",
            Self::KeyStore(_) => "key store",
            Self::KeyStoreFile(_) => "key store file",
            Self::PemFile(_) => "PEM files",
            Self::Generated(_) => "generated",
        }
    }

    /// Returns the generator when this source is the generated variant.
    #[must_use]
    pub const fn as_generator(&self) -> Option<&RootCertificateGenerator> {
        match self {
            Self::Generated(generator) => Some(generator),
            _ => None,
        }
    }
}

impl From<ExistingCertificateSource> for CertificateSource {
    fn from(source: ExistingCertificateSource) -> Self {
        Self::Existing(source)
    }
}

impl From<KeyStoreCertificateSource> for CertificateSource {
    fn from(source: KeyStoreCertificateSource) -> Self {
        Self::KeyStore(source)
    }
}

impl From<KeyStoreFileCertificateSource> for CertificateSource {
    fn from(source: KeyStoreFileCertificateSource) -> Self {
        Self::KeyStoreFile(source)
    }
}

impl From<PemFileCertificateSource> for CertificateSource {
    fn from(source: PemFileCertificateSource) -> Self {
        Self::PemFile(source)
    }
}

impl From<RootCertificateGenerator> for CertificateSource {
    fn from(source: RootCertificateGenerator) -> Self {
        Self::Generated(source)
    }
}

/// Wraps a certificate and key that are already in memory.
#[derive(Debug, Clone)]
pub struct ExistingCertificateSource {
    pair: CertificateAndKey,
}

impl ExistingCertificateSource {
    /// Wraps a validated pair.
    #[must_use]
    pub const fn new(pair: CertificateAndKey) -> Self {
        Self { pair }
    }

    /// Wraps a certificate chain and key that may be absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if either part is missing or
    /// the key does not belong to the first certificate.
    pub fn from_parts(
        chain: Option<Vec<Certificate>>,
        private_key: Option<PrivateKey>,
    ) -> Result<Self> {
        let chain = chain
            .filter(|chain| !chain.is_empty())
            .ok_or_else(|| Error::InvalidConfiguration("certificate must not be missing".into()))?;
        let private_key = private_key
            .ok_or_else(|| Error::InvalidConfiguration("private key must not be missing".into()))?;
        Ok(Self::new(CertificateAndKey::new(chain, private_key)?))
    }

    /// Parses PEM text held in memory.
    pub fn from_pem(certificate_pem: &str, private_key_pem: &str, password: Option<&str>) -> Result<Self> {
        let chain = crate::pem::parse_certificates(certificate_pem)?;
        let private_key = crate::pem::parse_private_key(private_key_pem, password)?;
        Ok(Self::new(CertificateAndKey::new(chain, private_key)?))
    }

    /// Returns the wrapped pair.
    pub fn load(&self) -> Result<CertificateAndKey> {
        Ok(self.pair.clone())
    }
}

/// Reads a private key entry from an opened [`KeyStore`].
pub struct KeyStoreCertificateSource {
    store: Arc<KeyStore>,
    alias: String,
    password: Zeroizing<String>,
}

impl KeyStoreCertificateSource {
    /// Creates the source.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the store holds no entries
    /// or the alias or password is empty.
    pub fn new(
        store: impl Into<Arc<KeyStore>>,
        alias: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        let store = store.into();
        if store.aliases().is_empty() {
            return Err(Error::InvalidConfiguration("key store must not be empty".into()));
        }
        let alias = required("key store alias", alias.into())?;
        let password = Zeroizing::new(required("key store password", password.into())?);
        Ok(Self {
            store,
            alias,
            password,
        })
    }

    /// Returns the entry for the configured alias.
    pub fn load(&self) -> Result<CertificateAndKey> {
        let pair = self.store.private_key_entry(&self.alias, &self.password)?;
        info!(
            "Loaded '{}' from {} key store",
            self.alias,
            self.store.format()
        );
        Ok(pair)
    }
}

impl fmt::Debug for KeyStoreCertificateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStoreCertificateSource")
            .field("store", &self.store)
            .field("alias", &self.alias)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Where a serialized key store lives.
#[derive(Debug, Clone)]
pub enum KeyStoreLocation {
    /// A file on disk.
    File(PathBuf),
    /// Bytes compiled into the binary, e.g. with `include_bytes!`.
    Bundled {
        /// Name used in logs and errors.
        name: String,
        /// The container bytes.
        bytes: &'static [u8],
    },
}

impl fmt::Display for KeyStoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Bundled { name, .. } => write!(f, "bundled:{name}"),
        }
    }
}

/// Opens a key store from a file or bundled resource, then reads one entry.
pub struct KeyStoreFileCertificateSource {
    location: KeyStoreLocation,
    format: KeyStoreFormat,
    alias: String,
    password: Zeroizing<String>,
}

impl KeyStoreFileCertificateSource {
    /// Creates the source.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] for an empty path, alias or
    /// password.
    pub fn new(
        location: KeyStoreLocation,
        format: KeyStoreFormat,
        alias: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        if let KeyStoreLocation::File(path) = &location {
            if path.as_os_str().is_empty() {
                return Err(Error::InvalidConfiguration(
                    "key store file path must not be empty".into(),
                ));
            }
        }
        Ok(Self {
            location,
            format,
            alias: required("key store alias", alias.into())?,
            password: Zeroizing::new(required("key store password", password.into())?),
        })
    }

    /// Creates a source for a key store file.
    pub fn from_file(
        path: impl Into<PathBuf>,
        format: KeyStoreFormat,
        alias: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        Self::new(KeyStoreLocation::File(path.into()), format, alias, password)
    }

    /// Opens the container and reads the configured entry.
    pub fn load(&self) -> Result<CertificateAndKey> {
        let store = match &self.location {
            KeyStoreLocation::File(path) => KeyStore::load_file(path, self.format, &self.password)?,
            KeyStoreLocation::Bundled { bytes, .. } => {
                KeyStore::open(bytes, self.format, &self.password)?
            }
        };
        let pair = store.private_key_entry(&self.alias, &self.password)?;
        info!(
            "Loaded '{}' from {} key store {}",
            self.alias, self.format, self.location
        );
        Ok(pair)
    }
}

impl fmt::Debug for KeyStoreFileCertificateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStoreFileCertificateSource")
            .field("location", &self.location.to_string())
            .field("format", &self.format)
            .field("alias", &self.alias)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Reads a PEM certificate file (chain allowed) and a PEM private key file.
pub struct PemFileCertificateSource {
    certificate_file: PathBuf,
    private_key_file: PathBuf,
    password: Option<Zeroizing<String>>,
}

impl PemFileCertificateSource {
    /// Creates the source. `password` decrypts an encrypted private key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] for an empty path or an empty
    /// password.
    pub fn new(
        certificate_file: impl Into<PathBuf>,
        private_key_file: impl Into<PathBuf>,
        password: Option<&str>,
    ) -> Result<Self> {
        let certificate_file = certificate_file.into();
        let private_key_file = private_key_file.into();
        if certificate_file.as_os_str().is_empty() {
            return Err(Error::InvalidConfiguration(
                "certificate file must not be missing".into(),
            ));
        }
        if private_key_file.as_os_str().is_empty() {
            return Err(Error::InvalidConfiguration(
                "private key file must not be missing".into(),
            ));
        }
        if password.is_some_and(str::is_empty) {
            return Err(Error::InvalidConfiguration(
                "private key password must not be empty when given".into(),
            ));
        }
        Ok(Self {
            certificate_file,
            private_key_file,
            password: password.map(|p| Zeroizing::new(p.to_string())),
        })
    }

    /// Returns the certificate file path.
    #[must_use]
    pub fn certificate_file(&self) -> &Path {
        &self.certificate_file
    }

    /// Returns the private key file path.
    #[must_use]
    pub fn private_key_file(&self) -> &Path {
        &self.private_key_file
    }

    /// Reads and parses both files.
    pub fn load(&self) -> Result<CertificateAndKey> {
        let certificate_pem = crate::pem::read_file(&self.certificate_file, "certificate")?;
        let private_key_pem = crate::pem::read_file(&self.private_key_file, "private key")?;

        let chain = crate::pem::parse_certificates(&certificate_pem)?;
        let private_key = crate::pem::parse_private_key(
            &private_key_pem,
            self.password.as_ref().map(|p| p.as_str()),
        )?;

        let pair = CertificateAndKey::new(chain, private_key).map_err(|e| match e {
            Error::InvalidConfiguration(reason) => Error::Import(format!(
                "{} and {} do not belong together: {reason}",
                self.certificate_file.display(),
                self.private_key_file.display()
            )),
            other => other,
        })?;

        info!(
            "Loaded certificate {} from {}",
            pair.certificate().subject(),
            self.certificate_file.display()
        );
        Ok(pair)
    }
}

impl fmt::Debug for PemFileCertificateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PemFileCertificateSource")
            .field("certificate_file", &self.certificate_file)
            .field("private_key_file", &self.private_key_file)
            .field("encrypted", &self.password.is_some())
            .finish()
    }
}

fn required(what: &str, value: String) -> Result<String> {
    if value.is_empty() {
        return Err(Error::InvalidConfiguration(format!("{what} must not be empty")));
    }
    Ok(value)
}
