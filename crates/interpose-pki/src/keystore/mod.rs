//! Password protected key-store containers (PKCS12 and JKS).
//!
//! A [`KeyStore`] is an in-memory set of aliased entries. Private key
//! entries hold a certificate chain and its key; trusted certificate entries
//! hold a single certificate. Aliases are matched case-insensitively.

mod jks;
mod pkcs12;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::types::{Certificate, CertificateAndKey, PrivateKey};

/// Container format of a key store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyStoreFormat {
    /// PKCS#12 (`.p12`, `.pfx`).
    Pkcs12,
    /// Java key store, version 2.
    Jks,
}

impl fmt::Display for KeyStoreFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pkcs12 => "PKCS12",
            Self::Jks => "JKS",
        })
    }
}

impl FromStr for KeyStoreFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PKCS12" | "P12" | "PFX" => Ok(Self::Pkcs12),
            "JKS" => Ok(Self::Jks),
            other => Err(Error::InvalidConfiguration(format!(
                "unknown key store format '{other}' (expected PKCS12 or JKS)"
            ))),
        }
    }
}

#[derive(Clone)]
enum EntryKey {
    /// Decrypted key material.
    Plain(PrivateKey),
    /// A JKS protected key blob, recovered on access with the entry password.
    Protected(Vec<u8>),
}

#[derive(Debug, Clone)]
enum KeyStoreEntry {
    PrivateKey {
        alias: String,
        created: DateTime<Utc>,
        chain: Vec<Vec<u8>>,
        key: EntryKey,
    },
    TrustedCertificate {
        alias: String,
        created: DateTime<Utc>,
        certificate: Vec<u8>,
    },
}

impl fmt::Debug for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain(key) => f.debug_tuple("Plain").field(key).finish(),
            Self::Protected(_) => f.debug_tuple("Protected").field(&"[REDACTED]").finish(),
        }
    }
}

impl KeyStoreEntry {
    fn alias(&self) -> &str {
        match self {
            Self::PrivateKey { alias, .. } | Self::TrustedCertificate { alias, .. } => alias,
        }
    }
}

/// An opened key-store container.
#[derive(Clone)]
pub struct KeyStore {
    format: KeyStoreFormat,
    entries: Vec<KeyStoreEntry>,
    /// Password the store was opened with. Decrypted PKCS12 keys are only
    /// released for this password.
    password: Option<Zeroizing<String>>,
}

impl KeyStore {
    /// Creates an empty key store.
    #[must_use]
    pub const fn new(format: KeyStoreFormat) -> Self {
        Self {
            format,
            entries: Vec::new(),
            password: None,
        }
    }

    /// Opens a serialized key store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Import`] if the bytes are not a container of `format`
    /// or the password fails its integrity check.
    pub fn open(bytes: &[u8], format: KeyStoreFormat, password: &str) -> Result<Self> {
        let entries = match format {
            KeyStoreFormat::Pkcs12 => pkcs12::decode(bytes, password)?,
            KeyStoreFormat::Jks => jks::decode(bytes, password)?,
        };
        debug!("Opened {} key store with {} entries", format, entries.len());
        Ok(Self {
            format,
            entries,
            password: Some(Zeroizing::new(password.to_string())),
        })
    }

    /// Reads and opens a key store file.
    pub fn load_file(path: &Path, format: KeyStoreFormat, password: &str) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            Error::Import(format!("cannot read key store {}: {e}", path.display()))
        })?;
        Self::open(&bytes, format, password)
    }

    /// Returns the container format.
    #[must_use]
    pub const fn format(&self) -> KeyStoreFormat {
        self.format
    }

    /// Returns all aliases in insertion order.
    #[must_use]
    pub fn aliases(&self) -> Vec<&str> {
        self.entries.iter().map(KeyStoreEntry::alias).collect()
    }

    /// Returns `true` if a private key entry exists for `alias`.
    #[must_use]
    pub fn is_key_entry(&self, alias: &str) -> bool {
        matches!(self.find(alias), Some(KeyStoreEntry::PrivateKey { .. }))
    }

    /// Returns the chain and key stored under `alias`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Import`] if the alias is unknown, is not a private
    /// key entry, or `password` does not unlock the key.
    pub fn private_key_entry(&self, alias: &str, password: &str) -> Result<CertificateAndKey> {
        let Some(KeyStoreEntry::PrivateKey { chain, key, .. }) = self.find(alias) else {
            return Err(Error::Import(format!(
                "{} key store has no private key entry '{alias}' (aliases: {})",
                self.format,
                self.aliases().join(", ")
            )));
        };

        let private_key = match key {
            EntryKey::Protected(blob) => PrivateKey::from_pkcs8_der(jks::recover_key(blob, password)?)?,
            EntryKey::Plain(key) => {
                if self
                    .password
                    .as_ref()
                    .is_some_and(|opened_with| opened_with.as_str() != password)
                {
                    return Err(Error::Import(format!(
                        "wrong password for key entry '{alias}'"
                    )));
                }
                key.clone()
            }
        };

        CertificateAndKey::from_der_chain(chain, private_key).map_err(|e| match e {
            Error::InvalidConfiguration(reason) => {
                Error::Import(format!("key entry '{alias}' is inconsistent: {reason}"))
            }
            other => other,
        })
    }

    /// Stores `pair` under `alias`, replacing any entry with the same alias.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] if the alias is empty.
    pub fn set_private_key_entry(&mut self, alias: &str, pair: &CertificateAndKey) -> Result<()> {
        let alias = validate_alias(alias)?;
        self.remove(&alias);
        self.entries.push(KeyStoreEntry::PrivateKey {
            alias,
            created: Utc::now(),
            chain: pair.chain().iter().map(|cert| cert.der().to_vec()).collect(),
            key: EntryKey::Plain(pair.private_key().clone()),
        });
        Ok(())
    }

    /// Stores a trusted certificate under `alias`, replacing any entry with
    /// the same alias.
    pub fn set_trusted_certificate_entry(
        &mut self,
        alias: &str,
        certificate: &Certificate,
    ) -> Result<()> {
        let alias = validate_alias(alias)?;
        self.remove(&alias);
        self.entries.push(KeyStoreEntry::TrustedCertificate {
            alias,
            created: Utc::now(),
            certificate: certificate.der().to_vec(),
        });
        Ok(())
    }

    /// Returns the trusted certificate stored under `alias`.
    pub fn trusted_certificate(&self, alias: &str) -> Result<Option<Certificate>> {
        match self.find(alias) {
            Some(KeyStoreEntry::TrustedCertificate { certificate, .. }) => {
                Certificate::from_der(certificate).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Serializes the store, protecting it with `password`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Export`] if the password is empty or the entries cannot
    /// be represented in the container format.
    pub fn to_bytes(&self, password: &str) -> Result<Vec<u8>> {
        if password.is_empty() {
            return Err(Error::Export("key store password cannot be empty".into()));
        }
        match self.format {
            KeyStoreFormat::Pkcs12 => pkcs12::encode(&self.entries, password),
            KeyStoreFormat::Jks => jks::encode(&self.entries, password),
        }
    }

    /// Serializes the store and writes it to `path`.
    pub fn save_file(&self, path: &Path, password: &str) -> Result<()> {
        let bytes = self.to_bytes(password)?;
        std::fs::write(path, bytes).map_err(|e| {
            Error::Export(format!("cannot write key store {}: {e}", path.display()))
        })?;
        info!("Wrote {} key store to {}", self.format, path.display());
        Ok(())
    }

    fn find(&self, alias: &str) -> Option<&KeyStoreEntry> {
        self.entries
            .iter()
            .find(|entry| entry.alias().eq_ignore_ascii_case(alias))
    }

    fn remove(&mut self, alias: &str) {
        self.entries
            .retain(|entry| !entry.alias().eq_ignore_ascii_case(alias));
    }
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore")
            .field("format", &self.format)
            .field("aliases", &self.aliases())
            .finish_non_exhaustive()
    }
}

fn validate_alias(alias: &str) -> Result<String> {
    let alias = alias.trim();
    if alias.is_empty() {
        return Err(Error::InvalidConfiguration("key store alias cannot be empty".into()));
    }
    Ok(alias.to_string())
}

/// Orders `pool` into a chain starting from `leaf`, following issuer links.
fn order_chain(leaf: Vec<u8>, mut pool: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    let mut chain = vec![leaf];
    loop {
        let Some(current) = chain.last().and_then(|der| Certificate::from_der(der).ok()) else {
            break;
        };
        if current.subject() == current.issuer() {
            break;
        }
        let next = pool.iter().position(|candidate| {
            Certificate::from_der(candidate)
                .is_ok_and(|cert| cert.subject() == current.issuer())
        });
        match next {
            Some(index) => chain.push(pool.remove(index)),
            None => break,
        }
    }
    chain
}
