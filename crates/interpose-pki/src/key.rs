//! Key generation, key algorithm identity and digest selection.
//!
//! A [`KeyGenerator`] produces fresh [`KeyPair`]s for one algorithm/parameter
//! set. Certificates are signed with an algorithm derived from the signer's
//! key and a configured [`DigestAlgorithm`], see [`signature_algorithm`].

use std::fmt;
use std::str::FromStr;

use pkcs8::ObjectIdentifier;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey};
use rustls::pki_types::PrivatePkcs8KeyDer;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::PrivateKey;

const OID_RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const OID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const OID_ED25519: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.112");
const OID_SECP256R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");
const OID_SECP384R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.34");

/// Default RSA modulus size in bits.
pub const DEFAULT_RSA_KEY_SIZE: u32 = 2048;

const MIN_RSA_KEY_SIZE: u32 = 2048;
const MAX_RSA_KEY_SIZE: u32 = 8192;

/// Named elliptic curves usable for certificate keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NamedCurve {
    /// NIST P-256 (`secp256r1`, `prime256v1`).
    #[default]
    P256,
    /// NIST P-384 (`secp384r1`).
    P384,
}

impl NamedCurve {
    /// Returns the SEC 2 name of the curve.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::P256 => "secp256r1",
            Self::P384 => "secp384r1",
        }
    }

    fn generation_algorithm(self) -> &'static rcgen::SignatureAlgorithm {
        match self {
            Self::P256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            Self::P384 => &rcgen::PKCS_ECDSA_P384_SHA384,
        }
    }

    fn from_oid(oid: ObjectIdentifier) -> Option<Self> {
        if oid == OID_SECP256R1 {
            Some(Self::P256)
        } else if oid == OID_SECP384R1 {
            Some(Self::P384)
        } else {
            None
        }
    }
}

impl fmt::Display for NamedCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NamedCurve {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "secp256r1" | "prime256v1" | "p-256" | "p256" | "nistp256" => Ok(Self::P256),
            "secp384r1" | "p-384" | "p384" | "nistp384" => Ok(Self::P384),
            other => Err(Error::UnsupportedAlgorithm(format!(
                "elliptic curve '{other}' is not supported (use secp256r1 or secp384r1)"
            ))),
        }
    }
}

/// Algorithm identity of a key pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// RSA with the given modulus size.
    Rsa {
        /// Modulus size in bits.
        bits: u32,
    },
    /// ECDSA over a named curve.
    Ec {
        /// The curve the key lives on.
        curve: NamedCurve,
    },
    /// Ed25519. Only accepted for imported keys.
    Ed25519,
}

impl KeyAlgorithm {
    /// Identifies the algorithm of a PKCS#8 `PrivateKeyInfo`.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self> {
        let info = pkcs8::PrivateKeyInfo::try_from(der)
            .map_err(|e| Error::Import(format!("malformed PKCS#8 private key: {e}")))?;

        let oid = info.algorithm.oid;
        if oid == OID_RSA_ENCRYPTION {
            let rsa_key = rsa::pkcs1::RsaPrivateKey::try_from(info.private_key)
                .map_err(|e| Error::Import(format!("malformed RSA private key: {e}")))?;
            let bits = u32::try_from(rsa_key.modulus.as_bytes().len() * 8)
                .map_err(|_| Error::Import("RSA modulus is too large".into()))?;
            Ok(Self::Rsa { bits })
        } else if oid == OID_EC_PUBLIC_KEY {
            let curve_oid = info
                .algorithm
                .parameters_oid()
                .map_err(|e| Error::Import(format!("EC private key without curve: {e}")))?;
            NamedCurve::from_oid(curve_oid)
                .map(|curve| Self::Ec { curve })
                .ok_or_else(|| {
                    Error::UnsupportedAlgorithm(format!("elliptic curve with OID {curve_oid}"))
                })
        } else if oid == OID_ED25519 {
            Ok(Self::Ed25519)
        } else {
            Err(Error::UnsupportedAlgorithm(format!(
                "private key algorithm with OID {oid}"
            )))
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rsa { bits } => write!(f, "RSA-{bits}"),
            Self::Ec { curve } => write!(f, "EC-{curve}"),
            Self::Ed25519 => f.write_str("Ed25519"),
        }
    }
}

/// Message digest used when signing certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DigestAlgorithm {
    /// SHA-256.
    #[default]
    Sha256,
    /// SHA-384.
    Sha384,
    /// SHA-512.
    Sha512,
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sha256 => "SHA-256",
            Self::Sha384 => "SHA-384",
            Self::Sha512 => "SHA-512",
        })
    }
}

impl FromStr for DigestAlgorithm {
    type Err = Error;

    /// Accepts `SHA256`, `sha-384`, and signature names such as `SHA512withRSA`.
    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .trim()
            .to_ascii_uppercase()
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect();
        let digest = normalized
            .split_once("WITH")
            .map_or(normalized.as_str(), |(digest, _)| digest);

        match digest {
            "SHA256" => Ok(Self::Sha256),
            "SHA384" => Ok(Self::Sha384),
            "SHA512" => Ok(Self::Sha512),
            "SHA1" | "MD5" | "MD2" => Err(Error::UnsupportedAlgorithm(format!(
                "digest '{}' is too weak for certificate signatures",
                s.trim()
            ))),
            _ => Err(Error::UnsupportedAlgorithm(format!(
                "unknown digest algorithm '{}'",
                s.trim()
            ))),
        }
    }
}

/// Returns the certificate signature algorithm for a signer key and digest.
pub fn signature_algorithm(
    key: KeyAlgorithm,
    digest: DigestAlgorithm,
) -> Result<&'static rcgen::SignatureAlgorithm> {
    match (key, digest) {
        (KeyAlgorithm::Rsa { .. }, DigestAlgorithm::Sha256) => Ok(&rcgen::PKCS_RSA_SHA256),
        (KeyAlgorithm::Rsa { .. }, DigestAlgorithm::Sha384) => Ok(&rcgen::PKCS_RSA_SHA384),
        (KeyAlgorithm::Rsa { .. }, DigestAlgorithm::Sha512) => Ok(&rcgen::PKCS_RSA_SHA512),
        (
            KeyAlgorithm::Ec {
                curve: NamedCurve::P256,
            },
            DigestAlgorithm::Sha256,
        ) => Ok(&rcgen::PKCS_ECDSA_P256_SHA256),
        (
            KeyAlgorithm::Ec {
                curve: NamedCurve::P384,
            },
            DigestAlgorithm::Sha384,
        ) => Ok(&rcgen::PKCS_ECDSA_P384_SHA384),
        (KeyAlgorithm::Ed25519, _) => Ok(&rcgen::PKCS_ED25519),
        (key, digest) => Err(Error::UnsupportedAlgorithm(format!(
            "{digest} signatures are not available for {key} keys"
        ))),
    }
}

/// Loads `private_key` as an rcgen signer that signs with `digest`.
pub(crate) fn signing_key(
    private_key: &PrivateKey,
    digest: DigestAlgorithm,
) -> Result<rcgen::KeyPair> {
    let algorithm = signature_algorithm(private_key.algorithm(), digest)?;
    rcgen::KeyPair::from_pkcs8_der_and_sign_algo(
        &PrivatePkcs8KeyDer::from(private_key.der()),
        algorithm,
    )
    .map_err(|e| {
        Error::Import(format!(
            "{} private key rejected by the signing backend: {e}",
            private_key.algorithm()
        ))
    })
}

/// An asymmetric key pair tagged with its algorithm.
pub struct KeyPair {
    private_key: PrivateKey,
    public_key_der: Vec<u8>,
}

impl KeyPair {
    /// Builds a key pair from an existing private key, deriving the public half.
    pub fn from_private_key(private_key: PrivateKey) -> Result<Self> {
        let parsed = rcgen::KeyPair::try_from(private_key.der()).map_err(|e| {
            Error::Import(format!(
                "{} private key could not be loaded: {e}",
                private_key.algorithm()
            ))
        })?;
        let public_key_der = parsed.public_key_der();
        Ok(Self {
            private_key,
            public_key_der,
        })
    }

    /// Returns the algorithm identity of this key pair.
    #[must_use]
    pub const fn algorithm(&self) -> KeyAlgorithm {
        self.private_key.algorithm()
    }

    /// Returns the private half.
    #[must_use]
    pub const fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    /// Returns the public half as DER `SubjectPublicKeyInfo`.
    #[must_use]
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }

    /// Consumes the pair, keeping only the private key.
    #[must_use]
    pub fn into_private_key(self) -> PrivateKey {
        self.private_key
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("algorithm", &self.algorithm())
            .field("private_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Produces fresh key pairs for one algorithm/parameter set.
pub trait KeyGenerator: Send + Sync + fmt::Debug {
    /// The algorithm of every key this generator produces.
    fn algorithm(&self) -> KeyAlgorithm;

    /// Generates a new key pair.
    fn generate(&self) -> Result<KeyPair>;
}

/// Generates RSA key pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RsaKeyGenerator {
    key_size: u32,
}

impl RsaKeyGenerator {
    /// Creates a generator with an explicit modulus size.
    ///
    /// Sizes outside 2048..=8192 bits, or not a multiple of 8, are rejected
    /// because the signing backend cannot use them.
    pub fn new(key_size: u32) -> Result<Self> {
        if !(MIN_RSA_KEY_SIZE..=MAX_RSA_KEY_SIZE).contains(&key_size) || key_size % 8 != 0 {
            return Err(Error::UnsupportedAlgorithm(format!(
                "RSA key size {key_size} (supported: {MIN_RSA_KEY_SIZE}..={MAX_RSA_KEY_SIZE}, multiple of 8)"
            )));
        }
        Ok(Self { key_size })
    }

    /// Returns the modulus size in bits.
    #[must_use]
    pub const fn key_size(&self) -> u32 {
        self.key_size
    }
}

impl Default for RsaKeyGenerator {
    fn default() -> Self {
        Self {
            key_size: DEFAULT_RSA_KEY_SIZE,
        }
    }
}

impl KeyGenerator for RsaKeyGenerator {
    fn algorithm(&self) -> KeyAlgorithm {
        KeyAlgorithm::Rsa {
            bits: self.key_size,
        }
    }

    fn generate(&self) -> Result<KeyPair> {
        debug!("Generating RSA-{} key pair", self.key_size);

        let mut rng = rand::thread_rng();
        let key = rsa::RsaPrivateKey::new(&mut rng, self.key_size as usize).map_err(|e| {
            Error::UnsupportedAlgorithm(format!("RSA-{} key generation failed: {e}", self.key_size))
        })?;
        let private_der = key
            .to_pkcs8_der()
            .map_err(|e| Error::UnsupportedAlgorithm(format!("RSA key encoding failed: {e}")))?;
        let public_der = key
            .to_public_key()
            .to_public_key_der()
            .map_err(|e| Error::UnsupportedAlgorithm(format!("RSA key encoding failed: {e}")))?;

        Ok(KeyPair {
            private_key: PrivateKey::with_algorithm(
                private_der.as_bytes().to_vec(),
                self.algorithm(),
            ),
            public_key_der: public_der.as_bytes().to_vec(),
        })
    }
}

/// Generates ECDSA key pairs on a named curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EcKeyGenerator {
    curve: NamedCurve,
}

impl EcKeyGenerator {
    /// Creates a generator for the curve with the given name.
    pub fn with_curve_name(name: &str) -> Result<Self> {
        Ok(Self {
            curve: name.parse()?,
        })
    }

    /// Creates a generator for `curve`.
    #[must_use]
    pub const fn with_curve(curve: NamedCurve) -> Self {
        Self { curve }
    }

    /// Returns the curve keys are generated on.
    #[must_use]
    pub const fn curve(&self) -> NamedCurve {
        self.curve
    }
}

impl KeyGenerator for EcKeyGenerator {
    fn algorithm(&self) -> KeyAlgorithm {
        KeyAlgorithm::Ec { curve: self.curve }
    }

    fn generate(&self) -> Result<KeyPair> {
        debug!("Generating EC key pair on {}", self.curve);

        let generated = rcgen::KeyPair::generate_for(self.curve.generation_algorithm())
            .map_err(|e| {
                Error::UnsupportedAlgorithm(format!("EC key generation on {} failed: {e}", self.curve))
            })?;

        Ok(KeyPair {
            public_key_der: generated.public_key_der(),
            private_key: PrivateKey::with_algorithm(generated.serialize_der(), self.algorithm()),
        })
    }
}
