//! PEM text encoding and decoding of certificates and private keys.
//!
//! Private keys are read from PKCS#8 (`PRIVATE KEY`), password protected
//! PKCS#8 (`ENCRYPTED PRIVATE KEY`), PKCS#1 (`RSA PRIVATE KEY`) and SEC1
//! (`EC PRIVATE KEY`) blocks. They are always written as PKCS#8, encrypted
//! with PBES2 (PBKDF2-SHA256, AES-256-CBC) when a password is given.

use std::path::Path;

use base64::Engine;
use pkcs8::pkcs5::pbes2;
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::EncodePrivateKey;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{Certificate, PrivateKey};

const PBKDF2_ITERATIONS: u32 = 2048;

const CERTIFICATE_TAGS: &[&str] = &["CERTIFICATE", "X509 CERTIFICATE", "TRUSTED CERTIFICATE"];

/// Encodes DER bytes as a PEM block with 64-column lines.
#[must_use]
pub fn encode_block(tag: &str, der: &[u8]) -> String {
    let b64 = base64::engine::general_purpose::STANDARD.encode(der);
    let mut out = format!("-----BEGIN {tag}-----\n");
    // Base64 output is ASCII, so splitting on byte boundaries is safe.
    for chunk in b64.as_bytes().chunks(64) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    out.push_str(&format!("-----END {tag}-----\n"));
    out
}

/// Parses every certificate block in `text`, in order.
///
/// # Errors
///
/// Returns [`Error::Import`] if the text is not PEM or holds no certificate.
pub fn parse_certificates(text: &str) -> Result<Vec<Certificate>> {
    let blocks = ::pem::parse_many(text)
        .map_err(|e| Error::Import(format!("malformed PEM certificate data: {e}")))?;

    let certificates = blocks
        .iter()
        .filter(|block| CERTIFICATE_TAGS.contains(&block.tag()))
        .map(|block| {
            Certificate::from_der(block.contents())
                .map_err(|e| Error::Import(format!("unreadable certificate in PEM data: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    if certificates.is_empty() {
        return Err(Error::Import("no certificate found in PEM data".into()));
    }
    Ok(certificates)
}

/// Parses the first private key block in `text`.
///
/// `password` is required for `ENCRYPTED PRIVATE KEY` blocks and ignored for
/// unencrypted ones.
///
/// # Errors
///
/// Returns [`Error::Import`] for malformed PEM, a missing or wrong password,
/// or legacy OpenSSL-encrypted blocks.
pub fn parse_private_key(text: &str, password: Option<&str>) -> Result<PrivateKey> {
    let blocks = ::pem::parse_many(text)
        .map_err(|e| Error::Import(format!("malformed PEM private key data: {e}")))?;

    let block = blocks
        .iter()
        .find(|block| block.tag().ends_with("PRIVATE KEY"))
        .ok_or_else(|| Error::Import("no private key found in PEM data".into()))?;

    if block
        .headers()
        .get("Proc-Type")
        .is_some_and(|value| value.contains("ENCRYPTED"))
    {
        return Err(Error::Import(
            "legacy OpenSSL-encrypted keys are not supported; convert to encrypted PKCS#8".into(),
        ));
    }

    let pkcs8 = match block.tag() {
        "PRIVATE KEY" => block.contents().to_vec(),
        "ENCRYPTED PRIVATE KEY" => {
            let password = password.ok_or_else(|| {
                Error::Import("private key is encrypted but no password was supplied".into())
            })?;
            decrypt_pkcs8(block.contents(), password)?
        }
        "RSA PRIVATE KEY" => rsa_pkcs1_to_pkcs8(block.contents())?,
        "EC PRIVATE KEY" => sec1_to_pkcs8(block.contents())?,
        other => {
            return Err(Error::Import(format!("unsupported private key block '{other}'")));
        }
    };

    PrivateKey::from_pkcs8_der(pkcs8)
}

/// Encodes `key` as PEM, encrypting it when `password` is given.
pub fn encode_private_key(key: &PrivateKey, password: Option<&str>) -> Result<String> {
    match password {
        None => Ok(key.pem()),
        Some(password) => encrypt_private_key(key, password),
    }
}

/// Encodes `key` as an `ENCRYPTED PRIVATE KEY` block.
///
/// # Errors
///
/// Returns [`Error::Export`] if the password is empty or encryption fails.
pub fn encrypt_private_key(key: &PrivateKey, password: &str) -> Result<String> {
    if password.is_empty() {
        return Err(Error::Export("cannot encrypt a private key with an empty password".into()));
    }

    let mut salt = [0u8; 16];
    let mut iv = [0u8; 16];
    let mut rng = rand::thread_rng();
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut iv);

    let params = pbes2::Parameters::pbkdf2_sha256_aes256cbc(PBKDF2_ITERATIONS, &salt, &iv)
        .map_err(|e| Error::Export(format!("invalid key encryption parameters: {e}")))?;
    let info = pkcs8::PrivateKeyInfo::try_from(key.der())
        .map_err(|e| Error::Export(format!("private key is not PKCS#8: {e}")))?;
    let encrypted = info
        .encrypt_with_params(params, password)
        .map_err(|e| Error::Export(format!("private key encryption failed: {e}")))?;

    Ok(encode_block("ENCRYPTED PRIVATE KEY", encrypted.as_bytes()))
}

/// Reads a PEM file as text.
pub(crate) fn read_file(path: &Path, what: &str) -> Result<String> {
    debug!("Reading {} from {}", what, path.display());
    std::fs::read_to_string(path)
        .map_err(|e| Error::Import(format!("cannot read {what} file {}: {e}", path.display())))
}

fn decrypt_pkcs8(der: &[u8], password: &str) -> Result<Vec<u8>> {
    let encrypted = pkcs8::EncryptedPrivateKeyInfo::try_from(der)
        .map_err(|e| Error::Import(format!("malformed encrypted private key: {e}")))?;
    let decrypted = encrypted
        .decrypt(password)
        .map_err(|_| Error::Import("private key decryption failed (wrong password?)".into()))?;
    Ok(decrypted.as_bytes().to_vec())
}

fn rsa_pkcs1_to_pkcs8(der: &[u8]) -> Result<Vec<u8>> {
    let key = rsa::RsaPrivateKey::from_pkcs1_der(der)
        .map_err(|e| Error::Import(format!("malformed RSA private key: {e}")))?;
    let pkcs8 = key
        .to_pkcs8_der()
        .map_err(|e| Error::Import(format!("RSA private key conversion failed: {e}")))?;
    Ok(pkcs8.as_bytes().to_vec())
}

fn sec1_to_pkcs8(der: &[u8]) -> Result<Vec<u8>> {
    use p256::pkcs8::EncodePrivateKey as _;

    if let Ok(key) = p256::SecretKey::from_sec1_der(der) {
        let pkcs8 = key
            .to_pkcs8_der()
            .map_err(|e| Error::Import(format!("EC private key conversion failed: {e}")))?;
        return Ok(pkcs8.as_bytes().to_vec());
    }
    if let Ok(key) = p384::SecretKey::from_sec1_der(der) {
        let pkcs8 = key
            .to_pkcs8_der()
            .map_err(|e| Error::Import(format!("EC private key conversion failed: {e}")))?;
        return Ok(pkcs8.as_bytes().to_vec());
    }
    Err(Error::Import(
        "EC private key is malformed or not on secp256r1/secp384r1".into(),
    ))
}
