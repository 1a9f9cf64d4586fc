//! Java key store (JKS, version 2) codec.
//!
//! Layout: magic `FEEDFEED`, version, entry count, entries, then a SHA-1
//! digest over the UTF-16BE password, the ASCII string `Mighty Aphrodite`
//! and every preceding byte. Private keys are wrapped by the Sun key
//! protector: `salt || (key XOR stream) || SHA-1(password || key)`.

use chrono::{DateTime, Utc};
use der::asn1::{AnyRef, ObjectIdentifier, OctetStringRef};
use der::{Decode, Encode, Sequence};
use pkcs8::spki::AlgorithmIdentifierRef;
use rand::RngCore;
use sha1::{Digest, Sha1};
use zeroize::Zeroizing;

use super::{EntryKey, KeyStoreEntry};
use crate::error::{Error, Result};

const MAGIC: u32 = 0xFEED_FEED;
const JCEKS_MAGIC: u32 = 0xCECE_CECE;
const VERSION_1: u32 = 1;
const VERSION_2: u32 = 2;

const TAG_PRIVATE_KEY: u32 = 1;
const TAG_TRUSTED_CERT: u32 = 2;

const CERT_TYPE_X509: &str = "X.509";
const INTEGRITY_SALT: &[u8] = b"Mighty Aphrodite";

const KEY_PROTECTOR_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.42.2.17.1.1");
const SALT_LEN: usize = 20;
const DIGEST_LEN: usize = 20;

/// `EncryptedPrivateKeyInfo` as written by the Sun key protector.
#[derive(Sequence)]
struct ProtectedKeyInfo<'a> {
    algorithm: AlgorithmIdentifierRef<'a>,
    encrypted_data: OctetStringRef<'a>,
}

/// Big-endian password bytes, two per UTF-16 code unit.
fn password_bytes(password: &str) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(password.encode_utf16().flat_map(u16::to_be_bytes).collect())
}

fn integrity_digest(password: &str, data: &[u8]) -> [u8; DIGEST_LEN] {
    let mut hasher = Sha1::new();
    hasher.update(password_bytes(password).as_slice());
    hasher.update(INTEGRITY_SALT);
    hasher.update(data);
    hasher.finalize().into()
}

fn key_stream(password: &[u8], salt: &[u8], len: usize) -> Zeroizing<Vec<u8>> {
    let mut stream = Zeroizing::new(Vec::with_capacity(len + DIGEST_LEN));
    let mut digest = salt.to_vec();
    while stream.len() < len {
        let mut hasher = Sha1::new();
        hasher.update(password);
        hasher.update(&digest);
        digest = hasher.finalize().to_vec();
        stream.extend_from_slice(&digest);
    }
    stream.truncate(len);
    stream
}

/// Wraps a PKCS#8 key with the Sun key protector.
pub(super) fn protect_key(pkcs8: &[u8], password: &str) -> Result<Vec<u8>> {
    let pw = password_bytes(password);

    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);

    let stream = key_stream(&pw, &salt, pkcs8.len());
    let mut encrypted = Vec::with_capacity(SALT_LEN + pkcs8.len() + DIGEST_LEN);
    encrypted.extend_from_slice(&salt);
    encrypted.extend(pkcs8.iter().zip(stream.iter()).map(|(k, s)| k ^ s));

    let mut hasher = Sha1::new();
    hasher.update(pw.as_slice());
    hasher.update(pkcs8);
    encrypted.extend_from_slice(&hasher.finalize());

    let encrypted_data = OctetStringRef::new(&encrypted)
        .map_err(|e| Error::Export(format!("JKS key encoding failed: {e}")))?;
    ProtectedKeyInfo {
        algorithm: AlgorithmIdentifierRef {
            oid: KEY_PROTECTOR_OID,
            parameters: Some(AnyRef::NULL),
        },
        encrypted_data,
    }
    .to_der()
    .map_err(|e| Error::Export(format!("JKS key encoding failed: {e}")))
}

/// Recovers the PKCS#8 key from a protected blob.
pub(super) fn recover_key(blob: &[u8], password: &str) -> Result<Vec<u8>> {
    let info = ProtectedKeyInfo::from_der(blob)
        .map_err(|e| Error::Import(format!("malformed JKS key entry: {e}")))?;
    if info.algorithm.oid != KEY_PROTECTOR_OID {
        return Err(Error::Import(format!(
            "JKS key entry uses unsupported protection {}",
            info.algorithm.oid
        )));
    }

    let data = info.encrypted_data.as_bytes();
    if data.len() <= SALT_LEN + DIGEST_LEN {
        return Err(Error::Import("JKS key entry is truncated".into()));
    }
    let (salt, rest) = data.split_at(SALT_LEN);
    let (encrypted, check) = rest.split_at(rest.len() - DIGEST_LEN);

    let pw = password_bytes(password);
    let stream = key_stream(&pw, salt, encrypted.len());
    let plain: Zeroizing<Vec<u8>> = Zeroizing::new(
        encrypted
            .iter()
            .zip(stream.iter())
            .map(|(e, s)| e ^ s)
            .collect(),
    );

    let mut hasher = Sha1::new();
    hasher.update(pw.as_slice());
    hasher.update(plain.as_slice());
    if hasher.finalize().as_slice() != check {
        return Err(Error::Import("cannot recover JKS key (wrong password?)".into()));
    }
    Ok(plain.to_vec())
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| Error::Import("JKS data is truncated".into()))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn utf(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Import("JKS alias is not valid UTF-8".into()))
    }

    fn blob(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.bytes(len)?.to_vec())
    }

    fn certificate(&mut self, version: u32) -> Result<Vec<u8>> {
        if version == VERSION_2 {
            let cert_type = self.utf()?;
            if cert_type != CERT_TYPE_X509 {
                return Err(Error::Import(format!(
                    "JKS certificate type '{cert_type}' is not supported"
                )));
            }
        }
        self.blob()
    }
}

fn write_utf(out: &mut Vec<u8>, value: &str) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| Error::Export(format!("JKS string too long: {} bytes", value.len())))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

fn write_blob(out: &mut Vec<u8>, value: &[u8]) -> Result<()> {
    let len = u32::try_from(value.len())
        .map_err(|_| Error::Export(format!("JKS blob too long: {} bytes", value.len())))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(value);
    Ok(())
}

fn write_certificate(out: &mut Vec<u8>, der: &[u8]) -> Result<()> {
    write_utf(out, CERT_TYPE_X509)?;
    write_blob(out, der)
}

fn timestamp(created: DateTime<Utc>) -> u64 {
    u64::try_from(created.timestamp_millis()).unwrap_or_default()
}

fn created_at(millis: u64) -> DateTime<Utc> {
    i64::try_from(millis)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_default()
}

pub(super) fn decode(bytes: &[u8], password: &str) -> Result<Vec<KeyStoreEntry>> {
    if bytes.len() < DIGEST_LEN {
        return Err(Error::Import("not a JKS key store: too short".into()));
    }
    let (body, digest) = bytes.split_at(bytes.len() - DIGEST_LEN);

    let mut reader = Reader::new(body);
    match reader.u32()? {
        MAGIC => {}
        JCEKS_MAGIC => {
            return Err(Error::Import("JCEKS key stores are not supported".into()));
        }
        _ => return Err(Error::Import("not a JKS key store: bad magic".into())),
    }
    let version = reader.u32()?;
    if version != VERSION_1 && version != VERSION_2 {
        return Err(Error::Import(format!("unsupported JKS version {version}")));
    }

    if integrity_digest(password, body).as_slice() != digest {
        return Err(Error::Import(
            "JKS integrity check failed (wrong password?)".into(),
        ));
    }

    let count = reader.u32()?;
    let mut entries = Vec::new();
    for _ in 0..count {
        let tag = reader.u32()?;
        let alias = reader.utf()?;
        let created = created_at(reader.u64()?);
        match tag {
            TAG_PRIVATE_KEY => {
                let key = reader.blob()?;
                let chain_len = reader.u32()?;
                let chain = (0..chain_len)
                    .map(|_| reader.certificate(version))
                    .collect::<Result<Vec<_>>>()?;
                entries.push(KeyStoreEntry::PrivateKey {
                    alias,
                    created,
                    chain,
                    key: EntryKey::Protected(key),
                });
            }
            TAG_TRUSTED_CERT => {
                let certificate = reader.certificate(version)?;
                entries.push(KeyStoreEntry::TrustedCertificate {
                    alias,
                    created,
                    certificate,
                });
            }
            other => {
                return Err(Error::Import(format!("unknown JKS entry tag {other}")));
            }
        }
    }

    Ok(entries)
}

pub(super) fn encode(entries: &[KeyStoreEntry], password: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC.to_be_bytes());
    out.extend_from_slice(&VERSION_2.to_be_bytes());
    let count = u32::try_from(entries.len())
        .map_err(|_| Error::Export("too many key store entries".into()))?;
    out.extend_from_slice(&count.to_be_bytes());

    for entry in entries {
        match entry {
            KeyStoreEntry::PrivateKey {
                alias,
                created,
                chain,
                key,
            } => {
                out.extend_from_slice(&TAG_PRIVATE_KEY.to_be_bytes());
                write_utf(&mut out, alias)?;
                out.extend_from_slice(&timestamp(*created).to_be_bytes());
                let protected = match key {
                    EntryKey::Plain(key) => protect_key(key.der(), password)?,
                    EntryKey::Protected(blob) => blob.clone(),
                };
                write_blob(&mut out, &protected)?;
                let chain_len = u32::try_from(chain.len())
                    .map_err(|_| Error::Export("certificate chain too long".into()))?;
                out.extend_from_slice(&chain_len.to_be_bytes());
                for der in chain {
                    write_certificate(&mut out, der)?;
                }
            }
            KeyStoreEntry::TrustedCertificate {
                alias,
                created,
                certificate,
            } => {
                out.extend_from_slice(&TAG_TRUSTED_CERT.to_be_bytes());
                write_utf(&mut out, alias)?;
                out.extend_from_slice(&timestamp(*created).to_be_bytes());
                write_certificate(&mut out, certificate)?;
            }
        }
    }

    let digest = integrity_digest(password, &out);
    out.extend_from_slice(&digest);
    Ok(out)
}
