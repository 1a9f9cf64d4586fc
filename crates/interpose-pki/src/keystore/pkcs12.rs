//! PKCS#12 container codec.

use chrono::Utc;
use p12::{CertBag, PFX, PKCS12Attribute, SafeBagKind};

use super::{EntryKey, KeyStoreEntry, order_chain};
use crate::error::{Error, Result};
use crate::types::PrivateKey;

#[derive(Default)]
struct BagAttributes {
    friendly_name: Option<String>,
    local_key_id: Option<Vec<u8>>,
}

impl BagAttributes {
    fn from_attributes(attributes: &[PKCS12Attribute]) -> Self {
        let mut out = Self::default();
        for attribute in attributes {
            match attribute {
                PKCS12Attribute::FriendlyName(name) => out.friendly_name = Some(name.clone()),
                PKCS12Attribute::LocalKeyId(id) => out.local_key_id = Some(id.clone()),
                PKCS12Attribute::Other(_) => {}
            }
        }
        out
    }
}

pub(super) fn decode(bytes: &[u8], password: &str) -> Result<Vec<KeyStoreEntry>> {
    let pfx = PFX::parse(bytes)
        .map_err(|e| Error::Import(format!("not a PKCS12 container: {e:?}")))?;
    if pfx.mac_data.is_some() && !pfx.verify_mac(password) {
        return Err(Error::Import(
            "PKCS12 integrity check failed (wrong password?)".into(),
        ));
    }

    let bags = pfx
        .bags(password)
        .map_err(|e| Error::Import(format!("unreadable PKCS12 contents: {e:?}")))?;
    let keys = pfx
        .key_bags(password)
        .map_err(|e| Error::Import(format!("PKCS12 key decryption failed: {e:?}")))?;

    let mut key_attributes = Vec::new();
    let mut certificates = Vec::new();
    for bag in &bags {
        match &bag.bag {
            SafeBagKind::Pkcs8ShroudedKeyBag(_) => {
                key_attributes.push(BagAttributes::from_attributes(&bag.attributes));
            }
            SafeBagKind::CertBag(CertBag::X509(der)) => {
                certificates.push((der.clone(), BagAttributes::from_attributes(&bag.attributes)));
            }
            _ => {}
        }
    }

    if keys.len() != key_attributes.len() {
        return Err(Error::Import("PKCS12 key bags could not all be decrypted".into()));
    }

    let mut entries = Vec::new();
    for (index, (key_der, attributes)) in keys.into_iter().zip(key_attributes).enumerate() {
        let leaf_index = certificates.iter().position(|(_, cert_attributes)| {
            attributes.local_key_id.is_some()
                && cert_attributes.local_key_id == attributes.local_key_id
        });
        let leaf_index = match leaf_index {
            Some(index) => index,
            // A lone key with certificates that carry no key ids: the first one is the leaf.
            None if index == 0 && !certificates.is_empty() => 0,
            None => {
                return Err(Error::Import(format!(
                    "PKCS12 key #{} has no matching certificate",
                    index + 1
                )));
            }
        };

        let (leaf, leaf_attributes) = &certificates[leaf_index];
        let pool = certificates
            .iter()
            .enumerate()
            .filter(|(i, (_, cert_attributes))| {
                *i != leaf_index && cert_attributes.local_key_id.is_none()
            })
            .map(|(_, (der, _))| der.clone())
            .collect();

        let alias = attributes
            .friendly_name
            .clone()
            .or_else(|| leaf_attributes.friendly_name.clone())
            .unwrap_or_else(|| (index + 1).to_string());

        entries.push(KeyStoreEntry::PrivateKey {
            alias,
            created: Utc::now(),
            chain: order_chain(leaf.clone(), pool),
            key: EntryKey::Plain(PrivateKey::from_pkcs8_der(key_der)?),
        });
    }

    Ok(entries)
}

pub(super) fn encode(entries: &[KeyStoreEntry], password: &str) -> Result<Vec<u8>> {
    let mut key_entries = entries.iter().filter_map(|entry| match entry {
        KeyStoreEntry::PrivateKey {
            alias, chain, key, ..
        } => Some((alias, chain, key)),
        KeyStoreEntry::TrustedCertificate { .. } => None,
    });

    let Some((alias, chain, key)) = key_entries.next() else {
        return Err(Error::Export("PKCS12 export needs a private key entry".into()));
    };
    if key_entries.next().is_some() {
        return Err(Error::Export(
            "PKCS12 export supports a single private key entry".into(),
        ));
    }
    if entries
        .iter()
        .any(|entry| matches!(entry, KeyStoreEntry::TrustedCertificate { .. }))
    {
        return Err(Error::Export(
            "PKCS12 export does not support trusted certificate entries".into(),
        ));
    }

    let EntryKey::Plain(key) = key else {
        return Err(Error::Export(format!(
            "key entry '{alias}' is still protected and cannot be re-encoded"
        )));
    };
    let Some((leaf, rest)) = chain.split_first() else {
        return Err(Error::Export(format!("key entry '{alias}' has no certificate")));
    };

    let cas: Vec<&[u8]> = rest.iter().map(Vec::as_slice).collect();
    let pfx = PFX::new_with_cas(leaf, key.der(), &cas, password, alias)
        .ok_or_else(|| Error::Export("PKCS12 encoding failed".into()))?;
    Ok(pfx.to_der())
}
