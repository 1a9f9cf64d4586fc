//! Per-hostname leaf certificates: naming strategy, minting and caching.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rcgen::{ExtendedKeyUsagePurpose, IsCa, KeyUsagePurpose};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::key::KeyGenerator;
use crate::root::{RootCertificateAuthority, RootSigner};
use crate::types::{CertificateAndKey, CertificateInfo, SubjectAltName};

/// Organization written into leaves by [`HostnameCertificateInfoGenerator::default`].
pub const DEFAULT_LEAF_ORGANIZATION: &str = "Impersonated Certificate";

/// Default leaf validity in days.
pub const DEFAULT_LEAF_VALIDITY_DAYS: u32 = 365;

const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Normalizes a hostname into its cache key.
///
/// Strips surrounding whitespace, IPv6 brackets, a `:port` suffix and a
/// trailing dot, lowercases DNS names and canonicalizes IP literals. A single
/// leading `*.` label is accepted.
///
/// # Errors
///
/// Returns [`Error::InvalidHostname`] if the result is neither an IP address
/// nor a syntactically valid DNS name.
pub fn normalize_hostname(hostname: &str) -> Result<String> {
    let invalid = || Error::InvalidHostname(hostname.to_string());
    let trimmed = hostname.trim();

    if let Some(rest) = trimmed.strip_prefix('[') {
        let (inner, after) = rest.split_once(']').ok_or_else(invalid)?;
        if !after.is_empty() && !is_port_suffix(after) {
            return Err(invalid());
        }
        let ip: Ipv6Addr = inner.parse().map_err(|_| invalid())?;
        return Ok(ip.to_string());
    }

    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return Ok(ip.to_string());
    }

    let host = match trimmed.split_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        Some(_) => return Err(invalid()),
        None => trimmed,
    };
    let host = host.strip_suffix('.').unwrap_or(host).to_ascii_lowercase();

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip.to_string());
    }
    if host.is_empty() || host.len() > MAX_HOSTNAME_LEN {
        return Err(invalid());
    }

    for (index, label) in host.split('.').enumerate() {
        if index == 0 && label == "*" && host.len() > 2 {
            continue;
        }
        let valid = !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !valid {
            return Err(invalid());
        }
    }

    Ok(host)
}

fn is_port_suffix(s: &str) -> bool {
    s.strip_prefix(':')
        .is_some_and(|port| port.parse::<u16>().is_ok())
}

/// Chooses the subject and SANs of the leaf minted for a hostname.
///
/// Closures `Fn(&str) -> Result<CertificateInfo>` implement this trait.
pub trait CertificateInfoGenerator: Send + Sync {
    /// Returns the identity of the leaf for a normalized `hostname`.
    fn generate(&self, hostname: &str) -> Result<CertificateInfo>;
}

impl<F> CertificateInfoGenerator for F
where
    F: Fn(&str) -> Result<CertificateInfo> + Send + Sync,
{
    fn generate(&self, hostname: &str) -> Result<CertificateInfo> {
        self(hostname)
    }
}

/// Default naming strategy: CN and a single SAN set to the hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostnameCertificateInfoGenerator {
    organization: Option<String>,
    organizational_unit: Option<String>,
    locality: Option<String>,
    state: Option<String>,
    country: Option<String>,
    validity_days: u32,
}

impl Default for HostnameCertificateInfoGenerator {
    fn default() -> Self {
        Self {
            organization: Some(DEFAULT_LEAF_ORGANIZATION.to_string()),
            organizational_unit: None,
            locality: None,
            state: None,
            country: None,
            validity_days: DEFAULT_LEAF_VALIDITY_DAYS,
        }
    }
}

impl HostnameCertificateInfoGenerator {
    /// Copies the organization fields of `template` into every leaf.
    #[must_use]
    pub fn from_template(template: &CertificateInfo) -> Self {
        Self {
            organization: template.organization.clone(),
            organizational_unit: template.organizational_unit.clone(),
            locality: template.locality.clone(),
            state: template.state.clone(),
            country: template.country.clone(),
            validity_days: DEFAULT_LEAF_VALIDITY_DAYS,
        }
    }

    /// Sets the leaf validity.
    #[must_use]
    pub const fn with_validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    /// Returns the leaf validity in days.
    #[must_use]
    pub const fn validity_days(&self) -> u32 {
        self.validity_days
    }
}

impl CertificateInfoGenerator for HostnameCertificateInfoGenerator {
    fn generate(&self, hostname: &str) -> Result<CertificateInfo> {
        let mut info = CertificateInfo::builder(hostname)
            .validity_days(self.validity_days)
            .build()?;
        info.organization.clone_from(&self.organization);
        info.organizational_unit.clone_from(&self.organizational_unit);
        info.locality.clone_from(&self.locality);
        info.state.clone_from(&self.state);
        info.country.clone_from(&self.country);
        info.subject_alt_names = vec![SubjectAltName::for_host(hostname)];
        Ok(info)
    }
}

fn mint_leaf(
    hostname: &str,
    root: &CertificateAndKey,
    signer: &RootSigner,
    key_generator: &dyn KeyGenerator,
    info_generator: &dyn CertificateInfoGenerator,
) -> Result<CertificateAndKey> {
    let minting = |e: Error| match e {
        Error::CertificateMinting { .. } => e,
        other => Error::minting(hostname, other),
    };

    let mut info = info_generator.generate(hostname).map_err(minting)?;
    let issuer = root.certificate();
    if info.not_after > issuer.not_after() {
        debug!(
            "Leaf for {} clamped to root expiry {}",
            hostname,
            issuer.not_after()
        );
        info.not_after = issuer.not_after();
    }
    if info.not_before < issuer.not_before() {
        info.not_before = issuer.not_before();
    }
    info.validate().map_err(minting)?;

    let mut params = info.to_params().map_err(minting)?;
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.use_authority_key_identifier_extension = true;

    let key_pair = key_generator.generate().map_err(minting)?;
    let public_key = rcgen::KeyPair::try_from(key_pair.private_key().der())
        .map_err(|e| Error::minting(hostname, e))?;
    let cert = signer
        .sign(params, &public_key)
        .map_err(|e| Error::minting(hostname, e))?;

    let mut chain = vec![
        crate::types::Certificate::from_der(cert.der()).map_err(minting)?,
    ];
    chain.extend(root.chain().iter().cloned());
    CertificateAndKey::new(chain, key_pair.into_private_key()).map_err(minting)
}

/// Bounds on the leaf cache. Unbounded by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafCachePolicy {
    /// Maximum cached hostnames; least recently used entries are evicted.
    pub max_entries: Option<usize>,
    /// Maximum age of a cached leaf before it is minted again.
    pub time_to_live: Option<Duration>,
}

impl LeafCachePolicy {
    /// Validates the bounds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] for a zero bound.
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == Some(0) {
            return Err(Error::InvalidConfiguration(
                "leaf cache max_entries must be at least 1".into(),
            ));
        }
        if self.time_to_live.is_some_and(|ttl| ttl.is_zero()) {
            return Err(Error::InvalidConfiguration(
                "leaf cache time_to_live must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time leaf cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafCacheStats {
    /// Requests answered from the cache.
    pub hits: u64,
    /// Requests that had to mint.
    pub misses: u64,
    /// Leaves minted successfully.
    pub minted: u64,
    /// Mint attempts that failed.
    pub failures: u64,
    /// Entries dropped by the size bound or expiry.
    pub evictions: u64,
    /// Hostnames currently cached.
    pub entries: usize,
}

struct CachedLeaf {
    pair: Arc<CertificateAndKey>,
    minted_at: Instant,
}

#[derive(Default)]
struct LeafSlot {
    leaf: OnceCell<CachedLeaf>,
    /// Callers between `slot_for` and the end of their initialization attempt.
    /// Only incremented under the cache lock.
    in_flight: AtomicUsize,
}

struct SlotEntry {
    slot: Arc<LeafSlot>,
    tick: u64,
}

#[derive(Default)]
struct CacheState {
    slots: HashMap<String, SlotEntry>,
    /// Hostnames ordered by last use, oldest first.
    recency: BTreeMap<u64, String>,
    next_tick: u64,
}

impl CacheState {
    fn slot(&self, host: &str) -> Option<&Arc<LeafSlot>> {
        self.slots.get(host).map(|entry| &entry.slot)
    }

    fn insert(&mut self, host: &str) -> Arc<LeafSlot> {
        let slot = Arc::new(LeafSlot::default());
        let tick = self.bump();
        self.recency.insert(tick, host.to_string());
        self.slots.insert(
            host.to_string(),
            SlotEntry {
                slot: Arc::clone(&slot),
                tick,
            },
        );
        slot
    }

    fn touch(&mut self, host: &str) {
        let tick = self.bump();
        if let Some(entry) = self.slots.get_mut(host) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            self.recency.insert(tick, host.to_string());
        }
    }

    fn forget(&mut self, host: &str) {
        if let Some(entry) = self.slots.remove(host) {
            self.recency.remove(&entry.tick);
        }
    }

    fn pop_oldest(&mut self) -> Option<String> {
        let (_, host) = self.recency.pop_first()?;
        self.slots.remove(&host);
        Some(host)
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.recency.clear();
    }

    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }
}

/// Thread-safe cache of minted leaves keyed by normalized hostname.
///
/// Concurrent requests for one hostname mint once; the map lock is only held
/// to look up or insert the hostname's slot, so other hostnames never wait on
/// a mint in progress.
#[derive(Default)]
pub struct LeafCertificateCache {
    policy: LeafCachePolicy,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    minted: AtomicU64,
    failures: AtomicU64,
    evictions: AtomicU64,
}

impl LeafCertificateCache {
    /// Creates an unbounded cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a cache with the given bounds.
    pub fn with_policy(policy: LeafCachePolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            policy,
            ..Self::default()
        })
    }

    /// Returns the bounds of this cache.
    #[must_use]
    pub const fn policy(&self) -> &LeafCachePolicy {
        &self.policy
    }

    /// Returns the leaf for `hostname`, minting and caching it on a miss.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidHostname`] for an unusable hostname, root loading
    /// errors unchanged, and [`Error::CertificateMinting`] when this
    /// hostname's leaf cannot be produced. Failures are not cached.
    pub fn get_or_create(
        &self,
        hostname: &str,
        authority: &RootCertificateAuthority,
        key_generator: &dyn KeyGenerator,
        info_generator: &dyn CertificateInfoGenerator,
    ) -> Result<Arc<CertificateAndKey>> {
        let host = normalize_hostname(hostname)?;
        let (root, signer) = authority.signer()?;
        let slot = self.slot_for(&host);

        let mut minted_here = false;
        let result = slot.leaf.get_or_try_init(|| {
            minted_here = true;
            debug!("Minting leaf certificate for {}", host);
            mint_leaf(&host, root, signer, key_generator, info_generator).map(|pair| CachedLeaf {
                pair: Arc::new(pair),
                minted_at: Instant::now(),
            })
        });

        match result {
            Ok(leaf) => {
                slot.in_flight.fetch_sub(1, Ordering::AcqRel);
                if minted_here {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    self.minted.fetch_add(1, Ordering::Relaxed);
                    info!(
                        "Minted leaf certificate for {} (serial {})",
                        host,
                        leaf.pair.certificate().serial_hex()
                    );
                } else {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!("Leaf certificate cache hit for {}", host);
                }
                Ok(Arc::clone(&leaf.pair))
            }
            Err(e) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.discard(&host, &slot);
                warn!("Leaf certificate for {} could not be minted: {}", host, e);
                Err(e)
            }
        }
    }

    /// Returns the cached leaf for `hostname` without minting.
    #[must_use]
    pub fn get(&self, hostname: &str) -> Option<Arc<CertificateAndKey>> {
        let host = normalize_hostname(hostname).ok()?;
        let slot = Arc::clone(self.state.lock().slot(&host)?);
        let leaf = slot.leaf.get()?;
        (!self.is_expired(leaf)).then(|| Arc::clone(&leaf.pair))
    }

    /// Returns the number of cached leaves.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .slots
            .values()
            .filter(|entry| entry.slot.leaf.get().is_some())
            .count()
    }

    /// Returns `true` when no leaf is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every cached leaf. Mints in progress complete for their callers.
    pub fn clear(&self) {
        self.state.lock().clear();
    }

    /// Returns a snapshot of the cache counters.
    #[must_use]
    pub fn stats(&self) -> LeafCacheStats {
        LeafCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            minted: self.minted.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    /// Returns the slot for `host`, registered as in flight for the caller.
    fn slot_for(&self, host: &str) -> Arc<LeafSlot> {
        let mut state = self.state.lock();

        let expired = state
            .slot(host)
            .and_then(|slot| slot.leaf.get())
            .is_some_and(|leaf| self.is_expired(leaf));
        if expired {
            debug!("Cached leaf certificate for {} expired", host);
            state.forget(host);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        let existing = state.slot(host).map(Arc::clone);
        let slot = if let Some(slot) = existing {
            state.touch(host);
            slot
        } else {
            state.insert(host)
        };
        slot.in_flight.fetch_add(1, Ordering::AcqRel);

        if let Some(max_entries) = self.policy.max_entries {
            while state.slots.len() > max_entries {
                let Some(oldest) = state.pop_oldest() else {
                    break;
                };
                debug!("Evicting leaf certificate for {}", oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        slot
    }

    /// Ends a failed attempt. The slot is dropped only when no other caller
    /// is still waiting to retry on it.
    fn discard(&self, host: &str, slot: &Arc<LeafSlot>) {
        let mut state = self.state.lock();
        let remaining = slot.in_flight.fetch_sub(1, Ordering::AcqRel) - 1;
        let current = state
            .slot(host)
            .is_some_and(|cached| Arc::ptr_eq(cached, slot));
        if current && remaining == 0 && slot.leaf.get().is_none() {
            state.forget(host);
        }
    }

    fn is_expired(&self, leaf: &CachedLeaf) -> bool {
        self.policy
            .time_to_live
            .is_some_and(|ttl| leaf.minted_at.elapsed() >= ttl)
            || !leaf.pair.certificate().is_valid_at(Utc::now())
    }
}

impl fmt::Debug for LeafCertificateCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafCertificateCache")
            .field("policy", &self.policy)
            .field("stats", &self.stats())
            .finish()
    }
}
