//! Certificate engine for TLS interception.
#![forbid(unsafe_code)]
//!
//! This crate owns the root CA of an intercepting proxy, mints a leaf
//! certificate per requested hostname, and hands out rustls engines for both
//! halves of an intercepted connection.
//!
//! # Overview
//!
//! The `interpose-pki` crate provides:
//! - Key generation (RSA and EC on named curves)
//! - Root CA sourcing from PEM files, PKCS12/JKS key stores, caller supplied
//!   material, or a generated (optionally persisted) self-signed root
//! - Per-hostname leaf minting with a thread-safe cache
//! - Server and client TLS engines, plus an SNI-driven server configuration
//! - Root export to key stores and PEM for installing into client trust stores
//!
//! # Example
//!
//! ```no_run
//! use interpose_pki::{EcKeyGenerator, RootCertificateGenerator, TlsEngineProvisioner};
//!
//! // Generate a root CA on first use
//! let root = RootCertificateGenerator::with_common_name("interpose Root CA").unwrap();
//!
//! let provisioner = TlsEngineProvisioner::builder()
//!     .root_source(root)
//!     .leaf_key_generator(EcKeyGenerator::default())
//!     .digest("SHA256")
//!     .build()
//!     .unwrap();
//!
//! // Terminate a CONNECT tunnel to example.com
//! let engine = provisioner.server_engine("example.com", 443).unwrap();
//! let connection = engine.connection().unwrap();
//! # drop(connection);
//!
//! // Hand the root to operators
//! println!("{}", provisioner.root_certificate_pem().unwrap());
//! ```
//!
//! # Modules
//!
//! - [`key`] - Key generators and algorithm identities
//! - [`source`] - Root certificate sources
//! - [`root`] - Root generation, memoized loading and export
//! - [`leaf`] - Hostname normalization, leaf minting and caching
//! - [`engine`] - rustls server/client engines
//! - [`provisioner`] - The engine provisioner and its builder
//! - [`config`] - Serializable provisioner configuration
//! - [`keystore`] - PKCS12 and JKS containers
//! - [`pem`] - PEM encoding and decoding
//! - [`types`] - Core types (Certificate, `PrivateKey`, etc.)
//! - [`error`] - Error types

pub mod config;
pub mod engine;
pub mod error;
pub mod key;
pub mod keystore;
pub mod leaf;
pub mod pem;
pub mod provisioner;
pub mod root;
pub mod source;
pub mod types;

// Re-export commonly used types at crate root
pub use config::{KeyConfig, ProvisionerConfig, RootConfig};
pub use engine::{ClientEngine, ServerEngine, TlsSession, UpstreamTrust};
pub use error::{Error, Result};
pub use key::{
    DigestAlgorithm, EcKeyGenerator, KeyAlgorithm, KeyGenerator, KeyPair, NamedCurve,
    RsaKeyGenerator,
};
pub use keystore::{KeyStore, KeyStoreFormat};
pub use leaf::{
    CertificateInfoGenerator, HostnameCertificateInfoGenerator, LeafCachePolicy, LeafCacheStats,
    LeafCertificateCache, normalize_hostname,
};
pub use provisioner::{
    ProvisionerMetrics, ProvisionerState, TlsEngineProvisioner, TlsEngineProvisionerBuilder,
};
pub use root::{RootCertificateAuthority, RootCertificateGenerator};
pub use source::{
    CertificateSource, ExistingCertificateSource, KeyStoreCertificateSource,
    KeyStoreFileCertificateSource, KeyStoreLocation, PemFileCertificateSource,
};
pub use types::{
    Certificate, CertificateAndKey, CertificateInfo, CertificateInfoBuilder, PrivateKey,
    SerialNumberPolicy, SubjectAltName,
};
