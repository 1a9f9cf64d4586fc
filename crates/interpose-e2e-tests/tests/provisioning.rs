//! End-to-end tests for engine provisioning.
//!
//! These tests verify:
//! 1. The generated `test-ca` scenario for two hostnames
//! 2. Mixed RSA-root/EC-leaf provisioning
//! 3. Leaf identity per hostname across calls and threads
//! 4. Client engine targeting from request URI, Host header and session
//! 5. Configuration-driven provisioners

mod helpers;

use std::sync::{Arc, Barrier};
use std::thread;

use helpers::*;
use interpose_pki::{
    CertificateInfo, EcKeyGenerator, Error, KeyAlgorithm, ProvisionerConfig, RsaKeyGenerator,
    TlsEngineProvisioner, TlsSession,
};
use x509_parser::prelude::*;

// ============================================================================
// Generated Root Scenario Tests
// ============================================================================

#[test]
fn test_generated_root_scenario() {
    let provisioner = test_provisioner("test-ca");

    let example = provisioner.server_engine("example.com", 443).unwrap();
    let other = provisioner.server_engine("other.com", 443).unwrap();
    let root = provisioner.root_authority().load().unwrap();

    for (engine, host) in [(&example, "example.com"), (&other, "other.com")] {
        let leaf = engine.certificate().certificate();
        assert_eq!(leaf.issuer(), root.certificate().subject());
        assert_eq!(leaf.common_name(), Some(host));

        let (_, parsed_root) = X509Certificate::from_der(root.certificate().der()).unwrap();
        let (_, parsed_leaf) = X509Certificate::from_der(leaf.der()).unwrap();
        parsed_leaf
            .verify_signature(Some(parsed_root.public_key()))
            .unwrap();
    }
    assert_eq!(root.certificate().common_name(), Some("test-ca"));
}

#[test]
fn test_rsa_root_with_ec_leaves() {
    init_tracing();
    let provisioner = TlsEngineProvisioner::builder()
        .root_source(generated_root("rsa-root", Arc::new(RsaKeyGenerator::default())))
        .leaf_key_generator(EcKeyGenerator::default())
        .digest("SHA256")
        .build()
        .unwrap();

    let engine = provisioner.server_engine("example.com", 443).unwrap();
    let root = provisioner.root_authority().load().unwrap();

    assert_eq!(
        root.private_key().algorithm(),
        KeyAlgorithm::Rsa { bits: 2048 }
    );
    assert!(matches!(
        engine.certificate().private_key().algorithm(),
        KeyAlgorithm::Ec { .. }
    ));
    assert_eq!(
        engine.certificate().certificate().issuer(),
        root.certificate().subject()
    );
}

// ============================================================================
// Leaf Identity Tests
// ============================================================================

#[test]
fn test_same_host_same_leaf_any_port() {
    let provisioner = test_provisioner("identity-ca");
    let first = provisioner.server_engine("example.com", 443).unwrap();
    let second = provisioner.server_engine("example.com", 8443).unwrap();

    assert_eq!(
        first.certificate().certificate().serial_number(),
        second.certificate().certificate().serial_number()
    );
    assert_eq!(
        first.certificate().private_key(),
        second.certificate().private_key()
    );
}

#[test]
fn test_concurrent_engines_share_one_leaf_per_host() {
    let provisioner = test_provisioner("concurrent-ca");
    let barrier = Arc::new(Barrier::new(12));

    let handles: Vec<_> = (0..12)
        .map(|i| {
            let provisioner = provisioner.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let host = if i % 2 == 0 { "even.example" } else { "odd.example" };
                barrier.wait();
                let engine = provisioner.server_engine(host, 443).unwrap();
                (host, engine.certificate().certificate().serial_number().to_vec())
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for (host, serial) in &results {
        let cached = provisioner.leaf_cache().get(host).unwrap();
        assert_eq!(cached.certificate().serial_number(), serial.as_slice());
    }

    let metrics = provisioner.metrics();
    assert_eq!(metrics.leaf_cache.minted, 2);
    assert_eq!(metrics.leaf_cache.hits, 10);
    assert_eq!(metrics.server_engines, 12);
}

#[test]
fn test_custom_info_generator() {
    init_tracing();
    let provisioner = TlsEngineProvisioner::builder()
        .root_source(generated_root("template-ca", Arc::new(EcKeyGenerator::default())))
        .leaf_key_generator(EcKeyGenerator::default())
        .digest("SHA256")
        .info_generator(|host: &str| {
            CertificateInfo::builder(host)
                .organization("Template Org")
                .dns(host)
                .dns(format!("www.{host}"))
                .validity_days(7)
                .build()
        })
        .build()
        .unwrap();

    let engine = provisioner.server_engine("template.example", 443).unwrap();
    let leaf = engine.certificate().certificate();
    assert_eq!(leaf.organization(), Some("Template Org"));
    assert_eq!(leaf.san().len(), 2);
}

#[test]
fn test_minting_failure_is_scoped_to_one_host() {
    init_tracing();
    let provisioner = TlsEngineProvisioner::builder()
        .root_source(generated_root("failing-ca", Arc::new(EcKeyGenerator::default())))
        .leaf_key_generator(EcKeyGenerator::default())
        .digest("SHA256")
        .info_generator(|host: &str| {
            if host.starts_with("broken") {
                return Err(Error::InvalidConfiguration("refusing to mint".into()));
            }
            CertificateInfo::builder(host).dns(host).build()
        })
        .build()
        .unwrap();

    let good = provisioner.server_engine("good.example", 443).unwrap();
    let err = provisioner.server_engine("broken.example", 443).unwrap_err();
    assert!(matches!(err, Error::CertificateMinting { .. }));
    assert!(!err.is_configuration_error());

    let again = provisioner.server_engine("good.example", 443).unwrap();
    assert!(Arc::ptr_eq(good.certificate(), again.certificate()));
    assert_eq!(provisioner.metrics().leaf_cache.failures, 1);
}

// ============================================================================
// Client Engine Targeting Tests
// ============================================================================

#[test]
fn test_client_engine_prefers_request_uri() {
    let provisioner = test_provisioner("client-ca");
    let session = TlsSession::new("session.example", 443);

    let absolute = http::Request::get("https://uri.example:8443/path").body(()).unwrap();
    let engine = provisioner.client_engine(&absolute, &session).unwrap();
    assert_eq!(engine.host(), "uri.example");
    assert_eq!(engine.port(), 8443);

    let relative = http::Request::get("/path").body(()).unwrap();
    let engine = provisioner.client_engine(&relative, &session).unwrap();
    assert_eq!(engine.host(), "session.example");
}

#[test]
fn test_client_engine_uses_host_header_before_session() {
    let provisioner = test_provisioner("host-header-ca");
    let request = http::Request::get("/")
        .header(http::header::HOST, "header.example")
        .body(())
        .unwrap();
    let engine = provisioner
        .client_engine(&request, &TlsSession::new("session.example", 443))
        .unwrap();
    assert_eq!(engine.host(), "header.example");
}

#[test]
fn test_client_engine_without_any_target() {
    let provisioner = test_provisioner("no-target-ca");
    let request = http::Request::get("/").body(()).unwrap();
    let err = provisioner
        .client_engine(&request, &TlsSession::unknown())
        .unwrap_err();
    assert!(matches!(err, Error::UnresolvedTarget(_)));
}

// ============================================================================
// Configuration Tests
// ============================================================================

#[test]
fn test_provisioner_from_config_file() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("interpose.json");
    std::fs::write(
        &config_path,
        r#"{
            "root": {
                "type": "generated",
                "common_name": "config-root",
                "key": { "algorithm": "ec" },
                "persist": { "certificate_file": "ca/root.pem", "private_key_file": "ca/root.key" }
            },
            "leaf_key": { "algorithm": "rsa", "key_size": 2048 },
            "eager_root_load": true
        }"#,
    )
    .unwrap();

    let first = ProvisionerConfig::from_file(&config_path)
        .unwrap()
        .build_provisioner()
        .unwrap();
    let first_root = first.root_certificate_pem().unwrap();

    // A restart reuses the persisted root.
    let second = ProvisionerConfig::from_file(&config_path)
        .unwrap()
        .build_provisioner()
        .unwrap();
    assert_eq!(second.root_certificate_pem().unwrap(), first_root);

    let engine = second.server_engine("config.example", 443).unwrap();
    assert_eq!(
        engine.certificate().private_key().algorithm(),
        KeyAlgorithm::Rsa { bits: 2048 }
    );
}

#[test]
fn test_config_with_missing_pem_files_fails_eagerly() {
    let config = ProvisionerConfig::from_json_str(
        r#"{
            "root": {
                "type": "pem_files",
                "certificate_file": "/nonexistent/root.pem",
                "private_key_file": "/nonexistent/root.key"
            },
            "eager_root_load": true
        }"#,
    )
    .unwrap();

    let err = config.build_provisioner().unwrap_err();
    assert!(matches!(err, Error::Import(_)));
    assert!(err.is_configuration_error());
}
