//! End-to-end tests for exporting and re-importing the root CA.
//!
//! These tests verify:
//! 1. Key store exports re-import to the identical root
//! 2. Wrong key store and PEM passwords are rejected
//! 3. Persisted roots survive a restart
//! 4. An exported root keeps minting leaves clients already trust

mod helpers;

use std::sync::Arc;

use helpers::*;
use interpose_pki::{
    CertificateSource, EcKeyGenerator, Error, ExistingCertificateSource, KeyStore,
    KeyStoreCertificateSource, KeyStoreFileCertificateSource, KeyStoreFormat, KeyStoreLocation,
    PemFileCertificateSource, RootCertificateGenerator, RsaKeyGenerator, TlsEngineProvisioner,
};
use rustls::ClientConnection;
use rustls::pki_types::ServerName;
use test_case::test_case;

fn provisioner_with(source: impl Into<CertificateSource>) -> TlsEngineProvisioner {
    init_tracing();
    TlsEngineProvisioner::builder()
        .root_source(source)
        .leaf_key_generator(EcKeyGenerator::default())
        .digest("SHA256")
        .build()
        .unwrap()
}

// ============================================================================
// Key Store Export Tests
// ============================================================================

#[test_case(KeyStoreFormat::Pkcs12, "root.p12" ; "pkcs12")]
#[test_case(KeyStoreFormat::Jks, "root.jks" ; "jks")]
fn test_keystore_export_reimports_same_root(format: KeyStoreFormat, file: &str) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(file);

    let original = test_provisioner("export-ca");
    original
        .export_root_to_keystore(format, &path, "interpose", "changeit")
        .unwrap();

    let reimported = provisioner_with(
        KeyStoreFileCertificateSource::from_file(&path, format, "interpose", "changeit").unwrap(),
    );
    assert_eq!(
        *reimported.root_authority().load().unwrap(),
        *original.root_authority().load().unwrap()
    );
}

#[test_case(KeyStoreFormat::Pkcs12 ; "pkcs12")]
#[test_case(KeyStoreFormat::Jks ; "jks")]
fn test_keystore_wrong_password_is_rejected(format: KeyStoreFormat) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("root.store");

    test_provisioner("locked-ca")
        .export_root_to_keystore(format, &path, "interpose", "right-password")
        .unwrap();

    let provisioner = provisioner_with(
        KeyStoreFileCertificateSource::from_file(&path, format, "interpose", "wrong-password")
            .unwrap(),
    );
    let err = provisioner.warm_up().unwrap_err();
    assert!(matches!(err, Error::Import(_)));
}

#[test]
fn test_keystore_missing_alias_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("root.p12");

    test_provisioner("alias-ca")
        .export_root_to_keystore(KeyStoreFormat::Pkcs12, &path, "interpose", "changeit")
        .unwrap();

    let provisioner = provisioner_with(
        KeyStoreFileCertificateSource::from_file(&path, KeyStoreFormat::Pkcs12, "other", "changeit")
            .unwrap(),
    );
    assert!(provisioner.server_engine("example.com", 443).is_err());
}

#[test]
fn test_opened_keystore_serves_as_source() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("root.jks");
    let original = test_provisioner("opened-ca");
    original
        .export_root_to_keystore(KeyStoreFormat::Jks, &path, "interpose", "changeit")
        .unwrap();

    let store = KeyStore::load_file(&path, KeyStoreFormat::Jks, "changeit").unwrap();
    assert_eq!(store.aliases(), vec!["interpose"]);

    let provisioner =
        provisioner_with(KeyStoreCertificateSource::new(store, "interpose", "changeit").unwrap());
    let engine = provisioner.server_engine("opened.example", 443).unwrap();
    assert_eq!(
        engine.certificate().certificate().issuer(),
        original
            .root_authority()
            .load()
            .unwrap()
            .certificate()
            .subject()
    );
}

#[test]
fn test_bundled_keystore_source() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bundled.p12");
    test_provisioner("bundled-ca")
        .export_root_to_keystore(KeyStoreFormat::Pkcs12, &path, "interpose", "changeit")
        .unwrap();

    let bytes: &'static [u8] = Box::leak(std::fs::read(&path).unwrap().into_boxed_slice());
    let source = KeyStoreFileCertificateSource::new(
        KeyStoreLocation::Bundled {
            name: "bundled.p12".into(),
            bytes,
        },
        KeyStoreFormat::Pkcs12,
        "interpose",
        "changeit",
    )
    .unwrap();

    let root = provisioner_with(source).root_authority().load().unwrap();
    assert_eq!(root.certificate().common_name(), Some("bundled-ca"));
}

// ============================================================================
// PEM Export Tests
// ============================================================================

#[test]
fn test_encrypted_pem_export_requires_password() {
    let original = test_provisioner("pem-ca");
    let (cert_pem, key_pem) = original.export_root_as_pem(Some("secret")).unwrap();
    assert!(key_pem.contains("ENCRYPTED PRIVATE KEY"));

    let wrong = ExistingCertificateSource::from_pem(&cert_pem, &key_pem, Some("guess"));
    assert!(matches!(wrong, Err(Error::Import(_))));

    let missing = ExistingCertificateSource::from_pem(&cert_pem, &key_pem, None);
    assert!(missing.is_err());

    let right = ExistingCertificateSource::from_pem(&cert_pem, &key_pem, Some("secret")).unwrap();
    assert_eq!(
        right.load().unwrap(),
        *original.root_authority().load().unwrap()
    );
}

#[test]
fn test_pem_file_source_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("root.pem");
    let key_path = dir.path().join("root.key");

    let generator = generated_root("pem-file-ca", Arc::new(RsaKeyGenerator::default()));
    generator.save_certificate_pem_file(&cert_path).unwrap();
    generator
        .save_private_key_pem_file(&key_path, Some("changeit"))
        .unwrap();

    let source = PemFileCertificateSource::new(&cert_path, &key_path, Some("changeit")).unwrap();
    let provisioner = provisioner_with(source);
    assert_eq!(
        *provisioner.root_authority().load().unwrap(),
        generator.load().unwrap()
    );
}

#[test]
fn test_mismatched_pem_files_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("root.pem");
    let key_path = dir.path().join("root.key");

    generated_root("first", Arc::new(EcKeyGenerator::default()))
        .save_certificate_pem_file(&cert_path)
        .unwrap();
    generated_root("second", Arc::new(EcKeyGenerator::default()))
        .save_private_key_pem_file(&key_path, None)
        .unwrap();

    let provisioner =
        provisioner_with(PemFileCertificateSource::new(&cert_path, &key_path, None).unwrap());
    let err = provisioner.warm_up().unwrap_err();
    assert!(matches!(err, Error::Import(_)));
}

// ============================================================================
// Persistence Tests
// ============================================================================

#[test]
fn test_persisted_root_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("state").join("root.pem");
    let key_path = dir.path().join("state").join("root.key");

    let first = provisioner_with(
        RootCertificateGenerator::with_common_name("Persistent Root")
            .unwrap()
            .persist_to(&cert_path, &key_path),
    );
    let first_engine = first.server_engine("persist.example", 443).unwrap();
    assert!(cert_path.exists());
    assert!(key_path.exists());

    // A new process restores the root instead of generating another.
    let second = provisioner_with(
        RootCertificateGenerator::with_common_name("Persistent Root")
            .unwrap()
            .persist_to(&cert_path, &key_path),
    );
    assert_eq!(
        *second.root_authority().load().unwrap(),
        *first.root_authority().load().unwrap()
    );

    // Clients that trusted the first run accept leaves from the second.
    let config = client_config_trusting(first_engine.certificate().chain()[1].der());
    let engine = second.server_engine("persist.example", 443).unwrap();
    let mut client =
        ClientConnection::new(config, ServerName::try_from("persist.example").unwrap()).unwrap();
    let mut server = engine.connection().unwrap();
    handshake(&mut client, &mut server).unwrap();
}

#[test]
fn test_lone_persisted_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("root.pem");
    let key_path = dir.path().join("root.key");
    std::fs::write(&cert_path, "stale").unwrap();

    let provisioner = provisioner_with(
        RootCertificateGenerator::with_common_name("Half Persisted")
            .unwrap()
            .persist_to(&cert_path, &key_path),
    );
    let err = provisioner.warm_up().unwrap_err();
    assert!(err.is_configuration_error());
    assert!(!key_path.exists());
}
