//! Test helpers for E2E tests.

#![allow(dead_code)]

use std::ops::DerefMut;
use std::sync::{Arc, Once};

use interpose_pki::{
    CertificateInfo, DigestAlgorithm, EcKeyGenerator, KeyGenerator, RootCertificateGenerator,
    TlsEngineProvisioner, UpstreamTrust,
};
use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, ConnectionCommon, RootCertStore};

/// Upper bound on flights exchanged before a handshake is declared stuck.
pub const MAX_HANDSHAKE_ROUNDS: usize = 16;

static TRACING: Once = Once::new();

/// Install a test subscriber honoring `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A generated root with the given common name and key generator.
pub fn generated_root(common_name: &str, keys: Arc<dyn KeyGenerator>) -> RootCertificateGenerator {
    let info = CertificateInfo::builder(common_name)
        .organization("interpose e2e")
        .validity_days(30)
        .build()
        .unwrap();
    RootCertificateGenerator::new(info, keys, DigestAlgorithm::Sha256).unwrap()
}

/// A provisioner with an EC root named `common_name` and EC leaves.
pub fn test_provisioner(common_name: &str) -> TlsEngineProvisioner {
    init_tracing();
    TlsEngineProvisioner::builder()
        .root_source(generated_root(common_name, Arc::new(EcKeyGenerator::default())))
        .leaf_key_generator(EcKeyGenerator::default())
        .digest("SHA256")
        .build()
        .unwrap()
}

/// A provisioner acting as the client side, trusting only `root_der`.
pub fn client_provisioner_trusting(root_der: &[u8]) -> TlsEngineProvisioner {
    let root = interpose_pki::Certificate::from_der(root_der).unwrap();
    TlsEngineProvisioner::builder()
        .root_source(generated_root("client side", Arc::new(EcKeyGenerator::default())))
        .leaf_key_generator(EcKeyGenerator::default())
        .digest("SHA256")
        .upstream_trust(UpstreamTrust::Custom {
            roots: vec![root],
            include_default_roots: false,
        })
        .build()
        .unwrap()
}

/// A plain rustls client configuration trusting only `root_der`.
pub fn client_config_trusting(root_der: &[u8]) -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.add(CertificateDer::from(root_der.to_vec())).unwrap();
    let mut config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

fn pump<A, B, DA, DB>(from: &mut A, to: &mut B) -> Result<usize, rustls::Error>
where
    A: DerefMut<Target = ConnectionCommon<DA>>,
    B: DerefMut<Target = ConnectionCommon<DB>>,
{
    let mut buf = Vec::new();
    while from.wants_write() {
        from.write_tls(&mut buf)
            .map_err(|e| rustls::Error::General(e.to_string()))?;
    }

    let mut reader = buf.as_slice();
    while !reader.is_empty() {
        to.read_tls(&mut reader)
            .map_err(|e| rustls::Error::General(e.to_string()))?;
        to.process_new_packets()?;
    }
    Ok(buf.len())
}

/// Drive a client and a server connection through a full handshake in memory.
pub fn handshake(
    client: &mut rustls::ClientConnection,
    server: &mut rustls::ServerConnection,
) -> Result<(), rustls::Error> {
    for _ in 0..MAX_HANDSHAKE_ROUNDS {
        let sent = pump(client, server)? + pump(server, client)?;
        if !client.is_handshaking() && !server.is_handshaking() {
            // Flush the final flight so both sides agree.
            pump(client, server)?;
            return Ok(());
        }
        if sent == 0 {
            break;
        }
    }
    Err(rustls::Error::General("handshake did not complete".into()))
}

/// Deliver whatever either side still has queued, such as session tickets
/// sent after the handshake.
pub fn flush(
    client: &mut rustls::ClientConnection,
    server: &mut rustls::ServerConnection,
) -> Result<(), rustls::Error> {
    pump(server, client)?;
    pump(client, server)?;
    Ok(())
}

/// The certificate chain the server presented, as seen by the client.
pub fn presented_chain(client: &rustls::ClientConnection) -> Vec<Vec<u8>> {
    client
        .peer_certificates()
        .unwrap_or_default()
        .iter()
        .map(|cert| cert.as_ref().to_vec())
        .collect()
}
