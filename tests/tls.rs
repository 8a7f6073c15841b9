mod common;

use common::*;
use opflex_server::config::{Config, EncryptionConfig};
use opflex_server::network::message::{methods, MessageKind};
use opflex_server::network::{PeerClient, Role};
use opflex_server::security::TlsSecureChannel;
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair};
use serde_json::json;
use std::path::PathBuf;

struct Pki {
    dir: PathBuf,
    ca: Certificate,
    ca_key: KeyPair,
}

impl Pki {
    fn new() -> Self {
        let dir = std::env::temp_dir().join(format!("opflex-pki-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("ca")).unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, "opflex test ca");
        let ca_key = KeyPair::generate().unwrap();
        let ca = params.self_signed(&ca_key).unwrap();
        std::fs::write(dir.join("ca").join("root.pem"), ca.pem()).unwrap();
        Self { dir, ca, ca_key }
    }

    /// PEM file holding a CA-signed certificate and its key.
    fn issue(&self, file: &str, name: &str) -> String {
        let params = CertificateParams::new(vec![name.to_string()]).unwrap();
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.ca, &self.ca_key).unwrap();
        let path = self.dir.join(file);
        std::fs::write(&path, format!("{}{}", cert.pem(), key.serialize_pem())).unwrap();
        path.display().to_string()
    }

    fn ca_store(&self) -> String {
        self.dir.join("ca").display().to_string()
    }

    fn server_config(&self, verify_peers: bool) -> Config {
        Config {
            encryption: Some(EncryptionConfig {
                enabled: true,
                ca_store: Some(self.ca_store()),
                server_key: Some(self.issue("server.pem", "localhost")),
                server_key_pass: None,
                verify_peers: Some(verify_peers),
            }),
            ..test_config()
        }
    }
}

impl Drop for Pki {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

#[tokio::test]
async fn tls_handshake_then_protocol_exchange() {
    let pki = Pki::new();
    let (mut server, addr) = start(pki.server_config(false), store_with_policy());

    let channel = TlsSecureChannel::client(&pki.ca_store(), None, "localhost").unwrap();
    let mut client = PeerClient::connect_with(addr, &channel).await.unwrap();
    let reply = client.identify("tls-agent", Role::POLICY_ELEMENT).await.unwrap();
    assert_eq!(reply.kind, MessageKind::Response);

    let resolved = client
        .call(
            methods::POLICY_RESOLVE,
            json!({"subject": "ClassA", "policy_uri": "/uri/1"}),
        )
        .await
        .unwrap();
    assert_eq!(uris(&resolved.payload["policy"]), vec!["/uri/1"]);
    server.stop().unwrap();
}

#[tokio::test]
async fn verified_peers_must_present_a_certificate() {
    let pki = Pki::new();
    let (mut server, addr) = start(pki.server_config(true), store_with_policy());

    let anonymous = TlsSecureChannel::client(&pki.ca_store(), None, "localhost").unwrap();
    let rejected = match PeerClient::connect_with(addr, &anonymous).await {
        Ok(mut client) => client.identify("anon", Role::POLICY_ELEMENT).await.is_err(),
        Err(_) => true,
    };
    assert!(rejected);

    let identity = pki.issue("agent.pem", "agent");
    let trusted = TlsSecureChannel::client(&pki.ca_store(), Some(&identity), "localhost").unwrap();
    let mut client = PeerClient::connect_with(addr, &trusted).await.unwrap();
    let reply = client.identify("agent", Role::POLICY_ELEMENT).await.unwrap();
    assert_eq!(reply.kind, MessageKind::Response);

    let conns = server.connections().await.unwrap();
    assert_eq!(conns.len(), 1);
    server.stop().unwrap();
}

#[tokio::test]
async fn plaintext_client_cannot_talk_to_a_tls_listener() {
    let pki = Pki::new();
    let (mut server, addr) = start(pki.server_config(false), store_with_policy());
    let mut client = PeerClient::connect(addr).await.unwrap();
    let outcome = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        client.identify("plain", Role::POLICY_ELEMENT),
    )
    .await
    .unwrap();
    assert!(outcome.is_err());
    server.stop().unwrap();
}
