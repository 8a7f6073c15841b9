// Shared setup for the integration tests.
#![allow(dead_code)]

use opflex_server::config::{Config, ReconcileConfig};
use opflex_server::network::message::{Envelope, MessageKind};
use opflex_server::network::PeerClient;
use opflex_server::store::{MemoryStore, ObjectStore, PolicyUpdateOp, StoreClient};
use opflex_server::PolicyServer;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub const CLASS_A: u64 = 10;

pub fn test_config() -> Config {
    Config {
        port: 0,
        bind_addr: Some("127.0.0.1".into()),
        ..Default::default()
    }
}

/// Config with a short reconciliation tick.
pub fn ticking_config(secs: u64) -> Config {
    Config {
        reconcile: Some(ReconcileConfig {
            interval_secs: Some(secs),
            ..Default::default()
        }),
        ..test_config()
    }
}

pub fn store_with_policy() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.register_class(CLASS_A, "ClassA");
    store
        .update_objects(
            &json!([
                {"subject": "ClassA", "uri": "/uri/1", "properties": [{"name": "v", "data": 1}]},
                {"subject": "ClassA", "uri": "/uri/2"}
            ]),
            &StoreClient::new("test"),
            PolicyUpdateOp::Replace,
        )
        .unwrap();
    store
}

pub fn start(config: Config, store: Arc<MemoryStore>) -> (PolicyServer, SocketAddr) {
    let mut server = PolicyServer::new(config, store);
    let addr = server.start().unwrap();
    (server, addr)
}

pub async fn agent(addr: SocketAddr, roles: &[&str]) -> PeerClient {
    let mut client = PeerClient::connect(addr).await.unwrap();
    let roles = opflex_server::network::Role::from_names(roles).unwrap();
    let reply = client.identify("agent", roles).await.unwrap();
    assert_eq!(reply.kind, MessageKind::Response, "handshake failed: {:?}", reply);
    client
}

pub async fn next(client: &mut PeerClient) -> Envelope {
    tokio::time::timeout(Duration::from_secs(5), client.next_envelope())
        .await
        .expect("timed out waiting for a message")
        .unwrap()
}

/// Asserts nothing arrives within `ms`.
pub async fn quiet(client: &mut PeerClient, ms: u64) {
    let got = tokio::time::timeout(Duration::from_millis(ms), client.next_envelope()).await;
    assert!(got.is_err(), "unexpected message: {:?}", got);
}

pub fn error_code(env: &Envelope) -> Option<String> {
    assert_eq!(env.kind, MessageKind::ErrorResponse, "expected an error: {:?}", env);
    env.payload.get("code").and_then(Value::as_str).map(String::from)
}

pub fn uris(objects: &Value) -> Vec<String> {
    objects
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|o| o.get("uri").and_then(Value::as_str).map(String::from))
                .collect()
        })
        .unwrap_or_default()
}
