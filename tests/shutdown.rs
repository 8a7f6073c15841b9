mod common;

use common::*;
use opflex_server::config::{Config, ConnectionConfig};
use opflex_server::error::ServerError;
use opflex_server::network::message::methods;
use opflex_server::store::{ObjectStore, PolicyUpdateOp, Reference, StoreClient};
use serde_json::json;

#[tokio::test]
async fn stop_flushes_queued_updates_before_closing() {
    let (mut server, addr) = start(test_config(), store_with_policy());
    let mut client = agent(addr, &["policy_element"]).await;

    server
        .policy_update(vec![Reference::new(CLASS_A, "/uri/1")], vec![], vec![])
        .unwrap();
    let report = server.stop().unwrap();
    assert_eq!(report.closed, 1);
    assert_eq!(report.flushed, 1);
    assert!(report.truncated.is_empty());

    // the update made it out before the close
    let update = next(&mut client).await;
    assert_eq!(update.method.as_deref(), Some(methods::POLICY_UPDATE));
    assert!(client.next_envelope().await.is_err());
}

#[tokio::test]
async fn stop_reports_what_a_stalled_peer_never_received() {
    let store = store_with_policy();
    let blob = "x".repeat(8 * 1024 * 1024);
    store
        .update_objects(
            &json!([{"subject": "ClassA", "uri": "/big", "properties": [{"name": "blob", "data": blob}]}]),
            &StoreClient::new("test"),
            PolicyUpdateOp::Replace,
        )
        .unwrap();
    let config = Config {
        connection: Some(ConnectionConfig {
            outbound_high_water_bytes: Some(512 * 1024 * 1024),
            drain_timeout_ms: Some(200),
            ..Default::default()
        }),
        ..test_config()
    };
    let (mut server, addr) = start(config, store);
    // handshakes, then never reads again
    let _stalled = agent(addr, &["policy_element"]).await;

    for _ in 0..10 {
        server
            .policy_update(vec![Reference::new(CLASS_A, "/big")], vec![], vec![])
            .unwrap();
    }
    let report = server.stop().unwrap();
    assert_eq!(report.closed, 1);
    assert_eq!(report.flushed, 0);
    assert_eq!(report.truncated.len(), 1);
    assert!(report.truncated[0].1 > 0);
}

#[tokio::test]
async fn lifecycle_errors_are_reported() {
    let mut server = opflex_server::PolicyServer::new(test_config(), store_with_policy());
    assert!(matches!(server.stop(), Err(ServerError::NotRunning)));
    assert!(matches!(
        server.remote_object_updated(CLASS_A, &"/uri/1".into(), PolicyUpdateOp::Replace),
        Err(ServerError::NotRunning)
    ));
    server.start().unwrap();
    assert!(matches!(server.start(), Err(ServerError::AlreadyRunning)));
    assert_ne!(server.port(), 0);
    server.stop().unwrap();
    assert!(!server.is_running());
}

#[tokio::test]
async fn bind_failure_is_escalated() {
    let (first, addr) = start(test_config(), store_with_policy());
    let clash = Config {
        port: addr.port(),
        ..test_config()
    };
    let mut second = opflex_server::PolicyServer::new(clash, store_with_policy());
    assert!(matches!(second.start(), Err(ServerError::Listener(_))));
    drop(first);
}
