mod common;

use common::*;
use opflex_server::network::message::{methods, MessageKind};
use opflex_server::network::{ConnectionState, PeerClient, Role};
use opflex_server::store::Reference;
use serde_json::json;

#[tokio::test]
async fn handshake_then_policy_update_reaches_policy_element() {
    let (mut server, addr) = start(test_config(), store_with_policy());

    let mut client = PeerClient::connect(addr).await.unwrap();
    let reply = client
        .identify("agent-1", Role::POLICY_ELEMENT)
        .await
        .unwrap();
    assert_eq!(reply.kind, MessageKind::Response);
    assert_eq!(reply.id, Some(json!(1)));
    assert_eq!(reply.payload["my_role"], json!(["policy_repository", "endpoint_registry", "observer"]));

    server
        .policy_update(vec![Reference::new(CLASS_A, "/uri/1")], vec![], vec![])
        .unwrap();
    let update = next(&mut client).await;
    assert_eq!(update.kind, MessageKind::Request);
    assert_eq!(update.method.as_deref(), Some(methods::POLICY_UPDATE));
    let body = &update.params()[0];
    assert_eq!(uris(&body["replace"]), vec!["/uri/1"]);
    assert_eq!(body["merge_children"], json!([]));
    assert_eq!(body["delete"], json!([]));

    // the agent's answer resolves the server's pending request
    client.respond(&update, json!({})).await.unwrap();
    let echo = client.call(methods::ECHO, json!("still here")).await.unwrap();
    assert_eq!(echo.payload, json!(["still here"]));

    let conns = server.connections().await.unwrap();
    assert_eq!(conns.len(), 1);
    assert_eq!(conns[0].state, ConnectionState::Ready);
    assert_eq!(conns[0].role, Role::POLICY_ELEMENT);
    assert_eq!(conns[0].pending_requests, 0);
    server.stop().unwrap();
}

#[tokio::test]
async fn policy_updates_skip_non_policy_elements() {
    let (mut server, addr) = start(test_config(), store_with_policy());
    let mut observer = agent(addr, &["observer"]).await;
    let mut element = agent(addr, &["policy_element"]).await;

    server
        .policy_update(vec![Reference::new(CLASS_A, "/uri/2")], vec![], vec![])
        .unwrap();
    let update = next(&mut element).await;
    assert_eq!(update.method.as_deref(), Some(methods::POLICY_UPDATE));
    quiet(&mut observer, 300).await;
    server.stop().unwrap();
}

#[tokio::test]
async fn resolve_returns_the_object_tree() {
    let (mut server, addr) = start(test_config(), store_with_policy());
    let mut client = agent(addr, &["policy_element"]).await;

    let reply = client
        .call(
            methods::POLICY_RESOLVE,
            json!({"subject": "ClassA", "policy_uri": "/uri/1"}),
        )
        .await
        .unwrap();
    assert_eq!(reply.kind, MessageKind::Response);
    assert_eq!(uris(&reply.payload["policy"]), vec!["/uri/1"]);
    assert_eq!(reply.payload["policy"][0]["properties"][0]["data"], 1);

    let missing = client
        .call(
            methods::POLICY_RESOLVE,
            json!({"subject": "NoSuchClass", "policy_uri": "/x"}),
        )
        .await
        .unwrap();
    assert_eq!(error_code(&missing).as_deref(), Some("EINVAL"));
    server.stop().unwrap();
}

#[tokio::test]
async fn endpoint_registry_round_trip() {
    let (mut server, addr) = start(test_config(), store_with_policy());
    let mut client = agent(addr, &["policy_element"]).await;

    let declared = client
        .call(
            methods::ENDPOINT_DECLARE,
            json!({"endpoint": [{"subject": "Endpoint", "uri": "/ep/1"}]}),
        )
        .await
        .unwrap();
    assert_eq!(declared.kind, MessageKind::Response);

    let resolved = client
        .call(
            methods::ENDPOINT_RESOLVE,
            json!({"subject": "Endpoint", "endpoint_uri": "/ep/1"}),
        )
        .await
        .unwrap();
    assert_eq!(uris(&resolved.payload["endpoint"]), vec!["/ep/1"]);

    client
        .call(
            methods::ENDPOINT_UNDECLARE,
            json!({"subject": "Endpoint", "endpoint_uri": "/ep/1"}),
        )
        .await
        .unwrap();
    let gone = client
        .call(
            methods::ENDPOINT_RESOLVE,
            json!({"subject": "Endpoint", "endpoint_uri": "/ep/1"}),
        )
        .await
        .unwrap();
    assert_eq!(gone.payload["endpoint"], json!([]));
    server.stop().unwrap();
}
