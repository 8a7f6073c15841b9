mod common;

use common::*;
use opflex_server::network::message::{methods, MessageKind};
use opflex_server::network::PeerClient;
use serde_json::json;
use std::time::Duration;

fn frame(doc: serde_json::Value) -> Vec<u8> {
    let mut bytes = serde_json::to_vec(&doc).unwrap();
    bytes.push(0);
    bytes
}

#[tokio::test]
async fn frames_split_across_writes_are_reassembled() {
    let (mut server, addr) = start(test_config(), store_with_policy());
    let mut client = PeerClient::connect(addr).await.unwrap();

    let bytes = frame(json!({
        "method": methods::SEND_IDENTITY,
        "params": [{"name": "slow", "domain": "d", "my_role": "policy_element"}],
        "id": "hs"
    }));
    for chunk in bytes.chunks(7) {
        client.send_raw(chunk).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let reply = next(&mut client).await;
    assert_eq!(reply.kind, MessageKind::Response);
    assert_eq!(reply.id, Some(json!("hs")));
    server.stop().unwrap();
}

#[tokio::test]
async fn several_frames_in_one_write_are_answered_in_order() {
    let (mut server, addr) = start(test_config(), store_with_policy());
    let mut client = agent(addr, &["policy_element"]).await;

    let mut bytes = frame(json!({"method": "echo", "params": ["a"], "id": 100}));
    bytes.push(0); // empty frames are ignored
    bytes.extend(frame(json!({"method": "echo", "params": ["b"], "id": 101})));
    client.send_raw(&bytes).await.unwrap();

    let first = next(&mut client).await;
    let second = next(&mut client).await;
    assert_eq!((first.id, first.payload), (Some(json!(100)), json!(["a"])));
    assert_eq!((second.id, second.payload), (Some(json!(101)), json!(["b"])));
    server.stop().unwrap();
}

#[tokio::test]
async fn bad_frames_do_not_close_the_connection() {
    let (mut server, addr) = start(test_config(), store_with_policy());
    let mut client = agent(addr, &["policy_element"]).await;

    // id recoverable: answered with EPARSE
    client
        .send_raw(&frame(json!({"method": 42, "params": [], "id": 7})))
        .await
        .unwrap();
    let reply = next(&mut client).await;
    assert_eq!(error_code(&reply).as_deref(), Some("EPARSE"));
    assert_eq!(reply.id, Some(json!(7)));

    // not JSON at all: logged only
    client.send_raw(b"{not json\0").await.unwrap();
    let echo = client.call(methods::ECHO, json!("ok")).await.unwrap();
    assert_eq!(echo.payload, json!(["ok"]));
    server.stop().unwrap();
}
