//! End-to-end router sessions over real WebSockets.

mod common;

use common::{next, TestServer};
use futures_util::SinkExt;
use huddle_client::{ClientError, RouterClient, RouterEvent};
use huddle_protocol::{codec, PeerHeader};
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

async fn connect(server: &TestServer, identity: &str) -> (RouterClient, tokio::sync::mpsc::UnboundedReceiver<RouterEvent>) {
    let token = server.issue_token(identity);
    RouterClient::connect(&server.connect_url(identity), &token)
        .await
        .unwrap()
}

async fn wait_for_connections(server: &TestServer, expected: usize) {
    for _ in 0..100 {
        if server.state.router.stats().await.unwrap().connection_count == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("router never reached {expected} connections");
}

#[tokio::test]
async fn test_peers_meet_exchange_and_leave() {
    let server = TestServer::start().await;
    let (mut alice, mut alice_events) = connect(&server, "did:plc:alice").await;
    let (mut bob, mut bob_events) = connect(&server, "did:plc:bob").await;

    alice.add_interests(["doc"]).unwrap();
    bob.add_interests(["doc"]).unwrap();

    let RouterEvent::Join {
        identity,
        connection_id: bob_id,
        document,
    } = next(&mut alice_events).await
    else {
        panic!("expected join");
    };
    assert_eq!(identity, "did:plc:bob");
    assert_eq!(document, "doc");

    let RouterEvent::Join {
        identity,
        connection_id: alice_id,
        ..
    } = next(&mut bob_events).await
    else {
        panic!("expected join");
    };
    assert_eq!(identity, "did:plc:alice");
    assert_ne!(alice_id, bob_id);
    assert_eq!(alice.members("doc").len(), 1);

    alice
        .send("did:plc:bob", &bob_id, "doc", &[1, 2, 3])
        .unwrap();
    assert_eq!(
        next(&mut bob_events).await,
        RouterEvent::Data {
            identity: "did:plc:alice".into(),
            connection_id: alice_id.clone(),
            document: "doc".into(),
            body: vec![1, 2, 3].into(),
        }
    );

    bob.close().await;
    assert_eq!(
        next(&mut alice_events).await,
        RouterEvent::Leave {
            identity: "did:plc:bob".into(),
            connection_id: bob_id,
            document: "doc".into(),
        }
    );
    assert!(alice.members("doc").is_empty());

    wait_for_connections(&server, 1).await;
    alice.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_removing_interest_notifies_peer() {
    let server = TestServer::start().await;
    let (mut alice, mut alice_events) = connect(&server, "did:plc:alice").await;
    let (mut bob, mut bob_events) = connect(&server, "did:plc:bob").await;

    alice.add_interests(["d1", "d2"]).unwrap();
    bob.add_interests(["d1", "d2"]).unwrap();
    for _ in 0..2 {
        assert!(matches!(next(&mut alice_events).await, RouterEvent::Join { .. }));
        assert!(matches!(next(&mut bob_events).await, RouterEvent::Join { .. }));
    }

    alice.remove_interests(["d1"]).unwrap();

    let RouterEvent::Leave { identity, document, .. } = next(&mut bob_events).await else {
        panic!("expected leave");
    };
    assert_eq!(identity, "did:plc:alice");
    assert_eq!(document, "d1");
    assert!(alice.members("d1").is_empty());
    assert_eq!(bob.members("d2").len(), 1);

    let stats = server.state.router.stats().await.unwrap();
    assert_eq!(stats.total_interests, 3);

    server.shutdown().await;
}

#[tokio::test]
async fn test_sends_to_wrong_identity_are_dropped() {
    let server = TestServer::start().await;
    let (mut alice, mut alice_events) = connect(&server, "did:plc:alice").await;
    let (mut bob, mut bob_events) = connect(&server, "did:plc:bob").await;

    alice.add_interests(["doc"]).unwrap();
    bob.add_interests(["doc"]).unwrap();
    let RouterEvent::Join { connection_id: bob_id, .. } = next(&mut alice_events).await else {
        panic!("expected join");
    };
    next(&mut bob_events).await;

    alice.send("did:plc:mallory", &bob_id, "doc", b"nope").unwrap();
    alice.send("did:plc:bob", &bob_id, "doc", b"yes").unwrap();

    let RouterEvent::Data { body, .. } = next(&mut bob_events).await else {
        panic!("expected data");
    };
    assert_eq!(&body[..], b"yes");

    server.shutdown().await;
}

#[tokio::test]
async fn test_upgrade_rejections() {
    let server = TestServer::start().await;

    let result = RouterClient::connect(&server.connect_url("did:plc:alice"), "bogus").await;
    assert!(matches!(result, Err(ClientError::Rejected(403))));

    let token = server.issue_token("did:plc:alice");
    let result = RouterClient::connect(&server.connect_url("did:plc:bob"), &token).await;
    assert!(matches!(result, Err(ClientError::Rejected(403))));

    // The token is checked, not consumed.
    let (first, _) = RouterClient::connect(&server.connect_url("did:plc:alice"), &token)
        .await
        .unwrap();
    let (second, _) = RouterClient::connect(&server.connect_url("did:plc:alice"), &token)
        .await
        .unwrap();
    wait_for_connections(&server, 2).await;

    first.close().await;
    second.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_upgrade_without_subprotocol_is_rejected() {
    let server = TestServer::start().await;

    let result = connect_async(server.connect_url("did:plc:alice")).await;

    let Err(WsError::Http(response)) = result else {
        panic!("expected an HTTP rejection");
    };
    assert_eq!(response.status().as_u16(), 403);
    server.shutdown().await;
}

#[tokio::test]
async fn test_expired_token_is_rejected() {
    let mut config = common::config();
    config.auth.token_ttl_secs = 1;
    let server = TestServer::start_with(config).await;
    let token = server.issue_token("did:plc:alice");

    tokio::time::sleep(Duration::from_millis(1200)).await;

    let result = RouterClient::connect(&server.connect_url("did:plc:alice"), &token).await;
    assert!(matches!(result, Err(ClientError::Rejected(403))));
    server.shutdown().await;
}

#[tokio::test]
async fn test_unsafe_dev_token() {
    let mut config = common::config();
    config.auth.unsafe_dev_token = Some("let-me-in".to_string());
    let server = TestServer::start_with(config).await;

    let (client, _) = RouterClient::connect(&server.connect_url("did:plc:anyone"), "let-me-in")
        .await
        .unwrap();
    wait_for_connections(&server, 1).await;

    client.close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_frames_keep_session_open() {
    let server = TestServer::start().await;
    let (mut alice, mut alice_events) = connect(&server, "did:plc:alice").await;
    alice.add_interests(["doc"]).unwrap();

    let token = server.issue_token("did:plc:raw");
    let mut request = server
        .connect_url("did:plc:raw")
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(
        "sec-websocket-protocol",
        format!("authorization, {token}").parse().unwrap(),
    );
    let (mut raw, response) = connect_async(request).await.unwrap();
    assert_eq!(
        response.headers()["sec-websocket-protocol"],
        "authorization"
    );

    // Header length far beyond the frame, then an unknown tag.
    raw.send(Message::Binary(vec![0xff, 0xff, 0x00, 0x00, b'['])).await.unwrap();
    let unknown = br#"["shout","hi"]"#;
    let mut frame = (unknown.len() as u32).to_le_bytes().to_vec();
    frame.extend_from_slice(unknown);
    raw.send(Message::Binary(frame)).await.unwrap();

    // A valid listen sent as a text message still counts.
    let listen = codec::encode(&PeerHeader::listen(["doc"]), b"").unwrap();
    let text = String::from_utf8(listen.to_vec()).unwrap();
    raw.send(Message::Text(text)).await.unwrap();

    let RouterEvent::Join { identity, .. } = next(&mut alice_events).await else {
        panic!("expected join");
    };
    assert_eq!(identity, "did:plc:raw");
    wait_for_connections(&server, 2).await;

    // Dropping the socket without a close frame tears the session down too.
    drop(raw);
    let RouterEvent::Leave { identity, .. } = next(&mut alice_events).await else {
        panic!("expected leave");
    };
    assert_eq!(identity, "did:plc:raw");

    server.shutdown().await;
}

#[tokio::test]
async fn test_router_shutdown_closes_sessions() {
    let server = TestServer::start().await;
    let (_alice, mut alice_events) = connect(&server, "did:plc:alice").await;
    wait_for_connections(&server, 1).await;

    server.shutdown().await;

    let closed = tokio::time::timeout(Duration::from_secs(5), alice_events.recv())
        .await
        .unwrap();
    assert!(closed.is_none());
}
