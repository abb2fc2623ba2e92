//! End-to-end tests against a broker listening on an ephemeral port.

use std::sync::Arc;
use std::time::Duration;

use esg_sync::server::{router, Broker, BrokerOptions, EventFilter, EventLog};
use esg_sync_core::{Action, ClientEvent, SyncClient, Update};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tempfile::{tempdir, TempDir};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

struct TestServer {
    url: String,
    broker: Arc<Broker>,
    _dir: TempDir,
}

async fn start_server() -> TestServer {
    let dir = tempdir().unwrap();
    let log = EventLog::open(&dir.path().join("events.db")).await.unwrap();
    let broker = Arc::new(Broker::new(Arc::new(log), BrokerOptions::default()));
    let app = router(Arc::clone(&broker));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        url: format!("ws://{}", addr),
        broker,
        _dir: dir,
    }
}

/// Connects `identity` and waits for the broker's acknowledgement.
async fn connected_client(url: &str, identity: &str) -> SyncClient {
    let client = SyncClient::new(url);
    let mut events = client.events();
    client.connect(identity).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(ClientEvent::Acknowledged { user_id }) = events.recv().await {
                assert_eq!(user_id, identity);
                break;
            }
        }
    })
    .await
    .expect("connection was not acknowledged");
    client
}

fn collect_updates(client: &SyncClient, entity_type: &str) -> mpsc::UnboundedReceiver<Update> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.subscribe(entity_type, move |update| {
        let _ = tx.send(update.clone());
    });
    rx
}

#[tokio::test]
async fn test_update_reaches_other_client_only() {
    let server = start_server().await;
    let u1 = connected_client(&server.url, "u1").await;
    let u2 = connected_client(&server.url, "u2").await;
    let mut u1_updates = collect_updates(&u1, "device");
    let mut u2_updates = collect_updates(&u2, "device");

    u1.publish("device", "D1", Action::Update, json!({"status": "active"}))
        .unwrap();

    let update = tokio::time::timeout(Duration::from_secs(5), u2_updates.recv())
        .await
        .expect("u2 received no update")
        .unwrap();
    assert_eq!(update.entity_type, "device");
    assert_eq!(update.entity_id, "D1");
    assert_eq!(update.action, Action::Update);
    assert_eq!(update.payload, json!({"status": "active"}));
    assert_eq!(update.sequence, Some(1));

    // The publisher never hears its own change
    assert!(
        tokio::time::timeout(Duration::from_millis(200), u1_updates.recv())
            .await
            .is_err()
    );

    let records = server.broker.log().query(&EventFilter::default()).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].sequence, 1);
    assert_eq!(records[0].event.origin_identity, "u1");

    u1.disconnect();
    u2.disconnect();
}

#[tokio::test]
async fn test_handshake_without_identity_is_rejected() {
    let server = start_server().await;

    match connect_async(format!("{}/sync", server.url)).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 400);
        }
        Err(e) => panic!("Expected HTTP 400, got {}", e),
        Ok(_) => panic!("Handshake without userId was accepted"),
    }
    assert_eq!(server.broker.connection_count().await, 0);
}

#[tokio::test]
async fn test_ping_is_answered_over_the_socket() {
    let server = start_server().await;
    let (mut ws, _) = connect_async(format!("{}/sync?userId=raw", server.url))
        .await
        .unwrap();

    let ack = ws.next().await.unwrap().unwrap();
    assert_eq!(
        ack.into_text().unwrap().as_str(),
        r#"{"type":"connected","userId":"raw","sequence":0}"#
    );

    // Malformed input is ignored, the connection stays usable
    ws.send(Message::Text("not json".into())).await.unwrap();
    ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply.into_text().unwrap().as_str(), r#"{"type":"pong"}"#);
}

#[tokio::test]
async fn test_second_connection_supersedes_first() {
    let server = start_server().await;
    let url = format!("{}/sync?userId=dup", server.url);

    let (mut first, _) = connect_async(url.as_str()).await.unwrap();
    first.next().await.unwrap().unwrap();

    let (mut second, _) = connect_async(url.as_str()).await.unwrap();
    second.next().await.unwrap().unwrap();

    // The first socket is closed by the broker
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match first.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "superseded connection was not closed");

    assert_eq!(server.broker.registry().identities().await, vec!["dup"]);

    // Broadcasts go to the newer connection
    let publisher = connected_client(&server.url, "publisher").await;
    publisher
        .publish("device", "D9", Action::Create, json!({}))
        .unwrap();
    let update = tokio::time::timeout(Duration::from_secs(5), second.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(update.into_text().unwrap().as_str().contains(r#""entityId":"D9""#));
    publisher.disconnect();
}

#[tokio::test]
async fn test_replay_delivers_missed_events() {
    let server = start_server().await;
    let publisher = connected_client(&server.url, "publisher").await;
    for id in ["D1", "D2", "D3"] {
        publisher
            .publish("device", id, Action::Update, json!({}))
            .unwrap();
    }

    // Wait until all three are logged
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.broker.log().latest_sequence().await.unwrap() != Some(3) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    let (mut ws, _) = connect_async(format!("{}/sync?userId=late", server.url))
        .await
        .unwrap();
    ws.next().await.unwrap().unwrap();
    ws.send(Message::Text(r#"{"type":"replay","since":1}"#.into()))
        .await
        .unwrap();

    let mut sequences = Vec::new();
    for _ in 0..2 {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let value: serde_json::Value =
            serde_json::from_str(frame.into_text().unwrap().as_str()).unwrap();
        sequences.push(value["sequence"].as_i64().unwrap());
    }
    assert_eq!(sequences, vec![2, 3]);
    publisher.disconnect();
}
