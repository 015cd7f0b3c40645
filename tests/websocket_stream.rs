//! AlpacaNewsStream against a local websocket server speaking the news protocol

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use news_ingest::streaming::{AlpacaNewsStream, FeedError, FeedEvent, StreamProvider};
use news_ingest::{RawMessage, SubscriptionScope};

#[derive(Clone, Copy)]
enum Script {
    /// Authenticate, acknowledge the subscription, push two news items
    Serve,
    /// Same as `Serve`, with the news batch sent as a binary frame
    ServeBinary,
    RejectAuth,
    /// Close right after the subscription request
    DropAfterSubscribe,
}

/// Spawns a one-connection server; the handle yields every text frame the
/// client sent.
async fn spawn_server(script: Script) -> (String, JoinHandle<Vec<Value>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        let mut received = Vec::new();

        ws.send(Message::Text(json!([{"T": "success", "msg": "connected"}]).to_string()))
            .await
            .unwrap();

        while let Some(Ok(frame)) = ws.next().await {
            let Message::Text(text) = frame else { continue };
            let request: Value = serde_json::from_str(&text).unwrap();
            received.push(request.clone());

            match (request["action"].as_str(), script) {
                (Some("auth"), Script::RejectAuth) => {
                    let reply = json!([{"T": "error", "code": 402, "msg": "auth failed"}]);
                    ws.send(Message::Text(reply.to_string())).await.unwrap();
                    break;
                }
                (Some("auth"), _) => {
                    let reply = json!([{"T": "success", "msg": "authenticated"}]);
                    ws.send(Message::Text(reply.to_string())).await.unwrap();
                }
                (Some("subscribe"), Script::DropAfterSubscribe) => {
                    let _ = ws.close(None).await;
                    break;
                }
                (Some("subscribe"), _) => {
                    let ack = json!([{"T": "subscription", "news": request["news"]}]);
                    ws.send(Message::Text(ack.to_string())).await.unwrap();
                    let news = json!([
                        {"T": "n", "id": 1, "headline": "first"},
                        {"T": "n", "id": 2, "headline": "second"},
                    ]);
                    let frame = match script {
                        Script::ServeBinary => Message::Binary(serde_json::to_vec(&news).unwrap()),
                        _ => Message::Text(news.to_string()),
                    };
                    ws.send(frame).await.unwrap();
                }
                _ => {}
            }
        }
        received
    });

    (url, handle)
}

async fn next_message(rx: &mut mpsc::Receiver<FeedEvent>) -> FeedEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for feed event")
        .expect("feed channel closed")
}

#[tokio::test]
async fn test_authenticates_and_subscribes_once() {
    let (url, server) = spawn_server(Script::Serve).await;
    let mut stream = AlpacaNewsStream::new(url, "key-id", "secret");
    let (tx, mut rx) = mpsc::channel(16);

    stream.connect().await.unwrap();
    stream.subscribe(&SubscriptionScope::All, tx.clone()).await.unwrap();
    stream.subscribe(&SubscriptionScope::All, tx).await.unwrap();

    for expected in [1, 2] {
        match next_message(&mut rx).await {
            FeedEvent::Message(RawMessage::Structured(value)) => assert_eq!(value["id"], expected),
            other => panic!("unexpected event {other:?}"),
        }
    }

    stream.disconnect().await.unwrap();
    let received = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();

    assert_eq!(
        received[0],
        json!({"action": "auth", "key": "key-id", "secret": "secret"})
    );
    let subscribes: Vec<_> = received
        .iter()
        .filter(|r| r["action"] == "subscribe")
        .collect();
    assert_eq!(subscribes.len(), 1);
    assert_eq!(subscribes[0]["news"], json!(["*"]));
}

#[tokio::test]
async fn test_binary_batch_frame_yields_each_news_item() {
    let (url, _server) = spawn_server(Script::ServeBinary).await;
    let mut stream = AlpacaNewsStream::new(url, "key-id", "secret");
    let (tx, mut rx) = mpsc::channel(16);

    stream.connect().await.unwrap();
    stream.subscribe(&SubscriptionScope::All, tx).await.unwrap();

    for expected in [1, 2] {
        match next_message(&mut rx).await {
            FeedEvent::Message(RawMessage::Structured(value)) => {
                assert_eq!(value["id"], expected);
                assert_eq!(value["T"], "n");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    stream.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_rejected_credentials_surface_as_auth_error() {
    let (url, _server) = spawn_server(Script::RejectAuth).await;
    let mut stream = AlpacaNewsStream::new(url, "bad", "creds");

    let err = stream.connect().await.unwrap_err();
    assert!(err.is_auth(), "expected auth error, got {err:?}");
}

#[tokio::test]
async fn test_server_close_is_reported_as_disconnect() {
    let (url, _server) = spawn_server(Script::DropAfterSubscribe).await;
    let mut stream = AlpacaNewsStream::new(url, "key-id", "secret");
    let (tx, mut rx) = mpsc::channel(16);

    stream.connect().await.unwrap();
    stream.subscribe(&SubscriptionScope::All, tx).await.unwrap();

    assert!(matches!(next_message(&mut rx).await, FeedEvent::Disconnected(_)));
    stream.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_server_is_a_connect_error() {
    let mut stream = AlpacaNewsStream::new("ws://127.0.0.1:1", "key-id", "secret")
        .with_handshake_timeout(Duration::from_secs(2));
    assert!(matches!(stream.connect().await, Err(FeedError::Connect(_))));
}
