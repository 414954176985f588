mod common;

use common::{ relay_with, StubClient };
use futures::{ SinkExt, Stream, StreamExt };
use serde_json::{ json, Value };
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{ accept_async, connect_async };

use jlpt_tutor::models::generation::GenerationParameters;
use jlpt_tutor::server::websocket::handle_connection;

/// Serves exactly one connection and returns its `ws://` URL.
async fn serve_once(client: StubClient) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let relay = Arc::new(relay_with(Arc::new(client)));

    tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        handle_connection(peer, ws, relay, GenerationParameters::default()).await;
    });

    format!("ws://{}", addr)
}

async fn next_json<S>(rx: &mut S) -> Value
    where S: Stream<Item = Result<Message, WsError>> + Unpin
{
    loop {
        match rx.next().await.unwrap().unwrap() {
            Message::Text(text) => {
                return serde_json::from_str(&text).unwrap();
            }
            _ => continue,
        }
    }
}

#[tokio::test]
async fn chat_turn_streams_processing_partials_and_done() {
    let url = serve_once(StubClient::fragments(&["こん", "にち", "は"])).await;
    let (ws, _) = connect_async(url).await.unwrap();
    let (mut tx, mut rx) = ws.split();

    let turn = json!({"type": "chat", "message": "Hi", "level": "n5"});
    tx.send(Message::Text(turn.to_string())).await.unwrap();

    assert_eq!(next_json(&mut rx).await["type"], "processing");
    let mut partials = Vec::new();
    let done = loop {
        let msg = next_json(&mut rx).await;
        match msg["type"].as_str() {
            Some("partial") => partials.push(msg["content"].as_str().unwrap().to_string()),
            Some("done") => {
                break msg;
            }
            other => panic!("unexpected message type {:?}", other),
        }
    };

    assert_eq!(partials, vec!["こん", "こんにち", "こんにちは"]);
    assert_eq!(done["content"], "こんにちは");
    assert!(done["timestamp"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn levels_request_returns_catalog() {
    let url = serve_once(StubClient::fragments(&[])).await;
    let (mut ws, _) = connect_async(url).await.unwrap();

    ws.send(Message::Text(r#"{"type": "levels"}"#.to_string())).await.unwrap();

    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "levels");
    assert_eq!(reply["levels"].as_array().unwrap().len(), 5);
}

#[tokio::test]
async fn bad_input_gets_error_and_connection_stays_open() {
    let url = serve_once(StubClient::fragments(&["ok"])).await;
    let (mut ws, _) = connect_async(url).await.unwrap();

    ws.send(Message::Text("not json".to_string())).await.unwrap();
    assert_eq!(next_json(&mut ws).await["type"], "error");

    let out_of_range = json!({
        "type": "chat",
        "message": "Hi",
        "parameters": {"max_tokens": 0, "temperature": 0.7, "top_p": 0.95}
    });
    ws.send(Message::Text(out_of_range.to_string())).await.unwrap();
    let error = next_json(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert!(error["message"].as_str().unwrap().contains("max_tokens"));

    ws.send(Message::Text(r#"{"type": "chat", "message": "Hi"}"#.to_string())).await.unwrap();
    assert_eq!(next_json(&mut ws).await["type"], "processing");
}

#[tokio::test]
async fn client_leaving_mid_reply_releases_the_upstream_call() {
    let (client, upstream) = StubClient::held();
    let url = serve_once(client).await;
    let (mut ws, _) = connect_async(url).await.unwrap();

    ws.send(Message::Text(r#"{"type": "chat", "message": "Hi"}"#.to_string())).await.unwrap();
    assert_eq!(next_json(&mut ws).await["type"], "processing");

    ws.close(None).await.unwrap();
    drop(ws);

    let released = tokio::time::timeout(Duration::from_secs(3), upstream.closed()).await;
    assert!(released.is_ok(), "upstream stream should be dropped once the client is gone");
}

#[tokio::test]
async fn chat_sent_mid_reply_is_answered_afterwards() {
    let (client, upstream) = StubClient::held();
    let url = serve_once(client).await;
    let (mut ws, _) = connect_async(url).await.unwrap();

    ws.send(Message::Text(r#"{"type": "chat", "message": "Hi"}"#.to_string())).await.unwrap();
    assert_eq!(next_json(&mut ws).await["type"], "processing");
    ws.send(Message::Text(r#"{"type": "levels"}"#.to_string())).await.unwrap();

    upstream.send(Ok("はい".into())).await.unwrap();
    assert_eq!(next_json(&mut ws).await["content"], "はい");
    drop(upstream);

    let done = next_json(&mut ws).await;
    assert_eq!(done["type"], "done");
    assert_eq!(done["content"], "はい");
    assert_eq!(next_json(&mut ws).await["type"], "levels");
}
