//! End-to-end signaling tests over a real WebSocket.
//!
//! These run the full axum router against an ephemeral port; no database or
//! external collaborator is needed.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use tokio_tungstenite::tungstenite::Message;

use ca_server::agent::UnconfiguredCustomerDirectory;
use ca_server::app::{create_router, AppState};
use ca_server::config::Config;
use ca_server::llm::UnconfiguredLlm;
use ca_server::persistence::MemoryPersistence;
use ca_server::room::{Collaborators, RoomManager};
use ca_server::vector::{UnconfiguredEmbedder, UnconfiguredVectorStore};

#[derive(Serialize)]
struct Claims {
    sub: String,
    exp: usize,
}

fn make_token(secret: &str) -> String {
    let claims = Claims {
        sub: "test-user".into(),
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

async fn spawn_server() -> (String, Arc<RoomManager>) {
    let config = Arc::new(Config::default_for_test());
    let manager = Arc::new(
        RoomManager::new(
            Arc::clone(&config),
            Collaborators {
                persistence: Arc::new(MemoryPersistence::new()),
                llm: Arc::new(UnconfiguredLlm),
                vector: Arc::new(UnconfiguredVectorStore),
                embedder: Arc::new(UnconfiguredEmbedder),
                customers: Arc::new(UnconfiguredCustomerDirectory),
                stt: None,
            },
        )
        .unwrap(),
    );

    let app = create_router(AppState::new(config, Arc::clone(&manager)));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("ws://{addr}/ws"), manager)
}

async fn next_json(
    stream: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
) -> serde_json::Value {
    loop {
        let message = tokio::time::timeout(std::time::Duration::from_secs(5), stream.next())
            .await
            .expect("server stalled")
            .expect("stream ended")
            .expect("transport error");
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn invalid_token_is_rejected_before_upgrade() {
    let (url, _manager) = spawn_server().await;

    let result = tokio_tungstenite::connect_async(format!("{url}?token=garbage")).await;
    assert!(result.is_err(), "handshake must fail without a valid token");
}

#[tokio::test]
async fn connection_mints_peer_id_and_joins_room() {
    let (url, manager) = spawn_server().await;
    let token = make_token("test-secret");

    let (ws, _) = tokio_tungstenite::connect_async(format!("{url}?token={token}"))
        .await
        .expect("valid token connects");
    let (mut sink, mut stream) = ws.split();

    let first = next_json(&mut stream).await;
    assert_eq!(first["type"], "peer_id");
    let peer_id = first["data"]["peer_id"].as_str().unwrap().to_string();
    assert!(!peer_id.is_empty());

    sink.send(Message::Text(
        serde_json::json!({
            "type": "join_room",
            "data": {"room_name": "통합", "nickname": "고객이"}
        })
        .to_string()
        .into(),
    ))
    .await
    .unwrap();

    let joined = next_json(&mut stream).await;
    assert_eq!(joined["type"], "room_joined");
    assert_eq!(joined["data"]["room_name"], "통합");
    assert_eq!(joined["data"]["peer_count"], 1);

    let ready = next_json(&mut stream).await;
    assert_eq!(ready["type"], "agent_ready");
    assert_eq!(ready["data"]["llm_available"], false);

    assert_eq!(manager.room_count().await, 1);

    // Transport close acts as leave; the empty room is destroyed.
    sink.send(Message::Close(None)).await.unwrap();
    drop(sink);
    drop(stream);
    for _ in 0..100 {
        if manager.room_count().await == 0 {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("room not destroyed after disconnect");
}

#[tokio::test]
async fn malformed_message_gets_error_without_disconnect() {
    let (url, _manager) = spawn_server().await;
    let token = make_token("test-secret");

    let (ws, _) = tokio_tungstenite::connect_async(format!("{url}?token={token}"))
        .await
        .unwrap();
    let (mut sink, mut stream) = ws.split();
    let _peer_id = next_json(&mut stream).await;

    sink.send(Message::Text("{not json".to_string().into()))
        .await
        .unwrap();

    let error = next_json(&mut stream).await;
    assert_eq!(error["type"], "error");

    // The connection survived the protocol error.
    sink.send(Message::Text(
        serde_json::json!({
            "type": "join_room",
            "data": {"room_name": "계속", "nickname": "고객이"}
        })
        .to_string()
        .into(),
    ))
    .await
    .unwrap();
    let joined = next_json(&mut stream).await;
    assert_eq!(joined["type"], "room_joined");
}
