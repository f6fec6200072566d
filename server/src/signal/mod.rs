//! Signaling Layer
//!
//! One WebSocket per browser: bearer-token check before upgrade, a fresh
//! peer id per connection, one receive loop and one serialized writer task.
//! Outbound messages never block business logic; a backlogged client loses
//! messages with a log and a single error notice.

pub mod messages;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use messages::{ClientEvent, Envelope, ServerEvent};

/// Outbound queue depth per client; beyond this, messages are dropped.
const OUTBOUND_QUEUE_CAPACITY: usize = 1000;

/// WebSocket connection query params.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Bearer token issued by the external auth service.
    pub token: String,
}

/// JWT claims verified on connect.
#[derive(Debug, Deserialize)]
struct Claims {
    #[allow(dead_code)]
    sub: String,
    #[allow(dead_code)]
    exp: usize,
}

/// Cloneable sending side of one signaling connection.
#[derive(Clone)]
pub struct ClientHandle {
    /// Server-minted peer id for this connection.
    pub peer_id: Uuid,
    tx: mpsc::Sender<Envelope>,
    overflowed: Arc<AtomicBool>,
}

impl ClientHandle {
    /// Build a handle over an outbound queue.
    #[must_use]
    pub fn new(peer_id: Uuid, tx: mpsc::Sender<Envelope>) -> Self {
        Self {
            peer_id,
            tx,
            overflowed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Enqueue an event. Never blocks; on overrun the message is dropped
    /// with a log and the client is told once.
    pub fn send(&self, event: ServerEvent) {
        self.send_envelope(Envelope::from(event));
    }

    /// Enqueue a pre-built envelope.
    pub fn send_envelope(&self, envelope: Envelope) {
        match self.tx.try_send(envelope) {
            Ok(()) => {
                self.overflowed.store(false, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(peer_id = %self.peer_id, ?dropped, "Outbound queue full, dropping message");
                if !self.overflowed.swap(true, Ordering::Relaxed) {
                    let _ = self.tx.try_send(Envelope::from(ServerEvent::Error {
                        message: "buffer overrun, messages dropped".to_string(),
                    }));
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(peer_id = %self.peer_id, "Client gone, message discarded");
            }
        }
    }
}

/// WebSocket upgrade handler. Invalid tokens are rejected before upgrade.
pub async fn handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Response {
    let key = DecodingKey::from_secret(state.config.auth_token_secret.as_bytes());
    if let Err(e) = decode::<Claims>(&query.token, &key, &Validation::default()) {
        debug!(error = %e, "Rejecting signaling connection: invalid token");
        return Response::builder()
            .status(401)
            .body("UNAUTHORIZED".into())
            .unwrap();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drive one signaling connection until the transport ends.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let peer_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<Envelope>(OUTBOUND_QUEUE_CAPACITY);
    let handle = ClientHandle::new(peer_id, tx);

    state.manager.register_client(handle.clone());
    info!(peer_id = %peer_id, "Signaling client connected");

    handle.send(ServerEvent::PeerId { peer_id });

    // Single writer: everything outbound funnels through one task.
    let sender_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let json = match serde_json::to_string(&envelope) {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "Failed to serialize outbound event");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Single reader: inbound messages are handled in receive order.
    while let Some(message) = ws_receiver.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientEvent>(text.as_str()) {
                Ok(event) => {
                    state.manager.route(peer_id, event).await;
                }
                Err(e) => {
                    debug!(peer_id = %peer_id, error = %e, "Malformed inbound message");
                    handle.send(ServerEvent::Error {
                        message: format!("malformed message: {e}"),
                    });
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(peer_id = %peer_id, error = %e, "Signaling transport error");
                break;
            }
        }
    }

    state.manager.disconnect(peer_id).await;
    sender_task.abort();
    info!(peer_id = %peer_id, "Signaling client disconnected");
}
