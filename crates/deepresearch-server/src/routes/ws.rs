use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use deepresearch_core::Session;
use deepresearch_schema::wire::{ClientMessage, ServerMessage};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::warn;

use crate::dispatch::Dispatcher;
use crate::protocol::ConnectionDriver;
use crate::queue::{OutgoingQueue, MIN_QUEUE_CAPACITY};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    user: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/connect", get(connect))
}

async fn connect(ws: WebSocketUpgrade, Query(query): Query<ConnectQuery>, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.user))
}

async fn handle_socket(socket: WebSocket, state: AppState, user: Option<String>) {
    let user_id = user.clone().unwrap_or_else(|| "anonymous".to_string());
    let session = Arc::new(Session::new(user));
    let queue = Arc::new(OutgoingQueue::new(MIN_QUEUE_CAPACITY));
    let dispatcher = Dispatcher {
        orchestrator: Arc::clone(&state.orchestrator),
        llm: Arc::clone(&state.llm),
        memory: Arc::clone(&state.memory),
        persona_store: Arc::clone(&state.persona_store),
        preferences_store: Arc::clone(&state.preferences_store),
        chat_history: Arc::clone(&state.chat_history),
        user: user_id,
        remote_sync: state.remote_sync,
    };
    let driver = Arc::new(ConnectionDriver::new(session, Arc::clone(&queue), dispatcher));

    let (mut sink, mut stream) = socket.split();

    let writer_queue = Arc::clone(&queue);
    let writer = tokio::spawn(async move {
        loop {
            let message = writer_queue.pop().await;
            let Ok(json) = serde_json::to_string(&message) else { continue };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    queue.push(ServerMessage::Connection { connected: true }).await;

    while let Some(Ok(frame)) = stream.next().await {
        let text = match frame {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };
        let parsed: Result<ClientMessage, _> = serde_json::from_str(&text);
        let keep_open = match parsed {
            Ok(client_message) => driver.handle(client_message).await,
            Err(e) => {
                warn!(error = %e, "failed to decode client frame");
                queue
                    .push(ServerMessage::Error { code: 3, message: "unknown message type".to_string() })
                    .await;
                true
            }
        };
        if !keep_open {
            break;
        }
    }

    writer.abort();
}
