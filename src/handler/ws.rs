//! WebSocket push: one subscriber per call.

use crate::app::AppState;
use crate::push::PushRegistry;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(rename = "callId")]
    call_id: String,
}

async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let push = state.push.clone();
    ws.on_upgrade(move |socket| handle_push(socket, push, query.call_id))
}

async fn handle_push(socket: WebSocket, push: Arc<PushRegistry>, call_id: String) {
    let mut rx = match push.attach(&call_id) {
        Ok(rx) => rx,
        Err(e) => {
            // a second subscriber for the same call is rejected
            let (mut sender, _) = socket.split();
            let error_message = json!({
                "callId": call_id,
                "error": e.to_string(),
            });
            let text = serde_json::to_string(&error_message)
                .unwrap_or_else(|_| r#"{"error":"push session rejected"}"#.to_string());
            sender.send(Message::Text(text.into())).await.ok();
            sender.send(Message::Close(None)).await.ok();
            return;
        }
    };
    info!(call_id, "push session attached");

    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(text) => {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        debug!(call_id, "push socket write failed");
                        break;
                    }
                }
                None => {
                    // the registry closed the session
                    sender.send(Message::Close(None)).await.ok();
                    break;
                }
            },
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Close(_))) | None => {
                    info!(call_id, "push socket closed by client");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(call_id, "push socket error: {}", e);
                    break;
                }
            },
        }
    }
}
