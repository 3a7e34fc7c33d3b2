pub mod handlers;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::protocol::ServerMessage;
use crate::state::AppState;
use crate::types::RoomId;

/// WebSocket upgrade handler for `/ws/{room}`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(room): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    tracing::info!("WebSocket connection request for room {}", room);
    ws.on_upgrade(move |socket| handle_socket(socket, RoomId::new(room), state))
}

/// Handle one room connection until the client goes away
async fn handle_socket(socket: WebSocket, room: RoomId, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let conn_id = state.join(&room, tx.clone()).await;

    // Everything addressed to this connection, broadcasts and replies alike
    let mut writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("Failed to serialize outbound message: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut writer => {
                tracing::debug!("[{}] Writer for {} stopped", room, conn_id);
                break;
            }
            ws_msg = receiver.next() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!("[{}] Received message: {}", room, text.as_str());
                        if let Some(reply) =
                            handlers::handle_text(&state, &room, conn_id, text.as_str()).await
                        {
                            if tx.send(reply).is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!("[{}] WebSocket closed by {}", room, conn_id);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("[{}] WebSocket error on {}: {}", room, conn_id, e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    state.leave(&room, conn_id).await;
    writer.abort();
    tracing::info!("[{}] Connection {} closed", room, conn_id);
}
