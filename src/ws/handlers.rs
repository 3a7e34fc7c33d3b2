//! Inbound websocket message dispatch

use crate::protocol::{ClientMessage, Inbound, ServerMessage};
use crate::state::AppState;
use crate::types::*;

/// Handle one text frame and return the reply for the sender, if any
pub async fn handle_text(
    state: &AppState,
    room: &RoomId,
    conn_id: ConnId,
    text: &str,
) -> Option<ServerMessage> {
    let inbound = match Inbound::parse(text) {
        Ok(inbound) => inbound,
        Err(e) => {
            tracing::warn!("[{}] Failed to parse client message: {}", room, e);
            return Some(ServerMessage::Error {
                code: "PARSE_ERROR".to_string(),
                msg: format!("Invalid message format: {}", e),
            });
        }
    };

    match inbound {
        Inbound::Client(ClientMessage::PresenceUpdate { username, page }) => {
            let username = username.trim();
            if username.is_empty() {
                tracing::warn!("[{}] Presence update without username ignored", room);
                return None;
            }
            let page = PageLabel::from(page.trim().to_string());
            match state.presence_update(room, conn_id, username, page).await {
                Ok(()) => None,
                Err(e) => {
                    tracing::error!("[{}] Presence update for {} failed: {}", room, username, e);
                    Some(ServerMessage::Error {
                        code: e.code().to_string(),
                        msg: e.public_detail(),
                    })
                }
            }
        }
        Inbound::Other(message) => Some(ServerMessage::Echo { message }),
    }
}
