use super::AppState;
use crate::protocol::ServerMessage;
use crate::types::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// A live client channel bound to one room
#[derive(Debug)]
pub struct Connection {
    /// Set once the client reports presence
    pub username: Option<String>,
    pub tx: mpsc::UnboundedSender<ServerMessage>,
}

#[derive(Debug, Default)]
pub struct Room {
    pub connections: HashMap<ConnId, Connection>,
    /// Last reported page per username
    pub presence: HashMap<String, PageLabel>,
    /// Outstanding offline timers: username -> generation
    pub(crate) pending_offline: HashMap<String, u64>,
    /// Set when the room is evicted; late writers must treat it as gone
    pub(crate) closed: bool,
}

impl Room {
    /// Every present player reports the game page
    pub fn is_ready(&self) -> bool {
        !self.presence.is_empty()
            && self
                .presence
                .values()
                .all(|page| *page == PageLabel::GamePage)
    }

    /// Whether any live connection is attributed to `username`
    pub fn has_connection_for(&self, username: &str) -> bool {
        self.connections
            .values()
            .any(|c| c.username.as_deref() == Some(username))
    }
}

impl AppState {
    pub(crate) async fn room(&self, room: &RoomId) -> Option<Arc<RwLock<Room>>> {
        self.rooms.read().await.get(room).cloned()
    }

    /// Register a connection, creating the room on first use
    pub async fn join(&self, room: &RoomId, tx: mpsc::UnboundedSender<ServerMessage>) -> ConnId {
        let conn_id = ConnId::new();
        let mut rooms = self.rooms.write().await;
        let entry = rooms.entry(room.clone()).or_default().clone();
        entry.write().await.connections.insert(
            conn_id,
            Connection {
                username: None,
                tx,
            },
        );
        tracing::info!("Connection {} joined room {}", conn_id, room);
        conn_id
    }

    /// Remove a connection. An emptied room is discarded together with its
    /// presence map and the round flags of its session; otherwise the
    /// connection's user gets an offline check.
    pub async fn leave(&self, room: &RoomId, conn_id: ConnId) {
        let (username, emptied) = {
            let mut rooms = self.rooms.write().await;
            let Some(entry) = rooms.get(room).cloned() else {
                return;
            };
            let mut guard = entry.write().await;
            let Some(conn) = guard.connections.remove(&conn_id) else {
                return;
            };
            let emptied = guard.connections.is_empty();
            if emptied {
                guard.closed = true;
                guard.presence.clear();
                guard.pending_offline.clear();
                drop(guard);
                rooms.remove(room);
            }
            (conn.username, emptied)
        };

        tracing::info!("Connection {} left room {}", conn_id, room);

        if emptied {
            tracing::info!("Room {} is empty, discarding it", room);
            if let Some(session_id) = room.session_id() {
                self.drop_session_flags(session_id).await;
            }
            return;
        }

        if let Some(username) = username {
            self.mark_may_be_offline(room, &username).await;
        }
    }

    /// Senders of every live connection in the room
    pub async fn connections_of(
        &self,
        room: &RoomId,
    ) -> Vec<(ConnId, mpsc::UnboundedSender<ServerMessage>)> {
        let Some(entry) = self.room(room).await else {
            return Vec::new();
        };
        let guard = entry.read().await;
        guard
            .connections
            .iter()
            .map(|(id, conn)| (*id, conn.tx.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::*;

    #[tokio::test]
    async fn test_join_creates_room_and_leave_discards_it() {
        let (state, _store) = test_state();
        let room = RoomId::new("session_1");

        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = state.join(&room, tx).await;
        assert_eq!(state.connections_of(&room).await.len(), 1);

        state.leave(&room, conn).await;
        assert!(state.room(&room).await.is_none());
        assert!(state.connections_of(&room).await.is_empty());
    }

    #[tokio::test]
    async fn test_leave_unknown_connection_is_noop() {
        let (state, _store) = test_state();
        let room = RoomId::new("session_1");
        let (tx, _rx) = mpsc::unbounded_channel();
        state.join(&room, tx).await;

        state.leave(&room, ConnId::new()).await;
        state.leave(&RoomId::new("session_2"), ConnId::new()).await;
        assert_eq!(state.connections_of(&room).await.len(), 1);
    }

    #[tokio::test]
    async fn test_emptied_room_drops_session_round_flags() {
        let (state, _store) = test_state();
        let room = RoomId::session(9);
        state.set_flag(9, 1, RoundFlag::new(RoundState::Voting)).await;
        state.set_flag(10, 1, RoundFlag::new(RoundState::Voting)).await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = state.join(&room, tx).await;
        state.leave(&room, conn).await;

        let flags = state.round_flags.read().await;
        assert!(!flags.contains_key(&(9, 1)));
        assert!(flags.contains_key(&(10, 1)));
    }

    #[test]
    fn test_ready_requires_everyone_on_game_page() {
        let mut room = Room::default();
        assert!(!room.is_ready());

        room.presence
            .insert("ana".to_string(), PageLabel::GamePage);
        assert!(room.is_ready());

        room.presence.insert("bo".to_string(), PageLabel::Offline);
        assert!(!room.is_ready());
    }
}
