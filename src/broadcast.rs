use crate::protocol::ServerMessage;
use crate::state::AppState;
use crate::types::RoomId;

impl AppState {
    /// Fan a message out to every connection of a room.
    ///
    /// Senders are snapshotted first so no room lock is held while
    /// delivering. A connection whose channel is closed is pruned the same
    /// way a disconnect would be. Returns the number of deliveries.
    pub async fn broadcast(&self, room: &RoomId, message: ServerMessage) -> usize {
        let targets = self.connections_of(room).await;
        let mut delivered = 0;
        let mut dead = Vec::new();

        for (conn_id, tx) in targets {
            if tx.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(conn_id);
            }
        }

        for conn_id in dead {
            tracing::warn!("[{}] Dropping dead connection {}", room, conn_id);
            self.leave(room, conn_id).await;
        }
        delivered
    }
}
