use super::{AppState, PresenceEvent};
use crate::error::GameResult;
use crate::types::*;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::Ordering;

impl AppState {
    /// Record the page of `username` and attribute the connection to it.
    /// A pending offline timer for the user is cancelled. Returns `false`
    /// when the room no longer exists.
    pub async fn set_presence(
        &self,
        room: &RoomId,
        conn_id: ConnId,
        username: &str,
        page: PageLabel,
    ) -> bool {
        let Some(entry) = self.room(room).await else {
            return false;
        };
        let mut guard = entry.write().await;
        if guard.closed {
            return false;
        }
        if let Some(conn) = guard.connections.get_mut(&conn_id) {
            conn.username = Some(username.to_string());
        }
        guard.presence.insert(username.to_string(), page);
        if guard.pending_offline.remove(username).is_some() {
            tracing::debug!("[{}] Cancelled pending offline check for {}", room, username);
        }
        true
    }

    /// Inbound presence report: record it, announce it, and pause the running
    /// round if the room stopped being ready
    pub async fn presence_update(
        &self,
        room: &RoomId,
        conn_id: ConnId,
        username: &str,
        page: PageLabel,
    ) -> GameResult<()> {
        if !self.set_presence(room, conn_id, username, page).await {
            tracing::debug!("[{}] Presence for {} arrived after the room closed", room, username);
            return Ok(());
        }
        self.broadcast_presence(room, username, PresenceEvent::PresenceUpdate)
            .await?;
        self.pause_if_not_ready(room).await;
        Ok(())
    }

    /// Schedule an offline check for `username`. The user only reads offline
    /// if, when the grace period ends, no newer presence arrived and no
    /// connection in the room is attributed to them.
    pub async fn mark_may_be_offline(&self, room: &RoomId, username: &str) {
        let Some(entry) = self.room(room).await else {
            return;
        };
        let generation = self.offline_seq.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut guard = entry.write().await;
            if guard.closed {
                return;
            }
            guard
                .pending_offline
                .insert(username.to_string(), generation);
        }
        tracing::debug!(
            "[{}] {} may be offline, checking in {:?}",
            room,
            username,
            self.config.offline_grace
        );
        tokio::spawn(offline_timer(
            self.clone(),
            room.clone(),
            username.to_string(),
            generation,
        ));
    }

    /// Flip the user to offline if `generation` is still the current timer.
    /// Check and write happen under one room lock.
    async fn apply_offline(&self, room: &RoomId, username: &str, generation: u64) -> bool {
        let Some(entry) = self.room(room).await else {
            tracing::debug!("[{}] Room gone before offline check for {}", room, username);
            return false;
        };
        let mut guard = entry.write().await;
        if guard.closed {
            return false;
        }
        if guard.pending_offline.get(username) != Some(&generation) {
            tracing::debug!("[{}] Stale offline check for {}", room, username);
            return false;
        }
        guard.pending_offline.remove(username);
        if guard.has_connection_for(username) {
            tracing::debug!("[{}] {} reconnected, staying online", room, username);
            return false;
        }
        guard
            .presence
            .insert(username.to_string(), PageLabel::Offline);
        tracing::info!("[{}] Marking {} as offline", room, username);
        true
    }

    /// True iff the room has presence entries and all of them read `game_page`
    pub async fn ready_check(&self, room: &RoomId) -> bool {
        match self.room(room).await {
            Some(entry) => {
                let guard = entry.read().await;
                !guard.closed && guard.is_ready()
            }
            None => false,
        }
    }

    pub async fn presence_of(&self, room: &RoomId) -> HashMap<String, PageLabel> {
        match self.room(room).await {
            Some(entry) => entry.read().await.presence.clone(),
            None => HashMap::new(),
        }
    }

    /// Drop the presence entry of a player who left the session
    pub(crate) async fn remove_presence(&self, room: &RoomId, username: &str) {
        if let Some(entry) = self.room(room).await {
            let mut guard = entry.write().await;
            guard.presence.remove(username);
            guard.pending_offline.remove(username);
        }
    }
}

/// Timer task body. A plain fn returning a boxed future keeps the spawned
/// type concrete, since the timer ends up broadcasting, which can prune
/// connections, which schedules timers.
fn offline_timer(
    state: AppState,
    room: RoomId,
    username: String,
    generation: u64,
) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        tokio::time::sleep(state.config.offline_grace).await;
        if !state.apply_offline(&room, &username, generation).await {
            return;
        }
        if let Err(e) = state
            .broadcast_presence(&room, &username, PresenceEvent::Offline)
            .await
        {
            tracing::warn!("[{}] Offline broadcast for {} failed: {}", room, username, e);
        }
        state.pause_if_not_ready(&room).await;
    })
}
