use super::{AppState, PresenceEvent};
use crate::error::{GameError, GameResult};
use crate::protocol::{LobbySession, PlayerCount, ServerMessage, SessionUpdatePayload};
use crate::types::*;

impl AppState {
    /// Open a new session hosted by `host`
    pub async fn create_session(
        &self,
        host: &UserRecord,
        settings: SessionSettings,
    ) -> GameResult<SessionRecord> {
        settings.validate().map_err(GameError::Precondition)?;
        if self.store.active_session_of(host.id).await?.is_some() {
            return Err(GameError::precondition(
                "You are already in an active game session and cannot create a new one",
            ));
        }

        let session = self.store.insert_session(settings, host.id).await?;
        self.store.add_player(session.id, host.id, true).await?;
        tracing::info!(
            "{} created session {} ({:?}, {} players)",
            host.username,
            session.id,
            session.category,
            session.players
        );

        self.broadcast(
            &RoomId::lobby(),
            ServerMessage::SessionCreated {
                session: LobbySession {
                    id: session.id,
                    category: session.category.clone(),
                    max_players: session.players,
                    players_current: 1,
                    host_username: host.username.clone(),
                    time_per_question: session.time_per_question,
                    points_to_win: session.points_to_win,
                },
            },
        )
        .await;
        Ok(session)
    }

    /// Join a session. Joining one you already belong to changes nothing.
    pub async fn join_session(&self, session_id: SessionId, user: &UserRecord) -> GameResult<()> {
        let session = self.session_or_404(session_id).await?;
        if !session.active {
            return Err(GameError::SessionInactive);
        }
        let players = self.store.players(session_id).await?;
        if players.iter().any(|p| p.user_id == user.id) {
            tracing::debug!("{} is already in session {}", user.username, session_id);
            return Ok(());
        }
        if let Some(other) = self.store.active_session_of(user.id).await? {
            if other != session_id {
                return Err(GameError::precondition(
                    "You are already in another active session",
                ));
            }
        }
        if players.len() >= session.players as usize {
            return Err(GameError::precondition(
                "Max number of players for this session has been reached",
            ));
        }

        self.store.add_player(session_id, user.id, false).await?;
        tracing::info!("{} joined session {}", user.username, session_id);

        self.broadcast_player_count(&session, players.len() + 1).await;
        self.broadcast_presence(&RoomId::session(session_id), &user.username, PresenceEvent::Joined)
            .await?;
        Ok(())
    }

    /// Leave a session, dropping the member's score and presence
    pub async fn leave_session(&self, session_id: SessionId, user: &UserRecord) -> GameResult<()> {
        let session = self.session_or_404(session_id).await?;
        self.store.remove_player(session_id, user.id).await?;
        let room = RoomId::session(session_id);
        self.remove_presence(&room, &user.username).await;
        tracing::info!("{} left session {}", user.username, session_id);

        let remaining = self.store.players(session_id).await?.len();
        self.broadcast_player_count(&session, remaining).await;
        self.broadcast_presence(&room, &user.username, PresenceEvent::Left)
            .await?;
        Ok(())
    }

    /// Delete a session nobody but the host is in
    pub async fn delete_session(&self, session_id: SessionId, user: &UserRecord) -> GameResult<()> {
        let session = self.session_or_404(session_id).await?;
        Self::require_host(&session, user, "delete this session")?;
        if self.store.players(session_id).await?.len() > 1 {
            return Err(GameError::precondition(
                "Cannot delete session with multiple users",
            ));
        }

        self.store.delete_session(session_id).await?;
        self.drop_session_flags(session_id).await;
        tracing::info!("{} deleted session {}", user.username, session_id);

        self.broadcast(&RoomId::lobby(), ServerMessage::SessionDeleted { session_id })
            .await;
        Ok(())
    }

    /// Edit the settings of a session that has not started. Returns whether
    /// anything changed.
    pub async fn update_session_details(
        &self,
        session_id: SessionId,
        user: &UserRecord,
        settings: SessionSettings,
    ) -> GameResult<bool> {
        let session = self.session_or_404(session_id).await?;
        Self::require_host(&session, user, "edit the session")?;
        settings.validate().map_err(GameError::Precondition)?;

        if self.store.prompt_count(session_id).await? > 0 {
            return Err(GameError::precondition(
                "Cannot edit session settings after the game has started.",
            ));
        }
        let user_count = self.store.players(session_id).await?.len();
        if (settings.players as usize) < user_count {
            return Err(GameError::precondition(format!(
                "Cannot reduce player count to {}, because {} player(s) already joined.",
                settings.players, user_count
            )));
        }
        if session.settings() == settings {
            tracing::debug!("Session {} settings unchanged", session_id);
            return Ok(false);
        }

        self.store
            .update_session_settings(session_id, settings.clone())
            .await?;
        tracing::info!("Session {} settings updated: {:?}", session_id, settings);

        self.broadcast(
            &RoomId::lobby(),
            ServerMessage::SessionDetailsUpdated {
                session_id,
                user_count,
                new_category: settings.category.clone(),
                new_max_players: settings.players,
                new_time_per_question: None,
                new_points_to_win: None,
            },
        )
        .await;
        self.broadcast(
            &RoomId::session(session_id),
            ServerMessage::SessionDetailsUpdated {
                session_id,
                user_count,
                new_category: settings.category,
                new_max_players: settings.players,
                new_time_per_question: Some(settings.time_per_question),
                new_points_to_win: Some(settings.points_to_win),
            },
        )
        .await;
        Ok(true)
    }

    /// Active sessions as listed in the lobby
    pub async fn list_active_sessions(&self) -> GameResult<Vec<LobbySession>> {
        let mut listed = Vec::new();
        for session in self.store.active_sessions().await? {
            let players = self.store.players(session.id).await?;
            let host_username = players
                .iter()
                .find(|p| p.user_id == session.host_id)
                .map(|p| p.username.clone())
                .unwrap_or_default();
            listed.push(LobbySession {
                id: session.id,
                category: session.category,
                max_players: session.players,
                players_current: players.len(),
                host_username,
                time_per_question: session.time_per_question,
                points_to_win: session.points_to_win,
            });
        }
        Ok(listed)
    }

    async fn broadcast_player_count(&self, session: &SessionRecord, user_count: usize) {
        self.broadcast(
            &RoomId::lobby(),
            ServerMessage::SessionUpdate {
                payload: SessionUpdatePayload::PlayerCount {
                    player_count: PlayerCount {
                        session_id: session.id,
                        user_count,
                        max_players: session.players,
                    },
                },
            },
        )
        .await;
    }
}
