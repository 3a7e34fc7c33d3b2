use super::AppState;
use crate::error::GameResult;
use crate::protocol::{PresenceSnapshot, ServerMessage, SessionSnapshot, SessionUpdatePayload};
use crate::types::*;
use std::collections::BTreeMap;
use std::fmt;

/// What caused a presence broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceEvent {
    PresenceUpdate,
    Offline,
    Joined,
    Left,
}

impl PresenceEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceEvent::PresenceUpdate => "presence_update",
            PresenceEvent::Offline => "offline",
            PresenceEvent::Joined => "joined",
            PresenceEvent::Left => "left",
        }
    }
}

impl fmt::Display for PresenceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AppState {
    /// Send the room's presence picture to everyone in it. Session rooms get
    /// the full session snapshot; other rooms only their presence map.
    /// Returns how many connections received it.
    pub async fn broadcast_presence(
        &self,
        room: &RoomId,
        trigger_user: &str,
        event: PresenceEvent,
    ) -> GameResult<usize> {
        let presence = self.presence_of(room).await;

        let snapshot = match room.session_id() {
            Some(session_id) => {
                self.session_snapshot(session_id, &presence, trigger_user, event)
                    .await?
            }
            None => None,
        };

        let payload = match snapshot {
            Some(snapshot) => SessionUpdatePayload::Snapshot(Box::new(snapshot)),
            None => SessionUpdatePayload::Presence(PresenceSnapshot {
                room: room.to_string(),
                presence: presence.into_iter().collect(),
                trigger_user: trigger_user.to_string(),
                trigger_event: event.to_string(),
            }),
        };

        let delivered = self
            .broadcast(room, ServerMessage::SessionUpdate { payload })
            .await;
        tracing::debug!(
            "[{}] Presence broadcast ({} by {}) reached {} connection(s)",
            room,
            event,
            trigger_user,
            delivered
        );
        Ok(delivered)
    }

    /// `None` when the session no longer exists
    async fn session_snapshot(
        &self,
        session_id: SessionId,
        presence: &std::collections::HashMap<String, PageLabel>,
        trigger_user: &str,
        event: PresenceEvent,
    ) -> GameResult<Option<SessionSnapshot>> {
        let Some(session) = self.store.session(session_id).await? else {
            return Ok(None);
        };
        let players = self.store.players(session_id).await?;
        let game_start = self.store.game_start(session_id).await?;
        let current_round = self.current_round(session_id).await?;
        let flag = self.round_flag(session_id, current_round).await?;

        let members: BTreeMap<String, PageLabel> = players
            .iter()
            .map(|p| {
                let page = presence
                    .get(&p.username)
                    .cloned()
                    .unwrap_or(PageLabel::Offline);
                (p.username.clone(), page)
            })
            .collect();

        let (round_results, round_winners) = if flag.state == RoundState::Results {
            let tally = self.round_tally(session_id, current_round, &players).await?;
            (tally.results, tally.winner_names)
        } else {
            (Vec::new(), Vec::new())
        };

        Ok(Some(SessionSnapshot {
            session_id,
            players: players.iter().map(Into::into).collect(),
            presence: members,
            max_players: session.players,
            is_paused: game_start.as_ref().is_some_and(|g| g.paused),
            game_has_been_started: game_start.is_some(),
            trigger_user: trigger_user.to_string(),
            trigger_event: event.to_string(),
            current_round,
            round_state: flag.state,
            round_start_at: flag.start_at,
            round_end_at: flag.end_at,
            round_results,
            round_winners,
        }))
    }
}
