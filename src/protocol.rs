use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Messages a client may send over its room connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    PresenceUpdate {
        #[serde(default)]
        username: String,
        #[serde(default)]
        page: String,
    },
}

/// Inbound frame after decoding
#[derive(Debug, Clone)]
pub enum Inbound {
    Client(ClientMessage),
    /// Anything that is not a known client message; echoed back
    Other(Value),
}

impl Inbound {
    /// Decode a text frame. Only malformed JSON is an error.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        let known = value.get("type").and_then(Value::as_str) == Some("presence_update");
        if known {
            if let Ok(msg) = serde_json::from_value::<ClientMessage>(value.clone()) {
                return Ok(Inbound::Client(msg));
            }
        }
        Ok(Inbound::Other(value))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionUpdate {
        payload: SessionUpdatePayload,
    },
    StartGame {
        session_id: SessionId,
        round: RoundNo,
        start_at: DateTime<Utc>,
    },
    GamePaused {
        session_id: SessionId,
        pause_at: DateTime<Utc>,
    },
    StartRound {
        session_id: SessionId,
        round: RoundNo,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    },
    ResumeRound {
        session_id: SessionId,
        round: RoundNo,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    },
    PauseRound {
        session_id: SessionId,
        round: RoundNo,
    },
    GifSubmissions {
        submissions: Vec<PublicSubmission>,
    },
    StartVoting {
        round: RoundNo,
    },
    Results {
        round_winners: Vec<String>,
        round_results: Vec<VoteCount>,
    },
    RoundEnded {
        next_round: RoundNo,
    },
    NewRound {
        round: RoundNo,
        next_round_sentence: String,
        next_round_state: RoundState,
    },
    GameOver {
        winners: Vec<String>,
        leaderboard: Vec<LeaderboardEntry>,
    },
    SessionCreated {
        session: LobbySession,
    },
    SessionDeleted {
        session_id: SessionId,
    },
    SessionDeactivated {
        session_id: SessionId,
    },
    SessionDetailsUpdated {
        session_id: SessionId,
        user_count: usize,
        new_category: String,
        new_max_players: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        new_time_per_question: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        new_points_to_win: Option<u32>,
    },
    Echo {
        message: Value,
    },
    Error {
        code: String,
        msg: String,
    },
}

/// Payload of `session_update`; the lobby and session rooms use different shapes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SessionUpdatePayload {
    Snapshot(Box<SessionSnapshot>),
    PlayerCount { player_count: PlayerCount },
    Presence(PresenceSnapshot),
}

/// Presence, score and round picture of one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub players: Vec<PlayerInfo>,
    pub presence: BTreeMap<String, PageLabel>,
    pub max_players: u32,
    pub is_paused: bool,
    pub game_has_been_started: bool,
    pub trigger_user: String,
    pub trigger_event: String,
    pub current_round: RoundNo,
    pub round_state: RoundState,
    pub round_start_at: Option<DateTime<Utc>>,
    pub round_end_at: Option<DateTime<Utc>>,
    pub round_results: Vec<VoteCount>,
    pub round_winners: Vec<String>,
}

/// Presence of a room that is not bound to a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    pub room: String,
    pub presence: BTreeMap<String, PageLabel>,
    pub trigger_user: String,
    pub trigger_event: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub username: String,
    pub is_host: bool,
    pub score: u32,
    pub winner: bool,
}

impl From<&PlayerRecord> for PlayerInfo {
    fn from(p: &PlayerRecord) -> Self {
        Self {
            username: p.username.clone(),
            is_host: p.is_host,
            score: p.score,
            winner: p.winner,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerCount {
    pub session_id: SessionId,
    pub user_count: usize,
    pub max_players: u32,
}

/// Submission as shown to every player (non-null artifacts only)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicSubmission {
    pub username: String,
    pub gif_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteCount {
    pub username: String,
    pub votes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub username: String,
    pub score: u32,
}

/// Session entry of the lobby list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LobbySession {
    pub id: SessionId,
    pub category: String,
    pub max_players: u32,
    pub players_current: usize,
    pub host_username: String,
    pub time_per_question: u32,
    pub points_to_win: u32,
}
