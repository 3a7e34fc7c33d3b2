use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque ID types for type safety
pub type SessionId = i64;
pub type UserId = i64;
pub type RoundNo = u32;
pub type ConnId = ulid::Ulid;

/// Name of the lobby room that carries session list updates
pub const LOBBY_ROOM: &str = "sessions";

/// Prefix of per-session room names (`session_{id}`)
const SESSION_ROOM_PREFIX: &str = "session_";

/// Announced to clients when a round has no generated statement
pub const STATEMENT_UNAVAILABLE: &str = "Statement unavailable";

/// Websocket room identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn lobby() -> Self {
        Self(LOBBY_ROOM.to_string())
    }

    pub fn session(session_id: SessionId) -> Self {
        Self(format!("{}{}", SESSION_ROOM_PREFIX, session_id))
    }

    /// The game session this room belongs to, if it is a session room
    pub fn session_id(&self) -> Option<SessionId> {
        self.0
            .strip_prefix(SESSION_ROOM_PREFIX)
            .and_then(|id| id.parse().ok())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last self-reported UI location of a player
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PageLabel {
    WaitingArea,
    HostLobby,
    GamePage,
    Offline,
    Other(String),
}

impl From<String> for PageLabel {
    fn from(page: String) -> Self {
        match page.as_str() {
            "waiting_area" => PageLabel::WaitingArea,
            "host_lobby" => PageLabel::HostLobby,
            "game_page" => PageLabel::GamePage,
            "offline" => PageLabel::Offline,
            _ => PageLabel::Other(page),
        }
    }
}

impl From<PageLabel> for String {
    fn from(page: PageLabel) -> Self {
        match page {
            PageLabel::WaitingArea => "waiting_area".to_string(),
            PageLabel::HostLobby => "host_lobby".to_string(),
            PageLabel::GamePage => "game_page".to_string(),
            PageLabel::Offline => "offline".to_string(),
            PageLabel::Other(page) => page,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RoundState {
    Idle,
    Started,
    Paused,
    Voting,
    Results,
    NewRound,
    Ended,
    GameOver,
}

impl RoundState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundState::Idle => "idle",
            RoundState::Started => "started",
            RoundState::Paused => "paused",
            RoundState::Voting => "voting",
            RoundState::Results => "results",
            RoundState::NewRound => "new_round",
            RoundState::Ended => "ended",
            RoundState::GameOver => "game_over",
        }
    }

    /// States in which no submission is taken. A paused round restarts its
    /// submission phase on resume.
    pub fn submissions_closed(&self) -> bool {
        matches!(
            self,
            RoundState::Paused
                | RoundState::Voting
                | RoundState::Results
                | RoundState::Ended
                | RoundState::GameOver
        )
    }
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ephemeral state descriptor of one (session, round) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundFlag {
    pub state: RoundState,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
}

impl RoundFlag {
    pub fn new(state: RoundState) -> Self {
        Self {
            state,
            start_at: None,
            end_at: None,
        }
    }

    pub fn timed(state: RoundState, start_at: DateTime<Utc>, end_at: DateTime<Utc>) -> Self {
        Self {
            state,
            start_at: Some(start_at),
            end_at: Some(end_at),
        }
    }
}

/// Host-editable session settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub category: String,
    pub players: u32,
    pub time_per_question: u32,
    pub points_to_win: u32,
}

impl SessionSettings {
    /// Validate the ranges accepted when creating or editing a session
    pub fn validate(&self) -> Result<(), String> {
        if self.category.trim().is_empty()
            || !(3..=8).contains(&self.players)
            || !(5..=60).contains(&self.time_per_question)
            || !(1..=10).contains(&self.points_to_win)
        {
            return Err("Invalid game session parameters".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub username: String,
    #[serde(skip_serializing)]
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub category: String,
    /// Player capacity
    pub players: u32,
    pub time_per_question: u32,
    pub points_to_win: u32,
    pub host_id: UserId,
    pub active: bool,
}

impl SessionRecord {
    pub fn settings(&self) -> SessionSettings {
        SessionSettings {
            category: self.category.clone(),
            players: self.players,
            time_per_question: self.time_per_question,
            points_to_win: self.points_to_win,
        }
    }
}

/// Session membership joined with the member's score
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub user_id: UserId,
    pub username: String,
    pub is_host: bool,
    pub score: u32,
    pub winner: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub session_id: SessionId,
    pub round: RoundNo,
    pub started: bool,
    pub paused: bool,
    pub ended: bool,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub pause_at: Option<DateTime<Utc>>,
    pub resume_at: Option<DateTime<Utc>>,
}

impl RoundRecord {
    pub fn new(session_id: SessionId, round: RoundNo) -> Self {
        Self {
            session_id,
            round,
            started: false,
            paused: false,
            ended: false,
            start_at: None,
            end_at: None,
            pause_at: None,
            resume_at: None,
        }
    }
}

/// A player's artifact for a round; `artifact == None` is an explicit "no submission"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub session_id: SessionId,
    pub round: RoundNo,
    pub user_id: UserId,
    pub username: String,
    pub artifact: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub session_id: SessionId,
    pub round: RoundNo,
    pub voter_id: UserId,
    pub target_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameStartRecord {
    pub session_id: SessionId,
    pub paused: bool,
}
