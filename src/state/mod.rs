mod game;
mod presence;
mod room;
mod round;
mod score;
mod session;
mod snapshot;
mod submission;
mod vote;

pub use game::{AdvanceOutcome, GameStart};
pub use room::{Connection, Room};
pub use score::{required_prompt_count, tally_votes, RoundTally};
pub use snapshot::PresenceEvent;
pub use submission::SubmissionOutcome;
pub use vote::VoteOutcome;

use crate::config::ServerConfig;
use crate::error::{GameError, GameResult};
use crate::llm::PromptGenerator;
use crate::store::Store;
use crate::types::*;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    /// Statement generator; `None` when no provider is configured
    pub prompts: Option<Arc<dyn PromptGenerator>>,
    pub config: ServerConfig,
    /// Live rooms; each room has its own lock so rooms never block each other
    pub rooms: Arc<RwLock<HashMap<RoomId, Arc<RwLock<Room>>>>>,
    /// Ephemeral round states, rebuilt from the store on a miss
    pub round_flags: Arc<RwLock<HashMap<(SessionId, RoundNo), RoundFlag>>>,
    /// Generation counter for offline timers
    offline_seq: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        prompts: Option<Arc<dyn PromptGenerator>>,
        config: ServerConfig,
    ) -> Self {
        Self {
            store,
            prompts,
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            round_flags: Arc::new(RwLock::new(HashMap::new())),
            offline_seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) async fn session_or_404(&self, session_id: SessionId) -> GameResult<SessionRecord> {
        self.store
            .session(session_id)
            .await?
            .ok_or(GameError::SessionNotFound)
    }

    /// Membership of `user` in the session
    pub async fn require_member(
        &self,
        session_id: SessionId,
        user: &UserRecord,
    ) -> GameResult<PlayerRecord> {
        self.store
            .players(session_id)
            .await?
            .into_iter()
            .find(|p| p.user_id == user.id)
            .ok_or(GameError::NotInSession)
    }

    pub(crate) fn require_host(
        session: &SessionRecord,
        user: &UserRecord,
        action: &'static str,
    ) -> GameResult<()> {
        if session.host_id != user.id {
            return Err(GameError::NotHost(action));
        }
        Ok(())
    }

    /// Countdown offset announced to clients
    pub(crate) fn countdown(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.countdown).unwrap_or_else(|_| chrono::Duration::zero())
    }
}
