//! Durable store port
//!
//! The game core reads and writes sessions, rounds, submissions, votes and
//! scores through this trait. Every call is atomic on its own; callers never
//! rely on two calls being applied together, so writes that must not repeat
//! (round awards) are single calls.

mod memory;

use async_trait::async_trait;

use crate::types::*;

pub use memory::MemoryStore;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while talking to the store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("conflicting write: {0}")]
    Conflict(String),
}

/// Trait that every store backend must implement
#[async_trait]
pub trait Store: Send + Sync {
    // Users
    async fn user_by_token(&self, token: &str) -> StoreResult<Option<UserRecord>>;
    async fn user_by_name(&self, username: &str) -> StoreResult<Option<UserRecord>>;

    // Sessions
    async fn insert_session(
        &self,
        settings: SessionSettings,
        host_id: UserId,
    ) -> StoreResult<SessionRecord>;
    async fn session(&self, session_id: SessionId) -> StoreResult<Option<SessionRecord>>;
    async fn active_sessions(&self) -> StoreResult<Vec<SessionRecord>>;
    async fn update_session_settings(
        &self,
        session_id: SessionId,
        settings: SessionSettings,
    ) -> StoreResult<()>;
    async fn deactivate_session(&self, session_id: SessionId) -> StoreResult<()>;
    /// Remove a session together with everything recorded for it
    async fn delete_session(&self, session_id: SessionId) -> StoreResult<()>;
    /// The active session a user currently belongs to, if any
    async fn active_session_of(&self, user_id: UserId) -> StoreResult<Option<SessionId>>;

    // Membership and scores
    /// Add a member with a zeroed score (resets the score when re-added)
    async fn add_player(&self, session_id: SessionId, user_id: UserId, is_host: bool)
        -> StoreResult<()>;
    async fn remove_player(&self, session_id: SessionId, user_id: UserId) -> StoreResult<()>;
    async fn players(&self, session_id: SessionId) -> StoreResult<Vec<PlayerRecord>>;
    /// Give one point to each listed member for `round`, at most once per
    /// round. Returns `false`, changing nothing, if the round was already awarded.
    async fn award_round(
        &self,
        session_id: SessionId,
        round: RoundNo,
        user_ids: &[UserId],
    ) -> StoreResult<bool>;
    async fn round_awarded(&self, session_id: SessionId, round: RoundNo) -> StoreResult<bool>;
    async fn mark_winners(&self, session_id: SessionId, user_ids: &[UserId]) -> StoreResult<()>;

    // Game start marker
    async fn game_start(&self, session_id: SessionId) -> StoreResult<Option<GameStartRecord>>;
    async fn insert_game_start(&self, session_id: SessionId) -> StoreResult<()>;
    async fn set_game_paused(&self, session_id: SessionId, paused: bool) -> StoreResult<()>;

    // Rounds
    /// Insert a fresh round row, or fetch the existing one
    async fn insert_round(&self, session_id: SessionId, round: RoundNo)
        -> StoreResult<RoundRecord>;
    async fn round(&self, session_id: SessionId, round: RoundNo)
        -> StoreResult<Option<RoundRecord>>;
    /// Highest-numbered round, optionally restricted to rounds not yet ended
    async fn latest_round(
        &self,
        session_id: SessionId,
        open_only: bool,
    ) -> StoreResult<Option<RoundRecord>>;
    /// Overwrite an existing round row; fails with `Conflict` if it is gone
    async fn save_round(&self, record: &RoundRecord) -> StoreResult<()>;
    async fn clear_rounds(&self, session_id: SessionId) -> StoreResult<()>;

    // Submissions
    /// Insert unless the user already submitted this round; returns whether it was inserted
    async fn insert_submission(&self, submission: SubmissionRecord) -> StoreResult<bool>;
    async fn remove_submission(
        &self,
        session_id: SessionId,
        round: RoundNo,
        user_id: UserId,
    ) -> StoreResult<()>;
    async fn submissions(
        &self,
        session_id: SessionId,
        round: RoundNo,
    ) -> StoreResult<Vec<SubmissionRecord>>;
    /// Delete submissions of one round, or of every round when `round` is `None`
    async fn clear_submissions(&self, session_id: SessionId, round: Option<RoundNo>)
        -> StoreResult<()>;

    // Votes
    /// Insert unless the voter already voted this round; returns whether it was inserted
    async fn insert_vote(&self, vote: VoteRecord) -> StoreResult<bool>;
    async fn votes(&self, session_id: SessionId, round: RoundNo) -> StoreResult<Vec<VoteRecord>>;
    async fn clear_votes(&self, session_id: SessionId, round: RoundNo) -> StoreResult<()>;

    // Prompts
    async fn prompt_count(&self, session_id: SessionId) -> StoreResult<usize>;
    async fn insert_prompts(&self, session_id: SessionId, prompts: Vec<String>)
        -> StoreResult<()>;
    /// Statement used by a round (round N uses the N-th stored prompt)
    async fn prompt_for_round(
        &self,
        session_id: SessionId,
        round: RoundNo,
    ) -> StoreResult<Option<String>>;
}
