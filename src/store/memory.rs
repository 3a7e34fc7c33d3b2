use super::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Membership {
    is_host: bool,
    score: u32,
    winner: bool,
}

#[derive(Debug, Default)]
struct Tables {
    next_user_id: UserId,
    next_session_id: SessionId,
    users: HashMap<UserId, UserRecord>,
    sessions: BTreeMap<SessionId, SessionRecord>,
    /// Keyed by (session, user); BTreeMap keeps member order stable
    members: BTreeMap<(SessionId, UserId), Membership>,
    game_starts: HashMap<SessionId, GameStartRecord>,
    rounds: BTreeMap<(SessionId, RoundNo), RoundRecord>,
    submissions: BTreeMap<(SessionId, RoundNo, UserId), SubmissionRecord>,
    votes: BTreeMap<(SessionId, RoundNo, UserId), VoteRecord>,
    awarded: HashSet<(SessionId, RoundNo)>,
    prompts: HashMap<SessionId, Vec<String>>,
}

/// Process-local store backend
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again) to simulate an outage
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Create a user with a fresh access token
    pub async fn create_user(&self, username: &str) -> UserRecord {
        let mut tables = self.tables.write().await;
        tables.next_user_id += 1;
        let user = UserRecord {
            id: tables.next_user_id,
            username: username.to_string(),
            token: ulid::Ulid::new().to_string(),
        };
        tables.users.insert(user.id, user.clone());
        user
    }

    fn check(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn user_by_token(&self, token: &str) -> StoreResult<Option<UserRecord>> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables.users.values().find(|u| u.token == token).cloned())
    }

    async fn user_by_name(&self, username: &str) -> StoreResult<Option<UserRecord>> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables
            .users
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn insert_session(
        &self,
        settings: SessionSettings,
        host_id: UserId,
    ) -> StoreResult<SessionRecord> {
        self.check()?;
        let mut tables = self.tables.write().await;
        tables.next_session_id += 1;
        let session = SessionRecord {
            id: tables.next_session_id,
            category: settings.category,
            players: settings.players,
            time_per_question: settings.time_per_question,
            points_to_win: settings.points_to_win,
            host_id,
            active: true,
        };
        tables.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    async fn session(&self, session_id: SessionId) -> StoreResult<Option<SessionRecord>> {
        self.check()?;
        Ok(self.tables.read().await.sessions.get(&session_id).cloned())
    }

    async fn active_sessions(&self) -> StoreResult<Vec<SessionRecord>> {
        self.check()?;
        let tables = self.tables.read().await;
        // Newest first
        Ok(tables
            .sessions
            .values()
            .rev()
            .filter(|s| s.active)
            .cloned()
            .collect())
    }

    async fn update_session_settings(
        &self,
        session_id: SessionId,
        settings: SessionSettings,
    ) -> StoreResult<()> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let session = tables
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| StoreError::Conflict(format!("session {} is gone", session_id)))?;
        session.category = settings.category;
        session.players = settings.players;
        session.time_per_question = settings.time_per_question;
        session.points_to_win = settings.points_to_win;
        Ok(())
    }

    async fn deactivate_session(&self, session_id: SessionId) -> StoreResult<()> {
        self.check()?;
        if let Some(session) = self.tables.write().await.sessions.get_mut(&session_id) {
            session.active = false;
        }
        Ok(())
    }

    async fn delete_session(&self, session_id: SessionId) -> StoreResult<()> {
        self.check()?;
        let mut tables = self.tables.write().await;
        tables.prompts.remove(&session_id);
        tables.members.retain(|(sid, _), _| *sid != session_id);
        tables.rounds.retain(|(sid, _), _| *sid != session_id);
        tables.submissions.retain(|(sid, _, _), _| *sid != session_id);
        tables.votes.retain(|(sid, _, _), _| *sid != session_id);
        tables.awarded.retain(|(sid, _)| *sid != session_id);
        tables.game_starts.remove(&session_id);
        tables.sessions.remove(&session_id);
        Ok(())
    }

    async fn active_session_of(&self, user_id: UserId) -> StoreResult<Option<SessionId>> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables
            .members
            .keys()
            .filter(|(_, uid)| *uid == user_id)
            .map(|(sid, _)| *sid)
            .find(|sid| tables.sessions.get(sid).is_some_and(|s| s.active)))
    }

    async fn add_player(
        &self,
        session_id: SessionId,
        user_id: UserId,
        is_host: bool,
    ) -> StoreResult<()> {
        self.check()?;
        let mut tables = self.tables.write().await;
        if !tables.users.contains_key(&user_id) {
            return Err(StoreError::Conflict(format!("user {} does not exist", user_id)));
        }
        tables.members.insert(
            (session_id, user_id),
            Membership {
                is_host,
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn remove_player(&self, session_id: SessionId, user_id: UserId) -> StoreResult<()> {
        self.check()?;
        self.tables
            .write()
            .await
            .members
            .remove(&(session_id, user_id));
        Ok(())
    }

    async fn players(&self, session_id: SessionId) -> StoreResult<Vec<PlayerRecord>> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables
            .members
            .iter()
            .filter(|((sid, _), _)| *sid == session_id)
            .filter_map(|((_, uid), m)| {
                tables.users.get(uid).map(|user| PlayerRecord {
                    user_id: *uid,
                    username: user.username.clone(),
                    is_host: m.is_host,
                    score: m.score,
                    winner: m.winner,
                })
            })
            .collect())
    }

    async fn award_round(
        &self,
        session_id: SessionId,
        round: RoundNo,
        user_ids: &[UserId],
    ) -> StoreResult<bool> {
        self.check()?;
        let mut tables = self.tables.write().await;
        if !tables.awarded.insert((session_id, round)) {
            return Ok(false);
        }
        for user_id in user_ids {
            if let Some(member) = tables.members.get_mut(&(session_id, *user_id)) {
                member.score += 1;
            }
        }
        Ok(true)
    }

    async fn round_awarded(&self, session_id: SessionId, round: RoundNo) -> StoreResult<bool> {
        self.check()?;
        Ok(self.tables.read().await.awarded.contains(&(session_id, round)))
    }

    async fn mark_winners(&self, session_id: SessionId, user_ids: &[UserId]) -> StoreResult<()> {
        self.check()?;
        let mut tables = self.tables.write().await;
        for user_id in user_ids {
            if let Some(member) = tables.members.get_mut(&(session_id, *user_id)) {
                member.winner = true;
            }
        }
        Ok(())
    }

    async fn game_start(&self, session_id: SessionId) -> StoreResult<Option<GameStartRecord>> {
        self.check()?;
        Ok(self.tables.read().await.game_starts.get(&session_id).cloned())
    }

    async fn insert_game_start(&self, session_id: SessionId) -> StoreResult<()> {
        self.check()?;
        self.tables.write().await.game_starts.insert(
            session_id,
            GameStartRecord {
                session_id,
                paused: false,
            },
        );
        Ok(())
    }

    async fn set_game_paused(&self, session_id: SessionId, paused: bool) -> StoreResult<()> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let record = tables.game_starts.get_mut(&session_id).ok_or_else(|| {
            StoreError::Conflict(format!("session {} has not been started", session_id))
        })?;
        record.paused = paused;
        Ok(())
    }

    async fn insert_round(
        &self,
        session_id: SessionId,
        round: RoundNo,
    ) -> StoreResult<RoundRecord> {
        self.check()?;
        let mut tables = self.tables.write().await;
        Ok(tables
            .rounds
            .entry((session_id, round))
            .or_insert_with(|| RoundRecord::new(session_id, round))
            .clone())
    }

    async fn round(
        &self,
        session_id: SessionId,
        round: RoundNo,
    ) -> StoreResult<Option<RoundRecord>> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .await
            .rounds
            .get(&(session_id, round))
            .cloned())
    }

    async fn latest_round(
        &self,
        session_id: SessionId,
        open_only: bool,
    ) -> StoreResult<Option<RoundRecord>> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables
            .rounds
            .range((session_id, 0)..=(session_id, RoundNo::MAX))
            .rev()
            .map(|(_, r)| r)
            .find(|r| !open_only || !r.ended)
            .cloned())
    }

    async fn save_round(&self, record: &RoundRecord) -> StoreResult<()> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let existing = tables
            .rounds
            .get_mut(&(record.session_id, record.round))
            .ok_or_else(|| {
                StoreError::Conflict(format!(
                    "round {} of session {} is gone",
                    record.round, record.session_id
                ))
            })?;
        *existing = record.clone();
        Ok(())
    }

    async fn clear_rounds(&self, session_id: SessionId) -> StoreResult<()> {
        self.check()?;
        let mut tables = self.tables.write().await;
        tables.rounds.retain(|(sid, _), _| *sid != session_id);
        tables.awarded.retain(|(sid, _)| *sid != session_id);
        Ok(())
    }

    async fn insert_submission(&self, submission: SubmissionRecord) -> StoreResult<bool> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let key = (submission.session_id, submission.round, submission.user_id);
        if tables.submissions.contains_key(&key) {
            return Ok(false);
        }
        tables.submissions.insert(key, submission);
        Ok(true)
    }

    async fn remove_submission(
        &self,
        session_id: SessionId,
        round: RoundNo,
        user_id: UserId,
    ) -> StoreResult<()> {
        self.check()?;
        self.tables
            .write()
            .await
            .submissions
            .remove(&(session_id, round, user_id));
        Ok(())
    }

    async fn submissions(
        &self,
        session_id: SessionId,
        round: RoundNo,
    ) -> StoreResult<Vec<SubmissionRecord>> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables
            .submissions
            .range((session_id, round, UserId::MIN)..=(session_id, round, UserId::MAX))
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn clear_submissions(
        &self,
        session_id: SessionId,
        round: Option<RoundNo>,
    ) -> StoreResult<()> {
        self.check()?;
        self.tables
            .write()
            .await
            .submissions
            .retain(|(sid, r, _), _| !(*sid == session_id && round.is_none_or(|n| n == *r)));
        Ok(())
    }

    async fn insert_vote(&self, vote: VoteRecord) -> StoreResult<bool> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let key = (vote.session_id, vote.round, vote.voter_id);
        if tables.votes.contains_key(&key) {
            return Ok(false);
        }
        tables.votes.insert(key, vote);
        Ok(true)
    }

    async fn votes(&self, session_id: SessionId, round: RoundNo) -> StoreResult<Vec<VoteRecord>> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables
            .votes
            .range((session_id, round, UserId::MIN)..=(session_id, round, UserId::MAX))
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn clear_votes(&self, session_id: SessionId, round: RoundNo) -> StoreResult<()> {
        self.check()?;
        self.tables
            .write()
            .await
            .votes
            .retain(|(sid, r, _), _| !(*sid == session_id && *r == round));
        Ok(())
    }

    async fn prompt_count(&self, session_id: SessionId) -> StoreResult<usize> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .await
            .prompts
            .get(&session_id)
            .map_or(0, Vec::len))
    }

    async fn insert_prompts(&self, session_id: SessionId, prompts: Vec<String>) -> StoreResult<()> {
        self.check()?;
        self.tables
            .write()
            .await
            .prompts
            .entry(session_id)
            .or_default()
            .extend(prompts);
        Ok(())
    }

    async fn prompt_for_round(
        &self,
        session_id: SessionId,
        round: RoundNo,
    ) -> StoreResult<Option<String>> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(round.checked_sub(1).and_then(|index| {
            tables
                .prompts
                .get(&session_id)
                .and_then(|prompts| prompts.get(index as usize))
                .cloned()
        }))
    }
}
