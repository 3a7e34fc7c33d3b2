use super::AppState;
use crate::error::{GameError, GameResult};
use crate::protocol::ServerMessage;
use crate::types::*;
use chrono::Utc;

impl AppState {
    /// Latest round not yet ended, else the latest round, else 1
    pub async fn current_round(&self, session_id: SessionId) -> GameResult<RoundNo> {
        if let Some(open) = self.store.latest_round(session_id, true).await? {
            return Ok(open.round);
        }
        Ok(self
            .store
            .latest_round(session_id, false)
            .await?
            .map_or(1, |r| r.round))
    }

    /// State of a round, rebuilt from the store when not held in memory
    pub async fn round_flag(&self, session_id: SessionId, round: RoundNo) -> GameResult<RoundFlag> {
        if let Some(flag) = self.round_flags.read().await.get(&(session_id, round)) {
            return Ok(flag.clone());
        }

        let rebuilt = self.reconstruct_flag(session_id, round).await?;
        tracing::debug!(
            "Reconstructed round {} of session {} as {}",
            round,
            session_id,
            rebuilt.state
        );
        let mut flags = self.round_flags.write().await;
        Ok(flags
            .entry((session_id, round))
            .or_insert(rebuilt)
            .clone())
    }

    /// Classify a round from durable records alone. Timestamps are lost, so a
    /// running countdown comes back as `idle` rather than `started`.
    async fn reconstruct_flag(&self, session_id: SessionId, round: RoundNo) -> GameResult<RoundFlag> {
        let Some(record) = self.store.round(session_id, round).await? else {
            return Ok(RoundFlag::new(RoundState::Idle));
        };

        if !record.ended {
            let players = self.store.players(session_id).await?;
            if players.is_empty() {
                return Ok(RoundFlag::new(RoundState::Idle));
            }
            // Only an awarded round is in results. A resolution that failed
            // halfway comes back as voting or idle so a retry finishes it.
            if self.store.round_awarded(session_id, round).await? {
                return Ok(RoundFlag::new(RoundState::Results));
            }

            let submissions = self.store.submissions(session_id, round).await?;
            let submitted: Vec<_> = submissions
                .iter()
                .filter(|s| players.iter().any(|p| p.user_id == s.user_id))
                .collect();
            let real = submitted.iter().filter(|s| s.artifact.is_some()).count();
            if submitted.len() >= players.len() && real >= 2 {
                return Ok(RoundFlag::new(RoundState::Voting));
            }
            return Ok(RoundFlag::new(RoundState::Idle));
        }

        let is_latest = self
            .store
            .latest_round(session_id, false)
            .await?
            .is_some_and(|latest| latest.round == round);
        if is_latest {
            if let Some(session) = self.store.session(session_id).await? {
                let players = self.store.players(session_id).await?;
                if players.iter().any(|p| p.score >= session.points_to_win) {
                    return Ok(RoundFlag::new(RoundState::GameOver));
                }
            }
        }
        Ok(RoundFlag::new(RoundState::Ended))
    }

    pub(crate) async fn set_flag(&self, session_id: SessionId, round: RoundNo, flag: RoundFlag) {
        self.round_flags
            .write()
            .await
            .insert((session_id, round), flag);
    }

    /// Compare-and-set: move the round to `to(current)` if its state is one
    /// of `from`. Returns `(previous, claimed)` for the winner, `None` for
    /// a caller that lost the race.
    pub(crate) async fn claim_transition<F>(
        &self,
        session_id: SessionId,
        round: RoundNo,
        from: &[RoundState],
        to: F,
    ) -> GameResult<Option<(RoundFlag, RoundFlag)>>
    where
        F: FnOnce(&RoundFlag) -> RoundFlag,
    {
        let current = self.round_flag(session_id, round).await?;
        let mut flags = self.round_flags.write().await;
        let flag = flags.entry((session_id, round)).or_insert(current);
        if !from.contains(&flag.state) {
            tracing::debug!(
                "Round {} of session {} is {}, transition skipped",
                round,
                session_id,
                flag.state
            );
            return Ok(None);
        }
        let previous = flag.clone();
        let claimed = to(&previous);
        *flag = claimed.clone();
        tracing::info!(
            "Round {} of session {}: {} -> {}",
            round,
            session_id,
            previous.state,
            claimed.state
        );
        Ok(Some((previous, claimed)))
    }

    /// Undo a claim whose store writes failed, unless someone moved on since
    pub(crate) async fn restore_flag(
        &self,
        session_id: SessionId,
        round: RoundNo,
        claimed: &RoundFlag,
        previous: RoundFlag,
    ) {
        let mut flags = self.round_flags.write().await;
        if flags.get(&(session_id, round)) == Some(claimed) {
            tracing::warn!(
                "Round {} of session {}: rolling back to {}",
                round,
                session_id,
                previous.state
            );
            flags.insert((session_id, round), previous);
        }
    }

    pub(crate) async fn drop_session_flags(&self, session_id: SessionId) {
        self.round_flags
            .write()
            .await
            .retain(|(sid, _), _| *sid != session_id);
    }

    /// Start a fresh round, or resume a paused one with its remaining time.
    /// Rounds that already run are left alone.
    pub async fn start_round(&self, session_id: SessionId, round: RoundNo) -> GameResult<RoundFlag> {
        let room = RoomId::session(session_id);
        if !self.ready_check(&room).await {
            return Err(GameError::NotReady);
        }

        let session = self.session_or_404(session_id).await?;
        let mut record = self
            .store
            .round(session_id, round)
            .await?
            .ok_or(GameError::RoundNotFound)?;
        let flag = self.round_flag(session_id, round).await?;
        let now = Utc::now();

        match flag.state {
            RoundState::Idle | RoundState::NewRound => {
                let start_at = now + self.countdown();
                let end_at =
                    start_at + chrono::Duration::seconds(i64::from(session.time_per_question));
                let Some((previous, claimed)) = self
                    .claim_transition(
                        session_id,
                        round,
                        &[RoundState::Idle, RoundState::NewRound],
                        |_| RoundFlag::timed(RoundState::Started, start_at, end_at),
                    )
                    .await?
                else {
                    return self.round_flag(session_id, round).await;
                };

                record.started = true;
                record.paused = false;
                record.start_at = Some(start_at);
                record.end_at = Some(end_at);
                record.pause_at = None;
                record.resume_at = None;
                if let Err(e) = self.store.save_round(&record).await {
                    self.restore_flag(session_id, round, &claimed, previous).await;
                    return Err(e.into());
                }

                self.broadcast(
                    &room,
                    ServerMessage::StartRound {
                        session_id,
                        round,
                        start_at,
                        end_at,
                    },
                )
                .await;
                Ok(claimed)
            }
            RoundState::Paused => {
                let (Some(pause_at), Some(end_at)) = (record.pause_at, record.end_at) else {
                    return Err(GameError::precondition("Round has no recorded pause"));
                };
                let remaining = end_at - pause_at;
                if remaining <= chrono::Duration::zero() {
                    return Err(GameError::precondition("Round already expired"));
                }
                let resume_at = now + self.countdown();
                let new_end_at = resume_at + remaining;

                let Some((previous, claimed)) = self
                    .claim_transition(session_id, round, &[RoundState::Paused], |_| {
                        RoundFlag::timed(RoundState::Started, resume_at, new_end_at)
                    })
                    .await?
                else {
                    return self.round_flag(session_id, round).await;
                };

                record.paused = false;
                record.resume_at = Some(resume_at);
                record.end_at = Some(new_end_at);
                if let Err(e) = self.store.save_round(&record).await {
                    self.restore_flag(session_id, round, &claimed, previous).await;
                    return Err(e.into());
                }

                tracing::info!(
                    "Resuming round {} of session {} with {}s left",
                    round,
                    session_id,
                    remaining.num_seconds()
                );
                self.broadcast(
                    &room,
                    ServerMessage::ResumeRound {
                        session_id,
                        round,
                        start_at: resume_at,
                        end_at: new_end_at,
                    },
                )
                .await;
                Ok(claimed)
            }
            RoundState::Started | RoundState::Voting | RoundState::Results => Ok(flag),
            RoundState::Ended | RoundState::GameOver => Err(GameError::precondition(format!(
                "The round can't be started due to its state: {}",
                flag.state
            ))),
        }
    }

    /// Freeze a running round when someone is not on the game page. Its
    /// submissions and votes are cleared; the remaining time is kept for the
    /// resume.
    pub async fn pause_round(&self, session_id: SessionId, round: RoundNo) -> GameResult<RoundFlag> {
        let room = RoomId::session(session_id);
        if self.ready_check(&room).await {
            tracing::debug!("Everyone is ready in {}, not pausing", room);
            return self.round_flag(session_id, round).await;
        }

        let mut record = self
            .store
            .round(session_id, round)
            .await?
            .ok_or(GameError::RoundNotFound)?;
        let pause_at = Utc::now();

        let Some((previous, claimed)) = self
            .claim_transition(session_id, round, &[RoundState::Started], |current| {
                RoundFlag {
                    state: RoundState::Paused,
                    ..current.clone()
                }
            })
            .await?
        else {
            return self.round_flag(session_id, round).await;
        };

        record.paused = true;
        record.pause_at = Some(pause_at);
        let written = async {
            self.store.save_round(&record).await?;
            self.store
                .clear_submissions(session_id, Some(round))
                .await?;
            self.store.clear_votes(session_id, round).await
        }
        .await;
        if let Err(e) = written {
            self.restore_flag(session_id, round, &claimed, previous).await;
            return Err(e.into());
        }

        self.broadcast(&room, ServerMessage::PauseRound { session_id, round })
            .await;
        Ok(claimed)
    }

    /// Pause the current round of a session room that stopped being ready
    pub(crate) async fn pause_if_not_ready(&self, room: &RoomId) {
        let Some(session_id) = room.session_id() else {
            return;
        };
        if self.ready_check(room).await {
            return;
        }
        let round = match self.current_round(session_id).await {
            Ok(round) => round,
            Err(e) => {
                tracing::warn!("[{}] Could not determine current round: {}", room, e);
                return;
            }
        };
        match self.round_flag(session_id, round).await {
            Ok(flag) if flag.state == RoundState::Started => {
                tracing::info!("[{}] Not everyone is ready, pausing round {}", room, round);
                if let Err(e) = self.pause_round(session_id, round).await {
                    tracing::warn!("[{}] Automatic pause failed: {}", room, e);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("[{}] Could not read round state: {}", room, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::*;

    #[tokio::test]
    async fn test_reconstruct_without_rows_is_idle_round_one() {
        let (state, store) = test_state();
        let (session, _users) = seeded_session(&state, &store, &["ana", "bo", "cy"], 3).await;

        assert_eq!(state.current_round(session.id).await.unwrap(), 1);
        assert_eq!(
            state.round_flag(session.id, 1).await.unwrap().state,
            RoundState::Idle
        );
    }

    #[tokio::test]
    async fn test_reconstruct_never_resurrects_started() {
        let (state, store) = test_state();
        let (session, users) = seeded_session(&state, &store, &["ana", "bo", "cy"], 3).await;
        let _conns = running_game(&state, &session, &users).await;
        assert_eq!(
            state.round_flag(session.id, 1).await.unwrap().state,
            RoundState::Started
        );

        state.drop_session_flags(session.id).await;
        let flag = state.round_flag(session.id, 1).await.unwrap();
        assert_eq!(flag.state, RoundState::Idle);
        assert!(flag.start_at.is_none());
    }

    #[tokio::test]
    async fn test_reconstruct_ended_round_with_winner_is_game_over() {
        let (state, store) = test_state();
        let (session, users) = seeded_session(&state, &store, &["ana", "bo", "cy"], 1).await;

        let mut record = store.insert_round(session.id, 1).await.unwrap();
        record.ended = true;
        store.save_round(&record).await.unwrap();
        assert_eq!(
            state.round_flag(session.id, 1).await.unwrap().state,
            RoundState::Ended
        );

        store.award_round(session.id, 1, &[users[1].id]).await.unwrap();
        state.drop_session_flags(session.id).await;
        assert_eq!(
            state.round_flag(session.id, 1).await.unwrap().state,
            RoundState::GameOver
        );
    }

    #[tokio::test]
    async fn test_start_round_requires_ready_room() {
        let (state, store) = test_state();
        let (session, users) = seeded_session(&state, &store, &["ana", "bo", "cy"], 3).await;
        let _conns = connect_lobby(&state, &session, &users).await;
        state.start_game(session.id, &users[0]).await.unwrap();

        let result = state.start_round(session.id, 1).await;
        assert!(matches!(result, Err(GameError::NotReady)));
    }

    #[tokio::test]
    async fn test_start_round_missing_row_is_not_found() {
        let (state, store) = test_state();
        let (session, users) = seeded_session(&state, &store, &["ana", "bo", "cy"], 3).await;
        let conns = connect_lobby(&state, &session, &users).await;
        all_on_game_page(&state, &session, &users, &conns).await;

        let result = state.start_round(session.id, 4).await;
        assert!(matches!(result, Err(GameError::RoundNotFound)));
    }

    #[tokio::test]
    async fn test_start_round_announces_window() {
        let (state, store) = test_state();
        let (session, users) = seeded_session(&state, &store, &["ana", "bo", "cy"], 3).await;
        let mut conns = connect_lobby(&state, &session, &users).await;
        state.start_game(session.id, &users[0]).await.unwrap();
        all_on_game_page(&state, &session, &users, &conns).await;
        conns[1].drain();

        let flag = state.start_round(session.id, 1).await.unwrap();
        assert_eq!(flag.state, RoundState::Started);
        let (start_at, end_at) = (flag.start_at.unwrap(), flag.end_at.unwrap());
        assert_eq!((end_at - start_at).num_seconds(), 30);

        let received = conns[1].drain();
        assert!(received
            .iter()
            .any(|m| matches!(m, ServerMessage::StartRound { round: 1, .. })));

        // A second start while running is a no-op
        let again = state.start_round(session.id, 1).await.unwrap();
        assert_eq!(again, flag);
        assert!(conns[1].drain().is_empty());
    }

    #[tokio::test]
    async fn test_pause_and_resume_keep_remaining_time() {
        let (state, store) = test_state();
        let (session, users) = seeded_session(&state, &store, &["ana", "bo", "cy"], 3).await;
        let conns = running_game(&state, &session, &users).await;
        let room = RoomId::session(session.id);

        state
            .record_submission(session.id, 1, &users[1], Some("https://gifs.example/1.gif".to_string()))
            .await
            .unwrap();

        state
            .set_presence(&room, conns[2].id, "cy", PageLabel::Other("history".to_string()))
            .await;
        let paused = state.pause_round(session.id, 1).await.unwrap();
        assert_eq!(paused.state, RoundState::Paused);
        assert!(store.submissions(session.id, 1).await.unwrap().is_empty());

        let before = store.round(session.id, 1).await.unwrap().unwrap();
        let old_remaining = before.end_at.unwrap() - before.pause_at.unwrap();

        // Not ready yet
        assert!(matches!(
            state.start_round(session.id, 1).await,
            Err(GameError::NotReady)
        ));

        state
            .set_presence(&room, conns[2].id, "cy", PageLabel::GamePage)
            .await;
        let resumed = state.start_round(session.id, 1).await.unwrap();
        assert_eq!(resumed.state, RoundState::Started);

        let after = store.round(session.id, 1).await.unwrap().unwrap();
        assert_eq!(after.end_at.unwrap() - after.resume_at.unwrap(), old_remaining);
        assert!(!after.paused);
    }

    #[tokio::test]
    async fn test_pause_round_is_noop_when_ready() {
        let (state, store) = test_state();
        let (session, users) = seeded_session(&state, &store, &["ana", "bo", "cy"], 3).await;
        let _conns = running_game(&state, &session, &users).await;

        let flag = state.pause_round(session.id, 1).await.unwrap();
        assert_eq!(flag.state, RoundState::Started);
    }

    #[tokio::test]
    async fn test_presence_change_pauses_running_round() {
        let (state, store) = test_state();
        let (session, users) = seeded_session(&state, &store, &["ana", "bo", "cy"], 3).await;
        let mut conns = running_game(&state, &session, &users).await;
        let room = RoomId::session(session.id);
        conns[0].drain();

        state
            .presence_update(&room, conns[1].id, "bo", PageLabel::WaitingArea)
            .await
            .unwrap();

        assert_eq!(
            state.round_flag(session.id, 1).await.unwrap().state,
            RoundState::Paused
        );
        let received = conns[0].drain();
        assert!(received
            .iter()
            .any(|m| matches!(m, ServerMessage::PauseRound { round: 1, .. })));
    }

    #[tokio::test]
    async fn test_store_failure_leaves_flag_unchanged() {
        let (state, store) = test_state();
        let (session, users) = seeded_session(&state, &store, &["ana", "bo", "cy"], 3).await;
        let conns = connect_lobby(&state, &session, &users).await;
        state.start_game(session.id, &users[0]).await.unwrap();
        all_on_game_page(&state, &session, &users, &conns).await;

        store.set_unavailable(true);
        assert!(matches!(
            state.start_round(session.id, 1).await,
            Err(GameError::Store(_))
        ));
        store.set_unavailable(false);

        assert_eq!(
            state.round_flag(session.id, 1).await.unwrap().state,
            RoundState::Idle
        );
        assert_eq!(
            state.start_round(session.id, 1).await.unwrap().state,
            RoundState::Started
        );
    }
}
