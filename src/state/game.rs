use super::score::{game_winners, tally_votes};
use super::AppState;
use crate::error::{GameError, GameResult};
use crate::protocol::{LeaderboardEntry, ServerMessage};
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Round a started game opens with, and when its countdown ends
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GameStart {
    pub round: RoundNo,
    pub start_at: DateTime<Utc>,
}

/// What follows a round in the results state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    GameOver {
        winners: Vec<String>,
        leaderboard: Vec<LeaderboardEntry>,
    },
    NextRound {
        round: RoundNo,
        sentence: String,
    },
}

fn leaderboard(players: &[PlayerRecord]) -> Vec<LeaderboardEntry> {
    let mut entries: Vec<LeaderboardEntry> = players
        .iter()
        .map(|p| LeaderboardEntry {
            username: p.username.clone(),
            score: p.score,
        })
        .collect();
    entries.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.username.cmp(&b.username)));
    entries
}

impl AppState {
    /// Start a fresh game, or resume a paused one.
    ///
    /// Every member must be connected to the session room on their lobby
    /// page (the host on `host_lobby`, everyone else on `waiting_area`).
    /// Statements for the opening round are generated before anything is
    /// written, so a generator failure leaves the session untouched.
    pub async fn start_game(&self, session_id: SessionId, user: &UserRecord) -> GameResult<GameStart> {
        let session = self.session_or_404(session_id).await?;
        Self::require_host(&session, user, "start the game")?;
        if !session.active {
            return Err(GameError::SessionInactive);
        }

        let players = self.store.players(session_id).await?;
        let room = RoomId::session(session_id);
        let presence = self.presence_of(&room).await;
        let missing: Vec<String> = players
            .iter()
            .filter_map(|p| {
                let expected = if p.is_host {
                    PageLabel::HostLobby
                } else {
                    PageLabel::WaitingArea
                };
                let actual = presence.get(&p.username);
                if actual == Some(&expected) {
                    return None;
                }
                let actual = actual.map_or_else(|| "offline".to_string(), |page| page.clone().into());
                Some(format!(
                    "{} (expected: {}, got: {})",
                    p.username,
                    String::from(expected),
                    actual
                ))
            })
            .collect();
        if !missing.is_empty() {
            tracing::info!("Session {} cannot start, not ready: {:?}", session_id, missing);
            return Err(GameError::PlayersNotReady(missing));
        }

        let (round, fresh) = match self.store.game_start(session_id).await? {
            None => (1, true),
            Some(marker) if marker.paused => (self.current_round(session_id).await?, false),
            Some(_) => return Err(GameError::precondition("Game already running.")),
        };

        self.ensure_prompt_supply(&session, round, &players).await?;

        if fresh {
            self.store.clear_submissions(session_id, None).await?;
            self.store.clear_rounds(session_id).await?;
            self.store.insert_game_start(session_id).await?;
            self.store.insert_round(session_id, 1).await?;
            self.drop_session_flags(session_id).await;
            self.set_flag(session_id, 1, RoundFlag::new(RoundState::Idle))
                .await;
            tracing::info!("Game started in session {}", session_id);
        } else {
            self.store.set_game_paused(session_id, false).await?;
            tracing::info!("Game resumed in session {} at round {}", session_id, round);
        }

        let start_at = Utc::now() + self.countdown();
        self.broadcast(
            &room,
            ServerMessage::StartGame {
                session_id,
                round,
                start_at,
            },
        )
        .await;
        Ok(GameStart { round, start_at })
    }

    /// Host pause of the whole game. The current round goes back to idle and
    /// loses its submissions and votes; players return to the lobby.
    pub async fn pause_game(
        &self,
        session_id: SessionId,
        user: &UserRecord,
    ) -> GameResult<DateTime<Utc>> {
        let session = self.session_or_404(session_id).await?;
        if !session.active {
            return Err(GameError::SessionInactive);
        }
        Self::require_host(&session, user, "pause the game")?;

        let round = self.current_round(session_id).await?;
        let Some((previous, claimed)) = self
            .claim_transition(
                session_id,
                round,
                &[RoundState::Started, RoundState::Paused, RoundState::Voting],
                |_| RoundFlag::new(RoundState::Idle),
            )
            .await?
        else {
            let state = self.round_flag(session_id, round).await?.state;
            return Err(GameError::precondition(format!(
                "The session can't be paused due to its state: {}",
                state
            )));
        };

        let written = async {
            self.store.set_game_paused(session_id, true).await?;
            if let Some(mut record) = self.store.round(session_id, round).await? {
                record.started = false;
                record.paused = false;
                record.start_at = None;
                record.end_at = None;
                record.pause_at = None;
                record.resume_at = None;
                self.store.save_round(&record).await?;
            }
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

        let pause_at = Utc::now() + self.countdown();
        tracing::info!("Game paused in session {} during round {}", session_id, round);
        self.broadcast(
            &RoomId::session(session_id),
            ServerMessage::GamePaused {
                session_id,
                pause_at,
            },
        )
        .await;
        Ok(pause_at)
    }

    /// Close a round in the results state: end the game if someone reached
    /// the target score, otherwise open the next round.
    pub async fn advance_round(
        &self,
        session_id: SessionId,
        round: RoundNo,
        user: &UserRecord,
    ) -> GameResult<AdvanceOutcome> {
        let session = self.session_or_404(session_id).await?;
        Self::require_host(&session, user, "advance the round")?;

        let flag = self.round_flag(session_id, round).await?;
        if flag.state != RoundState::Results {
            return Err(GameError::precondition("Current round not in results state"));
        }
        let mut record = self
            .store
            .round(session_id, round)
            .await?
            .ok_or(GameError::RoundNotFound)?;
        let players = self.store.players(session_id).await?;
        let winners = game_winners(&players, session.points_to_win);

        if !winners.is_empty() {
            let winner_ids: Vec<UserId> = winners.iter().map(|p| p.user_id).collect();
            let winner_names: Vec<String> = winners.iter().map(|p| p.username.clone()).collect();

            let Some((previous, claimed)) = self
                .claim_transition(session_id, round, &[RoundState::Results], |current| {
                    RoundFlag {
                        state: RoundState::GameOver,
                        ..current.clone()
                    }
                })
                .await?
            else {
                return Err(GameError::precondition("Current round not in results state"));
            };

            record.ended = true;
            let written = async {
                self.store.save_round(&record).await?;
                self.store.deactivate_session(session_id).await?;
                self.store.mark_winners(session_id, &winner_ids).await
            }
            .await;
            if let Err(e) = written {
                self.restore_flag(session_id, round, &claimed, previous).await;
                return Err(e.into());
            }

            let leaderboard = leaderboard(&players);
            tracing::info!("Session {} is over, winners: {:?}", session_id, winner_names);
            self.broadcast(
                &RoomId::lobby(),
                ServerMessage::SessionDeactivated { session_id },
            )
            .await;
            self.broadcast(
                &RoomId::session(session_id),
                ServerMessage::GameOver {
                    winners: winner_names.clone(),
                    leaderboard: leaderboard.clone(),
                },
            )
            .await;
            return Ok(AdvanceOutcome::GameOver {
                winners: winner_names,
                leaderboard,
            });
        }

        let next = round + 1;
        // Statements for the next round are generated under the claim
        let Some((previous, claimed)) = self
            .claim_transition(session_id, round, &[RoundState::Results], |current| {
                RoundFlag {
                    state: RoundState::Ended,
                    ..current.clone()
                }
            })
            .await?
        else {
            return Err(GameError::precondition("Current round not in results state"));
        };

        record.ended = true;
        let written = async {
            self.ensure_prompt_supply(&session, next, &players).await?;
            self.store.save_round(&record).await?;
            self.store.insert_round(session_id, next).await?;
            Ok::<_, GameError>(())
        }
        .await;
        if let Err(e) = written {
            self.restore_flag(session_id, round, &claimed, previous).await;
            return Err(e);
        }
        self.set_flag(session_id, next, RoundFlag::new(RoundState::NewRound))
            .await;

        let sentence = match self.store.prompt_for_round(session_id, next).await {
            Ok(Some(sentence)) => sentence,
            Ok(None) => STATEMENT_UNAVAILABLE.to_string(),
            Err(e) => {
                tracing::warn!("Statement lookup for session {} failed: {}", session_id, e);
                STATEMENT_UNAVAILABLE.to_string()
            }
        };

        tracing::info!("Session {} moves on to round {}", session_id, next);
        let room = RoomId::session(session_id);
        self.broadcast(&room, ServerMessage::RoundEnded { next_round: next })
            .await;
        self.broadcast(
            &room,
            ServerMessage::NewRound {
                round: next,
                next_round_sentence: sentence.clone(),
                next_round_state: RoundState::NewRound,
            },
        )
        .await;

        Ok(AdvanceOutcome::NextRound {
            round: next,
            sentence,
        })
    }

    /// Vote tally of a round, used by snapshots of rounds in the results state
    pub(crate) async fn round_tally(
        &self,
        session_id: SessionId,
        round: RoundNo,
        players: &[PlayerRecord],
    ) -> GameResult<super::RoundTally> {
        let votes = self.store.votes(session_id, round).await?;
        Ok(tally_votes(&votes, players))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::*;
    use std::sync::Arc;

    /// Everyone submits; the listed voters all vote for `target`
    async fn win_round(
        state: &AppState,
        session: &SessionRecord,
        users: &[UserRecord],
        round: RoundNo,
        target: &str,
    ) {
        for (i, user) in users.iter().enumerate() {
            state
                .record_submission(session.id, round, user, Some(format!("https://g/{}.gif", i)))
                .await
                .unwrap();
        }
        for user in users {
            state.record_vote(session.id, round, user, target).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_start_game_lists_players_on_wrong_page() {
        let (state, store) = test_state();
        let (session, users) = seeded_session(&state, &store, &["ana", "bo", "cy"], 3).await;
        let room = RoomId::session(session.id);
        let _ana = connect(&state, &room, "ana", PageLabel::HostLobby).await;
        let _bo = connect(&state, &room, "bo", PageLabel::GamePage).await;

        match state.start_game(session.id, &users[0]).await {
            Err(GameError::PlayersNotReady(players)) => {
                assert_eq!(
                    players,
                    vec![
                        "bo (expected: waiting_area, got: game_page)".to_string(),
                        "cy (expected: waiting_area, got: offline)".to_string(),
                    ]
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(store.game_start(session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_only_host_starts_game() {
        let (state, store) = test_state();
        let (session, users) = seeded_session(&state, &store, &["ana", "bo", "cy"], 3).await;
        let _conns = connect_lobby(&state, &session, &users).await;

        let result = state.start_game(session.id, &users[1]).await;
        assert!(matches!(result, Err(GameError::NotHost(_))));
    }

    #[tokio::test]
    async fn test_start_game_generates_statements_and_opens_round_one() {
        let (state, store) = test_state();
        let (session, users) = seeded_session(&state, &store, &["ana", "bo", "cy"], 3).await;
        let mut conns = connect_lobby(&state, &session, &users).await;

        let started = state.start_game(session.id, &users[0]).await.unwrap();
        assert_eq!(started.round, 1);
        assert_eq!(store.prompt_count(session.id).await.unwrap(), 7);
        assert!(store.round(session.id, 1).await.unwrap().is_some());
        assert_eq!(
            state.round_flag(session.id, 1).await.unwrap().state,
            RoundState::Idle
        );
        assert!(conns[1]
            .drain()
            .iter()
            .any(|m| matches!(m, ServerMessage::StartGame { round: 1, .. })));

        let again = state.start_game(session.id, &users[0]).await;
        assert!(matches!(again, Err(GameError::Precondition(_))));
    }

    #[tokio::test]
    async fn test_generator_failure_leaves_session_unstarted() {
        let (state, store) = test_state_with(Some(Arc::new(FailingPrompts)));
        let (session, users) = seeded_session(&state, &store, &["ana", "bo", "cy"], 3).await;
        let _conns = connect_lobby(&state, &session, &users).await;

        let result = state.start_game(session.id, &users[0]).await;
        assert!(matches!(result, Err(GameError::PromptGeneration(_))));
        assert!(store.game_start(session.id).await.unwrap().is_none());
        assert!(store.round(session.id, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pause_game_resets_round_and_resume_keeps_round() {
        let (state, store) = test_state();
        let (session, users) = seeded_session(&state, &store, &["ana", "bo", "cy"], 3).await;
        let conns = running_game(&state, &session, &users).await;
        state
            .record_submission(session.id, 1, &users[1], Some("https://g/1.gif".into()))
            .await
            .unwrap();

        state.pause_game(session.id, &users[0]).await.unwrap();
        assert_eq!(
            state.round_flag(session.id, 1).await.unwrap().state,
            RoundState::Idle
        );
        assert!(store.submissions(session.id, 1).await.unwrap().is_empty());
        assert!(store.game_start(session.id).await.unwrap().unwrap().paused);

        let again = state.pause_game(session.id, &users[0]).await;
        match again {
            Err(GameError::Precondition(msg)) => {
                assert_eq!(msg, "The session can't be paused due to its state: idle")
            }
            other => panic!("unexpected {:?}", other),
        }

        let room = RoomId::session(session.id);
        for (user, conn) in users.iter().zip(&conns) {
            let page = if user.id == session.host_id {
                PageLabel::HostLobby
            } else {
                PageLabel::WaitingArea
            };
            state.set_presence(&room, conn.id, &user.username, page).await;
        }
        let resumed = state.start_game(session.id, &users[0]).await.unwrap();
        assert_eq!(resumed.round, 1);
        assert!(!store.game_start(session.id).await.unwrap().unwrap().paused);
    }

    #[tokio::test]
    async fn test_advance_requires_results() {
        let (state, store) = test_state();
        let (session, users) = seeded_session(&state, &store, &["ana", "bo", "cy"], 3).await;
        let _conns = running_game(&state, &session, &users).await;

        let result = state.advance_round(session.id, 1, &users[0]).await;
        match result {
            Err(GameError::Precondition(msg)) => {
                assert_eq!(msg, "Current round not in results state")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_advance_opens_next_round_with_statement() {
        let (state, store) = test_state();
        let (session, users) = seeded_session(&state, &store, &["ana", "bo", "cy"], 3).await;
        let mut conns = running_game(&state, &session, &users).await;
        win_round(&state, &session, &users, 1, "bo").await;
        conns[2].drain();

        let outcome = state.advance_round(session.id, 1, &users[0]).await.unwrap();
        assert_eq!(
            outcome,
            AdvanceOutcome::NextRound {
                round: 2,
                sentence: "cats statement 2".to_string()
            }
        );
        assert!(store.round(session.id, 1).await.unwrap().unwrap().ended);
        assert_eq!(
            state.round_flag(session.id, 2).await.unwrap().state,
            RoundState::NewRound
        );
        assert_eq!(state.current_round(session.id).await.unwrap(), 2);

        let received = conns[2].drain();
        assert!(received
            .iter()
            .any(|m| matches!(m, ServerMessage::RoundEnded { next_round: 2 })));
        assert!(received
            .iter()
            .any(|m| matches!(m, ServerMessage::NewRound { round: 2, .. })));
    }

    #[tokio::test]
    async fn test_concurrent_advances_open_one_round() {
        let (state, store, scripted) = scripted_state();
        let (session, users) = seeded_session(&state, &store, &["ana", "bo", "cy"], 3).await;
        let mut conns = running_game(&state, &session, &users).await;
        win_round(&state, &session, &users, 1, "bo").await;
        let prompts_before = store.prompt_count(session.id).await.unwrap();
        conns[2].drain();

        // The first advance holds the claim while checking the statement supply
        scripted.hold("prompt_count", 0);
        let first = {
            let state = state.clone();
            let session_id = session.id;
            let host = users[0].clone();
            tokio::spawn(async move { state.advance_round(session_id, 1, &host).await })
        };
        scripted.entered.notified().await;

        let second = state.advance_round(session.id, 1, &users[0]).await;
        assert!(matches!(second, Err(GameError::Precondition(_))));

        scripted.release.notify_one();
        let outcome = first.await.unwrap().unwrap();
        assert!(matches!(outcome, AdvanceOutcome::NextRound { round: 2, .. }));
        assert_eq!(store.prompt_count(session.id).await.unwrap(), prompts_before);

        let received = conns[2].drain();
        assert_eq!(
            count_of(&received, |m| matches!(m, ServerMessage::NewRound { .. })),
            1
        );
        assert_eq!(
            count_of(&received, |m| matches!(m, ServerMessage::RoundEnded { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_failed_supply_keeps_round_in_results() {
        let (state, store, scripted) = scripted_state();
        let (session, users) = seeded_session(&state, &store, &["ana", "bo", "cy"], 3).await;
        let _conns = running_game(&state, &session, &users).await;
        win_round(&state, &session, &users, 1, "bo").await;

        scripted.fail("prompt_count", 0);
        let failed = state.advance_round(session.id, 1, &users[0]).await;
        assert!(matches!(failed, Err(GameError::Store(_))));
        assert_eq!(
            state.round_flag(session.id, 1).await.unwrap().state,
            RoundState::Results
        );
        assert!(!store.round(session.id, 1).await.unwrap().unwrap().ended);

        let outcome = state.advance_round(session.id, 1, &users[0]).await.unwrap();
        assert!(matches!(outcome, AdvanceOutcome::NextRound { round: 2, .. }));
    }

    #[tokio::test]
    async fn test_reaching_target_ends_game() {
        let (state, store) = test_state();
        let (session, users) = seeded_session(&state, &store, &["ana", "bo", "cy"], 1).await;
        let mut conns = running_game(&state, &session, &users).await;
        win_round(&state, &session, &users, 1, "cy").await;
        conns[0].drain();

        let outcome = state.advance_round(session.id, 1, &users[0]).await.unwrap();
        match outcome {
            AdvanceOutcome::GameOver {
                winners,
                leaderboard,
            } => {
                assert_eq!(winners, vec!["cy"]);
                assert_eq!(leaderboard[0].username, "cy");
                assert_eq!(leaderboard[0].score, 1);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(!store.session(session.id).await.unwrap().unwrap().active);
        let players = store.players(session.id).await.unwrap();
        assert!(players.iter().find(|p| p.username == "cy").unwrap().winner);
        assert_eq!(
            state.round_flag(session.id, 1).await.unwrap().state,
            RoundState::GameOver
        );
        assert!(conns[0]
            .drain()
            .iter()
            .any(|m| matches!(m, ServerMessage::GameOver { .. })));
    }
}
