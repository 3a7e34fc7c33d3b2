use super::{tally_votes, AppState};
use crate::error::{GameError, GameResult};
use crate::protocol::ServerMessage;
use crate::types::*;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VoteOutcome {
    Recorded {
        all_voted: bool,
        round_state: RoundState,
    },
    AlreadyVoted,
}

impl AppState {
    /// Record `voter`'s vote for `target`. The last missing vote tallies the
    /// round and awards a point to every top-voted player.
    pub async fn record_vote(
        &self,
        session_id: SessionId,
        round: RoundNo,
        voter: &UserRecord,
        target: &str,
    ) -> GameResult<VoteOutcome> {
        self.session_or_404(session_id).await?;
        let players = self.store.players(session_id).await?;
        if !players.iter().any(|p| p.user_id == voter.id) {
            return Err(GameError::NotInSession);
        }
        let target = players
            .iter()
            .find(|p| p.username == target)
            .ok_or(GameError::UserNotFound)?;
        self.store
            .round(session_id, round)
            .await?
            .ok_or(GameError::RoundNotFound)?;

        let votes = self.store.votes(session_id, round).await?;
        if votes.iter().any(|v| v.voter_id == voter.id) {
            // Finishes a tally that failed after this vote was stored
            self.close_voting(session_id, round, &players).await?;
            return Ok(VoteOutcome::AlreadyVoted);
        }

        let flag = self.round_flag(session_id, round).await?;
        if flag.state != RoundState::Voting {
            return Err(GameError::precondition(format!(
                "Voting is not open for this round ({})",
                flag.state
            )));
        }

        let inserted = self
            .store
            .insert_vote(VoteRecord {
                session_id,
                round,
                voter_id: voter.id,
                target_id: target.user_id,
            })
            .await?;
        if !inserted {
            return Ok(VoteOutcome::AlreadyVoted);
        }
        tracing::info!(
            "{} voted for {} in round {} of session {}",
            voter.username,
            target.username,
            round,
            session_id
        );

        let (all_voted, round_state) = self.close_voting(session_id, round, &players).await?;
        Ok(VoteOutcome::Recorded {
            all_voted,
            round_state,
        })
    }

    /// Tally the round once every member has voted. Returns whether all votes
    /// are in and the state the round is left in.
    async fn close_voting(
        &self,
        session_id: SessionId,
        round: RoundNo,
        players: &[PlayerRecord],
    ) -> GameResult<(bool, RoundState)> {
        let votes = self.store.votes(session_id, round).await?;
        let cast = votes
            .iter()
            .filter(|v| players.iter().any(|p| p.user_id == v.voter_id))
            .count();
        if cast < players.len() {
            return Ok((false, self.round_flag(session_id, round).await?.state));
        }

        let Some((previous, claimed)) = self
            .claim_transition(session_id, round, &[RoundState::Voting], |current| {
                RoundFlag {
                    state: RoundState::Results,
                    ..current.clone()
                }
            })
            .await?
        else {
            return Ok((true, self.round_flag(session_id, round).await?.state));
        };

        let tally = tally_votes(&votes, players);
        match self
            .store
            .award_round(session_id, round, &tally.winner_ids)
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::debug!(
                "Round {} of session {} was already awarded",
                round,
                session_id
            ),
            Err(e) => {
                self.restore_flag(session_id, round, &claimed, previous).await;
                return Err(e.into());
            }
        }

        tracing::info!(
            "Round {} of session {} tallied, winners: {:?}",
            round,
            session_id,
            tally.winner_names
        );
        self.broadcast(
            &RoomId::session(session_id),
            ServerMessage::Results {
                round_winners: tally.winner_names,
                round_results: tally.results,
            },
        )
        .await;
        Ok((true, RoundState::Results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::*;

    async fn voting_round(
        names: &[&str],
    ) -> (AppState, crate::store::MemoryStore, SessionRecord, Vec<UserRecord>, Vec<TestConn>) {
        let (state, store) = test_state();
        let (session, users) = seeded_session(&state, &store, names, 3).await;
        let conns = running_game(&state, &session, &users).await;
        open_voting(&state, &session, &users).await;
        (state, store, session, users, conns)
    }

    /// Everyone submits a real artifact
    async fn open_voting(state: &AppState, session: &SessionRecord, users: &[UserRecord]) {
        for (i, user) in users.iter().enumerate() {
            state
                .record_submission(
                    session.id,
                    1,
                    user,
                    Some(format!("https://gifs.example/{}.gif", i)),
                )
                .await
                .unwrap();
        }
        assert_eq!(
            state.round_flag(session.id, 1).await.unwrap().state,
            RoundState::Voting
        );
    }

    #[tokio::test]
    async fn test_last_vote_tallies_and_awards_winner() {
        let (state, store, session, users, mut conns) = voting_round(&["ana", "bo", "cy"]).await;
        conns[1].drain();

        state.record_vote(session.id, 1, &users[0], "cy").await.unwrap();
        state.record_vote(session.id, 1, &users[1], "cy").await.unwrap();
        let last = state.record_vote(session.id, 1, &users[2], "ana").await.unwrap();
        assert_eq!(
            last,
            VoteOutcome::Recorded {
                all_voted: true,
                round_state: RoundState::Results
            }
        );

        let players = store.players(session.id).await.unwrap();
        let cy = players.iter().find(|p| p.username == "cy").unwrap();
        let ana = players.iter().find(|p| p.username == "ana").unwrap();
        assert_eq!(cy.score, 1);
        assert_eq!(ana.score, 0);

        let winners = conns[1]
            .drain()
            .into_iter()
            .find_map(|m| match m {
                ServerMessage::Results { round_winners, .. } => Some(round_winners),
                _ => None,
            })
            .unwrap();
        assert_eq!(winners, vec!["cy"]);
    }

    #[tokio::test]
    async fn test_tied_vote_awards_everyone_on_top() {
        let (state, store, session, users, _conns) = voting_round(&["ana", "bo", "cy"]).await;

        state.record_vote(session.id, 1, &users[0], "bo").await.unwrap();
        state.record_vote(session.id, 1, &users[1], "cy").await.unwrap();
        state.record_vote(session.id, 1, &users[2], "ana").await.unwrap();

        let players = store.players(session.id).await.unwrap();
        assert!(players.iter().all(|p| p.score == 1));
    }

    #[tokio::test]
    async fn test_second_vote_is_ignored() {
        let (state, store, session, users, _conns) = voting_round(&["ana", "bo", "cy"]).await;

        state.record_vote(session.id, 1, &users[0], "bo").await.unwrap();
        let again = state.record_vote(session.id, 1, &users[0], "cy").await.unwrap();
        assert_eq!(again, VoteOutcome::AlreadyVoted);

        let votes = store.votes(session.id, 1).await.unwrap();
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].target_id, users[1].id);
    }

    #[tokio::test]
    async fn test_vote_for_non_member_is_not_found() {
        let (state, _store, session, users, _conns) = voting_round(&["ana", "bo", "cy"]).await;
        let result = state.record_vote(session.id, 1, &users[0], "zed").await;
        assert!(matches!(result, Err(GameError::UserNotFound)));
    }

    #[tokio::test]
    async fn test_vote_outside_voting_is_rejected() {
        let (state, store) = test_state();
        let (session, users) = seeded_session(&state, &store, &["ana", "bo", "cy"], 3).await;
        let _conns = running_game(&state, &session, &users).await;

        let result = state.record_vote(session.id, 1, &users[0], "bo").await;
        assert!(matches!(result, Err(GameError::Precondition(_))));
        assert!(store.votes(session.id, 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_finishes_tally_whose_award_failed() {
        let (state, store, scripted) = scripted_state();
        let (session, users) = seeded_session(&state, &store, &["ana", "bo", "cy"], 3).await;
        let mut conns = running_game(&state, &session, &users).await;
        open_voting(&state, &session, &users).await;
        state.record_vote(session.id, 1, &users[0], "bo").await.unwrap();
        state.record_vote(session.id, 1, &users[1], "cy").await.unwrap();
        conns[0].drain();

        scripted.fail("award_round", 0);
        let failed = state.record_vote(session.id, 1, &users[2], "bo").await;
        assert!(matches!(failed, Err(GameError::Store(_))));
        assert_eq!(
            state.round_flag(session.id, 1).await.unwrap().state,
            RoundState::Voting
        );

        let retry = state.record_vote(session.id, 1, &users[2], "bo").await.unwrap();
        assert_eq!(retry, VoteOutcome::AlreadyVoted);
        assert_eq!(
            state.round_flag(session.id, 1).await.unwrap().state,
            RoundState::Results
        );
        let again = state.record_vote(session.id, 1, &users[2], "bo").await.unwrap();
        assert_eq!(again, VoteOutcome::AlreadyVoted);

        let players = store.players(session.id).await.unwrap();
        let bo = players.iter().find(|p| p.username == "bo").unwrap();
        assert_eq!(bo.score, 1);
        assert_eq!(players.iter().map(|p| p.score).sum::<u32>(), 1);
        assert_eq!(
            count_of(&conns[0].drain(), |m| matches!(m, ServerMessage::Results { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_concurrent_last_votes_tally_once() {
        let (state, store, scripted) = scripted_state();
        let (session, users) = seeded_session(&state, &store, &["ana", "bo", "cy"], 3).await;
        let mut conns = running_game(&state, &session, &users).await;
        open_voting(&state, &session, &users).await;
        state.record_vote(session.id, 1, &users[0], "cy").await.unwrap();
        conns[0].drain();

        // bo's vote is stored; its count of the votes waits
        scripted.hold("votes", 1);
        let bo_voting = {
            let state = state.clone();
            let session_id = session.id;
            let bo = users[1].clone();
            tokio::spawn(async move { state.record_vote(session_id, 1, &bo, "cy").await })
        };
        scripted.entered.notified().await;

        let cy = state.record_vote(session.id, 1, &users[2], "ana").await.unwrap();
        scripted.release.notify_one();
        let bo = bo_voting.await.unwrap().unwrap();

        let done = VoteOutcome::Recorded {
            all_voted: true,
            round_state: RoundState::Results,
        };
        assert_eq!(cy, done);
        assert_eq!(bo, done);
        let players = store.players(session.id).await.unwrap();
        let winner = players.iter().find(|p| p.username == "cy").unwrap();
        assert_eq!(winner.score, 1);
        assert_eq!(
            count_of(&conns[0].drain(), |m| matches!(m, ServerMessage::Results { .. })),
            1
        );
    }
}
