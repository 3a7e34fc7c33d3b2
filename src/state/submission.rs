use super::AppState;
use crate::error::{GameError, GameResult};
use crate::protocol::{PublicSubmission, ServerMessage, VoteCount};
use crate::types::*;
use serde::Serialize;

/// Result of a submission attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    Recorded {
        all_submitted: bool,
        round_state: RoundState,
    },
    /// The user already submitted this round; nothing changed
    AlreadySubmitted,
}

/// Round states from which the last submission may close the round
const OPEN: [RoundState; 3] = [RoundState::Idle, RoundState::Started, RoundState::NewRound];

impl AppState {
    /// Record a player's artifact for a round (`None` is an explicit pass).
    /// Once every member has acted, the round moves on to voting, or straight
    /// to results when fewer than two real artifacts came in.
    pub async fn record_submission(
        &self,
        session_id: SessionId,
        round: RoundNo,
        user: &UserRecord,
        artifact: Option<String>,
    ) -> GameResult<SubmissionOutcome> {
        let session = self.session_or_404(session_id).await?;
        if !session.active {
            return Err(GameError::SessionInactive);
        }
        let players = self.store.players(session_id).await?;
        if !players.iter().any(|p| p.user_id == user.id) {
            return Err(GameError::NotInSession);
        }
        self.store
            .round(session_id, round)
            .await?
            .ok_or(GameError::RoundNotFound)?;

        let flag = self.round_flag(session_id, round).await?;
        if flag.state.submissions_closed() {
            return Err(GameError::precondition(format!(
                "Submissions are closed for this round ({})",
                flag.state
            )));
        }

        let artifact = artifact
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty());
        let inserted = self
            .store
            .insert_submission(SubmissionRecord {
                session_id,
                round,
                user_id: user.id,
                username: user.username.clone(),
                artifact,
            })
            .await?;
        if !inserted {
            tracing::debug!(
                "{} already submitted for round {} of session {}",
                user.username,
                round,
                session_id
            );
            // Finishes a round whose resolution failed after this insert
            let submissions = self.member_submissions(session_id, round, &players).await?;
            if submissions.len() >= players.len() {
                self.close_submissions(session_id, round, &players, &submissions)
                    .await?;
            }
            return Ok(SubmissionOutcome::AlreadySubmitted);
        }

        // A pause that cleared the round while this insert was in flight
        // leaves the submission behind in a window that no longer exists
        let after = self.round_flag(session_id, round).await?;
        let window_reset = after.state == RoundState::Paused
            || (flag.end_at.is_some() && after.end_at != flag.end_at);
        if window_reset {
            tracing::info!(
                "Round {} of session {} was paused under {}'s submission, dropping it",
                round,
                session_id,
                user.username
            );
            self.store
                .remove_submission(session_id, round, user.id)
                .await?;
            return Err(GameError::precondition(
                "The round was paused, submit again once it resumes",
            ));
        }

        let submissions = self.member_submissions(session_id, round, &players).await?;
        let public: Vec<PublicSubmission> = submissions
            .iter()
            .filter_map(|s| {
                s.artifact.as_ref().map(|gif_url| PublicSubmission {
                    username: s.username.clone(),
                    gif_url: gif_url.clone(),
                })
            })
            .collect();
        tracing::info!(
            "{} submitted for round {} of session {} ({}/{})",
            user.username,
            round,
            session_id,
            submissions.len(),
            players.len()
        );
        self.broadcast(
            &RoomId::session(session_id),
            ServerMessage::GifSubmissions {
                submissions: public,
            },
        )
        .await;

        let all_submitted = submissions.len() >= players.len();
        let round_state = if all_submitted {
            self.close_submissions(session_id, round, &players, &submissions)
                .await?
        } else {
            after.state
        };

        Ok(SubmissionOutcome::Recorded {
            all_submitted,
            round_state,
        })
    }

    async fn member_submissions(
        &self,
        session_id: SessionId,
        round: RoundNo,
        players: &[PlayerRecord],
    ) -> GameResult<Vec<SubmissionRecord>> {
        Ok(self
            .store
            .submissions(session_id, round)
            .await?
            .into_iter()
            .filter(|s| players.iter().any(|p| p.user_id == s.user_id))
            .collect())
    }

    /// Everyone has acted: open voting, or resolve the round right away
    async fn close_submissions(
        &self,
        session_id: SessionId,
        round: RoundNo,
        players: &[PlayerRecord],
        submissions: &[SubmissionRecord],
    ) -> GameResult<RoundState> {
        let real: Vec<&SubmissionRecord> =
            submissions.iter().filter(|s| s.artifact.is_some()).collect();

        if real.len() >= 2 {
            let claim = self
                .claim_transition(session_id, round, &OPEN, |current| RoundFlag {
                    state: RoundState::Voting,
                    ..current.clone()
                })
                .await?;
            if claim.is_some() {
                self.broadcast(
                    &RoomId::session(session_id),
                    ServerMessage::StartVoting { round },
                )
                .await;
            }
            return Ok(self.round_flag(session_id, round).await?.state);
        }

        let Some((previous, claimed)) = self
            .claim_transition(session_id, round, &OPEN, |current| RoundFlag {
                state: RoundState::Results,
                ..current.clone()
            })
            .await?
        else {
            return Ok(self.round_flag(session_id, round).await?.state);
        };

        let resolved = match real.first() {
            Some(sole) => self.award_sole_submitter(session_id, round, players, sole).await,
            None => self.award_everyone(session_id, round, players).await,
        };
        let (round_winners, round_results) = match resolved {
            Ok(outcome) => outcome,
            Err(e) => {
                self.restore_flag(session_id, round, &claimed, previous).await;
                return Err(e);
            }
        };

        tracing::info!(
            "Round {} of session {} resolved without a vote, winners: {:?}",
            round,
            session_id,
            round_winners
        );
        self.broadcast(
            &RoomId::session(session_id),
            ServerMessage::Results {
                round_winners,
                round_results,
            },
        )
        .await;
        Ok(RoundState::Results)
    }

    /// Votes first, points last; both are safe to repeat
    async fn resolve_with_votes(
        &self,
        session_id: SessionId,
        round: RoundNo,
        votes: impl Iterator<Item = VoteRecord>,
        winner_ids: &[UserId],
    ) -> GameResult<()> {
        for vote in votes {
            self.store.insert_vote(vote).await?;
        }
        if !self.store.award_round(session_id, round, winner_ids).await? {
            tracing::debug!(
                "Round {} of session {} was already awarded",
                round,
                session_id
            );
        }
        Ok(())
    }

    /// Exactly one real artifact: every missing vote goes to its author, who
    /// scores the point
    async fn award_sole_submitter(
        &self,
        session_id: SessionId,
        round: RoundNo,
        players: &[PlayerRecord],
        sole: &SubmissionRecord,
    ) -> GameResult<(Vec<String>, Vec<VoteCount>)> {
        let votes = players.iter().map(|player| VoteRecord {
            session_id,
            round,
            voter_id: player.user_id,
            target_id: sole.user_id,
        });
        self.resolve_with_votes(session_id, round, votes, &[sole.user_id])
            .await?;

        Ok((
            vec![sole.username.clone()],
            vec![VoteCount {
                username: sole.username.clone(),
                votes: players.len() as u32,
            }],
        ))
    }

    /// Nobody submitted: everyone votes for themself and everyone scores
    async fn award_everyone(
        &self,
        session_id: SessionId,
        round: RoundNo,
        players: &[PlayerRecord],
    ) -> GameResult<(Vec<String>, Vec<VoteCount>)> {
        let votes = players.iter().map(|player| VoteRecord {
            session_id,
            round,
            voter_id: player.user_id,
            target_id: player.user_id,
        });
        let everyone: Vec<UserId> = players.iter().map(|p| p.user_id).collect();
        self.resolve_with_votes(session_id, round, votes, &everyone)
            .await?;

        Ok((
            players.iter().map(|p| p.username.clone()).collect(),
            players
                .iter()
                .map(|p| VoteCount {
                    username: p.username.clone(),
                    votes: 1,
                })
                .collect(),
        ))
    }
}
