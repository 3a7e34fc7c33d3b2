use super::AppState;
use crate::error::{GameError, GameResult};
use crate::protocol::VoteCount;
use crate::types::*;
use std::collections::HashMap;

/// Vote counts of a round and the users with the most votes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundTally {
    /// Sorted by votes, highest first
    pub results: Vec<VoteCount>,
    pub winner_ids: Vec<UserId>,
    pub winner_names: Vec<String>,
}

/// Count votes per target. Votes for users who are no longer members are
/// ignored; every target with the maximum count wins.
pub fn tally_votes(votes: &[VoteRecord], players: &[PlayerRecord]) -> RoundTally {
    let mut counts: HashMap<UserId, u32> = HashMap::new();
    for vote in votes {
        if players.iter().any(|p| p.user_id == vote.target_id) {
            *counts.entry(vote.target_id).or_insert(0) += 1;
        }
    }

    let mut ranked: Vec<(&PlayerRecord, u32)> = players
        .iter()
        .filter_map(|p| counts.get(&p.user_id).map(|n| (p, *n)))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.username.cmp(&b.0.username)));

    let max = ranked.first().map_or(0, |(_, n)| *n);
    let winners: Vec<&PlayerRecord> = ranked
        .iter()
        .filter(|(_, n)| *n == max && max > 0)
        .map(|(p, _)| *p)
        .collect();

    RoundTally {
        results: ranked
            .iter()
            .map(|(p, n)| VoteCount {
                username: p.username.clone(),
                votes: *n,
            })
            .collect(),
        winner_ids: winners.iter().map(|p| p.user_id).collect(),
        winner_names: winners.iter().map(|p| p.username.clone()).collect(),
    }
}

/// Players whose cumulative score reached the target
pub fn game_winners(players: &[PlayerRecord], points_to_win: u32) -> Vec<&PlayerRecord> {
    players
        .iter()
        .filter(|p| p.score >= points_to_win)
        .collect()
}

/// How many more statements must be generated before `current_round` can be
/// played out in the worst case.
///
/// With no statements yet, a full game needs `capacity * (points_to_win - 1) + 1`
/// rounds. Otherwise the worst case is every player tied on the lowest score
/// taking turns winning, which still needs `freq * (points_to_win - lowest - 1) + 1`
/// rounds; only the shortfall against the unused statements is returned.
pub fn required_prompt_count(
    capacity: u32,
    points_to_win: u32,
    available: usize,
    current_round: RoundNo,
    scores: &[u32],
) -> u32 {
    if available == 0 {
        return capacity * points_to_win.saturating_sub(1) + 1;
    }

    let lowest = scores.iter().copied().min().unwrap_or(0);
    let frequency = scores.iter().filter(|s| **s == lowest).count() as i64;

    let left = available as i64 - (i64::from(current_round) - 1);
    let still_required = frequency * (i64::from(points_to_win) - i64::from(lowest) - 1) + 1;

    if left < still_required {
        (still_required - left) as u32
    } else {
        0
    }
}

impl AppState {
    /// Generate and store the statements `current_round` may still need.
    /// Nothing is written when generation fails.
    pub(crate) async fn ensure_prompt_supply(
        &self,
        session: &SessionRecord,
        current_round: RoundNo,
        players: &[PlayerRecord],
    ) -> GameResult<()> {
        let available = self.store.prompt_count(session.id).await?;
        let scores: Vec<u32> = players.iter().map(|p| p.score).collect();
        let required = required_prompt_count(
            session.players,
            session.points_to_win,
            available,
            current_round,
            &scores,
        );
        if required == 0 {
            tracing::debug!(
                "Session {} has enough statements ({} stored) for round {}",
                session.id,
                available,
                current_round
            );
            return Ok(());
        }

        let generator = self
            .prompts
            .as_ref()
            .ok_or(GameError::PromptGenerationUnavailable)?;
        let statements = generator
            .generate_prompts(required, &session.category)
            .await?;
        tracing::info!(
            "Generated {} statements about {:?} for session {}",
            statements.len(),
            session.category,
            session.id
        );
        self.store.insert_prompts(session.id, statements).await?;
        Ok(())
    }
}
