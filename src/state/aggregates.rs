//! Pure aggregates computed over the votes of a round.
//!
//! None of these functions mutate their input; the engine calls them on the
//! pre-reset players when it closes a round.

use std::collections::BTreeMap;

use serde::Serialize;
use utoipa::ToSchema;

use crate::state::session::{GameState, Player};

fn vote_values(players: &[Player]) -> Vec<u32> {
    players
        .iter()
        .filter_map(|player| player.vote.map(|vote| vote.value))
        .collect()
}

/// Arithmetic mean of the cast votes rounded half away from zero, 0 when nobody voted.
pub fn final_value(players: &[Player]) -> u32 {
    let values = vote_values(players);
    if values.is_empty() {
        return 0;
    }
    let sum: u32 = values.iter().sum();
    (f64::from(sum) / values.len() as f64).round() as u32
}

/// Modal value of `values`: the first value, in scan order, that reaches the highest count.
pub fn modal_value(values: &[u32]) -> Option<u32> {
    let counts = count_values(values);
    let max = counts.values().copied().max()?;
    values.iter().copied().find(|value| counts[value] == max)
}

/// Percentage of cast votes equal to the modal value; 100 when at most one vote was cast.
///
/// The share is not rounded: three votes `[5, 5, 8]` agree at 66.66...%.
pub fn consensus_rate(players: &[Player]) -> f64 {
    let values = vote_values(players);
    if values.len() <= 1 {
        return 100.0;
    }
    let Some(mode) = modal_value(&values) else {
        return 100.0;
    };
    let agreeing = values.iter().filter(|value| **value == mode).count();
    agreeing as f64 * 100.0 / values.len() as f64
}

fn count_values(values: &[u32]) -> BTreeMap<u32, usize> {
    values.iter().fold(BTreeMap::new(), |mut acc, value| {
        *acc.entry(*value).or_insert(0) += 1;
        acc
    })
}

/// Live statistics shown while a round is being voted on.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VoteStats {
    /// Unrounded mean of the cast votes.
    pub average: f64,
    /// Number of votes per card value, ordered by value.
    pub distribution: BTreeMap<u32, usize>,
    /// Mean confidence of the cast votes.
    pub average_confidence: f64,
    /// See [`consensus_rate`].
    pub consensus_rate: f64,
    /// Whether `consensus_rate` reaches the session's threshold.
    pub has_consensus: bool,
}

impl VoteStats {
    /// Compute the statistics of the round currently held in `game`.
    pub fn of(game: &GameState) -> Self {
        let votes = game
            .players
            .iter()
            .filter_map(|player| player.vote)
            .collect::<Vec<_>>();

        if votes.is_empty() {
            return Self {
                average: 0.0,
                distribution: BTreeMap::new(),
                average_confidence: 0.0,
                consensus_rate: 0.0,
                has_consensus: false,
            };
        }

        let count = votes.len() as f64;
        let values = votes.iter().map(|vote| vote.value).collect::<Vec<_>>();
        let consensus_rate = consensus_rate(&game.players);

        Self {
            average: values.iter().map(|v| f64::from(*v)).sum::<f64>() / count,
            distribution: count_values(&values),
            average_confidence: votes.iter().map(|v| f64::from(v.confidence)).sum::<f64>()
                / count,
            consensus_rate,
            has_consensus: consensus_rate >= f64::from(game.consensus_threshold),
        }
    }
}
