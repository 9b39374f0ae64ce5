//! Validation helpers for session snapshots received from clients.

use validator::{Validate, ValidationError, ValidationErrors};

use crate::state::session::{GameState, MAX_PERCENT, MIN_PLAYERS, Vote, is_on_scale};

fn error(code: &'static str, message: String) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(message.into());
    err
}

/// Validates that a vote uses a card of the scale and a confidence within 0..=100.
pub fn validate_vote(vote: &Vote) -> Result<(), ValidationError> {
    if !is_on_scale(vote.value) {
        return Err(error(
            "vote_value",
            format!("Vote value {} is not on the estimation scale", vote.value),
        ));
    }

    if vote.confidence > MAX_PERCENT {
        return Err(error(
            "vote_confidence",
            format!("Confidence must be within 0..=100 (got {})", vote.confidence),
        ));
    }

    Ok(())
}

/// Validates that a percentage is within 0..=100.
pub fn validate_percent(value: u32) -> Result<(), ValidationError> {
    if value > MAX_PERCENT {
        return Err(error(
            "percent_range",
            format!("Percentage must be within 0..=100 (got {value})"),
        ));
    }
    Ok(())
}

impl Validate for GameState {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.id.trim().is_empty() {
            errors.add("id", error("session_id", "Session id must not be empty".into()));
        }

        if self.max_players < MIN_PLAYERS {
            errors.add(
                "maxPlayers",
                error(
                    "max_players",
                    format!("A session needs at least {MIN_PLAYERS} seats"),
                ),
            );
        }

        if self.players.len() != self.max_players {
            errors.add(
                "players",
                error(
                    "players_length",
                    format!(
                        "Expected {} seats (got {})",
                        self.max_players,
                        self.players.len()
                    ),
                ),
            );
        }

        if self.timer_duration == 0 {
            errors.add(
                "timerDuration",
                error("timer_duration", "Timer duration must be positive".into()),
            );
        }

        if self.time_remaining > self.timer_duration {
            errors.add(
                "timeRemaining",
                error(
                    "time_remaining",
                    format!(
                        "Remaining time {} exceeds the timer duration {}",
                        self.time_remaining, self.timer_duration
                    ),
                ),
            );
        }

        if let Err(e) = validate_percent(self.consensus_threshold) {
            errors.add("consensusThreshold", e);
        }

        if self.current_round == 0 {
            errors.add(
                "currentRound",
                error("current_round", "Rounds start at 1".into()),
            );
        } else if self.story_point_history.len() as u64 != u64::from(self.current_round) - 1 {
            errors.add(
                "storyPointHistory",
                error(
                    "history_length",
                    format!(
                        "Round {} requires {} history entries (got {})",
                        self.current_round,
                        self.current_round - 1,
                        self.story_point_history.len()
                    ),
                ),
            );
        }

        for vote in self.players.iter().filter_map(|player| player.vote.as_ref()) {
            if let Err(e) = validate_vote(vote) {
                errors.add("players", e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
