use serde::Serialize;
use thiserror::Error;

use crate::state::session::GameState;

/// High-level phases a session can be in, derived from a [`GameState`] snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "phase", content = "timer")]
pub enum SessionPhase {
    /// No session is loaded on this client.
    Idle,
    /// Seats are still free and the countdown has not been started.
    WaitingForPlayers,
    /// The round is open for votes.
    Voting(TimerPhase),
    /// The round is closed; waiting for a reset.
    RoundComplete,
}

/// Sub-state of the countdown while a round is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerPhase {
    /// Everyone joined but nobody started the countdown yet (or it was stopped).
    Stopped,
    /// Counting down.
    Running,
    /// Frozen, `time_remaining` is kept.
    Paused,
}

/// Operations that can be requested on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Claim a free seat.
    Join,
    /// Cast or replace a vote.
    Vote,
    /// Start (or restart) the countdown.
    StartTimer,
    /// Freeze the countdown.
    Pause,
    /// Unfreeze the countdown.
    Resume,
    /// Stop the countdown without closing the round.
    StopTimer,
    /// Close the round.
    CompleteVoting,
    /// Record the round and open the next one.
    ResetVotes,
    /// Drive another seat from this client.
    TakeOver,
    /// Change the consensus threshold.
    UpdateThreshold,
    /// One second of countdown elapsed.
    Tick,
}

/// Error returned when an event does not apply to the current phase.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from:?}")]
pub struct InvalidTransition {
    /// The phase the session was in when the event was requested.
    pub from: SessionPhase,
    /// The rejected event.
    pub event: SessionEvent,
}

impl SessionPhase {
    /// Classify a snapshot; `None` means no session is loaded.
    pub fn of(game: Option<&GameState>) -> Self {
        let Some(game) = game else {
            return Self::Idle;
        };

        if game.is_voting_complete {
            return Self::RoundComplete;
        }

        match (game.is_timer_running, game.is_paused) {
            (true, false) => Self::Voting(TimerPhase::Running),
            (true, true) => Self::Voting(TimerPhase::Paused),
            _ if !game.can_start_game => Self::WaitingForPlayers,
            _ => Self::Voting(TimerPhase::Stopped),
        }
    }

    /// Check whether `event` may be applied from this phase.
    pub fn check(self, event: SessionEvent) -> Result<(), InvalidTransition> {
        let allowed = match (self, event) {
            (Self::Idle, _) => false,
            (Self::Voting(TimerPhase::Running), SessionEvent::Pause | SessionEvent::Tick) => true,
            (_, SessionEvent::Pause | SessionEvent::Tick) => false,
            (Self::Voting(TimerPhase::Paused), SessionEvent::Resume) => true,
            (_, SessionEvent::Resume) => false,
            _ => true,
        };

        if allowed {
            Ok(())
        } else {
            Err(InvalidTransition { from: self, event })
        }
    }
}
