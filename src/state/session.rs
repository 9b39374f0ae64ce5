use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Story-point values a player may vote for.
pub const ESTIMATION_SCALE: [u32; 6] = [1, 2, 3, 5, 8, 13];
/// Highest allowed confidence / threshold / participation percentage.
pub const MAX_PERCENT: u32 = 100;
/// Consensus threshold assigned to every new session.
pub const DEFAULT_CONSENSUS_THRESHOLD: u32 = 70;
/// Smallest number of seats a session can be created with.
pub const MIN_PLAYERS: usize = 2;

/// Whether `value` is one of the cards of [`ESTIMATION_SCALE`].
pub fn is_on_scale(value: u32) -> bool {
    ESTIMATION_SCALE.contains(&value)
}

/// Human readable label for a card of the estimation scale.
pub fn card_label(value: u32) -> Option<&'static str> {
    let label = match value {
        1 => "Very Simple",
        2 => "Simple",
        3 => "Moderate",
        5 => "Complex",
        8 => "Very Complex",
        13 => "Extremely Complex",
        _ => return None,
    };
    Some(label)
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// A single estimate cast by a player. Replaced wholesale on re-vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Vote {
    /// Card value, one of [`ESTIMATION_SCALE`].
    pub value: u32,
    /// Self-assessed confidence, 0 to 100.
    pub confidence: u32,
}

impl Vote {
    /// Build a vote after checking it against the scale and the confidence range.
    pub fn checked(value: u32, confidence: u32) -> Option<Self> {
        (is_on_scale(value) && confidence <= MAX_PERCENT).then_some(Self { value, confidence })
    }
}

/// A seat of the session. Seats are allocated up front and only ever claimed or reassigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    /// Stable identifier of the seat.
    pub id: String,
    /// Display name, empty until the seat is claimed.
    pub name: String,
    /// Avatar chosen when claiming the seat.
    pub avatar_url: String,
    /// Vote cast in the current round, if any.
    pub vote: Option<Vote>,
    /// Share of rounds this player voted in, 0 to 100.
    pub participation_rate: u32,
    /// Votes cast during the current sprint.
    pub votes_this_sprint: u32,
    /// Votes cast since the seat was claimed.
    pub total_votes: u32,
    /// Rounds this player took part in.
    pub total_rounds: u32,
    /// Whether a human has claimed this seat.
    pub has_joined: bool,
}

impl Player {
    /// An unclaimed seat with a fresh identifier.
    pub fn vacant() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: String::new(),
            avatar_url: String::new(),
            vote: None,
            participation_rate: 0,
            votes_this_sprint: 0,
            total_votes: 0,
            total_rounds: 0,
            has_joined: false,
        }
    }

    /// Copy of this seat claimed by `name`, with fresh counters.
    pub fn claimed(&self, name: String, avatar_url: String) -> Self {
        Self {
            id: self.id.clone(),
            name,
            avatar_url,
            vote: None,
            participation_rate: MAX_PERCENT,
            votes_this_sprint: 0,
            total_votes: 0,
            total_rounds: 0,
            has_joined: true,
        }
    }

    /// Copy of this seat holding `vote`, with counters bumped for `current_round`.
    pub fn with_vote(&self, vote: Vote, current_round: u32) -> Self {
        let total_votes = self.total_votes + 1;
        let rate = (f64::from(total_votes) * 100.0 / f64::from(current_round.max(1))).round();
        Self {
            vote: Some(vote),
            votes_this_sprint: self.votes_this_sprint + 1,
            total_votes,
            total_rounds: self.total_rounds + 1,
            participation_rate: (rate as u32).min(MAX_PERCENT),
            ..self.clone()
        }
    }
}

/// Record appended to the history every time a round is closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StoryPoint {
    /// Identifier of the record.
    pub id: String,
    /// Rounded mean of the votes of the closed round.
    pub final_value: u32,
    /// Wall-clock time (ms) at which the round was closed.
    pub timestamp: u64,
    /// Share of votes agreeing with the modal value, 0 to 100, unrounded.
    pub consensus_rate: f64,
    /// Seconds the round ran before being closed.
    pub voting_duration: u32,
}

/// The session aggregate and unit of synchronization between clients, relay and store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    /// Session identifier, also the routing key for the relay and the store.
    pub id: String,
    /// Seats in stable slot order; always `max_players` long.
    pub players: Vec<Player>,
    /// Number of seats allocated at creation.
    pub max_players: usize,
    /// Whether the current round is closed for voting.
    pub is_voting_complete: bool,
    /// Seconds left in the current round.
    pub time_remaining: u32,
    /// Length of a round in seconds.
    pub timer_duration: u32,
    /// Whether the countdown has been started.
    pub is_timer_running: bool,
    /// Whether the running countdown is frozen.
    pub is_paused: bool,
    /// Seat driven by this client.
    pub current_player_index: usize,
    /// Closed rounds, oldest first.
    pub story_point_history: Vec<StoryPoint>,
    /// Sprint counter, informational.
    pub sprint_number: u32,
    /// Consensus percentage a round must reach to count as agreed.
    pub consensus_threshold: u32,
    /// Round counter, starting at 1.
    pub current_round: u32,
    /// Wall-clock time (ms) of the write that produced this snapshot.
    pub last_sync_timestamp: u64,
    /// True once every seat has been claimed.
    pub can_start_game: bool,
}

impl GameState {
    /// Fresh session with `max_players` vacant seats and a stopped timer.
    pub fn new(id: String, max_players: usize, timer_duration: u32) -> Self {
        Self {
            id,
            players: (0..max_players).map(|_| Player::vacant()).collect(),
            max_players,
            is_voting_complete: false,
            time_remaining: timer_duration,
            timer_duration,
            is_timer_running: false,
            is_paused: false,
            current_player_index: 0,
            story_point_history: Vec::new(),
            sprint_number: 1,
            consensus_threshold: DEFAULT_CONSENSUS_THRESHOLD,
            current_round: 1,
            last_sync_timestamp: now_millis(),
            can_start_game: false,
        }
    }

    /// Index of the first seat nobody has claimed yet.
    pub fn first_free_slot(&self) -> Option<usize> {
        self.players.iter().position(|player| !player.has_joined)
    }

    /// Index of the seat identified by `player_id`.
    pub fn slot_of(&self, player_id: &str) -> Option<usize> {
        self.players.iter().position(|player| player.id == player_id)
    }

    /// Seat currently driven by this client.
    pub fn current_player(&self) -> Option<&Player> {
        self.players.get(self.current_player_index)
    }

    /// True when every seat has been claimed.
    pub fn all_seats_claimed(&self) -> bool {
        !self.players.is_empty() && self.players.iter().all(|player| player.has_joined)
    }

    /// True when at least one seat is claimed and every claimed seat holds a vote.
    pub fn all_claimed_voted(&self) -> bool {
        let mut claimed = self.players.iter().filter(|player| player.has_joined).peekable();
        claimed.peek().is_some() && claimed.all(|player| player.vote.is_some())
    }

    /// Whether the countdown should currently be decrementing.
    pub fn is_counting_down(&self) -> bool {
        self.is_timer_running && !self.is_paused
    }

    /// Recompute the derived flags after the seats changed.
    pub(crate) fn refresh_derived(&mut self) {
        self.can_start_game = self.all_seats_claimed();
    }
}
