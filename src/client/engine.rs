//! The session engine: sole producer of new [`GameState`] snapshots on a client.
//!
//! Every operation reads the held snapshot, derives a new one, stamps it and commits it:
//! local state is replaced first, then the snapshot is forwarded to the relay link and
//! persisted in the background. Neither of the latter can roll the local change back.
//!
//! Lock order is `game` before any of the slot mutexes; the slot mutexes are never held
//! across an await point.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use thiserror::Error;
use tokio::{
    sync::{RwLock, mpsc, oneshot, watch},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    client::{
        EngineConfig,
        countdown::{CountdownDriver, TickOutcome},
        persistence::{PersistenceError, SessionPersistence},
        relay_link::{RelayConnector, RelayLink},
    },
    state::{
        aggregates::{VoteStats, consensus_rate, final_value},
        phase::{SessionEvent, SessionPhase},
        session::{GameState, MAX_PERCENT, MIN_PLAYERS, Player, StoryPoint, Vote, now_millis},
    },
};

/// Caller mistakes rejected by the engine. Everything else is a silent no-op.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Card value off the estimation scale, or confidence above 100.
    #[error("invalid vote: value {value} with confidence {confidence}")]
    InvalidVote {
        /// Card value submitted.
        value: u32,
        /// Confidence submitted.
        confidence: u32,
    },
    /// Consensus threshold above 100.
    #[error("consensus threshold {0} is above 100")]
    InvalidThreshold(u32),
    /// Session created with too few seats or a zero timer.
    #[error("a session needs at least 2 seats and a positive timer (got {max_players} seats, {timer_duration} s)")]
    InvalidSettings {
        /// Seats requested.
        max_players: usize,
        /// Round length requested, in seconds.
        timer_duration: u32,
    },
}

/// Result of [`SessionEngine::load_session`].
#[derive(Debug)]
pub enum LoadOutcome {
    /// The session is now held locally.
    Loaded(GameState),
    /// The store has no such session; nothing is held locally.
    NotFound,
    /// The store could not answer. A local copy of the same session, if any, is kept.
    Unavailable(PersistenceError),
}

struct ActiveCountdown {
    session_id: String,
    driver: CountdownDriver,
}

struct Attachment {
    link: RelayLink,
    inbound: JoinHandle<()>,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.link.close();
        self.inbound.abort();
    }
}

/// Work for the store worker, applied in submission order.
enum StoreCommand {
    Put(GameState),
    Delete {
        id: String,
        reply: oneshot::Sender<bool>,
    },
}

struct EngineInner {
    config: EngineConfig,
    game: RwLock<Option<GameState>>,
    observers: watch::Sender<Option<GameState>>,
    countdown: Mutex<Option<ActiveCountdown>>,
    attachment: Mutex<Option<Attachment>>,
    auto_start: Mutex<Option<JoinHandle<()>>>,
    store_queue: Mutex<Option<mpsc::UnboundedSender<StoreCommand>>>,
    persistence: Option<Arc<dyn SessionPersistence>>,
    connector: Option<Arc<dyn RelayConnector>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to a client's session engine. Clones share the same session.
#[derive(Clone)]
pub struct SessionEngine {
    inner: Arc<EngineInner>,
}

impl SessionEngine {
    /// Build an engine. Without persistence the engine runs purely in memory; without a
    /// connector it never talks to a relay.
    pub fn new(
        config: EngineConfig,
        persistence: Option<Arc<dyn SessionPersistence>>,
        connector: Option<Arc<dyn RelayConnector>>,
    ) -> Self {
        let (observers, _) = watch::channel(None);
        Self {
            inner: Arc::new(EngineInner {
                config,
                game: RwLock::new(None),
                observers,
                countdown: Mutex::new(None),
                attachment: Mutex::new(None),
                auto_start: Mutex::new(None),
                store_queue: Mutex::new(None),
                persistence,
                connector,
            }),
        }
    }

    /// Observe every snapshot the engine holds, `None` when no session is loaded.
    pub fn watch(&self) -> watch::Receiver<Option<GameState>> {
        self.inner.observers.subscribe()
    }

    /// Copy of the held snapshot.
    pub async fn snapshot(&self) -> Option<GameState> {
        self.inner.game.read().await.clone()
    }

    /// Phase of the held session, [`SessionPhase::Idle`] when none is held.
    pub async fn phase(&self) -> SessionPhase {
        SessionPhase::of(self.inner.game.read().await.as_ref())
    }

    /// Statistics over the votes of the current round.
    pub async fn vote_stats(&self) -> Option<VoteStats> {
        self.inner.game.read().await.as_ref().map(VoteStats::of)
    }

    /// Seat driven by this client.
    pub async fn current_player(&self) -> Option<Player> {
        self.inner
            .game
            .read()
            .await
            .as_ref()
            .and_then(|game| game.current_player().cloned())
    }

    /// Whether a countdown loop is scheduled.
    pub fn countdown_active(&self) -> bool {
        lock(&self.inner.countdown)
            .as_ref()
            .is_some_and(|active| active.driver.is_active())
    }

    /// Whether the relay link of the held session is connected.
    pub fn relay_connected(&self) -> bool {
        lock(&self.inner.attachment)
            .as_ref()
            .is_some_and(|attachment| attachment.link.is_connected())
    }

    /// Create a session with `max_players` vacant seats and make it the held one.
    pub async fn create_session(
        &self,
        max_players: usize,
        timer_duration: u32,
    ) -> Result<GameState, EngineError> {
        if max_players < MIN_PLAYERS || timer_duration == 0 {
            return Err(EngineError::InvalidSettings {
                max_players,
                timer_duration,
            });
        }

        let mut game = self.inner.game.write().await;
        self.teardown(&mut game);

        let created = GameState::new(Uuid::new_v4().to_string(), max_players, timer_duration);
        info!(session_id = %created.id, max_players, timer_duration, "session created");
        self.attach(&created.id);
        Ok(self.commit(&mut game, created, true))
    }

    /// Fetch `id` from the durable store and hold it.
    ///
    /// A newer local copy of the same session wins over the stored one.
    pub async fn load_session(&self, id: &str) -> LoadOutcome {
        let fetched = match &self.inner.persistence {
            Some(persistence) => {
                match timeout(self.inner.config.store_timeout, persistence.get(id.to_owned())).await {
                    Ok(result) => result,
                    Err(_) => Err(PersistenceError::Timeout),
                }
            }
            None => Err(PersistenceError::Unavailable("no session store configured".into())),
        };

        let mut game = self.inner.game.write().await;
        let same_session = game.as_ref().is_some_and(|held| held.id == id);

        match fetched {
            Ok(Some(stored)) => {
                if !same_session {
                    self.teardown(&mut game);
                }
                let adopted = match game.take() {
                    Some(held) if held.last_sync_timestamp > stored.last_sync_timestamp => held,
                    Some(held) => GameState {
                        current_player_index: held.current_player_index,
                        ..stored
                    },
                    None => stored,
                };
                self.hold(&mut game, adopted.clone(), false);
                self.attach(id);
                info!(session_id = %id, "session loaded");
                LoadOutcome::Loaded(adopted)
            }
            Ok(None) => {
                info!(session_id = %id, "session not found");
                self.teardown(&mut game);
                LoadOutcome::NotFound
            }
            Err(err) => {
                warn!(session_id = %id, error = %err, "failed to load session");
                if !same_session {
                    self.teardown(&mut game);
                }
                // The relay may still replay the latest snapshot.
                self.attach(id);
                LoadOutcome::Unavailable(err)
            }
        }
    }

    /// Claim the first free seat for this client. No-op when every seat is taken.
    pub async fn join_session(&self, name: String, avatar_url: String) -> Option<GameState> {
        let mut game = self.inner.game.write().await;
        let current = game.as_ref()?;
        if !self.permits(current, SessionEvent::Join) {
            return None;
        }
        let Some(slot) = current.first_free_slot() else {
            debug!(session_id = %current.id, "no free seat left");
            return None;
        };

        let was_ready = current.can_start_game;
        let mut next = current.clone();
        next.players[slot] = next.players[slot].claimed(name, avatar_url);
        next.current_player_index = slot;
        next.refresh_derived();

        let committed = self.commit(&mut game, next, true);
        if !was_ready && committed.can_start_game {
            self.schedule_auto_start(&committed.id);
        }
        Some(committed)
    }

    /// Cast or replace the vote of `player_id`.
    ///
    /// Out of range values are rejected; votes for unknown or unclaimed seats are ignored.
    pub async fn submit_vote(
        &self,
        player_id: &str,
        value: u32,
        confidence: u32,
    ) -> Result<Option<GameState>, EngineError> {
        let vote =
            Vote::checked(value, confidence).ok_or(EngineError::InvalidVote { value, confidence })?;

        let mut game = self.inner.game.write().await;
        let Some(current) = game.as_ref() else {
            return Ok(None);
        };
        if !self.permits(current, SessionEvent::Vote) {
            return Ok(None);
        }
        let Some(slot) = current
            .slot_of(player_id)
            .filter(|slot| current.players[*slot].has_joined)
        else {
            debug!(session_id = %current.id, player_id, "vote for an unclaimed seat ignored");
            return Ok(None);
        };

        let mut next = current.clone();
        next.players[slot] = next.players[slot].with_vote(vote, next.current_round);
        if next.all_claimed_voted() {
            next.is_voting_complete = true;
        }
        if next.is_voting_complete {
            next.is_timer_running = false;
            next.is_paused = false;
        }
        Ok(Some(self.commit(&mut game, next, true)))
    }

    /// Start the countdown. Starting a running countdown keeps the existing loop.
    pub async fn start_timer(&self) -> Option<GameState> {
        self.mutate(SessionEvent::StartTimer, |current| {
            if current.is_voting_complete {
                return None;
            }
            Some(GameState {
                is_timer_running: true,
                is_paused: false,
                ..current.clone()
            })
        })
        .await
    }

    /// Unfreeze a paused countdown.
    pub async fn resume_timer(&self) -> Option<GameState> {
        self.mutate(SessionEvent::Resume, |current| {
            Some(GameState {
                is_timer_running: true,
                is_paused: false,
                ..current.clone()
            })
        })
        .await
    }

    /// Freeze the running countdown, keeping the remaining time.
    pub async fn pause_timer(&self) -> Option<GameState> {
        self.mutate(SessionEvent::Pause, |current| {
            Some(GameState {
                is_paused: true,
                ..current.clone()
            })
        })
        .await
    }

    /// Stop the countdown without closing the round.
    pub async fn stop_timer(&self) -> Option<GameState> {
        self.mutate(SessionEvent::StopTimer, |current| {
            current.is_timer_running.then(|| GameState {
                is_timer_running: false,
                is_paused: false,
                ..current.clone()
            })
        })
        .await
    }

    /// Close the round for voting.
    pub async fn complete_voting(&self) -> Option<GameState> {
        self.mutate(SessionEvent::CompleteVoting, |current| Some(completed(current)))
            .await
    }

    /// Record the round in the history and open the next one with a running countdown.
    pub async fn reset_votes(&self) -> Option<GameState> {
        self.mutate(SessionEvent::ResetVotes, |current| {
            let record = StoryPoint {
                id: Uuid::new_v4().to_string(),
                final_value: final_value(&current.players),
                timestamp: now_millis(),
                consensus_rate: consensus_rate(&current.players),
                voting_duration: current.timer_duration.saturating_sub(current.time_remaining),
            };

            let mut next = current.clone();
            next.story_point_history.push(record);
            for player in &mut next.players {
                player.vote = None;
            }
            next.time_remaining = next.timer_duration;
            next.is_voting_complete = false;
            next.current_round += 1;
            next.is_timer_running = true;
            next.is_paused = false;
            Some(next)
        })
        .await
    }

    /// Drive the seat of `player_id` from this client. The seat itself is left untouched.
    pub async fn take_over_player(&self, player_id: &str) -> Option<GameState> {
        self.mutate(SessionEvent::TakeOver, |current| {
            let slot = current.slot_of(player_id)?;
            Some(GameState {
                current_player_index: slot,
                ..current.clone()
            })
        })
        .await
    }

    /// Change the agreement percentage a round needs to count as a consensus.
    pub async fn update_consensus_threshold(
        &self,
        threshold: u32,
    ) -> Result<Option<GameState>, EngineError> {
        if threshold > MAX_PERCENT {
            return Err(EngineError::InvalidThreshold(threshold));
        }
        Ok(self
            .mutate(SessionEvent::UpdateThreshold, |current| {
                Some(GameState {
                    consensus_threshold: threshold,
                    ..current.clone()
                })
            })
            .await)
    }

    /// Adopt a snapshot received from the relay.
    ///
    /// Snapshots for another session, or older than the held one, are discarded. The seat
    /// index stays client-local. Nothing is republished or persisted.
    ///
    /// A snapshot carrying a different remaining time means another client just ticked, so
    /// the local countdown restarts one full period from now to stay in phase with it.
    pub async fn apply_remote(&self, incoming: GameState) -> Option<GameState> {
        let mut game = self.inner.game.write().await;
        let realign = !game
            .as_ref()
            .is_some_and(|held| held.time_remaining == incoming.time_remaining);

        let adopted = match game.as_ref() {
            Some(held) if held.id != incoming.id => {
                debug!(session_id = %incoming.id, held = %held.id, "ignoring snapshot for another session");
                return None;
            }
            Some(held) if incoming.last_sync_timestamp < held.last_sync_timestamp => {
                debug!(
                    session_id = %incoming.id,
                    incoming = incoming.last_sync_timestamp,
                    held = held.last_sync_timestamp,
                    "discarding stale snapshot"
                );
                return None;
            }
            Some(held) => GameState {
                current_player_index: held.current_player_index,
                ..incoming
            },
            None => {
                let attached = lock(&self.inner.attachment)
                    .as_ref()
                    .is_some_and(|attachment| attachment.link.session_id() == incoming.id);
                if !attached {
                    return None;
                }
                incoming
            }
        };

        self.hold(&mut game, adopted.clone(), realign);
        Some(adopted)
    }

    /// Stop the countdown, detach from the relay and forget the held session.
    pub async fn leave_session(&self) -> Option<GameState> {
        let mut game = self.inner.game.write().await;
        let left = game.clone();
        self.teardown(&mut game);
        if let Some(left) = &left {
            info!(session_id = %left.id, "left session");
        }
        left
    }

    /// Remove the held session from the durable store and leave it.
    ///
    /// Returns whether the store confirmed the removal; store failures are only logged.
    pub async fn delete_session(&self) -> bool {
        let Some(left) = self.leave_session().await else {
            return false;
        };

        // Queued behind pending writes so a late put cannot resurrect the session.
        let (reply, deleted) = oneshot::channel();
        if !self.enqueue(StoreCommand::Delete { id: left.id, reply }) {
            return false;
        }
        deleted.await.unwrap_or(false)
    }

    async fn mutate<F>(&self, event: SessionEvent, apply: F) -> Option<GameState>
    where
        F: FnOnce(&GameState) -> Option<GameState>,
    {
        let mut game = self.inner.game.write().await;
        let current = game.as_ref()?;
        if !self.permits(current, event) {
            return None;
        }
        let next = apply(current)?;
        Some(self.commit(&mut game, next, true))
    }

    fn permits(&self, current: &GameState, event: SessionEvent) -> bool {
        match SessionPhase::of(Some(current)).check(event) {
            Ok(()) => true,
            Err(err) => {
                debug!(session_id = %current.id, error = %err, "operation ignored");
                false
            }
        }
    }

    /// One countdown step, run by the driver of `session_id`.
    async fn tick(&self, session_id: &str, token: &CancellationToken) -> TickOutcome {
        let mut game = self.inner.game.write().await;
        if token.is_cancelled() {
            return TickOutcome::Stop;
        }
        let Some(current) = game.as_ref().filter(|held| held.id == session_id) else {
            return TickOutcome::Stop;
        };
        if SessionPhase::of(Some(current)).check(SessionEvent::Tick).is_err() {
            return TickOutcome::Stop;
        }

        // The tick reaching zero closes the round in the same snapshot.
        if current.time_remaining <= 1 {
            let mut next = completed(current);
            next.time_remaining = 0;
            info!(session_id, "countdown elapsed, closing the round");
            self.commit(&mut game, next, true);
            return TickOutcome::Stop;
        }

        let next = GameState {
            time_remaining: current.time_remaining - 1,
            ..current.clone()
        };
        self.commit(&mut game, next, false);
        TickOutcome::Continue
    }

    async fn auto_start(&self, session_id: &str) {
        {
            let game = self.inner.game.read().await;
            let Some(current) = game.as_ref().filter(|held| held.id == session_id) else {
                return;
            };
            if current.is_timer_running || current.is_paused || current.is_voting_complete {
                return;
            }
        }
        debug!(session_id, "every seat claimed, starting the countdown");
        self.start_timer().await;
    }

    fn schedule_auto_start(&self, session_id: &str) {
        let weak = Arc::downgrade(&self.inner);
        let delay = self.inner.config.auto_start_delay;
        let session_id = session_id.to_owned();
        let task = tokio::spawn(async move {
            sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                SessionEngine { inner }.auto_start(&session_id).await;
            }
        });
        if let Some(previous) = lock(&self.inner.auto_start).replace(task) {
            previous.abort();
        }
    }

    /// Stamp and install `next`, then fan it out.
    fn commit(&self, game: &mut Option<GameState>, mut next: GameState, persist: bool) -> GameState {
        let previous = game.as_ref().map_or(0, |held| held.last_sync_timestamp);
        next.last_sync_timestamp = now_millis().max(previous);
        self.hold(game, next.clone(), false);

        match lock(&self.inner.attachment).as_ref() {
            Some(attachment) if attachment.link.publish(next.clone()) => {}
            _ => debug!(session_id = %next.id, "relay detached, update kept local"),
        }
        if persist {
            self.persist(next.clone());
        }
        next
    }

    /// Install `next` locally and align the countdown with it.
    fn hold(&self, game: &mut Option<GameState>, next: GameState, realign: bool) {
        self.sync_countdown(&next, realign);
        self.inner.observers.send_replace(Some(next.clone()));
        *game = Some(next);
    }

    fn persist(&self, state: GameState) {
        self.enqueue(StoreCommand::Put(state));
    }

    /// Hand `command` to the store worker, starting it on first use.
    ///
    /// Returns false when the engine has no persistence.
    fn enqueue(&self, command: StoreCommand) -> bool {
        let Some(persistence) = self.inner.persistence.clone() else {
            return false;
        };
        let mut queue = lock(&self.inner.store_queue);
        let sender = queue.get_or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_store_worker(persistence, self.inner.config.clone(), rx));
            tx
        });
        sender.send(command).is_ok()
    }

    /// Start, keep or stop the local countdown to match `game`.
    ///
    /// `realign` replaces a running driver with one anchored on the current instant.
    fn sync_countdown(&self, game: &GameState, realign: bool) {
        let mut countdown = lock(&self.inner.countdown);

        if !game.is_counting_down() {
            if let Some(active) = countdown.take() {
                active.driver.stop();
            }
            return;
        }

        let keep = !realign
            && countdown
                .as_ref()
                .is_some_and(|active| active.session_id == game.id && active.driver.is_active());
        if keep {
            return;
        }
        if let Some(stale) = countdown.take() {
            stale.driver.stop();
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let weak = Arc::downgrade(&self.inner);
        let session_id = game.id.clone();
        let tick_session = session_id.clone();
        let driver = CountdownDriver::spawn(self.inner.config.tick_period, cancel, move || {
            let weak: Weak<EngineInner> = weak.clone();
            let session_id = tick_session.clone();
            let token = token.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => SessionEngine { inner }.tick(&session_id, &token).await,
                    None => TickOutcome::Stop,
                }
            }
        });
        *countdown = Some(ActiveCountdown { session_id, driver });
    }

    /// Attach the relay link for `session_id`, replacing any other attachment.
    fn attach(&self, session_id: &str) {
        let Some(connector) = self.inner.connector.clone() else {
            return;
        };
        let mut attachment = lock(&self.inner.attachment);
        if attachment
            .as_ref()
            .is_some_and(|current| current.link.session_id() == session_id && current.link.is_running())
        {
            return;
        }

        let (remote_tx, mut remote_rx) = mpsc::unbounded_channel();
        let link = RelayLink::spawn(connector, session_id.to_owned(), &self.inner.config, remote_tx);
        let weak = Arc::downgrade(&self.inner);
        let inbound = tokio::spawn(async move {
            while let Some(state) = remote_rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                SessionEngine { inner }.apply_remote(state).await;
            }
        });
        *attachment = Some(Attachment { link, inbound });
    }

    /// Cancel everything tied to the held session and clear it.
    fn teardown(&self, game: &mut Option<GameState>) {
        if let Some(active) = lock(&self.inner.countdown).take() {
            active.driver.stop();
        }
        if let Some(task) = lock(&self.inner.auto_start).take() {
            task.abort();
        }
        lock(&self.inner.attachment).take();
        if game.take().is_some() {
            self.inner.observers.send_replace(None);
        }
    }
}

/// Apply store commands one at a time so writes land in commit order.
///
/// Consecutive puts of the same session collapse into the newest one. The loop ends once
/// the engine is dropped.
async fn run_store_worker(
    persistence: Arc<dyn SessionPersistence>,
    config: EngineConfig,
    mut commands: mpsc::UnboundedReceiver<StoreCommand>,
) {
    let mut carried = None;
    loop {
        let command = match carried.take() {
            Some(command) => command,
            None => match commands.recv().await {
                Some(command) => command,
                None => break,
            },
        };

        match command {
            StoreCommand::Put(mut state) => {
                while let Ok(queued) = commands.try_recv() {
                    match queued {
                        StoreCommand::Put(newer) if newer.id == state.id => state = newer,
                        other => {
                            carried = Some(other);
                            break;
                        }
                    }
                }

                let session_id = state.id.clone();
                match timeout(config.store_timeout, persistence.put(state, config.session_ttl)).await {
                    Ok(Ok(())) => debug!(session_id = %session_id, "session persisted"),
                    Ok(Err(err)) => warn!(session_id = %session_id, error = %err, "failed to persist session"),
                    Err(_) => warn!(
                        session_id = %session_id,
                        error = %PersistenceError::Timeout,
                        "failed to persist session"
                    ),
                }
            }
            StoreCommand::Delete { id, reply } => {
                let deleted = match timeout(config.store_timeout, persistence.delete(id.clone())).await {
                    Ok(Ok(deleted)) => deleted,
                    Ok(Err(err)) => {
                        warn!(session_id = %id, error = %err, "failed to delete session");
                        false
                    }
                    Err(_) => {
                        warn!(session_id = %id, error = %PersistenceError::Timeout, "failed to delete session");
                        false
                    }
                };
                let _ = reply.send(deleted);
            }
        }
    }
}

fn completed(current: &GameState) -> GameState {
    GameState {
        is_voting_complete: true,
        is_timer_running: false,
        is_paused: false,
        ..current.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::{self, BoxFuture};

    use super::*;
    use crate::{
        client::{
            persistence::{PersistenceResult, StorePersistence},
            relay_link::LocalRelayConnector,
        },
        dao::game_store::{SessionStore, memory::MemorySessionStore},
        state::{RelayHub, phase::TimerPhase},
    };

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    async fn tick_seconds(seconds: u64) {
        for _ in 0..seconds {
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
        }
    }

    fn local_engine() -> SessionEngine {
        SessionEngine::new(EngineConfig::default(), None, None)
    }

    fn shared_engine(store: &MemorySessionStore, hub: &Arc<RelayHub>) -> SessionEngine {
        SessionEngine::new(
            EngineConfig::default(),
            Some(Arc::new(StorePersistence::new(Arc::new(store.clone())))),
            Some(Arc::new(LocalRelayConnector::new(hub.clone()))),
        )
    }

    struct DownPersistence;

    impl SessionPersistence for DownPersistence {
        fn get(&self, _id: String) -> BoxFuture<'static, PersistenceResult<Option<GameState>>> {
            Box::pin(async { Err(PersistenceError::Unavailable("connection refused".into())) })
        }

        fn put(&self, _state: GameState, _ttl: Duration) -> BoxFuture<'static, PersistenceResult<()>> {
            Box::pin(async { Err(PersistenceError::Unavailable("connection refused".into())) })
        }

        fn delete(&self, _id: String) -> BoxFuture<'static, PersistenceResult<bool>> {
            Box::pin(async { Err(PersistenceError::Unavailable("connection refused".into())) })
        }
    }

    struct StalledPersistence;

    impl SessionPersistence for StalledPersistence {
        fn get(&self, _id: String) -> BoxFuture<'static, PersistenceResult<Option<GameState>>> {
            Box::pin(future::pending())
        }

        fn put(&self, _state: GameState, _ttl: Duration) -> BoxFuture<'static, PersistenceResult<()>> {
            Box::pin(future::pending())
        }

        fn delete(&self, _id: String) -> BoxFuture<'static, PersistenceResult<bool>> {
            Box::pin(future::pending())
        }
    }

    /// Store whose write of the first joined seat lags behind later writes.
    struct SlowJoinPersistence {
        store: StorePersistence,
    }

    impl SessionPersistence for SlowJoinPersistence {
        fn get(&self, id: String) -> BoxFuture<'static, PersistenceResult<Option<GameState>>> {
            self.store.get(id)
        }

        fn put(&self, state: GameState, ttl: Duration) -> BoxFuture<'static, PersistenceResult<()>> {
            let lagging = state.players[0].has_joined && state.consensus_threshold == 70;
            let write = self.store.put(state, ttl);
            Box::pin(async move {
                if lagging {
                    sleep(Duration::from_millis(200)).await;
                }
                write.await
            })
        }

        fn delete(&self, id: String) -> BoxFuture<'static, PersistenceResult<bool>> {
            self.store.delete(id)
        }
    }

    #[tokio::test]
    async fn operations_without_a_session_are_no_ops() {
        let engine = local_engine();

        assert!(engine.join_session("Ann".into(), "a.png".into()).await.is_none());
        assert_eq!(engine.submit_vote("p", 5, 80).await, Ok(None));
        assert!(engine.start_timer().await.is_none());
        assert!(engine.reset_votes().await.is_none());
        assert!(engine.leave_session().await.is_none());
        assert_eq!(engine.phase().await, SessionPhase::Idle);
    }

    #[tokio::test]
    async fn rejects_invalid_input() {
        let engine = local_engine();
        assert!(matches!(
            engine.create_session(1, 300).await,
            Err(EngineError::InvalidSettings { .. })
        ));
        assert!(matches!(
            engine.create_session(2, 0).await,
            Err(EngineError::InvalidSettings { .. })
        ));

        let game = engine.create_session(2, 300).await.unwrap();
        engine.join_session("Ann".into(), "a.png".into()).await;
        let player = &game.players[0].id;

        assert_eq!(
            engine.submit_vote(player, 4, 80).await,
            Err(EngineError::InvalidVote { value: 4, confidence: 80 })
        );
        assert!(engine.submit_vote(player, 5, 101).await.is_err());
        assert_eq!(
            engine.update_consensus_threshold(101).await,
            Err(EngineError::InvalidThreshold(101))
        );
        assert_eq!(
            engine.update_consensus_threshold(80).await.unwrap().unwrap().consensus_threshold,
            80
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concrete_scenario() {
        let engine = local_engine();

        let game = engine.create_session(2, 300).await.unwrap();
        assert!(!game.id.is_empty());
        assert_eq!(game.players.len(), 2);
        assert!(game.players.iter().all(|p| !p.has_joined));

        let game = engine.join_session("Ann".into(), "ann.png".into()).await.unwrap();
        assert_eq!(game.current_player_index, 0);
        assert!(game.players[0].has_joined);
        assert_eq!(game.players[0].participation_rate, 100);

        let ann = game.players[0].id.clone();
        let game = engine.submit_vote(&ann, 5, 80).await.unwrap().unwrap();
        assert_eq!(game.players[0].vote, Some(Vote { value: 5, confidence: 80 }));
        assert_eq!(game.players[0].total_votes, 1);
        assert!(!game.is_voting_complete);

        let game = engine.join_session("Bob".into(), "bob.png".into()).await.unwrap();
        assert!(game.can_start_game);
        let bob = game.players[1].id.clone();
        let game = engine.submit_vote(&bob, 8, 70).await.unwrap().unwrap();

        assert!(game.is_voting_complete);
        assert_eq!(final_value(&game.players), 7);
        assert_eq!(consensus_rate(&game.players), 50.0);
        assert_eq!(engine.phase().await, SessionPhase::RoundComplete);
    }

    #[tokio::test]
    async fn distinct_sessions_get_distinct_ids() {
        let engine = local_engine();
        let first = engine.create_session(2, 60).await.unwrap();
        let second = engine.create_session(2, 60).await.unwrap();
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn join_is_a_no_op_when_seats_are_full() {
        let engine = local_engine();
        engine.create_session(2, 60).await.unwrap();
        engine.join_session("Ann".into(), "a".into()).await.unwrap();
        engine.join_session("Bob".into(), "b".into()).await.unwrap();

        assert!(engine.join_session("Cid".into(), "c".into()).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn starting_twice_runs_a_single_loop() {
        let engine = local_engine();
        engine.create_session(2, 300).await.unwrap();

        engine.start_timer().await.unwrap();
        engine.start_timer().await.unwrap();
        settle().await;

        tick_seconds(1).await;
        assert_eq!(engine.snapshot().await.unwrap().time_remaining, 299);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_freezes_time() {
        let engine = local_engine();
        engine.create_session(2, 300).await.unwrap();
        engine.start_timer().await.unwrap();
        settle().await;

        engine.pause_timer().await.unwrap();
        assert_eq!(engine.phase().await, SessionPhase::Voting(TimerPhase::Paused));
        tick_seconds(1).await;
        assert_eq!(engine.snapshot().await.unwrap().time_remaining, 300);
        assert!(!engine.countdown_active());

        engine.resume_timer().await.unwrap();
        settle().await;
        tick_seconds(1).await;
        assert_eq!(engine.snapshot().await.unwrap().time_remaining, 299);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_and_resume_need_the_matching_sub_state() {
        let engine = local_engine();
        engine.create_session(2, 300).await.unwrap();

        assert!(engine.pause_timer().await.is_none());
        assert!(engine.resume_timer().await.is_none());
        assert!(engine.stop_timer().await.is_none());

        engine.start_timer().await.unwrap();
        assert!(engine.resume_timer().await.is_none());
        let stopped = engine.stop_timer().await.unwrap();
        assert!(!stopped.is_timer_running);
        assert!(!engine.countdown_active());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_timer_completes_the_round() {
        let engine = local_engine();
        engine.create_session(2, 3).await.unwrap();
        engine.join_session("Ann".into(), "a".into()).await.unwrap();
        engine.start_timer().await.unwrap();
        settle().await;

        tick_seconds(2).await;
        assert_eq!(engine.snapshot().await.unwrap().time_remaining, 1);

        tick_seconds(1).await;
        let game = engine.snapshot().await.unwrap();
        assert_eq!(game.time_remaining, 0);
        assert!(game.is_voting_complete);
        assert!(!game.is_timer_running);
        assert!(game.players[0].vote.is_none());
        assert!(!engine.countdown_active());

        tick_seconds(2).await;
        assert_eq!(engine.snapshot().await.unwrap().time_remaining, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn all_votes_complete_without_the_timer() {
        let engine = local_engine();
        let game = engine.create_session(2, 300).await.unwrap();
        engine.join_session("Ann".into(), "a".into()).await.unwrap();
        engine.join_session("Bob".into(), "b".into()).await.unwrap();
        engine.start_timer().await.unwrap();
        settle().await;

        engine.submit_vote(&game.players[0].id, 3, 50).await.unwrap();
        let done = engine
            .submit_vote(&game.players[1].id, 3, 90)
            .await
            .unwrap()
            .unwrap();

        assert!(done.is_voting_complete);
        assert!(!done.is_timer_running);
        assert!(!engine.countdown_active());
        assert!(engine.start_timer().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_records_the_round() {
        let engine = local_engine();
        let game = engine.create_session(2, 300).await.unwrap();
        engine.join_session("Ann".into(), "a".into()).await.unwrap();
        engine.join_session("Bob".into(), "b".into()).await.unwrap();
        engine.submit_vote(&game.players[0].id, 5, 80).await.unwrap();

        let game = engine.reset_votes().await.unwrap();
        assert_eq!(game.current_round, 2);
        assert_eq!(game.story_point_history.len(), 1);
        assert_eq!(game.story_point_history[0].final_value, 5);
        assert_eq!(game.story_point_history[0].consensus_rate, 100.0);
        assert_eq!(game.time_remaining, 300);
        assert!(game.players[0].vote.is_none());
        assert!(game.is_timer_running);
        assert!(!game.is_voting_complete);
    }

    #[tokio::test]
    async fn take_over_reassigns_the_seat_only() {
        let engine = local_engine();
        engine.create_session(2, 300).await.unwrap();
        engine.join_session("Ann".into(), "a".into()).await.unwrap();
        let game = engine.join_session("Bob".into(), "b".into()).await.unwrap();
        let bob = game.players[1].clone();
        engine.submit_vote(&bob.id, 8, 70).await.unwrap();

        let game = engine.take_over_player(&game.players[0].id).await.unwrap();
        assert_eq!(game.current_player_index, 0);

        let game = engine.take_over_player(&bob.id).await.unwrap();
        assert_eq!(game.current_player_index, 1);
        assert_eq!(game.players[1].name, "Bob");
        assert_eq!(game.players[1].vote, Some(Vote { value: 8, confidence: 70 }));
        assert_eq!(engine.current_player().await.unwrap().id, bob.id);

        assert!(engine.take_over_player("nobody").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn last_join_starts_the_countdown_after_the_settle_delay() {
        let engine = local_engine();
        engine.create_session(2, 300).await.unwrap();
        engine.join_session("Ann".into(), "a".into()).await.unwrap();
        engine.join_session("Bob".into(), "b".into()).await.unwrap();
        settle().await;
        assert_eq!(engine.phase().await, SessionPhase::Voting(TimerPhase::Stopped));

        tick_seconds(1).await;
        assert_eq!(engine.phase().await, SessionPhase::Voting(TimerPhase::Running));
        assert!(engine.countdown_active());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_snapshots_are_discarded() {
        let engine = local_engine();
        let held = engine.create_session(2, 300).await.unwrap();

        let mut older = held.clone();
        older.last_sync_timestamp = held.last_sync_timestamp - 1;
        older.time_remaining = 10;
        assert!(engine.apply_remote(older).await.is_none());
        assert_eq!(engine.snapshot().await.unwrap(), held);

        let mut newer = held.clone();
        newer.last_sync_timestamp = held.last_sync_timestamp + 1;
        newer.consensus_threshold = 90;
        newer.current_player_index = 1;
        let adopted = engine.apply_remote(newer).await.unwrap();
        assert_eq!(adopted.consensus_threshold, 90);
        assert_eq!(adopted.current_player_index, 0);

        let other = GameState::new("elsewhere".into(), 2, 300);
        assert!(engine.apply_remote(other).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn remote_running_snapshot_starts_the_local_countdown() {
        let engine = local_engine();
        let held = engine.create_session(2, 300).await.unwrap();

        let mut running = held.clone();
        running.is_timer_running = true;
        running.last_sync_timestamp += 1;
        engine.apply_remote(running).await.unwrap();
        settle().await;
        assert!(engine.countdown_active());

        tick_seconds(1).await;
        assert_eq!(engine.snapshot().await.unwrap().time_remaining, 299);
    }

    #[tokio::test(start_paused = true)]
    async fn switching_sessions_cancels_the_countdown() {
        let engine = local_engine();
        engine.create_session(2, 300).await.unwrap();
        engine.start_timer().await.unwrap();
        settle().await;
        assert!(engine.countdown_active());

        let next = engine.create_session(2, 120).await.unwrap();
        assert!(!engine.countdown_active());

        tick_seconds(2).await;
        let held = engine.snapshot().await.unwrap();
        assert_eq!(held.id, next.id);
        assert_eq!(held.time_remaining, 120);
    }

    #[tokio::test(start_paused = true)]
    async fn clients_stay_in_sync_through_the_relay() {
        let store = MemorySessionStore::new();
        let hub = Arc::new(RelayHub::new());
        let alice = shared_engine(&store, &hub);
        let bob = shared_engine(&store, &hub);

        let created = alice.create_session(2, 300).await.unwrap();
        settle().await;
        alice.join_session("Ann".into(), "a".into()).await.unwrap();
        settle().await;

        match bob.load_session(&created.id).await {
            LoadOutcome::Loaded(game) => assert!(game.players[0].has_joined),
            other => panic!("unexpected outcome: {other:?}"),
        }
        settle().await;
        assert!(bob.relay_connected());
        assert_eq!(hub.subscriber_count(&created.id), 2);

        let game = bob.join_session("Bob".into(), "b".into()).await.unwrap();
        assert_eq!(game.current_player_index, 1);
        settle().await;

        let seen_by_alice = alice.snapshot().await.unwrap();
        assert!(seen_by_alice.players[1].has_joined);
        assert_eq!(seen_by_alice.current_player_index, 0);

        let ann = seen_by_alice.players[0].id.clone();
        alice.submit_vote(&ann, 5, 60).await.unwrap();
        settle().await;
        assert_eq!(
            bob.snapshot().await.unwrap().players[0].vote,
            Some(Vote { value: 5, confidence: 60 })
        );
        assert_eq!(bob.current_player().await.unwrap().name, "Bob");
    }

    #[tokio::test(start_paused = true)]
    async fn late_joiner_is_replayed_the_relay_state() {
        let store = MemorySessionStore::new();
        let hub = Arc::new(RelayHub::new());
        let alice = shared_engine(&store, &hub);
        let created = alice.create_session(2, 300).await.unwrap();
        settle().await;

        // Bob cannot reach the store but still gets the session from the relay.
        let bob = SessionEngine::new(
            EngineConfig::default(),
            Some(Arc::new(DownPersistence)),
            Some(Arc::new(LocalRelayConnector::new(hub.clone()))),
        );
        assert!(matches!(
            bob.load_session(&created.id).await,
            LoadOutcome::Unavailable(_)
        ));
        settle().await;

        assert_eq!(bob.snapshot().await.unwrap().id, created.id);
    }

    #[tokio::test(start_paused = true)]
    async fn load_distinguishes_missing_from_unavailable() {
        let store = MemorySessionStore::new();
        let hub = Arc::new(RelayHub::new());
        let engine = shared_engine(&store, &hub);
        assert!(matches!(
            engine.load_session("missing").await,
            LoadOutcome::NotFound
        ));
        assert!(engine.snapshot().await.is_none());

        let offline = SessionEngine::new(EngineConfig::default(), Some(Arc::new(DownPersistence)), None);
        let held = offline.create_session(2, 300).await.unwrap();
        offline.join_session("Ann".into(), "a".into()).await.unwrap();
        settle().await;

        assert!(matches!(
            offline.load_session(&held.id).await,
            LoadOutcome::Unavailable(PersistenceError::Unavailable(_))
        ));
        let kept = offline.snapshot().await.unwrap();
        assert_eq!(kept.id, held.id);
        assert!(kept.players[0].has_joined);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_store_times_out() {
        let engine = SessionEngine::new(EngineConfig::default(), Some(Arc::new(StalledPersistence)), None);
        let held = engine.create_session(2, 300).await.unwrap();

        assert!(matches!(
            engine.load_session(&held.id).await,
            LoadOutcome::Unavailable(PersistenceError::Timeout)
        ));
        assert!(engine.snapshot().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn newer_local_copy_wins_over_the_store() {
        let store = MemorySessionStore::new();
        let hub = Arc::new(RelayHub::new());
        let engine = shared_engine(&store, &hub);
        let created = engine.create_session(2, 300).await.unwrap();
        settle().await;

        // Persist an older copy behind the engine's back.
        let mut older = created.clone();
        older.last_sync_timestamp -= 1;
        older.consensus_threshold = 10;
        store.put(older, Duration::from_secs(60)).await.unwrap();

        match engine.load_session(&created.id).await {
            LoadOutcome::Loaded(game) => assert_eq!(game.consensus_threshold, 70),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delete_removes_the_stored_session() {
        let store = MemorySessionStore::new();
        let hub = Arc::new(RelayHub::new());
        let engine = shared_engine(&store, &hub);
        let created = engine.create_session(2, 300).await.unwrap();
        settle().await;
        assert!(store.get(created.id.clone()).await.unwrap().is_some());

        assert!(engine.delete_session().await);
        assert!(engine.snapshot().await.is_none());
        assert!(store.get(created.id).await.unwrap().is_none());
        settle().await;
        assert_eq!(hub.stats().sessions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn watchers_see_every_commit() {
        let engine = local_engine();
        let mut updates = engine.watch();

        let created = engine.create_session(2, 300).await.unwrap();
        assert!(updates.has_changed().unwrap());
        assert_eq!(*updates.borrow_and_update(), Some(created));

        engine.leave_session().await;
        assert!(updates.borrow_and_update().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn shared_countdown_advances_once_per_second() {
        let store = MemorySessionStore::new();
        let hub = Arc::new(RelayHub::new());
        let alice = shared_engine(&store, &hub);
        let bob = shared_engine(&store, &hub);

        let created = alice.create_session(2, 300).await.unwrap();
        alice.start_timer().await.unwrap();
        settle().await;

        // Bob's loop starts half a period out of phase with Alice's.
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(matches!(
            bob.load_session(&created.id).await,
            LoadOutcome::Loaded(_)
        ));
        settle().await;
        assert!(bob.countdown_active());

        for _ in 0..20 {
            tokio::time::advance(Duration::from_millis(500)).await;
            settle().await;
        }

        assert_eq!(alice.snapshot().await.unwrap().time_remaining, 290);
        assert_eq!(bob.snapshot().await.unwrap().time_remaining, 290);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_writes_do_not_overtake_newer_ones() {
        let store = MemorySessionStore::new();
        let engine = SessionEngine::new(
            EngineConfig::default(),
            Some(Arc::new(SlowJoinPersistence {
                store: StorePersistence::new(Arc::new(store.clone())),
            })),
            None,
        );

        let created = engine.create_session(2, 300).await.unwrap();
        settle().await;
        engine.join_session("Ann".into(), "a".into()).await.unwrap();
        settle().await;
        engine.update_consensus_threshold(90).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_millis(300)).await;
        settle().await;

        let stored = store.get(created.id).await.unwrap().unwrap();
        assert_eq!(stored.state.consensus_threshold, 90);
        assert!(stored.state.players[0].has_joined);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_waits_for_pending_writes() {
        let store = MemorySessionStore::new();
        let engine = SessionEngine::new(
            EngineConfig::default(),
            Some(Arc::new(SlowJoinPersistence {
                store: StorePersistence::new(Arc::new(store.clone())),
            })),
            None,
        );

        let created = engine.create_session(2, 300).await.unwrap();
        engine.join_session("Ann".into(), "a".into()).await.unwrap();
        settle().await;

        let deleting = tokio::spawn({
            let engine = engine.clone();
            async move { engine.delete_session().await }
        });
        tokio::time::advance(Duration::from_millis(300)).await;
        settle().await;

        assert!(deleting.await.unwrap());
        assert!(store.get(created.id).await.unwrap().is_none());
    }
}
