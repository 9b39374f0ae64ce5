//! In-memory relay hub fanning session snapshots out to subscribed connections.
//!
//! The hub owns two maps: `session id → channel` (subscribers in join order plus
//! the last snapshot seen for the session) and `connection → session id`. All
//! mutation goes through the methods below; a session's channel is discarded as
//! soon as its last subscriber leaves.

use std::time::Duration;

use dashmap::DashMap;
use indexmap::IndexMap;
use serde::Serialize;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{dto::ws::RelayOutboundMessage, state::session::GameState};

/// Identifier assigned to every relay connection.
pub type ConnectionId = Uuid;

struct Subscriber {
    tx: mpsc::UnboundedSender<RelayOutboundMessage>,
    last_seen: Instant,
}

#[derive(Default)]
struct SessionChannel {
    subscribers: IndexMap<ConnectionId, Subscriber>,
    last_state: Option<GameState>,
}

/// Counters exposed by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
pub struct RelayStats {
    /// Sessions with at least one live subscriber.
    pub sessions: usize,
    /// Live subscribers across all sessions.
    pub subscribers: usize,
}

/// Relay hub; construct one per server (or per test).
#[derive(Default)]
pub struct RelayHub {
    sessions: DashMap<String, SessionChannel>,
    memberships: DashMap<ConnectionId, String>,
}

impl RelayHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `connection` to `session_id`, replaying the last known snapshot if any.
    ///
    /// A connection belongs to at most one session; joining another one leaves the previous.
    /// Returns `true` when a snapshot was replayed.
    pub fn join(
        &self,
        connection: ConnectionId,
        session_id: &str,
        tx: mpsc::UnboundedSender<RelayOutboundMessage>,
    ) -> bool {
        let previous = self.memberships.get(&connection).map(|entry| entry.value().clone());
        if let Some(previous) = previous {
            if previous == session_id {
                self.touch(connection);
                return self.replay(connection, session_id);
            }
            self.leave(connection);
        }

        let replayed = {
            let mut channel = self.sessions.entry(session_id.to_string()).or_default();
            let replayed = match &channel.last_state {
                Some(state) => tx
                    .send(RelayOutboundMessage::State {
                        state: state.clone(),
                    })
                    .is_ok(),
                None => false,
            };
            channel.subscribers.insert(
                connection,
                Subscriber {
                    tx,
                    last_seen: Instant::now(),
                },
            );
            replayed
        };
        self.memberships.insert(connection, session_id.to_string());

        info!(%connection, session_id, replayed, "relay subscriber joined");
        replayed
    }

    fn replay(&self, connection: ConnectionId, session_id: &str) -> bool {
        let Some(channel) = self.sessions.get(session_id) else {
            return false;
        };
        match (&channel.last_state, channel.subscribers.get(&connection)) {
            (Some(state), Some(subscriber)) => subscriber
                .tx
                .send(RelayOutboundMessage::State {
                    state: state.clone(),
                })
                .is_ok(),
            _ => false,
        }
    }

    /// Record `state` as the session's last known snapshot and fan it out.
    ///
    /// Every subscriber except `from` receives the snapshot, in the order the hub received
    /// updates for this session. Sessions without subscribers keep no state. Returns the
    /// number of subscribers the snapshot was delivered to.
    pub fn publish(&self, from: Option<ConnectionId>, session_id: &str, state: GameState) -> usize {
        if let Some(connection) = from {
            self.touch(connection);
        }

        let (delivered, dead) = {
            let Some(mut channel) = self.sessions.get_mut(session_id) else {
                debug!(session_id, "dropping update for session without subscribers");
                return 0;
            };

            let message = RelayOutboundMessage::State {
                state: state.clone(),
            };
            let mut delivered = 0;
            let mut dead = Vec::new();
            for (id, subscriber) in channel.subscribers.iter() {
                if Some(*id) == from {
                    continue;
                }
                if subscriber.tx.send(message.clone()).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(*id);
                }
            }

            channel.last_state = Some(state);
            (delivered, dead)
        };

        for connection in dead {
            self.leave(connection);
        }

        delivered
    }

    /// Deregister `connection`, discarding its session's channel if it was the last subscriber.
    ///
    /// Returns the session the connection was subscribed to.
    pub fn leave(&self, connection: ConnectionId) -> Option<String> {
        let (_, session_id) = self.memberships.remove(&connection)?;

        if let Some(mut channel) = self.sessions.get_mut(&session_id) {
            channel.subscribers.shift_remove(&connection);
        }
        let discarded = self
            .sessions
            .remove_if(&session_id, |_, channel| channel.subscribers.is_empty())
            .is_some();

        info!(%connection, session_id = %session_id, discarded, "relay subscriber left");
        Some(session_id)
    }

    /// Refresh the liveness marker of `connection`.
    pub fn touch(&self, connection: ConnectionId) {
        let Some(session_id) = self.memberships.get(&connection).map(|e| e.value().clone()) else {
            return;
        };
        if let Some(mut channel) = self.sessions.get_mut(&session_id) {
            if let Some(subscriber) = channel.subscribers.get_mut(&connection) {
                subscriber.last_seen = Instant::now();
            }
        }
    }

    /// Send a heartbeat ping to every subscriber, dropping the ones whose channel is gone.
    pub fn ping_all(&self) -> usize {
        let mut sent = 0;
        let mut dead = Vec::new();
        for channel in self.sessions.iter() {
            for (id, subscriber) in channel.subscribers.iter() {
                if subscriber.tx.send(RelayOutboundMessage::Ping).is_ok() {
                    sent += 1;
                } else {
                    dead.push(*id);
                }
            }
        }

        for connection in dead {
            self.leave(connection);
        }
        sent
    }

    /// Evict subscribers that have not been heard from within `stale_after`.
    ///
    /// Dropping the hub's sender closes the connection's outbound channel, which the
    /// transport layer treats as a request to close the socket.
    pub fn evict_stale(&self, stale_after: Duration) -> Vec<ConnectionId> {
        let now = Instant::now();
        let stale = self
            .sessions
            .iter()
            .flat_map(|channel| {
                channel
                    .subscribers
                    .iter()
                    .filter(|(_, subscriber)| now.duration_since(subscriber.last_seen) > stale_after)
                    .map(|(id, _)| *id)
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        for connection in &stale {
            info!(%connection, "evicting stale relay subscriber");
            self.leave(*connection);
        }
        stale
    }

    /// Last snapshot relayed for `session_id`.
    pub fn last_state(&self, session_id: &str) -> Option<GameState> {
        self.sessions
            .get(session_id)
            .and_then(|channel| channel.last_state.clone())
    }

    /// Number of live subscribers of `session_id`.
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.sessions
            .get(session_id)
            .map(|channel| channel.subscribers.len())
            .unwrap_or_default()
    }

    /// Session currently joined by `connection`.
    pub fn session_of(&self, connection: ConnectionId) -> Option<String> {
        self.memberships.get(&connection).map(|e| e.value().clone())
    }

    /// Snapshot of the hub's size.
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            sessions: self.sessions.len(),
            subscribers: self.memberships.len(),
        }
    }
}
